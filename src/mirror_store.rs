// src/mirror_store.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
//! Mirroring decorators for the storage traits.
//!
//! Each decorator wraps one inner implementation of the same trait plus the
//! shared [`MirrorContext`]. Operations that only concern the local side are
//! forwarded; bucket creation, bucket fetch, listing, reads and deletes are
//! mirrored to the remote endpoint. The wrapped delegate is always reachable
//! through the `next_*` accessors.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::{Credentials, MirrorConfig};
use crate::error::{MirrorError, Result};
use crate::http::transport::{Headers, Transport, Verb, header_value};
use crate::http::ReqwestTransport;
use crate::listing::{Listing, parse_listing};
use crate::mirror_request::{MirrorRequest, RemoteTarget};
use crate::mirror_writer::MirrorWriter;
use crate::reconcile::{
    apply_listing_to_bucket, listing_to_results, merge_response_headers, prefixes_to_results,
};
use crate::sal::{
    Attrs, Bucket, BucketInfo, BucketKey, BucketStats, CreateBucketParams, DeleteOp, ListParams,
    ListResults, ObjKey, Object, ReadOp, Store, User, UserId, Writer, WriterParams,
};
use crate::sink::{BufferSink, DataSink, DiscardSink, OffsetSink};

/// State shared by every decorator of one proxy instance.
pub struct MirrorContext {
    config: MirrorConfig,
    transport: Arc<dyn Transport>,
    /// The wrapped local store, used to look up owners' access keys
    store: Arc<dyn Store>,
    mirrored: AtomicU64,
}

impl MirrorContext {
    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    /// Objects written through the proxy, less those deleted through it.
    pub fn mirrored_objects(&self) -> u64 {
        self.mirrored.load(Ordering::Relaxed)
    }

    pub(crate) fn object_mirrored(&self) {
        self.mirrored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn object_unmirrored(&self) {
        let _ = self
            .mirrored
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// First access key of `user`, else the configured pair.
    pub fn user_credentials(&self, user: &dyn User) -> Result<Credentials> {
        if let Some(creds) = user.access_keys().first() {
            return Ok(creds.clone());
        }
        self.config.credentials.clone().ok_or_else(|| {
            MirrorError::InvalidRequest(format!("user {} has no access keys", user.id()))
        })
    }

    /// Credentials of a bucket owner, looked up in the local store.
    pub fn owner_credentials(&self, owner: &UserId) -> Result<Credentials> {
        let user = self.store.get_user(owner);
        self.user_credentials(user.as_ref())
    }

    pub fn new_request(&self) -> MirrorRequest {
        MirrorRequest::new(
            self.transport.clone(),
            self.config.base_url(),
            self.config.region.clone(),
            self.config.sign_requests,
        )
    }

    /// GET and parse one listing page of a remote bucket.
    pub async fn fetch_listing(&self, credentials: &Credentials, target: RemoteTarget) -> Result<Listing> {
        let mut request = self.new_request();
        request.init(Verb::Get, target, credentials, Headers::new(), None)?;
        let mut body = BufferSink::new();
        request.execute(&mut body).await?;
        parse_listing(&body.to_text())
    }

    /// Object count and bytes over every page of a remote bucket, given the
    /// first page.
    pub async fn bucket_totals(
        &self,
        credentials: &Credentials,
        bucket: &BucketKey,
        first: &Listing,
    ) -> Result<BucketStats> {
        let mut stats = BucketStats { count: first.entries.len() as u64, size: first.total_size() };
        let mut marker = first.next_marker.clone().filter(|_| first.is_truncated);
        while let Some(current) = marker {
            let target = RemoteTarget::bucket(bucket.qualified_name()).with_query("marker", current.clone());
            let page = match self.fetch_listing(credentials, target).await {
                Ok(page) => page,
                Err(MirrorError::NoEntries { .. }) => break,
                Err(e) => return Err(e),
            };
            stats.count += page.entries.len() as u64;
            stats.size += page.total_size();
            marker = page.next_marker.filter(|_| page.is_truncated);
            if marker.as_deref() == Some(current.as_str()) {
                return Err(MirrorError::Parse(format!(
                    "listing of {bucket} did not advance past marker {current:?}"
                )));
            }
        }
        debug!("bucket {bucket}: {} objects, {} bytes on remote", stats.count, stats.size);
        Ok(stats)
    }
}

/// Entry point of the proxy: wraps the local store.
pub struct MirrorStore {
    next: Arc<dyn Store>,
    ctx: Arc<MirrorContext>,
}

impl MirrorStore {
    /// Proxy `next`, talking to the configured endpoint over HTTP.
    pub fn new(next: Arc<dyn Store>, config: MirrorConfig) -> Result<Self> {
        config.validate()?;
        let transport = ReqwestTransport::new(config.http.clone())?;
        Ok(Self::with_transport(next, config, Arc::new(transport)))
    }

    pub fn with_transport(next: Arc<dyn Store>, config: MirrorConfig, transport: Arc<dyn Transport>) -> Self {
        info!("mirroring {} store to {}", next.name(), config.base_url());
        let ctx = Arc::new(MirrorContext {
            config,
            transport,
            store: next.clone(),
            mirrored: AtomicU64::new(0),
        });
        Self { next, ctx }
    }

    pub fn context(&self) -> &Arc<MirrorContext> {
        &self.ctx
    }

    fn wrap_bucket(&self, next: Box<dyn Bucket>) -> Box<dyn Bucket> {
        Box::new(MirrorBucket { next, ctx: self.ctx.clone() })
    }
}

/// The delegate-level view of a possibly decorated user.
fn inner_user(user: Option<&dyn User>) -> Option<&dyn User> {
    user.map(|u| u.next_user().unwrap_or(u))
}

#[async_trait]
impl Store for MirrorStore {
    fn name(&self) -> &str {
        "mirror"
    }

    async fn initialize(&self) -> Result<()> {
        self.next.initialize().await
    }

    fn get_user(&self, id: &UserId) -> Box<dyn User> {
        Box::new(MirrorUser { next: self.next.get_user(id), ctx: self.ctx.clone() })
    }

    fn get_object(&self, key: &ObjKey) -> Box<dyn Object> {
        Box::new(MirrorObject {
            next: self.next.get_object(key),
            bucket_attrs: Attrs::new(),
            ctx: self.ctx.clone(),
        })
    }

    /// Fetch (or lazily create) the local bucket, then reconcile it with
    /// the remote listing. No handle is returned unless both sides answered.
    async fn get_bucket(&self, user: Option<&dyn User>, key: &BucketKey) -> Result<Box<dyn Bucket>> {
        let local_user = inner_user(user);
        let (mut bucket, created) = match self.next.get_bucket(local_user, key).await {
            Ok(b) => (b, false),
            Err(e) if e.is_not_found() => match local_user {
                Some(u) => {
                    u.create_bucket(&CreateBucketParams::new(key.clone())).await?;
                    debug!("created local record for bucket {key}");
                    (self.next.get_bucket(local_user, key).await?, true)
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        };

        let listed = async {
            let creds = self.ctx.owner_credentials(bucket.owner())?;
            let listing = self
                .ctx
                .fetch_listing(&creds, RemoteTarget::bucket(key.qualified_name()))
                .await?;
            let totals = self.ctx.bucket_totals(&creds, key, &listing).await?;
            Ok::<_, MirrorError>((listing, totals))
        }
        .await;
        match listed {
            Ok((listing, totals)) => {
                apply_listing_to_bucket(bucket.as_mut(), &listing, totals);
                info!("bucket {key}: {} objects on remote", totals.count);
            }
            Err(MirrorError::NoEntries { prefixes, .. }) => {
                info!("bucket {key}: no objects on remote, {} prefixes", prefixes.len());
            }
            Err(e) if created => {
                warn!("bucket {key} created locally but remote listing failed: {e}");
                return Err(e.after_local_commit());
            }
            Err(e) => return Err(e),
        }

        Ok(self.wrap_bucket(bucket))
    }

    async fn get_bucket_by_info(&self, user: Option<&dyn User>, info: &BucketInfo) -> Result<Box<dyn Bucket>> {
        let next = self.next.get_bucket_by_info(inner_user(user), info).await?;
        Ok(self.wrap_bucket(next))
    }

    async fn get_bucket_by_name(
        &self,
        user: Option<&dyn User>,
        tenant: &str,
        name: &str,
    ) -> Result<Box<dyn Bucket>> {
        let next = self.next.get_bucket_by_name(inner_user(user), tenant, name).await?;
        Ok(self.wrap_bucket(next))
    }

    async fn get_atomic_writer(&self, head: Box<dyn Object>, params: &WriterParams) -> Result<Box<dyn Writer>> {
        let local_head = head.next_object().unwrap_or(head.as_ref()).clone_box();
        let next = self.next.get_atomic_writer(local_head, params).await?;
        Ok(Box::new(MirrorWriter::new(next, head, params.clone(), self.ctx.clone())))
    }

    fn next_store(&self) -> Option<&dyn Store> {
        Some(self.next.as_ref())
    }
}

pub struct MirrorUser {
    next: Box<dyn User>,
    ctx: Arc<MirrorContext>,
}

#[async_trait]
impl User for MirrorUser {
    fn id(&self) -> &UserId {
        self.next.id()
    }

    fn access_keys(&self) -> &[Credentials] {
        self.next.access_keys()
    }

    /// Create the bucket on the remote only. The local record follows on
    /// the first [`Store::get_bucket`].
    async fn create_bucket(&self, params: &CreateBucketParams) -> Result<()> {
        let creds = self.ctx.user_credentials(self)?;
        let mut headers = Headers::new();
        if params.obj_lock_enabled {
            headers.insert("x-amz-bucket-object-lock-enabled".into(), "true".into());
        }

        let mut request = self.ctx.new_request();
        request.init(
            Verb::Put,
            RemoteTarget::bucket(params.key.qualified_name()),
            &creds,
            headers,
            None,
        )?;
        request.execute(&mut DiscardSink::default()).await?;
        info!("created bucket {} on remote for {}", params.key, self.id());
        Ok(())
    }

    fn next_user(&self) -> Option<&dyn User> {
        Some(self.next.as_ref())
    }
}

pub struct MirrorBucket {
    next: Box<dyn Bucket>,
    ctx: Arc<MirrorContext>,
}

#[async_trait]
impl Bucket for MirrorBucket {
    fn info(&self) -> &BucketInfo {
        self.next.info()
    }

    fn attrs(&self) -> &Attrs {
        self.next.attrs()
    }

    fn set_attrs(&mut self, attrs: Attrs) {
        self.next.set_attrs(attrs)
    }

    fn stats(&self) -> BucketStats {
        self.next.stats()
    }

    fn set_stats(&mut self, stats: BucketStats) {
        self.next.set_stats(stats)
    }

    fn get_object(&self, key: &ObjKey) -> Box<dyn Object> {
        Box::new(MirrorObject {
            next: self.next.get_object(key),
            bucket_attrs: self.next.attrs().clone(),
            ctx: self.ctx.clone(),
        })
    }

    /// One page of the remote listing.
    async fn list(&self, params: &ListParams) -> Result<ListResults> {
        let creds = self.ctx.owner_credentials(self.owner())?;
        let mut target = RemoteTarget::bucket(self.key().qualified_name())
            .with_query("prefix", params.prefix.clone())
            .with_query("delimiter", params.delimiter.clone())
            .with_query("marker", params.marker.clone());
        if params.max_keys > 0 {
            target = target.with_query("max-keys", params.max_keys.to_string());
        }
        match self.ctx.fetch_listing(&creds, target).await {
            Ok(listing) => Ok(listing_to_results(listing)),
            Err(MirrorError::NoEntries { prefixes, next_marker }) => {
                Ok(prefixes_to_results(prefixes, next_marker))
            }
            Err(e) => Err(e),
        }
    }

    async fn put_attrs(&mut self) -> Result<()> {
        self.next.put_attrs().await
    }

    fn next_bucket(&self) -> Option<&dyn Bucket> {
        Some(self.next.as_ref())
    }
}

pub struct MirrorObject {
    next: Box<dyn Object>,
    /// Attributes of the owning bucket when this handle was made
    bucket_attrs: Attrs,
    ctx: Arc<MirrorContext>,
}

impl MirrorObject {
    /// Path-style target of this object on the remote.
    fn remote_target(&self) -> Result<RemoteTarget> {
        let bucket = self.next.bucket().ok_or_else(|| {
            MirrorError::InvalidRequest(format!("object {} is not in a bucket", self.name()))
        })?;
        let key = self.key();
        Ok(RemoteTarget::object(bucket.key.qualified_name(), key.name.clone())
            .with_query("versionId", key.instance.clone()))
    }

    fn owner_credentials(&self) -> Result<Credentials> {
        let bucket = self.next.bucket().ok_or_else(|| {
            MirrorError::InvalidRequest(format!("object {} is not in a bucket", self.name()))
        })?;
        self.ctx.owner_credentials(&bucket.owner)
    }
}

#[async_trait]
impl Object for MirrorObject {
    fn key(&self) -> &ObjKey {
        self.next.key()
    }

    fn bucket(&self) -> Option<&BucketInfo> {
        self.next.bucket()
    }

    fn attrs(&self) -> &Attrs {
        self.next.attrs()
    }

    fn set_attrs(&mut self, attrs: Attrs) {
        self.next.set_attrs(attrs)
    }

    /// Object attribute, falling back to the bucket's.
    fn get_attr(&self, name: &str) -> Option<&Bytes> {
        self.next.get_attr(name).or_else(|| self.bucket_attrs.get(name))
    }

    fn size(&self) -> u64 {
        self.next.size()
    }

    fn mtime(&self) -> Option<DateTime<Utc>> {
        self.next.mtime()
    }

    async fn load_attrs(&mut self) -> Result<()> {
        self.next.load_attrs().await
    }

    async fn modify_attr(&mut self, name: &str, value: Bytes) -> Result<()> {
        self.next.modify_attr(name, value).await
    }

    async fn delete_attr(&mut self, name: &str) -> Result<()> {
        self.next.delete_attr(name).await
    }

    fn get_read_op(&self) -> Box<dyn ReadOp + '_> {
        Box::new(MirrorReadOp {
            next: self.next.get_read_op(),
            obj: self,
            attrs: Attrs::new(),
            size: None,
        })
    }

    fn get_delete_op(&self) -> Box<dyn DeleteOp + '_> {
        Box::new(MirrorDeleteOp { next: self.next.get_delete_op(), obj: self })
    }

    fn clone_box(&self) -> Box<dyn Object> {
        Box::new(MirrorObject {
            next: self.next.clone_box(),
            bucket_attrs: self.bucket_attrs.clone(),
            ctx: self.ctx.clone(),
        })
    }

    fn next_object(&self) -> Option<&dyn Object> {
        Some(self.next.as_ref())
    }
}

/// Reads object data from the remote, metadata from the local side.
pub struct MirrorReadOp<'a> {
    next: Box<dyn ReadOp + 'a>,
    obj: &'a MirrorObject,
    attrs: Attrs,
    /// Known once prepared or after a ranged response
    size: Option<u64>,
}

impl MirrorReadOp<'_> {
    async fn fetch_range(&mut self, ofs: u64, end: u64, sink: &mut dyn DataSink) -> Result<()> {
        if end < ofs {
            return Err(MirrorError::InvalidRequest(format!("bad range {ofs}-{end}")));
        }
        let end = match self.size {
            Some(0) => return Ok(()),
            Some(size) if ofs >= size => return Ok(()),
            Some(size) => end.min(size - 1),
            None => end,
        };

        let creds = self.obj.owner_credentials()?;
        let mut headers = Headers::new();
        headers.insert("range".into(), format!("bytes={ofs}-{end}"));

        let mut request = self.obj.ctx.new_request();
        request.init(Verb::Get, self.obj.remote_target()?, &creds, headers, None)?;
        let mut shifted = OffsetSink::new(sink, ofs);
        request.execute(&mut shifted).await?;

        merge_response_headers(&mut self.attrs, request.response_headers());
        if let Some(total) = header_value(request.response_headers(), "content-range")
            .and_then(|r| r.rsplit('/').next())
            .and_then(|t| t.parse::<u64>().ok())
        {
            self.size = Some(total);
        }
        debug!("read {}: bytes {ofs}-{end} from remote", self.obj.name());
        Ok(())
    }
}

#[async_trait]
impl ReadOp for MirrorReadOp<'_> {
    async fn prepare(&mut self) -> Result<()> {
        self.next.prepare().await?;
        self.attrs = self.next.attrs().clone();
        self.size = Some(self.next.size());
        Ok(())
    }

    async fn read(&mut self, ofs: u64, end: u64) -> Result<Bytes> {
        let mut buf = BufferSink::new();
        self.fetch_range(ofs, end, &mut buf).await?;
        Ok(buf.into_bytes())
    }

    async fn iterate(&mut self, ofs: u64, end: u64, sink: &mut dyn DataSink) -> Result<()> {
        self.fetch_range(ofs, end, sink).await
    }

    fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    fn size(&self) -> u64 {
        self.size.unwrap_or_else(|| self.next.size())
    }
}

/// Deletes locally, then on the remote.
pub struct MirrorDeleteOp<'a> {
    next: Box<dyn DeleteOp + 'a>,
    obj: &'a MirrorObject,
}

#[async_trait]
impl DeleteOp for MirrorDeleteOp<'_> {
    async fn delete_obj(&mut self) -> Result<()> {
        // resolve everything that can fail before touching the local side
        let creds = self.obj.owner_credentials()?;
        let target = self.obj.remote_target()?;

        self.next.delete_obj().await?;

        let mut request = self.obj.ctx.new_request();
        let deleted = async {
            request.init(Verb::Delete, target, &creds, Headers::new(), None)?;
            request.execute(&mut DiscardSink::default()).await
        }
        .await;
        if let Err(e) = deleted {
            warn!("object {} deleted locally but not on remote: {e}", self.obj.name());
            return Err(e.after_local_commit());
        }
        self.obj.ctx.object_unmirrored();
        debug!("deleted {} on both sides", self.obj.name());
        Ok(())
    }
}
