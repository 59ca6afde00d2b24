// src/file_store.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
//! POSIX filesystem backend for the storage traits.
//!
//! Layout under the store root:
//!
//! ```text
//! buckets/<bucket>/<object>      object data
//! meta/<bucket>.bucket           bucket record (owner, placement, attrs)
//! meta/<bucket>/<object>         object attributes
//! tmp/                           in-flight uploads
//! ```
//!
//! Bucket and object names are percent-encoded into single path components,
//! so keys containing `/` stay flat and can never escape the root. A
//! versioned object appends `@<instance>` to its encoded name.
//!
//! Metadata files are line oriented: `<field> <hex>` for bucket fields and
//! `attr <hex name> <hex value>` for attributes.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::config::Credentials;
use crate::constants::{
    ATTR_ETAG, ATTR_STORAGE_CLASS, DEFAULT_STORAGE_CLASS, DEFAULT_STREAM_CHUNK_SIZE, ECANCELED,
    ENODATA,
};
use crate::error::{MirrorError, Result};
use crate::listing::DirEntry;
use crate::sal::{
    Attrs, Bucket, BucketInfo, BucketKey, BucketStats, CompleteParams, CreateBucketParams,
    DeleteOp, ListParams, ListResults, ObjKey, Object, ReadOp, Store, User, UserId, Writer,
    WriterParams,
};
use crate::sink::DataSink;

const NAME: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_');

const DEFAULT_MAX_KEYS: usize = 1000;

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

fn encode_name(name: &str) -> String {
    let encoded = utf8_percent_encode(name, NAME).to_string();
    // keep "." and ".." (and hidden names) out of the tree
    match encoded.strip_prefix('.') {
        Some(rest) => format!("%2E{rest}"),
        None => encoded,
    }
}

fn decode_name(name: &str) -> String {
    percent_decode_str(name).decode_utf8_lossy().into_owned()
}

fn object_file_name(key: &ObjKey) -> String {
    if key.has_instance() {
        format!("{}@{}", encode_name(&key.name), encode_name(&key.instance))
    } else {
        encode_name(&key.name)
    }
}

fn hex_field(text: &str) -> Result<Vec<u8>> {
    hex::decode(text.trim()).map_err(|e| MirrorError::local(ENODATA, format!("corrupt metadata field: {e}")))
}

fn hex_string(text: &str) -> Result<String> {
    String::from_utf8(hex_field(text)?)
        .map_err(|e| MirrorError::local(ENODATA, format!("corrupt metadata text: {e}")))
}

fn encode_attrs(attrs: &Attrs, out: &mut String) {
    for (name, value) in attrs {
        out.push_str(&format!("attr {} {}\n", hex::encode(name), hex::encode(value)));
    }
}

fn decode_attr_line(rest: &str, attrs: &mut Attrs) -> Result<()> {
    let (name, value) = rest.split_once(' ').unwrap_or((rest, ""));
    attrs.insert(hex_string(name)?, Bytes::from(hex_field(value)?));
    Ok(())
}

fn decode_attrs(text: &str) -> Result<Attrs> {
    let mut attrs = Attrs::new();
    for line in text.lines().filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix("attr ") {
            decode_attr_line(rest, &mut attrs)?;
        }
    }
    Ok(attrs)
}

fn encode_bucket(info: &BucketInfo, attrs: &Attrs) -> String {
    let mut out = String::new();
    let mut field = |name: &str, value: &str| out.push_str(&format!("{name} {}\n", hex::encode(value)));
    field("owner_tenant", &info.owner.tenant);
    field("owner_id", &info.owner.id);
    field("zonegroup", &info.zonegroup);
    field("placement", &info.placement_rule);
    if let Some(t) = info.creation_time {
        field("created", &t.to_rfc3339());
    }
    field("obj_lock", if info.obj_lock_enabled { "1" } else { "0" });
    encode_attrs(attrs, &mut out);
    out
}

fn decode_bucket(key: &BucketKey, text: &str) -> Result<(BucketInfo, Attrs)> {
    let mut info = BucketInfo { key: key.clone(), ..Default::default() };
    let mut attrs = Attrs::new();
    for line in text.lines().filter(|l| !l.is_empty()) {
        let (field, value) = line.split_once(' ').unwrap_or((line, ""));
        match field {
            "owner_tenant" => info.owner.tenant = hex_string(value)?,
            "owner_id" => info.owner.id = hex_string(value)?,
            "zonegroup" => info.zonegroup = hex_string(value)?,
            "placement" => info.placement_rule = hex_string(value)?,
            "created" => {
                info.creation_time = DateTime::parse_from_rfc3339(&hex_string(value)?)
                    .ok()
                    .map(|t| t.with_timezone(&Utc))
            }
            "obj_lock" => info.obj_lock_enabled = hex_string(value)? == "1",
            "attr" => decode_attr_line(value, &mut attrs)?,
            other => trace!("ignoring bucket record field {other}"),
        }
    }
    Ok((info, attrs))
}

fn modified_time(meta: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}

fn not_found_as_enoent(e: std::io::Error, what: impl std::fmt::Display) -> MirrorError {
    if e.kind() == std::io::ErrorKind::NotFound {
        MirrorError::not_found(what.to_string())
    } else {
        e.into()
    }
}

#[derive(Debug)]
struct FsInner {
    root: PathBuf,
    users: HashMap<UserId, Vec<Credentials>>,
}

impl FsInner {
    fn bucket_dir(&self, key: &BucketKey) -> PathBuf {
        self.root.join("buckets").join(encode_name(&key.qualified_name()))
    }

    fn bucket_record(&self, key: &BucketKey) -> PathBuf {
        self.root
            .join("meta")
            .join(format!("{}.bucket", encode_name(&key.qualified_name())))
    }

    fn meta_dir(&self, key: &BucketKey) -> PathBuf {
        self.root.join("meta").join(encode_name(&key.qualified_name()))
    }

    fn object_path(&self, bucket: &BucketKey, key: &ObjKey) -> PathBuf {
        self.bucket_dir(bucket).join(object_file_name(key))
    }

    fn object_meta_path(&self, bucket: &BucketKey, key: &ObjKey) -> PathBuf {
        self.meta_dir(bucket).join(object_file_name(key))
    }

    fn tmp_path(&self, tag: &str) -> PathBuf {
        let seq = UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
        self.root
            .join("tmp")
            .join(format!("{}-{}-{}", std::process::id(), seq, encode_name(tag)))
    }

    /// Replace `path` with `contents` via a rename from the tmp area.
    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let tmp = self.tmp_path("meta");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&tmp, contents).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_object_attrs(&self, bucket: &BucketKey, key: &ObjKey) -> Result<Attrs> {
        match fs::read_to_string(self.object_meta_path(bucket, key)).await {
            Ok(text) => decode_attrs(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Attrs::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_object_attrs(&self, bucket: &BucketKey, key: &ObjKey, attrs: &Attrs) -> Result<()> {
        let mut text = String::new();
        encode_attrs(attrs, &mut text);
        self.write_atomic(&self.object_meta_path(bucket, key), text.as_bytes()).await
    }

    async fn load_bucket(self: &Arc<Self>, key: &BucketKey) -> Result<FsBucket> {
        let text = fs::read_to_string(self.bucket_record(key))
            .await
            .map_err(|e| not_found_as_enoent(e, format_args!("bucket {key}")))?;
        let (info, attrs) = decode_bucket(key, &text)?;

        let mut stats = BucketStats::default();
        let mut entries = fs::read_dir(self.bucket_dir(key)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                stats.count += 1;
                stats.size += meta.len();
            }
        }

        Ok(FsBucket { store: self.clone(), info, attrs, stats })
    }
}

/// Local storage engine rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileSystemStore {
    inner: Arc<FsInner>,
}

impl FileSystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(FsInner { root: root.into(), users: HashMap::new() }),
        }
    }

    /// Register a user and its access key. Call before sharing the store.
    pub fn with_user(mut self, id: UserId, credentials: Credentials) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.users.entry(id).or_default().push(credentials),
            None => {
                let mut users = self.inner.users.clone();
                users.entry(id).or_default().push(credentials);
                self.inner = Arc::new(FsInner { root: self.inner.root.clone(), users });
            }
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }
}

#[async_trait]
impl Store for FileSystemStore {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn initialize(&self) -> Result<()> {
        for dir in ["buckets", "meta", "tmp"] {
            fs::create_dir_all(self.inner.root.join(dir)).await?;
        }
        debug!("filesystem store ready at {}", self.inner.root.display());
        Ok(())
    }

    fn get_user(&self, id: &UserId) -> Box<dyn User> {
        Box::new(FsUser {
            store: self.inner.clone(),
            keys: self.inner.users.get(id).cloned().unwrap_or_default(),
            id: id.clone(),
        })
    }

    fn get_object(&self, key: &ObjKey) -> Box<dyn Object> {
        Box::new(FsObject::new(self.inner.clone(), None, key.clone()))
    }

    async fn get_bucket(&self, _user: Option<&dyn User>, key: &BucketKey) -> Result<Box<dyn Bucket>> {
        Ok(Box::new(self.inner.load_bucket(key).await?))
    }

    async fn get_bucket_by_info(&self, user: Option<&dyn User>, info: &BucketInfo) -> Result<Box<dyn Bucket>> {
        self.get_bucket(user, &info.key).await
    }

    async fn get_bucket_by_name(
        &self,
        user: Option<&dyn User>,
        tenant: &str,
        name: &str,
    ) -> Result<Box<dyn Bucket>> {
        self.get_bucket(user, &BucketKey::with_tenant(tenant, name)).await
    }

    async fn get_atomic_writer(&self, head: Box<dyn Object>, params: &WriterParams) -> Result<Box<dyn Writer>> {
        let bucket = head
            .bucket()
            .cloned()
            .ok_or_else(|| MirrorError::InvalidRequest(format!("object {} has no bucket", head.name())))?;
        let tag = if params.unique_tag.is_empty() { head.name() } else { params.unique_tag.as_str() };
        Ok(Box::new(FsWriter {
            tmp: self.inner.tmp_path(tag),
            store: self.inner.clone(),
            bucket,
            key: head.key().clone(),
            file: None,
            hasher: md5::Context::new(),
            size: 0,
            committed: false,
        }))
    }
}

pub struct FsUser {
    store: Arc<FsInner>,
    id: UserId,
    keys: Vec<Credentials>,
}

#[async_trait]
impl User for FsUser {
    fn id(&self) -> &UserId {
        &self.id
    }

    fn access_keys(&self) -> &[Credentials] {
        &self.keys
    }

    async fn create_bucket(&self, params: &CreateBucketParams) -> Result<()> {
        let record = self.store.bucket_record(&params.key);
        if fs::try_exists(&record).await? {
            if params.exclusive {
                return Err(MirrorError::already_exists(format!("bucket {}", params.key)));
            }
            return Ok(());
        }

        fs::create_dir_all(self.store.bucket_dir(&params.key)).await?;
        fs::create_dir_all(self.store.meta_dir(&params.key)).await?;
        let info = BucketInfo {
            key: params.key.clone(),
            owner: self.id.clone(),
            zonegroup: params.zonegroup_id.clone(),
            placement_rule: params.placement_rule.clone(),
            creation_time: Some(Utc::now()),
            obj_lock_enabled: params.obj_lock_enabled,
        };
        self.store
            .write_atomic(&record, encode_bucket(&info, &params.attrs).as_bytes())
            .await?;
        debug!("created local bucket {} for {}", params.key, self.id);
        Ok(())
    }
}

pub struct FsBucket {
    store: Arc<FsInner>,
    info: BucketInfo,
    attrs: Attrs,
    stats: BucketStats,
}

#[async_trait]
impl Bucket for FsBucket {
    fn info(&self) -> &BucketInfo {
        &self.info
    }

    fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    fn set_attrs(&mut self, attrs: Attrs) {
        self.attrs = attrs;
    }

    fn stats(&self) -> BucketStats {
        self.stats
    }

    fn set_stats(&mut self, stats: BucketStats) {
        self.stats = stats;
    }

    fn get_object(&self, key: &ObjKey) -> Box<dyn Object> {
        Box::new(FsObject::new(self.store.clone(), Some(self.info.clone()), key.clone()))
    }

    async fn list(&self, params: &ListParams) -> Result<ListResults> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(self.store.bucket_dir(&self.info.key)).await?;
        while let Some(entry) = dir.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            // versioned copies are not part of the current listing
            if file_name.contains('@') {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() {
                names.push((decode_name(&file_name), meta));
            }
        }
        names.sort_by(|a, b| a.0.cmp(&b.0));

        let max_keys = if params.max_keys == 0 { DEFAULT_MAX_KEYS } else { params.max_keys };
        let mut results = ListResults::default();
        let mut last = String::new();

        for (name, meta) in names {
            if name <= params.marker || !name.starts_with(&params.prefix) {
                continue;
            }
            let rolled = if params.delimiter.is_empty() {
                None
            } else {
                name[params.prefix.len()..]
                    .find(&params.delimiter)
                    .map(|i| name[..params.prefix.len() + i + params.delimiter.len()].to_string())
            };
            if let Some(p) = &rolled {
                if *p <= params.marker || results.common_prefixes.last() == Some(p) {
                    continue;
                }
            }
            if results.objs.len() + results.common_prefixes.len() >= max_keys {
                results.is_truncated = true;
                results.next_marker = Some(last);
                break;
            }
            match rolled {
                Some(p) => {
                    last = p.clone();
                    results.common_prefixes.push(p);
                }
                None => {
                    let key = ObjKey::new(name.clone());
                    let attrs = self.store.read_object_attrs(&self.info.key, &key).await?;
                    let text = |attr: &str| {
                        attrs.get(attr).map(|v| String::from_utf8_lossy(v).into_owned())
                    };
                    let mtime = modified_time(&meta);
                    results.objs.push(DirEntry {
                        etag: text(ATTR_ETAG).unwrap_or_default(),
                        owner: self.info.owner.id.clone(),
                        size: meta.len(),
                        accounted_size: meta.len(),
                        last_modified: mtime.map(|t| t.to_rfc3339()).unwrap_or_default(),
                        mtime,
                        storage_class: text(ATTR_STORAGE_CLASS)
                            .unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string()),
                        exists: true,
                        key: name.clone(),
                    });
                    last = name;
                }
            }
        }
        Ok(results)
    }

    async fn put_attrs(&mut self) -> Result<()> {
        let record = self.store.bucket_record(&self.info.key);
        self.store
            .write_atomic(&record, encode_bucket(&self.info, &self.attrs).as_bytes())
            .await
    }
}

#[derive(Clone)]
pub struct FsObject {
    store: Arc<FsInner>,
    bucket: Option<BucketInfo>,
    key: ObjKey,
    attrs: Attrs,
    size: u64,
    mtime: Option<DateTime<Utc>>,
}

impl FsObject {
    fn new(store: Arc<FsInner>, bucket: Option<BucketInfo>, key: ObjKey) -> Self {
        Self { store, bucket, key, attrs: Attrs::new(), size: 0, mtime: None }
    }

    fn bucket_key(&self) -> Result<&BucketKey> {
        self.bucket
            .as_ref()
            .map(|b| &b.key)
            .ok_or_else(|| MirrorError::InvalidRequest(format!("object {} has no bucket", self.key.name)))
    }

    fn data_path(&self) -> Result<PathBuf> {
        Ok(self.store.object_path(self.bucket_key()?, &self.key))
    }

    async fn stat(&self) -> Result<std::fs::Metadata> {
        let path = self.data_path()?;
        fs::metadata(&path)
            .await
            .map_err(|e| not_found_as_enoent(e, format_args!("object {}", self.key.name)))
    }
}

#[async_trait]
impl Object for FsObject {
    fn key(&self) -> &ObjKey {
        &self.key
    }

    fn bucket(&self) -> Option<&BucketInfo> {
        self.bucket.as_ref()
    }

    fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    fn set_attrs(&mut self, attrs: Attrs) {
        self.attrs = attrs;
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn mtime(&self) -> Option<DateTime<Utc>> {
        self.mtime
    }

    async fn load_attrs(&mut self) -> Result<()> {
        let meta = self.stat().await?;
        self.size = meta.len();
        self.mtime = modified_time(&meta);
        self.attrs = self.store.read_object_attrs(self.bucket_key()?, &self.key).await?;
        Ok(())
    }

    async fn modify_attr(&mut self, name: &str, value: Bytes) -> Result<()> {
        self.stat().await?;
        let bucket = self.bucket_key()?.clone();
        let mut attrs = self.store.read_object_attrs(&bucket, &self.key).await?;
        attrs.insert(name.to_string(), value);
        self.store.write_object_attrs(&bucket, &self.key, &attrs).await?;
        self.attrs = attrs;
        Ok(())
    }

    async fn delete_attr(&mut self, name: &str) -> Result<()> {
        let bucket = self.bucket_key()?.clone();
        let mut attrs = self.store.read_object_attrs(&bucket, &self.key).await?;
        if attrs.remove(name).is_none() {
            return Err(MirrorError::local(ENODATA, format!("object {} has no attribute {name}", self.key.name)));
        }
        self.store.write_object_attrs(&bucket, &self.key, &attrs).await?;
        self.attrs = attrs;
        Ok(())
    }

    fn get_read_op(&self) -> Box<dyn ReadOp + '_> {
        Box::new(FsReadOp { obj: self, attrs: Attrs::new(), size: 0, prepared: false })
    }

    fn get_delete_op(&self) -> Box<dyn DeleteOp + '_> {
        Box::new(FsDeleteOp { obj: self })
    }

    fn clone_box(&self) -> Box<dyn Object> {
        Box::new(self.clone())
    }
}

pub struct FsReadOp<'a> {
    obj: &'a FsObject,
    attrs: Attrs,
    size: u64,
    prepared: bool,
}

impl FsReadOp<'_> {
    /// Clamp `ofs..=end` to the object, returning the byte count.
    fn span(&self, ofs: u64, end: u64) -> Result<u64> {
        if !self.prepared {
            return Err(MirrorError::Lifecycle("read before prepare".into()));
        }
        if self.size == 0 || ofs >= self.size {
            return Ok(0);
        }
        let end = end.min(self.size - 1);
        if end < ofs {
            return Err(MirrorError::InvalidRequest(format!("bad range {ofs}-{end}")));
        }
        Ok(end - ofs + 1)
    }

    async fn open_at(&self, ofs: u64) -> Result<fs::File> {
        let mut file = fs::File::open(self.obj.data_path()?)
            .await
            .map_err(|e| not_found_as_enoent(e, format_args!("object {}", self.obj.key.name)))?;
        file.seek(SeekFrom::Start(ofs)).await?;
        Ok(file)
    }
}

#[async_trait]
impl ReadOp for FsReadOp<'_> {
    async fn prepare(&mut self) -> Result<()> {
        let meta = self.obj.stat().await?;
        self.size = meta.len();
        self.attrs = self
            .obj
            .store
            .read_object_attrs(self.obj.bucket_key()?, &self.obj.key)
            .await?;
        self.prepared = true;
        Ok(())
    }

    async fn read(&mut self, ofs: u64, end: u64) -> Result<Bytes> {
        let len = self.span(ofs, end)?;
        if len == 0 {
            return Ok(Bytes::new());
        }
        let mut file = self.open_at(ofs).await?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn iterate(&mut self, ofs: u64, end: u64, sink: &mut dyn DataSink) -> Result<()> {
        let mut remaining = self.span(ofs, end)?;
        if remaining == 0 {
            return Ok(());
        }
        let mut file = self.open_at(ofs).await?;
        let mut buf = vec![0u8; DEFAULT_STREAM_CHUNK_SIZE];
        let mut pos = ofs;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            file.read_exact(&mut buf[..want]).await?;
            sink.handle_data(&buf[..want], pos)?;
            pos += want as u64;
            remaining -= want as u64;
        }
        Ok(())
    }

    fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    fn size(&self) -> u64 {
        self.size
    }
}

pub struct FsDeleteOp<'a> {
    obj: &'a FsObject,
}

#[async_trait]
impl DeleteOp for FsDeleteOp<'_> {
    async fn delete_obj(&mut self) -> Result<()> {
        let path = self.obj.data_path()?;
        fs::remove_file(&path)
            .await
            .map_err(|e| not_found_as_enoent(e, format_args!("object {}", self.obj.key.name)))?;
        let meta = self.obj.store.object_meta_path(self.obj.bucket_key()?, &self.obj.key);
        if let Err(e) = fs::remove_file(&meta).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("object {} deleted but its attributes remain: {}", self.obj.key.name, e);
            }
        }
        debug!("deleted local object {}", path.display());
        Ok(())
    }
}

/// Streams an upload into the tmp area and renames it into place on
/// completion.
pub struct FsWriter {
    store: Arc<FsInner>,
    bucket: BucketInfo,
    key: ObjKey,
    tmp: PathBuf,
    file: Option<fs::File>,
    hasher: md5::Context,
    size: u64,
    committed: bool,
}

impl FsWriter {
    async fn check_preconditions(&self, params: &CompleteParams) -> Result<()> {
        if params.if_match.is_none() && params.if_nomatch.is_none() {
            return Ok(());
        }
        let target = self.store.object_path(&self.bucket.key, &self.key);
        let exists = fs::try_exists(&target).await?;
        let current = if exists {
            self.store
                .read_object_attrs(&self.bucket.key, &self.key)
                .await?
                .get(ATTR_ETAG)
                .map(|v| String::from_utf8_lossy(v).into_owned())
        } else {
            None
        };

        if let Some(want) = &params.if_match {
            let ok = exists && (want == "*" || current.as_deref() == Some(want.as_str()));
            if !ok {
                return Err(MirrorError::local(ECANCELED, format!("if-match {want} failed for {}", self.key.name)));
            }
        }
        if let Some(avoid) = &params.if_nomatch {
            let clash = exists && (avoid == "*" || current.as_deref() == Some(avoid.as_str()));
            if clash {
                return Err(MirrorError::local(ECANCELED, format!("if-none-match {avoid} failed for {}", self.key.name)));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Writer for FsWriter {
    async fn prepare(&mut self) -> Result<()> {
        if !fs::try_exists(self.store.bucket_record(&self.bucket.key)).await? {
            return Err(MirrorError::not_found(format!("bucket {}", self.bucket.key)));
        }
        if let Some(parent) = self.tmp.parent() {
            fs::create_dir_all(parent).await?;
        }
        self.file = Some(fs::File::create(&self.tmp).await?);
        trace!("upload of {} staged at {}", self.key.name, self.tmp.display());
        Ok(())
    }

    async fn process(&mut self, data: Bytes, _offset: u64) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| MirrorError::Lifecycle("process before prepare".into()))?;
        file.write_all(&data).await?;
        self.hasher.consume(&data);
        self.size += data.len() as u64;
        Ok(())
    }

    async fn complete(&mut self, params: CompleteParams) -> Result<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| MirrorError::Lifecycle("complete before prepare".into()))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        self.check_preconditions(&params).await?;

        let digest = std::mem::replace(&mut self.hasher, md5::Context::new()).compute();
        let mut attrs = params.attrs;
        attrs.insert(ATTR_ETAG.to_string(), Bytes::from(format!("{digest:x}")));

        let target = self.store.object_path(&self.bucket.key, &self.key);
        fs::rename(&self.tmp, &target).await?;
        self.committed = true;
        self.store.write_object_attrs(&self.bucket.key, &self.key, &attrs).await?;
        debug!("committed {} ({} bytes) to {}", self.key.name, self.size, target.display());
        Ok(())
    }
}

impl Drop for FsWriter {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.tmp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_name_encoding_stays_in_one_component() {
        assert_eq!(encode_name("a/b c"), "a%2Fb%20c");
        assert_eq!(encode_name(".."), "%2E.");
        assert_eq!(decode_name(&encode_name("x/../y")), "x/../y");
        assert_eq!(object_file_name(&ObjKey::with_instance("k", "v1")), "k@v1");
    }

    #[test]
    fn test_bucket_record_roundtrip() {
        let info = BucketInfo {
            key: BucketKey::new("b"),
            owner: UserId::with_tenant("t", "alice"),
            placement_rule: "default".into(),
            obj_lock_enabled: true,
            ..Default::default()
        };
        let mut attrs = Attrs::new();
        attrs.insert("user.rgw.acl".into(), Bytes::from_static(b"\x00\x01 binary"));
        let (back, back_attrs) = decode_bucket(&info.key, &encode_bucket(&info, &attrs)).unwrap();
        assert_eq!(back, info);
        assert_eq!(back_attrs, attrs);
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let dir = TempDir::new().unwrap();
        let store = FileSystemStore::new(dir.path());
        store.initialize().await.unwrap();
        let user = store.get_user(&UserId::new("alice"));
        user.create_bucket(&CreateBucketParams::new(BucketKey::new("b"))).await.unwrap();

        let bucket = store.get_bucket(Some(user.as_ref()), &BucketKey::new("b")).await.unwrap();
        assert_eq!(bucket.owner().id, "alice");
        let obj = bucket.get_object(&ObjKey::new("dir/file"));

        let mut w = store.get_atomic_writer(obj.clone_box(), &WriterParams::default()).await.unwrap();
        w.prepare().await.unwrap();
        w.process(Bytes::from_static(b"hello "), 0).await.unwrap();
        w.process(Bytes::from_static(b"world"), 6).await.unwrap();
        w.process(Bytes::new(), 11).await.unwrap();
        w.complete(CompleteParams::default()).await.unwrap();

        let mut op = obj.get_read_op();
        op.prepare().await.unwrap();
        assert_eq!(op.size(), 11);
        assert_eq!(op.read(6, 100).await.unwrap().as_ref(), b"world");
        let mut out = Vec::new();
        op.iterate(0, 4, &mut out).await.unwrap();
        assert_eq!(out, b"hello");
        let etag = format!("{:x}", md5::compute(b"hello world"));
        assert_eq!(op.attrs()[ATTR_ETAG].as_ref(), etag.as_bytes());
        drop(op);

        let listed = bucket.list(&ListParams { delimiter: "/".into(), ..Default::default() }).await.unwrap();
        assert!(listed.objs.is_empty());
        assert_eq!(listed.common_prefixes, vec!["dir/"]);

        obj.get_delete_op().delete_obj().await.unwrap();
        let err = obj.get_delete_op().delete_obj().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_missing_bucket_is_enoent() {
        let dir = TempDir::new().unwrap();
        let store = FileSystemStore::new(dir.path());
        store.initialize().await.unwrap();
        let err = store.get_bucket(None, &BucketKey::new("nope")).await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_exclusive_create() {
        let dir = TempDir::new().unwrap();
        let store = FileSystemStore::new(dir.path());
        store.initialize().await.unwrap();
        let user = store.get_user(&UserId::new("u"));
        let mut params = CreateBucketParams::new(BucketKey::new("b"));
        user.create_bucket(&params).await.unwrap();
        user.create_bucket(&params).await.unwrap();
        params.exclusive = true;
        assert_eq!(user.create_bucket(&params).await.unwrap_err().code(), -17);
    }

    #[tokio::test]
    async fn test_if_nomatch_star_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = FileSystemStore::new(dir.path());
        store.initialize().await.unwrap();
        let user = store.get_user(&UserId::new("u"));
        user.create_bucket(&CreateBucketParams::new(BucketKey::new("b"))).await.unwrap();
        let bucket = store.get_bucket(None, &BucketKey::new("b")).await.unwrap();

        for round in 0..2 {
            let mut w = store
                .get_atomic_writer(bucket.get_object(&ObjKey::new("k")), &WriterParams::default())
                .await
                .unwrap();
            w.prepare().await.unwrap();
            w.process(Bytes::from_static(b"x"), 0).await.unwrap();
            let res = w
                .complete(CompleteParams { if_nomatch: Some("*".into()), ..Default::default() })
                .await;
            assert_eq!(res.is_ok(), round == 0);
        }
    }
}
