// src/sal.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
//! Storage abstraction layer.
//!
//! These traits describe the surface of a storage backend: a store hands out
//! users, buckets and objects; objects hand out read and delete operations;
//! the store hands out atomic writers. A backend implements them directly,
//! a decorator implements them by wrapping another implementation and
//! exposing it through the `next_*` accessors.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::config::Credentials;
use crate::error::Result;
use crate::listing::DirEntry;
use crate::sink::DataSink;

/// Attribute name → opaque value.
pub type Attrs = BTreeMap<String, Bytes>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId {
    pub tenant: String,
    pub id: String,
}

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self { tenant: String::new(), id: id.into() }
    }

    pub fn with_tenant(tenant: impl Into<String>, id: impl Into<String>) -> Self {
        Self { tenant: tenant.into(), id: id.into() }
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tenant.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{}${}", self.tenant, self.id)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub tenant: String,
    pub name: String,
}

impl BucketKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self { tenant: String::new(), name: name.into() }
    }

    pub fn with_tenant(tenant: impl Into<String>, name: impl Into<String>) -> Self {
        Self { tenant: tenant.into(), name: name.into() }
    }

    /// Name used on the wire and on disk: `tenant:name`, or just `name`.
    pub fn qualified_name(&self) -> String {
        if self.tenant.is_empty() {
            self.name.clone()
        } else {
            format!("{}:{}", self.tenant, self.name)
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketInfo {
    pub key: BucketKey,
    pub owner: UserId,
    pub zonegroup: String,
    pub placement_rule: String,
    pub creation_time: Option<DateTime<Utc>>,
    pub obj_lock_enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketStats {
    pub count: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjKey {
    pub name: String,
    pub instance: String,
}

impl ObjKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), instance: String::new() }
    }

    pub fn with_instance(name: impl Into<String>, instance: impl Into<String>) -> Self {
        Self { name: name.into(), instance: instance.into() }
    }

    pub fn has_instance(&self) -> bool {
        !self.instance.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateBucketParams {
    pub key: BucketKey,
    pub zonegroup_id: String,
    pub placement_rule: String,
    pub attrs: Attrs,
    /// Fail with EEXIST when the bucket already exists
    pub exclusive: bool,
    pub obj_lock_enabled: bool,
}

impl CreateBucketParams {
    pub fn new(key: BucketKey) -> Self {
        Self { key, ..Default::default() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub prefix: String,
    pub delimiter: String,
    pub marker: String,
    /// 0 means "backend default"
    pub max_keys: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ListResults {
    pub objs: Vec<DirEntry>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WriterParams {
    pub owner: UserId,
    pub placement_rule: Option<String>,
    pub olh_epoch: u64,
    pub unique_tag: String,
}

#[derive(Debug, Clone, Default)]
pub struct CompleteParams {
    pub accounted_size: u64,
    pub etag: String,
    pub mtime: Option<DateTime<Utc>>,
    pub attrs: Attrs,
    pub if_match: Option<String>,
    pub if_nomatch: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    fn get_user(&self, id: &UserId) -> Box<dyn User>;

    /// An object handle not bound to any bucket.
    fn get_object(&self, key: &ObjKey) -> Box<dyn Object>;

    async fn get_bucket(&self, user: Option<&dyn User>, key: &BucketKey) -> Result<Box<dyn Bucket>>;

    async fn get_bucket_by_info(&self, user: Option<&dyn User>, info: &BucketInfo) -> Result<Box<dyn Bucket>>;

    async fn get_bucket_by_name(
        &self,
        user: Option<&dyn User>,
        tenant: &str,
        name: &str,
    ) -> Result<Box<dyn Bucket>>;

    async fn get_atomic_writer(&self, head: Box<dyn Object>, params: &WriterParams) -> Result<Box<dyn Writer>>;

    fn next_store(&self) -> Option<&dyn Store> {
        None
    }
}

#[async_trait]
pub trait User: Send + Sync {
    fn id(&self) -> &UserId;

    /// The user's stored access keys, first one preferred.
    fn access_keys(&self) -> &[Credentials];

    async fn create_bucket(&self, params: &CreateBucketParams) -> Result<()>;

    fn next_user(&self) -> Option<&dyn User> {
        None
    }
}

#[async_trait]
pub trait Bucket: Send + Sync {
    fn info(&self) -> &BucketInfo;

    fn key(&self) -> &BucketKey {
        &self.info().key
    }

    fn name(&self) -> &str {
        &self.info().key.name
    }

    fn owner(&self) -> &UserId {
        &self.info().owner
    }

    fn attrs(&self) -> &Attrs;

    fn set_attrs(&mut self, attrs: Attrs);

    fn stats(&self) -> BucketStats;

    fn set_stats(&mut self, stats: BucketStats);

    fn get_object(&self, key: &ObjKey) -> Box<dyn Object>;

    async fn list(&self, params: &ListParams) -> Result<ListResults>;

    /// Persist the in-memory attribute map.
    async fn put_attrs(&mut self) -> Result<()>;

    fn next_bucket(&self) -> Option<&dyn Bucket> {
        None
    }
}

#[async_trait]
pub trait Object: Send + Sync {
    fn key(&self) -> &ObjKey;

    fn name(&self) -> &str {
        &self.key().name
    }

    /// Owning bucket, `None` for store-level handles.
    fn bucket(&self) -> Option<&BucketInfo>;

    fn attrs(&self) -> &Attrs;

    fn set_attrs(&mut self, attrs: Attrs);

    fn get_attr(&self, name: &str) -> Option<&Bytes> {
        self.attrs().get(name)
    }

    fn size(&self) -> u64;

    fn mtime(&self) -> Option<DateTime<Utc>>;

    async fn load_attrs(&mut self) -> Result<()>;

    async fn modify_attr(&mut self, name: &str, value: Bytes) -> Result<()>;

    async fn delete_attr(&mut self, name: &str) -> Result<()>;

    fn get_read_op(&self) -> Box<dyn ReadOp + '_>;

    fn get_delete_op(&self) -> Box<dyn DeleteOp + '_>;

    fn clone_box(&self) -> Box<dyn Object>;

    fn next_object(&self) -> Option<&dyn Object> {
        None
    }
}

#[async_trait]
pub trait ReadOp: Send {
    /// Check the object exists and load its attributes and size.
    async fn prepare(&mut self) -> Result<()>;

    /// Read bytes `ofs..=end`.
    async fn read(&mut self, ofs: u64, end: u64) -> Result<Bytes>;

    /// Stream bytes `ofs..=end` into `sink`, in order.
    async fn iterate(&mut self, ofs: u64, end: u64, sink: &mut dyn DataSink) -> Result<()>;

    fn attrs(&self) -> &Attrs;

    fn size(&self) -> u64;
}

#[async_trait]
pub trait DeleteOp: Send {
    async fn delete_obj(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Writer: Send {
    async fn prepare(&mut self) -> Result<()>;

    /// An empty `data` chunk is the end-of-stream flush signal.
    async fn process(&mut self, data: Bytes, offset: u64) -> Result<()>;

    async fn complete(&mut self, params: CompleteParams) -> Result<()>;
}
