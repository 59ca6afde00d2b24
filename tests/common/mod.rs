// tests/common/mod.rs
//
// Common test utilities: a mirror proxy over a temporary filesystem store
// and an in-memory remote.

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tempfile::TempDir;

use s3mirror::{
    Bucket, BucketKey, CompleteParams, Credentials, FileSystemStore, MemoryRemote, MirrorConfig,
    MirrorStore, ObjKey, Store, User, UserId, Writer, WriterParams,
};

pub const ACCESS_KEY: &str = "AKIDALICE";
pub const SECRET_KEY: &str = "alice-secret";
pub const ENDPOINT: &str = "http://remote.test:8000";

pub struct Harness {
    /// Keeps the store root alive for the test's duration
    pub dir: TempDir,
    pub remote: MemoryRemote,
    pub local: Arc<FileSystemStore>,
    pub store: MirrorStore,
    pub user_id: UserId,
}

impl Harness {
    pub fn user(&self) -> Box<dyn User> {
        self.store.get_user(&self.user_id)
    }

    /// A user the local store has no keys for.
    pub fn stranger(&self) -> Box<dyn User> {
        self.store.get_user(&UserId::new("mallory"))
    }

    pub fn credentials() -> Credentials {
        Credentials::new(ACCESS_KEY, SECRET_KEY)
    }

    /// Fetch a bucket through the proxy as the default user.
    pub async fn bucket(&self, name: &str) -> s3mirror::Result<Box<dyn Bucket>> {
        let user = self.user();
        self.store.get_bucket(Some(user.as_ref()), &BucketKey::new(name)).await
    }

    /// Create the local record of `name` directly, bypassing the proxy.
    pub async fn create_local_bucket(&self, name: &str) -> Result<()> {
        let user = self.local.get_user(&self.user_id);
        user.create_bucket(&s3mirror::CreateBucketParams::new(BucketKey::new(name))).await?;
        Ok(())
    }

    /// Upload through the proxy in the given chunks, then flush and complete.
    pub async fn upload(&self, bucket: &dyn Bucket, key: &str, chunks: &[&[u8]]) -> s3mirror::Result<()> {
        let head = bucket.get_object(&ObjKey::new(key));
        let params = WriterParams { owner: self.user_id.clone(), ..Default::default() };
        let mut writer = self.store.get_atomic_writer(head, &params).await?;
        writer.prepare().await?;
        let mut offset = 0u64;
        for chunk in chunks {
            writer.process(Bytes::copy_from_slice(chunk), offset).await?;
            offset += chunk.len() as u64;
        }
        writer.process(Bytes::new(), offset).await?;
        writer
            .complete(CompleteParams { accounted_size: offset, ..Default::default() })
            .await
    }
}

/// Proxy over a fresh filesystem store, with the default user's key
/// registered and no fallback credentials configured.
pub async fn harness() -> Result<Harness> {
    harness_with_config(MirrorConfig::new(ENDPOINT)).await
}

pub async fn harness_with_config(config: MirrorConfig) -> Result<Harness> {
    let dir = TempDir::new()?;
    let user_id = UserId::new("alice");
    let local = Arc::new(FileSystemStore::new(dir.path()).with_user(user_id.clone(), Harness::credentials()));
    let remote = MemoryRemote::new();
    let store = MirrorStore::with_transport(local.clone(), config, Arc::new(remote.clone()));
    store.initialize().await?;
    Ok(Harness { dir, remote, local, store, user_id })
}

/// Print test header with formatting
pub fn print_test_header(test_name: &str) {
    println!("\n{}", "=".repeat(60));
    println!("TEST: {}", test_name);
    println!("{}", "=".repeat(60));
}
