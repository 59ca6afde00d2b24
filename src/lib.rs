// src/lib.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
// Crate root: module declarations and public re-exports.

// ===== Core types =====
pub mod constants;
pub mod error;
pub mod config;
pub mod sal;

// ===== Remote plumbing =====
pub mod http;
pub mod sink;
pub mod listing;
pub mod mirror_request;
pub mod reconcile;

// ===== Decorators and the local engine =====
pub mod mirror_store;
pub mod mirror_writer;
pub mod file_store;

pub use config::{Credentials, MirrorConfig};
pub use error::{MirrorError, Result, Side};
pub use file_store::FileSystemStore;
pub use http::{Fault, HttpClientConfig, MemoryRemote, ReqwestTransport, Transport};
pub use listing::{DirEntry, Listing, parse_listing};
pub use mirror_request::{MirrorRequest, RemoteTarget, RequestState};
pub use mirror_store::{MirrorContext, MirrorStore};
pub use mirror_writer::{MirrorWriter, WriterState};
pub use sal::{
    Attrs, Bucket, BucketInfo, BucketKey, BucketStats, CompleteParams, CreateBucketParams,
    DeleteOp, ListParams, ListResults, ObjKey, Object, ReadOp, Store, User, UserId, Writer,
    WriterParams,
};
pub use sink::{BufferSink, DataSink, PendingWriteBuffer};
