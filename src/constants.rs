// src/constants.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
// Centralized constants for s3mirror to avoid hardcoded values throughout the codebase

/// Default region used when signing requests and none is configured
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default remote endpoint (a local S3-compatible gateway)
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8000";

/// Default timeout for a whole remote exchange (seconds)
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 300; // 5 minutes

/// Default connect timeout for the remote endpoint (seconds)
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Chunk size used when streaming local object data into a sink (64 KB)
pub const DEFAULT_STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Storage class reported when the remote omits one
pub const DEFAULT_STORAGE_CLASS: &str = "STANDARD";

// ============================================================================
// Environment variables
// ============================================================================

pub const ENV_ENDPOINT: &str = "S3MIRROR_ENDPOINT";
pub const ENV_AWS_ENDPOINT: &str = "AWS_ENDPOINT_URL";
pub const ENV_REGION: &str = "AWS_REGION";
pub const ENV_ACCESS_KEY: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_SECRET_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_OPERATION_TIMEOUT: &str = "S3MIRROR_OPERATION_TIMEOUT_SECS";
pub const ENV_UNSIGNED: &str = "S3MIRROR_UNSIGNED";

// ============================================================================
// Attribute names
// ============================================================================
//
// Attribute maps are keyed by these names. Values are raw bytes; numeric and
// time values are stored as their decimal / ISO-8601 text.

pub const ATTR_ETAG: &str = "user.rgw.etag";
pub const ATTR_STORAGE_CLASS: &str = "user.rgw.storage_class";
pub const ATTR_CONTENT_TYPE: &str = "user.rgw.content_type";
pub const ATTR_META_PREFIX: &str = "user.rgw.x-amz-meta-";

/// Completion metadata recorded on the head object by the mirror writer
pub const ATTR_MTIME: &str = "mtime";
pub const ATTR_OBJECT_SIZE: &str = "object_size";
pub const ATTR_ACCOUNTED_SIZE: &str = "accounted_size";
pub const ATTR_VERSION_ID: &str = "version_id";

// ============================================================================
// Negative result codes (errno values)
// ============================================================================

pub const ENOENT: i32 = 2;
pub const EIO: i32 = 5;
pub const EACCES: i32 = 13;
pub const EEXIST: i32 = 17;
pub const EINVAL: i32 = 22;
pub const ENODATA: i32 = 61;
pub const EBADMSG: i32 = 74;
pub const ETIMEDOUT: i32 = 110;
pub const EREMOTEIO: i32 = 121;
pub const ECANCELED: i32 = 125;

// ============================================================================
// Request signing
// ============================================================================

pub const SIGV4_ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const SIGV4_SERVICE: &str = "s3";
pub const AMZ_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";
