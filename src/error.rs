// src/error.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
//! Error taxonomy for the mirroring proxy.
//!
//! Every failure carries a negative result code (see [`MirrorError::code`]).
//! Callers can tell "nothing happened" apart from "one side committed and
//! the other failed" through [`MirrorError::Indeterminate`], whose [`Side`]
//! names the copy that kept the change.

use std::fmt;

use thiserror::Error;

use crate::constants::{
    EACCES, EBADMSG, EEXIST, EINVAL, EIO, ENODATA, ENOENT, EREMOTEIO, ETIMEDOUT,
};

pub type Result<T, E = MirrorError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum MirrorError {
    /// Failure reported by the wrapped local backend, passed through verbatim.
    #[error("local backend error ({code}): {message}")]
    LocalBackend { code: i32, message: String },

    /// Malformed target, credentials or parameters. No I/O was attempted.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A request or writer phase was invoked out of order.
    #[error("lifecycle violation: {0}")]
    Lifecycle(String),

    /// The transport could not deliver the request or lost the response.
    #[error("remote transport error: {message}")]
    RemoteTransport { message: String, timed_out: bool },

    /// The remote peer answered with a non-success status.
    #[error("remote returned HTTP {status}{}: {message}", .code.as_ref().map(|c| format!(" ({c})")).unwrap_or_default())]
    RemoteProtocol {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// A listing body was missing expected tags or carried bad numbers.
    #[error("listing parse error: {0}")]
    Parse(String),

    /// The listing held no object entries, only common prefixes.
    /// `next_marker` is set when the page was truncated.
    #[error("listing has no entries ({} prefixes)", .prefixes.len())]
    NoEntries { prefixes: Vec<String>, next_marker: Option<String> },

    /// One side kept a change the other side did not.
    #[error("{} change committed but {} side failed: {source}", .committed, .committed.other())]
    Indeterminate {
        committed: Side,
        #[source]
        source: Box<MirrorError>,
    },
}

/// Local store or remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn other(&self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Local => "local",
            Side::Remote => "remote",
        })
    }
}

impl MirrorError {
    pub fn local(code: i32, message: impl Into<String>) -> Self {
        MirrorError::LocalBackend { code: -code.abs(), message: message.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::local(ENOENT, format!("{} not found", what.into()))
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::local(EEXIST, format!("{} already exists", what.into()))
    }

    pub fn transport(message: impl Into<String>) -> Self {
        MirrorError::RemoteTransport { message: message.into(), timed_out: false }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        MirrorError::RemoteTransport { message: message.into(), timed_out: true }
    }

    /// Wrap a remote failure that happened after the local side committed.
    pub fn after_local_commit(self) -> Self {
        self.after_commit(Side::Local)
    }

    /// Wrap a local failure that happened after the remote applied the change.
    pub fn after_remote_commit(self) -> Self {
        self.after_commit(Side::Remote)
    }

    fn after_commit(self, committed: Side) -> Self {
        match self {
            e @ MirrorError::Indeterminate { .. } => e,
            e => MirrorError::Indeterminate { committed, source: Box::new(e) },
        }
    }

    /// Side that kept the change, for indeterminate outcomes.
    pub fn committed_side(&self) -> Option<Side> {
        match self {
            MirrorError::Indeterminate { committed, .. } => Some(*committed),
            _ => None,
        }
    }

    /// Negative errno-style result code.
    pub fn code(&self) -> i32 {
        match self {
            MirrorError::LocalBackend { code, .. } => *code,
            MirrorError::InvalidRequest(_) | MirrorError::Lifecycle(_) => -EINVAL,
            MirrorError::RemoteTransport { timed_out: true, .. } => -ETIMEDOUT,
            MirrorError::RemoteTransport { .. } => -EIO,
            MirrorError::RemoteProtocol { status, .. } => match status {
                404 => -ENOENT,
                401 | 403 => -EACCES,
                409 => -EEXIST,
                _ => -EIO,
            },
            MirrorError::Parse(_) => -EBADMSG,
            MirrorError::NoEntries { .. } => -ENODATA,
            MirrorError::Indeterminate { .. } => -EREMOTEIO,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == -ENOENT && !matches!(self, MirrorError::Indeterminate { .. })
    }

    pub fn is_no_entries(&self) -> bool {
        matches!(self, MirrorError::NoEntries { .. })
    }

    pub fn is_indeterminate(&self) -> bool {
        matches!(self, MirrorError::Indeterminate { .. })
    }

    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            MirrorError::RemoteTransport { .. } | MirrorError::RemoteProtocol { .. }
        )
    }
}

impl From<std::io::Error> for MirrorError {
    fn from(e: std::io::Error) -> Self {
        let code = match e.kind() {
            std::io::ErrorKind::NotFound => ENOENT,
            std::io::ErrorKind::AlreadyExists => EEXIST,
            std::io::ErrorKind::PermissionDenied => EACCES,
            _ => e.raw_os_error().unwrap_or(EIO),
        };
        MirrorError::local(code, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_negative() {
        let errors = vec![
            MirrorError::not_found("bucket b"),
            MirrorError::InvalidRequest("x".into()),
            MirrorError::transport("refused"),
            MirrorError::timeout("slow"),
            MirrorError::RemoteProtocol { status: 500, code: None, message: "boom".into() },
            MirrorError::Parse("bad".into()),
            MirrorError::NoEntries { prefixes: vec![], next_marker: None },
        ];
        for e in errors {
            assert!(e.code() < 0, "{e} should map to a negative code");
        }
    }

    #[test]
    fn test_remote_status_mapping() {
        let e = MirrorError::RemoteProtocol { status: 404, code: Some("NoSuchBucket".into()), message: "".into() };
        assert_eq!(e.code(), -ENOENT);
        assert!(e.to_string().contains("NoSuchBucket"));
        let e = MirrorError::RemoteProtocol { status: 403, code: None, message: "".into() };
        assert_eq!(e.code(), -EACCES);
    }

    #[test]
    fn test_indeterminate_is_distinct() {
        let e = MirrorError::transport("refused").after_local_commit();
        assert!(e.is_indeterminate());
        assert_eq!(e.code(), -EREMOTEIO);
        assert_ne!(e.code(), MirrorError::transport("refused").code());
        // wrapping twice keeps a single layer
        let again = e.after_local_commit();
        match again {
            MirrorError::Indeterminate { committed, source } => {
                assert_eq!(committed, Side::Local);
                assert!(source.is_remote());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_remote_side_commit() {
        let e = MirrorError::local(125, "if-none-match * failed").after_remote_commit();
        assert!(e.is_indeterminate());
        assert_eq!(e.code(), -EREMOTEIO);
        assert_eq!(e.committed_side(), Some(Side::Remote));
        assert!(e.to_string().starts_with("remote change committed but local side failed"));
        assert_eq!(MirrorError::transport("x").committed_side(), None);
    }

    #[test]
    fn test_io_error_conversion() {
        let e: MirrorError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(e.is_not_found());
        assert_eq!(e.code(), -ENOENT);
    }
}
