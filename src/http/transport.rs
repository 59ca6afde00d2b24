// src/http/transport.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
//! Transport seam between mirror requests and the wire.
//!
//! A [`Transport`] accepts one fully built request and hands back an
//! [`Exchange`]: status and headers are known as soon as the transport has
//! accepted the request, the body is pulled chunk by chunk afterwards.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Header map with lower-cased names.
pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Put,
    Get,
    Delete,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Put => "PUT",
            Verb::Get => "GET",
            Verb::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub verb: Verb,
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Dispatch `request`. Fails only when the transport cannot deliver it
    /// (connection refused, DNS failure, TLS failure...).
    async fn send(&self, request: HttpRequest) -> Result<Box<dyn Exchange>>;
}

#[async_trait]
pub trait Exchange: Send {
    fn status(&self) -> u16;

    fn headers(&self) -> &Headers;

    /// Next body chunk, `None` once the body is complete.
    async fn chunk(&mut self) -> Result<Option<Bytes>>;
}

pub fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers.get(&name.to_ascii_lowercase()).map(String::as_str)
}
