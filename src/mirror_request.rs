// src/mirror_request.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
//! One outbound exchange with the remote endpoint.
//!
//! A [`MirrorRequest`] moves through `Created → Initialized → Sent →
//! Completed`. Any failing phase leaves it `Failed`, after which every
//! further phase is refused with [`MirrorError::Lifecycle`].

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::debug;

use crate::config::Credentials;
use crate::error::{MirrorError, Result};
use crate::http::sigv4::sign_request;
use crate::http::transport::{Exchange, Headers, HttpRequest, Transport, Verb};
use crate::listing::first_tag_value;
use crate::reconcile::attrs_to_request_headers;
use crate::sal::Attrs;
use crate::sink::{BufferSink, DataSink};

/// RFC 3986 unreserved characters stay literal.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// Object keys keep their `/` separators.
const KEY_PATH: &AsciiSet = &COMPONENT.remove(b'/');

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Initialized,
    Sent,
    Completed,
    Failed,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Bucket, optional object key and query of a path-style remote URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteTarget {
    pub bucket: String,
    pub key: Option<String>,
    pub query: Vec<(String, String)>,
}

impl RemoteTarget {
    pub fn bucket(bucket: impl Into<String>) -> Self {
        Self { bucket: bucket.into(), ..Default::default() }
    }

    pub fn object(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self { bucket: bucket.into(), key: Some(key.into()), query: Vec::new() }
    }

    /// Add a query parameter; empty values are skipped.
    pub fn with_query(mut self, name: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.query.push((name.to_string(), value));
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(MirrorError::InvalidRequest("empty bucket name".into()));
        }
        if self.bucket.contains('/') {
            return Err(MirrorError::InvalidRequest(format!(
                "bucket name {:?} contains '/'",
                self.bucket
            )));
        }
        if matches!(&self.key, Some(k) if k.is_empty()) {
            return Err(MirrorError::InvalidRequest(format!(
                "empty object key in bucket {}",
                self.bucket
            )));
        }
        Ok(())
    }

    /// `{base}/{bucket}[/{key}][?query]`, percent-encoded.
    pub fn url(&self, base: &str) -> String {
        let mut url = format!(
            "{}/{}",
            base.trim_end_matches('/'),
            utf8_percent_encode(&self.bucket, COMPONENT)
        );
        if let Some(key) = &self.key {
            url.push('/');
            url.push_str(&utf8_percent_encode(key, KEY_PATH).to_string());
        }
        if !self.query.is_empty() {
            let query = self
                .query
                .iter()
                .map(|(k, v)| format!("{}={}", utf8_percent_encode(k, COMPONENT), utf8_percent_encode(v, COMPONENT)))
                .collect::<Vec<_>>()
                .join("&");
            url.push('?');
            url.push_str(&query);
        }
        url
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{}/{}", self.bucket, key),
            None => f.write_str(&self.bucket),
        }
    }
}

pub struct MirrorRequest {
    transport: Arc<dyn Transport>,
    endpoint: String,
    region: String,
    sign: bool,

    state: RequestState,
    verb: Verb,
    target: RemoteTarget,
    credentials: Option<Credentials>,
    headers: Headers,
    body: Bytes,
    content_length: Option<u64>,

    exchange: Option<Box<dyn Exchange>>,
    status: Option<u16>,
    response_headers: Headers,
}

impl fmt::Debug for MirrorRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorRequest")
            .field("state", &self.state)
            .field("verb", &self.verb)
            .field("target", &self.target)
            .field("status", &self.status)
            .finish()
    }
}

impl MirrorRequest {
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoint: impl Into<String>,
        region: impl Into<String>,
        sign: bool,
    ) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            region: region.into(),
            sign,
            state: RequestState::Created,
            verb: Verb::Get,
            target: RemoteTarget::default(),
            credentials: None,
            headers: Headers::new(),
            body: Bytes::new(),
            content_length: None,
            exchange: None,
            status: None,
            response_headers: Headers::new(),
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    /// HTTP status of the response, once sent.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn response_headers(&self) -> &Headers {
        &self.response_headers
    }

    fn expect_state(&self, expected: RequestState, phase: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(MirrorError::Lifecycle(format!(
                "{phase} on {} {} request in state {}",
                self.verb, self.target, self.state
            )))
        }
    }

    fn fail(&mut self, err: MirrorError) -> MirrorError {
        debug!("{} {} failed: {}", self.verb, self.target, err);
        self.state = RequestState::Failed;
        self.exchange = None;
        err
    }

    /// Record the exchange parameters. No I/O.
    ///
    /// For PUT, the mirrored attributes in `attrs` become request headers;
    /// explicit `headers` take precedence over them.
    pub fn init(
        &mut self,
        verb: Verb,
        target: RemoteTarget,
        credentials: &Credentials,
        headers: Headers,
        attrs: Option<&Attrs>,
    ) -> Result<()> {
        self.expect_state(RequestState::Created, "init")?;
        self.verb = verb;
        self.target = target;

        if let Err(e) = self.target.validate().and_then(|_| credentials.validate()) {
            return Err(self.fail(e));
        }

        let mut all = match (verb, attrs) {
            (Verb::Put, Some(attrs)) => attrs_to_request_headers(attrs),
            _ => Headers::new(),
        };
        for (k, v) in headers {
            all.insert(k.to_ascii_lowercase(), v);
        }

        self.credentials = Some(credentials.clone());
        self.headers = all;
        self.state = RequestState::Initialized;
        debug!("init {} {}", self.verb, self.target);
        Ok(())
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        self.expect_state(RequestState::Initialized, "set_header")?;
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        Ok(())
    }

    /// Declared payload length; must match the body at send time.
    pub fn set_content_length(&mut self, len: u64) -> Result<()> {
        self.expect_state(RequestState::Initialized, "set_content_length")?;
        self.content_length = Some(len);
        Ok(())
    }

    pub fn set_body(&mut self, body: Bytes) -> Result<()> {
        self.expect_state(RequestState::Initialized, "set_body")?;
        self.body = body;
        Ok(())
    }

    fn build(&self) -> Result<HttpRequest> {
        let len = self.content_length.unwrap_or(self.body.len() as u64);
        if len != self.body.len() as u64 {
            return Err(MirrorError::InvalidRequest(format!(
                "declared content-length {} but body has {} bytes",
                len,
                self.body.len()
            )));
        }

        let mut request = HttpRequest {
            verb: self.verb,
            url: self.target.url(&self.endpoint),
            headers: self.headers.clone(),
            body: self.body.clone(),
        };
        if self.verb == Verb::Put || len > 0 {
            request.set_header("content-length", len.to_string());
        }
        if self.sign {
            let credentials = self
                .credentials
                .as_ref()
                .ok_or_else(|| MirrorError::Lifecycle("send without credentials".into()))?;
            sign_request(&mut request, credentials, &self.region, Utc::now())?;
        }
        Ok(request)
    }

    /// Hand the request to the transport. A rejection leaves the request
    /// `Failed`; a response of any status leaves it `Sent`.
    pub async fn send(&mut self) -> Result<()> {
        self.expect_state(RequestState::Initialized, "send")?;

        let request = match self.build() {
            Ok(r) => r,
            Err(e) => return Err(self.fail(e)),
        };
        debug!("send {} {} ({} bytes)", self.verb, request.url, request.body.len());

        match self.transport.send(request).await {
            Ok(exchange) => {
                self.status = Some(exchange.status());
                self.response_headers = exchange.headers().clone();
                self.exchange = Some(exchange);
                self.state = RequestState::Sent;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Drain the response. Success bodies stream into `sink` in order with
    /// running offsets; error bodies are collected and turned into
    /// [`MirrorError::RemoteProtocol`].
    pub async fn complete(&mut self, sink: &mut dyn DataSink) -> Result<()> {
        self.expect_state(RequestState::Sent, "complete")?;
        let Some(mut exchange) = self.exchange.take() else {
            return Err(self.fail(MirrorError::Lifecycle("sent request has no exchange".into())));
        };
        let status = exchange.status();

        if (200..300).contains(&status) {
            let mut ofs = 0u64;
            loop {
                match exchange.chunk().await {
                    Ok(Some(chunk)) => {
                        if let Err(e) = sink.handle_data(&chunk, ofs) {
                            return Err(self.fail(e));
                        }
                        ofs += chunk.len() as u64;
                    }
                    Ok(None) => break,
                    Err(e) => return Err(self.fail(e)),
                }
            }
            self.state = RequestState::Completed;
            debug!("complete {} {}: HTTP {} ({} bytes)", self.verb, self.target, status, ofs);
            return Ok(());
        }

        let mut body = BufferSink::new();
        while let Ok(Some(chunk)) = exchange.chunk().await {
            body.extend(&chunk);
        }
        let text = body.to_text();
        let code = first_tag_value(&text, "Code").map(str::to_string);
        let message = first_tag_value(&text, "Message")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} {} rejected", self.verb, self.target));
        Err(self.fail(MirrorError::RemoteProtocol { status, code, message }))
    }

    /// `send` then `complete`.
    pub async fn execute(&mut self, sink: &mut dyn DataSink) -> Result<()> {
        self.send().await?;
        self.complete(sink).await
    }

    /// Give up on a request that has not reached a terminal state.
    pub fn abort(&mut self) {
        if !self.state.is_terminal() {
            debug!("abort {} {} in state {}", self.verb, self.target, self.state);
            self.state = RequestState::Failed;
            self.exchange = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::memory::{Fault, MemoryRemote};

    fn request(remote: &MemoryRemote) -> MirrorRequest {
        MirrorRequest::new(Arc::new(remote.clone()), "http://remote.test", "us-east-1", true)
    }

    #[test]
    fn test_target_urls() {
        let t = RemoteTarget::object("photos", "2024/a b+c.jpg");
        assert_eq!(t.url("http://h:8000/"), "http://h:8000/photos/2024/a%20b%2Bc.jpg");
        let t = RemoteTarget::bucket("photos").with_query("prefix", "a/").with_query("marker", "");
        assert_eq!(t.url("http://h"), "http://h/photos?prefix=a%2F");
    }

    #[test]
    fn test_target_validation() {
        assert!(RemoteTarget::bucket("").validate().is_err());
        assert!(RemoteTarget::bucket("a/b").validate().is_err());
        assert!(RemoteTarget::object("a", "").validate().is_err());
        assert!(RemoteTarget::object("a", "k").validate().is_ok());
    }

    #[tokio::test]
    async fn test_init_rejects_bad_credentials() {
        let remote = MemoryRemote::new();
        let mut req = request(&remote);
        let err = req
            .init(Verb::Get, RemoteTarget::bucket("b"), &Credentials::new("", "s"), Headers::new(), None)
            .unwrap_err();
        assert!(matches!(err, MirrorError::InvalidRequest(_)));
        assert_eq!(req.state(), RequestState::Failed);
        assert!(matches!(req.send().await, Err(MirrorError::Lifecycle(_))));
        assert_eq!(remote.request_count(), 0);
    }

    #[tokio::test]
    async fn test_phases_out_of_order() {
        let remote = MemoryRemote::new();
        let mut req = request(&remote);
        let mut sink = BufferSink::new();
        assert!(matches!(req.send().await, Err(MirrorError::Lifecycle(_))));
        assert!(matches!(req.complete(&mut sink).await, Err(MirrorError::Lifecycle(_))));
        // refusals before init do not poison the request
        assert_eq!(req.state(), RequestState::Created);
    }

    #[tokio::test]
    async fn test_put_then_get_streams_in_order() {
        let remote = MemoryRemote::new().with_chunk_size(2);
        remote.create_bucket("b", "AK");
        let creds = Credentials::new("AK", "SK");

        let mut put = request(&remote);
        put.init(Verb::Put, RemoteTarget::object("b", "k"), &creds, Headers::new(), None).unwrap();
        put.set_content_length(5).unwrap();
        put.set_body(Bytes::from_static(b"hello")).unwrap();
        put.execute(&mut BufferSink::new()).await.unwrap();
        assert_eq!(put.state(), RequestState::Completed);
        assert_eq!(put.status(), Some(200));

        let sent = &remote.requests()[0];
        assert_eq!(sent.header("content-length"), Some("5"));
        assert!(sent.header("authorization").unwrap().contains("Credential=AK/"));

        struct Offsets(Vec<(u64, Vec<u8>)>);
        impl DataSink for Offsets {
            fn handle_data(&mut self, data: &[u8], ofs: u64) -> Result<()> {
                self.0.push((ofs, data.to_vec()));
                Ok(())
            }
        }
        let mut get = request(&remote);
        get.init(Verb::Get, RemoteTarget::object("b", "k"), &creds, Headers::new(), None).unwrap();
        let mut offsets = Offsets(Vec::new());
        get.execute(&mut offsets).await.unwrap();
        assert_eq!(
            offsets.0,
            vec![(0, b"he".to_vec()), (2, b"ll".to_vec()), (4, b"o".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_error_status_becomes_protocol_error() {
        let remote = MemoryRemote::new();
        let mut req = request(&remote);
        req.init(Verb::Get, RemoteTarget::object("missing", "k"), &Credentials::placeholder(), Headers::new(), None)
            .unwrap();
        req.send().await.unwrap();
        assert_eq!(req.status(), Some(404));
        match req.complete(&mut BufferSink::new()).await {
            Err(MirrorError::RemoteProtocol { status: 404, code, .. }) => {
                assert_eq!(code.as_deref(), Some("NoSuchBucket"))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(req.state(), RequestState::Failed);
    }

    #[tokio::test]
    async fn test_refused_send_fails_request() {
        let remote = MemoryRemote::new();
        remote.fail_all(Fault::Refuse);
        let mut req = request(&remote);
        req.init(Verb::Delete, RemoteTarget::object("b", "k"), &Credentials::placeholder(), Headers::new(), None)
            .unwrap();
        let err = req.send().await.unwrap_err();
        assert!(matches!(err, MirrorError::RemoteTransport { .. }));
        assert_eq!(req.state(), RequestState::Failed);
        assert!(matches!(req.complete(&mut BufferSink::new()).await, Err(MirrorError::Lifecycle(_))));
    }

    #[tokio::test]
    async fn test_length_mismatch_is_rejected_before_io() {
        let remote = MemoryRemote::new();
        let mut req = request(&remote);
        req.init(Verb::Put, RemoteTarget::object("b", "k"), &Credentials::placeholder(), Headers::new(), None)
            .unwrap();
        req.set_content_length(10).unwrap();
        req.set_body(Bytes::from_static(b"abc")).unwrap();
        assert!(matches!(req.send().await, Err(MirrorError::InvalidRequest(_))));
        assert_eq!(remote.request_count(), 0);
    }

    #[tokio::test]
    async fn test_abort() {
        let remote = MemoryRemote::new();
        let mut req = request(&remote);
        req.init(Verb::Get, RemoteTarget::bucket("b"), &Credentials::placeholder(), Headers::new(), None)
            .unwrap();
        req.abort();
        assert_eq!(req.state(), RequestState::Failed);
        assert!(req.send().await.is_err());
    }

    #[tokio::test]
    async fn test_put_attrs_become_headers() {
        let remote = MemoryRemote::new();
        remote.create_bucket("b", "anonymous");
        let mut attrs = Attrs::new();
        attrs.insert("user.rgw.x-amz-meta-color".into(), Bytes::from_static(b"red"));
        let mut req = MirrorRequest::new(Arc::new(remote.clone()), "http://remote.test", "us-east-1", false);
        req.init(Verb::Put, RemoteTarget::object("b", "k"), &Credentials::placeholder(), Headers::new(), Some(&attrs))
            .unwrap();
        req.execute(&mut BufferSink::new()).await.unwrap();
        let obj = remote.object("b", "k").unwrap();
        assert_eq!(obj.meta.get("color").map(String::as_str), Some("red"));
        assert!(remote.requests()[0].header("authorization").is_none());
    }
}
