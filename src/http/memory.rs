// src/http/memory.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
//! In-process S3-compatible endpoint.
//!
//! `MemoryRemote` implements [`Transport`] by answering path-style S3
//! requests out of a map held in memory. It covers the subset the mirror
//! uses (bucket PUT/GET, object PUT/GET/DELETE, ranged GET) and can inject
//! faults, which makes it the remote of choice for tests and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;

use crate::constants::DEFAULT_STORAGE_CLASS;
use crate::error::{MirrorError, Result};
use crate::http::transport::{Exchange, Headers, HttpRequest, Transport, Verb};
use crate::listing::strip_etag_quotes;

/// Injected failure for requests of a given verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The transport rejects the request outright
    Refuse,
    /// The transport gives up waiting
    Timeout,
    /// The remote answers with this status and an S3 error body
    Status(u16),
    /// Headers arrive with a 200, the body stream then breaks
    BrokenBody,
}

#[derive(Debug, Clone)]
pub struct RemoteObject {
    pub data: Bytes,
    pub etag: String,
    pub owner: String,
    pub storage_class: String,
    pub content_type: Option<String>,
    pub meta: BTreeMap<String, String>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RemoteBucket {
    owner: String,
    objects: BTreeMap<String, RemoteObject>,
}

#[derive(Debug)]
struct State {
    buckets: BTreeMap<String, RemoteBucket>,
    requests: Vec<HttpRequest>,
    faults: HashMap<Verb, Fault>,
    chunk_size: usize,
}

#[derive(Debug, Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

struct Response {
    status: u16,
    headers: Headers,
    body: Bytes,
}

impl Response {
    fn empty(status: u16) -> Self {
        Self { status, headers: Headers::new(), body: Bytes::new() }
    }

    fn xml(status: u16, body: String) -> Self {
        let mut headers = Headers::new();
        headers.insert("content-type".into(), "application/xml".into());
        Self { status, headers, body: Bytes::from(body) }
    }

    fn error(status: u16, code: &str, message: &str, resource: &str) -> Self {
        Self::xml(
            status,
            format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Error><Code>{code}</Code>\
                 <Message>{}</Message><Resource>{}</Resource></Error>",
                escape_xml(message),
                escape_xml(resource)
            ),
        )
    }
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

fn status_code_name(status: u16) -> &'static str {
    match status {
        400 => "InvalidRequest",
        403 => "AccessDenied",
        404 => "NoSuchKey",
        409 => "Conflict",
        412 => "PreconditionFailed",
        503 => "SlowDown",
        _ => "InternalError",
    }
}

/// Access key named in a SigV4 authorization header.
fn caller(request: &HttpRequest) -> String {
    request
        .header("authorization")
        .and_then(|auth| auth.split("Credential=").nth(1))
        .and_then(|rest| rest.split('/').next())
        .filter(|ak| !ak.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

fn parse_range(spec: &str, len: u64) -> Option<(u64, u64)> {
    let spec = spec.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    if len == 0 {
        return None;
    }
    let (start, end) = if start.is_empty() {
        let suffix: u64 = end.parse().ok()?;
        (len.saturating_sub(suffix), len - 1)
    } else {
        let start: u64 = start.parse().ok()?;
        let end = if end.is_empty() { len - 1 } else { end.parse::<u64>().ok()?.min(len - 1) };
        (start, end)
    };
    (start <= end && start < len).then_some((start, end))
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                buckets: BTreeMap::new(),
                requests: Vec::new(),
                faults: HashMap::new(),
                chunk_size: 16 * 1024,
            })),
        }
    }

    /// Deliver response bodies in chunks of at most `size` bytes.
    pub fn with_chunk_size(self, size: usize) -> Self {
        self.lock().chunk_size = size.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // a panicking test thread must not wedge the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail every request of any verb.
    pub fn fail_all(&self, fault: Fault) {
        let mut state = self.lock();
        for verb in [Verb::Put, Verb::Get, Verb::Delete] {
            state.faults.insert(verb, fault);
        }
    }

    pub fn fail_verb(&self, verb: Verb, fault: Fault) {
        self.lock().faults.insert(verb, fault);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Every request the transport accepted or refused, in arrival order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.lock().buckets.contains_key(bucket)
    }

    pub fn create_bucket(&self, bucket: &str, owner: &str) {
        self.lock()
            .buckets
            .entry(bucket.to_string())
            .or_insert_with(|| RemoteBucket { owner: owner.to_string(), ..Default::default() });
    }

    /// Seed an object, creating its bucket if needed.
    pub fn put_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let mut state = self.lock();
        let b = state.buckets.entry(bucket.to_string()).or_default();
        let owner = b.owner.clone();
        b.objects.insert(
            key.to_string(),
            RemoteObject {
                etag: format!("{:x}", md5::compute(&data)),
                data,
                owner,
                storage_class: DEFAULT_STORAGE_CLASS.to_string(),
                content_type: None,
                meta: BTreeMap::new(),
                last_modified: Utc::now(),
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<RemoteObject> {
        self.lock().buckets.get(bucket)?.objects.get(key).cloned()
    }

    pub fn object_keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .buckets
            .get(bucket)
            .map(|b| b.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn handle(state: &mut State, request: &HttpRequest) -> Result<Response> {
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| MirrorError::InvalidRequest(format!("bad url {:?}: {e}", request.url)))?;
        let path = url.path().trim_start_matches('/');
        let (bucket, key) = match path.split_once('/') {
            Some((b, k)) if !k.is_empty() => (decode(b), Some(decode(k))),
            Some((b, _)) => (decode(b), None),
            None => (decode(path), None),
        };
        if bucket.is_empty() {
            return Ok(Response::error(400, "InvalidBucketName", "no bucket in path", "/"));
        }
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();

        Ok(match (request.verb, key) {
            (Verb::Put, None) => Self::put_bucket(state, request, &bucket),
            (Verb::Get, None) => Self::list_bucket(state, &bucket, &query),
            (Verb::Delete, None) => Self::delete_bucket(state, &bucket),
            (Verb::Put, Some(key)) => Self::put_object_request(state, request, &bucket, &key),
            (Verb::Get, Some(key)) => Self::get_object(state, request, &bucket, &key),
            (Verb::Delete, Some(key)) => Self::delete_object(state, &bucket, &key),
        })
    }

    fn put_bucket(state: &mut State, request: &HttpRequest, bucket: &str) -> Response {
        let who = caller(request);
        match state.buckets.get(bucket) {
            Some(b) if b.owner == who => Response::empty(200),
            Some(_) => Response::error(409, "BucketAlreadyExists", "bucket name is taken", bucket),
            None => {
                state.buckets.insert(bucket.to_string(), RemoteBucket { owner: who, ..Default::default() });
                let mut resp = Response::empty(200);
                resp.headers.insert("location".into(), format!("/{bucket}"));
                resp
            }
        }
    }

    fn delete_bucket(state: &mut State, bucket: &str) -> Response {
        match state.buckets.get(bucket) {
            None => Response::error(404, "NoSuchBucket", "bucket does not exist", bucket),
            Some(b) if !b.objects.is_empty() => {
                Response::error(409, "BucketNotEmpty", "bucket is not empty", bucket)
            }
            Some(_) => {
                state.buckets.remove(bucket);
                Response::empty(204)
            }
        }
    }

    fn list_bucket(state: &State, bucket: &str, query: &HashMap<String, String>) -> Response {
        let Some(b) = state.buckets.get(bucket) else {
            return Response::error(404, "NoSuchBucket", "bucket does not exist", bucket);
        };
        let prefix = query.get("prefix").map(String::as_str).unwrap_or("");
        let delimiter = query.get("delimiter").map(String::as_str).unwrap_or("");
        let marker = query.get("marker").map(String::as_str).unwrap_or("");
        let max_keys = query
            .get("max-keys")
            .and_then(|m| m.parse::<usize>().ok())
            .filter(|m| *m > 0)
            .unwrap_or(1000);

        let mut contents: Vec<(&String, &RemoteObject)> = Vec::new();
        let mut prefixes: Vec<String> = Vec::new();
        let mut truncated = false;
        let mut last = String::new();

        for (key, obj) in b.objects.iter() {
            if key.as_str() <= marker || !key.starts_with(prefix) {
                continue;
            }
            let rolled = if delimiter.is_empty() {
                None
            } else {
                key[prefix.len()..]
                    .find(delimiter)
                    .map(|i| key[..prefix.len() + i + delimiter.len()].to_string())
            };
            if let Some(p) = &rolled {
                if p.as_str() <= marker || prefixes.last() == Some(p) {
                    continue;
                }
            }
            if contents.len() + prefixes.len() >= max_keys {
                truncated = true;
                break;
            }
            last = key.clone();
            match rolled {
                Some(p) => {
                    last = p.clone();
                    prefixes.push(p);
                }
                None => contents.push((key, obj)),
            }
        }

        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str("<ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">");
        xml.push_str(&format!("<Name>{}</Name>", escape_xml(bucket)));
        xml.push_str(&format!("<Prefix>{}</Prefix>", escape_xml(prefix)));
        xml.push_str(&format!("<Marker>{}</Marker>", escape_xml(marker)));
        xml.push_str(&format!("<MaxKeys>{max_keys}</MaxKeys>"));
        if !delimiter.is_empty() {
            xml.push_str(&format!("<Delimiter>{}</Delimiter>", escape_xml(delimiter)));
        }
        xml.push_str(&format!("<IsTruncated>{truncated}</IsTruncated>"));
        // like S3, v1 listings name the next marker only when a delimiter was given
        if truncated && !delimiter.is_empty() {
            xml.push_str(&format!("<NextMarker>{}</NextMarker>", escape_xml(&last)));
        }
        for (key, obj) in contents {
            xml.push_str("<Contents>");
            xml.push_str(&format!("<Key>{}</Key>", escape_xml(key)));
            xml.push_str(&format!(
                "<LastModified>{}</LastModified>",
                obj.last_modified.format("%Y-%m-%dT%H:%M:%S%.3fZ")
            ));
            xml.push_str(&format!("<ETag>&quot;{}&quot;</ETag>", obj.etag));
            xml.push_str(&format!("<Size>{}</Size>", obj.data.len()));
            xml.push_str(&format!("<StorageClass>{}</StorageClass>", obj.storage_class));
            xml.push_str(&format!(
                "<Owner><ID>{0}</ID><DisplayName>{0}</DisplayName></Owner>",
                escape_xml(&obj.owner)
            ));
            xml.push_str("</Contents>");
        }
        for p in prefixes {
            xml.push_str(&format!("<CommonPrefixes><Prefix>{}</Prefix></CommonPrefixes>", escape_xml(&p)));
        }
        xml.push_str("</ListBucketResult>");
        Response::xml(200, xml)
    }

    fn put_object_request(state: &mut State, request: &HttpRequest, bucket: &str, key: &str) -> Response {
        let who = caller(request);
        let Some(b) = state.buckets.get_mut(bucket) else {
            return Response::error(404, "NoSuchBucket", "bucket does not exist", bucket);
        };
        if let Some(declared) = request.header("content-length").and_then(|l| l.parse::<usize>().ok()) {
            if declared != request.body.len() {
                return Response::error(400, "IncompleteBody", "body does not match content-length", key);
            }
        }
        let current = b.objects.get(key).map(|o| o.etag.as_str());
        if let Some(want) = request.header("if-match").map(strip_etag_quotes) {
            if current.is_none() || (want != "*" && current != Some(want.as_str())) {
                return Response::error(412, "PreconditionFailed", "if-match did not hold", key);
            }
        }
        if let Some(avoid) = request.header("if-none-match").map(strip_etag_quotes) {
            if current.is_some() && (avoid == "*" || current == Some(avoid.as_str())) {
                return Response::error(412, "PreconditionFailed", "if-none-match did not hold", key);
            }
        }
        let meta = request
            .headers
            .iter()
            .filter_map(|(k, v)| k.strip_prefix("x-amz-meta-").map(|m| (m.to_string(), v.clone())))
            .collect();
        let etag = format!("{:x}", md5::compute(&request.body));
        b.objects.insert(
            key.to_string(),
            RemoteObject {
                data: request.body.clone(),
                etag: etag.clone(),
                owner: who,
                storage_class: request
                    .header("x-amz-storage-class")
                    .unwrap_or(DEFAULT_STORAGE_CLASS)
                    .to_string(),
                content_type: request.header("content-type").map(str::to_string),
                meta,
                last_modified: Utc::now(),
            },
        );
        let mut resp = Response::empty(200);
        resp.headers.insert("etag".into(), format!("\"{etag}\""));
        resp
    }

    fn get_object(state: &State, request: &HttpRequest, bucket: &str, key: &str) -> Response {
        let Some(b) = state.buckets.get(bucket) else {
            return Response::error(404, "NoSuchBucket", "bucket does not exist", bucket);
        };
        let Some(obj) = b.objects.get(key) else {
            return Response::error(404, "NoSuchKey", "key does not exist", key);
        };
        let len = obj.data.len() as u64;

        let (status, body, range) = match request.header("range") {
            Some(spec) => match parse_range(spec, len) {
                Some((start, end)) => (206, obj.data.slice(start as usize..=end as usize), Some((start, end))),
                None => {
                    return Response::error(416, "InvalidRange", "range not satisfiable", key);
                }
            },
            None => (200, obj.data.clone(), None),
        };

        let mut headers = Headers::new();
        headers.insert("etag".into(), format!("\"{}\"", obj.etag));
        headers.insert("content-length".into(), body.len().to_string());
        headers.insert("last-modified".into(), obj.last_modified.to_rfc2822());
        // S3 leaves the header out for STANDARD
        if obj.storage_class != DEFAULT_STORAGE_CLASS {
            headers.insert("x-amz-storage-class".into(), obj.storage_class.clone());
        }
        if let Some(ct) = &obj.content_type {
            headers.insert("content-type".into(), ct.clone());
        }
        for (k, v) in &obj.meta {
            headers.insert(format!("x-amz-meta-{k}"), v.clone());
        }
        if let Some((start, end)) = range {
            headers.insert("content-range".into(), format!("bytes {start}-{end}/{len}"));
        }
        Response { status, headers, body }
    }

    fn delete_object(state: &mut State, bucket: &str, key: &str) -> Response {
        let Some(b) = state.buckets.get_mut(bucket) else {
            return Response::error(404, "NoSuchBucket", "bucket does not exist", bucket);
        };
        b.objects.remove(key);
        Response::empty(204)
    }
}

#[async_trait]
impl Transport for MemoryRemote {
    async fn send(&self, request: HttpRequest) -> Result<Box<dyn Exchange>> {
        let mut state = self.lock();
        state.requests.push(request.clone());
        let chunk_size = state.chunk_size;

        let resp = match state.faults.get(&request.verb).copied() {
            Some(Fault::Refuse) => return Err(MirrorError::transport("connection refused")),
            Some(Fault::Timeout) => return Err(MirrorError::timeout("operation timed out")),
            Some(Fault::Status(status)) => {
                Response::error(status, status_code_name(status), "injected failure", &request.url)
            }
            Some(Fault::BrokenBody) => {
                return Ok(Box::new(MemoryExchange {
                    status: 200,
                    headers: Headers::new(),
                    body: Bytes::from_static(b"partial"),
                    chunk_size,
                    broken: true,
                }));
            }
            None => Self::handle(&mut state, &request)?,
        };

        Ok(Box::new(MemoryExchange {
            status: resp.status,
            headers: resp.headers,
            body: resp.body,
            chunk_size,
            broken: false,
        }))
    }
}

struct MemoryExchange {
    status: u16,
    headers: Headers,
    body: Bytes,
    chunk_size: usize,
    broken: bool,
}

#[async_trait]
impl Exchange for MemoryExchange {
    fn status(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    async fn chunk(&mut self) -> Result<Option<Bytes>> {
        if self.body.is_empty() {
            if self.broken {
                return Err(MirrorError::transport("connection reset while reading body"));
            }
            return Ok(None);
        }
        let n = self.chunk_size.min(self.body.len());
        Ok(Some(self.body.split_to(n)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(verb: Verb, path: &str, body: &'static [u8]) -> HttpRequest {
        HttpRequest {
            verb,
            url: format!("http://remote.test{path}"),
            headers: Headers::new(),
            body: Bytes::from_static(body),
        }
    }

    async fn body_of(ex: &mut Box<dyn Exchange>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(c) = ex.chunk().await.unwrap() {
            out.extend_from_slice(&c);
        }
        out
    }

    #[tokio::test]
    async fn test_put_get_roundtrip_with_range() {
        let remote = MemoryRemote::new().with_chunk_size(3);
        assert_eq!(remote.send(req(Verb::Put, "/b", b"")).await.unwrap().status(), 200);
        let ex = remote.send(req(Verb::Put, "/b/dir/k%201", b"hello world")).await.unwrap();
        assert_eq!(ex.status(), 200);
        assert_eq!(ex.headers()["etag"], format!("\"{:x}\"", md5::compute(b"hello world")));

        let mut get = req(Verb::Get, "/b/dir/k%201", b"");
        get.set_header("Range", "bytes=6-10");
        let mut ex = remote.send(get).await.unwrap();
        assert_eq!(ex.status(), 206);
        assert_eq!(body_of(&mut ex).await, b"world");
        assert!(remote.object("b", "dir/k 1").is_some());
    }

    #[tokio::test]
    async fn test_missing_bucket_is_404() {
        let remote = MemoryRemote::new();
        let mut ex = remote.send(req(Verb::Put, "/nope/k", b"x")).await.unwrap();
        assert_eq!(ex.status(), 404);
        let body = String::from_utf8(body_of(&mut ex).await).unwrap();
        assert!(body.contains("<Code>NoSuchBucket</Code>"));
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let remote = MemoryRemote::new();
        remote.put_object("b", "k", "first");
        let etag = remote.object("b", "k").unwrap().etag;

        let mut put = req(Verb::Put, "/b/k", b"second");
        put.set_header("If-None-Match", "*");
        let mut ex = remote.send(put).await.unwrap();
        assert_eq!(ex.status(), 412);
        assert!(String::from_utf8(body_of(&mut ex).await).unwrap().contains("PreconditionFailed"));

        let mut put = req(Verb::Put, "/b/k", b"second");
        put.set_header("If-Match", format!("\"{etag}\""));
        assert_eq!(remote.send(put).await.unwrap().status(), 200);
        assert_eq!(remote.object("b", "k").unwrap().data.as_ref(), b"second");

        let mut put = req(Verb::Put, "/b/new", b"x");
        put.set_header("If-Match", "*");
        assert_eq!(remote.send(put).await.unwrap().status(), 412);
        assert!(remote.object("b", "new").is_none());
    }

    #[tokio::test]
    async fn test_listing_with_delimiter() {
        let remote = MemoryRemote::new();
        remote.put_object("b", "a.txt", "1");
        remote.put_object("b", "logs/x", "22");
        remote.put_object("b", "logs/y", "333");
        let mut ex = remote.send(req(Verb::Get, "/b?delimiter=%2F", b"")).await.unwrap();
        let body = String::from_utf8(body_of(&mut ex).await).unwrap();
        assert!(body.contains("<Key>a.txt</Key>"));
        assert!(!body.contains("<Key>logs/x</Key>"));
        assert_eq!(body.matches("<CommonPrefixes>").count(), 1);
    }

    #[tokio::test]
    async fn test_faults() {
        let remote = MemoryRemote::new();
        remote.fail_verb(Verb::Get, Fault::Refuse);
        assert!(remote.send(req(Verb::Get, "/b", b"")).await.is_err());
        assert!(remote.send(req(Verb::Put, "/b", b"")).await.is_ok());
        remote.fail_all(Fault::Status(503));
        assert_eq!(remote.send(req(Verb::Delete, "/b/k", b"")).await.unwrap().status(), 503);
        remote.clear_faults();
        assert_eq!(remote.send(req(Verb::Delete, "/b/k", b"")).await.unwrap().status(), 204);
        assert_eq!(remote.request_count(), 4);
    }

    #[test]
    fn test_range_parsing() {
        assert_eq!(parse_range("bytes=0-4", 10), Some((0, 4)));
        assert_eq!(parse_range("bytes=5-", 10), Some((5, 9)));
        assert_eq!(parse_range("bytes=-3", 10), Some((7, 9)));
        assert_eq!(parse_range("bytes=4-100", 10), Some((4, 9)));
        assert_eq!(parse_range("bytes=10-12", 10), None);
    }
}
