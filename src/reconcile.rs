// src/reconcile.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
//! Bring remote-derived state into local form.
//!
//! Listings become bucket stats, bucket attributes and list results;
//! response headers become object attributes; object attributes become
//! outgoing request headers; writer completion becomes head-object metadata.

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use tracing::debug;

use crate::constants::{
    ATTR_ACCOUNTED_SIZE, ATTR_CONTENT_TYPE, ATTR_ETAG, ATTR_META_PREFIX, ATTR_MTIME,
    ATTR_OBJECT_SIZE, ATTR_STORAGE_CLASS, ATTR_VERSION_ID, DEFAULT_STORAGE_CLASS,
};
use crate::http::transport::{Headers, header_value};
use crate::listing::{Listing, strip_etag_quotes};
use crate::sal::{Attrs, Bucket, BucketStats, CompleteParams, ListResults, ObjKey};

const META_HEADER_PREFIX: &str = "x-amz-meta-";

/// Record a non-empty listing on `bucket`: `totals` cover every page of the
/// remote bucket, etag and storage class come from the first entry.
pub fn apply_listing_to_bucket(bucket: &mut dyn Bucket, listing: &Listing, totals: BucketStats) {
    let Some(first) = listing.entries.first() else {
        return;
    };

    bucket.set_stats(totals);

    let mut attrs = bucket.attrs().clone();
    attrs.insert(ATTR_ETAG.to_string(), Bytes::from(first.etag.clone()));
    let class = if first.storage_class.is_empty() {
        DEFAULT_STORAGE_CLASS
    } else {
        first.storage_class.as_str()
    };
    attrs.insert(ATTR_STORAGE_CLASS.to_string(), Bytes::copy_from_slice(class.as_bytes()));
    bucket.set_attrs(attrs);

    debug!(
        "bucket {}: {} objects, {} bytes, first etag {}",
        bucket.key(),
        totals.count,
        totals.size,
        first.etag
    );
}

pub fn listing_to_results(listing: Listing) -> ListResults {
    ListResults {
        objs: listing.entries,
        common_prefixes: listing.common_prefixes,
        is_truncated: listing.is_truncated,
        next_marker: listing.next_marker,
    }
}

/// Results for a listing that held only common prefixes.
pub fn prefixes_to_results(prefixes: Vec<String>, next_marker: Option<String>) -> ListResults {
    ListResults {
        common_prefixes: prefixes,
        is_truncated: next_marker.is_some(),
        next_marker,
        ..Default::default()
    }
}

/// Fold object response headers into `attrs`.
pub fn merge_response_headers(attrs: &mut Attrs, headers: &Headers) {
    if let Some(etag) = header_value(headers, "etag") {
        attrs.insert(ATTR_ETAG.to_string(), Bytes::from(strip_etag_quotes(etag)));
    }
    let class = header_value(headers, "x-amz-storage-class").unwrap_or(DEFAULT_STORAGE_CLASS);
    attrs.insert(ATTR_STORAGE_CLASS.to_string(), Bytes::copy_from_slice(class.as_bytes()));
    if let Some(ct) = header_value(headers, "content-type") {
        attrs.insert(ATTR_CONTENT_TYPE.to_string(), Bytes::copy_from_slice(ct.as_bytes()));
    }
    for (name, value) in headers {
        if let Some(meta) = name.strip_prefix(META_HEADER_PREFIX) {
            attrs.insert(format!("{ATTR_META_PREFIX}{meta}"), Bytes::copy_from_slice(value.as_bytes()));
        }
    }
}

/// Outgoing headers for the attributes a PUT carries to the remote: user
/// metadata, content type and storage class. Values that are not valid
/// UTF-8 are left out.
pub fn attrs_to_request_headers(attrs: &Attrs) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in attrs {
        let header = if let Some(meta) = name.strip_prefix(ATTR_META_PREFIX) {
            format!("{META_HEADER_PREFIX}{}", meta.to_ascii_lowercase())
        } else if name == ATTR_CONTENT_TYPE {
            "content-type".to_string()
        } else if name == ATTR_STORAGE_CLASS {
            "x-amz-storage-class".to_string()
        } else {
            continue;
        };
        match std::str::from_utf8(value) {
            Ok(v) => {
                headers.insert(header, v.trim().to_string());
            }
            Err(_) => debug!("skipping non-text attribute {name}"),
        }
    }
    headers
}

/// Metadata recorded on the head object once an upload completed on both
/// sides. The caller's etag wins over the one the remote reported.
pub fn completion_attrs(
    key: &ObjKey,
    params: &CompleteParams,
    object_size: u64,
    remote_etag: Option<&str>,
) -> Attrs {
    let mut attrs = Attrs::new();
    let etag = if params.etag.is_empty() {
        remote_etag.map(strip_etag_quotes).unwrap_or_default()
    } else {
        params.etag.clone()
    };
    attrs.insert(ATTR_ETAG.to_string(), Bytes::from(etag));

    let mtime = params.mtime.unwrap_or_else(Utc::now);
    attrs.insert(
        ATTR_MTIME.to_string(),
        Bytes::from(mtime.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    attrs.insert(ATTR_OBJECT_SIZE.to_string(), Bytes::from(object_size.to_string()));
    attrs.insert(ATTR_ACCOUNTED_SIZE.to_string(), Bytes::from(params.accounted_size.to_string()));
    if key.has_instance() {
        attrs.insert(ATTR_VERSION_ID.to_string(), Bytes::from(key.instance.clone()));
    }
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_response_headers_to_attrs() {
        let mut attrs = Attrs::new();
        merge_response_headers(
            &mut attrs,
            &headers(&[("etag", "\"abc\""), ("x-amz-meta-color", "blue"), ("content-type", "text/plain")]),
        );
        assert_eq!(attrs[ATTR_ETAG].as_ref(), b"abc");
        assert_eq!(attrs[ATTR_STORAGE_CLASS].as_ref(), b"STANDARD");
        assert_eq!(attrs["user.rgw.x-amz-meta-color"].as_ref(), b"blue");
        assert_eq!(attrs[ATTR_CONTENT_TYPE].as_ref(), b"text/plain");
    }

    #[test]
    fn test_attrs_to_headers_selects_mirrored_names() {
        let mut attrs = Attrs::new();
        attrs.insert("user.rgw.x-amz-meta-Color".into(), Bytes::from_static(b"blue"));
        attrs.insert(ATTR_CONTENT_TYPE.into(), Bytes::from_static(b"image/png"));
        attrs.insert(ATTR_STORAGE_CLASS.into(), Bytes::from_static(b"GLACIER"));
        attrs.insert("user.rgw.acl".into(), Bytes::from_static(b"private"));
        attrs.insert("user.rgw.x-amz-meta-raw".into(), Bytes::from_static(&[0xff, 0xfe]));
        let h = attrs_to_request_headers(&attrs);
        assert_eq!(h.len(), 3);
        assert_eq!(h["x-amz-meta-color"], "blue");
        assert_eq!(h["content-type"], "image/png");
        assert_eq!(h["x-amz-storage-class"], "GLACIER");
    }

    #[test]
    fn test_completion_attrs() {
        let params = CompleteParams {
            accounted_size: 4,
            mtime: Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()),
            ..Default::default()
        };
        let attrs = completion_attrs(&ObjKey::with_instance("k", "v7"), &params, 4, Some("\"e1\""));
        assert_eq!(attrs[ATTR_ETAG].as_ref(), b"e1");
        assert_eq!(attrs[ATTR_MTIME].as_ref(), b"2024-01-02T03:04:05.000Z");
        assert_eq!(attrs[ATTR_OBJECT_SIZE].as_ref(), b"4");
        assert_eq!(attrs[ATTR_VERSION_ID].as_ref(), b"v7");

        let attrs = completion_attrs(&ObjKey::new("k"), &CompleteParams { etag: "mine".into(), ..Default::default() }, 0, Some("x"));
        assert_eq!(attrs[ATTR_ETAG].as_ref(), b"mine");
        assert!(!attrs.contains_key(ATTR_VERSION_ID));
    }
}
