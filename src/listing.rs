// src/listing.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
//! Remote bucket listing parser.
//!
//! The remote answers a bucket GET with S3 `ListBucketResult` markup. We do
//! not need a full XML parser: every field we care about is a leaf element,
//! so each tag is pulled out by its open/close delimiters and the per-tag
//! lists are aligned by position (the n-th `<Key>` goes with the n-th
//! `<Size>`, `<ETag>` and so on).

use chrono::{DateTime, Utc};

use crate::error::{MirrorError, Result};

/// Metadata for one object found in a remote listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirEntry {
    pub key: String,
    /// Without surrounding quote markers
    pub etag: String,
    pub owner: String,
    pub size: u64,
    pub accounted_size: u64,
    /// As sent by the remote
    pub last_modified: String,
    pub mtime: Option<DateTime<Utc>>,
    pub storage_class: String,
    pub exists: bool,
}

/// A parsed listing with at least one object entry.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    /// `<Name>` of the listed bucket, when present
    pub bucket: Option<String>,
    pub entries: Vec<DirEntry>,
    /// Key text exactly as it appeared in the body, parallel to `entries`
    pub keys: Vec<String>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    /// `NextMarker`, or `NextContinuationToken` for v2 listings
    pub next_marker: Option<String>,
}

impl Listing {
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// All values of `<tag>…</tag>` in document order.
pub fn extract_tag_values<'a>(body: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut pos = 0;
    while let Some(start) = body[pos..].find(&open) {
        let value_start = pos + start + open.len();
        match body[value_start..].find(&close) {
            Some(len) => {
                out.push(&body[value_start..value_start + len]);
                pos = value_start + len + close.len();
            }
            None => break,
        }
    }
    out
}

/// First value of `<tag>…</tag>`, if any.
pub fn first_tag_value<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let len = body[start..].find(&close)?;
    Some(&body[start..start + len])
}

/// Remove the quoting an ETag carries on the wire: `&quot;…&quot;`,
/// `&#34;…&#34;` or plain `"…"`.
pub fn strip_etag_quotes(raw: &str) -> String {
    let mut s = raw.trim();
    for marker in ["&quot;", "&#34;", "\""] {
        if let Some(inner) = s.strip_prefix(marker).and_then(|r| r.strip_suffix(marker)) {
            s = inner;
            break;
        }
    }
    s.to_string()
}

/// Undo the five predefined XML entity escapes.
pub fn unescape_xml(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Common prefixes of a listing. Prefixes inside `<CommonPrefixes>` blocks
/// are preferred; without such blocks every non-empty `<Prefix>` counts.
fn collect_prefixes(body: &str) -> Vec<String> {
    let blocks = extract_tag_values(body, "CommonPrefixes");
    let raw: Vec<&str> = if blocks.is_empty() {
        extract_tag_values(body, "Prefix")
    } else {
        blocks.iter().flat_map(|b| extract_tag_values(*b, "Prefix")).collect()
    };
    raw.into_iter().filter(|p| !p.is_empty()).map(unescape_xml).collect()
}

fn parse_size(text: &str, key: &str) -> Result<u64> {
    text.trim()
        .parse::<u64>()
        .map_err(|e| MirrorError::Parse(format!("bad size {:?} for key {:?}: {}", text, key, e)))
}

/// Parse one listing body.
///
/// Returns [`MirrorError::NoEntries`] (carrying the common prefixes) when the
/// body has no `<Key>` at all. That outcome is not a failure: callers treat
/// it as an empty listing with prefixes.
pub fn parse_listing(body: &str) -> Result<Listing> {
    let is_truncated = first_tag_value(body, "IsTruncated").map(|t| t.trim() == "true").unwrap_or(false);
    let keys = extract_tag_values(body, "Key");
    if keys.is_empty() {
        let prefixes = collect_prefixes(body);
        let next_marker = resume_marker(body, is_truncated, None, &prefixes).filter(|_| is_truncated);
        return Err(MirrorError::NoEntries { prefixes, next_marker });
    }

    let sizes = extract_tag_values(body, "Size");
    let etags = extract_tag_values(body, "ETag");
    let owners = extract_tag_values(body, "ID");
    let mtimes = extract_tag_values(body, "LastModified");
    let classes = extract_tag_values(body, "StorageClass");

    if sizes.len() < keys.len() {
        return Err(MirrorError::Parse(format!(
            "listing has {} keys but only {} sizes",
            keys.len(),
            sizes.len()
        )));
    }

    let mut entries = Vec::with_capacity(keys.len());
    for (i, raw_key) in keys.iter().enumerate() {
        let key = unescape_xml(raw_key);
        let size = parse_size(sizes[i], &key)?;
        let last_modified = mtimes.get(i).map(|s| s.to_string()).unwrap_or_default();
        let mtime = DateTime::parse_from_rfc3339(&last_modified)
            .ok()
            .map(|d| d.with_timezone(&Utc));

        entries.push(DirEntry {
            etag: etags.get(i).map(|e| strip_etag_quotes(e)).unwrap_or_default(),
            owner: owners.get(i).map(|o| unescape_xml(o)).unwrap_or_default(),
            size,
            accounted_size: size,
            last_modified,
            mtime,
            storage_class: classes.get(i).map(|c| c.to_string()).unwrap_or_default(),
            exists: true,
            key,
        });
    }

    let common_prefixes: Vec<String> = extract_tag_values(body, "CommonPrefixes")
        .iter()
        .flat_map(|b| extract_tag_values(*b, "Prefix"))
        .filter(|p| !p.is_empty())
        .map(unescape_xml)
        .collect();
    let last_key = entries.last().map(|e| e.key.as_str());
    let next_marker = resume_marker(body, is_truncated, last_key, &common_prefixes);

    Ok(Listing {
        bucket: first_tag_value(body, "Name").map(unescape_xml),
        keys: keys.iter().map(|k| k.to_string()).collect(),
        entries,
        common_prefixes,
        is_truncated,
        next_marker,
    })
}

/// `NextMarker` (or `NextContinuationToken`) when present. A truncated v1
/// listing without a delimiter carries neither; the next page then starts
/// after the last key or common prefix, whichever sorts later.
fn resume_marker(body: &str, is_truncated: bool, last_key: Option<&str>, prefixes: &[String]) -> Option<String> {
    let explicit = first_tag_value(body, "NextMarker")
        .or_else(|| first_tag_value(body, "NextContinuationToken"))
        .filter(|m| !m.is_empty())
        .map(unescape_xml);
    if explicit.is_some() || !is_truncated {
        return explicit;
    }
    let last_prefix = prefixes.iter().map(String::as_str).max();
    last_key.max(last_prefix).map(str::to_string)
}
