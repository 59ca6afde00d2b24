// tests/test_listing_parser.rs
//
// Listing parser against generated and remote-produced bodies.

use anyhow::Result;
use s3mirror::http::{Exchange, HttpRequest, Headers, Transport, Verb};
use s3mirror::{MemoryRemote, MirrorError, parse_listing};

fn generated_listing(n: usize) -> String {
    let mut body = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?><ListBucketResult><Name>gen</Name><IsTruncated>false</IsTruncated>"#,
    );
    for i in 0..n {
        body.push_str(&format!(
            "<Contents><Key>obj-{i:05}</Key><LastModified>2025-03-01T00:00:00.000Z</LastModified>\
             <ETag>&quot;etag{i}&quot;</ETag><Size>{}</Size><Owner><ID>owner{}</ID></Owner>\
             <StorageClass>STANDARD</StorageClass></Contents>",
            i * 10,
            i % 3
        ));
    }
    body.push_str("</ListBucketResult>");
    body
}

#[test]
fn test_generated_keys_stay_ordered_and_aligned() -> Result<()> {
    for n in [1usize, 2, 17, 500] {
        let listing = parse_listing(&generated_listing(n))?;
        assert_eq!(listing.entries.len(), n);
        assert_eq!(listing.bucket.as_deref(), Some("gen"));
        for (i, entry) in listing.entries.iter().enumerate() {
            assert_eq!(entry.key, format!("obj-{i:05}"));
            assert_eq!(entry.size, (i * 10) as u64);
            assert_eq!(entry.etag, format!("etag{i}"));
            assert_eq!(entry.owner, format!("owner{}", i % 3));
            assert!(entry.mtime.is_some());
        }
        assert_eq!(listing.total_size(), (0..n).map(|i| (i * 10) as u64).sum::<u64>());
    }
    Ok(())
}

#[test]
fn test_bad_size_is_a_parse_error() {
    let body = generated_listing(3).replace("<Size>10</Size>", "<Size>ten</Size>");
    let err = parse_listing(&body).unwrap_err();
    assert!(matches!(err, MirrorError::Parse(_)), "{err:?}");
    assert_eq!(err.code(), -74);
}

#[test]
fn test_prefix_only_body() {
    let body = "<ListBucketResult><Prefix>logs/</Prefix>\
                <CommonPrefixes><Prefix>logs/2024/</Prefix></CommonPrefixes>\
                <CommonPrefixes><Prefix>logs/2025/</Prefix></CommonPrefixes></ListBucketResult>";
    match parse_listing(body) {
        Err(MirrorError::NoEntries { prefixes, .. }) => {
            assert_eq!(prefixes, vec!["logs/2024/", "logs/2025/"]);
        }
        other => panic!("expected NoEntries, got {other:?}"),
    }
}

#[test]
fn test_truncated_page_without_next_marker_resumes_after_last_key() -> Result<()> {
    let body = generated_listing(2).replace(
        "<IsTruncated>false</IsTruncated>",
        "<IsTruncated>true</IsTruncated>",
    );
    let listing = parse_listing(&body)?;
    assert!(listing.is_truncated);
    assert_eq!(listing.next_marker.as_deref(), Some("obj-00001"));

    // a rolled-up prefix past the last key wins
    let body = body.replace(
        "</ListBucketResult>",
        "<CommonPrefixes><Prefix>zz/</Prefix></CommonPrefixes></ListBucketResult>",
    );
    assert_eq!(parse_listing(&body)?.next_marker.as_deref(), Some("zz/"));

    // complete pages carry no marker
    assert_eq!(parse_listing(&generated_listing(2))?.next_marker, None);
    Ok(())
}

#[test]
fn test_explicit_next_marker_is_kept() -> Result<()> {
    let body = generated_listing(2).replace(
        "<IsTruncated>false</IsTruncated>",
        "<IsTruncated>true</IsTruncated><NextMarker>obj-00000</NextMarker>",
    );
    assert_eq!(parse_listing(&body)?.next_marker.as_deref(), Some("obj-00000"));
    Ok(())
}

#[test]
fn test_truncated_prefix_only_page_carries_a_marker() {
    let body = "<ListBucketResult><IsTruncated>true</IsTruncated>\
                <CommonPrefixes><Prefix>a/</Prefix></CommonPrefixes>\
                <CommonPrefixes><Prefix>b/</Prefix></CommonPrefixes></ListBucketResult>";
    match parse_listing(body) {
        Err(MirrorError::NoEntries { prefixes, next_marker }) => {
            assert_eq!(prefixes, vec!["a/", "b/"]);
            assert_eq!(next_marker.as_deref(), Some("b/"));
        }
        other => panic!("expected NoEntries, got {other:?}"),
    }
}

async fn remote_listing(remote: &MemoryRemote, query: &str) -> Result<String> {
    let request = HttpRequest {
        verb: Verb::Get,
        url: format!("http://remote.test/bucket{query}"),
        headers: Headers::new(),
        body: Default::default(),
    };
    let mut exchange = remote.send(request).await?;
    assert_eq!(exchange.status(), 200);
    let mut body = Vec::new();
    while let Some(chunk) = exchange.chunk().await? {
        body.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8(body)?)
}

#[tokio::test]
async fn test_parses_what_the_remote_emits() -> Result<()> {
    let remote = MemoryRemote::new();
    remote.create_bucket("bucket", "owner-1");
    for key in ["a&b.txt", "dir/one", "dir/two", "z <tag>.bin"] {
        remote.put_object("bucket", key, key.as_bytes().to_vec());
    }

    let listing = parse_listing(&remote_listing(&remote, "").await?)?;
    let keys: Vec<_> = listing.entries.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, vec!["a&b.txt", "dir/one", "dir/two", "z <tag>.bin"]);
    assert_eq!(listing.entries[0].etag, format!("{:x}", md5::compute(b"a&b.txt")));
    assert!(listing.entries.iter().all(|e| e.owner == "owner-1"));

    // no delimiter, so no NextMarker in the body; the last key stands in
    let body = remote_listing(&remote, "?max-keys=1").await?;
    assert!(!body.contains("<NextMarker>"));
    let page = parse_listing(&body)?;
    assert!(page.is_truncated);
    assert_eq!(page.next_marker.as_deref(), Some("a&b.txt"));

    let rolled = parse_listing(&remote_listing(&remote, "?delimiter=%2F").await?)?;
    assert_eq!(rolled.entries.len(), 2);
    assert_eq!(rolled.common_prefixes, vec!["dir/"]);
    Ok(())
}
