// src/http/sigv4.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
//! AWS Signature Version 4 request signing.
//!
//! Path-style requests only. The payload hash is always computed over the
//! full body, which the mirror has in hand before sending.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::Credentials;
use crate::constants::{AMZ_DATE_FORMAT, SIGV4_ALGORITHM, SIGV4_SERVICE};
use crate::error::{MirrorError, Result};
use crate::http::transport::HttpRequest;

type HmacSha256 = Hmac<Sha256>;

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sign(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| MirrorError::InvalidRequest(format!("signing key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn signing_key(secret: &str, date: &str, region: &str) -> Result<Vec<u8>> {
    let k_date = hmac_sign(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sign(&k_date, region.as_bytes())?;
    let k_service = hmac_sign(&k_region, SIGV4_SERVICE.as_bytes())?;
    hmac_sign(&k_service, b"aws4_request")
}

fn is_signed_header(name: &str) -> bool {
    name == "host"
        || name == "range"
        || name == "content-type"
        || name == "content-md5"
        || name.starts_with("x-amz-")
}

/// Query string with pairs sorted by name then value. Components are
/// expected to be percent-encoded already.
fn canonical_query(query: Option<&str>) -> String {
    let mut pairs: Vec<(&str, &str)> = query
        .unwrap_or_default()
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| p.split_once('=').unwrap_or((p, "")))
        .collect();
    pairs.sort_unstable();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Canonical request text and the `;`-joined signed header list.
///
/// `request` must already carry `host`, `x-amz-date` and
/// `x-amz-content-sha256`.
pub fn canonical_request(request: &HttpRequest) -> Result<(String, String)> {
    let url = reqwest::Url::parse(&request.url)
        .map_err(|e| MirrorError::InvalidRequest(format!("bad url {:?}: {e}", request.url)))?;

    // headers are stored lower-cased and sorted already
    let signed: Vec<(&String, &String)> = request
        .headers
        .iter()
        .filter(|(k, _)| is_signed_header(k))
        .collect();
    let canonical_headers: String = signed
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();
    let signed_headers = signed
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let payload_hash = request
        .header("x-amz-content-sha256")
        .map(str::to_string)
        .unwrap_or_else(|| sha256_hex(&request.body));

    let canonical = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        request.verb.as_str(),
        url.path(),
        canonical_query(url.query()),
        canonical_headers,
        signed_headers,
        payload_hash
    );
    Ok((canonical, signed_headers))
}

fn host_header(url: &reqwest::Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| MirrorError::InvalidRequest(format!("url {url} has no host")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Add `host`, `x-amz-date`, `x-amz-content-sha256` and `authorization` to
/// `request`, signed for `region` at time `now`.
pub fn sign_request(
    request: &mut HttpRequest,
    credentials: &Credentials,
    region: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let url = reqwest::Url::parse(&request.url)
        .map_err(|e| MirrorError::InvalidRequest(format!("bad url {:?}: {e}", request.url)))?;

    let amz_date = now.format(AMZ_DATE_FORMAT).to_string();
    let date = now.format("%Y%m%d").to_string();

    request.set_header("host", host_header(&url)?);
    request.set_header("x-amz-date", amz_date.clone());
    let payload_hash = sha256_hex(&request.body);
    request.set_header("x-amz-content-sha256", payload_hash);

    let (canonical, signed_headers) = canonical_request(request)?;
    let scope = format!("{date}/{region}/{SIGV4_SERVICE}/aws4_request");
    let string_to_sign = format!(
        "{SIGV4_ALGORITHM}\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical.as_bytes())
    );

    let key = signing_key(&credentials.secret_key, &date, region)?;
    let signature = hex::encode(hmac_sign(&key, string_to_sign.as_bytes())?);

    request.set_header(
        "authorization",
        format!(
            "{SIGV4_ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key
        ),
    );
    Ok(())
}
