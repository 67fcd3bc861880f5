//! HTTP HEAD probing: size, range support, and a server-supplied filename.

use reqwest::header;

use crate::error::{DownloadError, DownloadResult};
use crate::pool::ClientPool;

/// Metadata gathered by a HEAD request.
#[derive(Debug, Clone)]
pub struct HeadProbe {
    /// Total size in bytes, if the server sent `Content-Length`.
    pub content_length: Option<u64>,
    /// True if the server sent `Accept-Ranges: bytes`.
    pub accept_ranges: bool,
    /// Filename from `Content-Disposition`, if present and parseable.
    pub content_disposition_name: Option<String>,
}

/// Performs a HEAD request and returns parsed metadata.
///
/// The URL must parse as absolute http/https. Redirects follow the client's
/// default policy.
pub fn probe(pool: &ClientPool, url: &str) -> DownloadResult<HeadProbe> {
    let parsed = url::Url::parse(url)
        .map_err(|e| DownloadError::invalid_url(format!("parse {url}: {e}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(DownloadError::invalid_url(format!(
            "unsupported scheme {}",
            parsed.scheme()
        )));
    }

    let client = pool.acquire()?;
    let response = client
        .head(url)
        .send()
        .map_err(|e| DownloadError::http(format!("HEAD {url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::http(format!(
            "HEAD {url} returned HTTP {}",
            status.as_u16()
        )));
    }

    let headers = response.headers();
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let accept_ranges = headers
        .get(header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
        .unwrap_or(false);
    let content_disposition_name = headers
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_disposition_filename);

    Ok(HeadProbe {
        content_length,
        accept_ranges,
        content_disposition_name,
    })
}

/// Extracts `filename="value"` or `filename=value` from a raw
/// Content-Disposition header value.
fn parse_content_disposition_filename(value: &str) -> Option<String> {
    for param in value.split(';') {
        let param = param.trim();
        let (name, v) = match param.split_once('=') {
            Some(pair) => pair,
            None => continue,
        };
        if !name.trim().eq_ignore_ascii_case("filename") {
            continue;
        }
        let v = v.trim().trim_matches('"').trim();
        if !v.is_empty() {
            return Some(v.to_string());
        }
    }
    None
}
