//! Minimal HTTP/1.1 server with HEAD and Range GET support for end-to-end
//! tests. Serves one static body per instance; an optional per-chunk delay
//! slows transfers so tests can observe mid-download states.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RangeServerOptions {
    /// If false, GET ignores Range and always answers 200 with the full
    /// body; Accept-Ranges is omitted.
    pub support_ranges: bool,
    /// Sleep inserted after each body chunk (None = full speed).
    pub chunk_delay: Option<Duration>,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            support_ranges: true,
            chunk_delay: None,
        }
    }
}

const BODY_CHUNK: usize = 8 * 1024;

/// Starts a server in a background thread serving `body`. Returns a URL like
/// `http://127.0.0.1:PORT/file.bin`. Runs until the process exits.
pub fn start(body: Vec<u8>) -> String {
    start_with_options(body, RangeServerOptions::default())
}

pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            thread::spawn(move || handle(stream, &body, opts));
        }
    });
    format!("http://127.0.0.1:{port}/file.bin")
}

fn handle(mut stream: TcpStream, body: &[u8], opts: RangeServerOptions) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let request = match read_request(&mut stream) {
        Some(r) => r,
        None => return,
    };
    let (method, range) = parse_request(&request);
    let total = body.len() as u64;

    if method.eq_ignore_ascii_case("HEAD") {
        let accept = if opts.support_ranges {
            "Accept-Ranges: bytes\r\n"
        } else {
            ""
        };
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\n{accept}Connection: close\r\n\r\n"
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    if method.eq_ignore_ascii_case("GET") {
        let (status, content_range, slice) = match range {
            Some((start, end_incl)) if opts.support_ranges => {
                if start >= total && total > 0 {
                    ("416 Range Not Satisfiable", format!("bytes */{total}"), &body[0..0])
                } else {
                    let start = start.min(total) as usize;
                    let end_excl = ((end_incl.saturating_add(1)).min(total)) as usize;
                    let slice = body.get(start..end_excl).unwrap_or(&body[0..0]);
                    (
                        "206 Partial Content",
                        format!("bytes {}-{}/{}", start, end_excl.saturating_sub(1), total),
                        slice,
                    )
                }
            }
            _ => (
                "200 OK",
                format!("bytes 0-{}/{}", total.saturating_sub(1), total),
                body,
            ),
        };
        let accept = if opts.support_ranges {
            "Accept-Ranges: bytes\r\n"
        } else {
            ""
        };
        let header = format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Range: {content_range}\r\n{accept}Connection: close\r\n\r\n",
            slice.len()
        );
        if stream.write_all(header.as_bytes()).is_err() {
            return;
        }
        for chunk in slice.chunks(BODY_CHUNK) {
            if stream.write_all(chunk).is_err() {
                return;
            }
            if let Some(delay) = opts.chunk_delay {
                thread::sleep(delay);
            }
        }
        return;
    }

    let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
}

/// Reads until the blank line ending the request head.
fn read_request(stream: &mut TcpStream) -> Option<String> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).ok()?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.windows(4).any(|w| w == b"\r\n\r\n") || data.len() > 64 * 1024 {
            break;
        }
    }
    String::from_utf8(data).ok()
}

/// Returns (method, optional inclusive (start, end) from `Range: bytes=X-Y`).
fn parse_request(request: &str) -> (&str, Option<(u64, u64)>) {
    let mut method = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            method = line.split_whitespace().next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if let Some(spec) = value.strip_prefix("bytes=") {
                    if let Some((a, b)) = spec.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end = if b.trim().is_empty() {
                            u64::MAX
                        } else {
                            b.trim().parse::<u64>().unwrap_or(0)
                        };
                        range = Some((start, end));
                    }
                }
            }
        }
    }
    (method, range)
}
