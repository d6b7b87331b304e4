//! Minimal HTTP/1.1 server for integration tests: HEAD, Range GET,
//! redirect chains, POST echo, and an optional slow-body mode.
//!
//! Serves a single static body. HEAD answers with `Content-Length` and
//! `Accept-Ranges: bytes`; GET with a `Range` header answers `206 Partial
//! Content`. Paths of the form `/hopN` (N > 0) answer `302 Found` pointing
//! at `/hop{N-1}`; `/hop0` and every other path serve the body.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RangeServerOptions {
    /// If false, HEAD returns 405 (simulates servers that block HEAD).
    pub head_allowed: bool,
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// Delay inserted between body chunks (slow-network mode).
    pub body_delay: Option<Duration>,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            head_allowed: true,
            support_ranges: true,
            body_delay: None,
        }
    }
}

/// Starts a server in a background thread serving `body`. Returns the base
/// URL (e.g. "http://127.0.0.1:12345/"). Runs until the process exits.
#[allow(dead_code)]
pub fn start(body: Vec<u8>) -> String {
    start_with_options(body, RangeServerOptions::default())
}

#[allow(dead_code)]
pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            thread::spawn(move || handle(stream, &body, opts));
        }
    });
    format!("http://127.0.0.1:{}/", port)
}

fn handle(mut stream: std::net::TcpStream, body: &[u8], opts: RangeServerOptions) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(30)));
    let mut buf = [0u8; 16384];
    let mut n = match stream.read(&mut buf) {
        Ok(0) => return,
        Ok(n) => n,
        Err(_) => return,
    };
    // Headers and body may arrive in separate writes; keep reading until
    // the header block and the announced body are complete.
    loop {
        let done = match find_header_end(&buf[..n]) {
            None => false,
            Some(head_end) => {
                let head = match std::str::from_utf8(&buf[..head_end]) {
                    Ok(s) => s,
                    Err(_) => return,
                };
                let content_length = header_value(head, "content-length")
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0);
                n >= (head_end + content_length).min(buf.len())
            }
        };
        if done || n == buf.len() {
            break;
        }
        match stream.read(&mut buf[n..]) {
            Ok(0) | Err(_) => break,
            Ok(more) => n += more,
        }
    }
    let raw = &buf[..n];
    let head_end = find_header_end(raw).unwrap_or(n);
    let request = match std::str::from_utf8(&raw[..head_end]) {
        Ok(s) => s,
        Err(_) => return,
    };
    let parsed = parse_request(request);

    // Redirect chain: /hopN -> /hop{N-1} until /hop0 serves the body.
    if let Some(hops) = parsed
        .path
        .strip_prefix("/hop")
        .and_then(|s| s.parse::<u32>().ok())
    {
        if hops > 0 {
            let response = format!(
                "HTTP/1.1 302 Found\r\nLocation: /hop{}\r\nContent-Length: 0\r\n\r\n",
                hops - 1
            );
            let _ = stream.write_all(response.as_bytes());
            return;
        }
    }

    let total = body.len() as u64;
    if parsed.method.eq_ignore_ascii_case("HEAD") {
        if !opts.head_allowed {
            let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n");
            return;
        }
        let accept_ranges = if opts.support_ranges {
            "Accept-Ranges: bytes\r\n"
        } else {
            ""
        };
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\n{}\r\n",
            total, accept_ranges
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    if parsed.method.eq_ignore_ascii_case("POST") {
        // Echo the request body back.
        let echoed = &raw[head_end.min(n)..n];
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\n\r\n",
            echoed.len()
        );
        let _ = stream.write_all(response.as_bytes());
        let _ = stream.write_all(echoed);
        return;
    }

    if parsed.method.eq_ignore_ascii_case("GET") {
        let (status, range_header, slice) = match parsed.range.filter(|_| opts.support_ranges) {
            Some((start, end_incl)) => {
                let start = start.min(total);
                let end_incl = end_incl.min(total.saturating_sub(1));
                if start > end_incl {
                    (
                        "416 Range Not Satisfiable",
                        format!("bytes */{}", total),
                        &body[0..0],
                    )
                } else {
                    let start = start as usize;
                    let end_excl = (end_incl + 1).min(total) as usize;
                    (
                        "206 Partial Content",
                        format!("bytes {}-{}/{}", start, end_excl - 1, total),
                        body.get(start..end_excl).unwrap_or(&body[0..0]),
                    )
                }
            }
            None => (
                "200 OK",
                format!("bytes 0-{}/{}", total.saturating_sub(1), total),
                body,
            ),
        };
        let accept_ranges = if opts.support_ranges {
            "Accept-Ranges: bytes\r\n"
        } else {
            ""
        };
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Range: {}\r\nContent-Type: application/octet-stream\r\n{}\r\n",
            status,
            slice.len(),
            range_header,
            accept_ranges
        );
        let _ = stream.write_all(response.as_bytes());
        match opts.body_delay {
            None => {
                let _ = stream.write_all(slice);
            }
            Some(delay) => {
                for chunk in slice.chunks(1024.max(slice.len() / 64)) {
                    if stream.write_all(chunk).is_err() {
                        return;
                    }
                    let _ = stream.flush();
                    thread::sleep(delay);
                }
            }
        }
        return;
    }

    let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n");
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    for line in head.lines() {
        if let Some((n, v)) = line.split_once(':') {
            if n.trim().eq_ignore_ascii_case(name) {
                return Some(v.trim());
            }
        }
    }
    None
}

struct ParsedRequest<'a> {
    method: &'a str,
    path: &'a str,
    range: Option<(u64, u64)>,
}

fn parse_request(request: &str) -> ParsedRequest<'_> {
    let mut method = "";
    let mut path = "/";
    let mut range = None;
    for (i, line) in request.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if i == 0 {
            let mut parts = line.split_whitespace();
            method = parts.next().unwrap_or("");
            path = parts.next().unwrap_or("/");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if let Some(spec) = value.strip_prefix("bytes=") {
                    if let Some((a, b)) = spec.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end = b.trim();
                        let end_incl = if end.is_empty() {
                            u64::MAX
                        } else {
                            end.parse::<u64>().unwrap_or(0)
                        };
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    ParsedRequest {
        method,
        path,
        range,
    }
}
