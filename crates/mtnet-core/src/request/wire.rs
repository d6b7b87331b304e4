//! Shared curl handle setup and response-header plumbing.
//!
//! Executors build their own transfer loops (each variant streams the body
//! differently) but share handle configuration: default headers, TLS
//! policy, timeouts, cookies, and redirect-target resolution. Redirects are
//! followed by the executors themselves (301/302 only, bounded by
//! `Behavior::max_redirects`), so `follow_location` stays off.

use curl::easy::{Easy, List, SslVersion};
use std::time::Duration;
use url::Url;

use crate::types::{HeaderMap, RequestContext};

use super::TransferError;

/// Default User-Agent injected when the caller did not set one.
pub(crate) const USER_AGENT: &str = concat!("mtnet/", env!("CARGO_PKG_VERSION"));

/// TLS knobs applied to https exchanges. TLS 1.2+ is always forced; peer
/// verification follows the manager configuration (off by default per the
/// library contract).
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsPolicy {
    pub verify_peer: bool,
}

/// Status line + parsed headers of one exchange.
#[derive(Debug)]
pub(crate) struct WireResponse {
    pub status: u32,
    pub headers: HeaderMap,
}

impl WireResponse {
    pub fn is_redirect(&self) -> bool {
        self.status == 301 || self.status == 302
    }
}

pub(crate) fn is_http_scheme(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

/// New Easy handle configured for `ctx` at `url`: timeouts, encoding,
/// cookies, TLS. Redirect following is left to the caller.
pub(crate) fn new_easy(
    ctx: &RequestContext,
    url: &Url,
    tls: TlsPolicy,
) -> Result<Easy, TransferError> {
    let mut easy = Easy::new();
    configure(&mut easy, ctx, url, tls).map_err(TransferError::Curl)?;
    Ok(easy)
}

fn configure(easy: &mut Easy, ctx: &RequestContext, url: &Url, tls: TlsPolicy) -> Result<(), curl::Error> {
    easy.url(url.as_str())?;
    easy.follow_location(false)?;
    easy.connect_timeout(Duration::from_secs(30))?;
    if ctx.behavior.transfer_timeout_ms > 0 {
        easy.timeout(Duration::from_millis(ctx.behavior.transfer_timeout_ms))?;
    }
    easy.accept_encoding("gzip,deflate")?;
    easy.progress(true)?;

    if url.scheme() == "https" {
        easy.ssl_min_max_version(SslVersion::Tlsv12, SslVersion::Default)?;
        easy.ssl_verify_peer(tls.verify_peer)?;
        easy.ssl_verify_host(tls.verify_peer)?;
    }

    if !ctx.cookies.is_empty() {
        let jar = ctx
            .cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ");
        easy.cookie(&jar)?;
    }
    Ok(())
}

/// Request header list: library defaults (unless overridden), per-call
/// extras, then the caller's headers in insertion order.
pub(crate) fn header_list(
    ctx: &RequestContext,
    extras: &[(&str, &str)],
) -> Result<List, TransferError> {
    build_header_list(ctx, extras).map_err(TransferError::Curl)
}

fn build_header_list(ctx: &RequestContext, extras: &[(&str, &str)]) -> Result<List, curl::Error> {
    let mut list = List::new();
    if !ctx.headers.contains("User-Agent") {
        list.append(&format!("User-Agent: {}", USER_AGENT))?;
    }
    if !ctx.headers.contains("Connection") {
        list.append("Connection: keep-alive")?;
    }
    for (name, value) in extras {
        if !ctx.headers.contains(name) {
            list.append(&format!("{}: {}", name, value))?;
        }
    }
    for (name, value) in ctx.headers.iter() {
        list.append(&format!("{}: {}", name.trim(), value.trim()))?;
    }
    Ok(list)
}

/// Collect one raw header line. When curl emits a new `HTTP/` status line
/// (after a redirect or `100 Continue`) the previous block is discarded so
/// only the final response's headers survive.
pub(crate) fn collect_header_line(lines: &mut Vec<String>, data: &[u8]) {
    if let Ok(s) = std::str::from_utf8(data) {
        let line = s.trim_end();
        if line.starts_with("HTTP/") {
            lines.clear();
        }
        lines.push(line.to_string());
    }
}

/// Parse collected `Name: value` lines into an ordered header map.
pub(crate) fn parse_header_lines(lines: &[String]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() || line.starts_with("HTTP/") {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim(), value.trim());
        }
    }
    headers
}

/// Resolve a `Location` header against the current URL. Returns `None` for
/// a missing/unparseable target or a self-redirect.
pub(crate) fn redirect_target(current: &Url, wire: &WireResponse) -> Option<Url> {
    let location = wire.headers.get("Location")?;
    let next = current.join(location.trim()).ok()?;
    if next == *current {
        return None;
    }
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lines_cleared_on_new_status_line() {
        let mut lines = Vec::new();
        collect_header_line(&mut lines, b"HTTP/1.1 302 Found\r\n");
        collect_header_line(&mut lines, b"Location: http://other/\r\n");
        assert_eq!(lines.len(), 2);
        collect_header_line(&mut lines, b"HTTP/1.1 200 OK\r\n");
        assert_eq!(lines.len(), 1, "headers cleared on new HTTP/ line");
    }

    #[test]
    fn parse_header_lines_ordered_and_trimmed() {
        let lines = vec![
            "HTTP/1.1 200 OK".to_string(),
            "Content-Type: text/plain".to_string(),
            "Content-Length:  42 ".to_string(),
            "".to_string(),
        ];
        let h = parse_header_lines(&lines);
        assert_eq!(h.len(), 2);
        assert_eq!(h.get("content-length"), Some("42"));
        let first = h.iter().next().unwrap();
        assert_eq!(first.0, "Content-Type");
    }

    #[test]
    fn redirect_target_resolves_relative() {
        let current = Url::parse("http://example.com/a/b").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("Location", "/c/d");
        let wire = WireResponse { status: 302, headers };
        let next = redirect_target(&current, &wire).unwrap();
        assert_eq!(next.as_str(), "http://example.com/c/d");
    }

    #[test]
    fn redirect_target_rejects_self() {
        let current = Url::parse("http://example.com/a").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("Location", "http://example.com/a");
        let wire = WireResponse { status: 301, headers };
        assert!(redirect_target(&current, &wire).is_none());
    }
}
