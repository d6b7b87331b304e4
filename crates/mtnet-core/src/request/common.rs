//! Executor for the plain HTTP(S)/FTP methods: GET/POST/PUT/DELETE/HEAD.

use std::io::Read;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::manager::ProgressSink;
use crate::types::{RequestContext, RequestKind};

use super::wire::{self, TlsPolicy, WireResponse};
use super::{form, parse_supported_url, Success, TransferError};

pub(crate) fn run(
    ctx: &RequestContext,
    sink: &ProgressSink,
    cancel: &CancellationToken,
    tls: TlsPolicy,
) -> Result<Success, TransferError> {
    let mut url = parse_supported_url(&ctx.url)?;

    if url.scheme() == "ftp"
        && matches!(
            ctx.kind,
            RequestKind::Post | RequestKind::Delete | RequestKind::Head
        )
    {
        return Err(TransferError::Validation(format!(
            "Protocol error: Unsupported FTP request type '{}' for URL: {}",
            ctx.kind.as_str(),
            url
        )));
    }

    let mut hops: u16 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let (wire, body, bytes_sent) = perform_once(ctx, &url, sink, cancel, tls)?;

        if wire::is_http_scheme(&url) {
            if wire.is_redirect() {
                if let Some(next) = wire::redirect_target(&url, &wire) {
                    if hops < ctx.behavior.max_redirects {
                        hops += 1;
                        tracing::debug!(from = %url, to = %next, "redirecting");
                        url = next;
                        continue;
                    }
                }
                return Err(TransferError::Http(wire.status));
            }
            if !(200..300).contains(&wire.status) {
                return Err(TransferError::Http(wire.status));
            }
        }

        let bytes_received = body.len() as u64;
        return Ok(Success {
            body,
            headers: wire.headers,
            bytes_received,
            bytes_sent,
        });
    }
}

/// One exchange at `url`: method setup, body streaming, header capture.
fn perform_once(
    ctx: &RequestContext,
    url: &Url,
    sink: &ProgressSink,
    cancel: &CancellationToken,
    tls: TlsPolicy,
) -> Result<(WireResponse, Vec<u8>, u64), TransferError> {
    let mut easy = wire::new_easy(ctx, url, tls)?;
    let mut extras: Vec<(&str, String)> = Vec::new();
    let mut put_source: Option<Box<dyn Read>> = None;
    let mut bytes_sent = 0u64;

    match ctx.kind {
        RequestKind::Get => {}
        RequestKind::Head => easy.nobody(true).map_err(TransferError::Curl)?,
        RequestKind::Delete => easy.custom_request("DELETE").map_err(TransferError::Curl)?,
        RequestKind::Post => {
            let form_cfg = ctx
                .upload
                .as_ref()
                .filter(|u| u.use_form_data && !u.files.is_empty());
            let (content_type, body) = match form_cfg {
                Some(cfg) => {
                    let (ct, bytes) = form::build_form(cfg)?;
                    (Some(ct), bytes)
                }
                None => {
                    // Use application/x-www-form-urlencoded by default.
                    let ct = (!ctx.headers.contains("Content-Type"))
                        .then(|| "application/x-www-form-urlencoded".to_string());
                    (ct, ctx.body.clone().into_bytes())
                }
            };
            if let Some(ct) = content_type {
                extras.push(("Content-Type", ct));
            }
            bytes_sent = body.len() as u64;
            easy.post(true).map_err(TransferError::Curl)?;
            easy.post_field_size(body.len() as u64)
                .map_err(TransferError::Curl)?;
            easy.post_fields_copy(&body).map_err(TransferError::Curl)?;
        }
        RequestKind::Put => {
            let file_path = ctx
                .upload
                .as_ref()
                .and_then(|u| u.file_path.as_ref())
                .filter(|p| p.exists());
            let (source, len): (Box<dyn Read>, u64) = match file_path {
                Some(path) => {
                    let file = std::fs::File::open(path).map_err(|e| {
                        TransferError::Storage(format!(
                            "unable to open file '{}' for reading: {}",
                            path.display(),
                            e
                        ))
                    })?;
                    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
                    (Box::new(file), len)
                }
                None => {
                    let bytes = ctx.body.clone().into_bytes();
                    let len = bytes.len() as u64;
                    (Box::new(std::io::Cursor::new(bytes)), len)
                }
            };
            bytes_sent = len;
            easy.upload(true).map_err(TransferError::Curl)?;
            easy.in_filesize(len).map_err(TransferError::Curl)?;
            put_source = Some(source);
        }
        other => {
            return Err(TransferError::Validation(format!(
                "Configuration error: unsupported request kind ({})",
                other.as_str()
            )))
        }
    }

    let extra_refs: Vec<(&str, &str)> = extras.iter().map(|(n, v)| (*n, v.as_str())).collect();
    easy.http_headers(wire::header_list(ctx, &extra_refs)?)
        .map_err(TransferError::Curl)?;

    let mut header_lines: Vec<String> = Vec::new();
    let mut body_out: Vec<u8> = Vec::new();
    {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                wire::collect_header_line(&mut header_lines, data);
                true
            })
            .map_err(TransferError::Curl)?;
        transfer
            .write_function(|data| {
                body_out.extend_from_slice(data);
                Ok(data.len())
            })
            .map_err(TransferError::Curl)?;
        if let Some(mut source) = put_source.take() {
            transfer
                .read_function(move |buf| {
                    source.read(buf).map_err(|_| curl::easy::ReadError::Abort)
                })
                .map_err(TransferError::Curl)?;
        }
        transfer
            .progress_function(|dl_total, dl_now, ul_total, ul_now| {
                if cancel.is_cancelled() {
                    return false;
                }
                if dl_now > 0.0 {
                    sink.download(dl_now as u64, dl_total as u64);
                }
                if ul_now > 0.0 {
                    sink.upload(ul_now as u64, ul_total as u64);
                }
                true
            })
            .map_err(TransferError::Curl)?;
        transfer
            .perform()
            .map_err(|e| TransferError::from_curl(e, None))?;
    }

    let status = easy.response_code().map_err(TransferError::Curl)?;
    Ok((
        WireResponse {
            status,
            headers: wire::parse_header_lines(&header_lines),
        },
        body_out,
        bytes_sent,
    ))
}
