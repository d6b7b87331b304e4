//! Upload executor: file, in-memory bytes, or a multipart form.
//!
//! HTTP(S) chooses PUT vs POST per `UploadConfig::use_put_method`; FTP
//! always uploads (STOR) and the URL names the remote file.

use std::io::Read;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::manager::ProgressSink;
use crate::types::{RequestContext, UploadConfig};

use super::wire::{self, TlsPolicy, WireResponse};
use super::{form, parse_supported_url, Success, TransferError};

pub(crate) fn run(
    ctx: &RequestContext,
    sink: &ProgressSink,
    cancel: &CancellationToken,
    tls: TlsPolicy,
) -> Result<Success, TransferError> {
    let cfg = ctx.upload.as_ref().ok_or_else(|| {
        TransferError::Validation("Configuration error: upload configuration missing".into())
    })?;
    let mut url = parse_supported_url(&ctx.url)?;

    let mut hops: u16 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let (wire, body, bytes_sent) = perform_upload(ctx, cfg, &url, sink, cancel, tls)?;

        if wire::is_http_scheme(&url) {
            if wire.is_redirect() {
                if let Some(next) = wire::redirect_target(&url, &wire) {
                    if hops < ctx.behavior.max_redirects {
                        hops += 1;
                        tracing::debug!(from = %url, to = %next, "redirecting upload");
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

fn perform_upload(
    ctx: &RequestContext,
    cfg: &UploadConfig,
    url: &Url,
    sink: &ProgressSink,
    cancel: &CancellationToken,
    tls: TlsPolicy,
) -> Result<(WireResponse, Vec<u8>, u64), TransferError> {
    let mut easy = wire::new_easy(ctx, url, tls)?;
    let is_ftp = url.scheme() == "ftp";
    let use_put = is_ftp || cfg.use_put_method;
    let form_data = cfg.use_form_data && !cfg.files.is_empty();

    let mut extras: Vec<(&str, String)> = Vec::new();
    let (source, len): (Box<dyn Read>, u64) = if form_data {
        let (content_type, bytes) = form::build_form(cfg)?;
        extras.push(("Content-Type", content_type));
        let len = bytes.len() as u64;
        (Box::new(std::io::Cursor::new(bytes)), len)
    } else {
        extras.push(("Content-Type", "application/octet-stream".to_string()));
        match &cfg.file_path {
            Some(path) => {
                if !path.exists() {
                    return Err(TransferError::Storage(format!(
                        "the specified file '{}' does not exist",
                        path.display()
                    )));
                }
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
                if cfg.data.is_empty() {
                    return Err(TransferError::Validation(
                        "Configuration error: upload source missing (no file path or data)".into(),
                    ));
                }
                let len = cfg.data.len() as u64;
                (Box::new(std::io::Cursor::new(cfg.data.clone())), len)
            }
        }
    };

    if use_put {
        easy.upload(true).map_err(TransferError::Curl)?;
        easy.in_filesize(len).map_err(TransferError::Curl)?;
    } else {
        easy.post(true).map_err(TransferError::Curl)?;
        easy.post_field_size(len).map_err(TransferError::Curl)?;
    }

    let extra_refs: Vec<(&str, &str)> = extras.iter().map(|(n, v)| (*n, v.as_str())).collect();
    easy.http_headers(wire::header_list(ctx, &extra_refs)?)
        .map_err(TransferError::Curl)?;

    let mut header_lines: Vec<String> = Vec::new();
    let mut body_out: Vec<u8> = Vec::new();
    {
        let mut source = source;
        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                wire::collect_header_line(&mut header_lines, data);
                true
            })
            .map_err(TransferError::Curl)?;
        transfer
            .read_function(move |buf| source.read(buf).map_err(|_| curl::easy::ReadError::Abort))
            .map_err(TransferError::Curl)?;
        transfer
            .write_function(|data| {
                body_out.extend_from_slice(data);
                Ok(data.len())
            })
            .map_err(TransferError::Curl)?;
        transfer
            .progress_function(|_, _, ul_total, ul_now| {
                if cancel.is_cancelled() {
                    return false;
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
        len,
    ))
}
