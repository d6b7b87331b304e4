//! Single-stream download executor: stream the response body into a
//! freshly created target file; any failure removes the partial file.

use std::cell::RefCell;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::manager::ProgressSink;
use crate::naming;
use crate::types::RequestContext;

use super::wire::{self, TlsPolicy, WireResponse};
use super::{parse_supported_url, Success, TransferError};

pub(crate) fn run(
    ctx: &RequestContext,
    sink: &ProgressSink,
    cancel: &CancellationToken,
    tls: TlsPolicy,
) -> Result<Success, TransferError> {
    let cfg = ctx.download.as_ref().ok_or_else(|| {
        TransferError::Validation("Configuration error: download configuration missing".into())
    })?;
    let mut url = parse_supported_url(&ctx.url)?;
    let path = naming::resolve_save_path(ctx, cfg)
        .map_err(|e| TransferError::Validation(format!("{:#}", e)))?;

    let mut hops: u16 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let mut file = File::create(&path).map_err(|e| {
            TransferError::Storage(format!(
                "unable to open file '{}' for writing: {}",
                path.display(),
                e
            ))
        })?;

        match perform_download(ctx, &url, &mut file, sink, cancel, tls) {
            Ok((wire, written)) => {
                drop(file);
                if wire::is_http_scheme(&url) {
                    if wire.is_redirect() {
                        // The partially written file is removed before the
                        // request is re-issued at the new location.
                        remove_partial(&path);
                        if let Some(next) = wire::redirect_target(&url, &wire) {
                            if hops < ctx.behavior.max_redirects {
                                hops += 1;
                                tracing::debug!(from = %url, to = %next, "redirecting download");
                                url = next;
                                continue;
                            }
                        }
                        return Err(TransferError::Http(wire.status));
                    }
                    if !(200..300).contains(&wire.status) {
                        remove_partial(&path);
                        return Err(TransferError::Http(wire.status));
                    }
                }
                return Ok(Success {
                    body: Vec::new(),
                    headers: wire.headers,
                    bytes_received: written,
                    bytes_sent: 0,
                });
            }
            Err(e) => {
                drop(file);
                remove_partial(&path);
                return Err(e);
            }
        }
    }
}

fn perform_download(
    ctx: &RequestContext,
    url: &Url,
    file: &mut File,
    sink: &ProgressSink,
    cancel: &CancellationToken,
    tls: TlsPolicy,
) -> Result<(WireResponse, u64), TransferError> {
    let mut easy = wire::new_easy(ctx, url, tls)?;
    easy.http_headers(wire::header_list(ctx, &[])?)
        .map_err(TransferError::Curl)?;

    let mut header_lines: Vec<String> = Vec::new();
    let written = RefCell::new(0u64);
    let storage_error: RefCell<Option<String>> = RefCell::new(None);
    {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                wire::collect_header_line(&mut header_lines, data);
                true
            })
            .map_err(TransferError::Curl)?;
        transfer
            .write_function(|data| match file.write_all(data) {
                Ok(()) => {
                    *written.borrow_mut() += data.len() as u64;
                    Ok(data.len())
                }
                Err(e) => {
                    storage_error
                        .borrow_mut()
                        .replace(format!("write operation failed: {}", e));
                    Ok(0)
                }
            })
            .map_err(TransferError::Curl)?;
        transfer
            .progress_function(|dl_total, dl_now, _, _| {
                if cancel.is_cancelled() {
                    return false;
                }
                if dl_now > 0.0 {
                    sink.download(dl_now as u64, dl_total as u64);
                }
                true
            })
            .map_err(TransferError::Curl)?;
        transfer
            .perform()
            .map_err(|e| TransferError::from_curl(e, storage_error.borrow_mut().take()))?;
    }

    let status = easy.response_code().map_err(TransferError::Curl)?;
    let written = *written.borrow();
    Ok((
        WireResponse {
            status,
            headers: wire::parse_header_lines(&header_lines),
        },
        written,
    ))
}

fn remove_partial(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("failed to remove partial file {}: {}", path.display(), e);
        }
    }
}
