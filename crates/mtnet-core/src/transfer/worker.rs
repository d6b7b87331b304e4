//! One segment channel: a Range GET writing into its exclusive window of
//! the shared file mapping.
//!
//! Writes only start once the response is a `206 Partial Content` whose
//! `Content-Range` matches the requested window; anything else (a redirect
//! body, a server that ignores `Range`) is consumed without touching the
//! mapping and surfaces as a status or short-transfer error.

use std::cell::{Cell, RefCell};
use std::sync::mpsc::Sender;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::manager::events::PROGRESS_INTERVAL;
use crate::mapping::SegmentView;
use crate::request::wire::{self, TlsPolicy, WireResponse};
use crate::request::TransferError;
use crate::types::RequestContext;

/// Messages from segment workers to the coordinator.
pub(super) enum WorkerMsg {
    /// Cumulative bytes written by this segment so far.
    Progress { index: usize, received: u64 },
    /// Exactly one per worker.
    Done {
        index: usize,
        result: Result<(), TransferError>,
    },
}

/// Entry point for one worker thread. Always emits a terminal `Done`.
pub(super) fn run(
    index: usize,
    ctx: RequestContext,
    url: Url,
    view: SegmentView,
    tx: Sender<WorkerMsg>,
    cancel: CancellationToken,
    tls: TlsPolicy,
) {
    let result = download_range(index, &ctx, url, &view, &tx, &cancel, tls);
    if let Err(e) = &result {
        if !e.is_cancelled() {
            tracing::debug!(part = index, "segment failed: {}", e);
        }
    }
    let _ = tx.send(WorkerMsg::Done { index, result });
}

fn download_range(
    index: usize,
    ctx: &RequestContext,
    mut url: Url,
    view: &SegmentView,
    tx: &Sender<WorkerMsg>,
    cancel: &CancellationToken,
    tls: TlsPolicy,
) -> Result<(), TransferError> {
    let expected = view.len();
    let mut hops: u16 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let (wire, written) = perform_range(ctx, &url, view, index, tx, cancel, tls)?;

        if wire::is_http_scheme(&url) {
            if wire.is_redirect() {
                if let Some(next) = wire::redirect_target(&url, &wire) {
                    if hops < ctx.behavior.max_redirects {
                        hops += 1;
                        tracing::debug!(part = index, from = %url, to = %next, "redirecting segment");
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

        if written != expected {
            return Err(TransferError::Partial {
                expected,
                received: written,
            });
        }
        // Final cumulative count, past the 250 ms floor.
        let _ = tx.send(WorkerMsg::Progress {
            index,
            received: written,
        });
        return Ok(());
    }
}

fn perform_range(
    ctx: &RequestContext,
    url: &Url,
    view: &SegmentView,
    index: usize,
    tx: &Sender<WorkerMsg>,
    cancel: &CancellationToken,
    tls: TlsPolicy,
) -> Result<(WireResponse, u64), TransferError> {
    let mut easy = wire::new_easy(ctx, url, tls)?;
    let range_start = view.start();
    let range_end = range_start + view.len() - 1;
    easy.range(&format!("{}-{}", range_start, range_end))
        .map_err(TransferError::Curl)?;
    easy.http_headers(wire::header_list(
        ctx,
        &[("Content-Type", "application/octet-stream")],
    )?)
    .map_err(TransferError::Curl)?;

    let http = wire::is_http_scheme(url);
    // Shared between the header and write callbacks, hence the RefCell.
    let header_lines: RefCell<Vec<String>> = RefCell::new(Vec::new());
    let written = Cell::new(0u64);
    // None = not yet checked; Some(false) = consume without writing.
    let range_ok = Cell::new(None::<bool>);
    let last_report = Cell::new(None::<Instant>);
    let storage_error: RefCell<Option<String>> = RefCell::new(None);
    {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                wire::collect_header_line(&mut header_lines.borrow_mut(), data);
                true
            })
            .map_err(TransferError::Curl)?;
        transfer
            .write_function(|data| {
                if http {
                    if range_ok.get().is_none() {
                        let lines = header_lines.borrow();
                        let status = parse_http_status(&lines);
                        let content_ok = parse_content_range(&lines)
                            .map(|(s, e)| s == range_start && e == range_end)
                            .unwrap_or(false);
                        range_ok.set(Some(status == Some(206) && content_ok));
                    }
                    if range_ok.get() == Some(false) {
                        // Redirect page or a server ignoring Range: consume
                        // without writing; the status check decides after.
                        return Ok(data.len());
                    }
                }
                match view.write_at(written.get(), data) {
                    Ok(0) if !data.is_empty() => {
                        tracing::warn!(part = index, "bytes beyond segment range, dropped");
                    }
                    Ok(n) => {
                        written.set(written.get() + n);
                        let now = Instant::now();
                        let due = last_report
                            .get()
                            .map_or(true, |t| now.duration_since(t) >= PROGRESS_INTERVAL);
                        if due {
                            last_report.set(Some(now));
                            let _ = tx.send(WorkerMsg::Progress {
                                index,
                                received: written.get(),
                            });
                        }
                    }
                    Err(e) => {
                        storage_error.borrow_mut().replace(e.to_string());
                        return Ok(0);
                    }
                }
                Ok(data.len())
            })
            .map_err(TransferError::Curl)?;
        transfer
            .progress_function(|_, _, _, _| !cancel.is_cancelled())
            .map_err(TransferError::Curl)?;
        transfer
            .perform()
            .map_err(|e| TransferError::from_curl(e, storage_error.borrow_mut().take()))?;
    }

    let status = easy.response_code().map_err(TransferError::Curl)?;
    let headers = wire::parse_header_lines(&header_lines.borrow());
    Ok((WireResponse { status, headers }, written.get()))
}

/// Status code from the most recent `HTTP/...` line.
fn parse_http_status(lines: &[String]) -> Option<u32> {
    let line = lines.iter().rev().find(|l| l.starts_with("HTTP/"))?;
    line.split_whitespace().nth(1)?.parse().ok()
}

/// `(start, end)` from a `Content-Range: bytes start-end/total` header.
fn parse_content_range(lines: &[String]) -> Option<(u64, u64)> {
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("content-range") {
            continue;
        }
        let value = value.trim();
        let spec = value.strip_prefix("bytes").unwrap_or(value).trim();
        let (range, _total) = spec.split_once('/')?;
        let (start, end) = range.trim().split_once('-')?;
        return Some((start.trim().parse().ok()?, end.trim().parse().ok()?));
    }
    None
}
