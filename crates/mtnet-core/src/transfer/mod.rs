//! Multi-segment download engine.
//!
//! HEAD for the size, partition `[0, size)` into N ranges, fetch them
//! concurrently into one pre-allocated memory-mapped temp file, then
//! atomically rename onto the destination. The first segment failure
//! aborts all siblings and rejects the whole download; on any failure the
//! temp file is removed and the destination never appears.

mod worker;

use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::manager::ProgressSink;
use crate::mapping::FileMapping;
use crate::naming;
use crate::request::wire::{self, TlsPolicy, WireResponse};
use crate::request::{parse_supported_url, Success, TransferError};
use crate::segmenter::{plan_segments, Segment};
use crate::types::{HeaderMap, RequestContext};

use worker::WorkerMsg;

pub(crate) fn run(
    ctx: &RequestContext,
    sink: &ProgressSink,
    cancel: &CancellationToken,
    tls: TlsPolicy,
) -> Result<Success, TransferError> {
    let cfg = ctx.download.as_ref().ok_or_else(|| {
        TransferError::Validation("Configuration error: download configuration missing".into())
    })?;
    let url = parse_supported_url(&ctx.url)?;

    // 1. Probe the size. The canonical URL may move across redirects.
    let (url, head_headers) = probe_head(ctx, url, cancel, tls)?;
    let file_size = head_headers
        .get("Content-Length")
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .ok_or_else(|| {
            TransferError::Validation("Server error: Content-Length header not provided".into())
        })?;

    // 2. Destination and temp paths.
    let dest = naming::resolve_save_path(ctx, cfg)
        .map_err(|e| TransferError::Validation(format!("{:#}", e)))?;
    let temp = naming::temp_download_path(&dest);

    // 3. Pre-allocated mapping shared by all segment workers.
    let mapping = Arc::new(FileMapping::open(&temp, file_size).map_err(|e| {
        TransferError::Storage(format!("failed to create memory mapped file - {:#}", e))
    })?);

    let thread_count = effective_thread_count(cfg.thread_count);
    let segments = plan_segments(file_size, thread_count);
    tracing::debug!(
        id = ctx.task.id,
        file_size,
        thread_count,
        dest = %dest.display(),
        "starting multi-segment download"
    );

    let started = Instant::now();
    let outcome = download_all(ctx, &url, &segments, &mapping, sink, cancel, tls, file_size);

    match outcome {
        Ok(()) => {}
        Err(e) => {
            cleanup_temp(&mapping);
            return Err(e);
        }
    }

    // 4. Finalize: flush, unmap, atomic rename.
    if let Err(e) = mapping.flush() {
        cleanup_temp(&mapping);
        return Err(TransferError::Storage(format!("{:#}", e)));
    }
    mapping.close();
    if let Err(e) = rename_temp_to_final(ctx, &temp, &dest) {
        remove_quiet(&temp);
        return Err(e);
    }

    let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
    let speed = (file_size as f64 / 1024.0 / 1024.0) / elapsed;
    let summary = format!(
        "The download took {:.2} seconds in total, with an average speed of {:.2} MB/s.",
        elapsed, speed
    );
    tracing::debug!(id = ctx.task.id, "{}", summary);

    Ok(Success {
        body: summary.into_bytes(),
        headers: head_headers,
        bytes_received: file_size,
        bytes_sent: 0,
    })
}

/// Spawn one worker per segment and fold their terminals: all must succeed.
/// The first failure cancels the siblings and wins the error message.
#[allow(clippy::too_many_arguments)]
fn download_all(
    ctx: &RequestContext,
    url: &Url,
    segments: &[Segment],
    mapping: &Arc<FileMapping>,
    sink: &ProgressSink,
    cancel: &CancellationToken,
    tls: TlsPolicy,
    file_size: u64,
) -> Result<(), TransferError> {
    let n = segments.len();
    let started = Instant::now();
    let siblings = cancel.child_token();
    let (tx, rx) = mpsc::channel::<WorkerMsg>();

    let mut handles = Vec::with_capacity(n);
    let mut success = 0usize;
    for (index, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            // More segments than bytes; nothing to fetch for this one.
            success += 1;
            continue;
        }
        let view = mapping.view(segment.start, segment.end);
        let worker_ctx = ctx.clone();
        let worker_url = url.clone();
        let worker_tx = tx.clone();
        let worker_cancel = siblings.clone();
        handles.push(std::thread::spawn(move || {
            worker::run(
                index,
                worker_ctx,
                worker_url,
                view,
                worker_tx,
                worker_cancel,
                tls,
            )
        }));
    }
    drop(tx);

    let mut bytes = vec![0u64; n];
    let mut finished: HashSet<usize> = HashSet::new();
    let mut failed = 0usize;
    let mut first_error: Option<TransferError> = None;
    let mut last_percent = 0u64;

    for msg in rx {
        match msg {
            WorkerMsg::Progress { index, received } => {
                if failed > 0 || index >= n {
                    continue;
                }
                bytes[index] = received;
                let total_received: u64 = bytes.iter().sum();
                let percent = (total_received as u128 * 100 / file_size as u128) as u64;
                if percent > last_percent {
                    last_percent = percent;
                    sink.download_now(total_received, file_size);
                }
            }
            WorkerMsg::Done { index, result } => {
                if !finished.insert(index) {
                    tracing::debug!(part = index, "repeated part finished, ignored");
                    continue;
                }
                match result {
                    Ok(()) => success += 1,
                    Err(e) => {
                        failed += 1;
                        if failed == 1 {
                            siblings.cancel();
                        }
                        if first_error.is_none() && !e.is_cancelled() {
                            first_error =
                                Some(TransferError::Validation(format!("Part {}: {}", index, e)));
                        }
                    }
                }
            }
        }
    }
    for handle in handles {
        let _ = handle.join();
    }

    if cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    if success < n {
        return Err(TransferError::Validation(
            "Download error: not all segments completed".into(),
        ));
    }

    if last_percent < 100 {
        sink.download_now(file_size, file_size);
    }
    let elapsed = started.elapsed().as_secs_f64();
    tracing::debug!(id = ctx.task.id, elapsed_s = elapsed, "all segments finished");
    Ok(())
}

/// HEAD with the redirect budget; returns the final URL and its headers.
fn probe_head(
    ctx: &RequestContext,
    mut url: Url,
    cancel: &CancellationToken,
    tls: TlsPolicy,
) -> Result<(Url, HeaderMap), TransferError> {
    let mut hops: u16 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let wire = perform_head(ctx, &url, cancel, tls)?;
        if wire.is_redirect() {
            if let Some(next) = wire::redirect_target(&url, &wire) {
                if hops < ctx.behavior.max_redirects {
                    hops += 1;
                    tracing::debug!(from = %url, to = %next, "redirecting HEAD");
                    url = next;
                    continue;
                }
            }
            return Err(TransferError::Http(wire.status));
        }
        if !(200..300).contains(&wire.status) {
            return Err(TransferError::Http(wire.status));
        }
        return Ok((url, wire.headers));
    }
}

fn perform_head(
    ctx: &RequestContext,
    url: &Url,
    cancel: &CancellationToken,
    tls: TlsPolicy,
) -> Result<WireResponse, TransferError> {
    let mut easy = wire::new_easy(ctx, url, tls)?;
    easy.nobody(true).map_err(TransferError::Curl)?;
    easy.http_headers(wire::header_list(ctx, &[])?)
        .map_err(TransferError::Curl)?;

    let mut header_lines: Vec<String> = Vec::new();
    {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                wire::collect_header_line(&mut header_lines, data);
                true
            })
            .map_err(TransferError::Curl)?;
        transfer
            .progress_function(|_, _, _, _| !cancel.is_cancelled())
            .map_err(TransferError::Curl)?;
        transfer
            .perform()
            .map_err(|e| TransferError::from_curl(e, None))?;
    }
    let status = easy.response_code().map_err(TransferError::Curl)?;
    Ok(WireResponse {
        status,
        headers: wire::parse_header_lines(&header_lines),
    })
}

/// Segment count: 0 selects the CPU core count; the multi-segment path
/// always uses at least 2.
fn effective_thread_count(configured: u16) -> usize {
    let n = if configured == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
    } else {
        configured as usize
    };
    n.max(2)
}

/// Rename policy: an existing destination is replaced only with
/// `overwrite`; otherwise the download fails and the temp file is removed.
fn rename_temp_to_final(
    ctx: &RequestContext,
    temp: &std::path::Path,
    dest: &std::path::Path,
) -> Result<(), TransferError> {
    if dest.exists() {
        let overwrite = ctx.download.as_ref().map(|c| c.overwrite).unwrap_or(false);
        if !overwrite {
            return Err(TransferError::Validation(
                "File conflict: destination file already exists and overwrite is disabled".into(),
            ));
        }
        std::fs::remove_file(dest).map_err(|e| {
            TransferError::Storage(format!(
                "unable to remove existing file '{}': {}",
                dest.display(),
                e
            ))
        })?;
    }
    std::fs::rename(temp, dest).map_err(|e| {
        TransferError::Storage(format!(
            "failed to rename '{}' to '{}': {}",
            temp.display(),
            dest.display(),
            e
        ))
    })
}

fn cleanup_temp(mapping: &Arc<FileMapping>) {
    mapping.close();
    remove_quiet(mapping.path());
}

fn remove_quiet(path: &std::path::Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("failed to remove temp file {}: {}", path.display(), e);
        }
    }
}
