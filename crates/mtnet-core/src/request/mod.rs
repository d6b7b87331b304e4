//! Per-request executors.
//!
//! One request context is executed by exactly one executor, selected by
//! kind: the common method executor, the streaming download executor, the
//! upload executor, or the multi-segment download coordinator (which lives
//! in [`crate::transfer`]). Executors run on worker-pool threads; they
//! observe the request's cancellation token and report progress through
//! the manager sink.

mod common;
mod download;
mod error;
pub mod form;
mod upload;
pub(crate) mod wire;

pub use error::TransferError;
pub use form::mime_for_path;
pub use wire::TlsPolicy;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::manager::ProgressSink;
use crate::retry::{classify, RetryDecision, RetryPolicy};
use crate::types::{HeaderMap, RequestContext, RequestKind, ResponseResult};

/// Terminal payload of a successful network operation.
pub(crate) struct Success {
    pub body: Vec<u8>,
    pub headers: HeaderMap,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Parse and validate a URL for the supported schemes.
pub(crate) fn parse_supported_url(raw: &str) -> Result<Url, TransferError> {
    let url = Url::parse(raw).map_err(|_| {
        TransferError::Validation(format!("Network error: Invalid URL format - {}", raw))
    })?;
    match url.scheme() {
        "http" | "https" | "ftp" => Ok(url),
        other => Err(TransferError::Validation(format!(
            "Network error: unsupported URL scheme '{}' - {}",
            other, raw
        ))),
    }
}

/// Quick URL validity check used at submission time.
pub fn is_supported_url(raw: &str) -> bool {
    parse_supported_url(raw).is_ok()
}

/// Run the executor for `ctx` to completion and fold the outcome into a
/// response. Exactly one terminal result is produced per call.
pub(crate) fn execute(
    ctx: &RequestContext,
    sink: &ProgressSink,
    cancel: &CancellationToken,
    tls: TlsPolicy,
) -> ResponseResult {
    match run_with_retry(ctx, sink, cancel, tls) {
        Ok(s) => {
            let mut rsp = base_result(ctx);
            rsp.success = true;
            rsp.body = s.body;
            rsp.headers = s.headers;
            rsp.performance.bytes_received = s.bytes_received;
            rsp.performance.bytes_sent = s.bytes_sent;
            rsp
        }
        Err(e) if e.is_cancelled() => {
            let mut rsp = base_result(ctx);
            rsp.cancelled = true;
            rsp.error_message = "Operation canceled".into();
            rsp
        }
        Err(e) => {
            let msg = e.to_string();
            tracing::debug!(kind = ctx.kind.as_str(), id = ctx.task.id, "{}", msg);
            let mut rsp = base_result(ctx);
            rsp.error_message = msg;
            rsp
        }
    }
}

fn dispatch(
    ctx: &RequestContext,
    sink: &ProgressSink,
    cancel: &CancellationToken,
    tls: TlsPolicy,
) -> Result<Success, TransferError> {
    match ctx.kind {
        RequestKind::Get
        | RequestKind::Post
        | RequestKind::Put
        | RequestKind::Delete
        | RequestKind::Head => common::run(ctx, sink, cancel, tls),
        RequestKind::Upload => upload::run(ctx, sink, cancel, tls),
        RequestKind::Download => {
            // thread_count 1 keeps the plain streaming path; anything else
            // (including 0 = auto) selects the multi-segment engine.
            let single = ctx
                .download
                .as_ref()
                .map(|c| c.thread_count == 1)
                .unwrap_or(false);
            if single {
                download::run(ctx, sink, cancel, tls)
            } else {
                crate::transfer::run(ctx, sink, cancel, tls)
            }
        }
        RequestKind::MtDownload => crate::transfer::run(ctx, sink, cancel, tls),
    }
}

/// Transient failures are retried with bounded backoff when the request
/// opted in, for idempotent kinds only.
fn run_with_retry(
    ctx: &RequestContext,
    sink: &ProgressSink,
    cancel: &CancellationToken,
    tls: TlsPolicy,
) -> Result<Success, TransferError> {
    let single_download = ctx.kind == RequestKind::Download
        && ctx
            .download
            .as_ref()
            .map(|c| c.thread_count == 1)
            .unwrap_or(false);
    let eligible = matches!(ctx.kind, RequestKind::Get | RequestKind::Head) || single_download;
    if !ctx.behavior.retry_on_failed || !eligible {
        return dispatch(ctx, sink, cancel, tls);
    }

    let policy = RetryPolicy::default();
    let mut attempt = 1u32;
    loop {
        let err = match dispatch(ctx, sink, cancel, tls) {
            Ok(s) => return Ok(s),
            Err(e) => e,
        };
        match policy.decide(attempt, classify(&err)) {
            RetryDecision::RetryAfter(delay) => {
                tracing::warn!(
                    id = ctx.task.id,
                    attempt,
                    "retrying after {:?}: {}",
                    delay,
                    err
                );
                if !sleep_unless_cancelled(delay, cancel) {
                    return Err(TransferError::Cancelled);
                }
                attempt += 1;
            }
            RetryDecision::NoRetry => return Err(err),
        }
    }
}

/// Sleep in small slices so a cancellation during backoff is honored
/// promptly. Returns false when cancelled.
fn sleep_unless_cancelled(delay: std::time::Duration, cancel: &CancellationToken) -> bool {
    let step = std::time::Duration::from_millis(50);
    let deadline = std::time::Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return true;
        }
        std::thread::sleep(step.min(remaining));
    }
}

fn base_result(ctx: &RequestContext) -> ResponseResult {
    ResponseResult {
        task: ctx.task.clone(),
        user_context: ctx.user_context.clone(),
        ..Default::default()
    }
}
