//! The pool-schedulable unit wrapping one request context.
//!
//! A runnable is an async task: it waits for a worker-pool permit, runs
//! the blocking executor on the blocking pool, stamps start/end times and
//! emits exactly one response event — unless it was cancelled while still
//! queued, in which case it exits silently (the manager has already
//! delivered the synthetic cancelled result).

use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::request::{self, TlsPolicy};
use crate::types::{RequestContext, ResponseResult};

use super::events::{ManagerEvent, ProgressSink};

pub(crate) async fn run(
    ctx: RequestContext,
    pool: Arc<Semaphore>,
    cancel: CancellationToken,
    events: UnboundedSender<ManagerEvent>,
    tls: TlsPolicy,
) {
    let permit = tokio::select! {
        permit = pool.clone().acquire_owned() => match permit {
            Ok(p) => p,
            // Pool closed: manager shutting down.
            Err(_) => return,
        },
        _ = cancel.cancelled() => return,
    };
    if cancel.is_cancelled() {
        return;
    }

    let start_time = SystemTime::now();
    let task = ctx.task.clone();
    tracing::debug!(id = task.id, kind = ctx.kind.as_str(), "request started");

    let sink = ProgressSink::new(
        events.clone(),
        task.id,
        task.batch_id,
        ctx.behavior.show_progress,
    );
    let worker_cancel = cancel.clone();
    let mut rsp = tokio::task::spawn_blocking(move || {
        request::execute(&ctx, &sink, &worker_cancel, tls)
    })
    .await
    .unwrap_or_else(|e| {
        tracing::error!(id = task.id, "request worker panicked: {}", e);
        ResponseResult {
            task: task.clone(),
            error_message: "Internal error: request worker panicked".into(),
            ..Default::default()
        }
    });

    rsp.task.start_time = Some(start_time);
    rsp.task.end_time = Some(SystemTime::now());
    if cancel.is_cancelled() {
        rsp.cancelled = true;
        rsp.success = false;
    }
    drop(permit);
    let _ = events.send(ManagerEvent::Response(rsp));
}
