//! Process-wide request manager.
//!
//! Owns the worker pool and the registries tying ids to runnables and
//! reply handles. Executors post progress and terminal results over one
//! unbounded channel; a single event-processor task serializes registry
//! mutation and fan-out, while the cancellation entry points take the same
//! registry lock directly. Handlers never run under the lock — delivery to
//! a reply handle is just a channel send.

pub(crate) mod events;
mod reply;
mod runnable;
mod state;

pub use reply::{Reply, ReplyEvent};

pub(crate) use events::{ManagerEvent, ProgressSink};

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::runtime::Runtime;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::ManagerConfig;
use crate::request::{self, TlsPolicy};
use crate::types::{RequestContext, ResponseResult, TaskData};

use state::{Registries, RunnableHandle};

// Lifecycle states, held in one atomic. All public entry points require
// `Ready`.
const STATE_UNINITIALIZED: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_SHUTTING_DOWN: u8 = 3;

static LIFECYCLE: AtomicU8 = AtomicU8::new(STATE_UNINITIALIZED);

// Process-monotonic id counters. 0 is reserved as "none"; the first
// assigned id of each kind is 1.
static REQUEST_ID: AtomicU64 = AtomicU64::new(0);
static BATCH_ID: AtomicU64 = AtomicU64::new(0);
static SESSION_ID: AtomicU64 = AtomicU64::new(0);

static GLOBAL: Mutex<Option<Arc<RequestManager>>> = Mutex::new(None);

fn next_request_id() -> u64 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed) + 1
}

fn next_batch_id() -> u64 {
    BATCH_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// The process-wide scheduler. Obtain it with [`RequestManager::global`]
/// after [`RequestManager::initialize`].
pub struct RequestManager {
    runtime: Runtime,
    pool: Arc<Semaphore>,
    pool_size: AtomicUsize,
    tls: TlsPolicy,
    events_tx: UnboundedSender<ManagerEvent>,
    shared: Arc<SharedState>,
}

struct SharedState {
    registries: Mutex<Registries>,
    stop_all: AtomicBool,
}

impl RequestManager {
    /// Initialize the global manager with defaults. Call once before any
    /// request, from the application's main thread. Returns false when
    /// already initialized.
    pub fn initialize() -> bool {
        Self::initialize_with(ManagerConfig::default())
    }

    /// Initialize with an explicit configuration.
    pub fn initialize_with(config: ManagerConfig) -> bool {
        if LIFECYCLE
            .compare_exchange(
                STATE_UNINITIALIZED,
                STATE_INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        let workers = config.effective_workers();
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("mtnet")
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!("failed to build runtime: {}", e);
                LIFECYCLE.store(STATE_UNINITIALIZED, Ordering::Release);
                return false;
            }
        };

        let shared = Arc::new(SharedState {
            registries: Mutex::new(Registries::default()),
            stop_all: AtomicBool::new(false),
        });
        let (events_tx, events_rx) = unbounded_channel();
        runtime.spawn(event_loop(events_rx, Arc::clone(&shared)));

        let manager = Arc::new(RequestManager {
            runtime,
            pool: Arc::new(Semaphore::new(workers)),
            pool_size: AtomicUsize::new(workers),
            tls: TlsPolicy {
                verify_peer: config.tls_verify_peer,
            },
            events_tx,
            shared,
        });
        *GLOBAL.lock().unwrap() = Some(manager);
        LIFECYCLE.store(STATE_READY, Ordering::Release);
        tracing::debug!(workers, "request manager initialized");
        true
    }

    /// Tear down the global manager: cancel everything, close the pool and
    /// wait for in-flight workers to notice. Call from the application's
    /// main thread before exit.
    pub fn uninitialize() {
        if LIFECYCLE
            .compare_exchange(
                STATE_READY,
                STATE_SHUTTING_DOWN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        let manager = GLOBAL.lock().unwrap().take();
        if let Some(manager) = manager {
            manager.cancel_all();
            manager.pool.close();
            // Dropping the last Arc drops the runtime, which waits for
            // started blocking workers; cancelled transfers abort at their
            // next progress callback.
            drop(manager);
        }
        LIFECYCLE.store(STATE_UNINITIALIZED, Ordering::Release);
        tracing::debug!("request manager uninitialized");
    }

    pub fn is_initialized() -> bool {
        LIFECYCLE.load(Ordering::Acquire) == STATE_READY
    }

    /// The global instance, when initialized.
    pub fn global() -> Option<Arc<RequestManager>> {
        if !Self::is_initialized() {
            return None;
        }
        GLOBAL.lock().unwrap().clone()
    }

    /// Asynchronously execute a single request. Returns `None` for an
    /// invalid URL (scheme must be http, https or ftp) or when the manager
    /// is not initialized.
    pub fn submit(&self, mut ctx: RequestContext) -> Option<Reply> {
        if !Self::is_initialized() {
            tracing::debug!("submit before initialize() is ignored");
            return None;
        }
        if !request::is_supported_url(&ctx.url) {
            return None;
        }
        self.shared.stop_all.store(false, Ordering::Release);

        let id = next_request_id();
        ctx.task.id = id;
        ctx.task.create_time = Some(SystemTime::now());
        let (reply, tx) = Reply::new(ctx.task.clone());
        {
            let mut reg = self.shared.registries.lock().unwrap();
            reg.reply.insert(id, tx);
            if ctx.task.session_id > 0 {
                reg.session_to_ids
                    .entry(ctx.task.session_id)
                    .or_default()
                    .push(id);
            }
        }
        self.spawn_runnable(ctx);
        Some(reply)
    }

    /// Asynchronously execute a batch. All members share one reply handle
    /// and the returned batch id. Returns `None` for an empty batch.
    pub fn submit_batch(&self, contexts: Vec<RequestContext>) -> Option<(Reply, u64)> {
        if !Self::is_initialized() || contexts.is_empty() {
            return None;
        }
        self.shared.stop_all.store(false, Ordering::Release);

        let batch_id = next_batch_id();
        let batch_task = TaskData {
            batch_id,
            ..Default::default()
        };
        let (reply, tx) = Reply::new(batch_task);
        {
            let mut reg = self.shared.registries.lock().unwrap();
            reg.batch_reply.insert(batch_id, tx);
            reg.batch_total.insert(batch_id, contexts.len());
            reg.batch_done.insert(batch_id, 0);
            reg.batch_all_success.insert(batch_id, true);
        }
        for mut ctx in contexts {
            ctx.task.batch_id = batch_id;
            ctx.task.id = next_request_id();
            ctx.task.create_time = Some(SystemTime::now());
            self.spawn_runnable(ctx);
        }
        Some((reply, batch_id))
    }

    /// Synchronous variant: runs the request on the caller's thread when a
    /// pool slot is free (no queuing) and invokes `callback` with the
    /// result before returning. Returns false for an invalid URL or a full
    /// pool. `_block_input` is advisory, kept for parity with GUI hosts.
    pub fn send(
        &self,
        mut ctx: RequestContext,
        callback: impl FnOnce(ResponseResult),
        _block_input: bool,
    ) -> bool {
        if !Self::is_initialized() || !request::is_supported_url(&ctx.url) {
            return false;
        }
        let permit = match self.pool.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => return false,
        };

        ctx.task.id = next_request_id();
        ctx.task.create_time = Some(SystemTime::now());
        let cancel = CancellationToken::new();
        let sink = ProgressSink::new(
            self.events_tx.clone(),
            ctx.task.id,
            0,
            ctx.behavior.show_progress,
        );
        let start_time = SystemTime::now();
        let mut rsp = request::execute(&ctx, &sink, &cancel, self.tls);
        rsp.task.start_time = Some(start_time);
        rsp.task.end_time = Some(SystemTime::now());
        rsp.performance.duration_ms = duration_ms(&rsp.task);
        drop(permit);
        callback(rsp);
        true
    }

    /// Cancel one request. Best-effort: a queued runnable is dropped
    /// silently, a running one is aborted at its next cancellation point;
    /// either way the reply receives a synthetic cancelled result now and
    /// the id leaves all registries.
    pub fn cancel(&self, id: u64) {
        if id == 0 {
            return;
        }
        let (reply_tx, task) = {
            let mut reg = self.shared.registries.lock().unwrap();
            let tx = reg.reply.remove(&id);
            let task = reg.runnable.remove(&id).map(|handle| {
                handle.cancel.cancel();
                handle.task
            });
            (tx, task)
        };
        if let Some(tx) = reply_tx {
            let mut rsp = ResponseResult {
                task: task.unwrap_or(TaskData {
                    id,
                    ..Default::default()
                }),
                cancelled: true,
                ..Default::default()
            };
            rsp.task.end_time = Some(SystemTime::now());
            rsp.body = format!("Operation canceled (id: {})", id).into_bytes();
            let _ = tx.send(ReplyEvent::Finished(rsp));
        }
    }

    /// Cancel every member of a batch and purge the batch state. The batch
    /// reply receives one synthetic cancelled result.
    pub fn cancel_batch(&self, batch_id: u64) {
        if batch_id == 0 {
            return;
        }
        let reply_tx = {
            let mut reg = self.shared.registries.lock().unwrap();
            let tx = reg.batch_reply.remove(&batch_id);
            reg.runnable.retain(|_, handle| {
                if handle.task.batch_id == batch_id {
                    handle.cancel.cancel();
                    false
                } else {
                    true
                }
            });
            reg.purge_batch(batch_id);
            tx
        };
        if let Some(tx) = reply_tx {
            let mut rsp = ResponseResult {
                task: TaskData {
                    batch_id,
                    ..Default::default()
                },
                cancelled: true,
                ..Default::default()
            };
            rsp.task.end_time = Some(SystemTime::now());
            rsp.body = format!("Operation canceled (Batch id: {})", batch_id).into_bytes();
            let _ = tx.send(ReplyEvent::Finished(rsp));
        }
    }

    /// Stop a whole session: running members are cancelled, their single
    /// replies dropped, and any late responses for the session discarded.
    pub fn cancel_session(&self, session_id: u64) {
        if session_id == 0 {
            return;
        }
        let mut reg = self.shared.registries.lock().unwrap();
        reg.stopped_sessions.insert(session_id);
        reg.runnable.retain(|_, handle| {
            if handle.task.session_id == session_id {
                handle.cancel.cancel();
                false
            } else {
                true
            }
        });
        if let Some(ids) = reg.session_to_ids.remove(&session_id) {
            for id in ids {
                reg.reply.remove(&id);
            }
        }
    }

    /// Stop everything. Late progress and response events arriving after
    /// the barrier are discarded until the next submission.
    pub fn cancel_all(&self) {
        if self.shared.stop_all.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut reg = self.shared.registries.lock().unwrap();
        for handle in reg.runnable.values() {
            handle.cancel.cancel();
        }
        reg.reset();
    }

    /// Resize the worker pool. Values outside `1..=100` are rejected.
    /// Shrinking takes effect as running workers finish.
    pub fn set_max_workers(&self, n: usize) -> bool {
        if !(1..=100).contains(&n) {
            return false;
        }
        let old = self.pool_size.swap(n, Ordering::AcqRel);
        if n > old {
            self.pool.add_permits(n - old);
        } else if n < old {
            let pool = Arc::clone(&self.pool);
            let excess = (old - n) as u32;
            self.runtime.spawn(async move {
                if let Ok(permits) = pool.acquire_many_owned(excess).await {
                    permits.forget();
                }
            });
        }
        tracing::debug!(workers = n, "worker pool resized");
        true
    }

    pub fn max_workers(&self) -> usize {
        self.pool_size.load(Ordering::Acquire)
    }

    /// Next session id (atomic, >= 1). Sessions are purely a cancellation
    /// scope; group tasks by stamping this into their contexts.
    pub fn next_session_id(&self) -> u64 {
        SESSION_ID.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn spawn_runnable(&self, ctx: RequestContext) {
        let cancel = CancellationToken::new();
        {
            let mut reg = self.shared.registries.lock().unwrap();
            reg.runnable.insert(
                ctx.task.id,
                RunnableHandle {
                    task: ctx.task.clone(),
                    cancel: cancel.clone(),
                },
            );
        }
        self.runtime.spawn(runnable::run(
            ctx,
            Arc::clone(&self.pool),
            cancel,
            self.events_tx.clone(),
            self.tls,
        ));
    }
}

/// Single consumer of executor events; the only place registry state moves
/// in response to progress and terminal results.
async fn event_loop(mut rx: UnboundedReceiver<ManagerEvent>, shared: Arc<SharedState>) {
    while let Some(event) = rx.recv().await {
        match event {
            ManagerEvent::Progress {
                id,
                batch_id,
                bytes,
                total,
                download,
            } => handle_progress(&shared, id, batch_id, bytes, total, download),
            ManagerEvent::Response(rsp) => handle_response(&shared, rsp),
        }
    }
}

fn handle_progress(
    shared: &SharedState,
    id: u64,
    batch_id: u64,
    bytes: u64,
    total: u64,
    download: bool,
) {
    if shared.stop_all.load(Ordering::Acquire) || id == 0 {
        return;
    }
    let mut reg = shared.registries.lock().unwrap();

    if let Some(tx) = reg.reply.get(&id) {
        let event = if download {
            ReplyEvent::DownloadProgress {
                received: bytes,
                total,
            }
        } else {
            ReplyEvent::UploadProgress { sent: bytes, total }
        };
        let _ = tx.send(event);
    }

    if batch_id > 0 && reg.batch_reply.contains_key(&batch_id) {
        let sum = reg.update_batch_progress(id, batch_id, bytes, download);
        if let Some(tx) = reg.batch_reply.get(&batch_id) {
            let event = if download {
                ReplyEvent::BatchDownloadProgress { received: sum }
            } else {
                ReplyEvent::BatchUploadProgress { sent: sum }
            };
            let _ = tx.send(event);
        }
    }
}

fn handle_response(shared: &SharedState, mut rsp: ResponseResult) {
    if shared.stop_all.load(Ordering::Acquire) {
        return;
    }
    let mut reg = shared.registries.lock().unwrap();
    let id = rsp.task.id;
    let batch_id = rsp.task.batch_id;

    if rsp.task.session_id > 0 && reg.stopped_sessions.contains(&rsp.task.session_id) {
        reg.runnable.remove(&id);
        return;
    }
    rsp.performance.duration_ms = duration_ms(&rsp.task);
    reg.runnable.remove(&id);

    if batch_id == 0 {
        match reg.reply.remove(&id) {
            Some(tx) => {
                let _ = tx.send(ReplyEvent::Finished(rsp));
            }
            None => tracing::debug!(id, "no reply registered for response"),
        }
        return;
    }

    let total = reg.batch_total.get(&batch_id).copied().unwrap_or(0);
    let finished = reg.batch_done.get(&batch_id).copied().unwrap_or(0) + 1;
    if total > 0 {
        reg.batch_done.insert(batch_id, finished);
    }
    let all_success = {
        let entry = reg.batch_all_success.entry(batch_id).or_insert(true);
        *entry &= rsp.success;
        *entry
    };
    let abort_rest = !rsp.success && rsp.task.abort_batch_on_failed;
    let destroyed = finished >= total || abort_rest;

    let tx = if destroyed {
        reg.batch_reply.remove(&batch_id)
    } else {
        reg.batch_reply.get(&batch_id).cloned()
    };
    if destroyed {
        reg.purge_batch(batch_id);
    }
    if abort_rest {
        reg.runnable.retain(|_, handle| {
            if handle.task.batch_id == batch_id {
                handle.cancel.cancel();
                false
            } else {
                true
            }
        });
    }
    if let Some(tx) = tx {
        let _ = tx.send(ReplyEvent::Finished(rsp));
        if destroyed {
            tracing::debug!(batch_id, all_success, "batch request finished");
            let _ = tx.send(ReplyEvent::BatchFinished {
                batch_id,
                all_success,
            });
        }
    }
}

fn duration_ms(task: &TaskData) -> u64 {
    match (task.start_time, task.end_time) {
        (Some(start), Some(end)) => end
            .duration_since(start)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_counters_are_monotonic_and_nonzero() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(a >= 1);
        assert!(b > a);
        let x = next_batch_id();
        let y = next_batch_id();
        assert!(x >= 1);
        assert!(y > x);
    }

    #[test]
    fn duration_ms_requires_both_stamps() {
        let mut task = TaskData::default();
        assert_eq!(duration_ms(&task), 0);
        let start = SystemTime::now();
        task.start_time = Some(start);
        task.end_time = Some(start + std::time::Duration::from_millis(1500));
        assert_eq!(duration_ms(&task), 1500);
    }

    #[test]
    fn lifecycle_entry_points_require_ready() {
        // Not initialized in unit tests: entry points reject politely.
        assert!(!RequestManager::is_initialized());
        assert!(RequestManager::global().is_none());
    }
}
