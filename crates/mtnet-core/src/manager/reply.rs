//! Caller-visible reply handle.
//!
//! One `Reply` per single request, one per batch. The manager writes
//! tagged events into the handle's channel; dropping the handle while
//! events are in flight is fine, they are silently discarded.

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::types::{ResponseResult, TaskData};

/// Events delivered through a [`Reply`].
#[derive(Debug, Clone)]
pub enum ReplyEvent {
    /// Terminal result: once per single request, once per batch member.
    Finished(ResponseResult),
    DownloadProgress { received: u64, total: u64 },
    UploadProgress { sent: u64, total: u64 },
    /// Summed bytes across all members of a batch.
    BatchDownloadProgress { received: u64 },
    BatchUploadProgress { sent: u64 },
    /// Emitted after the last member of a batch terminates (or after the
    /// terminating failure when `abort_batch_on_failed` is set).
    BatchFinished { batch_id: u64, all_success: bool },
}

/// Subscription handle returned by `submit`/`submit_batch`.
pub struct Reply {
    task: TaskData,
    rx: UnboundedReceiver<ReplyEvent>,
}

impl Reply {
    pub(crate) fn new(task: TaskData) -> (Self, UnboundedSender<ReplyEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self { task, rx }, tx)
    }

    /// Ids assigned at submission (for a batch handle only `batch_id` is
    /// set).
    pub fn task(&self) -> &TaskData {
        &self.task
    }

    pub fn is_batch(&self) -> bool {
        self.task.batch_id > 0
    }

    /// Next event, or `None` once the manager has dropped its sender after
    /// the terminal event.
    pub async fn recv(&mut self) -> Option<ReplyEvent> {
        self.rx.recv().await
    }

    /// Blocking variant of [`Reply::recv`] for synchronous callers. Must
    /// not be called from an async context.
    pub fn blocking_recv(&mut self) -> Option<ReplyEvent> {
        self.rx.blocking_recv()
    }

    /// Already-queued event, if any.
    pub fn try_recv(&mut self) -> Option<ReplyEvent> {
        self.rx.try_recv().ok()
    }

    /// Skip progress events and return the next terminal result.
    pub async fn wait_finished(&mut self) -> Option<ResponseResult> {
        while let Some(event) = self.rx.recv().await {
            if let ReplyEvent::Finished(rsp) = event {
                return Some(rsp);
            }
        }
        None
    }

    /// Blocking variant of [`Reply::wait_finished`].
    pub fn blocking_wait_finished(&mut self) -> Option<ResponseResult> {
        while let Some(event) = self.rx.blocking_recv() {
            if let ReplyEvent::Finished(rsp) = event {
                return Some(rsp);
            }
        }
        None
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply").field("task", &self.task).finish()
    }
}
