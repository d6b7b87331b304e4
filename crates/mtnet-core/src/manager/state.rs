//! Manager registries: runnables, reply handles, batch and session state.
//!
//! All maps live behind one mutex in the manager; mutation happens either
//! in the event-processor task or in the cancellation entry points. Reply
//! delivery is a channel send, so no user code ever runs under the lock.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::types::TaskData;

use super::reply::ReplyEvent;

/// Bookkeeping for one dispatched runnable.
pub(crate) struct RunnableHandle {
    pub task: TaskData,
    pub cancel: CancellationToken,
}

#[derive(Default)]
pub(crate) struct Registries {
    /// id -> dispatched runnable.
    pub runnable: HashMap<u64, RunnableHandle>,
    /// id -> single reply sender (one-to-one).
    pub reply: HashMap<u64, UnboundedSender<ReplyEvent>>,
    /// batch id -> shared reply sender (one-to-many).
    pub batch_reply: HashMap<u64, UnboundedSender<ReplyEvent>>,
    pub session_to_ids: HashMap<u64, Vec<u64>>,
    pub stopped_sessions: HashSet<u64>,
    /// batch id -> expected member count.
    pub batch_total: HashMap<u64, usize>,
    /// batch id -> completed member count.
    pub batch_done: HashMap<u64, usize>,
    /// batch id -> AND of member results so far.
    pub batch_all_success: HashMap<u64, bool>,

    down_bytes_per_task: HashMap<u64, HashMap<u64, u64>>,
    down_total: HashMap<u64, u64>,
    up_bytes_per_task: HashMap<u64, HashMap<u64, u64>>,
    up_total: HashMap<u64, u64>,
}

impl Registries {
    /// Fold one member's cumulative byte count into the batch total.
    ///
    /// Only the positive delta against the member's previous count is
    /// added, so the returned sum never decreases over a batch lifetime.
    pub fn update_batch_progress(
        &mut self,
        id: u64,
        batch_id: u64,
        bytes: u64,
        download: bool,
    ) -> u64 {
        let (per_task, totals) = if download {
            (&mut self.down_bytes_per_task, &mut self.down_total)
        } else {
            (&mut self.up_bytes_per_task, &mut self.up_total)
        };
        if bytes == 0 {
            return totals.get(&batch_id).copied().unwrap_or(0);
        }
        let map = per_task.entry(batch_id).or_default();
        let current = map.get(&id).copied().unwrap_or(0);
        let increased = bytes.saturating_sub(current);
        map.insert(id, bytes);

        let total = totals.entry(batch_id).or_insert(0);
        *total += increased;
        *total
    }

    /// Drop all per-batch state (counters and progress maps).
    pub fn purge_batch(&mut self, batch_id: u64) {
        self.batch_total.remove(&batch_id);
        self.batch_done.remove(&batch_id);
        self.batch_all_success.remove(&batch_id);
        self.down_bytes_per_task.remove(&batch_id);
        self.down_total.remove(&batch_id);
        self.up_bytes_per_task.remove(&batch_id);
        self.up_total.remove(&batch_id);
    }

    /// Clear everything (cancel-all / shutdown).
    pub fn reset(&mut self) {
        self.runnable.clear();
        self.reply.clear();
        self.batch_reply.clear();
        self.session_to_ids.clear();
        self.stopped_sessions.clear();
        self.batch_total.clear();
        self.batch_done.clear();
        self.batch_all_success.clear();
        self.down_bytes_per_task.clear();
        self.down_total.clear();
        self.up_bytes_per_task.clear();
        self.up_total.clear();
    }
}
