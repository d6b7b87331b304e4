//! Internal events flowing from executors into the manager's processor.
//!
//! Executors run on pool threads; everything they need to tell the manager
//! (progress ticks, terminal results) travels as a tagged variant over one
//! unbounded channel into a single event-processor task, which owns all
//! registry mutation and reply fan-out.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;

use crate::types::ResponseResult;

/// Minimum interval between progress reports of one transfer direction.
pub(crate) const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub(crate) enum ManagerEvent {
    Progress {
        id: u64,
        batch_id: u64,
        bytes: u64,
        total: u64,
        download: bool,
    },
    Response(ResponseResult),
}

/// Per-request progress emitter handed to the executor. Applies the
/// `show_progress` gate and the 250 ms floor; dropped events are fine, the
/// next tick carries the cumulative count.
pub(crate) struct ProgressSink {
    tx: UnboundedSender<ManagerEvent>,
    id: u64,
    batch_id: u64,
    enabled: bool,
    last_download: Mutex<Option<Instant>>,
    last_upload: Mutex<Option<Instant>>,
}

impl ProgressSink {
    pub fn new(tx: UnboundedSender<ManagerEvent>, id: u64, batch_id: u64, enabled: bool) -> Self {
        Self {
            tx,
            id,
            batch_id,
            enabled,
            last_download: Mutex::new(None),
            last_upload: Mutex::new(None),
        }
    }

    /// Throttled download progress.
    pub fn download(&self, bytes: u64, total: u64) {
        if self.pass(&self.last_download) {
            self.emit(bytes, total, true);
        }
    }

    /// Unthrottled download progress, for the multi-segment coordinator
    /// which applies its own percent gate.
    pub fn download_now(&self, bytes: u64, total: u64) {
        self.emit(bytes, total, true);
    }

    /// Throttled upload progress.
    pub fn upload(&self, bytes: u64, total: u64) {
        if self.pass(&self.last_upload) {
            self.emit(bytes, total, false);
        }
    }

    fn emit(&self, bytes: u64, total: u64, download: bool) {
        if !self.enabled || bytes == 0 || total == 0 {
            return;
        }
        let _ = self.tx.send(ManagerEvent::Progress {
            id: self.id,
            batch_id: self.batch_id,
            bytes,
            total,
            download,
        });
    }

    fn pass(&self, slot: &Mutex<Option<Instant>>) -> bool {
        if !self.enabled {
            return false;
        }
        let mut last = slot.lock().unwrap();
        let now = Instant::now();
        match *last {
            Some(t) if now.duration_since(t) < PROGRESS_INTERVAL => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
