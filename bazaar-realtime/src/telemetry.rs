//! User-visible failure reporting.
//!
//! The reporter is constructed once by the process bootstrap and handed to
//! every session that needs it. It buffers reports in a bounded queue;
//! `flush` drains and logs them, `shutdown` flushes one last time and
//! refuses anything reported afterwards.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::Mutex;

use crate::error::SyncError;

/// One reported failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub id: u64,
    pub at: SystemTime,
    pub error: SyncError,
}

pub struct ErrorReporter {
    capacity: usize,
    queue: Mutex<VecDeque<ErrorReport>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl ErrorReporter {
    /// Create a reporter holding at most `capacity` pending reports.
    pub fn init(capacity: usize) -> Arc<Self> {
        log::debug!("error reporter ready (capacity {capacity})");
        Arc::new(Self {
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Queue a failure. Returns `false` once the reporter is shut down.
    /// When full, the oldest report makes room.
    pub async fn report(&self, error: &SyncError) -> bool {
        if self.closed.load(Ordering::Acquire) {
            log::debug!("error reporter closed, dropping: {error}");
            return false;
        }
        let report = ErrorReport {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            at: SystemTime::now(),
            error: error.clone(),
        };

        let mut queue = self.queue.lock().await;
        if queue.len() >= self.capacity {
            if let Some(oldest) = queue.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("error queue full, dropping report #{}: {}", oldest.id, oldest.error);
            }
        }
        queue.push_back(report);
        true
    }

    /// Drain pending reports, logging each one.
    pub async fn flush(&self) -> Vec<ErrorReport> {
        let reports: Vec<ErrorReport> = self.queue.lock().await.drain(..).collect();
        for report in &reports {
            log::error!("[#{}] {}", report.id, report.error);
        }
        reports
    }

    /// Final flush; later reports are refused.
    pub async fn shutdown(&self) -> Vec<ErrorReport> {
        self.closed.store(true, Ordering::Release);
        let reports = self.flush().await;
        log::debug!(
            "error reporter shut down ({} flushed, {} dropped)",
            reports.len(),
            self.dropped.load(Ordering::Relaxed)
        );
        reports
    }

    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
