//! Queue snapshots for observability.

use serde::{Deserialize, Serialize};

use crate::domain::ProcedureStatus;

/// Procedures currently held by a queue, by status.
///
/// Finished procedures leave the queue, so `cancelled`, `failed` and
/// `finished` only count procedures caught between finishing and removal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub executing: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub finished: usize,
}

impl QueueCounts {
    pub fn record(&mut self, status: ProcedureStatus) {
        match status {
            ProcedureStatus::Pending => self.pending += 1,
            ProcedureStatus::Executing => self.executing += 1,
            ProcedureStatus::Cancelled => self.cancelled += 1,
            ProcedureStatus::Failed => self.failed += 1,
            ProcedureStatus::Finished => self.finished += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.executing + self.cancelled + self.failed + self.finished
    }
}

impl FromIterator<ProcedureStatus> for QueueCounts {
    fn from_iter<I: IntoIterator<Item = ProcedureStatus>>(iter: I) -> Self {
        let mut counts = QueueCounts::default();
        for status in iter {
            counts.record(status);
        }
        counts
    }
}
