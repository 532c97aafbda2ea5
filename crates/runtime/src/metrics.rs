use std::time::Duration;

use serde::Serialize;

use crate::job::{JobState, RenderJob};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Histogram {
    pub count: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
}

impl Histogram {
    pub fn record(&mut self, value: u64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum = self.sum.saturating_add(value);
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / self.count as f64)
    }
}

/// Point-in-time view of the render queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Submitted or queued, not yet rendering.
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub average_render_time_seconds: f64,
    pub success_rate: f64,
    pub peak_running: u64,
}

/// Running counters fed by every job transition.
///
/// `queued`/`running` are gauges; the terminal counts only ever grow, even
/// after finished jobs are purged. Render time covers completed jobs only.
#[derive(Debug, Default, Clone)]
pub struct QueueStats {
    queued: u64,
    running: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    peak_running: u64,
    render_ms: Histogram,
}

impl QueueStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `job` just moved out of `from` (or was created, for
    /// `None`) into its current state.
    pub fn observe(&mut self, from: Option<JobState>, job: &RenderJob) {
        if let Some(from) = from {
            match from {
                JobState::Submitted | JobState::Queued => {
                    self.queued = self.queued.saturating_sub(1)
                }
                JobState::Rendering => self.running = self.running.saturating_sub(1),
                JobState::Completed | JobState::Failed | JobState::Cancelled => {}
            }
        }
        match job.state() {
            JobState::Submitted | JobState::Queued => self.queued += 1,
            JobState::Rendering => {
                self.running += 1;
                self.peak_running = self.peak_running.max(self.running);
            }
            JobState::Completed => {
                self.completed += 1;
                if let Some(d) = job.render_duration() {
                    self.render_ms.record(millis(d));
                }
            }
            JobState::Failed => self.failed += 1,
            JobState::Cancelled => self.cancelled += 1,
        }
    }

    /// `completed / (completed + failed)`, 1.0 before any terminal job.
    pub fn success_rate(&self) -> f64 {
        let terminal = self.completed + self.failed;
        if terminal == 0 {
            1.0
        } else {
            self.completed as f64 / terminal as f64
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            queued: self.queued,
            running: self.running,
            completed: self.completed,
            failed: self.failed,
            cancelled: self.cancelled,
            average_render_time_seconds: self.render_ms.mean().unwrap_or(0.0) / 1000.0,
            success_rate: self.success_rate(),
            peak_running: self.peak_running,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
