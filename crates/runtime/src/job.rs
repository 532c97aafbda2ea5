use std::fmt;
use std::time::Duration;

use foundation::{AssetId, JobId, Timestamp};
use serde::{Deserialize, Serialize};

/// Lifecycle of a render job.
///
/// `Submitted -> Queued -> Rendering -> Completed | Failed`, with `Cancelled`
/// reachable from any non-terminal state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    Submitted,
    Queued,
    Rendering,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Submitted => "submitted",
            JobState::Queued => "queued",
            JobState::Rendering => "rendering",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Submitted, Queued)
                | (Queued, Rendering)
                | (Rendering, Completed)
                | (Rendering, Failed)
                | (Submitted | Queued | Rendering, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobState,
    pub to: JobState,
}

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum JobFailure {
    /// Every tier of the fallback chain failed for this asset.
    #[serde(rename_all = "camelCase")]
    PlaceholderFailed { asset_id: AssetId },
    /// The job-level deadline passed.
    Timeout,
    CompositorFailed { message: String },
}

impl JobFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            JobFailure::PlaceholderFailed { .. } => "placeholderFailed",
            JobFailure::Timeout => "timeout",
            JobFailure::CompositorFailed { .. } => "compositorFailed",
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::PlaceholderFailed { asset_id } => {
                write!(f, "no renderable artifact for asset {asset_id}")
            }
            JobFailure::Timeout => f.write_str("render timed out"),
            JobFailure::CompositorFailed { message } => write!(f, "compositor failed: {message}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    /// Compose each product separately; the job still completes atomically.
    pub is_batch: bool,
    pub label: Option<String>,
}

/// Where a completed job's artifact lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRef {
    pub key: String,
    pub size_bytes: u64,
    /// At least one asset came from a fallback tier.
    pub degraded: bool,
}

/// One render request and everything observed about it so far.
///
/// Mutated only through [`RenderJob::transition`] and the progress setters, so
/// an observer can never see a state the transition graph cannot reach.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderJob {
    id: JobId,
    avatar_id: String,
    product_ids: Vec<AssetId>,
    options: JobOptions,
    state: JobState,
    progress: u8,
    current_stage: String,
    message: Option<String>,
    failure: Option<JobFailure>,
    submitted_at: Timestamp,
    started_at: Option<Timestamp>,
    completed_at: Option<Timestamp>,
    estimated_duration: Duration,
    result_ref: Option<ResultRef>,
}

impl RenderJob {
    pub fn new(
        id: JobId,
        avatar_id: impl Into<String>,
        product_ids: Vec<AssetId>,
        options: JobOptions,
        submitted_at: Timestamp,
        estimated_duration: Duration,
    ) -> Self {
        Self {
            id,
            avatar_id: avatar_id.into(),
            product_ids,
            options,
            state: JobState::Submitted,
            progress: 0,
            current_stage: "submitted".to_string(),
            message: None,
            failure: None,
            submitted_at,
            started_at: None,
            completed_at: None,
            estimated_duration,
            result_ref: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn avatar_id(&self) -> &str {
        &self.avatar_id
    }

    pub fn product_ids(&self) -> &[AssetId] {
        &self.product_ids
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn current_stage(&self) -> &str {
        &self.current_stage
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        self.failure.as_ref()
    }

    pub fn submitted_at(&self) -> Timestamp {
        self.submitted_at
    }

    pub fn started_at(&self) -> Option<Timestamp> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<Timestamp> {
        self.completed_at
    }

    pub fn estimated_duration(&self) -> Duration {
        self.estimated_duration
    }

    pub fn result_ref(&self) -> Option<&ResultRef> {
        self.result_ref.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// `completedAt - startedAt`, once both exist.
    pub fn render_duration(&self) -> Option<Duration> {
        Some(self.completed_at?.duration_since(self.started_at?))
    }

    pub fn transition(&mut self, to: JobState, now: Timestamp) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        self.state = to;
        match to {
            JobState::Submitted => {}
            JobState::Queued => self.current_stage = "queued".to_string(),
            JobState::Rendering => {
                self.started_at = Some(now);
                self.current_stage = "starting".to_string();
            }
            JobState::Completed => {
                self.progress = 100;
                self.completed_at = Some(now);
                self.current_stage = "done".to_string();
            }
            JobState::Failed | JobState::Cancelled => {
                self.completed_at = Some(now);
                self.current_stage = to.as_str().to_string();
            }
        }
        Ok(())
    }

    /// Moves progress forward, clamped to 100. Ignored outside `Rendering`
    /// and never moves backwards. Returns the progress now in effect.
    pub fn set_progress(&mut self, progress: u8) -> u8 {
        if self.state == JobState::Rendering {
            self.progress = self.progress.max(progress.min(100));
        }
        self.progress
    }

    pub fn set_stage(&mut self, stage: impl Into<String>) {
        if !self.state.is_terminal() {
            self.current_stage = stage.into();
        }
    }

    pub fn complete(&mut self, result: ResultRef, now: Timestamp) -> Result<(), TransitionError> {
        self.transition(JobState::Completed, now)?;
        if result.degraded {
            self.message = Some("completed with placeholder assets".to_string());
        } else {
            self.message = Some("completed".to_string());
        }
        self.result_ref = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, failure: JobFailure, now: Timestamp) -> Result<(), TransitionError> {
        self.transition(JobState::Failed, now)?;
        self.message = Some(failure.to_string());
        self.failure = Some(failure);
        Ok(())
    }

    pub fn cancel(&mut self, now: Timestamp) -> Result<(), TransitionError> {
        self.transition(JobState::Cancelled, now)?;
        self.message = Some("cancelled by request".to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use foundation::{AssetId, JobId, Timestamp};

    use super::{JobFailure, JobOptions, JobState, RenderJob, ResultRef, TransitionError};

    fn job() -> RenderJob {
        RenderJob::new(
            JobId::generate(),
            "a1",
            vec![AssetId::new("p1")],
            JobOptions::default(),
            Timestamp(1_000),
            Duration::from_secs(7),
        )
    }

    fn result() -> ResultRef {
        ResultRef {
            key: "r".to_string(),
            size_bytes: 3,
            degraded: false,
        }
    }

    #[test]
    fn happy_path_records_timestamps() {
        let mut j = job();
        assert_eq!(j.state(), JobState::Submitted);
        assert_eq!(j.progress(), 0);

        j.transition(JobState::Queued, Timestamp(1_000)).unwrap();
        j.transition(JobState::Rendering, Timestamp(2_000)).unwrap();
        assert_eq!(j.started_at(), Some(Timestamp(2_000)));
        j.complete(result(), Timestamp(5_500)).unwrap();

        assert_eq!(j.state(), JobState::Completed);
        assert_eq!(j.progress(), 100);
        assert_eq!(j.render_duration(), Some(Duration::from_millis(3_500)));
        assert!(j.result_ref().is_some());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut j = job();
        j.cancel(Timestamp(1_500)).unwrap();
        for next in [
            JobState::Submitted,
            JobState::Queued,
            JobState::Rendering,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            assert_eq!(
                j.transition(next, Timestamp(2_000)),
                Err(TransitionError {
                    from: JobState::Cancelled,
                    to: next
                })
            );
        }
        assert_eq!(j.completed_at(), Some(Timestamp(1_500)));
    }

    #[test]
    fn states_cannot_be_skipped_or_revisited() {
        let mut j = job();
        assert!(j.transition(JobState::Rendering, Timestamp(0)).is_err());
        assert!(j.transition(JobState::Completed, Timestamp(0)).is_err());
        j.transition(JobState::Queued, Timestamp(0)).unwrap();
        assert!(j.transition(JobState::Submitted, Timestamp(0)).is_err());
        assert!(j.transition(JobState::Queued, Timestamp(0)).is_err());
    }

    #[test]
    fn progress_is_clamped_and_monotonic() {
        let mut j = job();
        assert_eq!(j.set_progress(50), 0, "ignored before rendering");

        j.transition(JobState::Queued, Timestamp(0)).unwrap();
        j.transition(JobState::Rendering, Timestamp(0)).unwrap();
        assert_eq!(j.set_progress(40), 40);
        assert_eq!(j.set_progress(10), 40);
        assert_eq!(j.set_progress(250), 100);
    }

    #[test]
    fn failure_carries_reason_and_message() {
        let mut j = job();
        j.transition(JobState::Queued, Timestamp(0)).unwrap();
        j.transition(JobState::Rendering, Timestamp(0)).unwrap();
        j.fail(
            JobFailure::PlaceholderFailed {
                asset_id: AssetId::new("p1"),
            },
            Timestamp(10),
        )
        .unwrap();

        assert_eq!(j.state(), JobState::Failed);
        assert_eq!(j.failure().map(|f| f.reason()), Some("placeholderFailed"));
        assert_eq!(j.message(), Some("no renderable artifact for asset p1"));
        assert!(j.result_ref().is_none());
    }

    #[test]
    fn failure_wire_shape() {
        let json = serde_json::to_value(JobFailure::PlaceholderFailed {
            asset_id: AssetId::new("p1"),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "placeholderFailed", "assetId": "p1"})
        );
        let json = serde_json::to_value(JobFailure::Timeout).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "timeout"}));
    }
}
