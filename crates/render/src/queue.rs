use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use assets::{FallbackResolver, ResolutionResult, ResolveError};
use dashmap::DashMap;
use foundation::{AssetId, CancelFlag, Clock, JobId, Timestamp};
use parking_lot::Mutex;
use runtime::{
    EventBus, JobEvent, JobEventKind, JobFailure, JobOptions, JobState, QueueSnapshot, QueueStats,
    RenderJob, ResultRef, TransitionError, WorkId, WorkQueue,
};
use serde::Serialize;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::compositor::{CompositeRequest, Compositor};
use crate::config::RenderConfig;
use crate::error::RenderError;
use crate::result::{AssetProvenance, RenderMetadata, RenderResult};

/// What `submit` hands back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub job_id: JobId,
    pub state: JobState,
    pub submitted_at: Timestamp,
    pub estimated_duration_seconds: f64,
}

struct JobSlot {
    job: Mutex<RenderJob>,
    cancel: CancelFlag,
    work_id: WorkId,
    result: Mutex<Option<Arc<RenderResult>>>,
}

/// Why a render stopped short of a result.
enum Abort {
    Cancelled,
    Failed(JobFailure),
}

struct Shared {
    config: RenderConfig,
    clock: Arc<dyn Clock>,
    resolver: Arc<FallbackResolver>,
    compositor: Arc<dyn Compositor>,
    jobs: DashMap<JobId, Arc<JobSlot>>,
    pending: Mutex<WorkQueue<JobId>>,
    stats: Mutex<QueueStats>,
    events: EventBus,
    wakeup: Notify,
    stopping: AtomicBool,
}

/// Admits render jobs, runs them on a fixed pool of workers and answers
/// status queries.
///
/// At most `config.workers` jobs are ever `Rendering`; the rest wait in FIFO
/// order. Must be created inside a tokio runtime.
pub struct RenderQueue {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RenderQueue {
    pub fn start(
        config: RenderConfig,
        clock: Arc<dyn Clock>,
        resolver: Arc<FallbackResolver>,
        compositor: Arc<dyn Compositor>,
    ) -> Self {
        let worker_count = config.workers.max(1);
        let shared = Arc::new(Shared {
            pending: Mutex::new(WorkQueue::with_max_len(config.max_pending)),
            config,
            clock,
            resolver,
            compositor,
            jobs: DashMap::new(),
            stats: Mutex::new(QueueStats::new()),
            events: EventBus::new(),
            wakeup: Notify::new(),
            stopping: AtomicBool::new(false),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);

        let workers = (0..worker_count)
            .map(|n| tokio::spawn(worker_loop(shared.clone(), shutdown_rx.clone(), n)))
            .collect();
        info!("render queue started with {worker_count} workers");

        Self {
            shared,
            shutdown,
            workers: Mutex::new(workers),
        }
    }

    pub fn config(&self) -> &RenderConfig {
        &self.shared.config
    }

    pub fn submit(
        &self,
        avatar_id: &str,
        product_ids: Vec<AssetId>,
        options: JobOptions,
    ) -> Result<SubmitReceipt, RenderError> {
        validate(avatar_id, &product_ids)?;
        let shared = &self.shared;
        if shared.stopping.load(Ordering::SeqCst) {
            return Err(RenderError::ShuttingDown);
        }

        let job_id = JobId::generate();
        let now = shared.clock.now();
        let estimate = shared.config.estimate(product_ids.len() + 1);

        // Held until the job is Queued so no worker can pop it earlier.
        let mut pending = shared.pending.lock();
        let work_id = pending
            .try_push(job_id)
            .map_err(|full| RenderError::QueueFull {
                max_pending: full.max_len,
            })?;

        let job = RenderJob::new(job_id, avatar_id, product_ids, options, now, estimate);
        shared.stats.lock().observe(None, &job);
        let slot = Arc::new(JobSlot {
            job: Mutex::new(job),
            cancel: CancelFlag::new(),
            work_id,
            result: Mutex::new(None),
        });
        shared.jobs.insert(job_id, slot.clone());

        let state = match shared.transition(&slot, JobState::Queued) {
            Ok(()) => JobState::Queued,
            Err(e) => {
                warn!("job {job_id}: {e}");
                slot.job.lock().state()
            }
        };
        drop(pending);
        shared.wakeup.notify_one();

        info!("job {job_id} queued ({} products)", slot.job.lock().product_ids().len());
        Ok(SubmitReceipt {
            job_id,
            state,
            submitted_at: now,
            estimated_duration_seconds: estimate.as_secs_f64(),
        })
    }

    /// Snapshot of the job as of now.
    pub fn status(&self, job_id: JobId) -> Result<RenderJob, RenderError> {
        let slot = self.shared.slot(job_id)?;
        let job = slot.job.lock().clone();
        Ok(job)
    }

    pub fn result(&self, job_id: JobId) -> Result<Arc<RenderResult>, RenderError> {
        let slot = self.shared.slot(job_id)?;
        let job = slot.job.lock();
        match job.state() {
            JobState::Completed => slot
                .result
                .lock()
                .clone()
                .ok_or(RenderError::NotReady {
                    job_id,
                    state: job.state(),
                }),
            JobState::Failed => Err(RenderError::JobFailed {
                job_id,
                failure: job.failure().cloned().unwrap_or(JobFailure::Timeout),
            }),
            JobState::Cancelled => Err(RenderError::Cancelled(job_id)),
            state => Err(RenderError::NotReady { job_id, state }),
        }
    }

    /// Cancels a job that has not finished.
    ///
    /// Waiting jobs are cancelled on the spot. A rendering job is flagged and
    /// stops at its next checkpoint; if it is already past the last one it
    /// completes normally. Returns the state right after the call.
    pub fn cancel(&self, job_id: JobId) -> Result<JobState, RenderError> {
        let shared = &self.shared;
        let slot = shared.slot(job_id)?;

        let mut pending = shared.pending.lock();
        let state = slot.job.lock().state();
        match state {
            JobState::Submitted | JobState::Queued => {
                pending.cancel(slot.work_id);
                drop(pending);
                slot.cancel.cancel();
                shared
                    .transition_with(&slot, JobState::Cancelled, |job, now| job.cancel(now))
                    .map_err(|e| RenderError::NotCancellable {
                        job_id,
                        state: e.from,
                    })?;
                info!("job {job_id} cancelled while {state}");
                Ok(JobState::Cancelled)
            }
            JobState::Rendering => {
                drop(pending);
                slot.cancel.cancel();
                info!("job {job_id} flagged for cancellation");
                Ok(JobState::Rendering)
            }
            JobState::Completed | JobState::Failed | JobState::Cancelled => {
                Err(RenderError::NotCancellable { job_id, state })
            }
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.shared.stats.lock().snapshot()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        self.shared.events.subscribe()
    }

    /// Jobs currently tracked, finished ones included.
    pub fn job_count(&self) -> usize {
        self.shared.jobs.len()
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Forgets terminal jobs that finished more than `retention` ago.
    pub fn purge_finished(&self, retention: Duration) -> usize {
        let now = self.shared.clock.now();
        let before = self.shared.jobs.len();
        self.shared.jobs.retain(|_, slot| {
            let job = slot.job.lock();
            match job.completed_at() {
                Some(done) if job.is_terminal() => now.duration_since(done) < retention,
                _ => true,
            }
        });
        let purged = before.saturating_sub(self.shared.jobs.len());
        if purged > 0 {
            debug!("purged {purged} finished jobs");
        }
        purged
    }

    /// Stops accepting work and waits for workers to finish the job they are
    /// on. Jobs still waiting stay queued.
    pub async fn shutdown(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                warn!("render worker ended abnormally: {e}");
            }
        }
        info!("render queue stopped");
    }
}

impl Drop for RenderQueue {
    fn drop(&mut self) {
        for handle in self.workers.lock().iter() {
            handle.abort();
        }
    }
}

fn validate(avatar_id: &str, product_ids: &[AssetId]) -> Result<(), RenderError> {
    if avatar_id.trim().is_empty() {
        return Err(RenderError::Validation("avatarId must not be empty".into()));
    }
    if product_ids.is_empty() {
        return Err(RenderError::Validation("productIds must not be empty".into()));
    }
    let mut seen = HashSet::with_capacity(product_ids.len());
    for id in product_ids {
        if id.as_str().trim().is_empty() {
            return Err(RenderError::Validation("productIds must not contain empty ids".into()));
        }
        if !seen.insert(id) {
            return Err(RenderError::Validation(format!("duplicate product id {id}")));
        }
    }
    Ok(())
}

async fn worker_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>, n: usize) {
    debug!("render worker {n} started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = shared.pending.lock().pop_next();
        match next {
            Some((_, job_id)) => shared.run(job_id).await,
            None => {
                tokio::select! {
                    _ = shared.wakeup.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!("render worker {n} stopped");
}

impl Shared {
    fn slot(&self, job_id: JobId) -> Result<Arc<JobSlot>, RenderError> {
        self.jobs
            .get(&job_id)
            .map(|s| s.value().clone())
            .ok_or(RenderError::NotFound(job_id))
    }

    fn publish(&self, job_id: JobId, kind: JobEventKind) {
        self.events.publish(JobEvent {
            job_id,
            at: self.clock.now(),
            kind,
        });
    }

    /// Applies a transition, feeds the stats and publishes the change, all
    /// under the job lock so observers see one consistent order.
    fn transition(&self, slot: &JobSlot, to: JobState) -> Result<(), TransitionError> {
        self.transition_with(slot, to, |job, now| job.transition(to, now))
    }

    fn transition_with(
        &self,
        slot: &JobSlot,
        to: JobState,
        apply: impl FnOnce(&mut RenderJob, Timestamp) -> Result<(), TransitionError>,
    ) -> Result<(), TransitionError> {
        let mut job = slot.job.lock();
        let from = job.state();
        apply(&mut job, self.clock.now())?;
        self.stats.lock().observe(Some(from), &job);
        self.publish(job.id(), JobEventKind::StateChanged { from, to });
        Ok(())
    }

    fn progress(&self, slot: &JobSlot, progress: u8, stage: String) {
        let mut job = slot.job.lock();
        job.set_stage(stage.clone());
        let progress = job.set_progress(progress);
        self.publish(job.id(), JobEventKind::Progress { progress, stage });
    }

    async fn run(&self, job_id: JobId) {
        let Ok(slot) = self.slot(job_id) else {
            return;
        };
        if let Err(e) = self.transition(&slot, JobState::Rendering) {
            // Cancelled between pop and start.
            debug!("job {job_id} not started: {e}");
            return;
        }
        info!("job {job_id} rendering");

        let outcome = tokio::time::timeout(self.config.job_timeout, self.render(&slot)).await;
        let applied = match outcome {
            Ok(Ok(result)) => {
                let result_ref = ResultRef {
                    key: job_id.to_string(),
                    size_bytes: result.size_bytes(),
                    degraded: result.metadata.degraded,
                };
                *slot.result.lock() = Some(Arc::new(result));
                let applied = self.transition_with(&slot, JobState::Completed, |job, now| {
                    job.complete(result_ref, now)
                });
                if applied.is_ok() {
                    info!("job {job_id} completed");
                }
                applied
            }
            Ok(Err(Abort::Cancelled)) => {
                info!("job {job_id} cancelled while rendering");
                self.transition_with(&slot, JobState::Cancelled, |job, now| job.cancel(now))
            }
            Ok(Err(Abort::Failed(failure))) => {
                warn!("job {job_id} failed: {failure}");
                self.fail(&slot, failure)
            }
            Err(_) => {
                warn!("job {job_id} timed out after {:?}", self.config.job_timeout);
                slot.cancel.cancel();
                self.fail(&slot, JobFailure::Timeout)
            }
        };
        if let Err(e) = applied {
            warn!("job {job_id}: {e}");
        }
    }

    fn fail(&self, slot: &JobSlot, failure: JobFailure) -> Result<(), TransitionError> {
        self.transition_with(slot, JobState::Failed, |job, now| job.fail(failure, now))
    }

    async fn render(&self, slot: &JobSlot) -> Result<RenderResult, Abort> {
        let (job_id, avatar_id, product_ids, options, started) = {
            let job = slot.job.lock();
            (
                job.id(),
                job.avatar_id().to_string(),
                job.product_ids().to_vec(),
                job.options().clone(),
                job.started_at().unwrap_or_else(|| self.clock.now()),
            )
        };

        let wanted: Vec<AssetId> = std::iter::once(AssetId::new(avatar_id.clone()))
            .chain(product_ids)
            .collect();
        let total = wanted.len();
        let mut resolved: Vec<ResolutionResult> = Vec::with_capacity(total);

        for (i, asset_id) in wanted.iter().enumerate() {
            if slot.cancel.is_cancelled() {
                return Err(Abort::Cancelled);
            }
            self.progress(slot, percent(i, total), format!("resolving {asset_id}"));

            match self.resolver.resolve_id(asset_id, &slot.cancel).await {
                Ok(r) => {
                    self.publish(
                        job_id,
                        JobEventKind::AssetResolved {
                            asset_id: r.asset_id.clone(),
                            source_used: r.source_used,
                            from_cache: r.from_cache,
                            fallback_reason: r.fallback_reason,
                        },
                    );
                    resolved.push(r);
                }
                Err(ResolveError::Cancelled(_)) => return Err(Abort::Cancelled),
                Err(ResolveError::PlaceholderUnavailable { asset_id, .. }) => {
                    return Err(Abort::Failed(JobFailure::PlaceholderFailed { asset_id }));
                }
            }
        }

        // Last checkpoint: past here the job completes even if cancelled.
        if slot.cancel.is_cancelled() {
            return Err(Abort::Cancelled);
        }
        self.progress(slot, percent(total, total), "compositing".to_string());

        let (avatar, garments) = resolved.split_first().ok_or_else(|| {
            Abort::Failed(JobFailure::CompositorFailed {
                message: "nothing to composite".into(),
            })
        })?;
        let compose_failed = |e: crate::compositor::CompositorError| {
            Abort::Failed(JobFailure::CompositorFailed { message: e.0 })
        };
        let mut frames = Vec::new();
        if options.is_batch {
            for garment in garments {
                let request = CompositeRequest {
                    avatar,
                    garments: std::slice::from_ref(garment),
                };
                frames.push(self.compositor.compose(request).await.map_err(compose_failed)?);
            }
        } else {
            let request = CompositeRequest { avatar, garments };
            frames.push(self.compositor.compose(request).await.map_err(compose_failed)?);
        }

        let assets: Vec<AssetProvenance> = resolved.iter().map(AssetProvenance::from).collect();
        let degraded = resolved.iter().any(ResolutionResult::is_degraded);
        let elapsed = self.clock.now().duration_since(started);
        Ok(RenderResult {
            job_id,
            frames,
            metadata: RenderMetadata {
                avatar_id,
                is_batch: options.is_batch,
                assets,
                degraded,
                render_time_seconds: elapsed.as_secs_f64(),
            },
        })
    }
}

/// Resolution takes progress to 90; compositing finishes it.
fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 90;
    }
    u8::try_from(done * 90 / total).unwrap_or(90)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use assets::{
        CacheConfig, CacheStore, FallbackResolver, LoadError, MemoryLoader, ResolverConfig,
        RetryPolicy,
    };
    use catalog::{AssetDescriptor, InMemoryCatalog, PlaceholderSet, SourceTier};
    use foundation::{AssetId, JobId, SystemClock};
    use pretty_assertions::assert_eq;
    use runtime::{JobEvent, JobEventKind, JobFailure, JobOptions, JobState};
    use tokio::sync::mpsc;

    use super::RenderQueue;
    use crate::compositor::ManifestCompositor;
    use crate::config::RenderConfig;
    use crate::error::RenderError;

    const GLB: &[u8] = b"glTF\x02\x00\x00\x00body";
    const PNG: &[u8] = b"\x89PNG\r\n\x1a\ngeneric";

    fn loader() -> Arc<MemoryLoader> {
        let loader = Arc::new(MemoryLoader::new());
        loader.insert("avatars/a1.glb", GLB);
        loader.insert("garments/p1.glb", GLB);
        loader.insert("garments/p2.glb", GLB);
        loader.insert("placeholders/slim.glb", GLB);
        loader.insert("placeholders/generic.png", PNG);
        loader
    }

    fn queue_with(loader: Arc<MemoryLoader>, config: RenderConfig) -> RenderQueue {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.insert(AssetDescriptor::new("a1", "slim").with_primary("avatars/a1.glb"));
        catalog.insert(AssetDescriptor::new("p1", "slim").with_primary("garments/p1.glb"));
        catalog.insert(AssetDescriptor::new("p2", "slim").with_primary("garments/p2.glb"));

        let clock = Arc::new(SystemClock);
        let resolver = FallbackResolver::new(
            Arc::new(CacheStore::new(CacheConfig::default(), clock.clone())),
            loader,
            catalog,
            PlaceholderSet::new("placeholders/generic.png")
                .with_category("slim", "placeholders/slim.glb"),
            ResolverConfig {
                retry: RetryPolicy::default().without_jitter(),
                ..ResolverConfig::default()
            },
        );
        RenderQueue::start(config, clock, Arc::new(resolver), Arc::new(ManifestCompositor))
    }

    fn queue() -> RenderQueue {
        queue_with(loader(), RenderConfig::default())
    }

    fn ids(ids: &[&str]) -> Vec<AssetId> {
        ids.iter().map(|s| AssetId::new(*s)).collect()
    }

    async fn wait_terminal(rx: &mut mpsc::UnboundedReceiver<JobEvent>, job_id: JobId) -> JobState {
        loop {
            let event = rx.recv().await.unwrap();
            if event.job_id != job_id {
                continue;
            }
            if let JobEventKind::StateChanged { to, .. } = event.kind
                && to.is_terminal()
            {
                return to;
            }
        }
    }

    #[tokio::test]
    async fn fresh_job_is_queued_with_zero_progress() {
        let q = queue();
        let receipt = q.submit("a1", ids(&["p1"]), JobOptions::default()).unwrap();
        assert!(matches!(receipt.state, JobState::Submitted | JobState::Queued));
        assert_eq!(receipt.estimated_duration_seconds, 9.0);

        let status = q.status(receipt.job_id).unwrap();
        assert!(matches!(status.state(), JobState::Submitted | JobState::Queued));
        assert_eq!(status.progress(), 0);
        assert!(matches!(
            q.result(receipt.job_id),
            Err(RenderError::NotReady { .. })
        ));
    }

    #[tokio::test]
    async fn completed_job_reports_provenance() {
        let q = queue();
        let mut rx = q.subscribe();
        let receipt = q.submit("a1", ids(&["p1", "p9"]), JobOptions::default()).unwrap();

        assert_eq!(wait_terminal(&mut rx, receipt.job_id).await, JobState::Completed);
        let status = q.status(receipt.job_id).unwrap();
        assert_eq!(status.progress(), 100);
        assert!(status.started_at().is_some() && status.completed_at().is_some());

        let result = q.result(receipt.job_id).unwrap();
        assert_eq!(result.frames.len(), 1);
        let tiers: Vec<SourceTier> = result.metadata.assets.iter().map(|a| a.source_used).collect();
        assert_eq!(
            tiers,
            vec![SourceTier::Primary, SourceTier::Primary, SourceTier::GenericPlaceholder]
        );
        assert!(result.metadata.degraded);
        assert!(status.result_ref().is_some_and(|r| r.degraded));
    }

    #[tokio::test]
    async fn batch_job_composes_each_product() {
        let q = queue();
        let mut rx = q.subscribe();
        let options = JobOptions {
            is_batch: true,
            label: Some("lookbook".into()),
        };
        let receipt = q.submit("a1", ids(&["p1", "p2"]), options).unwrap();

        assert_eq!(wait_terminal(&mut rx, receipt.job_id).await, JobState::Completed);
        let result = q.result(receipt.job_id).unwrap();
        assert_eq!(result.frames.len(), 2);
        assert!(result.metadata.is_batch);
        assert!(!result.metadata.degraded);
    }

    #[tokio::test]
    async fn cancel_before_pickup_never_yields_a_payload() {
        let q = queue();
        let receipt = q.submit("a1", ids(&["p1"]), JobOptions::default()).unwrap();
        assert_eq!(q.cancel(receipt.job_id), Ok(JobState::Cancelled));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.status(receipt.job_id).unwrap().state(), JobState::Cancelled);
        assert_eq!(
            q.result(receipt.job_id),
            Err(RenderError::Cancelled(receipt.job_id))
        );
        assert!(matches!(
            q.cancel(receipt.job_id),
            Err(RenderError::NotCancellable {
                state: JobState::Cancelled,
                ..
            })
        ));
        assert_eq!(q.snapshot().cancelled, 1);
        assert_eq!(q.pending_len(), 0);
    }

    #[tokio::test]
    async fn cancel_while_rendering_stops_at_next_checkpoint() {
        let loader = Arc::new(MemoryLoader::new().with_delay(Duration::from_millis(50)));
        loader.insert("avatars/a1.glb", GLB);
        loader.insert("garments/p1.glb", GLB);
        let q = queue_with(loader, RenderConfig::default());
        let mut rx = q.subscribe();
        let receipt = q.submit("a1", ids(&["p1"]), JobOptions::default()).unwrap();

        loop {
            let event = rx.recv().await.unwrap();
            if matches!(event.kind, JobEventKind::StateChanged { to: JobState::Rendering, .. }) {
                break;
            }
        }
        assert_eq!(q.cancel(receipt.job_id), Ok(JobState::Rendering));
        assert_eq!(wait_terminal(&mut rx, receipt.job_id).await, JobState::Cancelled);
    }

    #[tokio::test]
    async fn missing_generic_placeholder_fails_the_job() {
        let loader = loader();
        loader.fail_always("placeholders/generic.png", LoadError::NotFound("gone".into()));
        let q = queue_with(loader, RenderConfig::default());
        let mut rx = q.subscribe();

        let ok = q.submit("a1", ids(&["p1"]), JobOptions::default()).unwrap();
        assert_eq!(wait_terminal(&mut rx, ok.job_id).await, JobState::Completed);
        assert_eq!(q.snapshot().success_rate, 1.0);

        // Unknown avatar, so nothing to fall back to.
        let bad = q.submit("ghost", ids(&["p1"]), JobOptions::default()).unwrap();
        assert_eq!(wait_terminal(&mut rx, bad.job_id).await, JobState::Failed);

        let status = q.status(bad.job_id).unwrap();
        assert_eq!(
            status.failure(),
            Some(&JobFailure::PlaceholderFailed {
                asset_id: AssetId::new("ghost")
            })
        );
        assert!(matches!(
            q.result(bad.job_id),
            Err(RenderError::JobFailed { .. })
        ));
        let snap = q.snapshot();
        assert_eq!((snap.completed, snap.failed), (1, 1));
        assert_eq!(snap.success_rate, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_jobs_time_out() {
        let loader = Arc::new(MemoryLoader::new().with_delay(Duration::from_secs(30)));
        let config = RenderConfig {
            job_timeout: Duration::from_secs(1),
            ..RenderConfig::default()
        };
        let q = queue_with(loader, config);
        let mut rx = q.subscribe();

        let receipt = q.submit("a1", ids(&["p1"]), JobOptions::default()).unwrap();
        assert_eq!(wait_terminal(&mut rx, receipt.job_id).await, JobState::Failed);
        assert_eq!(
            q.status(receipt.job_id).unwrap().failure(),
            Some(&JobFailure::Timeout)
        );
    }

    #[tokio::test]
    async fn rejects_invalid_submissions() {
        let q = queue();
        for bad in [vec![], ids(&["p1", "p1"]), ids(&["p1", ""])] {
            assert!(matches!(
                q.submit("a1", bad, JobOptions::default()),
                Err(RenderError::Validation(_))
            ));
        }
        assert!(matches!(
            q.submit(" ", ids(&["p1"]), JobOptions::default()),
            Err(RenderError::Validation(_))
        ));
        assert_eq!(q.job_count(), 0);
        assert!(matches!(q.status(JobId::generate()), Err(RenderError::NotFound(_))));
    }

    #[tokio::test]
    async fn backpressure_rejects_when_pending_is_full() {
        let config = RenderConfig {
            workers: 1,
            max_pending: 1,
            ..RenderConfig::default()
        };
        let q = queue_with(loader(), config);
        // No await in between: the worker has not run yet.
        q.submit("a1", ids(&["p1"]), JobOptions::default()).unwrap();
        assert_eq!(
            q.submit("a1", ids(&["p2"]), JobOptions::default()),
            Err(RenderError::QueueFull { max_pending: 1 })
        );
        assert_eq!(q.job_count(), 1);
    }

    #[tokio::test]
    async fn status_is_stable_without_new_events() {
        let q = queue();
        let mut rx = q.subscribe();
        let receipt = q.submit("a1", ids(&["p1"]), JobOptions::default()).unwrap();
        wait_terminal(&mut rx, receipt.job_id).await;

        let first = q.status(receipt.job_id).unwrap();
        let second = q.status(receipt.job_id).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn purge_drops_only_old_finished_jobs() {
        let q = queue();
        let mut rx = q.subscribe();
        let done = q.submit("a1", ids(&["p1"]), JobOptions::default()).unwrap();
        wait_terminal(&mut rx, done.job_id).await;

        assert_eq!(q.purge_finished(Duration::from_secs(3600)), 0);
        assert_eq!(q.purge_finished(Duration::ZERO), 1);
        assert!(matches!(q.status(done.job_id), Err(RenderError::NotFound(_))));
        // Totals survive the purge.
        assert_eq!(q.snapshot().completed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_bounds_concurrent_renders() {
        let slow = Arc::new(MemoryLoader::new().with_delay(Duration::from_millis(2)));
        slow.insert("avatars/a1.glb", GLB);
        slow.insert("placeholders/generic.png", PNG);
        let q = queue_with(slow, RenderConfig::default());
        let mut rx = q.subscribe();

        let mut submitted = Vec::new();
        for i in 0..100 {
            let products = vec![AssetId::new(format!("p{i}"))];
            let receipt = q.submit("a1", products, JobOptions::default()).unwrap();
            submitted.push(receipt.job_id);
        }

        let mut finished = 0;
        tokio::time::timeout(Duration::from_secs(30), async {
            while finished < 100 {
                let event = rx.recv().await.unwrap();
                if let JobEventKind::StateChanged { to, .. } = event.kind
                    && to.is_terminal()
                {
                    finished += 1;
                }
            }
        })
        .await
        .unwrap();

        let snap = q.snapshot();
        assert!(snap.peak_running <= 4, "peak {}", snap.peak_running);
        assert_eq!(snap.completed, 100);
        assert_eq!((snap.queued, snap.running), (0, 0));
        for id in submitted {
            assert!(q.status(id).unwrap().is_terminal());
        }
        q.shutdown().await;
    }
}
