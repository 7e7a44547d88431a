// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Synchronization scheduler.
//!
//! Turns registered rules into work: a priority queue of jobs keyed by
//! (priority, enqueue time), fed by scheduled tickers, event triggers, and
//! explicit `trigger_now` calls. At most one run per (rule, source, target)
//! executes at a time; a second attempt marks the running job dirty so a
//! single follow-up run happens after completion. Job execution holds no
//! global lock.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::dual_knowledge::DualKnowledgeManager;
use crate::application::event_processor::EventProcessor;
use crate::config::SyncConfig;
use crate::domain::{FabricEvent, Properties, SyncCadence, SyncResult};
use crate::error::{FabricError, Result};

/// Per-rule execution status, updated after every run.
#[derive(Debug, Clone, Default)]
pub struct RuleStatus {
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_duration_ms: u64,
    pub last_run_result: Option<SyncResult>,
    pub items_considered: u64,
    pub items_applied: u64,
    pub items_vetoed: u64,
    pub items_deferred: u64,
    pub last_error: Option<String>,
}

type JobKey = (String, String, String);

struct QueuedJob {
    priority: i64,
    enqueued_at: DateTime<Utc>,
    seq: u64,
    job_id: String,
    rule: String,
    source: String,
    target: String,
    _slot: OwnedSemaphorePermit,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for QueuedJob {}
impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then earlier enqueue.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct RunningEntry {
    job_id: String,
    dirty: bool,
    cancel: CancellationToken,
}

struct SyncInner {
    dkm: DualKnowledgeManager,
    queue: StdMutex<BinaryHeap<QueuedJob>>,
    parked: StdMutex<Vec<QueuedJob>>,
    slots: Arc<Semaphore>,
    intake_wait: Duration,
    notify: Notify,
    completed: Notify,
    running: StdMutex<HashMap<JobKey, RunningEntry>>,
    status: StdRwLock<HashMap<String, RuleStatus>>,
    paused: StdRwLock<HashSet<String>>,
    draining: AtomicBool,
    cancel_all: CancellationToken,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
    seq: AtomicU64,
    default_period: StdRwLock<Duration>,
    events: StdRwLock<Option<EventProcessor>>,
}

/// Schedules and executes synchronization jobs.
#[derive(Clone)]
pub struct Synchronizer {
    inner: Arc<SyncInner>,
}

impl Synchronizer {
    pub fn new(dkm: DualKnowledgeManager, config: &SyncConfig) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                dkm,
                queue: StdMutex::new(BinaryHeap::new()),
                parked: StdMutex::new(Vec::new()),
                slots: Arc::new(Semaphore::new(config.priority_queue_capacity)),
                intake_wait: Duration::from_millis(config.intake_wait_ms),
                notify: Notify::new(),
                completed: Notify::new(),
                running: StdMutex::new(HashMap::new()),
                status: StdRwLock::new(HashMap::new()),
                paused: StdRwLock::new(HashSet::new()),
                draining: AtomicBool::new(false),
                cancel_all: CancellationToken::new(),
                tasks: StdMutex::new(Vec::new()),
                seq: AtomicU64::new(0),
                default_period: StdRwLock::new(Duration::from_millis(config.default_period_ms)),
                events: StdRwLock::new(None),
            }),
        }
    }

    pub fn attach_events(&self, processor: EventProcessor) {
        *self.inner.events.write().expect("events lock poisoned") = Some(processor);
    }

    /// Launch the dispatcher, one ticker per scheduled rule, and event
    /// triggers for on-event rules. Rules registered afterwards still run
    /// through `trigger_now`.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock().expect("tasks lock poisoned");

        // Dispatcher.
        {
            let inner = self.inner.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = inner.cancel_all.cancelled() => break,
                        _ = inner.notify.notified() => {}
                    }
                    SyncInner::dispatch_ready(&inner);
                }
                debug!("synchronizer dispatcher stopped");
            }));
        }

        // Tickers and event triggers per registered rule.
        for registered in self.inner.dkm.rules() {
            match &registered.rule.cadence {
                SyncCadence::Scheduled { period_ms } => {
                    let fixed = *period_ms;
                    let inner = self.inner.clone();
                    let this = self.clone();
                    let rule_name = registered.rule.name.clone();
                    tasks.push(tokio::spawn(async move {
                        loop {
                            let period = if fixed > 0 {
                                Duration::from_millis(fixed)
                            } else {
                                *inner.default_period.read().expect("period lock poisoned")
                            };
                            tokio::select! {
                                _ = inner.cancel_all.cancelled() => break,
                                _ = tokio::time::sleep(period) => {}
                            }
                            if let Err(e) = this.trigger_now(&rule_name).await {
                                debug!(rule = %rule_name, error = %e, "scheduled trigger skipped");
                            }
                        }
                    }));
                }
                SyncCadence::OnEvent { pattern } => {
                    let processor = self.inner.events.read().expect("events lock poisoned").clone();
                    if let Some(processor) = processor {
                        let this = self.clone();
                        let rule_name = registered.rule.name.clone();
                        processor.register_handler(
                            pattern,
                            Arc::new(move |event: &FabricEvent| {
                                // Sync activity events must not retrigger.
                                if event.source.starts_with("dual-knowledge") {
                                    return Ok(());
                                }
                                this.trigger_from_event(&rule_name);
                                Ok(())
                            }),
                        );
                    }
                }
                SyncCadence::Manual => {}
            }
        }
        info!("synchronizer started");
    }

    /// Enqueue a run of the named rule, waiting a bounded time for queue
    /// capacity. Returns the job id.
    pub async fn trigger_now(&self, rule_name: &str) -> Result<String> {
        if self.inner.draining.load(Ordering::SeqCst) {
            return Err(FabricError::ProcessorStopped);
        }
        let registered = self.inner.dkm.rule(rule_name).ok_or_else(|| {
            FabricError::EntityNotFound {
                label: "SynchronizationRule".to_string(),
                id: rule_name.to_string(),
            }
        })?;

        let slot = match tokio::time::timeout(
            self.inner.intake_wait,
            self.inner.slots.clone().acquire_owned(),
        )
        .await
        {
            Err(_) => return Err(FabricError::BackpressureExceeded),
            Ok(Err(_)) => return Err(FabricError::ProcessorStopped),
            Ok(Ok(slot)) => slot,
        };

        Ok(self.enqueue(registered.rule.name, registered.source, registered.target, registered.rule.priority, slot))
    }

    /// Non-blocking trigger used from event handlers. Dropped with a log
    /// line when the queue is full.
    fn trigger_from_event(&self, rule_name: &str) {
        if self.inner.draining.load(Ordering::SeqCst) {
            return;
        }
        let Some(registered) = self.inner.dkm.rule(rule_name) else {
            return;
        };
        match self.inner.slots.clone().try_acquire_owned() {
            Ok(slot) => {
                self.enqueue(
                    registered.rule.name,
                    registered.source,
                    registered.target,
                    registered.rule.priority,
                    slot,
                );
            }
            Err(_) => warn!(rule = rule_name, "sync queue full, event trigger dropped"),
        }
    }

    fn enqueue(
        &self,
        rule: String,
        source: String,
        target: String,
        priority: i64,
        slot: OwnedSemaphorePermit,
    ) -> String {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        let job_id = format!("job-{seq}");
        let job = QueuedJob {
            priority,
            enqueued_at: Utc::now(),
            seq,
            job_id: job_id.clone(),
            rule,
            source,
            target,
            _slot: slot,
        };
        self.inner.queue.lock().expect("queue lock poisoned").push(job);
        self.inner.notify.notify_one();
        job_id
    }

    pub fn pause(&self, rule: &str) {
        self.inner
            .paused
            .write()
            .expect("paused lock poisoned")
            .insert(rule.to_string());
        info!(rule, "synchronization rule paused");
    }

    pub fn resume(&self, rule: &str) {
        self.inner
            .paused
            .write()
            .expect("paused lock poisoned")
            .remove(rule);
        // Parked jobs for the rule go back into the queue.
        let mut parked = self.inner.parked.lock().expect("parked lock poisoned");
        let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
        let (resumed, kept): (Vec<_>, Vec<_>) =
            parked.drain(..).partition(|job| job.rule == rule);
        *parked = kept;
        for job in resumed {
            queue.push(job);
        }
        drop(queue);
        drop(parked);
        self.inner.notify.notify_one();
        info!(rule, "synchronization rule resumed");
    }

    /// Cancel a queued or running job. Running jobs stop at the next
    /// candidate boundary, keeping partial progress.
    pub fn cancel(&self, job_id: &str) -> bool {
        {
            let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
            let before = queue.len();
            let kept: BinaryHeap<QueuedJob> =
                queue.drain().filter(|job| job.job_id != job_id).collect();
            *queue = kept;
            if queue.len() < before {
                return true;
            }
        }
        let running = self.inner.running.lock().expect("running lock poisoned");
        for entry in running.values() {
            if entry.job_id == job_id {
                entry.cancel.cancel();
                return true;
            }
        }
        false
    }

    pub fn status(&self, rule: &str) -> Option<RuleStatus> {
        self.inner
            .status
            .read()
            .expect("status lock poisoned")
            .get(rule)
            .cloned()
    }

    pub fn sync_status(&self) -> HashMap<String, RuleStatus> {
        self.inner.status.read().expect("status lock poisoned").clone()
    }

    pub fn update_default_period(&self, period: Duration) {
        *self.inner.default_period.write().expect("period lock poisoned") = period;
    }

    /// Finish in-flight and queued work, stop accepting new jobs, then
    /// stop the background tasks.
    pub async fn drain(&self) {
        self.inner.draining.store(true, Ordering::SeqCst);
        // Parked jobs belong to paused rules; they are discarded rather
        // than held against the drain.
        self.inner.parked.lock().expect("parked lock poisoned").clear();
        self.inner.notify.notify_one();
        loop {
            let queued = self.inner.queue.lock().expect("queue lock poisoned").len();
            let running = self.inner.running.lock().expect("running lock poisoned").len();
            if queued == 0 && running == 0 {
                break;
            }
            self.inner.notify.notify_one();
            let _ =
                tokio::time::timeout(Duration::from_millis(25), self.inner.completed.notified())
                    .await;
        }
        self.shutdown().await;
        info!("synchronizer drained");
    }

    /// Stop immediately, cancelling running jobs and discarding the queue.
    pub async fn shutdown(&self) {
        self.inner.cancel_all.cancel();
        {
            let running = self.inner.running.lock().expect("running lock poisoned");
            for entry in running.values() {
                entry.cancel.cancel();
            }
        }
        let tasks: Vec<_> = {
            let mut guard = self.inner.tasks.lock().expect("tasks lock poisoned");
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl SyncInner {
    /// Pop every runnable job, spawning one task per job. Jobs whose
    /// (rule, source, target) is already running coalesce into the dirty
    /// flag; jobs for paused rules park.
    fn dispatch_ready(inner: &Arc<SyncInner>) {
        loop {
            let job = {
                let mut queue = inner.queue.lock().expect("queue lock poisoned");
                queue.pop()
            };
            let Some(job) = job else { break };

            let paused = inner
                .paused
                .read()
                .expect("paused lock poisoned")
                .contains(&job.rule);
            if paused {
                inner.parked.lock().expect("parked lock poisoned").push(job);
                continue;
            }

            let key: JobKey = (job.rule.clone(), job.source.clone(), job.target.clone());
            let cancel = {
                let mut running = inner.running.lock().expect("running lock poisoned");
                if let Some(entry) = running.get_mut(&key) {
                    debug!(rule = %job.rule, "run in progress, coalescing");
                    entry.dirty = true;
                    continue; // job drops here, releasing its slot
                }
                let cancel = inner.cancel_all.child_token();
                running.insert(
                    key.clone(),
                    RunningEntry {
                        job_id: job.job_id.clone(),
                        dirty: false,
                        cancel: cancel.clone(),
                    },
                );
                cancel
            };

            let inner = inner.clone();
            tokio::spawn(async move {
                SyncInner::execute(inner, job, key, cancel).await;
            });
        }
    }

    async fn execute(inner: Arc<SyncInner>, job: QueuedJob, key: JobKey, cancel: CancellationToken) {
        let started_at = Utc::now();
        let timer = std::time::Instant::now();
        let outcome = inner
            .dkm
            .synchronize(&job.source, &job.target, &job.rule, None, &cancel)
            .await;

        let mut status = RuleStatus {
            last_run_started_at: Some(started_at),
            last_run_duration_ms: timer.elapsed().as_millis() as u64,
            ..RuleStatus::default()
        };
        match &outcome {
            Ok(report) => {
                status.last_run_result = Some(report.result);
                status.items_considered = report.items_considered;
                status.items_applied = report.items_applied;
                status.items_vetoed = report.items_vetoed;
                status.items_deferred = report.items_deferred;
                status.last_error = report.last_error.clone();
            }
            Err(e) => {
                warn!(rule = %job.rule, error = %e, "synchronization run failed");
                status.last_run_result = Some(SyncResult::Failed);
                status.last_error = Some(e.to_string());
                inner.emit_failed(&job).await;
            }
        }
        inner
            .status
            .write()
            .expect("status lock poisoned")
            .insert(job.rule.clone(), status);

        let dirty = {
            let mut running = inner.running.lock().expect("running lock poisoned");
            running.remove(&key).map(|entry| entry.dirty).unwrap_or(false)
        };
        drop(job); // releases the queue slot

        if dirty
            && !inner.draining.load(Ordering::SeqCst)
            && !inner.cancel_all.is_cancelled()
        {
            // One follow-up run covers everything that coalesced.
            if let Ok(slot) = inner.slots.clone().try_acquire_owned() {
                let seq = inner.seq.fetch_add(1, Ordering::SeqCst);
                let follow_up = QueuedJob {
                    priority: 0,
                    enqueued_at: Utc::now(),
                    seq,
                    job_id: format!("job-{seq}"),
                    rule: key.0.clone(),
                    source: key.1.clone(),
                    target: key.2.clone(),
                    _slot: slot,
                };
                inner.queue.lock().expect("queue lock poisoned").push(follow_up);
            }
        }
        inner.completed.notify_waiters();
        inner.notify.notify_one();
    }

    async fn emit_failed(&self, job: &QueuedJob) {
        let processor = self.events.read().expect("events lock poisoned").clone();
        let Some(processor) = processor else { return };
        let mut metadata = Properties::new();
        metadata.insert("rule".into(), Value::String(job.rule.clone()));
        metadata.insert("source".into(), Value::String(job.source.clone()));
        metadata.insert("target".into(), Value::String(job.target.clone()));
        let event = FabricEvent::new("synchronization.failed", "synchronizer", metadata);
        if let Err(e) = processor.log(event).await {
            warn!(error = %e, "failed to emit synchronization.failed event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::dual_knowledge::StoreFactory;
    use crate::domain::schema::SchemaRegistry;
    use crate::domain::{KgKind, SyncDirection, SyncFilter, SyncRule};
    use crate::infrastructure::memory_store::MemoryGraphStore;
    use crate::infrastructure::pool::GraphPool;
    use serde_json::json;

    async fn fixture(cadence: SyncCadence) -> (Synchronizer, DualKnowledgeManager) {
        let registry = Arc::new(SchemaRegistry::core());
        let meta = GraphPool::new(
            Arc::new(MemoryGraphStore::new()),
            4,
            Duration::from_millis(100),
        );
        let factory: StoreFactory = Arc::new(|_| Ok(Arc::new(MemoryGraphStore::new())));
        let dkm =
            DualKnowledgeManager::new(registry, meta, factory, 4, Duration::from_millis(100));
        dkm.create_managed_kg("local_agent_pm", KgKind::Local, None)
            .await
            .unwrap();
        dkm.create_managed_kg("global", KgKind::Global, None)
            .await
            .unwrap();
        let rule = SyncRule::new(
            "promote-decisions",
            SyncDirection::LocalToGlobal,
            SyncFilter::for_labels(&["Decision"]),
        )
        .with_cadence(cadence);
        dkm.register_rule(rule, "local_agent_pm", "global").await.unwrap();

        let config = SyncConfig {
            default_period_ms: 60_000,
            priority_queue_capacity: 4,
            intake_wait_ms: 100,
        };
        (Synchronizer::new(dkm.clone(), &config), dkm)
    }

    async fn seed_decision(dkm: &DualKnowledgeManager, title: &str) -> String {
        let pool = dkm.kg_pool("local_agent_pm").unwrap();
        let graph = pool.acquire().await.unwrap();
        let id = crate::domain::entity::new_id();
        let now = Utc::now().to_rfc3339();
        let mut props = Properties::new();
        props.insert("id".into(), json!(id));
        props.insert("title".into(), json!(title));
        props.insert("description".into(), json!("d"));
        props.insert("context".into(), json!("c"));
        props.insert("status".into(), json!("approved"));
        props.insert("created_at".into(), json!(now.clone()));
        props.insert("updated_at".into(), json!(now));
        graph.create_node("Decision", props).await.unwrap();
        id
    }

    async fn wait_for_run(sync: &Synchronizer, rule: &str) {
        for _ in 0..100 {
            if sync.status(rule).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("rule {rule} never ran");
    }

    #[tokio::test]
    async fn test_trigger_now_runs_and_reports() {
        let (sync, dkm) = fixture(SyncCadence::Manual).await;
        sync.start();
        seed_decision(&dkm, "use rust").await;

        sync.trigger_now("promote-decisions").await.unwrap();
        wait_for_run(&sync, "promote-decisions").await;

        let status = sync.status("promote-decisions").unwrap();
        assert_eq!(status.last_run_result, Some(SyncResult::Ok));
        assert_eq!(status.items_applied, 1);
        assert!(status.last_run_started_at.is_some());
        sync.drain().await;
    }

    #[tokio::test]
    async fn test_unknown_rule_rejected() {
        let (sync, _) = fixture(SyncCadence::Manual).await;
        sync.start();
        let result = sync.trigger_now("ghost").await;
        assert!(matches!(result, Err(FabricError::EntityNotFound { .. })));
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_parks_and_resume_runs() {
        let (sync, dkm) = fixture(SyncCadence::Manual).await;
        sync.start();
        seed_decision(&dkm, "parked").await;

        sync.pause("promote-decisions");
        sync.trigger_now("promote-decisions").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sync.status("promote-decisions").is_none());

        sync.resume("promote-decisions");
        wait_for_run(&sync, "promote-decisions").await;
        assert_eq!(
            sync.status("promote-decisions").unwrap().items_applied,
            1
        );
        sync.drain().await;
    }

    #[tokio::test]
    async fn test_drain_rejects_new_work() {
        let (sync, _) = fixture(SyncCadence::Manual).await;
        sync.start();
        sync.drain().await;
        let result = sync.trigger_now("promote-decisions").await;
        assert!(matches!(result, Err(FabricError::ProcessorStopped)));
    }

    #[tokio::test]
    async fn test_scheduled_cadence_fires() {
        let (sync, dkm) = fixture(SyncCadence::Scheduled { period_ms: 30 }).await;
        seed_decision(&dkm, "scheduled").await;
        sync.start();
        wait_for_run(&sync, "promote-decisions").await;
        assert!(sync.status("promote-decisions").unwrap().items_applied >= 1);
        sync.drain().await;
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let (sync, _) = fixture(SyncCadence::Manual).await;
        // Dispatcher not started: jobs stay queued.
        let job_id = sync.trigger_now("promote-decisions").await.unwrap();
        assert!(sync.cancel(&job_id));
        assert!(!sync.cancel(&job_id));
    }

    #[tokio::test]
    async fn test_queue_capacity_backpressure() {
        let registry = Arc::new(SchemaRegistry::core());
        let meta = GraphPool::new(
            Arc::new(MemoryGraphStore::new()),
            4,
            Duration::from_millis(100),
        );
        let factory: StoreFactory = Arc::new(|_| Ok(Arc::new(MemoryGraphStore::new())));
        let dkm =
            DualKnowledgeManager::new(registry, meta, factory, 4, Duration::from_millis(100));
        dkm.create_managed_kg("a", KgKind::Local, None).await.unwrap();
        dkm.create_managed_kg("b", KgKind::Global, None).await.unwrap();
        dkm.register_rule(
            SyncRule::new("r", SyncDirection::LocalToGlobal, SyncFilter::default()),
            "a",
            "b",
        )
        .await
        .unwrap();

        let config = SyncConfig {
            default_period_ms: 60_000,
            priority_queue_capacity: 1,
            intake_wait_ms: 20,
        };
        let sync = Synchronizer::new(dkm, &config);
        // Dispatcher not started: the single slot stays taken.
        sync.trigger_now("r").await.unwrap();
        let result = sync.trigger_now("r").await;
        assert!(matches!(result, Err(FabricError::BackpressureExceeded)));
    }
}
