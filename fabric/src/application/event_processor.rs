// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Event pipeline: bounded queue, dispatch workers, filters, handlers, and
//! correlation rules.
//!
//! `log` persists the event and then enqueues it; when the queue stays full
//! past the bounded wait the call fails with `BackpressureExceeded` and
//! nothing is persisted. Dispatch applies filters, then handlers (errors
//! are logged and never stop other handlers), then correlation rules whose
//! emissions feed back through `log`.
//!
//! Workers hold the queue guard through dispatch, so events from a single
//! emitter reach handlers in emission order; cross-emitter order is
//! unspecified.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::associative_memory::AssociativeMemory;
use crate::application::event_log::EventLog;
use crate::config::EventsConfig;
use crate::domain::{glob_match, FabricEvent, MemoryType, NodeRef, Properties};
use crate::error::{FabricError, Result};

/// Predicate applied before dispatch; `false` discards the event.
pub type EventFilter = Arc<dyn Fn(&FabricEvent) -> bool + Send + Sync>;

/// Consumer invoked for each matching event. Failure is a value, not a
/// panic: the pipeline logs it and continues.
pub type EventHandler =
    Arc<dyn Fn(&FabricEvent) -> std::result::Result<(), String> + Send + Sync>;

/// Correlation over a sliding time window: when every named type has been
/// observed within `window` (and, when `match_key` is set, with equal
/// metadata values under that key), an event of `emit_type` is produced
/// referencing the matched inputs. Matched partners are consumed, so one
/// complete set fires exactly once.
#[derive(Clone)]
pub struct CorrelationRule {
    pub name: String,
    pub event_types: Vec<String>,
    pub window: Duration,
    pub match_key: Option<String>,
    pub emit_type: String,
}

/// Queue and worker snapshot.
#[derive(Debug, Clone)]
pub struct ProcessorStats {
    pub queued: usize,
    pub capacity: usize,
    pub worker_count: usize,
    pub stopped: bool,
}

#[derive(Default)]
struct DispatchState {
    filters: Vec<(String, EventFilter)>,
    handlers: Vec<(String, EventHandler)>,
    correlations: Vec<CorrelationRule>,
}

struct SeenEvent {
    id: String,
    timestamp: DateTime<Utc>,
    metadata: Properties,
}

struct Inner {
    log: EventLog,
    state: StdRwLock<DispatchState>,
    seen: StdMutex<HashMap<String, VecDeque<SeenEvent>>>,
    memory: StdRwLock<Option<Arc<AssociativeMemory>>>,
    tx: StdMutex<Option<mpsc::Sender<FabricEvent>>>,
    rx: StdMutex<Option<mpsc::Receiver<FabricEvent>>>,
    stopped: AtomicBool,
    cancel: CancellationToken,
    workers: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
    backpressure_wait: Duration,
    worker_count: usize,
    queue_capacity: usize,
}

/// The dispatching half of the event pipeline.
#[derive(Clone)]
pub struct EventProcessor {
    inner: Arc<Inner>,
}

impl EventProcessor {
    pub fn new(log: EventLog, config: &EventsConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        Self {
            inner: Arc::new(Inner {
                log,
                state: StdRwLock::new(DispatchState::default()),
                seen: StdMutex::new(HashMap::new()),
                memory: StdRwLock::new(None),
                tx: StdMutex::new(Some(tx)),
                rx: StdMutex::new(Some(rx)),
                stopped: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                workers: StdMutex::new(Vec::new()),
                backpressure_wait: Duration::from_millis(config.backpressure_wait_ms),
                worker_count: config.worker_count,
                queue_capacity: config.queue_capacity,
            }),
        }
    }

    /// Wire the associative memory so dispatched events leave an episodic
    /// trace.
    pub fn attach_memory(&self, memory: Arc<AssociativeMemory>) {
        *self.inner.memory.write().expect("memory lock poisoned") = Some(memory);
    }

    /// Launch the worker pool. Idempotent; the second call is a no-op.
    pub fn start(&self) {
        let Some(rx) = self.inner.rx.lock().expect("rx lock poisoned").take() else {
            return;
        };
        let shared_rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = self.inner.workers.lock().expect("workers lock poisoned");
        for index in 0..self.inner.worker_count {
            let inner = self.inner.clone();
            let shared_rx = shared_rx.clone();
            workers.push(tokio::spawn(async move {
                debug!(worker = index, "event worker started");
                loop {
                    let mut rx = shared_rx.lock().await;
                    let event = tokio::select! {
                        biased;
                        _ = inner.cancel.cancelled() => break,
                        event = rx.recv() => event,
                    };
                    let Some(event) = event else { break };
                    // Dispatch under the guard: single-emitter order holds.
                    inner.dispatch(event).await;
                }
                debug!(worker = index, "event worker stopped");
            }));
        }
        info!(workers = self.inner.worker_count, "event processor started");
    }

    /// Persist the event and enqueue it for dispatch. Returns the event id.
    pub async fn log(&self, event: FabricEvent) -> Result<String> {
        self.inner.log_event(event).await
    }

    pub fn register_filter(&self, pattern: &str, filter: EventFilter) {
        let mut state = self.inner.state.write().expect("state lock poisoned");
        state.filters.push((pattern.to_string(), filter));
    }

    pub fn register_handler(&self, pattern: &str, handler: EventHandler) {
        let mut state = self.inner.state.write().expect("state lock poisoned");
        state.handlers.push((pattern.to_string(), handler));
    }

    pub fn register_correlation(&self, rule: CorrelationRule) {
        info!(rule = %rule.name, types = ?rule.event_types, "registered correlation rule");
        let mut state = self.inner.state.write().expect("state lock poisoned");
        state.correlations.push(rule);
    }

    /// Stop the pipeline. `drain = true` dispatches every queued event
    /// first; `drain = false` discards the backlog. Either way, later `log`
    /// calls fail with `ProcessorStopped`.
    pub async fn stop(&self, drain: bool) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if !drain {
            self.inner.cancel.cancel();
        }
        // Closing the sender lets draining workers run the queue dry.
        self.inner.tx.lock().expect("tx lock poisoned").take();

        let workers: Vec<_> = {
            let mut guard = self.inner.workers.lock().expect("workers lock poisoned");
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }
        info!(drained = drain, "event processor stopped");
    }

    pub fn stats(&self) -> ProcessorStats {
        let queued = self
            .inner
            .tx
            .lock()
            .expect("tx lock poisoned")
            .as_ref()
            .map(|tx| self.inner.queue_capacity - tx.capacity())
            .unwrap_or(0);
        ProcessorStats {
            queued,
            capacity: self.inner.queue_capacity,
            worker_count: self.inner.worker_count,
            stopped: self.inner.stopped.load(Ordering::SeqCst),
        }
    }

    /// Handler counts keyed by registration pattern.
    pub fn active_handlers(&self) -> HashMap<String, usize> {
        let state = self.inner.state.read().expect("state lock poisoned");
        let mut counts = HashMap::new();
        for (pattern, _) in &state.handlers {
            *counts.entry(pattern.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn correlation_rules(&self) -> Vec<CorrelationRule> {
        let state = self.inner.state.read().expect("state lock poisoned");
        state.correlations.clone()
    }
}

impl Inner {
    async fn log_event(&self, event: FabricEvent) -> Result<String> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(FabricError::ProcessorStopped);
        }
        let sender = self
            .tx
            .lock()
            .expect("tx lock poisoned")
            .clone()
            .ok_or(FabricError::ProcessorStopped)?;

        // Reserve queue capacity before persisting, so a backpressure
        // rejection leaves no partial write behind.
        let permit = match tokio::time::timeout(self.backpressure_wait, sender.reserve()).await {
            Err(_) => return Err(FabricError::BackpressureExceeded),
            Ok(Err(_)) => return Err(FabricError::ProcessorStopped),
            Ok(Ok(permit)) => permit,
        };

        self.log.append(&event).await?;
        let id = event.id.clone();
        permit.send(event);
        Ok(id)
    }

    async fn dispatch(&self, event: FabricEvent) {
        let (filters, handlers, rules) = {
            let state = self.state.read().expect("state lock poisoned");
            (
                state
                    .filters
                    .iter()
                    .filter(|(pattern, _)| glob_match(pattern, &event.event_type))
                    .map(|(_, f)| f.clone())
                    .collect::<Vec<_>>(),
                state
                    .handlers
                    .iter()
                    .filter(|(pattern, _)| glob_match(pattern, &event.event_type))
                    .map(|(_, h)| h.clone())
                    .collect::<Vec<_>>(),
                state.correlations.clone(),
            )
        };

        for filter in &filters {
            if !filter(&event) {
                debug!(event_id = %event.id, event_type = %event.event_type, "event filtered out");
                return;
            }
        }

        for handler in &handlers {
            if let Err(message) = handler(&event) {
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    source = %event.source,
                    error = %message,
                    "event handler failed"
                );
            }
        }

        self.remember(&event).await;

        for emitted in self.check_correlations(&event, &rules) {
            if let Err(e) = self.log_event(emitted).await {
                warn!(error = %e, "failed to log correlated event");
            }
        }
    }

    /// Leave an episodic trace of the event in associative memory.
    async fn remember(&self, event: &FabricEvent) {
        let memory = self.memory.read().expect("memory lock poisoned").clone();
        let Some(memory) = memory else { return };
        let mut context = Properties::new();
        context.insert("event_type".into(), Value::String(event.event_type.clone()));
        context.insert("event_id".into(), Value::String(event.id.clone()));
        context.insert("source".into(), Value::String(event.source.clone()));
        let content = Value::Object(event.metadata.clone());
        if let Err(e) = memory
            .store(content, context, MemoryType::Episodic, Some(0.5))
            .await
        {
            warn!(event_id = %event.id, error = %e, "failed to store event memory");
        }
    }

    fn check_correlations(
        &self,
        event: &FabricEvent,
        rules: &[CorrelationRule],
    ) -> Vec<FabricEvent> {
        let mut seen = self.seen.lock().expect("seen lock poisoned");
        let mut emissions = Vec::new();

        for rule in rules {
            if !rule.event_types.iter().any(|t| t == &event.event_type) {
                continue;
            }
            let match_value = match &rule.match_key {
                Some(key) => match event.metadata.get(key) {
                    Some(value) => Some(value.clone()),
                    None => continue,
                },
                None => None,
            };

            // Look for one partner of every other named type inside the
            // window, newest first.
            let mut partners: Vec<(String, usize, String)> = Vec::new();
            let mut complete = true;
            for wanted in rule.event_types.iter().filter(|t| *t != &event.event_type) {
                let found = seen.get(wanted).and_then(|entries| {
                    entries.iter().enumerate().rev().find(|(_, entry)| {
                        let age = (event.timestamp - entry.timestamp)
                            .num_milliseconds()
                            .unsigned_abs();
                        let within = age <= rule.window.as_millis() as u64;
                        let keyed = match (&rule.match_key, &match_value) {
                            (Some(key), Some(value)) => entry.metadata.get(key) == Some(value),
                            _ => true,
                        };
                        within && keyed
                    })
                });
                match found {
                    Some((index, entry)) => {
                        partners.push((wanted.clone(), index, entry.id.clone()))
                    }
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if !complete {
                continue;
            }

            let mut related: Vec<NodeRef> = partners
                .iter()
                .map(|(_, _, id)| NodeRef::new("Event", id.clone()))
                .collect();
            related.push(NodeRef::new("Event", event.id.clone()));

            // Consume the partners so the same set cannot fire twice.
            for (wanted, index, _) in &partners {
                if let Some(entries) = seen.get_mut(wanted) {
                    entries.remove(*index);
                }
            }

            let mut metadata = Properties::new();
            metadata.insert("correlation".into(), Value::String(rule.name.clone()));
            if let (Some(key), Some(value)) = (&rule.match_key, &match_value) {
                metadata.insert(key.clone(), value.clone());
            }
            debug!(rule = %rule.name, emit = %rule.emit_type, "correlation window complete");
            emissions.push(
                FabricEvent::new(rule.emit_type.clone(), format!("correlation:{}", rule.name), metadata)
                    .with_related(related),
            );
        }

        // Record this event for future windows of any rule that names it.
        let referenced = rules
            .iter()
            .filter(|rule| rule.event_types.iter().any(|t| t == &event.event_type))
            .collect::<Vec<_>>();
        if !referenced.is_empty() {
            let max_window = referenced
                .iter()
                .map(|rule| rule.window)
                .max()
                .unwrap_or_default();
            let entries = seen.entry(event.event_type.clone()).or_default();
            entries.push_back(SeenEvent {
                id: event.id.clone(),
                timestamp: event.timestamp,
                metadata: event.metadata.clone(),
            });
            let horizon = event.timestamp
                - chrono::Duration::milliseconds(max_window.as_millis() as i64);
            while let Some(front) = entries.front() {
                if front.timestamp < horizon || entries.len() > 100 {
                    entries.pop_front();
                } else {
                    break;
                }
            }
        }

        emissions
    }
}
