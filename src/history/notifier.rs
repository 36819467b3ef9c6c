use crate::core::errors::{ProcessionError, Result};
use crate::history::events::{
    next_sequence, now_ms, EventEnvelope, HistorySink, LifecycleEvent,
};
use async_broadcast::{InactiveReceiver, Receiver, RecvError, Sender};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Out-of-band queue between the migration executor and the history
/// worker. Emission is fire-and-forget; consumers drain on their own
/// schedule, so history is only eventually consistent with the tree.
pub struct HistoryNotifier {
    tx: Sender<EventEnvelope>,
    _keepalive: InactiveReceiver<EventEnvelope>,
    pending: Arc<AtomicU64>,
    poll_interval: Duration,
}

impl HistoryNotifier {
    pub fn new(capacity: usize, poll_interval: Duration) -> Self {
        let (tx, rx) = async_broadcast::broadcast(capacity);
        Self {
            tx,
            _keepalive: rx.deactivate(),
            pending: Arc::new(AtomicU64::new(0)),
            poll_interval,
        }
    }

    /// Subscribe a consumer. Must happen before events of interest are
    /// emitted; the queue does not replay.
    pub fn subscribe(&self) -> Receiver<EventEnvelope> {
        self.tx.new_receiver()
    }

    pub(crate) fn pending_handle(&self) -> Arc<AtomicU64> {
        self.pending.clone()
    }

    /// Enqueue one lifecycle event. Waits only when the queue is at
    /// capacity (backpressure), never on consumers.
    pub async fn emit(&self, event: LifecycleEvent) -> Result<()> {
        let envelope = EventEnvelope {
            version: 1,
            sequence: next_sequence(),
            timestamp: now_ms(),
            event,
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.tx.broadcast_direct(envelope).await {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(ProcessionError::concurrency(format!(
                "history queue rejected event: {}",
                e
            )));
        }
        Ok(())
    }

    /// Number of emitted envelopes not yet applied by the worker
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_drained(&self) -> bool {
        self.pending() == 0
    }

    /// Bounded poll until every emitted event has been applied. Callers
    /// that need history to reflect a migration must wait through this;
    /// the engine gives no synchronous guarantee.
    pub async fn wait_until_drained(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_drained() {
            if tokio::time::Instant::now() >= deadline {
                return Err(ProcessionError::concurrency_timeout(
                    "waiting for history queue to drain",
                    timeout.as_millis() as u64,
                ));
            }
            sleep(self.poll_interval).await;
        }
        Ok(())
    }

    /// Close the queue; the worker loop ends once the backlog is drained
    pub fn close(&self) {
        self.tx.close();
    }
}

/// Historical record of one process instance
#[derive(Debug, Clone)]
pub struct HistoricInstance {
    pub instance_id: String,
    pub definition_id: String,
    pub super_instance_id: Option<String>,
    pub started_ms: u64,
    pub ended_ms: Option<u64>,
}

/// Historical record of one execution's stay at one activity
#[derive(Debug, Clone)]
pub struct HistoricActivity {
    pub execution_id: String,
    pub instance_id: String,
    pub activity_id: Option<String>,
    pub started_ms: u64,
    pub ended_ms: Option<u64>,
}

/// Replayed historical state, owned by the history worker. Reads lag the
/// live tree until the queue drains.
#[derive(Debug, Default)]
pub struct HistoryStore {
    instances: DashMap<String, HistoricInstance>,
    activities: DashMap<String, HistoricActivity>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn activity_key(execution_id: &str, activity_id: Option<&str>) -> String {
        format!("{}@{}", execution_id, activity_id.unwrap_or("-"))
    }

    /// Apply one envelope to the historical record
    pub fn apply(&self, envelope: &EventEnvelope) {
        match &envelope.event {
            LifecycleEvent::ProcessInstanceStarted {
                instance_id,
                definition_id,
                super_instance_id,
            } => {
                self.instances.insert(
                    instance_id.clone(),
                    HistoricInstance {
                        instance_id: instance_id.clone(),
                        definition_id: definition_id.clone(),
                        super_instance_id: super_instance_id.clone(),
                        started_ms: envelope.timestamp,
                        ended_ms: None,
                    },
                );
            }
            LifecycleEvent::ProcessInstanceEnded { instance_id, .. } => {
                if let Some(mut instance) = self.instances.get_mut(instance_id) {
                    instance.ended_ms = Some(envelope.timestamp);
                } else {
                    warn!(instance_id, "History saw end of unknown instance");
                }
            }
            LifecycleEvent::ExecutionCreated {
                instance_id,
                execution_id,
                activity_id,
            } => {
                let key = Self::activity_key(execution_id, activity_id.as_deref());
                self.activities.insert(
                    key,
                    HistoricActivity {
                        execution_id: execution_id.clone(),
                        instance_id: instance_id.clone(),
                        activity_id: activity_id.clone(),
                        started_ms: envelope.timestamp,
                        ended_ms: None,
                    },
                );
            }
            LifecycleEvent::ExecutionEnded {
                execution_id,
                activity_id,
                ..
            } => {
                let key = Self::activity_key(execution_id, activity_id.as_deref());
                if let Some(mut activity) = self.activities.get_mut(&key) {
                    activity.ended_ms = Some(envelope.timestamp);
                }
            }
        }
    }

    pub fn instance(&self, instance_id: &str) -> Option<HistoricInstance> {
        self.instances.get(instance_id).map(|i| i.clone())
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn ended_instance_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| i.ended_ms.is_some())
            .count()
    }

    pub fn activities_for_instance(&self, instance_id: &str) -> Vec<HistoricActivity> {
        self.activities
            .iter()
            .filter(|a| a.instance_id == instance_id)
            .map(|a| a.clone())
            .collect()
    }

    /// Open (not yet ended) historic activity entries for an instance
    pub fn open_activities(&self, instance_id: &str) -> Vec<HistoricActivity> {
        self.activities_for_instance(instance_id)
            .into_iter()
            .filter(|a| a.ended_ms.is_none())
            .collect()
    }
}

/// Independent worker that drains the notifier queue into the history
/// store, polling/batched on its own schedule.
pub struct HistoryWorker;

impl HistoryWorker {
    pub fn spawn(
        notifier: &HistoryNotifier,
        store: Arc<HistoryStore>,
        sink: Option<Arc<dyn HistorySink>>,
    ) -> JoinHandle<()> {
        let mut rx = notifier.subscribe();
        let pending = notifier.pending_handle();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        store.apply(&envelope);
                        if let Some(sink) = &sink {
                            sink.record(&envelope);
                        }
                        pending.fetch_sub(1, Ordering::SeqCst);
                    }
                    Err(RecvError::Overflowed(missed)) => {
                        warn!(missed, "History worker missed events");
                        pending.fetch_sub(missed, Ordering::SeqCst);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("History worker stopped");
        })
    }
}
