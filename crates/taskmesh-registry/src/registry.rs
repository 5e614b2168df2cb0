use crate::agent::{WorkerAgent, WorkerStatus};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use taskmesh_core::{EventBus, MeshError, MeshEvent, MeshResult, StateStore, WorkerId};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Tracks known worker agents and answers capability-match queries.
///
/// A constructed, injected service (never a process-global): the saga
/// coordinator and task scheduler share one instance per engine. All
/// mutations to a worker record happen under the registry's lock; callers
/// only ever see snapshots.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerId, WorkerAgent>>,
    events: EventBus,
    store: Arc<dyn StateStore>,
}

impl WorkerRegistry {
    /// Create an empty registry emitting on `events` and mirroring worker
    /// records into `store`.
    pub fn new(events: EventBus, store: Arc<dyn StateStore>) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            events,
            store,
        }
    }

    /// Add or update a worker entry.
    ///
    /// Overwrite is legal and used for re-registration after a restart.
    /// Fails with [`MeshError::DuplicateIdentity`] only when a live (not
    /// offline) entry with the same id declares a different capability set.
    pub async fn register(&self, agent: WorkerAgent) -> MeshResult<WorkerId> {
        let id = agent.id;
        {
            let mut workers = self.workers.write().await;
            if let Some(existing) = workers.get(&id) {
                if existing.status != WorkerStatus::Offline
                    && existing.capabilities != agent.capabilities
                {
                    return Err(MeshError::DuplicateIdentity(id.to_string()));
                }
            }
            workers.insert(id, agent.clone());
        }
        info!(worker = %id, capabilities = ?agent.capabilities, "worker registered");
        self.persist(&agent).await;
        self.events.publish(MeshEvent::WorkerRegistered { worker: id });
        Ok(id)
    }

    /// Best available worker whose capability set covers `required`.
    ///
    /// Filters out offline and fully-loaded workers, orders by ascending
    /// load ratio, ties broken by descending success rate. `None` is the
    /// backpressure signal; callers re-poll with jittered delay.
    pub async fn find_match(&self, required: &[String]) -> Option<WorkerAgent> {
        let workers = self.workers.read().await;
        workers
            .values()
            .filter(|w| w.is_available() && w.covers(required))
            .min_by(|a, b| {
                a.load_ratio()
                    .partial_cmp(&b.load_ratio())
                    .unwrap_or(Ordering::Equal)
                    .then(
                        b.success_rate
                            .partial_cmp(&a.success_rate)
                            .unwrap_or(Ordering::Equal),
                    )
            })
            .cloned()
    }

    /// Reserve `cost` units of load on a worker at assignment time.
    ///
    /// Returns [`MeshError::NoWorkerAvailable`] if the worker filled up (or
    /// went offline) between match and reserve; the caller simply re-polls.
    pub async fn reserve(&self, id: WorkerId, cost: u32) -> MeshResult<()> {
        let mut workers = self.workers.write().await;
        let agent = workers
            .get_mut(&id)
            .ok_or_else(|| MeshError::NotFound(format!("worker {id}")))?;
        if !agent.is_available() {
            return Err(MeshError::NoWorkerAvailable {
                capabilities: agent
                    .capabilities
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(","),
            });
        }
        agent.current_load = agent.current_load.saturating_add(cost);
        agent.refresh_status();
        let snapshot = agent.clone();
        drop(workers);
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Drop a reservation without recording an outcome, for assignments
    /// abandoned before dispatch.
    pub async fn release(&self, id: WorkerId, cost: u32) -> MeshResult<()> {
        let mut workers = self.workers.write().await;
        let agent = workers
            .get_mut(&id)
            .ok_or_else(|| MeshError::NotFound(format!("worker {id}")))?;
        agent.current_load = agent.current_load.saturating_sub(cost);
        agent.refresh_status();
        let snapshot = agent.clone();
        drop(workers);
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Record the outcome of one attempt: releases the reserved `cost` and
    /// folds `success` into the rolling success rate (EMA, smoothing 0.05).
    pub async fn record_outcome(&self, id: WorkerId, success: bool, cost: u32) -> MeshResult<()> {
        let mut workers = self.workers.write().await;
        let agent = workers
            .get_mut(&id)
            .ok_or_else(|| MeshError::NotFound(format!("worker {id}")))?;
        agent.current_load = agent.current_load.saturating_sub(cost);
        agent.record(success);
        agent.refresh_status();
        let snapshot = agent.clone();
        drop(workers);
        debug!(worker = %id, success, "recorded attempt outcome");
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Transition a worker's status. Going offline drops its reserved load
    /// and publishes `worker:lost` so schedulers requeue its assignments.
    pub async fn mark_status(&self, id: WorkerId, status: WorkerStatus) -> MeshResult<()> {
        let snapshot = {
            let mut workers = self.workers.write().await;
            let agent = workers
                .get_mut(&id)
                .ok_or_else(|| MeshError::NotFound(format!("worker {id}")))?;
            agent.status = status;
            if status == WorkerStatus::Offline {
                agent.current_load = 0;
            } else {
                agent.refresh_status();
            }
            agent.clone()
        };
        self.persist(&snapshot).await;
        if status == WorkerStatus::Offline {
            warn!(worker = %id, "worker went offline");
            self.events.publish(MeshEvent::WorkerLost { worker: id });
        }
        Ok(())
    }

    /// Refresh a worker's heartbeat timestamp.
    pub async fn heartbeat(&self, id: WorkerId) -> MeshResult<()> {
        let mut workers = self.workers.write().await;
        let agent = workers
            .get_mut(&id)
            .ok_or_else(|| MeshError::NotFound(format!("worker {id}")))?;
        agent.last_heartbeat = chrono::Utc::now();
        Ok(())
    }

    /// Mark every worker whose heartbeat is older than `max_age` offline,
    /// publishing `worker:lost` for each. Returns the swept ids.
    pub async fn sweep_stale(&self, max_age: std::time::Duration) -> Vec<WorkerId> {
        let now = chrono::Utc::now();
        let stale: Vec<WorkerId> = {
            let workers = self.workers.read().await;
            workers
                .values()
                .filter(|w| w.status != WorkerStatus::Offline)
                .filter(|w| {
                    (now - w.last_heartbeat).to_std().unwrap_or_default() > max_age
                })
                .map(|w| w.id)
                .collect()
        };
        for id in &stale {
            // mark_status re-checks existence; a concurrent removal is fine.
            if let Err(e) = self.mark_status(*id, WorkerStatus::Offline).await {
                warn!(worker = %id, error = %e, "failed to sweep stale worker");
            }
        }
        stale
    }

    /// Snapshot of a single worker.
    pub async fn get(&self, id: WorkerId) -> Option<WorkerAgent> {
        self.workers.read().await.get(&id).cloned()
    }

    /// Snapshot of all workers.
    pub async fn all(&self) -> Vec<WorkerAgent> {
        self.workers.read().await.values().cloned().collect()
    }

    /// Number of registered workers (any status).
    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Best-effort mirror of a worker record into the state store.
    async fn persist(&self, agent: &WorkerAgent) {
        let key = format!("worker/{}", agent.id);
        match serde_json::to_value(agent) {
            Ok(value) => {
                if let Err(e) = self.store.set(&key, value).await {
                    warn!(worker = %agent.id, error = %e, "failed to persist worker record");
                }
            }
            Err(e) => warn!(worker = %agent.id, error = %e, "failed to serialize worker record"),
        }
    }
}
