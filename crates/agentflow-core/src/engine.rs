// Copyright (c) 2025 Agentflow
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The workflow engine: registry facade, pending queue, worker pool,
//! history, metrics, and persistence writeback.

use crate::context::{ExecStatus, Execution, ExecutionHandle, ExecutionRef};
use crate::controller::{ControllerOutcome, ExecutionController};
use crate::error::{EngineError, Result};
use crate::executor::StepExecutor;
use crate::metrics::EngineMetrics;
use crate::persist::StateStoreRef;
use crate::registry::WorkflowRegistry;
use crate::workflow::Workflow;
use crate::agent::AgentServiceRef;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker slots; clamped to `[1, max_concurrent_workflows]`.
    pub max_worker_threads: usize,
    pub max_concurrent_workflows: usize,
    /// Pending queue high-water mark.
    pub queue_capacity: usize,
    /// Soft cap on retained history entries.
    pub history_limit: usize,
    /// Period of the background history cleanup task.
    pub cleanup_interval: Duration,
    /// Age past which auto-cleanup workflows' history entries are pruned.
    pub history_retention: Duration,
    /// Bounded wait for workers on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_worker_threads: 4,
            max_concurrent_workflows: 10,
            queue_capacity: 256,
            history_limit: 10_000,
            cleanup_interval: Duration::from_secs(60),
            history_retention: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    registry: WorkflowRegistry,
    executor: Arc<StepExecutor>,
    state_store: Option<StateStoreRef>,
    active: Mutex<HashMap<String, ExecutionRef>>,
    history: Mutex<HashMap<String, Execution>>,
    /// Frozen definition copies, kept from first execution so history stays
    /// viewable after a delete.
    definitions: DashMap<String, Arc<Workflow>>,
    queue: Mutex<VecDeque<String>>,
    queue_notify: Notify,
    running: AtomicBool,
    shutdown: Mutex<CancellationToken>,
    metrics: Mutex<EngineMetrics>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Multi-agent workflow engine.
///
/// Owns workflows, executions, history, the pending queue, and metrics; the
/// agent service and state store are borrowed collaborators injected at
/// construction.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(agent_service: AgentServiceRef) -> Self {
        Self::with_config(agent_service, EngineConfig::default())
    }

    pub fn with_config(agent_service: AgentServiceRef, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                registry: WorkflowRegistry::new(),
                executor: Arc::new(StepExecutor::new(agent_service)),
                state_store: None,
                active: Mutex::new(HashMap::new()),
                history: Mutex::new(HashMap::new()),
                definitions: DashMap::new(),
                queue: Mutex::new(VecDeque::new()),
                queue_notify: Notify::new(),
                running: AtomicBool::new(false),
                shutdown: Mutex::new(CancellationToken::new()),
                metrics: Mutex::new(EngineMetrics::default()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attaches a state store. Must be called before `start`.
    pub fn with_state_store(mut self, store: StateStoreRef) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("state store must be attached before the engine is shared");
        inner.state_store = Some(store);
        self
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Starts the dispatcher, worker pool, and cleanup task, and reloads any
    /// persisted executions.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let shutdown = CancellationToken::new();
        *self.inner.shutdown.lock() = shutdown.clone();

        self.inner.restore_persisted().await;

        let workers = self
            .inner
            .config
            .max_worker_threads
            .clamp(1, self.inner.config.max_concurrent_workflows.max(1));
        let (tx, rx) = mpsc::channel::<String>(workers);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut tasks = Vec::with_capacity(workers + 2);
        tasks.push(tokio::spawn(dispatcher_loop(
            self.inner.clone(),
            tx,
            shutdown.clone(),
        )));
        for worker_id in 0..workers {
            tasks.push(tokio::spawn(worker_loop(
                self.inner.clone(),
                rx.clone(),
                shutdown.clone(),
                worker_id,
            )));
        }
        tasks.push(tokio::spawn(cleanup_loop(self.inner.clone(), shutdown)));
        *self.inner.tasks.lock() = tasks;

        info!(workers, "Workflow engine started");
    }

    /// Stops the engine: drains by snapshotting active executions, then
    /// joins workers within the configured grace period.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.lock().cancel();
        self.inner.queue_notify.notify_waiters();

        if let Some(store) = &self.inner.state_store {
            let snapshots: Vec<Execution> = {
                let active = self.inner.active.lock();
                active.values().map(|h| h.snapshot()).collect()
            };
            for snapshot in snapshots {
                if !self.inner.should_persist(&snapshot.workflow_id) {
                    continue;
                }
                if let Err(err) = store.save(&snapshot).await {
                    warn!(
                        execution_id = %snapshot.execution_id,
                        error = %err,
                        "Failed to snapshot execution during shutdown"
                    );
                }
            }
        }

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if timeout(self.inner.config.shutdown_grace, task).await.is_err() {
                warn!("Worker did not stop within the grace period, abandoning");
            }
        }
        info!("Workflow engine stopped");
    }

    // -- Workflow management -----------------------------------------------

    pub fn create_workflow(&self, workflow: Workflow) -> Result<String> {
        self.inner.registry.create(workflow)
    }

    pub fn update_workflow(&self, workflow_id: &str, workflow: Workflow) -> Result<()> {
        self.inner.ensure_not_busy(workflow_id)?;
        self.inner.registry.update(workflow_id, workflow)?;
        // Future executions freeze the updated definition.
        self.inner.definitions.remove(workflow_id);
        Ok(())
    }

    pub fn delete_workflow(&self, workflow_id: &str) -> Result<()> {
        self.inner.ensure_not_busy(workflow_id)?;
        // The frozen copy stays so history remains viewable.
        self.inner.registry.delete(workflow_id)
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        self.inner.registry.get(workflow_id)
    }

    pub fn list_workflows(&self) -> Vec<String> {
        self.inner.registry.list()
    }

    // -- Execution ---------------------------------------------------------

    /// Queues an execution of a workflow, returning its id.
    pub fn execute_workflow(
        &self,
        workflow_id: &str,
        input: HashMap<String, Value>,
    ) -> Result<String> {
        if !self.is_running() {
            return Err(EngineError::EngineStopped);
        }
        let workflow = self
            .inner
            .registry
            .get(workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;
        self.inner.ensure_not_busy(workflow_id)?;

        {
            let queue = self.inner.queue.lock();
            if queue.len() >= self.inner.config.queue_capacity {
                return Err(EngineError::QueueFull {
                    capacity: self.inner.config.queue_capacity,
                });
            }
        }

        self.inner
            .definitions
            .entry(workflow_id.to_string())
            .or_insert_with(|| workflow.clone());

        let execution_id = format!("exec-{}", Uuid::new_v4().simple());
        let execution = Execution::new(execution_id.clone(), &workflow, input);
        let handle = ExecutionHandle::new(execution);

        self.inner
            .active
            .lock()
            .insert(execution_id.clone(), handle.clone());
        self.inner.queue.lock().push_back(execution_id.clone());
        self.inner.queue_notify.notify_one();

        if workflow.settings.persist_state {
            self.inner.persist_snapshot(handle.snapshot());
        }
        self.inner.update_metrics();

        info!(
            execution_id = %execution_id,
            workflow_id = %workflow_id,
            "Execution queued"
        );
        Ok(execution_id)
    }

    /// Pauses a running execution. The in-flight step completes; no new step
    /// starts until resume.
    pub fn pause_workflow(&self, execution_id: &str) -> Result<()> {
        let handle = self.inner.active_handle(execution_id)?;
        let status = handle.with_mut(|exec| {
            if exec.status == ExecStatus::Running {
                exec.status = ExecStatus::Paused;
                Ok(())
            } else {
                Err(exec.status)
            }
        });
        match status {
            Ok(()) => {
                info!(execution_id = %execution_id, "Execution pause requested");
                if self.inner.should_persist(&handle.workflow_id()) {
                    self.inner.persist_snapshot(handle.snapshot());
                }
                Ok(())
            }
            Err(status) => Err(EngineError::InvalidTransition {
                operation: "pause",
                execution_id: execution_id.to_string(),
                status: status.as_str().to_string(),
            }),
        }
    }

    /// Resumes a paused execution by re-enqueueing it; the scheduler picks
    /// up from the first still-pending step.
    pub fn resume_workflow(&self, execution_id: &str) -> Result<()> {
        let handle = self.inner.active_handle(execution_id)?;
        let transition = handle.with_mut(|exec| {
            if exec.status == ExecStatus::Paused {
                exec.status = ExecStatus::Running;
                Ok(())
            } else {
                Err(exec.status)
            }
        });
        match transition {
            Ok(()) => {
                self.inner.queue.lock().push_back(execution_id.to_string());
                self.inner.queue_notify.notify_one();
                info!(execution_id = %execution_id, "Execution resumed");
                Ok(())
            }
            Err(status) => Err(EngineError::InvalidTransition {
                operation: "resume",
                execution_id: execution_id.to_string(),
                status: status.as_str().to_string(),
            }),
        }
    }

    /// Cancels an execution. Idempotent: cancelling a cancelled execution is
    /// a no-op success.
    pub fn cancel_workflow(&self, execution_id: &str) -> Result<()> {
        let handle = {
            let active = self.inner.active.lock();
            active.get(execution_id).cloned()
        };
        let Some(handle) = handle else {
            // Already migrated to history; report success if it ended
            // cancelled, otherwise the execution is unknown or settled.
            let history = self.inner.history.lock();
            return match history.get(execution_id) {
                Some(exec) if exec.status == ExecStatus::Cancelled => Ok(()),
                Some(exec) => Err(EngineError::InvalidTransition {
                    operation: "cancel",
                    execution_id: execution_id.to_string(),
                    status: exec.status.as_str().to_string(),
                }),
                None => Err(EngineError::ExecutionNotFound(execution_id.to_string())),
            };
        };

        let was_paused = handle.with_mut(|exec| {
            if exec.status == ExecStatus::Cancelled {
                return None;
            }
            let was_paused = exec.status == ExecStatus::Paused;
            exec.status = ExecStatus::Cancelled;
            Some(was_paused)
        });
        let Some(was_paused) = was_paused else {
            return Ok(());
        };
        handle.trigger_cancel();
        if was_paused {
            // No worker owns a paused execution; requeue it so one finalizes.
            self.inner.queue.lock().push_back(execution_id.to_string());
            self.inner.queue_notify.notify_one();
        }
        info!(execution_id = %execution_id, "Execution cancel requested");
        Ok(())
    }

    // -- Monitoring --------------------------------------------------------

    pub fn get_execution_status(&self, execution_id: &str) -> Option<Execution> {
        let handle = {
            let active = self.inner.active.lock();
            active.get(execution_id).cloned()
        };
        if let Some(handle) = handle {
            return Some(handle.snapshot());
        }
        self.inner.history.lock().get(execution_id).cloned()
    }

    pub fn get_active_executions(&self) -> Vec<Execution> {
        let handles: Vec<ExecutionRef> = {
            let active = self.inner.active.lock();
            active.values().cloned().collect()
        };
        handles.iter().map(|h| h.snapshot()).collect()
    }

    /// History entries, most recent first, optionally filtered by workflow.
    pub fn get_execution_history(&self, workflow_id: Option<&str>) -> Vec<Execution> {
        let mut entries: Vec<Execution> = {
            let history = self.inner.history.lock();
            history
                .values()
                .filter(|e| workflow_id.map(|id| e.workflow_id == id).unwrap_or(true))
                .cloned()
                .collect()
        };
        entries.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        entries
    }

    pub fn get_step_output(&self, execution_id: &str, step_id: &str) -> Option<Value> {
        self.get_execution_status(execution_id)
            .and_then(|exec| exec.step_outputs.get(step_id).cloned())
    }

    pub fn get_global_context(&self, execution_id: &str) -> Option<HashMap<String, Value>> {
        self.get_execution_status(execution_id)
            .map(|exec| exec.global_variables)
    }

    /// Merges variables into a paused execution's global context.
    pub fn update_global_context(
        &self,
        execution_id: &str,
        variables: HashMap<String, Value>,
    ) -> Result<()> {
        let handle = self.inner.active_handle(execution_id)?;
        handle.with_mut(|exec| {
            if exec.status != ExecStatus::Paused {
                return Err(EngineError::InvalidTransition {
                    operation: "update_global_context",
                    execution_id: execution_id.to_string(),
                    status: exec.status.as_str().to_string(),
                });
            }
            exec.global_variables.extend(variables);
            Ok(())
        })
    }

    pub fn get_metrics(&self) -> EngineMetrics {
        self.inner.metrics.lock().clone()
    }
}

impl EngineInner {
    fn active_handle(&self, execution_id: &str) -> Result<ExecutionRef> {
        self.active
            .lock()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Refuses mutation while any active execution references the workflow.
    fn ensure_not_busy(&self, workflow_id: &str) -> Result<()> {
        let busy = {
            let active = self.active.lock();
            active.values().any(|h| h.workflow_id() == workflow_id)
        };
        if busy {
            Err(EngineError::WorkflowBusy(workflow_id.to_string()))
        } else {
            Ok(())
        }
    }

    fn definition_for(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        if let Some(frozen) = self.definitions.get(workflow_id) {
            return Some(frozen.value().clone());
        }
        let workflow = self.registry.get(workflow_id)?;
        self.definitions
            .insert(workflow_id.to_string(), workflow.clone());
        Some(workflow)
    }

    fn should_persist(&self, workflow_id: &str) -> bool {
        self.state_store.is_some()
            && self
                .definition_for(workflow_id)
                .map(|w| w.settings.persist_state)
                .unwrap_or(true)
    }

    /// Best-effort writeback; never blocks the caller.
    fn persist_snapshot(&self, snapshot: Execution) {
        let Some(store) = self.state_store.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = store.save(&snapshot).await {
                warn!(
                    execution_id = %snapshot.execution_id,
                    error = %err,
                    "Failed to persist execution snapshot"
                );
            }
        });
    }

    async fn restore_persisted(&self) {
        let Some(store) = &self.state_store else {
            return;
        };
        let snapshots = match store.load_all().await {
            Ok(snapshots) => snapshots,
            Err(err) => {
                warn!(error = %err, "Failed to load persisted executions");
                return;
            }
        };

        let mut restored_active = 0usize;
        let mut restored_history = 0usize;
        for mut snapshot in snapshots {
            let id = snapshot.execution_id.clone();
            if self.active.lock().contains_key(&id) || self.history.lock().contains_key(&id) {
                continue;
            }
            match snapshot.status {
                ExecStatus::Running | ExecStatus::Paused | ExecStatus::Pending => {
                    // Nobody owns the execution after a restart; hold it
                    // paused until an operator resumes it.
                    snapshot.status = ExecStatus::Paused;
                    self.active.lock().insert(id, ExecutionHandle::new(snapshot));
                    restored_active += 1;
                }
                _ => {
                    self.history.lock().insert(id, snapshot);
                    restored_history += 1;
                }
            }
        }
        self.update_metrics();
        info!(
            active = restored_active,
            history = restored_history,
            "Restored persisted executions"
        );
    }

    async fn process_execution(self: &Arc<Self>, execution_id: &str) {
        let handle = {
            let active = self.active.lock();
            active.get(execution_id).cloned()
        };
        let Some(handle) = handle else {
            debug!(execution_id = %execution_id, "Queued execution no longer active");
            return;
        };

        let workflow_id = handle.workflow_id();
        let Some(workflow) = self.definition_for(&workflow_id) else {
            handle.with_mut(|exec| {
                exec.status = ExecStatus::Failed;
                exec.error_message = format!("workflow definition not found: {}", workflow_id);
                exec.end_time = Some(Utc::now());
            });
            self.retire(execution_id, &handle);
            return;
        };

        let controller = ExecutionController::new(self.executor.clone());
        match controller.run(workflow.clone(), handle.clone()).await {
            ControllerOutcome::Paused => {
                if workflow.settings.persist_state {
                    self.persist_snapshot(handle.snapshot());
                }
            }
            ControllerOutcome::Terminal => {
                if workflow.settings.persist_state {
                    self.persist_snapshot(handle.snapshot());
                }
                self.retire(execution_id, &handle);
            }
        }
    }

    /// Moves a terminal execution from active to history and recomputes
    /// metrics.
    fn retire(&self, execution_id: &str, handle: &ExecutionRef) {
        let snapshot = handle.snapshot();
        self.active.lock().remove(execution_id);
        {
            let mut history = self.history.lock();
            history.insert(execution_id.to_string(), snapshot);
            if history.len() > self.config.history_limit {
                let oldest = history
                    .values()
                    .min_by_key(|e| e.end_time)
                    .map(|e| e.execution_id.clone());
                if let Some(oldest) = oldest {
                    history.remove(&oldest);
                }
            }
        }
        self.update_metrics();
    }

    fn update_metrics(&self) {
        let active_statuses: Vec<ExecStatus> = {
            let active = self.active.lock();
            active.values().map(|h| h.status()).collect()
        };
        let snapshot = {
            let history = self.history.lock();
            EngineMetrics::compute(active_statuses.into_iter(), history.values())
        };
        *self.metrics.lock() = snapshot;
    }

    /// Prunes aged history for workflows with auto-cleanup enabled.
    async fn cleanup_history(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.history_retention)
                .unwrap_or_else(|_| chrono::Duration::hours(1));

        let pruned: Vec<String> = {
            let history = self.history.lock();
            history
                .values()
                .filter(|e| {
                    e.end_time.map(|t| t < cutoff).unwrap_or(false)
                        && self
                            .definitions
                            .get(&e.workflow_id)
                            .map(|w| w.settings.auto_cleanup)
                            .unwrap_or(true)
                })
                .map(|e| e.execution_id.clone())
                .collect()
        };
        if pruned.is_empty() {
            return;
        }

        {
            let mut history = self.history.lock();
            for id in &pruned {
                history.remove(id);
            }
        }
        if let Some(store) = &self.state_store {
            for id in &pruned {
                if let Err(err) = store.remove(id).await {
                    warn!(execution_id = %id, error = %err, "Failed to remove pruned snapshot");
                }
            }
        }
        self.update_metrics();
        info!(pruned = pruned.len(), "History cleanup completed");
    }
}

async fn dispatcher_loop(
    inner: Arc<EngineInner>,
    tx: mpsc::Sender<String>,
    shutdown: CancellationToken,
) {
    loop {
        if !inner.running.load(Ordering::SeqCst) {
            break;
        }
        let next = inner.queue.lock().pop_front();
        match next {
            Some(execution_id) => {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        inner.queue.lock().push_front(execution_id);
                        break;
                    }
                    sent = tx.send(execution_id.clone()) => {
                        if sent.is_err() {
                            inner.queue.lock().push_front(execution_id);
                            break;
                        }
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = inner.queue_notify.notified() => {}
                }
            }
        }
    }
    debug!("Dispatcher stopped");
}

async fn worker_loop(
    inner: Arc<EngineInner>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    shutdown: CancellationToken,
    worker_id: usize,
) {
    loop {
        let next = {
            let mut guard = rx.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => None,
                msg = guard.recv() => msg,
            }
        };
        let Some(execution_id) = next else { break };
        debug!(worker_id, execution_id = %execution_id, "Worker picked up execution");
        inner.process_execution(&execution_id).await;
    }
    debug!(worker_id, "Worker stopped");
}

async fn cleanup_loop(inner: Arc<EngineInner>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.cleanup_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => inner.cleanup_history().await,
        }
    }
}
