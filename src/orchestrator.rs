use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};

use crate::config::RunConfig;
use crate::db::Database;
use crate::errors::RunError;
use crate::models::{OperationKind, RunRecord, RunStatus};
use crate::runs::Progress;

const LOG_CHANNEL_CAPACITY: usize = 1024;

/// How often the owning process refreshes its run's heartbeat and polls for
/// stop requests made from other processes. Must stay well under
/// `runs::STALE_AFTER`.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorState {
    Idle,
    Running,
    Stopping,
    Error,
}

impl OrchestratorState {
    pub fn is_active(&self) -> bool {
        matches!(self, OrchestratorState::Running | OrchestratorState::Stopping)
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OrchestratorState::Idle => "idle",
            OrchestratorState::Running => "running",
            OrchestratorState::Stopping => "stopping",
            OrchestratorState::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub state: OrchestratorState,
    pub operation: Option<OperationKind>,
    pub run_id: Option<i64>,
    pub pid: Option<u32>,
    pub error: Option<String>,
}

impl StatusSnapshot {
    fn idle(error: Option<String>) -> Self {
        Self {
            state: OrchestratorState::Idle,
            operation: None,
            run_id: None,
            pid: None,
            error,
        }
    }
}

// --- Log stream ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub run_id: i64,
    pub operation: OperationKind,
    pub message: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            LogLevel::Info => "INFO ",
            LogLevel::Warn => "WARN ",
            LogLevel::Error => "ERROR",
        };
        write!(
            f,
            "{} {} [{} #{}] {}",
            self.at.format("%H:%M:%S"),
            level,
            self.operation,
            self.run_id,
            self.message
        )
    }
}

/// Emits a tracing event and pushes the same line to every live subscriber.
#[derive(Clone)]
pub struct RunLogger {
    run_id: i64,
    operation: OperationKind,
    tx: broadcast::Sender<LogLine>,
}

impl RunLogger {
    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(run_id = self.run_id, operation = %self.operation, "{}", message);
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(run_id = self.run_id, operation = %self.operation, "{}", message);
        self.push(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(run_id = self.run_id, operation = %self.operation, "{}", message);
        self.push(LogLevel::Error, message);
    }

    fn push(&self, level: LogLevel, message: String) {
        // No subscribers is fine; lines are not buffered for late readers.
        let _ = self.tx.send(LogLine {
            at: Utc::now(),
            level,
            run_id: self.run_id,
            operation: self.operation,
            message,
        });
    }
}

// --- Cooperative cancellation ---

#[derive(Default)]
struct StopInner {
    requested: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

/// Cloneable stop flag checked by the batch at its safe points.
#[derive(Clone, Default)]
pub struct StopToken {
    inner: Arc<StopInner>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        let _guard = relock(&self.inner.lock);
        self.inner.wake.notify_all();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Blocks for up to `timeout`, returning early once a stop is requested.
    /// Returns whether a stop has been requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if timeout.is_zero() {
            return self.is_stop_requested();
        }
        let deadline = Instant::now() + timeout;
        let mut guard = relock(&self.inner.lock);
        while !self.is_stop_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            guard = match self.inner.wake.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        self.is_stop_requested()
    }
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// --- Batch operation seam ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Ran out of work.
    Exhausted,
    /// Returned early at a safe point after a stop request.
    Stopped,
}

/// A long batch wrapped by the orchestrator. `run` executes on a blocking
/// thread and must call `ctx.should_stop()` between units of work.
pub trait BatchOperation: Send {
    fn kind(&self) -> OperationKind;
    fn run(&mut self, ctx: &RunContext) -> Result<RunOutcome>;
}

/// Everything a running batch needs, passed explicitly.
pub struct RunContext {
    db: Database,
    run: RunRecord,
    config: RunConfig,
    stop: StopToken,
    logger: RunLogger,
    pace: Duration,
}

impl RunContext {
    pub fn new(
        db: Database,
        run: RunRecord,
        config: RunConfig,
        stop: StopToken,
        log_tx: broadcast::Sender<LogLine>,
        pace: Duration,
    ) -> Self {
        let logger = RunLogger {
            run_id: run.id,
            operation: run.operation,
            tx: log_tx,
        };
        Self { db, run, config, stop, logger, pace }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn run_id(&self) -> i64 {
        self.run.id
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Cursor left by a previous attempt of this run, if resuming.
    pub fn resume_cursor(&self) -> Option<&str> {
        self.run.last_cursor.as_deref()
    }

    pub fn log(&self) -> &RunLogger {
        &self.logger
    }

    /// Safe-point check. Once this returns true no new unit may start.
    pub fn should_stop(&self) -> bool {
        self.stop.is_stop_requested()
    }

    /// Waits the configured pace with some jitter. Returns true if a stop
    /// arrived during the wait.
    pub fn pause(&self) -> bool {
        if self.pace.is_zero() {
            return self.should_stop();
        }
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        self.stop.wait_timeout(self.pace.mul_f64(factor))
    }

    pub fn checkpoint(&self, progress: Progress, cursor: Option<&str>) -> Result<()> {
        if progress.is_empty() && cursor.is_none() {
            return Ok(());
        }
        self.db.checkpoint(self.run.id, progress, cursor)
    }
}

// --- Orchestrator ---

#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub config: RunConfig,
    /// Existing non-completed run record to continue.
    pub resume: Option<i64>,
}

struct ActiveRun {
    operation: OperationKind,
    run_id: i64,
    stop: StopToken,
    stopping: bool,
}

#[derive(Default)]
struct Slot {
    active: Option<ActiveRun>,
    last_error: Option<String>,
}

struct Inner {
    db: Database,
    default_pace: Duration,
    heartbeat_every: Duration,
    slot: Mutex<Slot>,
    status_tx: watch::Sender<StatusSnapshot>,
    log_tx: broadcast::Sender<LogLine>,
}

/// Owns the single active batch of this process.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(db: Database, default_pace: Duration) -> Self {
        Self::with_heartbeat(db, default_pace, HEARTBEAT_INTERVAL)
    }

    pub fn with_heartbeat(db: Database, default_pace: Duration, heartbeat_every: Duration) -> Self {
        let (status_tx, _) = watch::channel(StatusSnapshot::idle(None));
        let (log_tx, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                db,
                default_pace,
                heartbeat_every,
                slot: Mutex::new(Slot::default()),
                status_tx,
                log_tx,
            }),
        }
    }

    /// Starts `operation` on a blocking worker and returns its run record.
    /// Rejected without side effects when a run is active or the
    /// configuration is invalid. Must be called within a Tokio runtime.
    pub fn start(
        &self,
        request: StartRequest,
        operation: Box<dyn BatchOperation>,
    ) -> Result<RunRecord, RunError> {
        let kind = operation.kind();
        request.config.validate(kind)?;

        let mut slot = self.slot()?;
        if let Some(active) = &slot.active {
            return Err(RunError::AlreadyActive {
                operation: active.operation,
                state: if active.stopping {
                    OrchestratorState::Stopping
                } else {
                    OrchestratorState::Running
                },
            });
        }

        let record = self.inner.db.begin_run(kind, &request.config, request.resume)?;
        let stop = StopToken::new();
        let pace = request.config.pace(self.inner.default_pace);
        let ctx = RunContext::new(
            self.inner.db.clone(),
            record.clone(),
            request.config,
            stop.clone(),
            self.inner.log_tx.clone(),
            pace,
        );

        slot.active = Some(ActiveRun {
            operation: kind,
            run_id: record.id,
            stop,
            stopping: false,
        });
        slot.last_error = None;
        self.publish(&slot);
        drop(slot);

        match &record.last_cursor {
            Some(cursor) if request.resume.is_some() => {
                ctx.log().info(format!("Resuming run #{} after {}", record.id, cursor))
            }
            _ => ctx.log().info(format!("Started {} run #{}", kind, record.id)),
        }

        let run_id = record.id;
        tokio::spawn(self.clone().keep_alive(run_id));

        let orchestrator = self.clone();
        tokio::spawn(async move {
            let joined = tokio::task::spawn_blocking(move || execute(operation, ctx)).await;
            let error = match joined {
                Ok(error) => error,
                Err(e) => {
                    let message = format!("{} run #{} panicked: {}", kind, run_id, e);
                    tracing::error!(run_id, "{}", message);
                    if let Err(e) = orchestrator.inner.db.finalize_run(run_id, RunStatus::Stopped) {
                        tracing::error!(run_id, error = %e, "Failed to finalize run record");
                    }
                    Some(message)
                }
            };
            orchestrator.finish(run_id, error);
        });

        Ok(record)
    }

    /// Requests a cooperative stop. Returns false when nothing is running.
    pub fn stop(&self) -> Result<bool> {
        let mut slot = self.slot()?;
        let Some(active) = slot.active.as_mut() else {
            return Ok(false);
        };
        if !active.stopping {
            active.stopping = true;
            active.stop.request_stop();
            let logger = RunLogger {
                run_id: active.run_id,
                operation: active.operation,
                tx: self.inner.log_tx.clone(),
            };
            logger.warn("Stop requested; finishing the current item");
        }
        self.publish(&slot);
        Ok(true)
    }

    /// Current state. With nothing running in this process, the store
    /// decides: an `in_progress` record whose owner still beats is reported
    /// as that process's run, one whose owner went quiet as `error` until it
    /// is resumed or reconciled.
    pub fn status(&self) -> Result<StatusSnapshot> {
        let slot = self.slot()?;
        if slot.active.is_some() {
            return Ok(snapshot(&slot));
        }
        let last_error = slot.last_error.clone();
        drop(slot);

        let runs = self.inner.db.in_progress_runs()?;
        let now = Utc::now();
        if let Some(stale) = runs.iter().find(|r| !r.owner_is_live(now)) {
            return Ok(StatusSnapshot {
                state: OrchestratorState::Error,
                operation: Some(stale.operation),
                run_id: Some(stale.id),
                pid: stale.owner_pid,
                error: Some(format!(
                    "{} run #{} was left in progress by a process that stopped responding; resume or reconcile it",
                    stale.operation, stale.id
                )),
            });
        }
        Ok(match runs.first() {
            Some(live) => StatusSnapshot {
                state: live.owner_state(),
                operation: Some(live.operation),
                run_id: Some(live.id),
                pid: live.owner_pid,
                error: None,
            },
            None => StatusSnapshot::idle(last_error),
        })
    }

    /// Live log lines from now on. Earlier lines are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.inner.log_tx.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.inner.status_tx.subscribe()
    }

    /// Resolves once no run is active in this process.
    pub async fn wait(&self) -> Result<StatusSnapshot> {
        let mut rx = self.inner.status_tx.subscribe();
        let snapshot = rx
            .wait_for(|s| !s.state.is_active())
            .await
            .map_err(|_| anyhow!("Orchestrator status channel closed"))?;
        Ok(snapshot.clone())
    }

    /// Marks a stale `in_progress` record `stopped` so a fresh run may start.
    /// A record whose owner is still alive is left alone.
    pub fn reconcile(&self, run_id: i64) -> Result<RunRecord, RunError> {
        if self.owns(run_id) {
            return Err(RunError::RunActive(run_id));
        }
        let db = &self.inner.db;
        let run = db.get_run(run_id)?.ok_or(RunError::RunNotFound(run_id))?;
        if run.owner_is_live(Utc::now()) {
            return Err(RunError::RunActive(run_id));
        }
        if run.status == RunStatus::InProgress {
            db.finalize_run(run_id, RunStatus::Stopped)?;
            tracing::info!(run_id, operation = %run.operation, "Reconciled stale run");
        }
        db.get_run(run_id)?.ok_or(RunError::RunNotFound(run_id))
    }

    /// Refreshes the heartbeat of `run_id` while this process runs it, and
    /// turns a stop request persisted by another process into a local stop.
    async fn keep_alive(self, run_id: i64) {
        let mut ticks = tokio::time::interval(self.inner.heartbeat_every);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticks.tick().await;
        loop {
            ticks.tick().await;
            if !self.owns(run_id) {
                break;
            }
            let db = self.inner.db.clone();
            match tokio::task::spawn_blocking(move || db.heartbeat(run_id)).await {
                Ok(Ok(true)) if self.owns(run_id) => {
                    if let Err(e) = self.stop() {
                        tracing::warn!(run_id, error = %e, "Failed to apply stored stop request");
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(run_id, error = %e, "Failed to refresh run heartbeat"),
                Err(e) => tracing::warn!(run_id, error = %e, "Heartbeat task failed"),
            }
        }
    }

    fn owns(&self, run_id: i64) -> bool {
        relock(&self.inner.slot)
            .active
            .as_ref()
            .is_some_and(|a| a.run_id == run_id)
    }

    fn finish(&self, run_id: i64, error: Option<String>) {
        let mut slot = relock(&self.inner.slot);
        if slot.active.as_ref().is_some_and(|a| a.run_id == run_id) {
            slot.active = None;
        }
        // A failed run returns to idle carrying its error.
        slot.last_error = error;
        self.publish(&slot);
    }

    fn slot(&self) -> Result<MutexGuard<'_, Slot>> {
        self.inner
            .slot
            .lock()
            .map_err(|_| anyhow!("Orchestrator state lock poisoned"))
    }

    fn publish(&self, slot: &Slot) {
        self.inner.status_tx.send_replace(snapshot(slot));
    }
}

fn snapshot(slot: &Slot) -> StatusSnapshot {
    match &slot.active {
        Some(active) => StatusSnapshot {
            state: if active.stopping {
                OrchestratorState::Stopping
            } else {
                OrchestratorState::Running
            },
            operation: Some(active.operation),
            run_id: Some(active.run_id),
            pid: Some(std::process::id()),
            error: None,
        },
        None => StatusSnapshot::idle(slot.last_error.clone()),
    }
}

/// Runs the batch to its end and finalizes the record exactly once. Returns
/// the failure message, if any.
fn execute(mut operation: Box<dyn BatchOperation>, ctx: RunContext) -> Option<String> {
    let run_id = ctx.run_id();
    let result = operation.run(&ctx);

    let (status, error) = match result {
        Ok(RunOutcome::Exhausted) => (RunStatus::Completed, None),
        Ok(RunOutcome::Stopped) => (RunStatus::Stopped, None),
        Err(e) => {
            let message = format!("{:#}", e);
            ctx.log().error(format!("Run failed: {}", message));
            (RunStatus::Stopped, Some(message))
        }
    };

    if let Err(e) = ctx.db().finalize_run(run_id, status) {
        ctx.log().error(format!("Failed to finalize run record: {:#}", e));
    }
    match ctx.db().get_run(run_id) {
        Ok(Some(run)) => ctx.log().info(format!(
            "Run #{} {}: {} processed, {} added, {} failed",
            run_id,
            run.status.as_str(),
            run.items_processed,
            run.items_added,
            run.items_failed
        )),
        Ok(None) => ctx.log().warn(format!("Run #{} record disappeared", run_id)),
        Err(e) => ctx.log().warn(format!("Could not read back run #{}: {:#}", run_id, e)),
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::runs::expire_heartbeat;
    use std::sync::mpsc as std_mpsc;
    use tokio::sync::mpsc;

    /// Processes `items` units. Before each unit it announces the index and
    /// blocks until the test releases it.
    struct GatedOperation {
        items: usize,
        started: mpsc::UnboundedSender<usize>,
        gate: std_mpsc::Receiver<()>,
    }

    impl BatchOperation for GatedOperation {
        fn kind(&self) -> OperationKind {
            OperationKind::Leads
        }

        fn run(&mut self, ctx: &RunContext) -> Result<RunOutcome> {
            let start = ctx
                .resume_cursor()
                .and_then(|c| c.parse::<usize>().ok())
                .map(|c| c + 1)
                .unwrap_or(0);
            for i in start..self.items {
                if ctx.should_stop() {
                    return Ok(RunOutcome::Stopped);
                }
                let _ = self.started.send(i);
                self.gate.recv()?;
                ctx.log().info(format!("item {}", i));
                ctx.checkpoint(Progress { processed: 1, added: 1, failed: 0 }, Some(&i.to_string()))?;
            }
            Ok(RunOutcome::Exhausted)
        }
    }

    fn gated(items: usize) -> (GatedOperation, mpsc::UnboundedReceiver<usize>, std_mpsc::Sender<()>) {
        let (started, started_rx) = mpsc::unbounded_channel();
        let (gate_tx, gate) = std_mpsc::channel();
        (GatedOperation { items, started, gate }, started_rx, gate_tx)
    }

    struct FailingOperation;

    impl BatchOperation for FailingOperation {
        fn kind(&self) -> OperationKind {
            OperationKind::Search
        }

        fn run(&mut self, _ctx: &RunContext) -> Result<RunOutcome> {
            Err(anyhow!("feed unreachable"))
        }
    }

    #[tokio::test]
    async fn test_start_while_active_is_rejected() {
        let orch = Orchestrator::new(test_db(), Duration::ZERO);
        let (op, mut started, gate) = gated(3);
        let run = orch.start(StartRequest::default(), Box::new(op)).unwrap();
        assert_eq!(started.recv().await, Some(0));
        assert_eq!(orch.status().unwrap().state, OrchestratorState::Running);

        let (second, _, _) = gated(1);
        let err = orch.start(StartRequest::default(), Box::new(second)).unwrap_err();
        assert!(matches!(
            err,
            RunError::AlreadyActive { state: OrchestratorState::Running, .. }
        ));

        assert!(orch.stop().unwrap());
        let (third, _, _) = gated(1);
        let err = orch.start(StartRequest::default(), Box::new(third)).unwrap_err();
        assert!(matches!(
            err,
            RunError::AlreadyActive { state: OrchestratorState::Stopping, .. }
        ));

        gate.send(()).unwrap();
        let done = orch.wait().await.unwrap();
        assert_eq!(done.state, OrchestratorState::Idle);
        assert_eq!(orch.inner.db.list_runs(None, 10).unwrap().len(), 1);

        let (fourth, _, gate) = gated(1);
        gate.send(()).unwrap();
        let next = orch.start(StartRequest::default(), Box::new(fourth)).unwrap();
        assert_ne!(next.id, run.id);
        orch.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_lets_current_item_finish() {
        let db = test_db();
        let orch = Orchestrator::new(db.clone(), Duration::ZERO);
        let (op, mut started, gate) = gated(5);
        let run = orch.start(StartRequest::default(), Box::new(op)).unwrap();

        assert_eq!(started.recv().await, Some(0));
        orch.stop().unwrap();
        assert_eq!(orch.status().unwrap().state, OrchestratorState::Stopping);
        gate.send(()).unwrap();
        orch.wait().await.unwrap();

        // No further item began after the stop was observed.
        assert!(started.try_recv().is_err());
        let record = db.get_run(run.id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Stopped);
        assert_eq!(record.items_processed, 1);
        assert_eq!(record.last_cursor.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_resume_continues_counters_and_cursor() {
        let db = test_db();
        let orch = Orchestrator::new(db.clone(), Duration::ZERO);
        let (op, mut started, gate) = gated(3);
        let run = orch.start(StartRequest::default(), Box::new(op)).unwrap();
        started.recv().await.unwrap();
        orch.stop().unwrap();
        gate.send(()).unwrap();
        orch.wait().await.unwrap();

        let (op, mut started, gate) = gated(3);
        for _ in 0..3 {
            gate.send(()).unwrap();
        }
        let resumed = orch
            .start(StartRequest { resume: Some(run.id), ..Default::default() }, Box::new(op))
            .unwrap();
        assert_eq!(resumed.id, run.id);
        orch.wait().await.unwrap();

        assert_eq!(started.recv().await, Some(1));
        assert_eq!(started.recv().await, Some(2));
        let record = db.get_run(run.id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.items_processed, 3);
        assert_eq!(record.last_cursor.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_stale_run_reported_as_error_until_reconciled() {
        let db = test_db();
        let crashed = db.begin_run(OperationKind::Leads, &RunConfig::default(), None).unwrap();
        expire_heartbeat(&db, crashed.id);

        let orch = Orchestrator::new(db.clone(), Duration::ZERO);
        let status = orch.status().unwrap();
        assert_eq!(status.state, OrchestratorState::Error);
        assert_eq!(status.run_id, Some(crashed.id));
        assert_eq!(status.pid, Some(std::process::id()));

        let (op, _, _) = gated(1);
        let err = orch.start(StartRequest::default(), Box::new(op)).unwrap_err();
        assert!(matches!(err, RunError::StaleRun { .. }));
        assert_eq!(orch.status().unwrap().state, OrchestratorState::Error);

        let reconciled = orch.reconcile(crashed.id).unwrap();
        assert_eq!(reconciled.status, RunStatus::Stopped);
        assert_eq!(orch.status().unwrap(), StatusSnapshot::idle(None));
        assert!(matches!(orch.reconcile(999), Err(RunError::RunNotFound(999))));
    }

    #[tokio::test]
    async fn test_other_process_sees_live_run_and_cannot_reconcile_it() {
        let db = test_db();
        let owner = Orchestrator::new(db.clone(), Duration::ZERO);
        let observer = Orchestrator::new(db.clone(), Duration::ZERO);

        let (op, mut started, gate) = gated(1);
        let run = owner.start(StartRequest::default(), Box::new(op)).unwrap();
        assert_eq!(started.recv().await, Some(0));

        let status = observer.status().unwrap();
        assert_eq!(status.state, OrchestratorState::Running);
        assert_eq!(status.run_id, Some(run.id));
        assert_eq!(status.pid, Some(std::process::id()));
        assert!(status.error.is_none());

        assert!(matches!(observer.reconcile(run.id), Err(RunError::RunActive(id)) if id == run.id));
        let (second, _, _) = gated(1);
        assert!(matches!(
            observer.start(StartRequest::default(), Box::new(second)),
            Err(RunError::AlreadyActive { state: OrchestratorState::Running, .. })
        ));

        gate.send(()).unwrap();
        let done = owner.wait().await.unwrap();
        assert!(done.error.is_none());
        let record = db.get_run(run.id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.items_processed, 1);
        assert_eq!(observer.status().unwrap(), StatusSnapshot::idle(None));
    }

    #[tokio::test]
    async fn test_stop_request_in_store_halts_owner_at_safe_point() {
        let db = test_db();
        let owner = Orchestrator::with_heartbeat(db.clone(), Duration::ZERO, Duration::from_millis(10));
        let (op, mut started, gate) = gated(5);
        let run = owner.start(StartRequest::default(), Box::new(op)).unwrap();
        assert_eq!(started.recv().await, Some(0));

        assert!(db.request_stop(run.id).unwrap());
        let observer = Orchestrator::new(db.clone(), Duration::ZERO);
        assert_eq!(observer.status().unwrap().state, OrchestratorState::Stopping);

        let mut status = owner.watch_status();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| s.state == OrchestratorState::Stopping),
        )
        .await
        .unwrap()
        .unwrap();
        gate.send(()).unwrap();
        owner.wait().await.unwrap();

        assert!(started.try_recv().is_err());
        let record = db.get_run(run.id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Stopped);
        assert_eq!(record.items_processed, 1);
    }

    #[tokio::test]
    async fn test_failure_surfaces_in_status_and_log_stream() {
        let db = test_db();
        let orch = Orchestrator::new(db.clone(), Duration::ZERO);
        let mut logs = orch.subscribe();
        let run = orch.start(StartRequest::default(), Box::new(FailingOperation)).unwrap();

        let done = orch.wait().await.unwrap();
        assert_eq!(done.state, OrchestratorState::Idle);
        assert!(done.error.as_deref().unwrap().contains("feed unreachable"));
        assert_eq!(db.get_run(run.id).unwrap().unwrap().status, RunStatus::Stopped);

        let mut saw_error = false;
        while let Ok(line) = logs.try_recv() {
            saw_error |= line.level == LogLevel::Error && line.message.contains("feed unreachable");
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_log_lines_arrive_in_order_for_subscribers_only() {
        let orch = Orchestrator::new(test_db(), Duration::ZERO);
        let (op, _started, gate) = gated(3);
        for _ in 0..3 {
            gate.send(()).unwrap();
        }
        let mut logs = orch.subscribe();
        orch.start(StartRequest::default(), Box::new(op)).unwrap();
        orch.wait().await.unwrap();

        let mut items = Vec::new();
        while let Ok(line) = logs.try_recv() {
            if line.message.starts_with("item ") {
                items.push(line.message);
            }
        }
        assert_eq!(items, vec!["item 0", "item 1", "item 2"]);

        let mut late = orch.subscribe();
        assert!(late.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_any_state_change() {
        let db = test_db();
        let orch = Orchestrator::new(db.clone(), Duration::ZERO);
        let config = RunConfig::parse(r#"{"search": {"max_pages": 0}}"#).unwrap();
        let err = orch
            .start(StartRequest { config, resume: None }, Box::new(FailingOperation))
            .unwrap_err();
        assert!(matches!(err, RunError::InvalidConfig(_)));
        assert!(db.list_runs(None, 10).unwrap().is_empty());
        assert_eq!(orch.status().unwrap().state, OrchestratorState::Idle);
    }

    #[test]
    fn test_stop_token_wakes_waiter() {
        let token = StopToken::new();
        let waiter = token.clone();
        let handle = std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        token.request_stop();
        assert!(handle.join().unwrap());
        assert!(!StopToken::new().wait_timeout(Duration::from_millis(5)));
    }
}
