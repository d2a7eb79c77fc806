use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::config::RunConfig;
use crate::db::{json_column, parsed_column, Database};
use crate::errors::RunError;
use crate::models::{OperationKind, RunRecord, RunStatus};
use crate::orchestrator::OrchestratorState;

const RUN_COLUMNS: &str = "id, operation, status, items_processed, items_added, items_failed,
    last_cursor, filters, owner_pid, heartbeat_at, stop_requested, created_at, updated_at, completed_at";

/// An owner that has not refreshed its heartbeat for this long is presumed dead.
pub const STALE_AFTER: TimeDelta = TimeDelta::seconds(30);

/// Counter increments reported by a batch operation at a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub processed: i64,
    pub added: i64,
    pub failed: i64,
}

impl Progress {
    pub fn is_empty(&self) -> bool {
        self.processed == 0 && self.added == 0 && self.failed == 0
    }
}

impl RunRecord {
    /// True while the record is `in_progress` and its owner keeps beating.
    pub fn owner_is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == RunStatus::InProgress
            && self.heartbeat_at.is_some_and(|beat| now - beat < STALE_AFTER)
    }

    /// How a live owner's run looks from outside that process.
    pub fn owner_state(&self) -> OrchestratorState {
        if self.stop_requested {
            OrchestratorState::Stopping
        } else {
            OrchestratorState::Running
        }
    }
}

impl Database {
    /// Opens a run record for `operation`: a fresh one, or the non-completed
    /// record `resume` refers to. At most one record per operation may be
    /// `in_progress`; the check and the write share one immediate transaction.
    pub fn begin_run(
        &self,
        operation: OperationKind,
        filters: &RunConfig,
        resume: Option<i64>,
    ) -> Result<RunRecord, RunError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();
        let owner = std::process::id();

        let active = active_run(&tx, operation)?;
        if let Some(live) = active.as_ref().filter(|a| a.owner_is_live(now)) {
            return Err(if resume == Some(live.id) {
                RunError::RunActive(live.id)
            } else {
                RunError::AlreadyActive { operation, state: live.owner_state() }
            });
        }

        let id = match resume {
            None => {
                if let Some(stale) = active {
                    return Err(RunError::StaleRun { operation, run_id: stale.id });
                }
                let filters_json = serde_json::to_string(filters).context("Failed to encode run filters")?;
                tx.execute(
                    "INSERT INTO runs (operation, status, filters, owner_pid, heartbeat_at, created_at, updated_at)
                     VALUES (?1, 'in_progress', ?2, ?3, ?4, ?4, ?4)",
                    params![operation.as_str(), filters_json, owner, now],
                )?;
                tx.last_insert_rowid()
            }
            Some(run_id) => {
                let existing = fetch_run(&tx, run_id)?.ok_or(RunError::RunNotFound(run_id))?;
                if existing.operation != operation {
                    return Err(RunError::WrongOperation {
                        run_id,
                        expected: operation,
                        found: existing.operation,
                    });
                }
                if existing.status == RunStatus::Completed {
                    return Err(RunError::RunCompleted(run_id));
                }
                if let Some(other) = active.filter(|a| a.id != run_id) {
                    return Err(RunError::StaleRun { operation, run_id: other.id });
                }
                tx.execute(
                    "UPDATE runs SET status = 'in_progress', completed_at = NULL, owner_pid = ?1,
                         heartbeat_at = ?2, stop_requested = 0, updated_at = ?2
                     WHERE id = ?3",
                    params![owner, now, run_id],
                )?;
                run_id
            }
        };

        let record = fetch_run(&tx, id)?.ok_or(RunError::RunNotFound(id))?;
        tx.commit()?;
        tracing::info!(
            run_id = record.id,
            operation = %operation,
            resumed = resume.is_some(),
            "Run record opened"
        );
        Ok(record)
    }

    /// Adds `progress` to the counters and moves the cursor forward. Only an
    /// `in_progress` record accepts checkpoints.
    pub fn checkpoint(&self, run_id: i64, progress: Progress, cursor: Option<&str>) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE runs
             SET items_processed = items_processed + ?1,
                 items_added = items_added + ?2,
                 items_failed = items_failed + ?3,
                 last_cursor = COALESCE(?4, last_cursor),
                 updated_at = ?5,
                 heartbeat_at = ?5
             WHERE id = ?6 AND status = 'in_progress'",
            params![progress.processed, progress.added, progress.failed, cursor, Utc::now(), run_id],
        )?;
        if changed == 0 {
            return Err(anyhow!("Run #{} is not in progress", run_id));
        }
        Ok(())
    }

    /// Moves an `in_progress` record to a terminal status. Returns false when
    /// the record was already finalized.
    pub fn finalize_run(&self, run_id: i64, status: RunStatus) -> Result<bool> {
        if status == RunStatus::InProgress {
            return Err(anyhow!("A run can only be finalized as completed or stopped"));
        }
        let conn = self.lock()?;
        let now = Utc::now();
        let changed = conn.execute(
            "UPDATE runs SET status = ?1, completed_at = ?2, updated_at = ?2
             WHERE id = ?3 AND status = 'in_progress'",
            params![status.as_str(), now, run_id],
        )?;
        if changed > 0 {
            tracing::info!(run_id, status = status.as_str(), "Run record finalized");
        }
        Ok(changed > 0)
    }

    /// Refreshes the owner's heartbeat. Returns whether a stop was requested
    /// for the run from another process.
    pub fn heartbeat(&self, run_id: i64) -> Result<bool> {
        let conn = self.lock()?;
        conn.query_row(
            "UPDATE runs SET heartbeat_at = ?1
             WHERE id = ?2 AND status = 'in_progress'
             RETURNING stop_requested",
            params![Utc::now(), run_id],
            |row| row.get(0),
        )
        .optional()
        .map(|flag| flag.unwrap_or(false))
        .context("Failed to refresh run heartbeat")
    }

    /// Persists a stop request for the owning process to pick up at its next
    /// heartbeat. Returns false when the run is no longer in progress.
    pub fn request_stop(&self, run_id: i64) -> Result<bool, RunError> {
        let conn = self.lock()?;
        if fetch_run(&conn, run_id)?.is_none() {
            return Err(RunError::RunNotFound(run_id));
        }
        let changed = conn.execute(
            "UPDATE runs SET stop_requested = 1, updated_at = ?1
             WHERE id = ?2 AND status = 'in_progress'",
            params![Utc::now(), run_id],
        )?;
        if changed > 0 {
            tracing::info!(run_id, "Stop requested for run");
        }
        Ok(changed > 0)
    }

    pub fn get_run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        let conn = self.lock()?;
        fetch_run(&conn, run_id)
    }

    pub fn in_progress_runs(&self) -> Result<Vec<RunRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE status = 'in_progress' ORDER BY id"
        ))?;
        let rows = stmt.query_map([], row_to_run)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list in-progress runs")
    }

    pub fn list_runs(&self, operation: Option<OperationKind>, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE ?1 IS NULL OR operation = ?1
             ORDER BY id DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![operation.map(|o| o.as_str()), limit as i64],
            row_to_run,
        )?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list runs")
    }
}

fn active_run(conn: &Connection, operation: OperationKind) -> Result<Option<RunRecord>> {
    conn.query_row(
        &format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE operation = ?1 AND status = 'in_progress'
             ORDER BY id DESC LIMIT 1"
        ),
        [operation.as_str()],
        row_to_run,
    )
    .optional()
    .context("Failed to look up active run")
}

fn fetch_run(conn: &Connection, run_id: i64) -> Result<Option<RunRecord>> {
    conn.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
        [run_id],
        row_to_run,
    )
    .optional()
    .context("Failed to load run record")
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        operation: parsed_column(row, 1)?,
        status: parsed_column(row, 2)?,
        items_processed: row.get(3)?,
        items_added: row.get(4)?,
        items_failed: row.get(5)?,
        last_cursor: row.get(6)?,
        filters: json_column(row, 7)?,
        owner_pid: row.get(8)?,
        heartbeat_at: row.get(9)?,
        stop_requested: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
        completed_at: row.get(13)?,
    })
}

/// Backdates a run's heartbeat so its owner looks dead.
#[cfg(test)]
pub(crate) fn expire_heartbeat(db: &Database, run_id: i64) {
    let conn = db.lock().unwrap();
    conn.execute(
        "UPDATE runs SET heartbeat_at = ?1 WHERE id = ?2",
        params![Utc::now() - STALE_AFTER - TimeDelta::seconds(1), run_id],
    )
    .unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[test]
    fn test_begin_run_rejects_second_in_progress_record() {
        let db = test_db();
        let run = db.begin_run(OperationKind::Leads, &RunConfig::default(), None).unwrap();
        assert_eq!(run.status, RunStatus::InProgress);
        assert_eq!(run.filters, Some(RunConfig::default()));
        assert_eq!(run.owner_pid, Some(std::process::id()));
        assert!(run.owner_is_live(Utc::now()));

        let err = db.begin_run(OperationKind::Leads, &RunConfig::default(), None).unwrap_err();
        assert!(matches!(
            err,
            RunError::AlreadyActive { operation: OperationKind::Leads, state: OrchestratorState::Running }
        ));

        expire_heartbeat(&db, run.id);
        let err = db.begin_run(OperationKind::Leads, &RunConfig::default(), None).unwrap_err();
        assert!(matches!(err, RunError::StaleRun { run_id, .. } if run_id == run.id));

        // Other families are independent.
        db.begin_run(OperationKind::Search, &RunConfig::default(), None).unwrap();
    }

    #[test]
    fn test_stale_run_can_be_resumed_but_live_one_cannot() {
        let db = test_db();
        let run = db.begin_run(OperationKind::Search, &RunConfig::default(), None).unwrap();
        assert!(matches!(
            db.begin_run(OperationKind::Search, &RunConfig::default(), Some(run.id)),
            Err(RunError::RunActive(id)) if id == run.id
        ));

        expire_heartbeat(&db, run.id);
        db.request_stop(run.id).unwrap();
        let resumed = db.begin_run(OperationKind::Search, &RunConfig::default(), Some(run.id)).unwrap();
        assert_eq!(resumed.id, run.id);
        assert!(resumed.owner_is_live(Utc::now()));
        assert!(!resumed.stop_requested);
    }

    #[test]
    fn test_stop_request_is_reported_by_heartbeat() {
        let db = test_db();
        let run = db.begin_run(OperationKind::Leads, &RunConfig::default(), None).unwrap();
        expire_heartbeat(&db, run.id);

        assert!(!db.heartbeat(run.id).unwrap());
        assert!(db.get_run(run.id).unwrap().unwrap().owner_is_live(Utc::now()));

        assert!(db.request_stop(run.id).unwrap());
        assert!(db.heartbeat(run.id).unwrap());
        assert_eq!(db.get_run(run.id).unwrap().unwrap().owner_state(), OrchestratorState::Stopping);

        db.finalize_run(run.id, RunStatus::Stopped).unwrap();
        assert!(!db.request_stop(run.id).unwrap());
        assert!(!db.heartbeat(run.id).unwrap());
        assert!(matches!(db.request_stop(99), Err(RunError::RunNotFound(99))));
    }

    #[test]
    fn test_checkpoint_accumulates_and_moves_cursor() {
        let db = test_db();
        let run = db.begin_run(OperationKind::Search, &RunConfig::default(), None).unwrap();
        db.checkpoint(run.id, Progress { processed: 10, added: 4, failed: 1 }, Some("1")).unwrap();
        db.checkpoint(run.id, Progress { processed: 5, added: 2, failed: 0 }, None).unwrap();

        let run = db.get_run(run.id).unwrap().unwrap();
        assert_eq!((run.items_processed, run.items_added, run.items_failed), (15, 6, 1));
        assert_eq!(run.last_cursor.as_deref(), Some("1"));
    }

    #[test]
    fn test_finalize_happens_exactly_once() {
        let db = test_db();
        let run = db.begin_run(OperationKind::Apply, &RunConfig::default(), None).unwrap();
        assert!(db.finalize_run(run.id, RunStatus::Stopped).unwrap());
        assert!(!db.finalize_run(run.id, RunStatus::Completed).unwrap());
        assert!(db.checkpoint(run.id, Progress::default(), Some("x")).is_err());

        let run = db.get_run(run.id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Stopped);
        assert!(run.completed_at.is_some());
        assert!(db.finalize_run(run.id, RunStatus::InProgress).is_err());
    }

    #[test]
    fn test_resume_continues_same_record() {
        let db = test_db();
        let run = db.begin_run(OperationKind::Leads, &RunConfig::default(), None).unwrap();
        db.checkpoint(run.id, Progress { processed: 3, added: 3, failed: 0 }, Some("https://l/in/c"))
            .unwrap();
        db.finalize_run(run.id, RunStatus::Stopped).unwrap();

        let resumed = db.begin_run(OperationKind::Leads, &RunConfig::default(), Some(run.id)).unwrap();
        assert_eq!(resumed.id, run.id);
        assert_eq!(resumed.status, RunStatus::InProgress);
        assert_eq!(resumed.items_processed, 3);
        assert_eq!(resumed.last_cursor.as_deref(), Some("https://l/in/c"));
        assert!(resumed.completed_at.is_none());
        assert_eq!(db.list_runs(None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_resume_validation() {
        let db = test_db();
        assert!(matches!(
            db.begin_run(OperationKind::Leads, &RunConfig::default(), Some(42)),
            Err(RunError::RunNotFound(42))
        ));

        let run = db.begin_run(OperationKind::Leads, &RunConfig::default(), None).unwrap();
        assert!(matches!(
            db.begin_run(OperationKind::Search, &RunConfig::default(), Some(run.id)),
            Err(RunError::WrongOperation { .. })
        ));

        db.finalize_run(run.id, RunStatus::Completed).unwrap();
        assert!(matches!(
            db.begin_run(OperationKind::Leads, &RunConfig::default(), Some(run.id)),
            Err(RunError::RunCompleted(_))
        ));
    }

    #[test]
    fn test_list_runs_filters_by_operation() {
        let db = test_db();
        let a = db.begin_run(OperationKind::Leads, &RunConfig::default(), None).unwrap();
        db.finalize_run(a.id, RunStatus::Completed).unwrap();
        db.begin_run(OperationKind::Search, &RunConfig::default(), None).unwrap();

        assert_eq!(db.list_runs(None, 10).unwrap().len(), 2);
        let leads = db.list_runs(Some(OperationKind::Leads), 10).unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].id, a.id);
        assert_eq!(db.in_progress_runs().unwrap().len(), 1);
        assert!(active_run(&db.lock().unwrap(), OperationKind::Leads).unwrap().is_none());
    }
}
