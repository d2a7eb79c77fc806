use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use crate::jobs::canonical_url;
use crate::models::{JobStats, Lead, LeadCandidate, LeadImport};
use crate::patterns::RejectionSignal;

/// Shared handle to the SQLite store. Clones share one connection; SQLite
/// transactions taken through it serialize writers from the batch task, the
/// rejection learner and the CLI.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    rejection_tx: Option<UnboundedSender<RejectionSignal>>,
}

impl Database {
    pub fn open(path_override: Option<&Path>) -> Result<Self> {
        let path = match path_override {
            Some(p) => p.to_path_buf(),
            None => Self::default_path(),
        };
        Self::open_at(&path)
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
            rejection_tx: None,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
            rejection_tx: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn default_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "jobpilot") {
            proj_dirs.data_dir().join("jobpilot.db")
        } else {
            PathBuf::from("jobpilot.db")
        }
    }

    /// Routes `rejected` transitions with a reason to the rejection learner.
    pub fn with_rejection_hook(mut self, tx: UnboundedSender<RejectionSignal>) -> Self {
        self.rejection_tx = Some(tx);
        self
    }

    pub(crate) fn rejection_hook(&self) -> Option<&UnboundedSender<RejectionSignal>> {
        self.rejection_tx.as_ref()
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Database connection lock poisoned"))
    }

    pub fn init(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                company TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                quick_apply INTEGER NOT NULL DEFAULT 0,
                rank REAL,
                status TEXT NOT NULL DEFAULT 'queued'
                    CHECK (status IN ('queued', 'applied', 'interview', 'rejected', 'skipped', 'reported')),
                applied_method TEXT CHECK (applied_method IS NULL OR applied_method IN ('manual', 'automatic')),
                rejection_reason TEXT,
                fit_reasons TEXT,
                must_haves TEXT,
                blockers TEXT,
                category_scores TEXT,
                missing_keywords TEXT,
                description TEXT,
                search_profile TEXT,
                created_at TEXT NOT NULL,
                status_updated_at TEXT NOT NULL,
                curated INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                title TEXT,
                company TEXT,
                profile_url TEXT NOT NULL UNIQUE,
                email TEXT,
                location TEXT,
                scraped_at TEXT NOT NULL,
                deleted_at TEXT
            );

            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation TEXT NOT NULL CHECK (operation IN ('search', 'leads', 'apply')),
                status TEXT NOT NULL DEFAULT 'in_progress'
                    CHECK (status IN ('in_progress', 'completed', 'stopped')),
                items_processed INTEGER NOT NULL DEFAULT 0,
                items_added INTEGER NOT NULL DEFAULT 0,
                items_failed INTEGER NOT NULL DEFAULT 0,
                last_cursor TEXT,
                filters TEXT,
                owner_pid INTEGER,
                heartbeat_at TEXT,
                stop_requested INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS label_mappings (
                label TEXT PRIMARY KEY,
                answer_key TEXT NOT NULL,
                locator TEXT NOT NULL,
                base_confidence REAL NOT NULL DEFAULT 0.8
                    CHECK (base_confidence > 0.0 AND base_confidence <= 1.0),
                success_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                field_type TEXT,
                input_strategy TEXT,
                last_seen TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rejection_patterns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pattern_type TEXT NOT NULL,
                pattern_value TEXT NOT NULL COLLATE NOCASE,
                occurrence_count INTEGER NOT NULL DEFAULT 1,
                weight_adjustment REAL NOT NULL DEFAULT 0,
                profile_category TEXT,
                last_seen TEXT NOT NULL,
                UNIQUE (pattern_type, pattern_value)
            );

            CREATE TABLE IF NOT EXISTS weight_adjustments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                category TEXT NOT NULL,
                old_weight REAL NOT NULL,
                new_weight REAL NOT NULL,
                reason TEXT,
                job_id TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS preferences (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_runs_operation_status ON runs(operation, status);
            CREATE INDEX IF NOT EXISTS idx_label_mappings_key ON label_mappings(answer_key);
            CREATE INDEX IF NOT EXISTS idx_weight_adjustments_category ON weight_adjustments(category);
            "#,
        )?;
        migrate_runs(&conn)?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let conn = self.lock()?;
        let tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='jobs'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!(
                "Database not initialized. Run 'jobpilot init' first."
            ));
        }
        Ok(())
    }

    // --- Preferences ---

    pub fn get_preference(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT value FROM preferences WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to read preference")
    }

    pub fn set_preference(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO preferences (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now()],
        )?;
        Ok(())
    }

    pub fn list_preferences(&self) -> Result<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key, value FROM preferences ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list preferences")
    }

    // --- Lead operations ---

    /// Inserts the lead unless its profile URL was ever imported, including
    /// leads that were later soft-deleted. Returns whether a row was added.
    pub fn import_lead(&self, lead: &LeadCandidate) -> Result<bool> {
        let conn = self.lock()?;
        insert_lead(&conn, lead)
    }

    pub fn import_leads(&self, leads: &[LeadCandidate]) -> Result<LeadImport> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut report = LeadImport::default();
        for lead in leads {
            match insert_lead(&tx, lead) {
                Ok(true) => report.inserted += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(name = %lead.name, "Skipping lead: {:#}", e);
                    report.skipped += 1;
                }
            }
        }
        tx.commit()?;
        Ok(report)
    }

    pub fn list_leads(&self, include_deleted: bool) -> Result<Vec<Lead>> {
        let conn = self.lock()?;
        let mut sql = String::from(
            "SELECT id, name, title, company, profile_url, email, location, scraped_at, deleted_at
             FROM leads",
        );
        if !include_deleted {
            sql.push_str(" WHERE deleted_at IS NULL");
        }
        sql.push_str(" ORDER BY scraped_at DESC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::row_to_lead)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list leads")
    }

    /// Marks a lead deleted. The row stays so the profile is never re-imported.
    pub fn soft_delete_lead(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE leads SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![Utc::now(), id],
        )?;
        Ok(changed > 0)
    }

    fn row_to_lead(row: &rusqlite::Row) -> rusqlite::Result<Lead> {
        Ok(Lead {
            id: row.get(0)?,
            name: row.get(1)?,
            title: row.get(2)?,
            company: row.get(3)?,
            profile_url: row.get(4)?,
            email: row.get(5)?,
            location: row.get(6)?,
            scraped_at: row.get(7)?,
            deleted_at: row.get(8)?,
        })
    }

    // --- Stats ---

    pub fn job_stats(&self) -> Result<JobStats> {
        let conn = self.lock()?;
        let mut stats = JobStats::default();

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, count) = row?;
            stats.total += count;
            stats.by_status.insert(status, count);
        }

        let mut stmt = conn.prepare(
            "SELECT applied_method, COUNT(*) FROM jobs
             WHERE applied_method IS NOT NULL GROUP BY applied_method",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            match row? {
                (method, count) if method == "manual" => stats.applied_manual = count,
                (_, count) => stats.applied_automatic = count,
            }
        }

        stats.active_leads = conn.query_row(
            "SELECT COUNT(*) FROM leads WHERE deleted_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(stats)
    }
}

/// Databases created before run ownership was tracked lack its columns.
fn migrate_runs(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('runs')")?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    for (column, ddl) in [
        ("owner_pid", "ALTER TABLE runs ADD COLUMN owner_pid INTEGER"),
        ("heartbeat_at", "ALTER TABLE runs ADD COLUMN heartbeat_at TEXT"),
        (
            "stop_requested",
            "ALTER TABLE runs ADD COLUMN stop_requested INTEGER NOT NULL DEFAULT 0",
        ),
    ] {
        if !columns.contains(column) {
            conn.execute(ddl, [])?;
            tracing::info!(column, "Added missing runs column");
        }
    }
    Ok(())
}

fn insert_lead(conn: &Connection, lead: &LeadCandidate) -> Result<bool> {
    let profile_url = canonical_url(&lead.profile_url)
        .ok_or_else(|| anyhow!("Lead '{}' has no profile URL", lead.name))?;
    let inserted = conn.execute(
        "INSERT INTO leads (id, name, title, company, profile_url, email, location, scraped_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT DO NOTHING",
        params![
            content_id(&profile_url),
            lead.name.trim(),
            lead.title,
            lead.company,
            profile_url,
            lead.email,
            lead.location,
            Utc::now(),
        ],
    )?;
    Ok(inserted > 0)
}

/// Stable identifier derived from content: hex of the first 16 bytes of SHA-256.
pub(crate) fn content_id(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Decodes a nullable JSON text column, treating NULL as the type's default.
pub(crate) fn json_column<T: DeserializeOwned + Default>(
    row: &rusqlite::Row,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(T::default()),
        Some(text) if text.trim().is_empty() => Ok(T::default()),
        Some(text) => serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
        }),
    }
}

/// Parses an enum stored as text through its `FromStr` impl.
pub(crate) fn parsed_column<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = anyhow::Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        }
        _ => false,
    }
}

#[cfg(test)]
pub(crate) fn test_db() -> Database {
    let db = Database::open_in_memory().unwrap();
    db.init().unwrap();
    db
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let db = test_db();
        db.init().unwrap();
        db.ensure_initialized().unwrap();
    }

    #[test]
    fn test_ensure_initialized_fails_on_empty_db() {
        let db = Database::open_in_memory().unwrap();
        let err = db.ensure_initialized().unwrap_err();
        assert!(err.to_string().contains("jobpilot init"));
    }

    #[test]
    fn test_content_id_is_deterministic() {
        let a = content_id("https://x/jobs/1");
        assert_eq!(a, content_id("https://x/jobs/1"));
        assert_ne!(a, content_id("https://x/jobs/2"));
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_preferences_roundtrip_and_overwrite() {
        let db = test_db();
        assert_eq!(db.get_preference("answer.phone").unwrap(), None);
        db.set_preference("answer.phone", "555-0100").unwrap();
        db.set_preference("answer.phone", "555-0199").unwrap();
        assert_eq!(db.get_preference("answer.phone").unwrap().as_deref(), Some("555-0199"));
        assert_eq!(db.list_preferences().unwrap().len(), 1);
    }

    #[test]
    fn test_soft_deleted_lead_is_never_reimported() {
        let db = test_db();
        let lead = LeadCandidate {
            name: "Ada Lovelace".into(),
            profile_url: "https://www.linkedin.com/in/ada/?trk=feed".into(),
            ..Default::default()
        };
        assert!(db.import_lead(&lead).unwrap());

        let stored = db.list_leads(false).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].profile_url, "https://www.linkedin.com/in/ada");
        assert!(db.soft_delete_lead(&stored[0].id).unwrap());
        assert!(db.list_leads(false).unwrap().is_empty());

        let report = db.import_leads(&[lead]).unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(db.list_leads(true).unwrap().len(), 1);
    }

    #[test]
    fn test_import_leads_skips_lead_without_profile_url() {
        let db = test_db();
        let report = db
            .import_leads(&[
                LeadCandidate { name: "A".into(), profile_url: "https://l/in/a".into(), ..Default::default() },
                LeadCandidate { name: "No URL".into(), profile_url: "   ".into(), ..Default::default() },
                LeadCandidate { name: "B".into(), profile_url: "https://l/in/b".into(), ..Default::default() },
            ])
            .unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(db.list_leads(false).unwrap().len(), 2);
    }

    #[test]
    fn test_init_adds_run_ownership_columns_to_older_schema() {
        let db = Database::open_in_memory().unwrap();
        db.lock()
            .unwrap()
            .execute_batch(
                "CREATE TABLE runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    operation TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'in_progress',
                    items_processed INTEGER NOT NULL DEFAULT 0,
                    items_added INTEGER NOT NULL DEFAULT 0,
                    items_failed INTEGER NOT NULL DEFAULT 0,
                    last_cursor TEXT,
                    filters TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    completed_at TEXT
                );",
            )
            .unwrap();
        db.init().unwrap();
        db.init().unwrap();

        let run = db
            .begin_run(crate::models::OperationKind::Leads, &crate::config::RunConfig::default(), None)
            .unwrap();
        assert_eq!(run.owner_pid, Some(std::process::id()));
        assert!(!run.stop_requested);
    }

    #[test]
    fn test_job_stats_counts_leads() {
        let db = test_db();
        db.import_leads(&[
            LeadCandidate { name: "A".into(), profile_url: "https://l/in/a".into(), ..Default::default() },
            LeadCandidate { name: "B".into(), profile_url: "https://l/in/b".into(), ..Default::default() },
        ])
        .unwrap();
        let stats = db.job_stats().unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.active_leads, 2);
    }
}
