use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;

use crate::db::{content_id, is_unique_violation, json_column, parsed_column, Database};
use crate::models::{
    AppliedMethod, Candidate, FitDetails, IngestReport, Job, JobStatus, SkipReason,
    SkippedCandidate,
};
use crate::patterns::RejectionSignal;

const JOB_COLUMNS: &str = "id, title, company, url, quick_apply, rank, status, applied_method,
    rejection_reason, fit_reasons, must_haves, blockers, category_scores, missing_keywords,
    description, search_profile, created_at, status_updated_at, curated";

/// Normalizes a posting or profile URL: drops tracking query parameters,
/// fragments and trailing slashes so rediscovery maps to the same row.
pub fn canonical_url(url: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }

    let end = url.find(['?', '#']).unwrap_or(url.len());
    let clean = url[..end].trim_end_matches('/');
    if clean.is_empty() {
        return None;
    }
    Some(clean.to_string())
}

/// Deterministic job id for a URL.
pub fn job_id_for_url(url: &str) -> Option<String> {
    canonical_url(url).map(|u| content_id(&u))
}

impl Database {
    // --- Ingestion ---

    /// Applies the ingestion rules to a batch inside one transaction:
    /// unknown URLs are inserted as `queued`, `reported` rows are re-queued
    /// with the new fit data, everything else is skipped with a reason.
    pub fn ingest(&self, candidates: &[Candidate]) -> Result<IngestReport> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now();
        let mut report = IngestReport::default();
        let mut seen: HashSet<String> = HashSet::new();

        for candidate in candidates {
            let Some(url) = canonical_url(&candidate.url) else {
                tracing::debug!(title = %candidate.title, "Skipping candidate without URL");
                report.skipped.push(SkippedCandidate {
                    url: candidate.url.clone(),
                    reason: SkipReason::MissingUrl,
                });
                continue;
            };

            let skip = |report: &mut IngestReport, reason: SkipReason| {
                tracing::debug!(url = %url, %reason, "Skipping candidate");
                report.skipped.push(SkippedCandidate { url: url.clone(), reason });
            };

            if !seen.insert(url.clone()) {
                skip(&mut report, SkipReason::DuplicateUrl);
                continue;
            }

            let id = content_id(&url);
            match stored_status(&tx, &id)? {
                None => match insert_job(&tx, &id, &url, candidate, now) {
                    Ok(()) => report.inserted += 1,
                    Err(e) if is_unique_violation(&e) => skip(&mut report, SkipReason::DuplicateUrl),
                    Err(e) => return Err(e).context("Failed to insert job"),
                },
                Some(JobStatus::Reported) => {
                    requeue_job(&tx, &id, candidate, now)?;
                    tracing::info!(job_id = %id, url = %url, "Re-queued previously reported job");
                    report.requeued += 1;
                }
                Some(JobStatus::Queued) => skip(&mut report, SkipReason::AlreadyQueued),
                Some(_) => skip(&mut report, SkipReason::AlreadyProcessed),
            }
        }

        tx.commit().context("Failed to commit ingestion batch")?;
        tracing::info!(
            inserted = report.inserted,
            requeued = report.requeued,
            skipped = report.skipped_count(),
            "Ingested batch of {} candidates",
            candidates.len()
        );
        Ok(report)
    }

    /// What ingestion would do with this URL, without writing. `None` means
    /// the candidate would be inserted or re-queued and is worth ranking.
    pub fn job_disposition(&self, url: &str) -> Result<Option<SkipReason>> {
        let Some(id) = job_id_for_url(url) else {
            return Ok(Some(SkipReason::MissingUrl));
        };
        let conn = self.lock()?;
        Ok(match stored_status(&conn, &id)? {
            None | Some(JobStatus::Reported) => None,
            Some(JobStatus::Queued) => Some(SkipReason::AlreadyQueued),
            Some(_) => Some(SkipReason::AlreadyProcessed),
        })
    }

    // --- Status transitions ---

    /// Moves a job to `status` and stamps the transition time. A rejection
    /// with a reason is handed to the rejection learner after the update has
    /// committed; that hand-off never affects the result.
    pub fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        applied_method: Option<AppliedMethod>,
        rejection_reason: Option<&str>,
    ) -> Result<bool> {
        let reason = rejection_reason.map(str::trim).filter(|r| !r.is_empty());

        let signal = {
            let conn = self.lock()?;
            let changed = conn.execute(
                "UPDATE jobs
                 SET status = ?1,
                     status_updated_at = ?2,
                     applied_method = COALESCE(?3, applied_method),
                     rejection_reason = COALESCE(?4, rejection_reason)
                 WHERE id = ?5",
                params![
                    status.as_str(),
                    Utc::now(),
                    applied_method.map(|m| m.as_str()),
                    reason,
                    job_id
                ],
            )?;
            if changed == 0 {
                return Ok(false);
            }
            tracing::info!(job_id, status = %status, "Job status updated");

            match (status, reason) {
                (JobStatus::Rejected, Some(reason)) => conn
                    .query_row(
                        "SELECT title, company, search_profile FROM jobs WHERE id = ?1",
                        [job_id],
                        |row| {
                            Ok(RejectionSignal {
                                job_id: job_id.to_string(),
                                title: row.get(0)?,
                                company: row.get(1)?,
                                profile: row.get(2)?,
                                reason: reason.to_string(),
                            })
                        },
                    )
                    .optional()
                    .unwrap_or_else(|e| {
                        tracing::warn!(job_id, error = %e, "Could not load job for rejection learning");
                        None
                    }),
                _ => None,
            }
        };

        if let Some(signal) = signal {
            match self.rejection_hook() {
                Some(tx) => {
                    if tx.send(signal).is_err() {
                        tracing::warn!(job_id, "Rejection learner is not running; signal dropped");
                    }
                }
                None => tracing::debug!(job_id, "No rejection learner attached"),
            }
        }
        Ok(true)
    }

    pub fn set_curated(&self, job_id: &str, curated: bool) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE jobs SET curated = ?1 WHERE id = ?2",
            params![curated, job_id],
        )?;
        Ok(changed > 0)
    }

    /// True when a submission already went out for this company and title,
    /// regardless of the posting URL.
    /// Case is folded in Rust: SQLite's `LOWER` only folds ASCII.
    pub fn has_applied_to_company_title(&self, company: &str, title: &str) -> Result<bool> {
        let company = company.trim().to_lowercase();
        let title = title.trim().to_lowercase();
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT company, title FROM jobs WHERE status IN ('applied', 'interview', 'rejected')",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let (c, t): (String, String) = (row.get(0)?, row.get(1)?);
            if c.trim().to_lowercase() == company && t.trim().to_lowercase() == title {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // --- Queries ---

    /// Looks up a job by full id or by an unambiguous id prefix.
    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let id = id.trim();
        if id.is_empty() {
            return Ok(None);
        }
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1 OR id LIKE ?1 || '%' LIMIT 2"
        ))?;
        let mut jobs = stmt
            .query_map([id], Self::row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(pos) = jobs.iter().position(|j| j.id == id) {
            return Ok(Some(jobs.swap_remove(pos)));
        }
        match jobs.len() {
            0 => Ok(None),
            1 => Ok(jobs.pop()),
            _ => Err(anyhow!("Job id prefix '{}' is ambiguous", id)),
        }
    }

    pub fn list_jobs(&self, status: Option<JobStatus>, limit: Option<usize>) -> Result<Vec<Job>> {
        let conn = self.lock()?;
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs");
        if status.is_some() {
            sql.push_str(" WHERE status = ?1");
        }
        sql.push_str(" ORDER BY rank IS NULL, rank DESC, created_at DESC");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = if let Some(s) = status {
            stmt.query_map([s.as_str()], Self::row_to_job)?
        } else {
            stmt.query_map([], Self::row_to_job)?
        };

        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list jobs")
    }

    /// Queued quick-apply jobs, best rank first.
    pub fn queued_for_apply(&self, limit: usize, min_rank: Option<f64>) -> Result<Vec<Job>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status = 'queued' AND quick_apply = 1 AND (?1 IS NULL OR rank >= ?1)
             ORDER BY rank IS NULL, rank DESC, created_at ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![min_rank, limit as i64], Self::row_to_job)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list jobs ready to apply")
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let applied_method: Option<String> = row.get(7)?;
        Ok(Job {
            id: row.get(0)?,
            title: row.get(1)?,
            company: row.get(2)?,
            url: row.get(3)?,
            quick_apply: row.get(4)?,
            rank: row.get(5)?,
            status: parsed_column(row, 6)?,
            applied_method: applied_method.and_then(|m| m.parse().ok()),
            rejection_reason: row.get(8)?,
            fit: FitDetails {
                reasons: json_column(row, 9)?,
                must_haves: json_column(row, 10)?,
                blockers: json_column(row, 11)?,
                category_scores: json_column(row, 12)?,
                missing_keywords: json_column(row, 13)?,
            },
            description: row.get(14)?,
            search_profile: row.get(15)?,
            created_at: row.get(16)?,
            status_updated_at: row.get(17)?,
            curated: row.get(18)?,
        })
    }
}

fn stored_status(conn: &Connection, id: &str) -> Result<Option<JobStatus>> {
    let raw: Option<String> = conn
        .query_row("SELECT status FROM jobs WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    raw.map(|s| s.parse()).transpose()
}

fn insert_job(
    conn: &Connection,
    id: &str,
    url: &str,
    candidate: &Candidate,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    let fit = &candidate.fit;
    conn.execute(
        "INSERT INTO jobs (
            id, title, company, url, quick_apply, rank, status,
            fit_reasons, must_haves, blockers, category_scores, missing_keywords,
            description, search_profile, created_at, status_updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
        params![
            id,
            candidate.title.trim(),
            candidate.company.trim(),
            url,
            candidate.quick_apply,
            candidate.rank,
            to_json(&fit.reasons),
            to_json(&fit.must_haves),
            to_json(&fit.blockers),
            to_json(&fit.category_scores),
            to_json(&fit.missing_keywords),
            candidate.description,
            candidate.search_profile,
            now,
        ],
    )?;
    Ok(())
}

fn requeue_job(conn: &Connection, id: &str, candidate: &Candidate, now: DateTime<Utc>) -> Result<()> {
    let fit = &candidate.fit;
    conn.execute(
        "UPDATE jobs
         SET status = 'queued', rank = ?1, fit_reasons = ?2, must_haves = ?3, blockers = ?4,
             category_scores = ?5, missing_keywords = ?6, description = ?7, search_profile = ?8,
             status_updated_at = ?9
         WHERE id = ?10",
        params![
            candidate.rank,
            to_json(&fit.reasons),
            to_json(&fit.must_haves),
            to_json(&fit.blockers),
            to_json(&fit.category_scores),
            to_json(&fit.missing_keywords),
            candidate.description,
            candidate.search_profile,
            now,
            id,
        ],
    )
    .context("Failed to re-queue job")?;
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    fn candidate(url: &str, description: &str) -> Candidate {
        Candidate {
            title: "Staff Platform Engineer".into(),
            company: "Acme".into(),
            url: url.into(),
            quick_apply: true,
            description: Some(description.into()),
            rank: Some(72.5),
            ..Default::default()
        }
    }

    #[test]
    fn test_canonical_url_strips_tracking() {
        assert_eq!(
            canonical_url("https://www.linkedin.com/jobs/view/123456/?refId=abc&trackingId=xyz"),
            Some("https://www.linkedin.com/jobs/view/123456".to_string())
        );
        assert_eq!(
            canonical_url("https://example.com/job#apply"),
            Some("https://example.com/job".to_string())
        );
        assert_eq!(canonical_url("   "), None);
        assert_eq!(
            job_id_for_url("https://x/jobs/1?a=b"),
            job_id_for_url("https://x/jobs/1/")
        );
    }

    #[test]
    fn test_ingest_same_candidate_twice_is_idempotent() {
        let db = test_db();
        let first = db.ingest(&[candidate("https://x/jobs/1", "v1")]).unwrap();
        assert_eq!(first.inserted, 1);

        let second = db.ingest(&[candidate("https://x/jobs/1", "v1")]).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped_count(), 1);
        assert_eq!(second.skipped[0].reason, SkipReason::AlreadyQueued);
        assert_eq!(db.list_jobs(None, None).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_url_in_same_batch() {
        let db = test_db();
        let report = db
            .ingest(&[
                candidate("https://x/jobs/1", "first"),
                candidate("https://x/jobs/1", "second"),
            ])
            .unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped_count(), 1);
        assert_eq!(report.skipped[0].reason.to_string(), "Duplicate URL");

        let jobs = db.list_jobs(None, None).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].description.as_deref(), Some("first"));
    }

    #[test]
    fn test_applied_job_is_never_mutated_by_ingest() {
        let db = test_db();
        db.ingest(&[candidate("https://x/jobs/1", "original")]).unwrap();
        let id = job_id_for_url("https://x/jobs/1").unwrap();
        db.update_status(&id, JobStatus::Applied, Some(AppliedMethod::Manual), None)
            .unwrap();
        let before = db.get_job(&id).unwrap().unwrap();

        let mut changed = candidate("https://x/jobs/1", "rewritten");
        changed.rank = Some(10.0);
        let report = db.ingest(&[changed]).unwrap();
        assert_eq!(report.skipped[0].reason, SkipReason::AlreadyProcessed);

        let after = db.get_job(&id).unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Applied);
        assert_eq!(after.description.as_deref(), Some("original"));
        assert_eq!(after.rank, Some(72.5));
        assert_eq!(after.status_updated_at, before.status_updated_at);
    }

    #[test]
    fn test_reported_job_is_requeued_with_new_fit() {
        let db = test_db();
        db.ingest(&[candidate("https://x/jobs/1", "original")]).unwrap();
        let id = job_id_for_url("https://x/jobs/1").unwrap();
        db.update_status(&id, JobStatus::Reported, None, None).unwrap();

        let mut rediscovered = candidate("https://x/jobs/1?trk=alert", "refreshed");
        rediscovered.rank = Some(88.25);
        rediscovered.fit = FitDetails {
            reasons: vec!["Strong Rust background".into()],
            blockers: vec!["On-site".into()],
            ..Default::default()
        };
        rediscovered.search_profile = Some("backend".into());
        let report = db.ingest(&[rediscovered]).unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(report.inserted, 0);

        let job = db.get_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.rank, Some(88.25));
        assert_eq!(job.description.as_deref(), Some("refreshed"));
        assert_eq!(job.fit.reasons, vec!["Strong Rust background".to_string()]);
        assert_eq!(job.fit.blockers, vec!["On-site".to_string()]);
        assert_eq!(job.search_profile.as_deref(), Some("backend"));
    }

    #[test]
    fn test_skipped_job_is_not_requeued() {
        let db = test_db();
        db.ingest(&[candidate("https://x/jobs/1", "original")]).unwrap();
        let id = job_id_for_url("https://x/jobs/1").unwrap();
        db.update_status(&id, JobStatus::Skipped, None, None).unwrap();

        let report = db.ingest(&[candidate("https://x/jobs/1", "again")]).unwrap();
        assert_eq!(report.requeued, 0);
        assert_eq!(db.get_job(&id).unwrap().unwrap().status, JobStatus::Skipped);
    }

    #[test]
    fn test_url_collision_under_different_id_becomes_skip() {
        let db = test_db();
        {
            let conn = db.lock().unwrap();
            conn.execute(
                "INSERT INTO jobs (id, title, company, url, status, created_at, status_updated_at)
                 VALUES ('legacy-id', 'Old', 'Acme', 'https://x/jobs/9', 'queued', ?1, ?1)",
                [Utc::now()],
            )
            .unwrap();
        }
        let report = db
            .ingest(&[candidate("https://x/jobs/9", "new"), candidate("https://x/jobs/10", "ok")])
            .unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped[0].reason, SkipReason::DuplicateUrl);
        assert_eq!(db.list_jobs(None, None).unwrap().len(), 2);
    }

    #[test]
    fn test_update_status_stamps_time_and_emits_rejection() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let db = test_db().with_rejection_hook(tx);
        db.ingest(&[candidate("https://x/jobs/1", "d")]).unwrap();
        let id = job_id_for_url("https://x/jobs/1").unwrap();
        let before = db.get_job(&id).unwrap().unwrap().status_updated_at;

        assert!(db
            .update_status(&id, JobStatus::Rejected, None, Some("requires 5+ years AWS"))
            .unwrap());
        let job = db.get_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Rejected);
        assert_eq!(job.rejection_reason.as_deref(), Some("requires 5+ years AWS"));
        assert!(job.status_updated_at >= before);

        let signal = rx.try_recv().unwrap();
        assert_eq!(signal.job_id, id);
        assert_eq!(signal.reason, "requires 5+ years AWS");
        assert_eq!(signal.company, "Acme");
    }

    #[test]
    fn test_rejection_without_reason_emits_nothing() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let db = test_db().with_rejection_hook(tx);
        db.ingest(&[candidate("https://x/jobs/1", "d")]).unwrap();
        let id = job_id_for_url("https://x/jobs/1").unwrap();
        db.update_status(&id, JobStatus::Rejected, None, Some("  ")).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_update_status_survives_closed_learner() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        let db = test_db().with_rejection_hook(tx);
        db.ingest(&[candidate("https://x/jobs/1", "d")]).unwrap();
        let id = job_id_for_url("https://x/jobs/1").unwrap();
        assert!(db.update_status(&id, JobStatus::Rejected, None, Some("too junior")).unwrap());
        assert!(!db.update_status("missing", JobStatus::Skipped, None, None).unwrap());
    }

    #[test]
    fn test_has_applied_to_company_title_is_case_insensitive() {
        let db = test_db();
        db.ingest(&[candidate("https://x/jobs/1", "d")]).unwrap();
        let id = job_id_for_url("https://x/jobs/1").unwrap();
        assert!(!db.has_applied_to_company_title("acme", "staff platform engineer").unwrap());

        db.update_status(&id, JobStatus::Interview, None, None).unwrap();
        assert!(db.has_applied_to_company_title("ACME", "staff platform ENGINEER").unwrap());
        assert!(!db.has_applied_to_company_title("Acme", "Staff Data Engineer").unwrap());
    }

    #[test]
    fn test_has_applied_folds_non_ascii_case() {
        let db = test_db();
        let mut job = candidate("https://x/jobs/7", "d");
        job.company = "Société Générale".into();
        job.title = "Ingénieur Rust".into();
        db.ingest(&[job]).unwrap();
        let id = job_id_for_url("https://x/jobs/7").unwrap();
        db.update_status(&id, JobStatus::Applied, Some(AppliedMethod::Manual), None).unwrap();

        assert!(db.has_applied_to_company_title("SOCIÉTÉ GÉNÉRALE", "INGÉNIEUR RUST").unwrap());
        assert!(db.has_applied_to_company_title(" société générale ", "ingénieur rust").unwrap());
        assert!(!db.has_applied_to_company_title("Société Générale", "Ingénieur Go").unwrap());
    }

    #[test]
    fn test_get_job_by_prefix_and_queued_for_apply() {
        let db = test_db();
        let mut low = candidate("https://x/jobs/2", "low");
        low.rank = Some(40.0);
        let mut manual = candidate("https://x/jobs/3", "manual only");
        manual.quick_apply = false;
        db.ingest(&[candidate("https://x/jobs/1", "high"), low, manual]).unwrap();

        let id = job_id_for_url("https://x/jobs/1").unwrap();
        let job = db.get_job(&id[..8]).unwrap().unwrap();
        assert_eq!(job.id, id);

        let ready = db.queued_for_apply(10, None).unwrap();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].id, id);
        assert_eq!(db.queued_for_apply(10, Some(50.0)).unwrap().len(), 1);
    }

    #[test]
    fn test_job_disposition_matches_ingest_rules() {
        let db = test_db();
        assert_eq!(db.job_disposition("https://x/jobs/1").unwrap(), None);
        db.ingest(&[candidate("https://x/jobs/1", "d")]).unwrap();
        assert_eq!(
            db.job_disposition("https://x/jobs/1?ref=2").unwrap(),
            Some(SkipReason::AlreadyQueued)
        );
        let id = job_id_for_url("https://x/jobs/1").unwrap();
        db.update_status(&id, JobStatus::Reported, None, None).unwrap();
        assert_eq!(db.job_disposition("https://x/jobs/1").unwrap(), None);
    }
}
