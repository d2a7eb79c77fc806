use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use regex::Regex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::db::Database;
use crate::models::{RejectionPattern, WeightAdjustment};

/// A `rejected` transition with a reason, queued for learning.
#[derive(Debug, Clone)]
pub struct RejectionSignal {
    pub job_id: String,
    pub title: String,
    pub company: String,
    pub profile: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    #[serde(rename = "type")]
    pub pattern_type: String,
    pub value: String,
    #[serde(default = "default_match_confidence")]
    pub confidence: f64,
}

fn default_match_confidence() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedAdjustment {
    pub category: String,
    pub adjustment: f64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RejectionAnalysis {
    pub patterns: Vec<PatternMatch>,
    pub suggested_adjustments: Vec<SuggestedAdjustment>,
}

pub trait RejectionAnalyzer: Send + Sync {
    fn analyze(&self, signal: &RejectionSignal) -> Result<RejectionAnalysis>;
    fn name(&self) -> &str;
}

/// Fit-score category a pattern type weighs on.
pub fn category_for(pattern_type: &str) -> &str {
    match pattern_type {
        "technology" => "technical",
        "clearance" => "eligibility",
        other => other,
    }
}

// --- Offline keyword analyzer ---

struct Rule {
    pattern_type: &'static str,
    regex: Regex,
    value: RuleValue,
}

enum RuleValue {
    Fixed(&'static str),
    /// Value built from the first capture group.
    Capture(fn(&str) -> String),
}

fn rule(pattern_type: &'static str, re: &str, value: RuleValue) -> Option<Rule> {
    match Regex::new(re) {
        Ok(regex) => Some(Rule { pattern_type, regex, value }),
        Err(e) => {
            tracing::error!(pattern = re, error = %e, "Invalid rejection rule");
            None
        }
    }
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    use RuleValue::{Capture, Fixed};
    [
        rule("technology", r"(?i)\b(?:aws|amazon web services)\b", Fixed("AWS")),
        rule("technology", r"(?i)\b(?:gcp|google cloud)\b", Fixed("GCP")),
        rule("technology", r"(?i)\bazure\b", Fixed("Azure")),
        rule("technology", r"(?i)\b(?:kubernetes|k8s)\b", Fixed("Kubernetes")),
        rule("technology", r"(?i)\bdocker\b", Fixed("Docker")),
        rule("technology", r"(?i)\bterraform\b", Fixed("Terraform")),
        rule("technology", r"(?i)\bpython\b", Fixed("Python")),
        rule("technology", r"(?i)\bjava\b", Fixed("Java")),
        rule("technology", r"(?i)\b(?:golang|go lang)\b", Fixed("Go")),
        rule("technology", r"(?i)\brust\b", Fixed("Rust")),
        rule("technology", r"(?i)\bc\+\+", Fixed("C++")),
        rule("technology", r"(?i)\b(?:typescript|javascript)\b", Fixed("TypeScript")),
        rule("technology", r"(?i)\breact\b", Fixed("React")),
        rule("technology", r"(?i)\bnode(?:\.js|js)?\b", Fixed("Node.js")),
        rule("technology", r"(?i)\b(?:sql|postgres(?:ql)?|mysql)\b", Fixed("SQL")),
        rule("technology", r"(?i)\b(?:machine learning|ml|pytorch|tensorflow)\b", Fixed("Machine Learning")),
        rule(
            "experience",
            r"(?i)\b(\d{1,2})\s*\+?\s*(?:years|yrs)",
            Capture(|n| format!("{}+ years", n)),
        ),
        rule("seniority", r"(?i)\b(?:too junior|not senior enough|more senior|lack(?:s|ing)? seniority)\b", Fixed("senior")),
        rule("seniority", r"(?i)\b(?:overqualified|too senior)\b", Fixed("overqualified")),
        rule("seniority", r"(?i)\b(?:staff|principal)[- ]level\b", Fixed("staff")),
        rule("location", r"(?i)\b(?:on-?site|in[- ]office|not remote|relocat\w*)\b", Fixed("on-site")),
        rule("location", r"(?i)\bhybrid\b", Fixed("hybrid")),
        rule("location", r"(?i)\btime ?zone\b", Fixed("timezone")),
        rule("clearance", r"(?i)\b(?:security clearance|clearance)\b", Fixed("security clearance")),
        rule("clearance", r"(?i)\b(?:visa|sponsorship|work authori[sz]ation|citizenship)\b", Fixed("work authorization")),
        rule(
            "language",
            r"(?i)\b(?:fluent|native|business[- ]level)\s+(german|french|spanish|dutch|japanese|mandarin|portuguese|italian)\b",
            Capture(capitalize),
        ),
    ]
    .into_iter()
    .flatten()
    .collect()
});

fn capitalize(word: &str) -> String {
    let lower = word.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Fixed score adjustment per fit category for one observed rejection.
fn category_penalty(category: &str) -> f64 {
    match category {
        "technical" => -5.0,
        "experience" => -5.0,
        "seniority" => -8.0,
        "location" => -10.0,
        "eligibility" => -15.0,
        "language" => -8.0,
        _ => -3.0,
    }
}

/// Dictionary and regex extraction, no network.
#[derive(Debug, Default, Clone)]
pub struct KeywordAnalyzer;

impl RejectionAnalyzer for KeywordAnalyzer {
    fn analyze(&self, signal: &RejectionSignal) -> Result<RejectionAnalysis> {
        let mut analysis = RejectionAnalysis::default();
        let mut seen = HashSet::new();

        for rule in RULES.iter() {
            for caps in rule.regex.captures_iter(&signal.reason) {
                let value = match &rule.value {
                    RuleValue::Fixed(v) => v.to_string(),
                    RuleValue::Capture(build) => match caps.get(1) {
                        Some(m) => build(m.as_str()),
                        None => continue,
                    },
                };
                if seen.insert((rule.pattern_type, value.to_lowercase())) {
                    analysis.patterns.push(PatternMatch {
                        pattern_type: rule.pattern_type.to_string(),
                        value,
                        confidence: 0.7,
                    });
                }
            }
        }

        let mut by_category: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for p in &analysis.patterns {
            by_category
                .entry(category_for(&p.pattern_type))
                .or_default()
                .push(&p.value);
        }
        analysis.suggested_adjustments = by_category
            .into_iter()
            .map(|(category, values)| SuggestedAdjustment {
                category: category.to_string(),
                adjustment: category_penalty(category),
                reason: format!("Rejected at {}: {}", signal.company, values.join(", ")),
            })
            .collect();

        Ok(analysis)
    }

    fn name(&self) -> &str {
        "keyword"
    }
}

// --- Persistence ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LearnOutcome {
    pub patterns: usize,
    pub adjustments: usize,
}

impl Database {
    /// Records one observation of (type, value). Returns the occurrence count
    /// after the write.
    pub fn upsert_pattern(
        &self,
        pattern_type: &str,
        pattern_value: &str,
        weight_adjustment: f64,
        profile_category: Option<&str>,
    ) -> Result<i64> {
        let conn = self.lock()?;
        upsert_pattern(&conn, pattern_type, pattern_value, weight_adjustment, profile_category)
    }

    /// Appends a ledger entry moving `category` by `delta` from its current
    /// aggregate. The only write path for adjustments.
    pub fn save_weight_adjustment(
        &self,
        category: &str,
        delta: f64,
        reason: Option<&str>,
        job_id: Option<&str>,
    ) -> Result<WeightAdjustment> {
        let conn = self.lock()?;
        append_adjustment(&conn, category, delta, reason, job_id)
    }

    /// Sum of ledger deltas per category.
    pub fn current_adjustments(&self) -> Result<BTreeMap<String, f64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT category, SUM(new_weight - old_weight) FROM weight_adjustments GROUP BY category",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?;
        rows.collect::<Result<BTreeMap<_, _>, _>>()
            .context("Failed to aggregate weight adjustments")
    }

    pub fn list_weight_adjustments(&self, category: Option<&str>) -> Result<Vec<WeightAdjustment>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, category, old_weight, new_weight, reason, job_id, created_at
             FROM weight_adjustments
             WHERE ?1 IS NULL OR category = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map([category], row_to_adjustment)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list weight adjustments")
    }

    /// Truncates the ledger, zeroing every aggregate. Jobs and patterns are kept.
    pub fn reset_weight_adjustments(&self) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM weight_adjustments", [])?;
        tracing::info!(removed, "Weight adjustment ledger reset");
        Ok(removed)
    }

    pub fn list_patterns(&self) -> Result<Vec<RejectionPattern>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT pattern_type, pattern_value, occurrence_count, weight_adjustment,
                    profile_category, last_seen
             FROM rejection_patterns
             ORDER BY occurrence_count DESC, last_seen DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RejectionPattern {
                pattern_type: row.get(0)?,
                pattern_value: row.get(1)?,
                occurrence_count: row.get(2)?,
                weight_adjustment: row.get(3)?,
                profile_category: row.get(4)?,
                last_seen: row.get(5)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list rejection patterns")
    }

    /// Persists an analysis in one transaction so a failure leaves the
    /// learning stores at their prior values.
    pub fn record_rejection_analysis(
        &self,
        signal: &RejectionSignal,
        analysis: &RejectionAnalysis,
    ) -> Result<LearnOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut outcome = LearnOutcome::default();

        for p in &analysis.patterns {
            if p.value.trim().is_empty() {
                continue;
            }
            let weight = analysis
                .suggested_adjustments
                .iter()
                .find(|a| a.category == category_for(&p.pattern_type))
                .map(|a| a.adjustment)
                .unwrap_or(0.0);
            upsert_pattern(&tx, &p.pattern_type, &p.value, weight, signal.profile.as_deref())?;
            outcome.patterns += 1;
        }

        for adj in &analysis.suggested_adjustments {
            if !adj.adjustment.is_finite() || adj.adjustment == 0.0 {
                continue;
            }
            let reason = Some(adj.reason.as_str()).filter(|r| !r.is_empty());
            append_adjustment(&tx, &adj.category, adj.adjustment, reason, Some(&signal.job_id))?;
            outcome.adjustments += 1;
        }

        tx.commit().context("Failed to commit rejection learning")?;
        Ok(outcome)
    }
}

fn upsert_pattern(
    conn: &Connection,
    pattern_type: &str,
    pattern_value: &str,
    weight_adjustment: f64,
    profile_category: Option<&str>,
) -> Result<i64> {
    conn.query_row(
        "INSERT INTO rejection_patterns
            (pattern_type, pattern_value, occurrence_count, weight_adjustment, profile_category, last_seen)
         VALUES (?1, ?2, 1, ?3, ?4, ?5)
         ON CONFLICT(pattern_type, pattern_value) DO UPDATE SET
            occurrence_count = occurrence_count + 1,
            weight_adjustment = excluded.weight_adjustment,
            profile_category = COALESCE(excluded.profile_category, profile_category),
            last_seen = excluded.last_seen
         RETURNING occurrence_count",
        params![
            pattern_type.trim().to_lowercase(),
            pattern_value.trim(),
            weight_adjustment,
            profile_category,
            Utc::now()
        ],
        |row| row.get(0),
    )
    .context("Failed to upsert rejection pattern")
}

fn append_adjustment(
    conn: &Connection,
    category: &str,
    delta: f64,
    reason: Option<&str>,
    job_id: Option<&str>,
) -> Result<WeightAdjustment> {
    let category = category.trim().to_lowercase();
    if category.is_empty() {
        return Err(anyhow!("Weight adjustment category must not be empty"));
    }
    conn.execute(
        "INSERT INTO weight_adjustments (category, old_weight, new_weight, reason, job_id, created_at)
         SELECT ?1, COALESCE(SUM(new_weight - old_weight), 0),
                COALESCE(SUM(new_weight - old_weight), 0) + ?2, ?3, ?4, ?5
         FROM weight_adjustments WHERE category = ?1",
        params![category, delta, reason, job_id, Utc::now()],
    )
    .context("Failed to append weight adjustment")?;
    conn.query_row(
        "SELECT id, category, old_weight, new_weight, reason, job_id, created_at
         FROM weight_adjustments WHERE id = ?1",
        [conn.last_insert_rowid()],
        row_to_adjustment,
    )
    .context("Failed to read back weight adjustment")
}

fn row_to_adjustment(row: &rusqlite::Row) -> rusqlite::Result<WeightAdjustment> {
    Ok(WeightAdjustment {
        id: row.get(0)?,
        category: row.get(1)?,
        old_weight: row.get(2)?,
        new_weight: row.get(3)?,
        reason: row.get(4)?,
        job_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Analysis plus persistence for one signal.
pub fn learn_from_rejection(
    db: &Database,
    analyzer: &dyn RejectionAnalyzer,
    signal: &RejectionSignal,
) -> Result<LearnOutcome> {
    let analysis = analyzer
        .analyze(signal)
        .with_context(|| format!("{} analyzer failed", analyzer.name()))?;
    db.record_rejection_analysis(signal, &analysis)
}

// --- Background learner ---

#[derive(Debug, Default)]
struct LearnerCounters {
    processed: AtomicU64,
    failed: AtomicU64,
}

impl LearnerCounters {
    fn snapshot(&self) -> LearnerStats {
        LearnerStats {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LearnerStats {
    pub processed: u64,
    pub failed: u64,
}

/// Consumes rejection signals off the status-update path. Every failure is
/// logged and counted here and never reaches the sender.
pub struct RejectionLearner {
    tx: mpsc::UnboundedSender<RejectionSignal>,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    counters: Arc<LearnerCounters>,
}

impl RejectionLearner {
    /// Spawns the learner on the current runtime. `db` should be a handle
    /// without a rejection hook.
    pub fn spawn(db: Database, analyzer: Arc<dyn RejectionAnalyzer>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RejectionSignal>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let counters = Arc::new(LearnerCounters::default());

        let task_counters = counters.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    msg = rx.recv() => match msg {
                        Some(signal) => {
                            process(&db, &analyzer, &task_counters, signal).await;
                        }
                        None => break,
                    },
                    _ = &mut shutdown_rx => {
                        while let Ok(signal) = rx.try_recv() {
                            process(&db, &analyzer, &task_counters, signal).await;
                        }
                        break;
                    }
                }
            }
            tracing::debug!("Rejection learner stopped");
        });

        Self { tx, shutdown_tx, handle, counters }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<RejectionSignal> {
        self.tx.clone()
    }

    /// Processes whatever is already queued, then stops the task.
    pub async fn shutdown(self) -> LearnerStats {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Rejection learner task ended abnormally");
        }
        self.counters.snapshot()
    }
}

async fn process(
    db: &Database,
    analyzer: &Arc<dyn RejectionAnalyzer>,
    counters: &LearnerCounters,
    signal: RejectionSignal,
) {
    let job_id = signal.job_id.clone();
    let db = db.clone();
    let analyzer = analyzer.clone();
    let result =
        tokio::task::spawn_blocking(move || learn_from_rejection(&db, analyzer.as_ref(), &signal)).await;

    match result {
        Ok(Ok(outcome)) => {
            counters.processed.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                job_id = %job_id,
                patterns = outcome.patterns,
                adjustments = outcome.adjustments,
                "Learned from rejection"
            );
        }
        Ok(Err(e)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(job_id = %job_id, error = %format!("{:#}", e), "Rejection learning failed");
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(job_id = %job_id, error = %e, "Rejection learning task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::jobs::job_id_for_url;
    use crate::models::{Candidate, JobStatus};

    fn signal(job_id: &str, reason: &str) -> RejectionSignal {
        RejectionSignal {
            job_id: job_id.into(),
            title: "Backend Engineer".into(),
            company: "Acme".into(),
            profile: Some("backend".into()),
            reason: reason.into(),
        }
    }

    struct FailingAnalyzer;

    impl RejectionAnalyzer for FailingAnalyzer {
        fn analyze(&self, _signal: &RejectionSignal) -> Result<RejectionAnalysis> {
            Err(anyhow!("analysis service unavailable"))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[test]
    fn test_keyword_analyzer_extracts_aws_and_experience() {
        let analysis = KeywordAnalyzer.analyze(&signal("j1", "requires 5+ years AWS")).unwrap();
        let found: Vec<(&str, &str)> = analysis
            .patterns
            .iter()
            .map(|p| (p.pattern_type.as_str(), p.value.as_str()))
            .collect();
        assert!(found.contains(&("technology", "AWS")));
        assert!(found.contains(&("experience", "5+ years")));

        let categories: Vec<&str> = analysis
            .suggested_adjustments
            .iter()
            .map(|a| a.category.as_str())
            .collect();
        assert_eq!(categories, vec!["experience", "technical"]);
        assert!(analysis.suggested_adjustments.iter().all(|a| a.adjustment < 0.0));
    }

    #[test]
    fn test_keyword_analyzer_language_and_location() {
        let analysis = KeywordAnalyzer
            .analyze(&signal("j1", "Role is on-site in Berlin and needs fluent German"))
            .unwrap();
        let values: Vec<&str> = analysis.patterns.iter().map(|p| p.value.as_str()).collect();
        assert!(values.contains(&"German"));
        assert!(values.contains(&"on-site"));
    }

    #[test]
    fn test_repeated_pattern_increments_count() {
        let db = test_db();
        learn_from_rejection(&db, &KeywordAnalyzer, &signal("job-a", "requires 5+ years AWS")).unwrap();
        let aws = |db: &Database| {
            db.list_patterns()
                .unwrap()
                .into_iter()
                .find(|p| p.pattern_type == "technology" && p.pattern_value == "AWS")
                .unwrap()
        };
        assert_eq!(aws(&db).occurrence_count, 1);

        learn_from_rejection(&db, &KeywordAnalyzer, &signal("job-b", "no aws experience")).unwrap();
        let pattern = aws(&db);
        assert_eq!(pattern.occurrence_count, 2);
        assert_eq!(pattern.profile_category.as_deref(), Some("backend"));
        assert_eq!(
            db.list_patterns().unwrap().iter().filter(|p| p.pattern_value.eq_ignore_ascii_case("aws")).count(),
            1
        );
    }

    #[test]
    fn test_ledger_aggregate_is_order_independent() {
        let forward = test_db();
        forward.save_weight_adjustment("technical", -5.0, Some("A"), None).unwrap();
        forward.save_weight_adjustment("technical", 2.5, Some("B"), None).unwrap();

        let reverse = test_db();
        reverse.save_weight_adjustment("technical", 2.5, Some("B"), None).unwrap();
        reverse.save_weight_adjustment("technical", -5.0, Some("A"), None).unwrap();

        assert_eq!(
            forward.current_adjustments().unwrap(),
            reverse.current_adjustments().unwrap()
        );
        assert_eq!(forward.current_adjustments().unwrap()["technical"], -2.5);
    }

    #[test]
    fn test_ledger_entries_chain_old_and_new_weight() {
        let db = test_db();
        let first = db.save_weight_adjustment("location", -10.0, None, Some("j1")).unwrap();
        let second = db.save_weight_adjustment("location", -10.0, None, Some("j2")).unwrap();
        assert_eq!(first.old_weight, 0.0);
        assert_eq!(second.old_weight, first.new_weight);
        assert_eq!(second.new_weight, -20.0);
        assert_eq!(second.delta(), -10.0);
        assert_eq!(db.list_weight_adjustments(Some("location")).unwrap().len(), 2);
        assert!(db.list_weight_adjustments(Some("technical")).unwrap().is_empty());
    }

    #[test]
    fn test_reset_zeroes_aggregates_and_keeps_jobs() {
        let db = test_db();
        db.ingest(&[Candidate {
            title: "SRE".into(),
            company: "Acme".into(),
            url: "https://x/jobs/1".into(),
            ..Default::default()
        }])
        .unwrap();
        db.save_weight_adjustment("technical", -5.0, None, None).unwrap();
        db.save_weight_adjustment("seniority", -8.0, None, None).unwrap();

        assert_eq!(db.reset_weight_adjustments().unwrap(), 2);
        assert!(db.current_adjustments().unwrap().is_empty());
        assert_eq!(db.list_jobs(None, None).unwrap().len(), 1);

        let fresh = db.save_weight_adjustment("technical", -5.0, None, None).unwrap();
        assert_eq!(fresh.old_weight, 0.0);
    }

    #[tokio::test]
    async fn test_learner_processes_rejections_from_status_updates() {
        let db = test_db();
        let learner = RejectionLearner::spawn(db.clone(), Arc::new(KeywordAnalyzer));
        let hooked = db.clone().with_rejection_hook(learner.sender());
        hooked
            .ingest(&[Candidate {
                title: "Cloud Engineer".into(),
                company: "Acme".into(),
                url: "https://x/jobs/1".into(),
                ..Default::default()
            }])
            .unwrap();
        let id = job_id_for_url("https://x/jobs/1").unwrap();
        hooked
            .update_status(&id, JobStatus::Rejected, None, Some("requires 5+ years AWS"))
            .unwrap();

        let stats = learner.shutdown().await;
        assert_eq!(stats, LearnerStats { processed: 1, failed: 0 });
        assert!(db.current_adjustments().unwrap()["technical"] < 0.0);
        let ledger = db.list_weight_adjustments(None).unwrap();
        assert!(ledger.iter().all(|a| a.job_id.as_deref() == Some(id.as_str())));
    }

    #[tokio::test]
    async fn test_learner_failure_never_fails_status_update() {
        let db = test_db();
        let learner = RejectionLearner::spawn(db.clone(), Arc::new(FailingAnalyzer));
        let hooked = db.clone().with_rejection_hook(learner.sender());
        hooked
            .ingest(&[Candidate {
                title: "Cloud Engineer".into(),
                company: "Acme".into(),
                url: "https://x/jobs/1".into(),
                ..Default::default()
            }])
            .unwrap();
        let id = job_id_for_url("https://x/jobs/1").unwrap();

        assert!(hooked
            .update_status(&id, JobStatus::Rejected, None, Some("requires 5+ years AWS"))
            .unwrap());
        let stats = learner.shutdown().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.processed, 0);
        assert_eq!(db.get_job(&id).unwrap().unwrap().status, JobStatus::Rejected);
        assert!(db.list_patterns().unwrap().is_empty());
    }
}
