use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::config::RunConfig;
use crate::mappings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Applied,
    Interview,
    Rejected,
    Skipped,
    Reported,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Applied,
        JobStatus::Interview,
        JobStatus::Rejected,
        JobStatus::Skipped,
        JobStatus::Reported,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Applied => "applied",
            JobStatus::Interview => "interview",
            JobStatus::Rejected => "rejected",
            JobStatus::Skipped => "skipped",
            JobStatus::Reported => "reported",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| {
                anyhow!(
                    "Unknown status '{}'. Expected one of: queued, applied, interview, rejected, skipped, reported",
                    s
                )
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppliedMethod {
    Manual,
    Automatic,
}

impl AppliedMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppliedMethod::Manual => "manual",
            AppliedMethod::Automatic => "automatic",
        }
    }
}

impl FromStr for AppliedMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "manual" => Ok(AppliedMethod::Manual),
            "automatic" | "auto" => Ok(AppliedMethod::Automatic),
            _ => Err(anyhow!("Unknown applied method '{}'. Expected manual or automatic", s)),
        }
    }
}

/// Ranker output attached to a job. Each field is persisted as its own JSON
/// column and decoded once when the row is read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FitDetails {
    pub reasons: Vec<String>,
    pub must_haves: Vec<String>,
    pub blockers: Vec<String>,
    pub category_scores: BTreeMap<String, f64>,
    pub missing_keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub title: String,
    pub company: String,
    pub url: String,
    pub quick_apply: bool,
    pub rank: Option<f64>,
    pub status: JobStatus,
    pub applied_method: Option<AppliedMethod>,
    pub rejection_reason: Option<String>,
    pub fit: FitDetails,
    pub description: Option<String>,
    pub search_profile: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status_updated_at: DateTime<Utc>,
    pub curated: bool,
}

/// A posting as handed over by a scraper, optionally already ranked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub title: String,
    pub company: String,
    pub url: String,
    #[serde(default)]
    pub quick_apply: bool,
    #[serde(default)]
    pub posted_date: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub rank: Option<f64>,
    #[serde(default)]
    pub fit: FitDetails,
    #[serde(default)]
    pub search_profile: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    AlreadyQueued,
    AlreadyProcessed,
    DuplicateUrl,
    MissingUrl,
    AlreadyApplied,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::AlreadyQueued => "already queued",
            SkipReason::AlreadyProcessed => "already processed",
            SkipReason::DuplicateUrl => "Duplicate URL",
            SkipReason::MissingUrl => "missing URL",
            SkipReason::AlreadyApplied => "already applied to this company and title",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedCandidate {
    pub url: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub inserted: usize,
    pub requeued: usize,
    pub skipped: Vec<SkippedCandidate>,
}

impl IngestReport {
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    /// Inserted plus requeued: rows that ended up `queued` because of this batch.
    pub fn added(&self) -> usize {
        self.inserted + self.requeued
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub name: String,
    pub title: Option<String>,
    pub company: Option<String>,
    pub profile_url: String,
    pub email: Option<String>,
    pub location: Option<String>,
    pub scraped_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadCandidate {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    pub profile_url: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LeadImport {
    pub inserted: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
        }
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(RunStatus::InProgress),
            "completed" => Ok(RunStatus::Completed),
            "stopped" => Ok(RunStatus::Stopped),
            _ => Err(anyhow!("Unknown run status '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Search,
    Leads,
    Apply,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Search => "search",
            OperationKind::Leads => "leads",
            OperationKind::Apply => "apply",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "search" => Ok(OperationKind::Search),
            "leads" | "lead-scrape" => Ok(OperationKind::Leads),
            "apply" => Ok(OperationKind::Apply),
            _ => Err(anyhow!("Unknown operation '{}'. Expected search, leads or apply", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub operation: OperationKind,
    pub status: RunStatus,
    pub items_processed: i64,
    pub items_added: i64,
    pub items_failed: i64,
    pub last_cursor: Option<String>,
    pub filters: Option<RunConfig>,
    /// Process that opened or last resumed the record.
    pub owner_pid: Option<u32>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub stop_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LabelMapping {
    pub label: String,
    pub answer_key: String,
    pub locator: String,
    pub base_confidence: f64,
    pub success_count: u32,
    pub failure_count: u32,
    pub field_type: Option<String>,
    pub input_strategy: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl LabelMapping {
    pub fn confidence(&self) -> f64 {
        mappings::confidence(self.base_confidence, self.success_count, self.failure_count)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectionPattern {
    pub pattern_type: String,
    pub pattern_value: String,
    pub occurrence_count: i64,
    pub weight_adjustment: f64,
    pub profile_category: Option<String>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeightAdjustment {
    pub id: i64,
    pub category: String,
    pub old_weight: f64,
    pub new_weight: f64,
    pub reason: Option<String>,
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WeightAdjustment {
    pub fn delta(&self) -> f64 {
        self.new_weight - self.old_weight
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStats {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub applied_manual: i64,
    pub applied_automatic: i64,
    pub active_leads: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_parse_is_case_insensitive() {
        assert_eq!("Rejected".parse::<JobStatus>().unwrap(), JobStatus::Rejected);
        assert_eq!(" queued ".parse::<JobStatus>().unwrap(), JobStatus::Queued);
        assert!("closed".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_candidate_accepts_scraper_field_names() {
        let json = r#"{
            "title": "Platform Engineer",
            "company": "Acme",
            "url": "https://x/jobs/1",
            "quickApply": true,
            "postedDate": "2 days ago",
            "fit": {"categoryScores": {"technical": 80.0}, "mustHaves": ["Rust"]}
        }"#;
        let candidate: Candidate = serde_json::from_str(json).unwrap();
        assert!(candidate.quick_apply);
        assert_eq!(candidate.posted_date.as_deref(), Some("2 days ago"));
        assert_eq!(candidate.fit.category_scores.get("technical"), Some(&80.0));
        assert_eq!(candidate.fit.must_haves, vec!["Rust".to_string()]);
        assert!(candidate.fit.blockers.is_empty());
    }

    #[test]
    fn test_skip_reason_display() {
        assert_eq!(SkipReason::DuplicateUrl.to_string(), "Duplicate URL");
        assert_eq!(SkipReason::AlreadyQueued.to_string(), "already queued");
        assert_eq!(SkipReason::AlreadyProcessed.to_string(), "already processed");
    }
}
