use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::RunError;
use crate::models::OperationKind;

/// Process-wide settings read from the environment.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub db_path: Option<PathBuf>,
    pub model: Option<String>,
    pub pace: Duration,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let db_path = env::var("JOBPILOT_DB").ok().filter(|s| !s.trim().is_empty()).map(PathBuf::from);
        let model = env::var("JOBPILOT_MODEL").ok().filter(|s| !s.trim().is_empty());
        let pace = match env::var("JOBPILOT_PACE_MS") {
            Ok(v) => Duration::from_millis(v.trim().parse::<u64>().map_err(|e| {
                anyhow::anyhow!("JOBPILOT_PACE_MS must be a number of milliseconds: {}", e)
            })?),
            Err(_) => Duration::ZERO,
        };
        Ok(Self { db_path, model, pace })
    }
}

/// Batch configuration payload. Stored verbatim on the run record as its
/// filter criteria.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub search: Option<SearchConfig>,
    pub leads: Option<LeadsConfig>,
    pub apply: Option<ApplyConfig>,
    /// Base delay between candidates; overrides JOBPILOT_PACE_MS.
    pub pace_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    pub feed: Option<PathBuf>,
    pub profile: Option<String>,
    pub keywords: Vec<String>,
    pub location: Option<String>,
    pub max_pages: u32,
    pub min_score: f64,
    pub model: Option<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            feed: None,
            profile: None,
            keywords: Vec::new(),
            location: None,
            max_pages: 10,
            min_score: 0.0,
            model: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeadsConfig {
    pub feed: Option<PathBuf>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApplyConfig {
    pub replay: Option<PathBuf>,
    pub limit: usize,
    pub min_rank: Option<f64>,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            replay: None,
            limit: 25,
            min_rank: None,
        }
    }
}

impl RunConfig {
    /// Parses an inline JSON payload, or reads it from a file when prefixed with `@`.
    pub fn parse(payload: &str) -> Result<Self, RunError> {
        let payload = payload.trim();
        let text = if let Some(path) = payload.strip_prefix('@') {
            std::fs::read_to_string(path)
                .map_err(|e| RunError::InvalidConfig(format!("cannot read {}: {}", path, e)))?
        } else {
            payload.to_string()
        };
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&text).map_err(|e| RunError::InvalidConfig(e.to_string()))
    }

    pub fn pace(&self, fallback: Duration) -> Duration {
        self.pace_ms.map(Duration::from_millis).unwrap_or(fallback)
    }

    pub fn search(&self) -> SearchConfig {
        self.search.clone().unwrap_or_default()
    }

    pub fn leads(&self) -> LeadsConfig {
        self.leads.clone().unwrap_or_default()
    }

    pub fn apply(&self) -> ApplyConfig {
        self.apply.clone().unwrap_or_default()
    }

    /// Checks the section for `operation`. Feed paths are only required by the
    /// file-backed collaborators, so they are checked by the CLI, not here.
    pub fn validate(&self, operation: OperationKind) -> Result<(), RunError> {
        match operation {
            OperationKind::Search => {
                let search = self.search();
                if search.max_pages == 0 {
                    return Err(RunError::InvalidConfig("search.max_pages must be at least 1".into()));
                }
                if !(0.0..=100.0).contains(&search.min_score) {
                    return Err(RunError::InvalidConfig(format!(
                        "search.min_score must be between 0 and 100, got {}",
                        search.min_score
                    )));
                }
                if search.keywords.iter().any(|k| k.trim().is_empty()) {
                    return Err(RunError::InvalidConfig("search.keywords must not contain blanks".into()));
                }
            }
            OperationKind::Leads => {
                if self.leads().limit == Some(0) {
                    return Err(RunError::InvalidConfig("leads.limit must be at least 1".into()));
                }
            }
            OperationKind::Apply => {
                let apply = self.apply();
                if apply.limit == 0 {
                    return Err(RunError::InvalidConfig("apply.limit must be at least 1".into()));
                }
                if let Some(min_rank) = apply.min_rank {
                    if !(0.0..=100.0).contains(&min_rank) {
                        return Err(RunError::InvalidConfig(format!(
                            "apply.min_rank must be between 0 and 100, got {}",
                            min_rank
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inline_config_with_defaults() {
        let config = RunConfig::parse(r#"{"search": {"keywords": ["rust"], "min_score": 60}}"#).unwrap();
        let search = config.search();
        assert_eq!(search.keywords, vec!["rust".to_string()]);
        assert_eq!(search.max_pages, 10);
        assert_eq!(search.min_score, 60.0);
        assert_eq!(config.apply().limit, 25);
    }

    #[test]
    fn test_parse_empty_payload_is_default() {
        assert_eq!(RunConfig::parse("  ").unwrap(), RunConfig::default());
    }

    #[test]
    fn test_parse_rejects_unknown_fields() {
        let err = RunConfig::parse(r#"{"serach": {}}"#).unwrap_err();
        assert!(matches!(err, RunError::InvalidConfig(_)));
    }

    #[test]
    fn test_validate_checks_ranges() {
        let config = RunConfig::parse(r#"{"search": {"min_score": 140}}"#).unwrap();
        assert!(config.validate(OperationKind::Search).is_err());
        assert!(config.validate(OperationKind::Leads).is_ok());

        let config = RunConfig::parse(r#"{"apply": {"limit": 0}}"#).unwrap();
        let err = config.validate(OperationKind::Apply).unwrap_err();
        assert!(err.to_string().contains("apply.limit"));
    }

    #[test]
    fn test_pace_override() {
        let config = RunConfig { pace_ms: Some(250), ..Default::default() };
        assert_eq!(config.pace(Duration::ZERO), Duration::from_millis(250));
        assert_eq!(RunConfig::default().pace(Duration::from_secs(1)), Duration::from_secs(1));
    }
}
