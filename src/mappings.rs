use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::db::Database;
use crate::models::LabelMapping;

const SUCCESS_REWARD: f64 = 0.05;
const FAILURE_PENALTY: f64 = 0.10;
const MIN_CONFIDENCE: f64 = 0.5;
const MAX_CONFIDENCE: f64 = 1.0;

/// Minimum Jaro-Winkler similarity for a near-miss label to reuse a mapping.
const FUZZY_MATCH_THRESHOLD: f64 = 0.92;

pub const DEFAULT_BASE_CONFIDENCE: f64 = 0.8;

const MAPPING_COLUMNS: &str = "label, answer_key, locator, base_confidence, success_count,
    failure_count, field_type, input_strategy, last_seen";

/// Effective confidence of a mapping, always derived from its counters.
pub fn confidence(base: f64, success_count: u32, failure_count: u32) -> f64 {
    let reward = 1.0 + f64::from(success_count) * SUCCESS_REWARD;
    let penalty = 1.0 - f64::from(failure_count) * FAILURE_PENALTY;
    (base * reward * penalty).clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
}

/// Canonical form of a visible field label: lowercase, single spaces, no
/// required-field markers.
pub fn normalize_label(label: &str) -> String {
    let collapsed = label.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    collapsed
        .trim_end_matches(|c: char| c == '*' || c == ':' || c == '?' || c.is_whitespace())
        .to_string()
}

#[derive(Debug, Clone)]
pub struct MappingDefinition<'a> {
    pub label: &'a str,
    pub answer_key: &'a str,
    pub locator: &'a str,
    pub field_type: Option<&'a str>,
    pub input_strategy: Option<&'a str>,
    pub base_confidence: f64,
}

impl Database {
    /// Creates or redefines the mapping for a label. Counters survive a
    /// redefinition that keeps the same answer key and restart otherwise.
    pub fn learn_mapping(&self, def: &MappingDefinition) -> Result<()> {
        let label = normalize_label(def.label);
        if label.is_empty() {
            return Err(anyhow!("Field label must not be empty"));
        }
        if !(def.base_confidence > 0.0 && def.base_confidence <= 1.0) {
            return Err(anyhow!(
                "Base confidence must be in (0, 1], got {}",
                def.base_confidence
            ));
        }

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO label_mappings
                (label, answer_key, locator, base_confidence, field_type, input_strategy, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(label) DO UPDATE SET
                success_count = CASE WHEN answer_key = excluded.answer_key THEN success_count ELSE 0 END,
                failure_count = CASE WHEN answer_key = excluded.answer_key THEN failure_count ELSE 0 END,
                answer_key = excluded.answer_key,
                locator = excluded.locator,
                base_confidence = excluded.base_confidence,
                field_type = COALESCE(excluded.field_type, field_type),
                input_strategy = COALESCE(excluded.input_strategy, input_strategy),
                last_seen = excluded.last_seen",
            params![
                label,
                def.answer_key.trim(),
                def.locator.trim(),
                def.base_confidence,
                def.field_type,
                def.input_strategy,
                Utc::now(),
            ],
        )
        .context("Failed to save label mapping")?;
        tracing::debug!(label = %label, answer_key = def.answer_key, "Learned label mapping");
        Ok(())
    }

    /// Best-known mapping for a label: exact match on the normalized label,
    /// else the most similar known label above the fuzzy threshold.
    pub fn lookup_mapping(&self, label: &str) -> Result<Option<LabelMapping>> {
        let label = normalize_label(label);
        if label.is_empty() {
            return Ok(None);
        }
        let conn = self.lock()?;

        let exact = conn
            .query_row(
                &format!("SELECT {MAPPING_COLUMNS} FROM label_mappings WHERE label = ?1"),
                [&label],
                Self::row_to_mapping,
            )
            .optional()?;
        if exact.is_some() {
            return Ok(exact);
        }

        let mut stmt = conn.prepare(&format!("SELECT {MAPPING_COLUMNS} FROM label_mappings"))?;
        let known = stmt
            .query_map([], Self::row_to_mapping)?
            .collect::<Result<Vec<_>, _>>()?;

        let best = known
            .into_iter()
            .map(|m| (strsim::jaro_winkler(&label, &m.label), m))
            .filter(|(score, _)| *score >= FUZZY_MATCH_THRESHOLD)
            .max_by(|a, b| {
                a.0.partial_cmp(&b.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.1.confidence().total_cmp(&b.1.confidence()))
            });
        if let Some((score, mapping)) = &best {
            tracing::debug!(label = %label, matched = %mapping.label, score, "Fuzzy label match");
        }
        Ok(best.map(|(_, m)| m))
    }

    /// All labels that resolve to `answer_key`, most trustworthy first.
    pub fn candidates_for_key(&self, answer_key: &str) -> Result<Vec<LabelMapping>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MAPPING_COLUMNS} FROM label_mappings WHERE answer_key = ?1"
        ))?;
        let mut mappings = stmt
            .query_map([answer_key.trim()], Self::row_to_mapping)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list mapping candidates")?;
        mappings.sort_by(|a, b| b.confidence().total_cmp(&a.confidence()));
        Ok(mappings)
    }

    pub fn list_mappings(&self) -> Result<Vec<LabelMapping>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MAPPING_COLUMNS} FROM label_mappings ORDER BY label"
        ))?;
        let rows = stmt.query_map([], Self::row_to_mapping)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list label mappings")
    }

    /// Counts a successful fill and keeps the locator that worked.
    pub fn record_success(&self, label: &str, locator_used: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE label_mappings
             SET success_count = success_count + 1, locator = ?2, last_seen = ?3
             WHERE label = ?1",
            params![normalize_label(label), locator_used.trim(), Utc::now()],
        )?;
        Ok(changed > 0)
    }

    /// Counts a failed fill. The stored locator is left as is.
    pub fn record_failure(&self, label: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE label_mappings
             SET failure_count = failure_count + 1, last_seen = ?2
             WHERE label = ?1",
            params![normalize_label(label), Utc::now()],
        )?;
        Ok(changed > 0)
    }

    fn row_to_mapping(row: &rusqlite::Row) -> rusqlite::Result<LabelMapping> {
        Ok(LabelMapping {
            label: row.get(0)?,
            answer_key: row.get(1)?,
            locator: row.get(2)?,
            base_confidence: row.get(3)?,
            success_count: row.get(4)?,
            failure_count: row.get(5)?,
            field_type: row.get(6)?,
            input_strategy: row.get(7)?,
            last_seen: row.get(8)?,
        })
    }
}
