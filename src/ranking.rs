use anyhow::Result;
use std::collections::BTreeMap;

use crate::models::FitDetails;

#[derive(Debug, Clone, Copy)]
pub struct RankRequest<'a> {
    pub title: &'a str,
    pub company: &'a str,
    pub description: Option<&'a str>,
    pub profile: Option<&'a str>,
    pub keywords: &'a [String],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ranking {
    pub fit_score: f64,
    pub fit: FitDetails,
}

/// Scores a posting against the search profile.
pub trait Ranker: Send {
    fn rank(&self, request: &RankRequest) -> Result<Ranking>;
}

/// Adds the learned per-category adjustments to the category scores and
/// recomputes the fit score as their mean. Scores stay within 0..=100.
pub fn apply_adjustments(ranking: &mut Ranking, adjustments: &BTreeMap<String, f64>) {
    let scores = &mut ranking.fit.category_scores;
    if scores.is_empty() || adjustments.is_empty() {
        return;
    }
    let mut touched = false;
    for (category, score) in scores.iter_mut() {
        if let Some(delta) = adjustments.get(category) {
            *score = (*score + delta).clamp(0.0, 100.0);
            touched = true;
        }
    }
    if touched {
        ranking.fit_score = scores.values().sum::<f64>() / scores.len() as f64;
    }
}

/// Offline ranker based on keyword coverage and a few title and location cues.
#[derive(Debug, Default, Clone)]
pub struct KeywordRanker;

const SENIOR_MARKERS: [&str; 5] = ["senior", "staff", "principal", "lead", "sr."];
const JUNIOR_MARKERS: [&str; 3] = ["junior", "intern", "graduate"];
const BLOCKER_PHRASES: [(&str, &str); 4] = [
    ("security clearance", "Requires security clearance"),
    ("no visa sponsorship", "No visa sponsorship"),
    ("unable to sponsor", "No visa sponsorship"),
    ("must be located in", "Location restricted"),
];

impl Ranker for KeywordRanker {
    fn rank(&self, request: &RankRequest) -> Result<Ranking> {
        let title = request.title.to_lowercase();
        let description = request.description.unwrap_or_default().to_lowercase();
        let text = format!("{} {}", title, description);

        let (found, missing): (Vec<&String>, Vec<&String>) = request
            .keywords
            .iter()
            .partition(|k| text.contains(&k.to_lowercase()));

        let mut fit = FitDetails::default();
        let technical = if request.keywords.is_empty() {
            50.0
        } else {
            found.len() as f64 / request.keywords.len() as f64 * 100.0
        };
        let title_match = if request.keywords.iter().any(|k| title.contains(&k.to_lowercase())) {
            100.0
        } else {
            40.0
        };
        let seniority = if SENIOR_MARKERS.iter().any(|m| title.contains(m)) {
            80.0
        } else if JUNIOR_MARKERS.iter().any(|m| title.contains(m)) {
            30.0
        } else {
            60.0
        };
        let location = if description.contains("remote") {
            90.0
        } else if ["on-site", "onsite", "in office", "in-office"]
            .iter()
            .any(|m| description.contains(m))
        {
            40.0
        } else {
            60.0
        };

        fit.category_scores.insert("technical".into(), technical);
        fit.category_scores.insert("title".into(), title_match);
        fit.category_scores.insert("seniority".into(), seniority);
        fit.category_scores.insert("location".into(), location);

        if !found.is_empty() {
            fit.reasons.push(format!(
                "Matches {}",
                found.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
            ));
            fit.must_haves = found.iter().map(|k| k.to_string()).collect();
        }
        if location >= 90.0 {
            fit.reasons.push("Remote friendly".into());
        }
        fit.missing_keywords = missing.iter().map(|k| k.to_string()).collect();
        for (phrase, blocker) in BLOCKER_PHRASES {
            if description.contains(phrase) && !fit.blockers.iter().any(|b| b == blocker) {
                fit.blockers.push(blocker.to_string());
            }
        }

        let fit_score = fit.category_scores.values().sum::<f64>() / fit.category_scores.len() as f64;
        Ok(Ranking { fit_score, fit })
    }
}
