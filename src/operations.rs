use anyhow::{anyhow, Result};

use crate::jobs::canonical_url;
use crate::models::{AppliedMethod, Candidate, Job, JobStatus, OperationKind, SkipReason};
use crate::orchestrator::{BatchOperation, RunContext, RunOutcome};
use crate::ranking::{apply_adjustments, RankRequest, Ranker};
use crate::runs::Progress;
use crate::sources::{ApplyDriver, FormField, JobSource, LeadSource};

// --- Search ---

/// Pages through search results, ranks what is new and ingests each page in
/// one transaction. The cursor is the last page before which every page was
/// fully processed, so failed and interrupted pages are retried on resume.
pub struct SearchOperation {
    source: Box<dyn JobSource>,
    ranker: Box<dyn Ranker>,
}

impl SearchOperation {
    pub fn new(source: Box<dyn JobSource>, ranker: Box<dyn Ranker>) -> Self {
        Self { source, ranker }
    }

    /// Ranks one candidate, or returns `None` when it should not be queued.
    fn evaluate(&self, ctx: &RunContext, mut candidate: Candidate) -> Result<Option<Candidate>> {
        let db = ctx.db();
        let search = ctx.config().search();

        if let Some(reason) = db.job_disposition(&candidate.url)? {
            ctx.log().info(format!("Skip {} at {}: {}", candidate.title, candidate.company, reason));
            return Ok(None);
        }
        if db.has_applied_to_company_title(&candidate.company, &candidate.title)? {
            ctx.log().info(format!(
                "Skip {} at {}: {}",
                candidate.title,
                candidate.company,
                SkipReason::AlreadyApplied
            ));
            return Ok(None);
        }

        let mut ranking = self.ranker.rank(&RankRequest {
            title: &candidate.title,
            company: &candidate.company,
            description: candidate.description.as_deref(),
            profile: search.profile.as_deref(),
            keywords: &search.keywords,
        })?;
        apply_adjustments(&mut ranking, &db.current_adjustments()?);

        if ranking.fit_score < search.min_score {
            ctx.log().info(format!(
                "Below threshold {:.1} < {:.1}: {} at {}",
                ranking.fit_score, search.min_score, candidate.title, candidate.company
            ));
            return Ok(None);
        }

        ctx.log().info(format!(
            "Ranked {:.1}: {} at {}",
            ranking.fit_score, candidate.title, candidate.company
        ));
        candidate.rank = Some(ranking.fit_score);
        candidate.fit = ranking.fit;
        if candidate.search_profile.is_none() {
            candidate.search_profile = search.profile.clone();
        }
        Ok(Some(candidate))
    }
}

impl BatchOperation for SearchOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::Search
    }

    fn run(&mut self, ctx: &RunContext) -> Result<RunOutcome> {
        let search = ctx.config().search();
        let first_page = match ctx.resume_cursor() {
            Some(cursor) => cursor
                .parse::<u32>()
                .map_err(|_| anyhow!("Search cursor '{}' is not a page number", cursor))?
                + 1,
            None => 1,
        };

        let mut contiguous = true;
        for page in first_page..=search.max_pages {
            if ctx.should_stop() {
                return Ok(RunOutcome::Stopped);
            }

            let candidates = match self.source.fetch_page(page) {
                Ok(Some(c)) if !c.is_empty() => c,
                Ok(_) => {
                    ctx.log().info(format!("No results on page {}; search exhausted", page));
                    break;
                }
                Err(e) => {
                    ctx.log().warn(format!("Page {} failed: {:#}", page, e));
                    contiguous = false;
                    ctx.checkpoint(Progress { failed: 1, ..Default::default() }, None)?;
                    continue;
                }
            };

            let mut progress = Progress::default();
            let mut ranked = Vec::new();
            let mut interrupted = false;
            for candidate in candidates {
                if ctx.should_stop() {
                    interrupted = true;
                    break;
                }
                progress.processed += 1;
                let label = format!("{} at {}", candidate.title, candidate.company);
                match self.evaluate(ctx, candidate) {
                    Ok(Some(c)) => ranked.push(c),
                    Ok(None) => {}
                    Err(e) => {
                        progress.failed += 1;
                        ctx.log().warn(format!("Failed to rank {}: {:#}", label, e));
                    }
                }
                ctx.pause();
            }

            let report = ctx.db().ingest(&ranked)?;
            progress.added += report.added() as i64;
            // Ingestion skips whatever a revisited page already queued.
            let cursor = (contiguous && !interrupted).then(|| page.to_string());
            ctx.checkpoint(progress, cursor.as_deref())?;
            ctx.log().info(format!(
                "Page {}: {} processed, {} queued, {} skipped",
                page,
                progress.processed,
                report.added(),
                report.skipped_count()
            ));

            if interrupted {
                return Ok(RunOutcome::Stopped);
            }
        }
        Ok(RunOutcome::Exhausted)
    }
}

// --- Lead scrape ---

/// Imports scraped connection profiles one at a time. The cursor is the last
/// imported profile URL.
pub struct LeadScrapeOperation {
    source: Box<dyn LeadSource>,
}

impl LeadScrapeOperation {
    pub fn new(source: Box<dyn LeadSource>) -> Self {
        Self { source }
    }
}

impl BatchOperation for LeadScrapeOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::Leads
    }

    fn run(&mut self, ctx: &RunContext) -> Result<RunOutcome> {
        let limit = ctx.config().leads().limit.unwrap_or(usize::MAX);
        let leads = self.source.fetch_leads()?;

        let start = match ctx.resume_cursor() {
            Some(cursor) => match leads
                .iter()
                .position(|l| canonical_url(&l.profile_url).as_deref() == Some(cursor))
            {
                Some(pos) => pos + 1,
                None => {
                    ctx.log().warn(format!("Cursor {} not in lead feed; starting over", cursor));
                    0
                }
            },
            None => 0,
        };

        for lead in leads.into_iter().skip(start).take(limit) {
            if ctx.should_stop() {
                return Ok(RunOutcome::Stopped);
            }
            let mut progress = Progress { processed: 1, ..Default::default() };
            match ctx.db().import_lead(&lead) {
                Ok(true) => {
                    progress.added = 1;
                    ctx.log().info(format!("Imported {}", lead.name));
                }
                Ok(false) => ctx.log().info(format!("Skip {}: already imported", lead.name)),
                Err(e) => {
                    progress.failed = 1;
                    ctx.log().warn(format!("Failed to import {}: {:#}", lead.name, e));
                }
            }
            let cursor = canonical_url(&lead.profile_url);
            ctx.checkpoint(progress, cursor.as_deref())?;
            ctx.pause();
        }
        Ok(RunOutcome::Exhausted)
    }
}

// --- Apply ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplyResult {
    Submitted,
    Skipped,
}

/// Submits quick-apply forms for queued jobs, best rank first, filling
/// fields through learned label mappings. The cursor is the last job id.
pub struct ApplyOperation {
    driver: Box<dyn ApplyDriver>,
}

impl ApplyOperation {
    pub fn new(driver: Box<dyn ApplyDriver>) -> Self {
        Self { driver }
    }

    fn apply(&mut self, ctx: &RunContext, job: &Job) -> Result<ApplyResult> {
        let db = ctx.db();
        if db.has_applied_to_company_title(&job.company, &job.title)? {
            db.update_status(&job.id, JobStatus::Skipped, None, None)?;
            ctx.log().info(format!(
                "Skip {} at {}: {}",
                job.title,
                job.company,
                SkipReason::AlreadyApplied
            ));
            return Ok(ApplyResult::Skipped);
        }

        let fields = self.driver.open_form(job)?;
        for field in &fields {
            self.fill_field(ctx, field)?;
        }
        self.driver.submit()?;
        db.update_status(&job.id, JobStatus::Applied, Some(AppliedMethod::Automatic), None)?;
        ctx.log().info(format!("Applied to {} at {}", job.title, job.company));
        Ok(ApplyResult::Submitted)
    }

    /// Tries the learned locator, then the alternates the form offers. Each
    /// attempt ends in exactly one success or failure on the mapping.
    fn fill_field(&mut self, ctx: &RunContext, field: &FormField) -> Result<()> {
        let db = ctx.db();
        let Some(mapping) = db.lookup_mapping(&field.label)? else {
            if field.required {
                return Err(anyhow!("No mapping learned for required field '{}'", field.label));
            }
            ctx.log().info(format!("Leaving unmapped optional field '{}' empty", field.label));
            return Ok(());
        };

        let key = format!("answer.{}", mapping.answer_key);
        let Some(value) = db.get_preference(&key)? else {
            if field.required {
                return Err(anyhow!("No answer stored for '{}' (set it with `prefs set {}`)", field.label, key));
            }
            return Ok(());
        };

        let mut locators = vec![mapping.locator.as_str()];
        locators.extend(
            field
                .locators
                .iter()
                .map(String::as_str)
                .filter(|l| *l != mapping.locator),
        );

        for locator in locators {
            match self.driver.fill(field, locator, &value) {
                Ok(()) => {
                    db.record_success(&mapping.label, locator)?;
                    return Ok(());
                }
                Err(e) => tracing::debug!(label = %field.label, locator, error = %e, "Locator failed"),
            }
        }

        db.record_failure(&mapping.label)?;
        if field.required {
            return Err(anyhow!("Could not fill required field '{}'", field.label));
        }
        ctx.log().warn(format!("Could not fill optional field '{}'", field.label));
        Ok(())
    }
}

impl BatchOperation for ApplyOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::Apply
    }

    fn run(&mut self, ctx: &RunContext) -> Result<RunOutcome> {
        let settings = ctx.config().apply();
        // Submitted and skipped jobs leave the queue, so a resumed run picks
        // up where the last one stopped without consulting the cursor.
        let jobs = ctx.db().queued_for_apply(settings.limit, settings.min_rank)?;
        ctx.log().info(format!("{} queued quick-apply jobs", jobs.len()));

        for job in &jobs {
            if ctx.should_stop() {
                return Ok(RunOutcome::Stopped);
            }
            let mut progress = Progress { processed: 1, ..Default::default() };
            match self.apply(ctx, job) {
                Ok(ApplyResult::Submitted) => progress.added = 1,
                Ok(ApplyResult::Skipped) => {}
                Err(e) => {
                    progress.failed = 1;
                    ctx.log().warn(format!("Failed to apply to {} at {}: {:#}", job.title, job.company, e));
                }
            }
            ctx.checkpoint(progress, Some(&job.id))?;
            ctx.pause();
        }
        Ok(RunOutcome::Exhausted)
    }
}
