use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::jobs::canonical_url;
use crate::models::{Candidate, Job, LeadCandidate};

const DEFAULT_PAGE_SIZE: usize = 25;

/// Paged search results from a scraper.
pub trait JobSource: Send {
    /// Candidates on `page` (1-based), or `None` past the last page.
    fn fetch_page(&mut self, page: u32) -> Result<Option<Vec<Candidate>>>;
}

pub trait LeadSource: Send {
    fn fetch_leads(&mut self) -> Result<Vec<LeadCandidate>>;
}

/// One input on an application form as seen by the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct FormField {
    pub label: String,
    pub field_type: Option<String>,
    pub required: bool,
    /// Locators the driver can address this field by, best guess first.
    pub locators: Vec<String>,
}

/// Drives an application form: open, fill field by field, submit.
pub trait ApplyDriver: Send {
    fn open_form(&mut self, job: &Job) -> Result<Vec<FormField>>;
    fn fill(&mut self, field: &FormField, locator: &str, value: &str) -> Result<()>;
    fn submit(&mut self) -> Result<()>;
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

// --- File-backed job feed ---

#[derive(Deserialize)]
#[serde(untagged)]
enum JobFeed {
    Pages(Vec<Vec<Candidate>>),
    Flat(Vec<Candidate>),
}

/// Scraper output saved as JSON: either an array of pages or a flat array
/// split into fixed-size pages.
pub struct FileJobSource {
    pages: Vec<Vec<Candidate>>,
}

impl FileJobSource {
    pub fn open(path: &Path) -> Result<Self> {
        let feed: JobFeed = read_json(path)?;
        Ok(Self::from_feed(feed, DEFAULT_PAGE_SIZE))
    }

    pub fn from_pages(pages: Vec<Vec<Candidate>>) -> Self {
        Self { pages }
    }

    fn from_feed(feed: JobFeed, page_size: usize) -> Self {
        let pages = match feed {
            JobFeed::Pages(pages) => pages,
            JobFeed::Flat(all) => all.chunks(page_size).map(<[Candidate]>::to_vec).collect(),
        };
        Self { pages }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

impl JobSource for FileJobSource {
    fn fetch_page(&mut self, page: u32) -> Result<Option<Vec<Candidate>>> {
        if page == 0 {
            return Err(anyhow!("Pages are numbered from 1"));
        }
        Ok(self.pages.get(page as usize - 1).cloned())
    }
}

// --- File-backed lead feed ---

pub struct FileLeadSource {
    leads: Vec<LeadCandidate>,
}

impl FileLeadSource {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { leads: read_json(path)? })
    }

    pub fn from_leads(leads: Vec<LeadCandidate>) -> Self {
        Self { leads }
    }
}

impl LeadSource for FileLeadSource {
    fn fetch_leads(&mut self) -> Result<Vec<LeadCandidate>> {
        Ok(self.leads.clone())
    }
}

// --- Replayed form sessions ---

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedField {
    pub label: String,
    #[serde(default)]
    pub field_type: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub locators: Vec<String>,
    /// Locators that actually work on the page. Empty means all of `locators`.
    #[serde(default)]
    pub accepts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedForm {
    pub fields: Vec<RecordedField>,
    #[serde(default = "default_submit_ok")]
    pub submit_ok: bool,
}

fn default_submit_ok() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplaySession {
    #[serde(default)]
    pub forms: HashMap<String, RecordedForm>,
    #[serde(default)]
    pub default: Option<RecordedForm>,
}

/// Plays back recorded application forms instead of driving a browser.
pub struct ReplayDriver {
    forms: HashMap<String, RecordedForm>,
    default: Option<RecordedForm>,
    current: Option<RecordedForm>,
    filled: Vec<(String, String)>,
    submitted: Vec<String>,
    current_url: Option<String>,
}

impl ReplayDriver {
    pub fn open(path: &Path) -> Result<Self> {
        let session: ReplaySession = read_json(path)?;
        Ok(Self::new(session))
    }

    pub fn new(session: ReplaySession) -> Self {
        let forms = session
            .forms
            .into_iter()
            .filter_map(|(url, form)| canonical_url(&url).map(|u| (u, form)))
            .collect();
        Self {
            forms,
            default: session.default,
            current: None,
            filled: Vec::new(),
            submitted: Vec::new(),
            current_url: None,
        }
    }

    /// (label, value) pairs filled so far.
    pub fn filled(&self) -> &[(String, String)] {
        &self.filled
    }

    pub fn submitted(&self) -> &[String] {
        &self.submitted
    }
}

impl ApplyDriver for ReplayDriver {
    fn open_form(&mut self, job: &Job) -> Result<Vec<FormField>> {
        let key = canonical_url(&job.url).unwrap_or_else(|| job.url.clone());
        let form = self
            .forms
            .get(&key)
            .or(self.default.as_ref())
            .cloned()
            .ok_or_else(|| anyhow!("No recorded form for {}", job.url))?;
        let fields = form
            .fields
            .iter()
            .map(|f| FormField {
                label: f.label.clone(),
                field_type: f.field_type.clone(),
                required: f.required,
                locators: f.locators.clone(),
            })
            .collect();
        self.current = Some(form);
        self.current_url = Some(key);
        Ok(fields)
    }

    fn fill(&mut self, field: &FormField, locator: &str, value: &str) -> Result<()> {
        let form = self.current.as_ref().ok_or_else(|| anyhow!("No form is open"))?;
        let recorded = form
            .fields
            .iter()
            .find(|f| f.label == field.label)
            .ok_or_else(|| anyhow!("Field '{}' is not on this form", field.label))?;
        let works = if recorded.accepts.is_empty() {
            recorded.locators.iter().any(|l| l == locator)
        } else {
            recorded.accepts.iter().any(|l| l == locator)
        };
        if !works {
            return Err(anyhow!("Locator '{}' did not match '{}'", locator, field.label));
        }
        self.filled.push((field.label.clone(), value.to_string()));
        Ok(())
    }

    fn submit(&mut self) -> Result<()> {
        let form = self.current.take().ok_or_else(|| anyhow!("No form is open"))?;
        let url = self.current_url.take().unwrap_or_default();
        if !form.submit_ok {
            return Err(anyhow!("Submission rejected for {}", url));
        }
        tracing::info!(url = %url, fields = self.filled.len(), "Replayed form submitted");
        self.submitted.push(url);
        Ok(())
    }
}
