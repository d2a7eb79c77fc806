use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::sync::OnceLock;

use crate::models::FitDetails;
use crate::patterns::{KeywordAnalyzer, RejectionAnalysis, RejectionAnalyzer, RejectionSignal};
use crate::ranking::{RankRequest, Ranker, Ranking};

// --- Provider trait ---

pub trait AIProvider: Send + Sync {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String>;
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    OpenAI,
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model_id: String,
}

pub fn resolve_model(name: &str) -> Result<ModelSpec> {
    let (provider, model_id) = match name {
        // Anthropic (requires ANTHROPIC_API_KEY)
        "claude-sonnet" | "sonnet" => (ProviderKind::Anthropic, "claude-sonnet-4-5-20250929"),
        "claude-opus" | "opus" => (ProviderKind::Anthropic, "claude-opus-4-6"),
        "claude-haiku" | "haiku" => (ProviderKind::Anthropic, "claude-haiku-4-5-20251001"),
        // OpenAI (requires OPENAI_API_KEY)
        "gpt-5.2" | "gpt5" => (ProviderKind::OpenAI, "gpt-5.2"),
        "gpt-4o" => (ProviderKind::OpenAI, "gpt-4o"),
        "o3" => (ProviderKind::OpenAI, "o3"),
        _ => {
            return Err(anyhow!(
                "Unknown model '{}'. Available: claude-sonnet, claude-opus, claude-haiku, \
                 gpt-5.2, gpt-4o, o3",
                name
            ))
        }
    };
    Ok(ModelSpec {
        provider,
        model_id: model_id.to_string(),
    })
}

pub fn create_provider(spec: &ModelSpec) -> Result<Box<dyn AIProvider>> {
    match spec.provider {
        ProviderKind::Anthropic => Ok(Box::new(AnthropicProvider::new(spec.model_id.clone())?)),
        ProviderKind::OpenAI => Ok(Box::new(OpenAIProvider::new(spec.model_id.clone())?)),
    }
}

// --- Anthropic provider ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
}

impl ChatRequest {
    fn user(model: &str, prompt: &str, max_tokens: u32) -> Self {
        Self {
            model: model.to_string(),
            max_tokens,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug)]
pub struct AnthropicProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl AnthropicProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env::var("ANTHROPIC_API_KEY")
            .context("ANTHROPIC_API_KEY environment variable not set. Set it with: export ANTHROPIC_API_KEY=your-key-here")?;
        let client = reqwest::blocking::Client::new();
        Ok(Self { api_key, model_id, client })
    }
}

impl AIProvider for AnthropicProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&ChatRequest::user(&self.model_id, prompt, max_tokens))
            .send()
            .context("Failed to send request to Anthropic API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!(
                "Anthropic API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: AnthropicResponse = response
            .json()
            .context("Failed to parse Anthropic API response")?;

        api_response
            .content
            .first()
            .map(|block| block.text.clone())
            .ok_or_else(|| anyhow!("No content in Anthropic API response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- OpenAI provider ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug)]
pub struct OpenAIProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl OpenAIProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set. Set it with: export OPENAI_API_KEY=your-key-here")?;
        let client = reqwest::blocking::Client::new();
        Ok(Self { api_key, model_id, client })
    }
}

impl AIProvider for OpenAIProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let response = self
            .client
            .post(OPENAI_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&ChatRequest::user(&self.model_id, prompt, max_tokens))
            .send()
            .context("Failed to send request to OpenAI API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!(
                "OpenAI API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: OpenAIResponse = response
            .json()
            .context("Failed to parse OpenAI API response")?;

        api_response
            .choices
            .first()
            .map(|choice| choice.message.content.clone())
            .ok_or_else(|| anyhow!("No choices in OpenAI API response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Structured calls ---

/// Builds a provider on demand. Providers wrap a blocking HTTP client, so
/// they are created and dropped on the worker thread that uses them.
pub type ProviderFactory = Box<dyn Fn() -> Result<Box<dyn AIProvider>> + Send + Sync>;

fn factory_for(spec: ModelSpec) -> ProviderFactory {
    Box::new(move || create_provider(&spec))
}

/// The outermost `{...}` span of a model reply, ignoring prose or code fences
/// around it.
fn extract_json(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    (end > start).then(|| &response[start..=end])
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FitReply {
    fit_score: f64,
    #[serde(default)]
    category_scores: BTreeMap<String, f64>,
    #[serde(default)]
    reasons: Vec<String>,
    #[serde(default)]
    must_haves: Vec<String>,
    #[serde(default)]
    blockers: Vec<String>,
    #[serde(default)]
    missing_keywords: Vec<String>,
}

fn parse_fit_reply(response: &str) -> Result<Ranking> {
    let json = extract_json(response).ok_or_else(|| anyhow!("No JSON object in ranker reply"))?;
    let reply: FitReply = serde_json::from_str(json).context("Malformed ranker reply")?;
    if !reply.fit_score.is_finite() {
        return Err(anyhow!("Ranker returned a non-numeric fit score"));
    }
    Ok(Ranking {
        fit_score: reply.fit_score.clamp(0.0, 100.0),
        fit: FitDetails {
            reasons: reply.reasons,
            must_haves: reply.must_haves,
            blockers: reply.blockers,
            category_scores: reply
                .category_scores
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v.clamp(0.0, 100.0)))
                .collect(),
            missing_keywords: reply.missing_keywords,
        },
    })
}

/// Model-backed fit scoring.
pub struct AiRanker {
    factory: ProviderFactory,
    provider: OnceLock<Box<dyn AIProvider>>,
}

impl AiRanker {
    pub fn new(spec: ModelSpec) -> Self {
        Self::with_factory(factory_for(spec))
    }

    pub fn with_factory(factory: ProviderFactory) -> Self {
        Self { factory, provider: OnceLock::new() }
    }

    fn provider(&self) -> Result<&dyn AIProvider> {
        if let Some(provider) = self.provider.get() {
            return Ok(provider.as_ref());
        }
        let created = (self.factory)()?;
        Ok(self.provider.get_or_init(|| created).as_ref())
    }
}

impl Ranker for AiRanker {
    fn rank(&self, request: &RankRequest) -> Result<Ranking> {
        let prompt = format!(
            "Score how well this job posting fits the candidate's search profile.\n\n\
            Return ONLY a JSON object with these fields:\n\
            {{\"fitScore\": <0-100>, \"categoryScores\": {{\"technical\": <0-100>, \"title\": <0-100>, \
            \"seniority\": <0-100>, \"location\": <0-100>}}, \"reasons\": [...], \"mustHaves\": [...], \
            \"blockers\": [...], \"missingKeywords\": [...]}}\n\n\
            Search profile: {}\n\
            Target keywords: {}\n\n\
            Job Title: {}\n\
            Company: {}\n\n\
            Job Posting:\n{}",
            request.profile.unwrap_or("general"),
            request.keywords.join(", "),
            request.title,
            request.company,
            request.description.unwrap_or("(no description)"),
        );
        let provider = self.provider()?;
        tracing::debug!(model = provider.model_name(), title = request.title, "Ranking with model");
        let response = provider.complete(&prompt, 2048)?;
        parse_fit_reply(&response)
    }
}

/// Model-backed rejection analysis. Unparseable replies fall back to the
/// keyword analyzer.
pub struct AiRejectionAnalyzer {
    factory: ProviderFactory,
    fallback: KeywordAnalyzer,
}

impl AiRejectionAnalyzer {
    pub fn new(spec: ModelSpec) -> Self {
        Self::with_factory(factory_for(spec))
    }

    pub fn with_factory(factory: ProviderFactory) -> Self {
        Self { factory, fallback: KeywordAnalyzer }
    }
}

impl RejectionAnalyzer for AiRejectionAnalyzer {
    fn analyze(&self, signal: &RejectionSignal) -> Result<RejectionAnalysis> {
        let prompt = format!(
            "A job application was rejected. Extract reusable rejection signals.\n\n\
            Return ONLY a JSON object:\n\
            {{\"patterns\": [{{\"type\": \"technology|experience|seniority|location|clearance|language\", \
            \"value\": \"...\", \"confidence\": <0-1>}}], \
            \"suggestedAdjustments\": [{{\"category\": \"technical|experience|seniority|location|eligibility|language\", \
            \"adjustment\": <negative number between -20 and 0>, \"reason\": \"...\"}}]}}\n\n\
            Job Title: {}\n\
            Company: {}\n\
            Rejection reason: {}",
            signal.title, signal.company, signal.reason
        );
        let provider = (self.factory)()?;
        tracing::debug!(model = provider.model_name(), job_id = %signal.job_id, "Analyzing rejection");
        let response = provider.complete(&prompt, 1024)?;

        let parsed = extract_json(&response)
            .ok_or_else(|| anyhow!("No JSON object in analyzer reply"))
            .and_then(|json| serde_json::from_str::<RejectionAnalysis>(json).map_err(Into::into));
        match parsed {
            Ok(analysis) => Ok(analysis),
            Err(e) => {
                tracing::warn!(job_id = %signal.job_id, error = %e, "Malformed rejection analysis; using keyword rules");
                self.fallback.analyze(signal)
            }
        }
    }

    fn name(&self) -> &str {
        "ai"
    }
}
