//! Live-mode client for the hosted generative-language API.
//!
//! The live advisor sends the user query with the expert system prompt as system
//! instruction, forces a JSON response, and hands the parsed JSON back unchanged.
//! It shares no state with the rule engine.

use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, info_span, warn};
use ulid::Ulid;

pub const API_KEY_ENV: &str = "GOOGLE_API_KEY";
pub const MODEL_ENV: &str = "OCT_ADVISOR_MODEL";
pub const BASE_URL_ENV: &str = "OCT_ADVISOR_BASE_URL";
pub const TIMEOUT_MS_ENV: &str = "OCT_ADVISOR_TIMEOUT_MS";
pub const SYSTEM_PROMPT_ENV: &str = "OCT_ADVISOR_SYSTEM_PROMPT";

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-lite-001";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
/// Low temperature keeps answers rigorous and close to deterministic.
pub const DEFAULT_TEMPERATURE: f32 = 0.2;

/// Searched in order when no system prompt path is configured: project root, then `src/`.
pub const DEFAULT_PROMPT_CANDIDATES: [&str; 2] =
    ["prompts/system_prompt_v1.md", "../prompts/system_prompt_v1.md"];

const MIN_TIMEOUT_MS: u64 = 100;
const MAX_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("API key not found: set GOOGLE_API_KEY in the environment or a .env file")]
    MissingApiKey,
    #[error("system prompt not found (searched: {searched})")]
    PromptNotFound { searched: String },
    #[error("failed to read system prompt {}: {source}", path.display())]
    PromptRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("response blocked: {0}")]
    Blocked(String),
    #[error("model returned no candidate text")]
    EmptyCandidate,
    #[error("model output is not valid JSON: {0}")]
    MalformedJson(String),
}

#[derive(Clone)]
pub struct LiveConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub timeout: Duration,
    pub system_prompt_path: Option<PathBuf>,
}

impl Debug for LiveConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .field("timeout", &self.timeout)
            .field("system_prompt_path", &self.system_prompt_path)
            .finish()
    }
}

impl LiveConfig {
    /// Read live-mode settings from the process environment.
    ///
    /// # Errors
    /// Returns [`ProviderError::MissingApiKey`] when no API key is configured.
    pub fn from_env() -> Result<Self, ProviderError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read live-mode settings through `lookup`, which maps a variable name to its value.
    ///
    /// # Errors
    /// Returns [`ProviderError::MissingApiKey`] when no API key is configured.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ProviderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| {
            lookup(name).map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
        };

        let api_key = non_empty(API_KEY_ENV).ok_or(ProviderError::MissingApiKey)?;
        let timeout_ms = non_empty(TIMEOUT_MS_ENV)
            .and_then(|value| value.parse::<u64>().ok())
            .map_or(DEFAULT_TIMEOUT_MS, |value| value.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS));

        Ok(Self {
            api_key,
            model: non_empty(MODEL_ENV).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: non_empty(BASE_URL_ENV)
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            temperature: DEFAULT_TEMPERATURE,
            timeout: Duration::from_millis(timeout_ms),
            system_prompt_path: non_empty(SYSTEM_PROMPT_ENV).map(PathBuf::from),
        })
    }
}

/// Load the expert system prompt from `explicit`, or from the first existing
/// [`DEFAULT_PROMPT_CANDIDATES`] entry.
///
/// # Errors
/// Returns [`ProviderError::PromptNotFound`] when no candidate exists, or
/// [`ProviderError::PromptRead`] when the file cannot be read.
pub fn load_system_prompt(explicit: Option<&Path>) -> Result<String, ProviderError> {
    let candidates = match explicit {
        Some(path) => vec![path.to_path_buf()],
        None => DEFAULT_PROMPT_CANDIDATES.iter().map(PathBuf::from).collect(),
    };

    let Some(path) = candidates.iter().find(|path| path.is_file()) else {
        return Err(ProviderError::PromptNotFound {
            searched: candidates
                .iter()
                .map(|path| path.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        });
    };

    std::fs::read_to_string(path)
        .map_err(|source| ProviderError::PromptRead { path: path.clone(), source })
}

#[derive(Debug, Deserialize)]
struct GoogleError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: GoogleError,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

/// `generateContent` request body with forced JSON output.
#[must_use]
pub fn request_body(system_prompt: &str, query: &str, temperature: f32) -> Value {
    json!({
        "systemInstruction": { "parts": [{ "text": system_prompt }] },
        "contents": [{ "role": "user", "parts": [{ "text": query }] }],
        "generationConfig": {
            "responseMimeType": "application/json",
            "temperature": temperature
        }
    })
}

/// Parse the first candidate's text as JSON.
///
/// # Errors
/// Returns [`ProviderError::Blocked`] when the prompt or the answer was blocked,
/// [`ProviderError::EmptyCandidate`] when no text came back, and
/// [`ProviderError::MalformedJson`] when the text is not JSON.
pub fn extract_json(response: &GenerateContentResponse) -> Result<Value, ProviderError> {
    if let Some(reason) =
        response.prompt_feedback.as_ref().and_then(|feedback| feedback.block_reason.as_ref())
    {
        return Err(ProviderError::Blocked(format!("prompt blocked: {reason}")));
    }

    let candidate = response.candidates.first().ok_or(ProviderError::EmptyCandidate)?;
    if candidate.finish_reason.as_deref() == Some("SAFETY") {
        return Err(ProviderError::Blocked("answer blocked for safety".to_string()));
    }

    let text = candidate
        .content
        .iter()
        .flat_map(|content| content.parts.iter())
        .filter_map(|part| part.text.as_deref())
        .collect::<String>();
    if text.trim().is_empty() {
        return Err(ProviderError::EmptyCandidate);
    }

    serde_json::from_str(text.trim()).map_err(|err| ProviderError::MalformedJson(err.to_string()))
}

fn status_error(status: u16, body: &str) -> ProviderError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .map_or_else(|_| body.trim().to_string(), |parsed| parsed.error.message);
    ProviderError::Status { status, message }
}

pub struct LiveAdvisor {
    agent: ureq::Agent,
    config: LiveConfig,
    system_prompt: String,
}

impl LiveAdvisor {
    #[must_use]
    pub fn new(config: LiveConfig, system_prompt: String) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Self { agent, config, system_prompt }
    }

    /// Build a live advisor from the environment and the configured system prompt.
    ///
    /// # Errors
    /// Returns an error when the API key or system prompt is missing.
    pub fn from_env() -> Result<Self, ProviderError> {
        let config = LiveConfig::from_env()?;
        let system_prompt = load_system_prompt(config.system_prompt_path.as_deref())?;
        info!(model = %config.model, "live advisor initialized");
        Ok(Self::new(config, system_prompt))
    }

    #[must_use]
    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}/{}:generateContent", self.config.base_url, self.config.model)
    }

    /// Send one query to the hosted model and return its JSON answer.
    ///
    /// # Errors
    /// Returns [`ProviderError`] on transport failure, non-success HTTP status, a
    /// blocked or empty answer, or output that is not JSON.
    pub fn analyze_case(&self, query: &str) -> Result<Value, ProviderError> {
        let request_id = Ulid::new();
        let span = info_span!("live_query", %request_id, model = %self.config.model);
        let _entered = span.enter();

        let started = Instant::now();
        let body = request_body(&self.system_prompt, query, self.config.temperature);
        let result = self
            .agent
            .post(&self.endpoint())
            .set("x-goog-api-key", &self.config.api_key)
            .set("content-type", "application/json")
            .send_json(body);

        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                let err = status_error(status, &body);
                warn!(status, error = %err, "live query rejected");
                return Err(err);
            }
            Err(ureq::Error::Transport(transport)) => {
                warn!(error = %transport, "live query transport failure");
                return Err(ProviderError::Transport(transport.to_string()));
            }
        };

        let parsed: GenerateContentResponse =
            response.into_json().map_err(|err| ProviderError::Transport(err.to_string()))?;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(elapsed_ms, "live query completed");
        extract_json(&parsed)
    }
}
