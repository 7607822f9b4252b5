use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::Value;

use crate::config::AiConfig;
use crate::network::ConnectivityProbe;
use crate::shared::enums::Priority;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_HELPFUL_NOTES: &str = "No additional notes provided.";
const LOG_SNIPPET_LEN: usize = 500;

const SYSTEM_PROMPT: &str = "You are an expert AI assistant that processes technical support tickets.
Your job is to:
1. Summarize the issue.
2. Estimate its priority.
3. Provide helpful notes and resource links for human moderators.
4. List relevant technical skills required.

IMPORTANT:
- Respond with *only* valid raw JSON.
- Do NOT include markdown, code fences, comments, or any extra formatting.
- The format must be a raw JSON object.

Repeat: Do not wrap your output in markdown or code fences.";

pub fn triage_prompt(title: &str, description: &str) -> String {
    format!(
        "You are a ticket triage agent. Only return a strict JSON object with no extra text, headers, or markdown.

Analyze the following support ticket and provide a JSON object with:

- summary: A short 1-2 sentence summary of the issue.
- priority: One of \"low\", \"medium\", or \"high\".
- helpfulNotes: A detailed technical explanation that a moderator can use to solve this issue. Include useful external links or resources if possible.
- relatedSkills: An array of relevant skills required to solve the issue (e.g., [\"React\", \"MongoDB\"]).

Respond ONLY in this JSON format and do not include any other text or markdown in the answer:

{{
\"summary\": \"Short summary of the ticket\",
\"priority\": \"high\",
\"helpfulNotes\": \"Here are useful tips...\",
\"relatedSkills\": [\"React\", \"Node.js\"]
}}

---

Ticket information:

- Title: {title}
- Description: {description}"
    )
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned an empty response")]
    Empty,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;
}

pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build gemini http client");
        Self {
            client,
            api_key,
            model,
            base_url: GEMINI_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

#[async_trait]
impl LlmProvider for GeminiClient {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let response = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:generateContent?key={}",
                self.base_url, self.model, self.api_key
            ))
            .json(&serde_json::json!({
                "systemInstruction": {"parts": [{"text": SYSTEM_PROMPT}]},
                "contents": [{"parts": [{"text": prompt}]}]
            }))
            .send()
            .await?
            .error_for_status()?;

        let result: Value = response.json().await?;
        let text = result["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or("");
        if text.is_empty() {
            return Err(LlmError::Empty);
        }
        Ok(text.to_string())
    }
}

/// OpenAI-compatible chat completions against a local Ollama endpoint.
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(base_url: String, model: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build ollama http client");
        Self {
            client,
            base_url,
            model,
        }
    }
}

#[async_trait]
impl LlmProvider for OllamaClient {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&serde_json::json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": prompt}
                ]
            }))
            .send()
            .await?
            .error_for_status()?;

        let result: Value = response.json().await?;
        let text = result["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("");
        if text.is_empty() {
            return Err(LlmError::Empty);
        }
        Ok(text.to_string())
    }
}

/// Validated triage result. `summary` is informational only; the workflow
/// persists the other three fields onto the ticket.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub summary: String,
    pub priority: Priority,
    pub helpful_notes: String,
    pub related_skills: Vec<String>,
}

#[derive(Deserialize)]
struct RawClassification {
    summary: Option<String>,
    priority: Option<String>,
    #[serde(rename = "helpfulNotes")]
    helpful_notes: Option<String>,
    #[serde(rename = "relatedSkills")]
    related_skills: Option<Vec<String>>,
}

fn fence_pattern() -> Regex {
    Regex::new(r"(?is)```json\s*(.*?)\s*```").expect("fence pattern is valid")
}

/// Strip an optional ```json fence, parse, validate. Any failure is `None`.
pub fn parse_classification(raw: &str) -> Option<Classification> {
    let fenced = fence_pattern();
    let json_str = fenced
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or_else(|| raw.trim());

    let parsed: RawClassification = match serde_json::from_str(json_str) {
        Ok(v) => v,
        Err(e) => {
            let snippet: String = raw.chars().take(LOG_SNIPPET_LEN).collect();
            warn!("failed to parse classification JSON: {e}; raw response: {snippet}");
            return None;
        }
    };

    Some(Classification {
        summary: parsed.summary.unwrap_or_default(),
        priority: Priority::coerce(parsed.priority.as_deref()),
        helpful_notes: parsed
            .helpful_notes
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_HELPFUL_NOTES.to_string()),
        related_skills: parsed.related_skills.unwrap_or_default(),
    })
}

/// Seam for the workflow; production implementation is [`TriageClassifier`].
#[async_trait]
pub trait Classify: Send + Sync {
    async fn classify(&self, title: &str, description: &str) -> Option<Classification>;
}

/// Primary provider with an offline-aware fallback to a local one. All failure
/// modes degrade to `None`; callers never see an error.
pub struct TriageClassifier {
    primary: Option<Box<dyn LlmProvider>>,
    secondary: Option<Box<dyn LlmProvider>>,
    probe: ConnectivityProbe,
}

impl TriageClassifier {
    pub fn new(
        primary: Option<Box<dyn LlmProvider>>,
        secondary: Option<Box<dyn LlmProvider>>,
        probe: ConnectivityProbe,
    ) -> Self {
        Self {
            primary,
            secondary,
            probe,
        }
    }

    pub fn from_config(ai: &AiConfig, probe: ConnectivityProbe) -> Self {
        let primary = ai.gemini_api_key.clone().map(|key| {
            Box::new(GeminiClient::new(key, ai.gemini_model.clone(), ai.timeout))
                as Box<dyn LlmProvider>
        });
        let secondary = ai.ollama_base_url.clone().map(|base| {
            Box::new(OllamaClient::new(base, ai.ollama_model.clone(), ai.timeout))
                as Box<dyn LlmProvider>
        });
        Self::new(primary, secondary, probe)
    }

    async fn generate_raw(&self, prompt: &str) -> Option<(String, &'static str)> {
        if let Some(primary) = &self.primary {
            if self.probe.is_online().await {
                match primary.generate(prompt).await {
                    Ok(text) => return Some((text, primary.name())),
                    Err(e) => warn!(
                        "{} provider failed: {e}; falling back to local provider",
                        primary.name()
                    ),
                }
            } else {
                warn!("offline; skipping {} provider", primary.name());
            }
        }

        let secondary = match &self.secondary {
            Some(s) => s,
            None => {
                error!("secondary AI provider is not configured; cannot analyze ticket");
                return None;
            }
        };
        match secondary.generate(prompt).await {
            Ok(text) => Some((text, secondary.name())),
            Err(e) => {
                error!("both AI providers failed; {}: {e}", secondary.name());
                None
            }
        }
    }
}

#[async_trait]
impl Classify for TriageClassifier {
    async fn classify(&self, title: &str, description: &str) -> Option<Classification> {
        let prompt = triage_prompt(title, description);
        let (raw, provider) = self.generate_raw(&prompt).await?;
        let classification = parse_classification(&raw)?;
        info!("ticket analyzed successfully using {provider}");
        Some(classification)
    }
}

/// Case-insensitive matcher over an alternation of skill tokens. Substring
/// semantics: a short token like "C" also matches inside "JavaScript".
pub fn skill_matcher(skills: &[String]) -> Option<Regex> {
    let tokens: Vec<String> = skills
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(regex::escape)
        .collect();
    if tokens.is_empty() {
        return None;
    }
    RegexBuilder::new(&tokens.join("|"))
        .case_insensitive(true)
        .build()
        .ok()
}
