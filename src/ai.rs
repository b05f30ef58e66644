//! Talks to an OpenAI-compatible chat API for link descriptions and grouping.
//! Optional, see AiConfig::from_env().

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::LinkNestError;
use crate::{prompts, SharedDB};

fn ai_err(msg: impl Into<String>) -> LinkNestError {
    LinkNestError::AiBackend(msg.into())
}

const AI_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AiConfig {
    pub llm_url: String,
    pub llm_key: String,
    pub llm_model: String,
    pub client: reqwest::Client,
    // Per-pass model overrides (fall back to llm_model if None)
    pub describe_model: Option<String>,
    pub group_model: Option<String>,
}

impl AiConfig {
    pub fn model_for(&self, component: &str) -> &str {
        let m = match component {
            "describe" => self.describe_model.as_deref(),
            "group" => self.group_model.as_deref(),
            _ => None,
        };
        m.unwrap_or(&self.llm_model)
    }

    /// Returns `None` if `LINKNEST_LLM_URL` is not set or the HTTP client
    /// cannot be built.
    pub fn from_env() -> Option<Self> {
        let llm_url = std::env::var("LINKNEST_LLM_URL").ok()?;
        let client = match reqwest::Client::builder().timeout(AI_TIMEOUT).build() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to build HTTP client, AI disabled");
                return None;
            }
        };
        Some(Self {
            llm_url,
            llm_key: std::env::var("LINKNEST_LLM_KEY").unwrap_or_default(),
            llm_model: std::env::var("LINKNEST_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            client,
            describe_model: std::env::var("LINKNEST_DESCRIBE_MODEL").ok(),
            group_model: std::env::var("LINKNEST_GROUP_MODEL").ok(),
        })
    }

    pub fn has_llm(&self) -> bool {
        !self.llm_url.is_empty()
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

pub struct LlmResult {
    pub content: String,
    pub usage: Option<Usage>,
    pub model: String,
    pub duration_ms: u64,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Send a chat completion request using the model configured for `component`.
pub async fn llm_chat_as(
    cfg: &AiConfig,
    component: &str,
    system: &str,
    user: &str,
    temperature: f64,
    max_tokens: u32,
) -> Result<LlmResult, LinkNestError> {
    let model = cfg.model_for(component).to_string();
    let req = ChatRequest {
        model: model.clone(),
        messages: vec![
            ChatMessage { role: "system".into(), content: system.into() },
            ChatMessage { role: "user".into(), content: user.into() },
        ],
        temperature,
        max_tokens,
    };

    let mut builder = cfg.client.post(&cfg.llm_url).json(&req);
    if !cfg.llm_key.is_empty() {
        builder = builder.header("Authorization", format!("Bearer {}", cfg.llm_key));
    }

    let start = std::time::Instant::now();
    let resp = builder
        .send()
        .await
        .map_err(|e| ai_err(format!("LLM request failed: {e}")))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(ai_err(format!("LLM returned {status}: {body}")));
    }

    let chat: ChatResponse = resp
        .json()
        .await
        .map_err(|e| ai_err(format!("LLM response parse failed: {e}")))?;
    let duration_ms = start.elapsed().as_millis() as u64;
    let content = chat
        .choices
        .first()
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default();
    Ok(LlmResult { content, usage: chat.usage, model, duration_ms })
}

/// What the grouping pass sends per link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkDigest {
    pub url: String,
    pub tags: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The AI collaborator as the engine sees it: text in, text out, fallible.
#[async_trait]
pub trait LinkAi: Send + Sync {
    /// Raw description text for one URL.
    async fn describe(&self, url: &str) -> Result<String, LinkNestError>;

    /// Raw grouping response for a batch; expected to contain a JSON array of
    /// `{url, group_title}` somewhere in the text.
    async fn group(&self, links: &[LinkDigest]) -> Result<String, LinkNestError>;
}

/// `LinkAi` backed by an OpenAI-compatible endpoint. Usage is logged to the
/// database when one is attached.
pub struct OpenAiLinks {
    cfg: AiConfig,
    db: Option<SharedDB>,
}

impl OpenAiLinks {
    pub fn new(cfg: AiConfig, db: Option<SharedDB>) -> Self {
        Self { cfg, db }
    }

    async fn log_usage(&self, component: &'static str, result: &LlmResult) {
        let (Some(db), Some(u)) = (self.db.clone(), result.usage.clone()) else {
            return;
        };
        let model = result.model.clone();
        let duration_ms = result.duration_ms;
        let logged = tokio::task::spawn_blocking(move || {
            db.log_llm_call(component, &model, u.prompt_tokens, u.completion_tokens, duration_ms)
        })
        .await;
        if let Ok(Err(e)) = logged {
            debug!(error = %e, component, "failed to log llm usage");
        }
    }
}

#[async_trait]
impl LinkAi for OpenAiLinks {
    async fn describe(&self, url: &str) -> Result<String, LinkNestError> {
        let r = llm_chat_as(
            &self.cfg,
            "describe",
            prompts::DESCRIBE_SYSTEM,
            &prompts::describe_prompt(url),
            0.5,
            80,
        )
        .await?;
        self.log_usage("describe", &r).await;
        Ok(r.content)
    }

    async fn group(&self, links: &[LinkDigest]) -> Result<String, LinkNestError> {
        let r = llm_chat_as(
            &self.cfg,
            "group",
            prompts::GROUP_SYSTEM,
            &prompts::group_prompt(links),
            0.2,
            1024,
        )
        .await?;
        self.log_usage("group", &r).await;
        Ok(r.content)
    }
}

/// Find the first well-formed JSON array embedded in free text (markdown
/// fences, leading prose, trailing commentary). Brackets inside string
/// literals are ignored while matching.
pub fn extract_json_array(raw: &str) -> Option<&str> {
    let bytes = raw.as_bytes();
    let mut start = 0;
    while let Some(off) = raw[start..].find('[') {
        let open = start + off;
        if let Some(close) = matching_bracket(bytes, open) {
            let candidate = &raw[open..=close];
            if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                return Some(candidate);
            }
        }
        start = open + 1;
    }
    None
}

fn matching_bracket(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_str {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_str = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_str = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Normalise a raw description: trim, drop wrapping quotes. Empty → None.
pub fn clean_description(raw: &str) -> Option<String> {
    let mut s = raw.trim();
    for (open, close) in [('"', '"'), ('\'', '\''), ('\u{201c}', '\u{201d}')] {
        if s.len() >= 2 && s.starts_with(open) && s.ends_with(close) {
            s = s[open.len_utf8()..s.len() - close.len_utf8()].trim();
        }
    }
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
