//! Content generator seam: turns a topic/seed into cast text. The model
//! behind it is opaque; callers must tolerate empty or failed generation by
//! falling back to the seed text.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Hard ceiling applied to generated text before it enters the queue.
pub const GENERATED_TEXT_CAP: usize = 1_500;

pub const NEWS_TEMPLATE: &str =
    "Write one concise news-style update in the voice of {{agentName}} with no hashtags.";

pub const TRADE_TEMPLATE: &str = "Rewrite the input as one sharp market update in {{agentName}} voice, max 800 chars, high signal, no spam.\nInput:\n{{currentPost}}";

pub const REPLY_TEMPLATE: &str = "Write a concise reply in the voice of {{agentName}} (@{{farcasterUsername}}). Be helpful, avoid spam and repetition.\nCurrent post:\n{{currentPost}}";

#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub agent_name: String,
    pub username: String,
}

#[async_trait]
pub trait CastGenerator: Send + Sync {
    /// Render `template` with `seed` and `ctx` into final cast text.
    /// Empty output or an error means the caller should use the seed as-is.
    async fn generate(&self, template: &str, seed: &str, ctx: &TemplateContext) -> anyhow::Result<String>;
}

fn render(template: &str, seed: &str, ctx: &TemplateContext) -> String {
    template
        .replace("{{agentName}}", &ctx.agent_name)
        .replace("{{farcasterUsername}}", &ctx.username)
        .replace("{{currentPost}}", seed)
}

pub fn cap_generated(text: &str) -> String {
    let trimmed = text.trim();
    trimmed.chars().take(GENERATED_TEXT_CAP).collect()
}

/// No-model generator: hands the seed back. Used when no model endpoint is
/// configured and in sink-style deployments that never generate.
pub struct SeedGenerator;

#[async_trait]
impl CastGenerator for SeedGenerator {
    async fn generate(&self, _template: &str, seed: &str, _ctx: &TemplateContext) -> anyhow::Result<String> {
        Ok(cap_generated(seed))
    }
}

/// Chat-completions generator against an OpenAI-compatible endpoint.
/// Requires `OPENAI_API_KEY`; an unset key degrades to seed passthrough.
pub struct ModelGenerator {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl ModelGenerator {
    pub fn from_env() -> Self {
        let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(20))
            .build()
            .expect("reqwest client");
        Self { http, api_key, model }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[async_trait]
impl CastGenerator for ModelGenerator {
    async fn generate(&self, template: &str, seed: &str, ctx: &TemplateContext) -> anyhow::Result<String> {
        if self.api_key.is_empty() {
            return Ok(cap_generated(seed));
        }
        let prompt = render(template, seed, ctx);
        let req = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &prompt,
            }],
            temperature: 0.7,
            max_tokens: 400,
        };
        let resp = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("generation endpoint returned {}", resp.status());
        }
        let body: ChatResponse = resp.json().await?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.trim())
            .unwrap_or("");
        if content.is_empty() {
            return Ok(cap_generated(seed));
        }
        Ok(cap_generated(content))
    }
}

// --- Test helper ---
/// Deterministic generator returning a fixed string.
pub struct FixedGenerator(pub String);

#[async_trait]
impl CastGenerator for FixedGenerator {
    async fn generate(&self, _template: &str, _seed: &str, _ctx: &TemplateContext) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}
