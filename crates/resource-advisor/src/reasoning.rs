//! OpenAI-compatible chat-completions client for [`ReasoningService`].
//!
//! Each [`PromptKind`] has its own system prompt describing the expected
//! JSON response. The request context is sent as the user message and the
//! model is asked for a JSON object (`response_format = json_object`).
//! The `strict` flag appends a reminder used on the single retry after a
//! response failed validation.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use resource_advisor_core::reasoning::{extract_json, PromptKind, ReasoningService};

use crate::config::ReasoningConfig;
use crate::http::{client, send_json_with_retry};

const SELECT_PROMPT: &str = r#"You design Kubernetes deployments from an organization's available resource types.
Given the user's intent and a list of candidate capabilities, propose up to maxSolutions alternative solutions.
Each solution is a set of resources taken ONLY from the capabilities list. Prefer high-level composite resources when they cover the intent.
Respond with a JSON object:
{"solutions": [{"resources": [{"group": "...", "version": "...", "kind": "..."}], "score": 0-100, "reasons": ["..."]}]}"#;

const RANK_PROMPT: &str = r#"You evaluate candidate Kubernetes solutions against a user's intent.
Each solution lists its resources with a hierarchy tier and whether the resource was added automatically as a required dependency.
Score each solution from 0 to 100 for how well it fulfils the intent. Complete solutions with fewer moving parts should score higher.
Respond with a JSON object:
{"rankings": [{"id": "<solution id>", "score": 0-100, "reasons": ["..."]}]}"#;

const ENHANCE_PROMPT: &str = r#"You refine ranked Kubernetes solutions using organizational patterns.
For each solution, decide whether a matched pattern applies. If it does, APPEND resources from that pattern's suggestedResources.
Never remove or reorder existing resources. Never add resources that no pattern suggests.
Respond with a JSON object:
{"solutions": [{"id": "<solution id>", "resources": [<all original resources in order, then additions>], "score": 0-100, "reasons": ["..."], "patternInfluence": {"patternId": "<pattern id>"}}]}"#;

const STRICT_SUFFIX: &str = "\n\nYour previous answer could not be parsed. Reply with ONLY the JSON object described above: no prose, no Markdown, no code fences.";

fn system_prompt(kind: PromptKind, strict: bool) -> String {
    let base = match kind {
        PromptKind::Select => SELECT_PROMPT,
        PromptKind::Rank => RANK_PROMPT,
        PromptKind::Enhance => ENHANCE_PROMPT,
    };
    if strict {
        format!("{}{}", base, STRICT_SUFFIX)
    } else {
        base.to_string()
    }
}

/// Chat-completions client (`POST {url}/chat/completions`).
pub struct OpenAIReasoning {
    model: String,
    url: String,
    api_key: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIReasoning {
    pub fn new(config: &ReasoningConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("reasoning.model required for OpenAI provider"))?;
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow!("{} environment variable not set", config.api_key_env))?;
        Ok(Self {
            model,
            url: config.url.trim_end_matches('/').to_string(),
            api_key,
            temperature: config.temperature,
            max_retries: config.max_retries,
            client: client(config.timeout_secs)?,
        })
    }

    fn request_body(&self, kind: PromptKind, context: &Value, strict: bool) -> Value {
        json!({
            "model": self.model,
            "temperature": self.temperature,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": system_prompt(kind, strict) },
                { "role": "user", "content": context.to_string() },
            ],
        })
    }
}

/// Pull `choices[0].message.content` out of a chat-completions response.
fn message_content(json: &Value) -> Result<&str> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow!("Invalid chat response: missing choices[0].message.content"))
}

#[async_trait]
impl ReasoningService for OpenAIReasoning {
    async fn invoke(&self, kind: PromptKind, context: &Value, strict: bool) -> Result<Value> {
        let body = self.request_body(kind, context, strict);
        let endpoint = format!("{}/chat/completions", self.url);
        let json = send_json_with_retry("Reasoning service", self.max_retries, || {
            self.client
                .post(&endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
        })
        .await?;
        let content = message_content(&json)?;
        tracing::debug!(%kind, strict, bytes = content.len(), "reasoning response received");
        extract_json(content)
    }
}

/// Placeholder used when `reasoning.provider = "disabled"`.
pub struct DisabledReasoning;

#[async_trait]
impl ReasoningService for DisabledReasoning {
    async fn invoke(&self, kind: PromptKind, _context: &Value, _strict: bool) -> Result<Value> {
        bail!("reasoning provider is disabled ({} requested)", kind)
    }
}
