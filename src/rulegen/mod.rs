//! Rule generation for thing models.
//!
//! [`DefaultRuleGenerator`] derives a rule set from declared data types.
//! [`ChatRuleGenerator`] asks an OpenAI-compatible chat-completions endpoint
//! for one; it is only built from an explicit [`LlmConfig`], never from
//! hidden defaults. Either way the result must pass validation and the
//! consistency check before it is persisted.

use crate::model::ThingModel;
use crate::rules::defaults::default_rule_set;
use crate::rules::{check_consistency, rule_file_name, SimulationRuleSet};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

#[async_trait]
pub trait RuleGenerator: Send + Sync {
    /// Produces a validated rule set for `model`. `model_text` is the model
    /// document as written.
    async fn generate(&self, product: &str, model: &ThingModel, model_text: &str) -> Result<SimulationRuleSet>;
}

/// Rules derived from data types alone.
pub struct DefaultRuleGenerator;

#[async_trait]
impl RuleGenerator for DefaultRuleGenerator {
    async fn generate(&self, product: &str, model: &ThingModel, _model_text: &str) -> Result<SimulationRuleSet> {
        Ok(default_rule_set(product, model))
    }
}

const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
const DEEPSEEK_MODEL: &str = "deepseek-chat";

/// Connection details for the chat backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmConfig {
    pub provider: String,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl LlmConfig {
    /// Reads `LLM_PROVIDER`, `LLM_API_KEY`, `LLM_MODEL`, `LLM_BASE_URL` and
    /// `LLM_TIMEOUT_SECS`. `None` without an API key.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = get("LLM_API_KEY")?;
        let provider = get("LLM_PROVIDER").unwrap_or_else(|| "deepseek".to_string());
        let (default_url, default_model) = match provider.as_str() {
            "deepseek" => (DEEPSEEK_BASE_URL, DEEPSEEK_MODEL),
            _ => ("", ""),
        };
        let base_url = get("LLM_BASE_URL").unwrap_or_else(|| default_url.to_string());
        let model = get("LLM_MODEL").unwrap_or_else(|| default_model.to_string());
        if base_url.is_empty() || model.is_empty() {
            return None;
        }
        let timeout = get("LLM_TIMEOUT_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(120));

        Some(Self {
            provider,
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
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
    temperature: f64,
    stream: bool,
    response_format: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: String,
}

const SYSTEM_PROMPT: &str = r#"You write simulation rules for IoT thing models.
Answer with a single JSON object and nothing else:
{"productName": "...",
 "simulationConfig": {"<property>": {"method": "randomRange|wave|enumPick|accumulate|increase|fixed", ...}},
 "events": [{"identifier": "<event>", "triggerCondition": "<property> <op> <literal>", "cooldown": <seconds>}],
 "services": {"<service>": {"responseStrategy": "fixed|randomPick", "possibleResponses": [{"code": 200, "msg": "...", "desc": "..."}]}}}
randomRange needs min < max and an optional step. wave needs min, max, amplitude and wavePeriod in seconds.
enumPick needs enumValues as strings and switchProbability in [0, 1]; booleans use ["true", "false"].
accumulate adds step per report from start. increase adds step per second from start.
Operators are >=, <=, ==, !=, >, <. Cover every property, event and service of the model exactly once."#;

/// Asks a chat-completions endpoint for a rule set.
pub struct ChatRuleGenerator {
    config: LlmConfig,
    client: reqwest::Client,
}

impl ChatRuleGenerator {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { config, client })
    }

    async fn complete(&self, model_text: &str) -> Result<String> {
        let user_prompt = format!(
            "Generate simulation rules for this thing model. Return JSON only.\n{}",
            model_text
        );
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &user_prompt,
                },
            ],
            temperature: 1.0,
            stream: false,
            response_format: serde_json::json!({"type": "json_object"}),
        };

        let url = format!("{}/chat/completions", self.config.base_url);
        debug!(provider = %self.config.provider, url = %url, "Requesting rule generation");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await
            .context("Failed to send rule generation request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("Rule generation failed with status {}: {}", status, body));
        }

        let reply: ChatResponse = response
            .json()
            .await
            .context("Failed to parse rule generation response")?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| anyhow!("Rule generation returned no content"))?;
        Ok(strip_code_fence(&content).to_string())
    }
}

#[async_trait]
impl RuleGenerator for ChatRuleGenerator {
    async fn generate(&self, product: &str, model: &ThingModel, model_text: &str) -> Result<SimulationRuleSet> {
        let content = self.complete(model_text).await?;
        let mut rules = SimulationRuleSet::from_json(&content)
            .with_context(|| format!("Generated rules are not valid JSON: {}", content))?;
        if rules.product_name.is_empty() {
            rules.product_name = product.to_string();
        }
        rules.validate().context("Generated rules are invalid")?;
        if let Err(report) = check_consistency(model, &rules) {
            bail!("Generated rules do not match the thing model: {}", report);
        }
        Ok(rules)
    }
}

/// Chat generator when configured, otherwise the default one.
pub fn generator_for(llm: Option<LlmConfig>) -> Result<Box<dyn RuleGenerator>> {
    Ok(match llm {
        Some(config) => Box::new(ChatRuleGenerator::new(config)?),
        None => Box::new(DefaultRuleGenerator),
    })
}

/// Removes a surrounding markdown code fence, if any.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Writes `rules` to `<dir>/rule_<product>.json` and returns the path.
pub fn persist_rule(dir: impl AsRef<Path>, rules: &SimulationRuleSet) -> crate::error::Result<PathBuf> {
    let path = dir.as_ref().join(rule_file_name(&rules.product_name));
    rules.save(&path)?;
    info!(product = %rules.product_name, path = %path.display(), "Rule file written");
    Ok(path)
}
