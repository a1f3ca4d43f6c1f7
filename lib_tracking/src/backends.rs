//! Concrete VLM backends behind the enrichment gateway: OpenRouter for the
//! cloud mode, Ollama for the local mode. Both ask the model for a strict
//! JSON object matching [`EnrichmentResult`].

use crate::gateway::EnrichmentBackend;
use crate::model::EnrichmentResult;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;

fn build_prompt(class_name: &str, context: Option<&str>) -> String {
    let mut prompt = format!(
        "A trail camera detector classified an animal as '{}'. \
         Identify the species, using the attached photo if present. \
         Reply with a single JSON object and nothing else, with exactly \
         these string fields: common_name, scientific_name, description, \
         habitat, diet, conservation_status.",
        class_name
    );
    if let Some(context) = context {
        prompt.push_str(&format!(
            " Recently sighted at this camera: {}. Prefer these species when the photo is ambiguous.",
            context
        ));
    }
    prompt
}

/// Model replies often wrap the JSON in markdown fences; strip them before
/// parsing.
fn parse_reply(reply: &str) -> Result<EnrichmentResult> {
    let trimmed = reply
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    serde_json::from_str(trimmed).with_context(|| format!("Unparseable VLM reply: {}", trimmed))
}

/// Cloud backend: OpenRouter chat completions.
pub struct OpenRouterBackend {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
}

impl OpenRouterBackend {
    pub fn new(url: String, model: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            model,
            api_key,
        }
    }
}

#[async_trait]
impl EnrichmentBackend for OpenRouterBackend {
    async fn identify(
        &self,
        class_name: &str,
        thumbnail: Option<&str>,
        context: Option<&str>,
        mime_type: &str,
    ) -> Result<EnrichmentResult> {
        if self.api_key.is_empty() {
            return Err(anyhow!("No OpenRouter API key configured"));
        }

        let mut content = vec![json!({ "type": "text", "text": build_prompt(class_name, context) })];
        if let Some(thumbnail) = thumbnail {
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{};base64,{}", mime_type, thumbnail) }
            }));
        }

        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": content }]
        });

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("OpenRouter request failed")?
            .error_for_status()
            .context("OpenRouter returned an error status")?
            .json::<serde_json::Value>()
            .await
            .context("OpenRouter response was not JSON")?;

        let reply = response["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("OpenRouter response had no message content"))?;
        parse_reply(reply)
    }
}

/// Local backend: an Ollama instance running a vision model.
pub struct OllamaBackend {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(url: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            model,
        }
    }
}

#[async_trait]
impl EnrichmentBackend for OllamaBackend {
    async fn identify(
        &self,
        class_name: &str,
        thumbnail: Option<&str>,
        context: Option<&str>,
        _mime_type: &str,
    ) -> Result<EnrichmentResult> {
        let mut body = json!({
            "model": self.model,
            "prompt": build_prompt(class_name, context),
            "stream": false,
            "format": "json"
        });
        if let Some(thumbnail) = thumbnail {
            body["images"] = json!([thumbnail]);
        }

        let response = self
            .client
            .post(format!("{}/api/generate", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .context("Ollama request failed")?
            .error_for_status()
            .context("Ollama returned an error status")?
            .json::<serde_json::Value>()
            .await
            .context("Ollama response was not JSON")?;

        let reply = response["response"]
            .as_str()
            .ok_or_else(|| anyhow!("Ollama response had no 'response' field"))?;
        parse_reply(reply)
    }
}
