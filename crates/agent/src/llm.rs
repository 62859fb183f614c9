use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use negocia_core::config::LlmConfig;
use negocia_core::Turn;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Text generation over ordered, role-tagged blocks.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, blocks: &[Turn]) -> Result<String>;
}

/// Google Gemini `generateContent` client.
pub struct GeminiClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: SecretString,
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: &'static str,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    #[serde(default)]
    text: Option<String>,
}

impl GeminiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build gemini http client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn complete(&self, blocks: &[Turn]) -> Result<String> {
        let request = GeminiRequest { contents: merge_consecutive_roles(blocks) };
        let url = format!("{}/{}:generateContent", self.base_url, self.model);

        debug!(
            event_name = "llm.request",
            model = %self.model,
            blocks = request.contents.len(),
            "sending generation request"
        );

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.expose_secret())])
            .json(&request)
            .send()
            .await
            // the url carries the api key
            .map_err(reqwest::Error::without_url)
            .context("gemini request failed")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(reqwest::Error::without_url)
            .context("failed to read gemini response body")?;
        if !status.is_success() {
            warn!(event_name = "llm.http_error", status = %status, "gemini returned an error status");
            return Err(anyhow!("gemini returned HTTP {status}: {body}"));
        }

        let parsed: GeminiResponse =
            serde_json::from_str(&body).context("failed to parse gemini response")?;
        first_candidate_text(parsed).ok_or_else(|| anyhow!("gemini response had no candidate text"))
    }
}

/// Adjacent blocks with the same role are joined so user and model turns alternate.
fn merge_consecutive_roles(blocks: &[Turn]) -> Vec<GeminiContent> {
    let mut contents: Vec<GeminiContent> = Vec::with_capacity(blocks.len());

    for block in blocks {
        match contents.last_mut() {
            Some(last) if last.role == block.role.as_str() => {
                last.parts.push(GeminiPart { text: block.text.clone() });
            }
            _ => contents.push(GeminiContent {
                role: block.role.as_str(),
                parts: vec![GeminiPart { text: block.text.clone() }],
            }),
        }
    }

    contents
}

fn first_candidate_text(response: GeminiResponse) -> Option<String> {
    response
        .candidates
        .into_iter()
        .next()?
        .content?
        .parts
        .into_iter()
        .find_map(|part| part.text)
}
