use crate::error::{NlqError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// Text-completion service. Unreachable or slow services surface as
/// `NlqError::ServiceUnavailable` so callers can degrade instead of failing.
#[async_trait]
pub trait TextCompletion: Send + Sync {
    async fn complete(&self, prompt: &str, temperature: f32, max_tokens: u32) -> Result<Completion>;
}

/// OpenAI-compatible chat completions client
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String) -> Self {
        Self::with_options(api_key, DEFAULT_BASE_URL.to_string(), DEFAULT_MODEL.to_string(), Duration::from_secs(30))
    }

    pub fn with_options(api_key: String, base_url: String, model: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            http,
        }
    }

    /// Build from OPENAI_API_KEY / OPENAI_BASE_URL / NLQ_MODEL; None without a key
    pub fn from_env(timeout: Duration) -> Option<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty())?;
        let base_url = std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model = std::env::var("NLQ_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Some(Self::with_options(api_key, base_url, model, timeout))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn call_llm(&self, prompt: &str, temperature: f32, max_tokens: u32) -> Result<Completion> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "You are an expert SQL writer. Answer with a single read-only SQL query."},
                {"role": "user", "content": prompt}
            ],
            "temperature": temperature,
            "max_tokens": max_tokens
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| NlqError::ServiceUnavailable(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NlqError::ServiceUnavailable(format!("LLM API returned {}", status)));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| NlqError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        let text = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| NlqError::Llm("No content in LLM response".to_string()))?;
        let usage = serde_json::from_value::<TokenUsage>(response_json["usage"].clone()).ok();
        debug!("LLM completion: {} chars, usage {:?}", text.len(), usage);

        Ok(Completion {
            text: text.to_string(),
            usage,
        })
    }
}

#[async_trait]
impl TextCompletion for LlmClient {
    async fn complete(&self, prompt: &str, temperature: f32, max_tokens: u32) -> Result<Completion> {
        self.call_llm(prompt, temperature, max_tokens).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable() {
        let client = LlmClient::with_options(
            "test-key".to_string(),
            "http://127.0.0.1:9/v1/".to_string(),
            DEFAULT_MODEL.to_string(),
            Duration::from_millis(500),
        );
        let err = client.complete("SELECT 1", 0.1, 10).await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
