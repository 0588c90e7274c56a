use crate::error::{NlqError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One completion request: standing instructions plus the user turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Text in, text out. Anything that can complete a prompt can drive the translator.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<String>;
}

/// OpenAI-compatible chat completions client.
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user}
            ],
            "temperature": 0.0,
            "max_tokens": 800
        });

        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| NlqError::TranslationFailure(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NlqError::TranslationFailure(format!(
                "LLM API returned status {}",
                status
            )));
        }

        let response_json: serde_json::Value = response.json().await.map_err(|e| {
            NlqError::TranslationFailure(format!("Failed to parse LLM response: {}", e))
        })?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| NlqError::TranslationFailure("No content in LLM response".to_string()))?;

        Ok(content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_ignores_trailing_slash() {
        let client = LlmClient::new(
            "key".to_string(),
            "gpt-4".to_string(),
            "http://localhost:8080/v1/".to_string(),
        );
        assert_eq!(client.endpoint(), "http://localhost:8080/v1/chat/completions");
        assert_eq!(client.model(), "gpt-4");
    }
}
