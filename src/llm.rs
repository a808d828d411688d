use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Text synthesis capability used by the summarization stage. Swappable so
/// the pipeline logic never depends on a particular model transport.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce text from fixed instructions and structured context.
    async fn generate(
        &self,
        instructions: &str,
        context: &serde_json::Value,
    ) -> Result<String, PipelineError>;
}

/// Ollama HTTP client for local model inference.
pub struct OllamaGenerator {
    base_url: String,
    model: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl OllamaGenerator {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| PipelineError::GenerationFailure(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            timeout_secs,
        })
    }

    /// Configuration from `OLLAMA_URL` / `OLLAMA_MODEL`, with local defaults.
    pub fn from_env() -> Result<Self, PipelineError> {
        let base_url =
            std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string());
        let model = std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "medgemma".to_string());
        let generator = Self::new(&base_url, &model, 120)?;
        tracing::debug!(base_url = generator.base_url(), %model, "configured ollama generator");
        Ok(generator)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    system: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(
        &self,
        instructions: &str,
        context: &serde_json::Value,
    ) -> Result<String, PipelineError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = OllamaGenerateRequest {
            model: &self.model,
            prompt: context.to_string(),
            system: instructions,
            stream: false,
        };

        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::GenerationFailure(format!(
                    "request timed out after {}s",
                    self.timeout_secs
                ))
            } else {
                PipelineError::GenerationFailure(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::GenerationFailure(format!(
                "ollama returned {status}: {body}"
            )));
        }

        let parsed: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::GenerationFailure(e.to_string()))?;

        Ok(parsed.response)
    }
}

/// Test generator with a canned reply, or a configured failure.
#[cfg(test)]
pub struct MockGenerator {
    response: Result<String, String>,
}

#[cfg(test)]
impl MockGenerator {
    pub fn new(response: &str) -> Self {
        Self {
            response: Ok(response.to_string()),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            response: Err(reason.to_string()),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl Generator for MockGenerator {
    async fn generate(
        &self,
        _instructions: &str,
        _context: &serde_json::Value,
    ) -> Result<String, PipelineError> {
        match &self.response {
            Ok(text) => Ok(text.clone()),
            Err(reason) => Err(PipelineError::GenerationFailure(reason.clone())),
        }
    }
}
