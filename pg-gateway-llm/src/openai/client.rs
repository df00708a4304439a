use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::{
    error::LlmError,
    openai::types::{
        OpenAIChatCompletionRequest, OpenAIChatCompletionResponse, OpenAIErrorResponse,
        OpenAIMessage, OpenAIRole,
    },
};

/// OpenAI (or Azure OpenAI) chat-completions client.
///
/// Azure's Chat Completions payload is identical to OpenAI's; only the URL
/// shape and auth header differ (`api-key` header plus a
/// `/openai/deployments/{deployment}/chat/completions?api-version=...`
/// path instead of `Authorization: Bearer` against `/v1/chat/completions`).
pub struct OpenAIClient {
    api_key: String,
    base_url: String,
    http_client: reqwest::Client,
    azure: Option<AzureConfig>,
}

struct AzureConfig {
    deployment: String,
    api_version: String,
}

impl OpenAIClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, LlmError> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(LlmError::authentication("API key cannot be empty"));
        }

        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| LlmError::Network { source: e })?;

        Ok(Self {
            api_key,
            base_url: "https://api.openai.com".to_string(),
            http_client,
            azure: None,
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Switches the client into Azure OpenAI mode: `base_url` becomes the
    /// resource endpoint (e.g. `https://<resource>.openai.azure.com`).
    pub fn with_azure(mut self, deployment: impl Into<String>, api_version: impl Into<String>) -> Self {
        self.azure = Some(AzureConfig {
            deployment: deployment.into(),
            api_version: api_version.into(),
        });
        self
    }

    fn chat_completions_url(&self) -> String {
        match &self.azure {
            Some(cfg) => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                self.base_url, cfg.deployment, cfg.api_version
            ),
            None => format!("{}/v1/chat/completions", self.base_url),
        }
    }

    fn auth_headers(&self) -> Result<HeaderMap, LlmError> {
        let mut headers = HeaderMap::new();
        if self.azure.is_some() {
            headers.insert(
                "api-key",
                HeaderValue::from_str(&self.api_key)
                    .map_err(|_| LlmError::authentication("Invalid API key format"))?,
            );
        } else {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                    .map_err(|_| LlmError::authentication("Invalid API key format"))?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    pub async fn create_chat_completion(
        &self,
        request: OpenAIChatCompletionRequest,
    ) -> Result<OpenAIChatCompletionResponse, LlmError> {
        let response = self
            .http_client
            .post(self.chat_completions_url())
            .headers(self.auth_headers()?)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Network { source: e })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| LlmError::internal(format!("failed to parse response: {e}")));
        }

        let retry_after = if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            response
                .headers()
                .get("retry-after")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
        } else {
            None
        };

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());

        let message = serde_json::from_str::<OpenAIErrorResponse>(&error_text)
            .map(|e| e.error.message)
            .unwrap_or(error_text);

        Err(match status {
            reqwest::StatusCode::BAD_REQUEST => LlmError::invalid_request(message),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                LlmError::authentication(message)
            }
            reqwest::StatusCode::TOO_MANY_REQUESTS => LlmError::rate_limit(message, retry_after),
            _ => LlmError::api_error(status.as_u16(), message),
        })
    }
}

#[async_trait]
impl crate::client::LlmClient for OpenAIClient {
    async fn complete(
        &self,
        request: crate::types::CompletionRequest,
    ) -> Result<crate::types::CompletionResponse, LlmError> {
        let mut openai_messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            openai_messages.push(OpenAIMessage::system(system.clone()));
        }

        for msg in request.messages {
            let role = match msg.role {
                crate::types::Role::User => OpenAIRole::User,
                crate::types::Role::Assistant => OpenAIRole::Assistant,
                crate::types::Role::System => OpenAIRole::System,
            };
            let content = msg
                .content
                .into_iter()
                .map(|block| match block {
                    crate::types::ContentBlock::Text { text } => text,
                })
                .collect::<Vec<String>>()
                .join("");
            openai_messages.push(OpenAIMessage::new(role, content));
        }

        let response_format = request.response_format.map(|f| match f {
            crate::types::ResponseFormat::Text => crate::openai::types::OpenAIResponseFormat::Text,
            crate::types::ResponseFormat::JsonObject => {
                crate::openai::types::OpenAIResponseFormat::JsonObject
            }
        });

        let openai_request = OpenAIChatCompletionRequest {
            model: request.model,
            messages: openai_messages,
            max_completion_tokens: Some(request.max_tokens),
            temperature: request.temperature,
            top_p: request.top_p,
            stop: request.stop_sequences,
            stream: None,
            response_format,
        };

        let openai_response = self.create_chat_completion(openai_request).await?;

        let choice = openai_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::internal("no completion choices returned"))?;

        Ok(crate::types::CompletionResponse {
            content: vec![crate::types::ContentBlock::Text {
                text: choice.message.content,
            }],
            role: match choice.message.role {
                OpenAIRole::User => crate::types::Role::User,
                OpenAIRole::Assistant => crate::types::Role::Assistant,
                OpenAIRole::System => crate::types::Role::System,
            },
            usage: crate::types::Usage {
                input_tokens: openai_response.usage.prompt_tokens,
                output_tokens: openai_response.usage.completion_tokens,
            },
            stop_reason: choice.finish_reason,
        })
    }

    fn provider_name(&self) -> &str {
        if self.azure.is_some() {
            crate::providers::AZURE_OPENAI
        } else {
            crate::providers::OPENAI
        }
    }

    fn model_name(&self) -> &str {
        crate::models::openai::GPT_4O_MINI_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_api_key() {
        assert!(OpenAIClient::new("").is_err());
    }

    #[test]
    fn azure_mode_uses_deployment_url() {
        let client = OpenAIClient::new("key")
            .unwrap()
            .with_base_url("https://example.openai.azure.com")
            .with_azure("gpt-4o-mini-deploy", "2024-08-01-preview");
        let url = client.chat_completions_url();
        assert!(url.contains("/openai/deployments/gpt-4o-mini-deploy/chat/completions"));
        assert!(url.contains("api-version=2024-08-01-preview"));
    }

    #[test]
    fn openai_mode_uses_v1_url() {
        let client = OpenAIClient::new("key").unwrap();
        assert_eq!(client.chat_completions_url(), "https://api.openai.com/v1/chat/completions");
    }
}
