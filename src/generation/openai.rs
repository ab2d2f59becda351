use std::env;
use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{GenerationRequest, GenerationResponse, ServiceError, TextGenerator, estimate_tokens};
use crate::error::PipelineError;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Blocking client for OpenAI-compatible chat-completions endpoints.
pub struct OpenAiCompatClient {
    base_url: String,
    api_key: String,
    client: reqwest::blocking::Client,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl OpenAiCompatClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, PipelineError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::FatalConfig(format!("failed to build http client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }

    /// Resolves endpoint and credentials from the environment. DeepSeek
    /// models read `DEEPSEEK_API_KEY`, everything else `OPENAI_API_KEY`;
    /// `LLM_API_KEY` and `LLM_BASE_URL` override both.
    pub fn from_env(model_id: &str, timeout: Duration) -> Result<Self, PipelineError> {
        let is_deepseek = model_id.to_ascii_lowercase().contains("deepseek");
        let (key_var, default_base) = if is_deepseek {
            ("DEEPSEEK_API_KEY", DEEPSEEK_BASE_URL)
        } else {
            ("OPENAI_API_KEY", OPENAI_BASE_URL)
        };

        let api_key = env::var("LLM_API_KEY")
            .or_else(|_| env::var(key_var))
            .map_err(|_| {
                PipelineError::FatalConfig(format!(
                    "missing API key for model {model_id}: set LLM_API_KEY or {key_var}"
                ))
            })?;
        if api_key.trim().is_empty() {
            return Err(PipelineError::FatalConfig(format!("{key_var} is empty")));
        }

        let base_url = env::var("LLM_BASE_URL").unwrap_or_else(|_| default_base.to_string());
        Self::new(&base_url, api_key.trim(), timeout)
    }
}

impl TextGenerator for OpenAiCompatClient {
    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, ServiceError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatCompletionRequest {
            model: &request.model_id,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            seed: request.seed,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_ms = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<f64>().ok())
                .map(|seconds| (seconds * 1000.0).max(0.0) as u64);
            let message = response.text().unwrap_or_default();
            return Err(ServiceError::Http {
                status: status.as_u16(),
                message: message.chars().take(MAX_ERROR_BODY_CHARS).collect(),
                retry_after_ms,
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .map_err(|e| ServiceError::Other(format!("invalid completion body: {e}")))?;

        let response = completion_response(parsed, request)?;
        debug!(
            model = %request.model_id,
            prompt_tokens = response.prompt_tokens,
            completion_tokens = response.completion_tokens,
            "completion received"
        );
        Ok(response)
    }
}

/// Falls back to estimated counts when the body carries no usage block, so
/// cost tracking and caps still see the call.
fn completion_response(
    parsed: ChatCompletionResponse,
    request: &GenerationRequest,
) -> Result<GenerationResponse, ServiceError> {
    let Some(choice) = parsed.choices.into_iter().next() else {
        return Err(ServiceError::Other(
            "completion response contained no choices".to_string(),
        ));
    };
    let text = choice.message.content.unwrap_or_default();

    let (prompt_tokens, completion_tokens) = match parsed.usage {
        Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
        None => {
            let estimated = (estimate_tokens(&request.prompt), estimate_tokens(&text));
            warn!(
                model = %request.model_id,
                prompt_tokens = estimated.0,
                completion_tokens = estimated.1,
                "completion reported no usage, using estimated token counts"
            );
            estimated
        }
    };

    Ok(GenerationResponse {
        text,
        prompt_tokens,
        completion_tokens,
    })
}

fn map_transport_error(error: reqwest::Error) -> ServiceError {
    if error.is_timeout() {
        ServiceError::Timeout(error.to_string())
    } else if error.is_connect() || error.is_request() {
        ServiceError::Network(error.to_string())
    } else {
        ServiceError::Other(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_omits_missing_seed() {
        let body = ChatCompletionRequest {
            model: "gpt-4",
            messages: vec![ChatMessage {
                role: "user",
                content: "2+2?",
            }],
            temperature: 0.7,
            max_tokens: 64,
            seed: None,
        };
        let value = serde_json::to_value(&body).expect("request serializes");
        assert!(value.get("seed").is_none());
        assert_eq!(value["messages"][0]["content"], "2+2?");
    }

    #[test]
    fn response_body_without_usage_parses() {
        let raw = r#"{"choices":[{"message":{"content":"Final: 4"}}]}"#;
        let parsed: ChatCompletionResponse =
            serde_json::from_str(raw).expect("response without usage should parse");
        assert!(parsed.usage.is_none());
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("Final: 4"));
    }

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.to_string(),
            temperature: 0.7,
            max_tokens: 64,
            model_id: "gpt-4".to_string(),
            seed: None,
        }
    }

    #[test]
    fn missing_usage_is_estimated_from_text() {
        let parsed: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"Final: 4"}}]}"#)
                .expect("body parses");
        let response = completion_response(parsed, &request("What is 2 + 2, exactly?"))
            .expect("response");
        assert_eq!(response.text, "Final: 4");
        assert_eq!(response.prompt_tokens, 6);
        assert_eq!(response.completion_tokens, 2);
    }

    #[test]
    fn reported_usage_is_kept() {
        let parsed: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"content":"Final: 4"}}],
                "usage":{"prompt_tokens":120,"completion_tokens":30}}"#,
        )
        .expect("body parses");
        let response = completion_response(parsed, &request("2+2?")).expect("response");
        assert_eq!((response.prompt_tokens, response.completion_tokens), (120, 30));
    }

    #[test]
    fn empty_choices_is_an_error() {
        let parsed: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":0}}"#)
                .expect("body parses");
        let err = completion_response(parsed, &request("2+2?")).expect_err("no choices");
        assert!(matches!(err, ServiceError::Other(message) if message.contains("no choices")));
    }

    #[test]
    fn new_trims_trailing_slash() {
        let client = OpenAiCompatClient::new("http://localhost:8080/v1/", "key", Duration::from_secs(5))
            .expect("client builds");
        assert_eq!(client.base_url, "http://localhost:8080/v1");
    }
}
