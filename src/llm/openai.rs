use super::{CompletionBackend, CompletionRequest, LlmError, ResponseFormat};
use crate::config::{HttpSettings, LlmSettings};
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const ERROR_BODY_PREVIEW: usize = 500;

/// Client for any OpenAI-compatible `chat/completions` endpoint (OpenRouter,
/// vLLM, LiteLLM and friends).
pub struct OpenAiCompatibleBackend {
    http: Client,
    endpoint: String,
    api_key: String,
    app_url: Option<String>,
    app_title: Option<String>,
}

impl OpenAiCompatibleBackend {
    pub fn new(settings: &LlmSettings, http: &HttpSettings) -> Self {
        Self {
            http: build_client(http),
            endpoint: chat_endpoint(&settings.base_url),
            api_key: settings.api_key.clone(),
            app_url: settings.app_url.clone(),
            app_title: settings.app_title.clone(),
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiCompatibleBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let body = ChatRequest::from_request(request);

        let mut http_request = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body);
        if let Some(url) = &self.app_url {
            http_request = http_request.header("HTTP-Referer", url);
        }
        if let Some(title) = &self.app_title {
            http_request = http_request.header("X-Title", title);
        }

        let response = http_request
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: text.chars().take(ERROR_BODY_PREVIEW).collect(),
            });
        }

        let payload: ChatResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;

        payload.into_content()
    }
}

fn chat_endpoint(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormatPayload>,
}

impl<'a> ChatRequest<'a> {
    fn from_request(request: &'a CompletionRequest) -> Self {
        Self {
            model: request.model.as_str(),
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_prompt,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: match request.response_format {
                ResponseFormat::Json => Some(ResponseFormatPayload {
                    r#type: "json_object",
                }),
                ResponseFormat::Text => None,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormatPayload {
    r#type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatResponse {
    fn into_content(self) -> Result<String, LlmError> {
        let content = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("missing choices[0]".into()))?
            .message
            .content
            .ok_or_else(|| LlmError::InvalidResponse("missing message content".into()))?;
        if content.trim().is_empty() {
            return Err(LlmError::InvalidResponse("empty message content".into()));
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelDescriptor;
    use axum::{
        Json, Router,
        extract::State,
        http::{HeaderMap, StatusCode},
        routing::post,
    };
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Captured = Arc<Mutex<Vec<(HeaderMap, Value)>>>;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        format!("http://{addr}/v1")
    }

    fn backend_for(base_url: &str) -> OpenAiCompatibleBackend {
        let settings = LlmSettings {
            api_key: "sk-test".into(),
            base_url: base_url.into(),
            default_model: ModelDescriptor::new("openai/gpt-4o"),
            fallback_models: Vec::new(),
            max_retries: 1,
            retry_delay: Duration::from_millis(1),
            temperature: 0.5,
            max_tokens: 300,
            app_url: Some("https://listings.example".into()),
            app_title: Some("Listing Enhancer".into()),
        };
        let http = HttpSettings {
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        };
        OpenAiCompatibleBackend::new(&settings, &http)
    }

    async fn capture(
        State(seen): State<Captured>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        seen.lock().expect("capture lock").push((headers, body));
        Json(json!({
            "choices": [{"message": {"role": "assistant", "content": "{\"title\":\"Chair\"}"}}]
        }))
    }

    fn sample_request(format: ResponseFormat) -> CompletionRequest {
        CompletionRequest {
            system_prompt: "be terse".into(),
            user_prompt: "describe a chair".into(),
            model: ModelDescriptor::new("openai/gpt-4o"),
            temperature: 0.5,
            max_tokens: 300,
            response_format: format,
        }
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        assert_eq!(
            chat_endpoint("https://openrouter.ai/api/v1/"),
            "https://openrouter.ai/api/v1/chat/completions"
        );
        assert_eq!(
            chat_endpoint("http://localhost:8080"),
            "http://localhost:8080/chat/completions"
        );
    }

    #[test]
    fn json_request_body_shape() {
        let request = sample_request(ResponseFormat::Json);
        let body = serde_json::to_value(ChatRequest::from_request(&request)).expect("serialize");
        assert_eq!(
            body,
            json!({
                "model": "openai/gpt-4o",
                "messages": [
                    {"role": "system", "content": "be terse"},
                    {"role": "user", "content": "describe a chair"}
                ],
                "temperature": 0.5,
                "max_tokens": 300,
                "response_format": {"type": "json_object"}
            })
        );
    }

    #[test]
    fn text_request_omits_response_format() {
        let request = sample_request(ResponseFormat::Text);
        let body = serde_json::to_value(ChatRequest::from_request(&request)).expect("serialize");
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn extracts_first_choice_content() {
        let payload: ChatResponse = serde_json::from_value(json!({
            "id": "gen-1",
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": "{\"title\":\"x\"}"}}
            ]
        }))
        .expect("parse");
        assert_eq!(payload.into_content().expect("content"), "{\"title\":\"x\"}");
    }

    #[test]
    fn missing_choices_is_invalid_response() {
        let payload: ChatResponse = serde_json::from_value(json!({"choices": []})).expect("parse");
        assert!(matches!(
            payload.into_content(),
            Err(LlmError::InvalidResponse(_))
        ));
    }

    #[test]
    fn null_or_blank_content_is_invalid_response() {
        let null_content: ChatResponse = serde_json::from_value(json!({
            "choices": [{"message": {"role": "assistant", "content": null}}]
        }))
        .expect("parse");
        assert!(null_content.into_content().is_err());

        let blank: ChatResponse = serde_json::from_value(json!({
            "choices": [{"message": {"role": "assistant", "content": "  "}}]
        }))
        .expect("parse");
        assert!(blank.into_content().is_err());
    }

    #[tokio::test]
    async fn sends_auth_client_headers_and_json_mode() {
        let seen: Captured = Arc::default();
        let router = Router::new()
            .route("/v1/chat/completions", post(capture))
            .with_state(seen.clone());
        let backend = backend_for(&serve(router).await);

        let text = backend
            .complete(&sample_request(ResponseFormat::Json))
            .await
            .expect("completion");
        assert_eq!(text, "{\"title\":\"Chair\"}");

        let seen = seen.lock().expect("capture lock");
        assert_eq!(seen.len(), 1);
        let (headers, body) = &seen[0];
        assert_eq!(headers["authorization"], "Bearer sk-test");
        assert_eq!(headers["x-title"], "Listing Enhancer");
        assert_eq!(headers["http-referer"], "https://listings.example");
        assert_eq!(body["model"], "openai/gpt-4o");
        assert_eq!(body["response_format"], json!({"type": "json_object"}));
        assert_eq!(body["messages"][1]["content"], "describe a chair");
    }

    #[tokio::test]
    async fn non_success_status_carries_body() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        );
        let backend = backend_for(&serve(router).await);

        match backend.complete(&sample_request(ResponseFormat::Text)).await {
            Err(LlmError::Status { status, body }) => {
                assert_eq!(status, 429);
                assert_eq!(body, "slow down");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn long_error_bodies_are_truncated() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "x".repeat(2000)) }),
        );
        let backend = backend_for(&serve(router).await);

        match backend.complete(&sample_request(ResponseFormat::Text)).await {
            Err(LlmError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body.chars().count(), ERROR_BODY_PREVIEW);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_json_success_body_is_invalid_response() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::OK, "<html>gateway</html>") }),
        );
        let backend = backend_for(&serve(router).await);

        let err = backend
            .complete(&sample_request(ResponseFormat::Json))
            .await
            .expect_err("html is not a chat response");
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn unreachable_backend_is_http_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);
        let backend = backend_for(&format!("http://{addr}/v1"));

        let err = backend
            .complete(&sample_request(ResponseFormat::Text))
            .await
            .expect_err("nothing is listening");
        assert!(matches!(err, LlmError::Http(_)));
    }
}
