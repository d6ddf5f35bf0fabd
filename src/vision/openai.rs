use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::VisionConfig;
use crate::error::{AppError, Result};
use crate::vision::VisionClient;

/// Client for OpenAI-compatible chat completion endpoints (OpenAI, Groq).
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    endpoint: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiClient {
    pub fn new(config: &VisionConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(AppError::Config(format!(
                "No API key configured; set vision.api_key or {}",
                config.provider.api_key_env()
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            endpoint: format!("{}/chat/completions", config.base_url().trim_end_matches('/')),
            model: config.model().to_string(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request(&self, image: &[u8], prompt: &str) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: vec![
                    ContentPart::Text {
                        text: prompt.to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: data_url(image),
                        },
                    },
                ],
            }],
            max_completion_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

#[async_trait]
impl VisionClient for OpenAiClient {
    async fn complete(&self, image: &[u8], prompt: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request(image, prompt))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        // The body can still time out or be cut off after a 200 status.
        let bytes = response.bytes().await.map_err(|e| {
            AppError::VisionTransient(format!("Failed to read completion response: {e}"))
        })?;
        let body: ChatResponse = serde_json::from_slice(&bytes)
            .map_err(|e| AppError::VisionFatal(format!("Malformed completion response: {e}")))?;

        tracing::debug!(
            model = %self.model,
            prompt_tokens = body.usage.as_ref().map(|u| u.prompt_tokens),
            completion_tokens = body.usage.as_ref().map(|u| u.completion_tokens),
            "Completion received"
        );

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AppError::VisionFatal("Completion response had no content".to_string()))
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}

/// Map a non-success HTTP status to the transient/fatal taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> AppError {
    let message = format!("API returned {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::CONFLICT
        || status.is_server_error()
    {
        AppError::VisionTransient(message)
    } else {
        AppError::VisionFatal(message)
    }
}

fn classify_transport(e: reqwest::Error) -> AppError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        AppError::VisionTransient(e.to_string())
    } else {
        AppError::Http(e)
    }
}

/// Encode image bytes as a `data:` URL, sniffing the media type.
pub fn data_url(bytes: &[u8]) -> String {
    let mime = image::guess_format(bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or("image/jpeg");
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

// --- Request types ---

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_completion_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

// --- Response types ---

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn client() -> OpenAiClient {
        let config = VisionConfig {
            api_key: "sk-test".to_string(),
            ..VisionConfig::default()
        };
        OpenAiClient::new(&config).unwrap()
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        let result = OpenAiClient::new(&VisionConfig::default());
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_endpoint_and_model_from_config() {
        let client = client();
        assert_eq!(client.endpoint, "https://api.openai.com/v1/chat/completions");
        assert_eq!(client.model(), "gpt-4o-mini");
    }

    #[test]
    fn test_request_shape() {
        let request = client().request(b"\x89PNG\r\n\x1a\n....", "Describe");
        let value = serde_json::to_value(&request).unwrap();

        let content = &value["messages"][0]["content"];
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[0]["text"], "Describe");
        assert_eq!(content[1]["type"], "image_url");
        assert!(content[1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
        assert_eq!(value["max_completion_tokens"], 1024);
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "").is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_transient());
    }

    #[test]
    fn test_data_url_defaults_to_jpeg() {
        assert!(data_url(b"not an image").starts_with("data:image/jpeg;base64,"));
    }

    /// Answer one request with `response`, then keep the socket open for
    /// `hold_open`.
    async fn serve_once(response: &'static str, hold_open: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            tokio::time::sleep(hold_open).await;
        });
        format!("http://{addr}")
    }

    async fn read_request(socket: &mut TcpStream) {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        line.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                if data.len() >= end + 4 + length {
                    return;
                }
            }
        }
    }

    fn local_client(base_url: String) -> OpenAiClient {
        let config = VisionConfig {
            api_key: "sk-test".to_string(),
            base_url: Some(base_url),
            timeout_secs: 1,
            ..VisionConfig::default()
        };
        OpenAiClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_completion_content_is_returned() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 45\r\n\r\n\
             {\"choices\":[{\"message\":{\"content\":\"<csv>\"}}]}",
            Duration::ZERO,
        )
        .await;
        let content = local_client(url).complete(b"img", "Describe").await.unwrap();
        assert_eq!(content, "<csv>");
    }

    #[tokio::test]
    async fn test_stalled_body_is_transient() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 1000\r\n\r\n{\"choices\":",
            Duration::from_secs(10),
        )
        .await;
        let err = local_client(url).complete(b"img", "Describe").await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_truncated_body_is_transient() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 1000\r\n\r\n{\"choices\":",
            Duration::ZERO,
        )
        .await;
        let err = local_client(url).complete(b"img", "Describe").await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_malformed_body_is_fatal() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 11\r\n\r\n{\"choices\":",
            Duration::ZERO,
        )
        .await;
        let err = local_client(url).complete(b"img", "Describe").await.unwrap_err();
        assert!(matches!(err, AppError::VisionFatal(_)), "unexpected error: {err}");
    }

    #[test]
    fn test_response_without_content() {
        let body: ChatResponse =
            serde_json::from_str(r#"{"choices": [{"message": {"content": null}}]}"#).unwrap();
        assert!(body.choices[0].message.content.is_none());
        assert!(body.usage.is_none());
    }
}
