//! Ollama completion client
//!
//! Talks to a local Ollama server through its non-streaming
//! `/api/generate` endpoint.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::AiConfig;
use crate::error::{MeshError, Result};
use crate::orchestrator::CompletionService;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

/// HTTP client for an Ollama server
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    url: reqwest::Url,
    model: String,
    temperature: f32,
    timeout: Duration,
}

impl OllamaClient {
    /// Build a client from the AI settings
    pub fn new(config: &AiConfig) -> Result<Self> {
        let url = reqwest::Url::parse(&config.url)
            .map_err(|e| MeshError::InvalidConfig(format!("AI url '{}': {}", config.url, e)))?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| MeshError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url,
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: config.timeout,
        })
    }

    /// Configured model name
    pub fn model(&self) -> &str {
        &self.model
    }

    fn tags_url(&self) -> reqwest::Url {
        let mut url = self.url.clone();
        url.set_path("/api/tags");
        url.set_query(None);
        url
    }

    fn unavailable(&self, err: reqwest::Error) -> MeshError {
        if err.is_timeout() {
            MeshError::AiTimeout {
                duration_ms: self.timeout.as_millis() as u64,
            }
        } else if err.is_connect() {
            MeshError::AiUnavailable {
                url: self.url.to_string(),
                reason: err.to_string(),
            }
        } else {
            MeshError::from(err)
        }
    }

    /// Check that the server answers, returning the installed model names
    pub async fn health_check(&self) -> Result<Vec<String>> {
        let url = self.tags_url();
        debug!(url = %url, "Checking completion service");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;

        if !response.status().is_success() {
            return Err(MeshError::AiUnavailable {
                url: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }
        let tags: TagsResponse = response.json().await.map_err(|e| self.unavailable(e))?;
        let models: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();
        info!(count = models.len(), "Completion service reachable");
        Ok(models)
    }
}

#[async_trait]
impl CompletionService for OllamaClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(MeshError::ModelNotFound(self.model.clone()));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(MeshError::AiService(format!("HTTP {}: {}", status, text.trim())));
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| self.unavailable(e))?;
        debug!(model = %self.model, chars = parsed.response.len(), "Completion received");
        Ok(parsed.response.trim().to_string())
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer one HTTP request with `status` and `body`, returning the request
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if raw.len() >= end + 4 + length || n == 0 {
                        break;
                    }
                }
            }
            let reply = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&raw).to_string()
        });

        (base, handle)
    }

    fn config(url: String) -> AiConfig {
        AiConfig {
            url,
            model: "llama3.1".to_string(),
            timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_complete_posts_generate_request() {
        let (base, server) = serve_once("200 OK", r#"{"response":"  Sunny, 21C  ","done":true}"#).await;
        let client = OllamaClient::new(&config(format!("{}/api/generate", base))).unwrap();

        let answer = client.complete("weather?").await.unwrap();
        assert_eq!(answer, "Sunny, 21C");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/generate"));
        assert!(request.contains(r#""model":"llama3.1""#));
        assert!(request.contains(r#""prompt":"weather?""#));
        assert!(request.contains(r#""stream":false"#));
        assert!(request.contains(r#""temperature":0.7"#));
    }

    #[tokio::test]
    async fn test_model_not_found() {
        let (base, _server) = serve_once("404 Not Found", r#"{"error":"model not found"}"#).await;
        let client = OllamaClient::new(&config(format!("{}/api/generate", base))).unwrap();

        let err = client.complete("hi").await.unwrap_err();
        assert!(matches!(err, MeshError::ModelNotFound(ref m) if m == "llama3.1"));
        assert!(err.is_ai_error());
    }

    #[tokio::test]
    async fn test_server_error_is_service_error() {
        let (base, _server) = serve_once("500 Internal Server Error", r#"{"error":"oom"}"#).await;
        let client = OllamaClient::new(&config(format!("{}/api/generate", base))).unwrap();

        let err = client.complete("hi").await.unwrap_err();
        assert!(matches!(err, MeshError::AiService(ref m) if m.contains("oom")));
    }

    #[tokio::test]
    async fn test_health_check_lists_models() {
        let (base, server) =
            serve_once("200 OK", r#"{"models":[{"name":"llama3.1:latest"},{"name":"mistral"}]}"#).await;
        let client = OllamaClient::new(&config(format!("{}/api/generate", base))).unwrap();

        let models = client.health_check().await.unwrap();
        assert_eq!(models, vec!["llama3.1:latest", "mistral"]);
        assert!(server.await.unwrap().starts_with("GET /api/tags"));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = OllamaClient::new(&config(format!("http://{}/api/generate", addr))).unwrap();
        let err = client.complete("hi").await.unwrap_err();
        assert!(matches!(err, MeshError::AiUnavailable { .. }));
    }
}
