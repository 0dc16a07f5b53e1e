//! OpenAI-compatible chat client: one-shot generation and SSE streaming.
//!
//! Streaming reads the response body incrementally and forwards each
//! `data:` delta on an mpsc channel. `data: [DONE]` (or the transport
//! ending) closes the channel; a mid-stream transport failure is delivered
//! as one final `Err` item.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use kbase_core::config::LlmConfig;
use kbase_core::error::{KbError, Result};
use kbase_core::traits::ChatModel;
use kbase_core::types::{ConversationTurn, GenerateParams, ProviderResponse, Usage};

pub struct OpenAiChatClient {
    endpoint: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiChatClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            req
        } else {
            req.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }

    fn request_body(
        &self,
        messages: &[ConversationTurn],
        params: &GenerateParams,
        stream: bool,
    ) -> Value {
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "stream": stream,
        })
    }
}

/// Extract the content delta from one SSE line of a streaming chat
/// response. Returns `None` for blank lines, non-data lines and deltas
/// without content.
fn parse_stream_line(line: &str) -> Option<String> {
    let data = line.strip_prefix("data: ")?;
    if data == "[DONE]" {
        return None;
    }
    let json: Value = serde_json::from_str(data).ok()?;
    json["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn parse_usage(body: &Value) -> Usage {
    body["usage"]
        .as_object()
        .map(|u| Usage {
            prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            completion_tokens: u
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        })
        .unwrap_or_default()
}

#[async_trait]
impl ChatModel for OpenAiChatClient {
    async fn generate(
        &self,
        messages: &[ConversationTurn],
        params: &GenerateParams,
    ) -> Result<ProviderResponse> {
        let url = format!("{}/chat/completions", self.endpoint);
        let body = self.request_body(messages, params, false);
        let req = self.apply_auth(self.client.post(&url).json(&body));

        let resp = req
            .send()
            .await
            .map_err(|e| KbError::Upstream(format!("chat request failed ({url}): {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(KbError::Upstream(format!("chat API error {status}: {text}")));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| KbError::Upstream(format!("chat response parse: {e}")))?;

        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| KbError::Upstream("no content in chat response".into()))?
            .to_string();

        Ok(ProviderResponse { content, usage: parse_usage(&json) })
    }

    async fn stream(
        &self,
        messages: &[ConversationTurn],
        params: &GenerateParams,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let url = format!("{}/chat/completions", self.endpoint);
        let body = self.request_body(messages, params, true);
        let req = self.apply_auth(self.client.post(&url).json(&body));

        let resp = req
            .send()
            .await
            .map_err(|e| KbError::Upstream(format!("chat stream request failed ({url}): {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(KbError::Upstream(format!("chat API error {status}: {text}")));
        }

        let (tx, rx) = mpsc::channel::<Result<String>>(16);
        let mut stream = resp.bytes_stream();

        tokio::spawn(async move {
            let mut buf = String::new();
            while let Some(next) = stream.next().await {
                let bytes = match next {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(KbError::Upstream(format!("chat stream read: {e}"))))
                            .await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&bytes));

                // Process complete lines; keep the partial tail buffered.
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf.drain(..=pos);
                    if line == "data: [DONE]" {
                        return; // closes the channel
                    }
                    if let Some(fragment) = parse_stream_line(&line) {
                        if tx.send(Ok(fragment)).await.is_err() {
                            // Receiver dropped: caller cancelled.
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_line_extracts_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"hel"}}]}"#;
        assert_eq!(parse_stream_line(line), Some("hel".to_string()));
    }

    #[test]
    fn stream_line_skips_done_and_noise() {
        assert_eq!(parse_stream_line("data: [DONE]"), None);
        assert_eq!(parse_stream_line(""), None);
        assert_eq!(parse_stream_line(": keep-alive"), None);
        assert_eq!(
            parse_stream_line(r#"data: {"choices":[{"delta":{}}]}"#),
            None
        );
    }

    #[test]
    fn usage_parses_with_defaults() {
        let body = json!({"usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}});
        let usage = parse_usage(&body);
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.total_tokens, 10);
        assert_eq!(parse_usage(&json!({})).total_tokens, 0);
    }
}
