//! OpenAI-compatible embedding client.
//!
//! One `POST {endpoint}/embeddings` call per batch. The response order is
//! restored from the per-item `index` field and all vectors are required to
//! share one length; anything else surfaces as an upstream error.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

use kbase_core::config::EmbeddingConfig;
use kbase_core::error::{KbError, Result};
use kbase_core::traits::Embedder;

pub struct OpenAiEmbeddingClient {
    endpoint: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiEmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| KbError::Upstream(format!("embedding client init: {e}")))?;
        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            client,
        })
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            req
        } else {
            req.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }
}

/// Pull the vectors out of an embeddings response body, restoring request
/// order from the `index` field.
fn parse_embeddings(body: &Value, expected: usize) -> Result<Vec<Vec<f64>>> {
    let data = body["data"]
        .as_array()
        .ok_or_else(|| KbError::Upstream("no data array in embeddings response".into()))?;
    if data.len() != expected {
        return Err(KbError::Upstream(format!(
            "embeddings response has {} items, expected {}",
            data.len(),
            expected
        )));
    }

    let mut vectors: Vec<Option<Vec<f64>>> = vec![None; expected];
    for item in data {
        let idx = item["index"].as_u64().unwrap_or(0) as usize;
        let vec: Vec<f64> = item["embedding"]
            .as_array()
            .ok_or_else(|| KbError::Upstream("embedding item is not an array".into()))?
            .iter()
            .filter_map(|v| v.as_f64())
            .collect();
        if idx >= expected {
            return Err(KbError::Upstream(format!("embedding index {idx} out of range")));
        }
        vectors[idx] = Some(vec);
    }

    let vectors: Vec<Vec<f64>> = vectors
        .into_iter()
        .map(|v| v.ok_or_else(|| KbError::Upstream("missing embedding index in response".into())))
        .collect::<Result<_>>()?;

    // All vectors in one batch must share a dimension.
    if let Some(first) = vectors.first() {
        let dim = first.len();
        if dim == 0 || vectors.iter().any(|v| v.len() != dim) {
            return Err(KbError::Upstream("inconsistent embedding dimensions in response".into()));
        }
    }
    Ok(vectors)
}

#[async_trait]
impl Embedder for OpenAiEmbeddingClient {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f64>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.endpoint);
        let body = json!({
            "model": self.model,
            "input": inputs,
        });
        let req = self.apply_auth(self.client.post(&url).json(&body));

        let resp = req
            .send()
            .await
            .map_err(|e| KbError::Upstream(format!("embedding request failed ({url}): {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(KbError::Upstream(format!("embedding API error {status}: {text}")));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| KbError::Upstream(format!("embedding response parse: {e}")))?;
        parse_embeddings(&json, inputs.len())
    }
}
