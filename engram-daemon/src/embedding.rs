//! HTTP embedding-service client
//!
//! Thin provider over the configured endpoint, rate-limited so chunk
//! backfill cannot starve interactive traffic. Failures surface as errors;
//! retrieval treats them as "no semantic pass this time".

use async_trait::async_trait;
use engram_core::{EmbeddingProvider, EngramError, EngramResult};
use governor::{Quota, RateLimiter, clock::DefaultClock, state::{InMemoryState, NotKeyed}};
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::Duration;

/// Requests per second against the embedding service.
const EMBED_RATE_PER_SECOND: u32 = 20;

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// Embedding provider backed by an HTTP service.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    model_id: String,
    dimensions: usize,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl HttpEmbeddingProvider {
    pub fn new(endpoint: impl Into<String>, dimensions: usize) -> EngramResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EngramError::Fatal {
                reason: format!("embedding client: {}", e),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model_id: "engram-embedding-service".to_string(),
            dimensions,
            limiter: RateLimiter::direct(Quota::per_second(
                NonZeroU32::new(EMBED_RATE_PER_SECOND).expect("non-zero rate"),
            )),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> EngramResult<Vec<f32>> {
        self.limiter.until_ready().await;
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "input": text }))
            .send()
            .await
            .map_err(|e| EngramError::Fatal {
                reason: format!("embedding request: {}", e),
            })?;
        if !response.status().is_success() {
            return Err(EngramError::Fatal {
                reason: format!("embedding service returned {}", response.status()),
            });
        }
        let body: EmbedResponse = response.json().await.map_err(|e| EngramError::Fatal {
            reason: format!("embedding response: {}", e),
        })?;
        if body.embedding.len() != self.dimensions {
            return Err(EngramError::Fatal {
                reason: format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.dimensions,
                    body.embedding.len()
                ),
            });
        }
        Ok(body.embedding)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
