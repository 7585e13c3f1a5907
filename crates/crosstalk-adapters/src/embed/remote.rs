//! Remote embedding backend (a text-embeddings-inference-style HTTP server).
//!
//! Grounded on the original's `tei_embedder_consumer.py`: POST `{"inputs":
//! text}`, accept both a flat `[float]` response and a nested `[[float]]`
//! response (as TEI itself returns for single-input requests depending on
//! server version), L2-normalize, and enforce the declared dimension.
//! `generate_embedding`'s fallback-to-stub-on-failure behavior is
//! reproduced via an optional embedded [`StubEmbedder`].

use std::time::Duration;

use crosstalk_ports::{EmbedError, Embedder};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use super::stub::StubEmbedder;

#[derive(Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a str,
}

/// Calls a remote embedding model server over HTTP.
pub struct RemoteEmbedder {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    model_version: String,
    dim: usize,
    fallback: Option<StubEmbedder>,
}

impl RemoteEmbedder {
    /// # Errors
    /// Returns an error if the underlying `reqwest::Client` cannot be built.
    pub fn new(
        url: String,
        timeout: Duration,
        model_version: String,
        dim: usize,
        fallback_to_stub: bool,
    ) -> Result<Self, EmbedError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbedError::Request {
                message: e.to_string(),
            })?;

        let fallback = fallback_to_stub.then(|| StubEmbedder::new(model_version.clone(), dim));

        Ok(Self {
            client,
            url,
            timeout,
            model_version,
            dim,
            fallback,
        })
    }

    async fn call_remote(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let response = self
            .client
            .post(&self.url)
            .json(&EmbedRequest { inputs: text })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EmbedError::Timeout {
                        millis: self.timeout.as_millis() as u64,
                    }
                } else {
                    EmbedError::Request {
                        message: e.to_string(),
                    }
                }
            })?;

        if !response.status().is_success() {
            return Err(EmbedError::Request {
                message: format!("remote embedder returned status {}", response.status()),
            });
        }

        let body: Value = response.json().await.map_err(|e| EmbedError::Request {
            message: format!("failed to parse remote embedder response: {e}"),
        })?;

        parse_embedding_shape(&body)
    }
}

/// Accept both `[f32; D]` and `[[f32; D]]` response shapes.
fn parse_embedding_shape(body: &Value) -> Result<Vec<f32>, EmbedError> {
    let as_flat = body
        .as_array()
        .and_then(|arr| arr.iter().map(Value::as_f64).collect::<Option<Vec<_>>>());
    if let Some(flat) = as_flat {
        return Ok(flat.into_iter().map(|x| x as f32).collect());
    }

    let as_nested = body.as_array().and_then(|arr| arr.first()).and_then(|row| {
        row.as_array()
            .and_then(|arr| arr.iter().map(Value::as_f64).collect::<Option<Vec<_>>>())
    });
    if let Some(nested) = as_nested {
        return Ok(nested.into_iter().map(|x| x as f32).collect());
    }

    Err(EmbedError::Request {
        message: "remote embedder response was neither a flat nor nested float array".to_string(),
    })
}

impl Embedder for RemoteEmbedder {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(
        &self,
        org_id: &str,
        message_id: Uuid,
        text: &str,
    ) -> Result<Vec<f32>, EmbedError> {
        match self.call_remote(text).await {
            Ok(mut embedding) => {
                if embedding.len() != self.dim {
                    return Err(EmbedError::DimensionMismatch {
                        expected: self.dim,
                        actual: embedding.len(),
                    });
                }
                crosstalk_domain::l2_normalize(&mut embedding);
                Ok(embedding)
            }
            Err(e) => match &self.fallback {
                Some(stub) => {
                    warn!(error = %e, "remote embedder failed, falling back to stub");
                    stub.embed(org_id, message_id, text).await
                }
                None => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_flat_response_shape() {
        let body = json!([0.1, 0.2, 0.3]);
        let v = parse_embedding_shape(&body).unwrap();
        assert_eq!(v.len(), 3);
    }

    #[test]
    fn parses_nested_response_shape() {
        let body = json!([[0.1, 0.2, 0.3]]);
        let v = parse_embedding_shape(&body).unwrap();
        assert_eq!(v.len(), 3);
    }

    #[test]
    fn rejects_malformed_response_shape() {
        let body = json!({"error": "bad request"});
        assert!(parse_embedding_shape(&body).is_err());
    }
}
