//! Local model execution boundary.
//!
//! The coordinator and network manager never run a forward pass themselves;
//! they call through [`InferenceExecutor`]. [`MockExecutor`] stands in for a
//! real backend: deterministic by default so replicated runs agree, with
//! builders to inject latency, fixed results, or failures in tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::errors::{P2pError, Result};

/// Executes one model (or one shard of it) on one input.
#[async_trait]
pub trait InferenceExecutor: Send + Sync {
    async fn execute(
        &self,
        model_id: &str,
        shard_id: Option<&str>,
        input: &Value,
    ) -> Result<Value>;
}

/// Scripted executor used by the simulation binary and tests.
pub struct MockExecutor {
    latency: Duration,
    fixed_result: Option<Value>,
    failure: Option<String>,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            fixed_result: None,
            failure: None,
        }
    }
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Always answer with this value instead of the derived one.
    pub fn with_result(mut self, result: Value) -> Self {
        self.fixed_result = Some(result);
        self
    }

    /// Always fail with this message.
    pub fn with_failure(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    /// Deterministic pseudo-output: a score in [0, 1) derived by hashing the
    /// model id and input, so every honest replica produces the same answer.
    fn derive(model_id: &str, shard_id: Option<&str>, input: &Value) -> Value {
        let mut hasher = Sha256::new();
        hasher.update(model_id.as_bytes());
        hasher.update(input.to_string().as_bytes());
        let digest = hasher.finalize();

        let mut buf = [0u8; 8];
        buf.copy_from_slice(&digest[..8]);
        let score = (u64::from_be_bytes(buf) as f64) / (u64::MAX as f64);

        json!({
            "model": model_id,
            "shard": shard_id,
            "output": score,
        })
    }
}

#[async_trait]
impl InferenceExecutor for MockExecutor {
    async fn execute(
        &self,
        model_id: &str,
        shard_id: Option<&str>,
        input: &Value,
    ) -> Result<Value> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(reason) = &self.failure {
            return Err(P2pError::Transport(reason.clone()));
        }

        if let Some(result) = &self.fixed_result {
            return Ok(result.clone());
        }

        Ok(Self::derive(model_id, shard_id, input))
    }
}
