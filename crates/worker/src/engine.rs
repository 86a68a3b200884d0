//! Inference engine seam
//!
//! Model loading and text generation are external to the coordination layer.
//! `InferenceEngine` is the boundary; `SyntheticEngine` is a deterministic
//! stand-in used for smoke runs and tests.

use lockstep_common::config::EngineConfig;
use lockstep_common::error::{LockstepError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Output of one generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    /// Units (tokens) produced
    pub units: u64,
}

/// Model loading and generation, owned by one rank
pub trait InferenceEngine: Send {
    /// Load the named model into this process
    fn load(&mut self, model_id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Generate a continuation of `prompt`
    fn generate(&mut self, prompt: &str, max_tokens: u32) -> impl Future<Output = Result<Generation>> + Send;

    /// Bytes currently held by the engine
    fn memory_in_use(&self) -> u64;
}

const VOCABULARY: [&str; 32] = [
    "the", "cluster", "model", "each", "node", "computes", "shared", "results", "across", "many",
    "parallel", "workers", "and", "memory", "rank", "tokens", "flow", "through", "a", "ring",
    "of", "fast", "links", "while", "replicas", "agree", "on", "order", "to", "finish", "together",
    "quickly",
];

/// Deterministic engine that fabricates text from the prompt
pub struct SyntheticEngine {
    rank: usize,
    config: EngineConfig,
    model_id: Option<String>,
    weights: Vec<u8>,
}

impl SyntheticEngine {
    pub fn new(rank: usize, config: EngineConfig) -> Self {
        Self {
            rank,
            config,
            model_id: None,
            weights: Vec::new(),
        }
    }

    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }
}

impl InferenceEngine for SyntheticEngine {
    async fn load(&mut self, model_id: &str) -> Result<()> {
        if self.config.load_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.load_delay_ms)).await;
        }

        if self.config.fail_load_on_ranks.contains(&self.rank) {
            return Err(LockstepError::external(format!(
                "model {} failed to load on rank {}",
                model_id, self.rank
            )));
        }

        self.weights = vec![1u8; self.config.weight_bytes as usize];
        self.model_id = Some(model_id.to_string());

        info!(
            rank = self.rank,
            model_id,
            bytes = self.weights.len(),
            "synthetic model loaded"
        );
        Ok(())
    }

    async fn generate(&mut self, prompt: &str, max_tokens: u32) -> Result<Generation> {
        if self.model_id.is_none() {
            return Err(LockstepError::external("generate called before a model was loaded"));
        }

        if self.config.fail_generate_on_ranks.contains(&self.rank) {
            return Err(LockstepError::external(format!(
                "generation failed on rank {}",
                self.rank
            )));
        }

        let mut state = fnv1a(prompt.as_bytes()) | 1;
        let mut words = Vec::with_capacity(max_tokens as usize);
        for _ in 0..max_tokens {
            state = xorshift(state);
            words.push(VOCABULARY[(state % VOCABULARY.len() as u64) as usize]);
        }

        if self.config.token_delay_us > 0 {
            let delay = Duration::from_micros(self.config.token_delay_us * max_tokens as u64);
            tokio::time::sleep(delay).await;
        }

        debug!(rank = self.rank, units = words.len(), "synthetic generation done");

        Ok(Generation {
            units: words.len() as u64,
            text: words.join(" "),
        })
    }

    fn memory_in_use(&self) -> u64 {
        self.weights.len() as u64
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

fn xorshift(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}
