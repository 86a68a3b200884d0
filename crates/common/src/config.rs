//! Configuration structures for Lockstep
//!
//! One `LockstepConfig` parameterizes every run: model identifier, task list,
//! output format and the synchronization options. Configurations are loaded
//! from YAML files and can be overridden by environment variables.

use crate::error::{LockstepError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "LOCKSTEP_CONFIG";

/// Config file used when `LOCKSTEP_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "configs/run.yaml";

/// Largest bandwidth probe payload; keeps a probe frame under the wire limit
pub const MAX_PROBE_MB: usize = 128;

/// Top-level configuration for a replicated run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockstepConfig {
    /// Opaque model identifier handed to the inference engine
    #[serde(default = "default_model_id")]
    pub model_id: String,

    /// Ordered task list; rank r works on `prompts[r % len]`
    #[serde(default = "default_prompts")]
    pub prompts: Vec<String>,

    /// Token budget per generation
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Generations per rank
    #[serde(default = "default_runs_per_rank")]
    pub runs_per_rank: u32,

    /// Barrier after every generation run
    #[serde(default)]
    pub sync_between_runs: bool,

    /// Report format
    #[serde(default)]
    pub output: OutputFormat,

    /// Gate every barrier on a group-wide failure count
    #[serde(default = "default_true")]
    pub health_checks: bool,

    /// Run a collective self-test right after the group forms
    #[serde(default = "default_true")]
    pub verify_fabric: bool,

    /// Per-rank payload for the bandwidth probe, in MB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_probe_mb: Option<usize>,

    /// Bound on any single collective wait (unset = wait forever)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collective_timeout_secs: Option<u64>,

    /// Bound on waiting for every rank to join
    #[serde(default = "default_formation_timeout")]
    pub formation_timeout_secs: u64,

    /// Inference engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Reduction hub settings
    #[serde(default)]
    pub hub: HubConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// How per-rank results are printed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable blocks
    #[default]
    Text,

    /// `PERF|RANK_..|HOST_..|...` lines
    Perf,

    /// One JSON object per rank
    Json,
}

impl FromStr for OutputFormat {
    type Err = LockstepError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "perf" => Ok(OutputFormat::Perf),
            "json" => Ok(OutputFormat::Json),
            other => Err(LockstepError::config(format!("Unknown output format: {}", other))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputFormat::Text => "text",
            OutputFormat::Perf => "perf",
            OutputFormat::Json => "json",
        };
        f.write_str(name)
    }
}

/// Inference engine selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Deterministic in-process engine
    #[default]
    Synthetic,
}

/// Inference engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub kind: EngineKind,

    /// Simulated model load latency
    #[serde(default)]
    pub load_delay_ms: u64,

    /// Simulated per-token latency
    #[serde(default)]
    pub token_delay_us: u64,

    /// Size of the synthetic weight buffer
    #[serde(default = "default_weight_bytes")]
    pub weight_bytes: u64,

    /// Ranks whose model load fails
    #[serde(default)]
    pub fail_load_on_ranks: Vec<usize>,

    /// Ranks whose generation fails
    #[serde(default)]
    pub fail_generate_on_ranks: Vec<usize>,
}

/// Reduction hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Server binding address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_hub_port")]
    pub port: u16,

    /// Group size the hub insists on (unset = first joiner decides)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<usize>,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Dump Prometheus metrics at the end of a run
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
}

/// Default value functions
fn default_model_id() -> String {
    "mlx-community/Llama-3.2-1B-Instruct-4bit".to_string()
}

fn default_prompts() -> Vec<String> {
    [
        "The future of artificial intelligence is",
        "Machine learning helps us to",
        "The most important technology today is",
        "Distributed computing enables",
        "Apple Silicon chips are",
        "The best programming language is",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

fn default_max_tokens() -> u32 {
    100
}

fn default_runs_per_rank() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_formation_timeout() -> u64 {
    60
}

fn default_weight_bytes() -> u64 {
    8 * 1024 * 1024
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_hub_port() -> u16 {
    50151
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            load_delay_ms: 0,
            token_delay_us: 0,
            weight_bytes: default_weight_bytes(),
            fail_load_on_ranks: Vec::new(),
            fail_generate_on_ranks: Vec::new(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_hub_port(),
            expected_size: None,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: true,
        }
    }
}

impl Default for LockstepConfig {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
            prompts: default_prompts(),
            max_tokens: default_max_tokens(),
            runs_per_rank: default_runs_per_rank(),
            sync_between_runs: false,
            output: OutputFormat::default(),
            health_checks: true,
            verify_fabric: true,
            bandwidth_probe_mb: None,
            collective_timeout_secs: None,
            formation_timeout_secs: default_formation_timeout(),
            engine: EngineConfig::default(),
            hub: HubConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl LockstepConfig {
    /// Load configuration from a YAML file, then apply env overrides
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| LockstepError::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let mut config = Self::from_yaml_str(&content)
            .map_err(|e| LockstepError::Config(format!("Failed to parse config file {}: {}", path.display(), e)))?;

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML text without validating it
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| LockstepError::Config(e.to_string()))
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config the way the binaries do
    ///
    /// An explicit `LOCKSTEP_CONFIG` must exist; the default path is optional.
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(path),
            Err(_) if std::path::Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(DEFAULT_CONFIG_PATH)
            }
            Err(_) => Self::from_env(),
        }
    }

    /// Apply `LOCKSTEP_*` overrides from a key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model_id) = lookup("LOCKSTEP_MODEL_ID") {
            self.model_id = model_id;
        }
        if let Some(output) = lookup("LOCKSTEP_OUTPUT") {
            self.output = output.parse()?;
        }
        if let Some(max_tokens) = lookup("LOCKSTEP_MAX_TOKENS") {
            self.max_tokens = max_tokens
                .trim()
                .parse()
                .map_err(|_| LockstepError::config(format!("Invalid LOCKSTEP_MAX_TOKENS: {}", max_tokens)))?;
        }
        if let Some(flag) = lookup("LOCKSTEP_HEALTH_CHECKS") {
            self.health_checks = parse_flag(&flag)
                .ok_or_else(|| LockstepError::config(format!("Invalid LOCKSTEP_HEALTH_CHECKS: {}", flag)))?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.prompts.is_empty() {
            return Err(LockstepError::config("Task list must contain at least one prompt"));
        }
        if self.model_id.trim().is_empty() {
            return Err(LockstepError::config("Model identifier must not be empty"));
        }
        if self.max_tokens == 0 {
            return Err(LockstepError::config("max_tokens must be positive"));
        }
        if self.runs_per_rank == 0 {
            return Err(LockstepError::config("runs_per_rank must be positive"));
        }
        if self.formation_timeout_secs == 0 {
            return Err(LockstepError::config("formation_timeout_secs must be positive"));
        }
        if self.collective_timeout_secs == Some(0) {
            return Err(LockstepError::config("collective_timeout_secs must be positive when set"));
        }
        if let Some(mb) = self.bandwidth_probe_mb {
            if mb == 0 || mb > MAX_PROBE_MB {
                return Err(LockstepError::config(format!(
                    "bandwidth_probe_mb must be between 1 and {}",
                    MAX_PROBE_MB
                )));
            }
        }
        if self.hub.expected_size == Some(0) {
            return Err(LockstepError::config("hub.expected_size must be positive when set"));
        }
        Ok(())
    }

    /// Get the collective wait bound as Duration
    pub fn collective_timeout(&self) -> Option<Duration> {
        self.collective_timeout_secs.map(Duration::from_secs)
    }

    /// Get the group formation bound as Duration
    pub fn formation_timeout(&self) -> Duration {
        Duration::from_secs(self.formation_timeout_secs)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
