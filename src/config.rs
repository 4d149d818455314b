//! Driver configuration
//!
//! All tunables of the driver live in [`DriverConfig`], persisted as JSON in
//! the platform data directory.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::engine::{ContextParams, ModelParams};
use crate::generation::GenerationConfig;

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access data directory: {0}")]
    DataDir(String),
    #[error("Failed to read or write config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Role-turn markers and section delimiters that end a reply
pub fn default_stop_markers() -> Vec<String> {
    [
        "User:",
        "User",
        "USER:",
        "USER",
        "Assistant:",
        "Assistant",
        "ASSISTANT:",
        "ASSISTANT",
        "###",
        "<|start_header_id|>",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Driver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Context window in tokens
    pub context_size: u32,
    /// Threads for single-token decoding
    pub threads: i32,
    /// Threads for prompt decoding
    pub threads_batch: i32,
    /// Number of layers offloaded to GPU (0 = CPU only)
    pub gpu_layers: u32,
    /// How many recent tokens the repetition penalty looks at
    pub repeat_window: usize,
    /// Divisor (positive logits) / multiplier (non-positive logits) for repeated tokens
    pub repeat_penalty: f32,
    /// Maximum number of tokens generated per call
    pub max_new_tokens: usize,
    /// Bytes available for one token's text, including a terminator slot
    pub token_text_capacity: usize,
    /// Extra token slots on top of the prompt byte length for the first tokenize pass
    pub tokenize_headroom: usize,
    /// Ordered stop markers; the first one present in the output wins
    pub stop_markers: Vec<String>,
    /// Template the CLI wraps user input in; `{prompt}` is replaced
    pub prompt_template: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            context_size: 2048,
            threads: 4,
            threads_batch: 4,
            gpu_layers: 0,
            repeat_window: 64,
            repeat_penalty: 1.2,
            max_new_tokens: 128,
            token_text_capacity: 1024,
            tokenize_headroom: 16,
            stop_markers: default_stop_markers(),
            prompt_template: "User: {prompt}\nAssistant:".to_string(),
        }
    }
}

impl DriverConfig {
    /// Validate settings values
    ///
    /// Resets out-of-range values to their defaults or nearest legal value.
    pub fn validate(&mut self) {
        let defaults = Self::default();

        if self.context_size == 0 {
            self.context_size = defaults.context_size;
        }
        if self.threads < 1 {
            self.threads = defaults.threads;
        }
        if self.threads_batch < 1 {
            self.threads_batch = defaults.threads_batch;
        }

        // A penalty below 1.0 would reward repetition
        if !self.repeat_penalty.is_finite() || self.repeat_penalty < 1.0 {
            self.repeat_penalty = 1.0;
        }

        if self.max_new_tokens == 0 {
            self.max_new_tokens = defaults.max_new_tokens;
        }

        self.token_text_capacity = self.token_text_capacity.max(2);
        self.stop_markers.retain(|m| !m.is_empty());

        if !self.prompt_template.contains("{prompt}") {
            tracing::warn!("prompt_template has no {{prompt}} placeholder, using default");
            self.prompt_template = defaults.prompt_template;
        }
    }

    /// Renders user input through `prompt_template`.
    pub fn render_prompt(&self, input: &str) -> String {
        self.prompt_template.replace("{prompt}", input)
    }

    pub fn model_params(&self) -> ModelParams {
        ModelParams {
            gpu_layers: self.gpu_layers,
        }
    }

    pub fn context_params(&self) -> ContextParams {
        ContextParams {
            n_ctx: self.context_size,
            n_threads: self.threads,
            n_threads_batch: self.threads_batch,
        }
    }

    pub fn generation(&self) -> GenerationConfig {
        GenerationConfig {
            context: self.context_params(),
            repeat_window: self.repeat_window,
            repeat_penalty: self.repeat_penalty,
            max_new_tokens: self.max_new_tokens,
            token_text_capacity: self.token_text_capacity,
            tokenize_headroom: self.tokenize_headroom,
            stop_markers: self.stop_markers.clone(),
        }
    }
}

/// Get the application data directory
///
/// - Windows: `C:\Users\{user}\AppData\Roaming\pocketllm\pocketllm\data`
/// - macOS: `/Users/{user}/Library/Application Support/com.pocketllm.pocketllm`
/// - Linux: `/home/{user}/.local/share/pocketllm`
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    directories::ProjectDirs::from("com", "pocketllm", "pocketllm")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| ConfigError::DataDir("Could not determine data directory".to_string()))
}

/// Default location of the config file
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    Ok(data_dir()?.join("config.json"))
}

/// Load config from `path`
///
/// Returns defaults if the file doesn't exist or is corrupted
pub fn load_config(path: &Path) -> DriverConfig {
    match load_config_internal(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            DriverConfig::default()
        }
    }
}

fn load_config_internal(path: &Path) -> Result<DriverConfig, ConfigError> {
    if !path.exists() {
        tracing::info!("Config file not found at {}, using defaults", path.display());
        return Ok(DriverConfig::default());
    }

    let json = fs::read_to_string(path)?;
    let mut config: DriverConfig = serde_json::from_str(&json)?;
    config.validate();

    tracing::debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Save config to `path`, creating parent directories as needed
pub fn save_config(path: &Path, config: &DriverConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;

    tracing::debug!("Saved config to {}", path.display());
    Ok(())
}
