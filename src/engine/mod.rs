//! Inference engine boundary
//!
//! The driver never touches weights or compute kernels directly. Everything it
//! needs from the engine goes through the three traits in this module:
//! [`InferenceEngine`] (backend and handle lifecycle), [`Vocabulary`]
//! (token <-> text) and [`DecodeContext`] (forward passes and logits).

pub mod gguf;
pub mod llama;
#[cfg(test)]
pub(crate) mod stub;

use std::path::Path;
use thiserror::Error;

pub use gguf::{validate_gguf, GgufError, GgufHeader, GGUF_MAGIC};
pub use llama::LlamaCppEngine;

/// Errors reported by an engine implementation
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Backend not initialized")]
    BackendNotInitialized,

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Failed to convert token {token} to text: {reason}")]
    Detokenize { token: i32, reason: String },
}

impl From<GgufError> for EngineError {
    fn from(e: GgufError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// A vocabulary entry id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Token(pub i32);

impl Token {
    /// Index into a logit vector, if the id is non-negative
    pub fn index(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameters for loading model weights.
///
/// Weights are always memory-mapped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelParams {
    /// Number of layers to offload to GPU (0 = CPU only)
    pub gpu_layers: u32,
}

/// Parameters for a decode context
#[derive(Debug, Clone, PartialEq)]
pub struct ContextParams {
    /// Context window in tokens
    pub n_ctx: u32,
    /// Threads used for single-token generation
    pub n_threads: i32,
    /// Threads used for prompt (batch) processing
    pub n_threads_batch: i32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_threads: 4,
            n_threads_batch: 4,
        }
    }
}

/// One row of a decode batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchEntry {
    pub token: Token,
    pub pos: i32,
    pub seq_id: i32,
    /// Whether the engine should keep logits for this row
    pub logits: bool,
}

/// Tokens submitted to a single forward pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeBatch {
    entries: Vec<BatchEntry>,
}

impl DecodeBatch {
    /// Builds the prompt batch: positions `0..n`, sequence 0, logits on the last row only.
    pub fn prompt(tokens: &[Token]) -> Self {
        let last = tokens.len().saturating_sub(1);
        let entries = tokens
            .iter()
            .enumerate()
            .map(|(i, &token)| BatchEntry {
                token,
                pos: i as i32,
                seq_id: 0,
                logits: i == last,
            })
            .collect();
        Self { entries }
    }

    /// Builds a one-token batch at `pos` with logits requested.
    pub fn single(token: Token, pos: i32) -> Self {
        Self {
            entries: vec![BatchEntry {
                token,
                pos,
                seq_id: 0,
                logits: true,
            }],
        }
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Row of the last entry, where the next-token logits live
    pub fn last_row(&self) -> Option<usize> {
        self.entries.len().checked_sub(1)
    }
}

/// Token <-> text conversion offered by a loaded model.
pub trait Vocabulary {
    /// Tokenizes `text` into `buf`.
    ///
    /// Returns the number of tokens written. When `buf` is too small nothing
    /// useful is written and the negated required length is returned instead.
    fn tokenize(
        &self,
        text: &str,
        buf: &mut [Token],
        add_special: bool,
        parse_special: bool,
    ) -> Result<i32, EngineError>;

    /// Raw bytes of a token's text. May be a fragment of a multi-byte character.
    fn token_to_bytes(&self, token: Token, special: bool) -> Result<Vec<u8>, EngineError>;

    fn is_end_of_generation(&self, token: Token) -> bool;

    fn vocab_size(&self) -> usize;
}

/// Per-generation decode state (KV cache and positions).
pub trait DecodeContext {
    fn decode(&mut self, batch: &DecodeBatch) -> Result<(), EngineError>;

    /// Logits for `row` of the most recent batch, if that row requested them.
    fn logits(&self, row: usize) -> Option<&[f32]>;
}

/// Backend and handle lifecycle of an inference engine.
///
/// Dropping a `Model` frees the weights and dropping a `Context` frees the
/// decode state. A context borrows its model, so it can never outlive it.
pub trait InferenceEngine {
    type Model: Vocabulary;
    type Context<'m>: DecodeContext
    where
        Self: 'm;

    /// Initializes backend resources. Calling it again while initialized is a no-op.
    fn init_backend(&mut self) -> Result<(), EngineError>;

    /// Releases backend resources. No-op when not initialized.
    fn free_backend(&mut self);

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Self::Model, EngineError>;

    fn new_context<'m>(
        &'m self,
        model: &'m Self::Model,
        params: &ContextParams,
    ) -> Result<Self::Context<'m>, EngineError>;
}
