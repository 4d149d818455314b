//! Decode loop
//!
//! One call = one fresh context: tokenize, decode the prompt in a single
//! batch, then sample and decode one token at a time until a stop condition.

use thiserror::Error;

use crate::engine::{
    ContextParams, DecodeBatch, DecodeContext, EngineError, InferenceEngine, Token, Vocabulary,
};
use crate::generation::history::TokenHistory;
use crate::generation::sampler::Sampler;
use crate::generation::sanitize::sanitize_utf8;
use crate::generation::stop::StopMarkers;

/// Errors that abort a generation call.
///
/// Display strings are shown verbatim by the caller-facing surface.
#[derive(Debug, Error, Clone)]
pub enum GenerationError {
    #[error("Model not loaded")]
    NotLoaded,

    #[error("Context re-init failed")]
    ContextInit(#[source] EngineError),

    #[error("Tokenization failed")]
    Tokenization(#[source] EngineError),

    #[error("Prompt produced no tokens")]
    EmptyPrompt,

    #[error("Decode failed")]
    PromptDecode(#[source] EngineError),

    #[error("{0}")]
    Internal(String),
}

/// Why the decode loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The model emitted an end-of-generation token
    EndOfGeneration,
    /// A stop marker appeared in the output; holds the marker text
    StopMarker(String),
    /// The step cap was reached
    MaxTokens,
    /// The context window is full
    ContextFull,
    /// The engine had no logits for the last position
    LogitsUnavailable,
    /// A single-token decode failed; output so far was kept
    DecodeFailed,
}

/// Result of a finished generation call
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub prompt_tokens: usize,
    pub tokens_generated: usize,
    pub stop_reason: StopReason,
}

/// Knobs of a single generation call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub context: ContextParams,
    pub repeat_window: usize,
    pub repeat_penalty: f32,
    pub max_new_tokens: usize,
    /// Token text longer than `token_text_capacity - 1` bytes is cut
    pub token_text_capacity: usize,
    pub tokenize_headroom: usize,
    pub stop_markers: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        crate::config::DriverConfig::default().generation()
    }
}

/// Tokenizes `prompt` with special tokens enabled.
///
/// Starts with a buffer of `prompt.len() + headroom` slots. If the engine
/// reports it needs more, the buffer is resized once to the reported size.
pub fn tokenize_prompt<V: Vocabulary + ?Sized>(
    vocab: &V,
    prompt: &str,
    headroom: usize,
) -> Result<Vec<Token>, EngineError> {
    let mut tokens = vec![Token::default(); prompt.len() + headroom];
    let mut n = vocab.tokenize(prompt, &mut tokens, true, true)?;

    if n < 0 {
        let required = n.unsigned_abs() as usize;
        tracing::debug!(
            "Token buffer too small ({} slots), retrying with {}",
            tokens.len(),
            required
        );
        tokens.resize(required, Token::default());
        n = vocab.tokenize(prompt, &mut tokens, true, true)?;
        if n < 0 {
            return Err(EngineError::Tokenization(format!(
                "engine asked for {} slots after resizing to {}",
                n.unsigned_abs(),
                required
            )));
        }
    }

    tokens.truncate(n as usize);
    Ok(tokens)
}

/// Raw bytes of `token`, cut to `capacity - 1` bytes when longer.
fn token_bytes<V: Vocabulary + ?Sized>(vocab: &V, token: Token, capacity: usize) -> Vec<u8> {
    let mut bytes = match vocab.token_to_bytes(token, true) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("Skipping token text: {}", e);
            return Vec::new();
        }
    };

    let limit = capacity.saturating_sub(1);
    if bytes.len() > limit {
        tracing::warn!(
            "Token {} text is {} bytes, truncating to {}",
            token,
            bytes.len(),
            limit
        );
        bytes.truncate(limit);
    }
    bytes
}

/// Runs one complete generation against `model` in a fresh context.
pub fn run_generation<E: InferenceEngine>(
    engine: &E,
    model: &E::Model,
    prompt: &str,
    config: &GenerationConfig,
) -> Result<Generation, GenerationError> {
    // A new context per call so no KV state leaks from the previous turn.
    let mut ctx = engine
        .new_context(model, &config.context)
        .map_err(GenerationError::ContextInit)?;

    let prompt_tokens = tokenize_prompt(model, prompt, config.tokenize_headroom)
        .map_err(GenerationError::Tokenization)?;
    if prompt_tokens.is_empty() {
        return Err(GenerationError::EmptyPrompt);
    }
    tracing::debug!(
        "Tokenized prompt into {} tokens (vocab size {})",
        prompt_tokens.len(),
        model.vocab_size()
    );

    let mut history = TokenHistory::new(config.repeat_window);
    history.extend(prompt_tokens.iter().copied());

    let batch = DecodeBatch::prompt(&prompt_tokens);
    ctx.decode(&batch).map_err(GenerationError::PromptDecode)?;

    let sampler = Sampler::new(config.repeat_penalty);
    let stops = StopMarkers::new(config.stop_markers.iter().cloned());
    let n_ctx = config.context.n_ctx as usize;

    let mut logits_row = batch.last_row().unwrap_or(0);
    let mut n_past = prompt_tokens.len();
    let mut output: Vec<u8> = Vec::new();
    let mut scores: Vec<f32> = Vec::new();
    let mut generated = 0;
    let mut stop_reason = StopReason::MaxTokens;

    for _ in 0..config.max_new_tokens {
        let Some(logits) = ctx.logits(logits_row) else {
            stop_reason = StopReason::LogitsUnavailable;
            break;
        };
        scores.clear();
        scores.extend_from_slice(logits);

        let Some(token) = sampler.sample(&mut scores, &history) else {
            stop_reason = StopReason::LogitsUnavailable;
            break;
        };

        if model.is_end_of_generation(token) {
            stop_reason = StopReason::EndOfGeneration;
            break;
        }

        let piece = token_bytes(model, token, config.token_text_capacity);
        output.extend_from_slice(&piece);
        generated += 1;

        if let Some(hit) = stops.truncate(&mut output) {
            stop_reason = StopReason::StopMarker(stops.markers()[hit.marker].clone());
            break;
        }

        history.push(token);

        if n_past >= n_ctx {
            stop_reason = StopReason::ContextFull;
            break;
        }
        if let Err(e) = ctx.decode(&DecodeBatch::single(token, n_past as i32)) {
            tracing::warn!("Stopping early after {} tokens: {}", generated, e);
            stop_reason = StopReason::DecodeFailed;
            break;
        }
        logits_row = 0;
        n_past += 1;
    }

    tracing::debug!(
        "Generation finished after {} tokens: {:?}",
        generated,
        stop_reason
    );

    Ok(Generation {
        text: sanitize_utf8(&output),
        prompt_tokens: prompt_tokens.len(),
        tokens_generated: generated,
        stop_reason,
    })
}
