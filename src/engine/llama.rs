//! llama.cpp engine
//!
//! Implements the engine traits on top of `llama-cpp-2`. None of these types
//! are `Send`; run them on a single thread (see [`crate::service`]).

use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;

use crate::engine::gguf::validate_gguf;
use crate::engine::{
    ContextParams, DecodeBatch, DecodeContext, EngineError, InferenceEngine, ModelParams, Token,
    Vocabulary,
};

/// Owns the llama.cpp backend. Freed on drop or via [`InferenceEngine::free_backend`].
#[derive(Default)]
pub struct LlamaCppEngine {
    backend: Option<LlamaBackend>,
}

impl LlamaCppEngine {
    pub fn new() -> Self {
        Self { backend: None }
    }

    pub fn is_initialized(&self) -> bool {
        self.backend.is_some()
    }

    fn backend(&self) -> Result<&LlamaBackend, EngineError> {
        self.backend.as_ref().ok_or(EngineError::BackendNotInitialized)
    }
}

/// Loaded weights and vocabulary
pub struct LlamaCppModel {
    model: LlamaModel,
}

/// Decode state bound to a [`LlamaCppModel`]
pub struct LlamaCppContext<'m> {
    ctx: LlamaContext<'m>,
    batch: LlamaBatch,
    /// Rows of the last decoded batch that produced logits
    logit_rows: Vec<usize>,
}

impl InferenceEngine for LlamaCppEngine {
    type Model = LlamaCppModel;
    type Context<'m> = LlamaCppContext<'m>;

    fn init_backend(&mut self) -> Result<(), EngineError> {
        if self.backend.is_some() {
            return Ok(());
        }
        let backend =
            LlamaBackend::init().map_err(|e| EngineError::BackendInit(e.to_string()))?;
        self.backend = Some(backend);
        tracing::info!("llama.cpp backend initialized");
        Ok(())
    }

    fn free_backend(&mut self) {
        if self.backend.take().is_some() {
            tracing::info!("llama.cpp backend freed");
        }
    }

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<LlamaCppModel, EngineError> {
        let backend = self.backend()?;

        let header = validate_gguf(path)?;
        tracing::debug!(
            "GGUF v{} header ok: {} tensors, {} metadata entries",
            header.version,
            header.tensor_count,
            header.metadata_kv_count
        );

        // llama.cpp maps weights into memory by default
        let model_params = LlamaModelParams::default().with_n_gpu_layers(params.gpu_layers);
        let model = LlamaModel::load_from_file(backend, path, &model_params)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

        tracing::info!(
            "Model loaded: {} ({} params, {} vocab, {} ctx trained)",
            path.display(),
            model.n_params(),
            model.n_vocab(),
            model.n_ctx_train()
        );
        Ok(LlamaCppModel { model })
    }

    fn new_context<'m>(
        &'m self,
        model: &'m LlamaCppModel,
        params: &ContextParams,
    ) -> Result<LlamaCppContext<'m>, EngineError> {
        let backend = self.backend()?;
        let n_ctx = NonZeroU32::new(params.n_ctx)
            .ok_or_else(|| EngineError::ContextCreate("context size must be non-zero".into()))?;

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(params.n_ctx)
            .with_n_threads(params.n_threads)
            .with_n_threads_batch(params.n_threads_batch);

        let ctx = model
            .model
            .new_context(backend, ctx_params)
            .map_err(|e| EngineError::ContextCreate(e.to_string()))?;

        Ok(LlamaCppContext {
            ctx,
            batch: LlamaBatch::new(params.n_ctx as usize, 1),
            logit_rows: Vec::new(),
        })
    }
}

impl Vocabulary for LlamaCppModel {
    // llama-cpp-2 always parses special/control tokens in the input text.
    fn tokenize(
        &self,
        text: &str,
        buf: &mut [Token],
        add_special: bool,
        _parse_special: bool,
    ) -> Result<i32, EngineError> {
        let add_bos = if add_special {
            AddBos::Always
        } else {
            AddBos::Never
        };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;

        let n = i32::try_from(tokens.len())
            .map_err(|_| EngineError::Tokenization("prompt produced too many tokens".into()))?;
        if tokens.len() > buf.len() {
            return Ok(-n);
        }

        for (slot, token) in buf.iter_mut().zip(&tokens) {
            *slot = Token(token.0);
        }
        Ok(n)
    }

    fn token_to_bytes(&self, token: Token, special: bool) -> Result<Vec<u8>, EngineError> {
        let special = if special {
            Special::Tokenize
        } else {
            Special::Plaintext
        };
        self.model
            .token_to_bytes(LlamaToken(token.0), special)
            .map_err(|e| EngineError::Detokenize {
                token: token.0,
                reason: e.to_string(),
            })
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        self.model.is_eog_token(LlamaToken(token.0))
    }

    fn vocab_size(&self) -> usize {
        usize::try_from(self.model.n_vocab()).unwrap_or(0)
    }
}

impl DecodeContext for LlamaCppContext<'_> {
    fn decode(&mut self, batch: &DecodeBatch) -> Result<(), EngineError> {
        self.batch.clear();
        self.logit_rows.clear();

        for (row, entry) in batch.entries().iter().enumerate() {
            self.batch
                .add(LlamaToken(entry.token.0), entry.pos, &[entry.seq_id], entry.logits)
                .map_err(|e| EngineError::Decode(format!("failed to add token to batch: {e}")))?;
            if entry.logits {
                self.logit_rows.push(row);
            }
        }

        if let Err(e) = self.ctx.decode(&mut self.batch) {
            self.logit_rows.clear();
            return Err(EngineError::Decode(e.to_string()));
        }
        Ok(())
    }

    fn logits(&self, row: usize) -> Option<&[f32]> {
        if !self.logit_rows.contains(&row) {
            return None;
        }
        let row = i32::try_from(row).ok()?;
        Some(self.ctx.get_logits_ith(row))
    }
}
