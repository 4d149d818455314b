//! Session lifecycle
//!
//! A [`Session`] owns one engine, at most one loaded model and the
//! backend-initialized flag. Decode contexts are created per generation call
//! and borrow the model, so they are always freed before it.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use thiserror::Error;
use uuid::Uuid;

use crate::config::DriverConfig;
use crate::engine::{EngineError, InferenceEngine};
use crate::generation::{run_generation, Generation, GenerationError};

/// Errors that can occur while loading a model
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to initialize backend")]
    BackendInit(#[source] EngineError),

    #[error("Failed to load model")]
    ModelLoad(#[source] EngineError),

    #[error("Failed to create context")]
    ContextCreate(#[source] EngineError),
}

/// Load / generate / unload over a single engine.
///
/// Methods take `&mut self`: one call runs to completion before the next.
pub struct Session<E: InferenceEngine> {
    engine: E,
    config: DriverConfig,
    backend_initialized: bool,
    model: Option<E::Model>,
}

impl<E: InferenceEngine> Session<E> {
    /// Creates an unloaded session. Out-of-range settings in `config` are reset.
    pub fn new(engine: E, mut config: DriverConfig) -> Self {
        config.validate();
        Self {
            engine,
            config,
            backend_initialized: false,
            model: None,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Loads the model at `path`, replacing any loaded one.
    ///
    /// The previous model is freed first, even if the new load fails. On
    /// failure the session is left unloaded and `load` may be retried.
    pub fn load(&mut self, path: &Path) -> Result<(), SessionError> {
        if !self.backend_initialized {
            self.engine
                .init_backend()
                .map_err(SessionError::BackendInit)?;
            self.backend_initialized = true;
        }

        if self.model.take().is_some() {
            tracing::info!("Released previous model");
        }

        tracing::info!("Loading model from {}", path.display());
        let model = self
            .engine
            .load_model(path, &self.config.model_params())
            .map_err(|e| {
                tracing::error!("Failed to load model: {}", e);
                SessionError::ModelLoad(e)
            })?;

        // Generation builds its own context; this one only proves it can be built.
        match self
            .engine
            .new_context(&model, &self.config.context_params())
        {
            Ok(ctx) => drop(ctx),
            Err(e) => {
                tracing::error!("Failed to create context: {}", e);
                return Err(SessionError::ContextCreate(e));
            }
        }

        self.model = Some(model);
        tracing::info!("Model load complete");
        Ok(())
    }

    /// Caller-facing `load`: `true` on success.
    pub fn load_model(&mut self, path: &Path) -> bool {
        self.load(path).is_ok()
    }

    /// Generates a reply to `prompt` in a fresh context.
    ///
    /// Panics inside the decode loop are reported as
    /// [`GenerationError::Internal`]; the model stays loaded.
    pub fn generate(&mut self, prompt: &str) -> Result<Generation, GenerationError> {
        let Some(model) = self.model.as_ref() else {
            return Err(GenerationError::NotLoaded);
        };

        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("generate", %request_id);
        let _enter = span.enter();

        let engine = &self.engine;
        let config = self.config.generation();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            run_generation(engine, model, prompt, &config)
        }));

        match outcome {
            Ok(result) => {
                if let Ok(generation) = &result {
                    tracing::info!(
                        "Generated {} tokens ({:?})",
                        generation.tokens_generated,
                        generation.stop_reason
                    );
                }
                result
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!("Generation panicked: {}", message);
                Err(GenerationError::Internal(message))
            }
        }
    }

    /// Caller-facing `generate`: the text, or `"Error: ..."` on failure.
    pub fn generate_text(&mut self, prompt: &str) -> String {
        match self.generate(prompt) {
            Ok(generation) => generation.text,
            Err(e) => format!("Error: {e}"),
        }
    }

    /// Frees the model, then the backend. Safe to call repeatedly.
    pub fn unload(&mut self) {
        if self.model.take().is_some() {
            tracing::info!("Model unloaded");
        }
        if self.backend_initialized {
            self.engine.free_backend();
            self.backend_initialized = false;
        }
    }
}

impl<E: InferenceEngine> Drop for Session<E> {
    fn drop(&mut self) {
        self.unload();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Internal error during generation".to_string()
    }
}
