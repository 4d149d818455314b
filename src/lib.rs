//! pocketllm
//!
//! On-device text generation driver over a token-level inference engine.

pub mod config;
pub mod engine;
pub mod generation;
pub mod service;
pub mod session;

pub use config::DriverConfig;
pub use engine::{InferenceEngine, LlamaCppEngine};
pub use generation::{Generation, GenerationError, StopReason};
pub use service::SessionService;
pub use session::{Session, SessionError};
