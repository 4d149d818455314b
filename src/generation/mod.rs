//! Text generation
//!
//! Everything between the engine interface and a finished string: prompt
//! tokenization, the decode loop, sampling, stop markers and UTF-8 repair.

pub mod driver;
pub mod history;
pub mod sampler;
pub mod sanitize;
pub mod stop;

pub use driver::{
    run_generation, tokenize_prompt, Generation, GenerationConfig, GenerationError, StopReason,
};
pub use history::TokenHistory;
pub use sampler::Sampler;
pub use sanitize::sanitize_utf8;
pub use stop::{StopMarkers, StopMatch};
