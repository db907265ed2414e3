//! Offline speech-to-text inference core.
//!
//! The pipeline is a strict left-to-right flow:
//! audio -> log-mel features -> block-attention encoder -> autoregressive
//! quantized decoder -> token ids -> text.
//!
//! [`pipeline::Transcriber`] is the externally consumed entry point; every
//! other module is a stage or a kernel it composes.

pub mod audio;
pub mod constants;
pub mod decoder;
pub mod encoder;
pub mod kv;
pub mod math;
pub mod mel;
pub mod model;
pub mod ops;
pub mod params;
pub mod pipeline;
pub mod positional;
pub mod quant;
pub mod sampling;
pub mod tokenizer;
pub mod weights;

/// Request-level error taxonomy.
///
/// `Input` is rejected before any model computation. `Consistency` is an
/// internal invariant violation: it aborts the offending request and is a
/// defect, not a recoverable condition. Reaching the max-token bound is not
/// an error and has no variant here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MurmurError {
    #[error("invalid input: {0}")]
    Input(String),
    #[error("internal consistency violation: {0}")]
    Consistency(String),
}

impl MurmurError {
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    pub fn consistency(msg: impl Into<String>) -> Self {
        Self::Consistency(msg.into())
    }
}
