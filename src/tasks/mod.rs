//! Task lifecycle: persistence-backed conversion scheduling, encoder
//! invocation, and progress broadcasting.

pub mod encoder;
mod engine;

pub use encoder::{
    EncodeOutcome, EncodeRequest, Encoder, EncoderConfig, EncoderUpdate, ProgressSnapshot,
};
pub use engine::{ConversionEngine, EngineConfig, EngineError};
