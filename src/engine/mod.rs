//! # Transcription Engine
//!
//! The engine is loaded once at startup and shared by every session through an
//! `Arc<dyn TranscriptionEngine>`. A session only touches it to create its own
//! [`Pipeline`]; everything stateful lives in the pipeline.
//!
//! ## Module Layout:
//! - `events`: the result records streamed back to clients
//! - `audio`: decoding of raw PCM / streamed WAV chunks
//! - `mel`: mel filterbank construction for the Whisper front end
//! - `model`: Whisper checkpoint loading and greedy decoding (candle)
//! - `whisper`: the bundled engine, windowing audio into the model

pub mod audio;
pub mod events;
pub mod mel;
pub mod model;
pub mod whisper;

use crate::error::PipelineError;
use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

pub use events::TranscriptionEvent;

/// Static description of a loaded engine, reported by `/metrics` and logs.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EngineInfo {
    pub name: String,
    pub model: String,
    pub language: String,
    pub diarization: bool,
    pub device: String,
}

/// Shared, read-only handle to a loaded model.
pub trait TranscriptionEngine: Send + Sync {
    fn describe(&self) -> EngineInfo;

    /// Create a private pipeline instance for one session.
    fn create_pipeline(&self, session_id: Uuid) -> Result<Box<dyn Pipeline>, PipelineError>;
}

/// Per-session processing pipeline.
///
/// Audio must be pushed in arrival order. Each call returns the events it
/// produced, possibly none.
#[async_trait]
pub trait Pipeline: Send {
    async fn push_audio(&mut self, chunk: &[u8]) -> Result<Vec<TranscriptionEvent>, PipelineError>;

    /// Process whatever input is still buffered. Called once at end of input.
    async fn flush(&mut self) -> Result<Vec<TranscriptionEvent>, PipelineError>;

    /// Release resources held by the pipeline.
    async fn close(&mut self) -> Result<(), PipelineError>;
}
