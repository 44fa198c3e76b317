//! Result records sent to clients, one JSON text message each.
//!
//! ```json
//! {
//!   "status": "active_transcription",
//!   "lines": [{"speaker": 1, "text": "hello there", "start": "0:00:00", "end": "0:00:05"}],
//!   "buffer_transcription": "",
//!   "remaining_time_transcription": 0.0
//! }
//! ```
//!
//! `lines` always carries the whole transcript so far, so a client can replace
//! its view with every update.

use serde::{Deserialize, Serialize};

pub const ACTIVE_TRANSCRIPTION: &str = "active_transcription";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionEvent {
    pub status: String,
    pub lines: Vec<TranscriptLine>,
    pub buffer_transcription: String,
    pub remaining_time_transcription: f64,
}

impl TranscriptionEvent {
    /// A regular progress update carrying the full transcript.
    pub fn active(lines: Vec<TranscriptLine>) -> Self {
        Self {
            status: ACTIVE_TRANSCRIPTION.to_string(),
            lines,
            buffer_transcription: String::new(),
            remaining_time_transcription: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptLine {
    /// Present only when diarization is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<u32>,
    pub text: String,
    pub start: String,
    pub end: String,
}

impl TranscriptLine {
    pub fn new(speaker: Option<u32>, text: impl Into<String>, start_secs: f64, end_secs: f64) -> Self {
        Self {
            speaker,
            text: text.into(),
            start: format_timestamp(start_secs),
            end: format_timestamp(end_secs),
        }
    }
}

/// Format seconds as `H:MM:SS`, truncating fractions.
pub fn format_timestamp(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 { seconds.floor() as u64 } else { 0 };
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}
