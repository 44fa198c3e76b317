//! # Streaming Sessions
//!
//! One WebSocket connection is one session. A session moves audio in one
//! direction and transcription events in the other, and both directions can
//! end (or fail) independently:
//!
//! ```text
//!  client ──frames──▶ ingress (coordinator task) ──feed──▶ SessionProcessor
//!                                                           │ pipeline
//!                                                           ▼
//!  client ◀──text──── relay task ◀──── bounded result channel
//! ```
//!
//! - `transport`: the narrow connection seam (`FrameSource`, `MessageSink`)
//!   plus the cancellation signal shared by the session tasks.
//! - `processor`: owns the pipeline instance and the result channel.
//! - `relay`: drains results to the client and writes the completion marker.
//! - `coordinator`: runs both directions and orders teardown.

pub mod coordinator;
pub mod processor;
pub mod relay;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

pub use coordinator::{EndReason, SessionCoordinator, SessionReport};

/// Raw audio bytes as received from the client. Never inspected by the session
/// layer; handed to the pipeline untouched.
pub type AudioChunk = actix_web::web::Bytes;

/// Per-session tuning taken from the `session` config section.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Capacity of the result channel. A full channel suspends `feed`.
    pub result_buffer: usize,
    /// How long a cleanly ending session waits for the relay to drain.
    pub drain_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            result_buffer: 64,
            drain_grace: Duration::from_secs(10),
        }
    }
}

impl From<&crate::config::SessionConfig> for SessionSettings {
    fn from(config: &crate::config::SessionConfig) -> Self {
        Self {
            result_buffer: config.result_buffer,
            drain_grace: config.drain_grace(),
        }
    }
}
