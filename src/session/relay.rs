//! Outbound half of a session: result stream → client.

use crate::engine::TranscriptionEvent;
use crate::session::transport::{CancelSignal, MessageSink};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

/// Control messages that are not transcription events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// `{"type": "ready_to_stop"}`: nothing else will follow.
    ReadyToStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The result stream ended and everything was delivered.
    Drained,
    /// Stopped on request before the stream ended.
    Cancelled,
    /// A write failed; the client is no longer there.
    PeerGone,
}

impl RelayOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayOutcome::Drained => "drained",
            RelayOutcome::Cancelled => "cancelled",
            RelayOutcome::PeerGone => "peer_gone",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub outcome: RelayOutcome,
    pub events_sent: usize,
}

enum Next {
    Event(TranscriptionEvent),
    Exhausted,
    Cancelled,
}

/// Forward every event to the sink in order, then write the completion marker.
///
/// The marker is written exactly once, as the last message, when the stream
/// is exhausted or the relay is cancelled. After a failed write nothing more is
/// written. The sink is handed back so the caller can close it.
pub async fn relay<S, W>(mut events: S, mut sink: W, cancel: CancelSignal) -> (RelayReport, W)
where
    S: Stream<Item = TranscriptionEvent> + Unpin + Send,
    W: MessageSink,
{
    let mut events_sent = 0;

    let mut outcome = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => Next::Cancelled,
            event = events.next() => match event {
                Some(event) => Next::Event(event),
                None => Next::Exhausted,
            },
        };

        let event = match next {
            Next::Event(event) => event,
            Next::Exhausted => break RelayOutcome::Drained,
            Next::Cancelled => break RelayOutcome::Cancelled,
        };

        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(err) => {
                warn!("Skipping event that failed to serialize: {}", err);
                continue;
            }
        };

        if let Err(err) = sink.send_text(text).await {
            debug!("Client went away while relaying results: {}", err);
            break RelayOutcome::PeerGone;
        }
        events_sent += 1;
    };

    if outcome != RelayOutcome::PeerGone {
        match serde_json::to_string(&ControlMessage::ReadyToStop) {
            Ok(marker) => {
                if let Err(err) = sink.send_text(marker).await {
                    debug!("Client went away before the completion marker: {}", err);
                    outcome = RelayOutcome::PeerGone;
                }
            }
            Err(err) => warn!("Failed to serialize completion marker: {}", err),
        }
    }

    (RelayReport { outcome, events_sent }, sink)
}
