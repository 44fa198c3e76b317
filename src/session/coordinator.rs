//! # Session Coordinator
//!
//! Drives one connection from accept to close:
//!
//! ```text
//! INIT ──▶ ACTIVE ──▶ DRAINING ──▶ CLOSED
//!   │                    ▲
//!   └── no pipeline ─────┘
//! ```
//!
//! - **INIT**: open the processor and spawn the relay over its result stream.
//! - **ACTIVE**: receive frames and feed them, in order, until end-of-stream,
//!   disconnect, a transport failure or a pipeline fault.
//! - **DRAINING**: a clean end flushes the pipeline and lets the relay drain
//!   for at most the grace period; a fault cancels the relay right away. The
//!   processor is cleaned up exactly once, then the connection is closed unless
//!   the client is already gone.
//!
//! Teardown order is fixed: ingress stops, then the relay is stopped, then
//! the processor is released.

use crate::engine::TranscriptionEngine;
use crate::error::SessionError;
use crate::session::processor::SessionProcessor;
use crate::session::relay::{relay, RelayOutcome};
use crate::session::transport::{CancelSignal, FrameSource, Inbound, MessageSink};
use crate::session::SessionSettings;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Why a session left `ACTIVE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndReason {
    /// The client sent an empty binary frame.
    ClientFinished,
    /// The client closed the connection.
    ClientClosed,
    /// Receiving failed for any other reason.
    TransportFault,
    /// The pipeline rejected audio.
    PipelineFault,
    /// The session was torn down from our side while feeding.
    Cancelled,
    /// The engine could not create a pipeline.
    EngineUnavailable,
}

impl EndReason {
    pub const ALL: [EndReason; 6] = [
        EndReason::ClientFinished,
        EndReason::ClientClosed,
        EndReason::TransportFault,
        EndReason::PipelineFault,
        EndReason::Cancelled,
        EndReason::EngineUnavailable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::ClientFinished => "client_finished",
            EndReason::ClientClosed => "client_closed",
            EndReason::TransportFault => "transport_fault",
            EndReason::PipelineFault => "pipeline_fault",
            EndReason::Cancelled => "cancelled",
            EndReason::EngineUnavailable => "engine_unavailable",
        }
    }

    /// Input ended without a fault on our side, so buffered audio is still
    /// worth flushing. A receive error degrades to a disconnect.
    fn drains(&self) -> bool {
        matches!(
            self,
            EndReason::ClientFinished | EndReason::ClientClosed | EndReason::TransportFault
        )
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a finished session, for logs and metrics.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub reason: EndReason,
    pub chunks_received: usize,
    pub events_relayed: usize,
    /// `None` if the relay task did not return normally.
    pub relay_outcome: Option<RelayOutcome>,
    pub duration: Duration,
}

/// Runs sessions against a shared engine.
#[derive(Clone)]
pub struct SessionCoordinator {
    engine: Arc<dyn TranscriptionEngine>,
    settings: SessionSettings,
}

impl SessionCoordinator {
    pub fn new(engine: Arc<dyn TranscriptionEngine>, settings: SessionSettings) -> Self {
        Self { engine, settings }
    }

    pub fn engine(&self) -> &Arc<dyn TranscriptionEngine> {
        &self.engine
    }

    /// Drive one session to completion. Never fails: every error is handled
    /// and logged here, and the connection is released before returning.
    pub async fn run<R, W>(&self, session_id: Uuid, mut source: R, sink: W) -> SessionReport
    where
        R: FrameSource,
        W: MessageSink + 'static,
    {
        let started = Instant::now();
        info!(session_id = %session_id, state = "INIT", "Session starting");

        let processor = match SessionProcessor::open(self.engine.as_ref(), session_id, self.settings.result_buffer) {
            Ok(processor) => processor,
            Err(err) => {
                warn!(session_id = %session_id, "Engine could not create a pipeline: {}", err);
                return self.close_without_pipeline(session_id, sink, started).await;
            }
        };

        let Some(events) = processor.results() else {
            // A freshly opened processor always has its stream.
            error!(session_id = %session_id, "Result stream unavailable");
            log_cleanup(session_id, processor.cleanup().await);
            return self.close_without_pipeline(session_id, sink, started).await;
        };

        let relay_cancel = CancelSignal::new();
        let _stop_relay_on_drop = relay_cancel.drop_guard();
        let mut relay_task = tokio::spawn(relay(events, sink, relay_cancel.clone()));

        info!(session_id = %session_id, state = "ACTIVE", "Session accepting audio");
        let mut chunks_received = 0;
        let reason = loop {
            match source.next_frame().await {
                Inbound::Audio(chunk) if chunk.is_empty() => {
                    info!(session_id = %session_id, "Client signalled end of stream");
                    break EndReason::ClientFinished;
                }
                Inbound::Audio(chunk) => {
                    chunks_received += 1;
                    match processor.feed(chunk).await {
                        Ok(produced) => {
                            debug!(session_id = %session_id, chunk = chunks_received, produced, "Chunk processed");
                        }
                        Err(err) if err.is_cancelled() => break EndReason::Cancelled,
                        Err(err) => {
                            warn!(session_id = %session_id, chunk = chunks_received, "Pipeline rejected audio: {}", err);
                            break EndReason::PipelineFault;
                        }
                    }
                }
                Inbound::Disconnected => {
                    info!(session_id = %session_id, "Client disconnected");
                    break EndReason::ClientClosed;
                }
                Inbound::Failed(err) => {
                    warn!(session_id = %session_id, "Receive failed, ending session: {}", err);
                    break EndReason::TransportFault;
                }
            }
        };

        // Ingress is over. Releasing the source lets a transport that is
        // blocked handing us frames go back to delivering our writes.
        drop(source);

        info!(session_id = %session_id, state = "DRAINING", reason = %reason, "Session draining");
        let joined = if reason.drains() {
            let grace = self.settings.drain_grace;
            let drained = tokio::time::timeout(grace, async {
                if relay_task.is_finished() {
                    // The relay only stops early when the client is gone.
                    debug!(session_id = %session_id, "Client already gone, skipping flush");
                } else {
                    match processor.finish().await {
                        Ok(flushed) => debug!(session_id = %session_id, flushed, "Pipeline flushed"),
                        Err(SessionError::Cancelled) => {}
                        Err(err) => warn!(session_id = %session_id, "Flush failed: {}", err),
                    }
                }
                (&mut relay_task).await
            })
            .await;

            match drained {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(session_id = %session_id, "Results not drained within {:?}, cancelling relay", grace);
                    stop_relay(session_id, relay_task, &relay_cancel, grace).await
                }
            }
        } else {
            stop_relay(session_id, relay_task, &relay_cancel, self.settings.drain_grace).await
        };

        let (relay_report, sink) = match joined {
            Ok((report, sink)) => (Some(report), Some(sink)),
            Err(err) => {
                log_join_error(session_id, err);
                (None, None)
            }
        };

        log_cleanup(session_id, processor.cleanup().await);

        if let Some(mut sink) = sink {
            if relay_report.map(|r| r.outcome) != Some(RelayOutcome::PeerGone) {
                sink.close().await;
            }
        }

        let report = SessionReport {
            session_id,
            reason,
            chunks_received,
            events_relayed: relay_report.map_or(0, |r| r.events_sent),
            relay_outcome: relay_report.map(|r| r.outcome),
            duration: started.elapsed(),
        };
        log_closed(&report);
        report
    }

    /// INIT failed: the client gets only the completion marker.
    async fn close_without_pipeline<W: MessageSink>(&self, session_id: Uuid, sink: W, started: Instant) -> SessionReport {
        let (relay_report, mut sink) = relay(tokio_stream::empty(), sink, CancelSignal::new()).await;
        if relay_report.outcome != RelayOutcome::PeerGone {
            sink.close().await;
        }

        let report = SessionReport {
            session_id,
            reason: EndReason::EngineUnavailable,
            chunks_received: 0,
            events_relayed: 0,
            relay_outcome: Some(relay_report.outcome),
            duration: started.elapsed(),
        };
        log_closed(&report);
        report
    }
}

/// Cancel the relay and wait for it. A relay stuck inside a write cannot see
/// the cancellation, so it is aborted once `patience` runs out.
async fn stop_relay<T>(
    session_id: Uuid,
    mut relay_task: JoinHandle<T>,
    cancel: &CancelSignal,
    patience: Duration,
) -> Result<T, JoinError> {
    cancel.cancel();
    match tokio::time::timeout(patience, &mut relay_task).await {
        Ok(joined) => joined,
        Err(_) => {
            warn!(session_id = %session_id, "Relay did not stop after cancellation, aborting it");
            relay_task.abort();
            relay_task.await
        }
    }
}

fn log_join_error(session_id: Uuid, err: JoinError) {
    if err.is_cancelled() {
        debug!(session_id = %session_id, "Relay task cancelled");
    } else {
        error!(session_id = %session_id, "Relay task failed: {}", err);
    }
}

fn log_cleanup(session_id: Uuid, result: Result<(), crate::error::PipelineError>) {
    if let Err(err) = result {
        warn!(session_id = %session_id, "Processor cleanup failed: {}", err);
    }
}

fn log_closed(report: &SessionReport) {
    info!(
        session_id = %report.session_id,
        state = "CLOSED",
        reason = %report.reason,
        chunks = report.chunks_received,
        events = report.events_relayed,
        relay = report.relay_outcome.map_or("failed", |o| o.as_str()),
        duration_ms = report.duration.as_millis() as u64,
        "Session closed"
    );
}
