//! Connection seam used by the session core.
//!
//! The coordinator never touches actix types. It reads frames from a
//! [`FrameSource`] and writes text through a [`MessageSink`]; the WebSocket
//! actor provides both, tests provide in-memory doubles.

use crate::error::TransportError;
use crate::session::AudioChunk;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Outcome of "receive the next frame". The three cases are never conflated.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A binary frame. An empty one is the client's end-of-stream signal.
    Audio(AudioChunk),
    /// The peer closed the connection cleanly.
    Disconnected,
    /// Any other receive failure.
    Failed(TransportError),
}

#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next inbound frame. After `Disconnected` or `Failed` has
    /// been returned, every further call returns `Disconnected`.
    async fn next_frame(&mut self) -> Inbound;
}

#[async_trait]
pub trait MessageSink: Send {
    /// Write one text message to the client.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the connection from the server side.
    async fn close(&mut self);
}

/// Cloneable, idempotent cancellation flag.
///
/// `cancel` may be called any number of times from any task; every pending
/// and future `cancelled().await` completes.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a concurrent cancel is not missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Cancel when the returned guard is dropped.
    pub fn drop_guard(&self) -> CancelOnDrop {
        CancelOnDrop(self.clone())
    }
}

/// Cancels its signal on drop, so a task abandoned by its owner still stops.
#[derive(Debug)]
pub struct CancelOnDrop(CancelSignal);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}
