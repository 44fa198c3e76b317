//! Per-connection processing state.
//!
//! A `SessionProcessor` owns one pipeline instance and the bounded channel its
//! events travel through. All operations take `&self` so `cleanup` can run
//! while a `feed` is suspended on backpressure; cancellation wakes that `feed`
//! instead of leaving it hanging.

use crate::engine::{Pipeline, TranscriptionEngine, TranscriptionEvent};
use crate::error::{PipelineError, SessionError};
use crate::session::transport::CancelSignal;
use crate::session::AudioChunk;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use uuid::Uuid;

pub struct SessionProcessor {
    session_id: Uuid,
    pipeline: tokio::sync::Mutex<Option<Box<dyn Pipeline>>>,
    results_tx: Mutex<Option<mpsc::Sender<TranscriptionEvent>>>,
    results_rx: Mutex<Option<mpsc::Receiver<TranscriptionEvent>>>,
    cancel: CancelSignal,
    cleaned_up: AtomicBool,
}

impl SessionProcessor {
    /// Create a processor with its own pipeline instance from the shared engine.
    pub fn open(
        engine: &dyn TranscriptionEngine,
        session_id: Uuid,
        result_buffer: usize,
    ) -> Result<Self, PipelineError> {
        let pipeline = engine.create_pipeline(session_id)?;
        Ok(Self::with_pipeline(session_id, pipeline, result_buffer))
    }

    pub fn with_pipeline(session_id: Uuid, pipeline: Box<dyn Pipeline>, result_buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(result_buffer.max(1));
        Self {
            session_id,
            pipeline: tokio::sync::Mutex::new(Some(pipeline)),
            results_tx: Mutex::new(Some(tx)),
            results_rx: Mutex::new(Some(rx)),
            cancel: CancelSignal::new(),
            cleaned_up: AtomicBool::new(false),
        }
    }

    /// Push one chunk through the pipeline and queue whatever it produced.
    ///
    /// Returns the number of events produced. Suspends while the result
    /// channel is full.
    pub async fn feed(&self, chunk: AudioChunk) -> Result<usize, SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SessionError::Cancelled),
            result = self.push(chunk) => result,
        }
    }

    /// Take the result stream. Only the first call gets it.
    pub fn results(&self) -> Option<ReceiverStream<TranscriptionEvent>> {
        lock(&self.results_rx).take().map(ReceiverStream::new)
    }

    /// Signal end of input: flush the pipeline, queue the flushed events and
    /// close the result channel so the stream ends.
    pub async fn finish(&self) -> Result<usize, SessionError> {
        let result = if self.cancel.is_cancelled() {
            Err(SessionError::Cancelled)
        } else {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(SessionError::Cancelled),
                result = self.flush() => result,
            }
        };

        drop(lock(&self.results_tx).take());
        result
    }

    /// Release the pipeline and the channel. Only the first call does work.
    pub async fn cleanup(&self) -> Result<(), PipelineError> {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.cancel.cancel();
        drop(lock(&self.results_tx).take());
        drop(lock(&self.results_rx).take());

        let pipeline = self.pipeline.lock().await.take();
        debug!(session_id = %self.session_id, "Releasing session pipeline");
        match pipeline {
            Some(mut pipeline) => pipeline.close().await,
            None => Ok(()),
        }
    }

    async fn push(&self, chunk: AudioChunk) -> Result<usize, SessionError> {
        let events = {
            let mut pipeline = self.pipeline.lock().await;
            let pipeline = pipeline.as_mut().ok_or(SessionError::Cancelled)?;
            pipeline.push_audio(&chunk).await?
        };
        Ok(self.forward(events).await)
    }

    async fn flush(&self) -> Result<usize, SessionError> {
        let events = {
            let mut pipeline = self.pipeline.lock().await;
            match pipeline.as_mut() {
                Some(pipeline) => pipeline.flush().await?,
                None => return Err(SessionError::Cancelled),
            }
        };
        Ok(self.forward(events).await)
    }

    /// Queue events in order. Events nobody will read are dropped.
    async fn forward(&self, events: Vec<TranscriptionEvent>) -> usize {
        let produced = events.len();
        let tx = lock(&self.results_tx).clone();
        let Some(tx) = tx else {
            return produced;
        };

        for event in events {
            if tx.send(event).await.is_err() {
                debug!(session_id = %self.session_id, "Result consumer gone, discarding events");
                break;
            }
        }
        produced
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
