//! In-memory doubles for exercising sessions without a socket or a model.

use crate::engine::events::TranscriptLine;
use crate::engine::{EngineInfo, Pipeline, TranscriptionEngine, TranscriptionEvent};
use crate::error::{PipelineError, TransportError};
use crate::session::transport::{FrameSource, Inbound, MessageSink};
use crate::session::AudioChunk;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// An event whose single line carries `text`, for easy assertions.
pub fn event(text: &str) -> TranscriptionEvent {
    TranscriptionEvent::active(vec![TranscriptLine::new(None, text, 0.0, 1.0)])
}

/// Extract the text of the first line of a serialized event.
pub fn text_of(message: &str) -> String {
    let json: serde_json::Value = serde_json::from_str(message).unwrap();
    if json["type"] == "ready_to_stop" {
        return "<ready_to_stop>".to_string();
    }
    json["lines"][0]["text"].as_str().unwrap().to_string()
}

pub fn chunk(bytes: &[u8]) -> Inbound {
    Inbound::Audio(AudioChunk::copy_from_slice(bytes))
}

/// Replays a fixed list of frames, then reports a clean disconnect.
/// With `hang_at_end`, it never returns once the script is exhausted.
pub struct ScriptedSource {
    frames: VecDeque<Inbound>,
    hang_at_end: bool,
    pause: Option<Duration>,
}

impl ScriptedSource {
    pub fn new(frames: Vec<Inbound>) -> Self {
        Self { frames: frames.into(), hang_at_end: false, pause: None }
    }

    pub fn hanging(frames: Vec<Inbound>) -> Self {
        Self { frames: frames.into(), hang_at_end: true, pause: None }
    }

    /// Waits `pause` before handing out each frame.
    pub fn paced(frames: Vec<Inbound>, pause: Duration) -> Self {
        Self { frames: frames.into(), hang_at_end: false, pause: Some(pause) }
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn next_frame(&mut self) -> Inbound {
        if let Some(pause) = self.pause {
            tokio::time::sleep(pause).await;
        }
        match self.frames.pop_front() {
            Some(frame) => frame,
            None if self.hang_at_end => std::future::pending().await,
            None => Inbound::Disconnected,
        }
    }
}

/// What a [`RecordingSink`] saw. Shared so tests can inspect it after the
/// sink has been moved into a session.
#[derive(Default)]
pub struct SinkLog {
    pub messages: Mutex<Vec<String>>,
    pub closes: AtomicUsize,
}

impl SinkLog {
    pub fn texts(&self) -> Vec<String> {
        self.messages.lock().unwrap().iter().map(|m| text_of(m)).collect()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Records every message. With `fail_at(k)`, the k-th write (1-based) and all
/// later ones fail as if the peer had gone away.
pub struct RecordingSink {
    log: Arc<SinkLog>,
    fail_at: Option<usize>,
    attempts: usize,
}

impl RecordingSink {
    pub fn new() -> (Self, Arc<SinkLog>) {
        let log = Arc::new(SinkLog::default());
        (Self { log: log.clone(), fail_at: None, attempts: 0 }, log)
    }

    pub fn failing_at(k: usize) -> (Self, Arc<SinkLog>) {
        let (mut sink, log) = Self::new();
        sink.fail_at = Some(k);
        (sink, log)
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.attempts += 1;
        if matches!(self.fail_at, Some(k) if self.attempts >= k) {
            return Err(TransportError::Closed);
        }
        self.log.messages.lock().unwrap().push(text);
        Ok(())
    }

    async fn close(&mut self) {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Frames come from a bounded queue filled by a producer task that holds a
/// shared mailbox lock while it waits for queue space.
pub struct QueueSource {
    rx: mpsc::Receiver<Inbound>,
}

#[async_trait]
impl FrameSource for QueueSource {
    async fn next_frame(&mut self) -> Inbound {
        self.rx.recv().await.unwrap_or(Inbound::Disconnected)
    }
}

/// Needs the mailbox lock for every write, so it cannot deliver while the
/// producer is stuck on a full queue.
pub struct MailboxSink {
    mailbox: Arc<tokio::sync::Mutex<()>>,
    inner: RecordingSink,
}

#[async_trait]
impl MessageSink for MailboxSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        let _mailbox = self.mailbox.lock().await;
        self.inner.send_text(text).await
    }

    async fn close(&mut self) {
        let _mailbox = self.mailbox.lock().await;
        self.inner.close().await;
    }
}

/// A transport whose two directions share one mailbox, like a socket actor
/// that stops handling messages while it waits to hand over a frame.
pub fn coupled_transport(frames: Vec<Inbound>, capacity: usize) -> (QueueSource, MailboxSink, Arc<SinkLog>) {
    let (tx, rx) = mpsc::channel(capacity);
    let mailbox = Arc::new(tokio::sync::Mutex::new(()));
    let (inner, log) = RecordingSink::new();

    let producer_mailbox = mailbox.clone();
    tokio::spawn(async move {
        for frame in frames {
            let _mailbox = producer_mailbox.lock().await;
            if tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    (QueueSource { rx }, MailboxSink { mailbox, inner }, log)
}

/// What a [`ScriptedPipeline`] was asked to do.
#[derive(Default)]
pub struct PipelineLog {
    pub chunks: Mutex<Vec<Vec<u8>>>,
    pub flushes: AtomicUsize,
    pub closes: AtomicUsize,
}

impl PipelineLog {
    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.chunks.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

/// Script for a [`ScriptedPipeline`]. Chunk numbers are 1-based.
#[derive(Clone, Default)]
pub struct PipelineScript {
    pub on_chunk: HashMap<usize, Vec<TranscriptionEvent>>,
    pub on_flush: Vec<TranscriptionEvent>,
    pub fail_on_chunk: Option<usize>,
    pub delays: HashMap<usize, Duration>,
}

impl PipelineScript {
    pub fn emit_after(mut self, chunk: usize, texts: &[&str]) -> Self {
        self.on_chunk.insert(chunk, texts.iter().map(|t| event(t)).collect());
        self
    }

    pub fn emit_on_flush(mut self, texts: &[&str]) -> Self {
        self.on_flush = texts.iter().map(|t| event(t)).collect();
        self
    }

    pub fn fail_on(mut self, chunk: usize) -> Self {
        self.fail_on_chunk = Some(chunk);
        self
    }

    /// Make processing of `chunk` take `delay`, like a slow model.
    pub fn delay_on(mut self, chunk: usize, delay: Duration) -> Self {
        self.delays.insert(chunk, delay);
        self
    }
}

pub struct ScriptedPipeline {
    script: PipelineScript,
    log: Arc<PipelineLog>,
    pushed: usize,
}

impl ScriptedPipeline {
    pub fn new(script: PipelineScript) -> (Self, Arc<PipelineLog>) {
        let log = Arc::new(PipelineLog::default());
        (Self { script, log: log.clone(), pushed: 0 }, log)
    }
}

#[async_trait]
impl Pipeline for ScriptedPipeline {
    async fn push_audio(&mut self, chunk: &[u8]) -> Result<Vec<TranscriptionEvent>, PipelineError> {
        self.pushed += 1;
        if let Some(delay) = self.script.delays.get(&self.pushed).copied() {
            tokio::time::sleep(delay).await;
        }
        if self.script.fail_on_chunk == Some(self.pushed) {
            return Err(PipelineError::malformed(format!("chunk {} rejected", self.pushed)));
        }
        self.log.chunks.lock().unwrap().push(chunk.to_vec());
        Ok(self.script.on_chunk.get(&self.pushed).cloned().unwrap_or_default())
    }

    async fn flush(&mut self) -> Result<Vec<TranscriptionEvent>, PipelineError> {
        self.log.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(std::mem::take(&mut self.script.on_flush))
    }

    async fn close(&mut self) -> Result<(), PipelineError> {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out scripted pipelines that all report into one shared log.
pub struct ScriptedEngine {
    script: PipelineScript,
    log: Arc<PipelineLog>,
    unavailable: bool,
}

impl ScriptedEngine {
    pub fn new(script: PipelineScript) -> (Arc<Self>, Arc<PipelineLog>) {
        let log = Arc::new(PipelineLog::default());
        (Arc::new(Self { script, log: log.clone(), unavailable: false }), log)
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            script: PipelineScript::default(),
            log: Arc::new(PipelineLog::default()),
            unavailable: true,
        })
    }
}

impl TranscriptionEngine for ScriptedEngine {
    fn describe(&self) -> EngineInfo {
        EngineInfo {
            name: "scripted".to_string(),
            model: "none".to_string(),
            language: "en".to_string(),
            diarization: false,
            device: "CPU".to_string(),
        }
    }

    fn create_pipeline(&self, _session_id: Uuid) -> Result<Box<dyn Pipeline>, PipelineError> {
        if self.unavailable {
            return Err(PipelineError::inference("model not loaded"));
        }
        Ok(Box::new(ScriptedPipeline {
            script: self.script.clone(),
            log: self.log.clone(),
            pushed: 0,
        }))
    }
}
