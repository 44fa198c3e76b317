//! # Whisper Engine
//!
//! The bundled [`TranscriptionEngine`]. One model is loaded at startup and
//! shared; each session gets a [`WhisperPipeline`] with its own decoder state,
//! sample buffer and transcript.
//!
//! ## Windowing:
//! Decoded samples accumulate until `window_seconds` of audio is available;
//! each full window is transcribed on the blocking pool and, if it produced
//! text, appended to the transcript as one line. At end of input the
//! remainder is transcribed when it is at least `min_flush_seconds` long.
//! Every event carries the whole transcript so far.

use super::audio::{PcmDecoder, SAMPLE_RATE};
use super::events::{TranscriptLine, TranscriptionEvent};
use super::model::{ModelSize, WhisperModel};
use super::{EngineInfo, Pipeline, TranscriptionEngine};
use crate::config::EngineConfig;
use crate::device::{describe_device, select_device, DevicePreference};
use crate::error::PipelineError;
use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Speaker assigned to every line when diarization is on.
const DEFAULT_SPEAKER: u32 = 1;

/// Turns a window of 16 kHz mono samples into text. Blocking.
pub trait Recognizer: Send + Sync {
    fn recognize(&self, samples: &[f32]) -> Result<String, PipelineError>;
}

/// The loaded Whisper model. Sessions take turns on it.
pub struct WhisperRecognizer {
    model: Mutex<WhisperModel>,
}

impl WhisperRecognizer {
    pub fn new(model: WhisperModel) -> Self {
        Self { model: Mutex::new(model) }
    }
}

impl Recognizer for WhisperRecognizer {
    fn recognize(&self, samples: &[f32]) -> Result<String, PipelineError> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| PipelineError::inference("model lock poisoned by an earlier failure"))?;
        model
            .transcribe(samples)
            .map_err(|e| PipelineError::inference(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowSettings {
    pub window_seconds: f64,
    pub min_flush_seconds: f64,
    pub diarization: bool,
}

impl From<&EngineConfig> for WindowSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            window_seconds: config.window_seconds,
            min_flush_seconds: config.min_flush_seconds,
            diarization: config.diarization,
        }
    }
}

pub struct WhisperEngine {
    recognizer: Arc<dyn Recognizer>,
    info: EngineInfo,
    settings: WindowSettings,
}

impl WhisperEngine {
    /// Select the device and load the configured checkpoint.
    pub async fn load(config: &EngineConfig) -> anyhow::Result<Self> {
        let size: ModelSize = config.model.parse()?;
        let preference: DevicePreference = config.device.parse().map_err(|e: String| anyhow!(e))?;
        let device = select_device(preference);
        let device_name = describe_device(&device);

        if config.diarization {
            warn!("Speaker diarization is enabled but the bundled engine has no speaker model; lines are attributed to speaker {}", DEFAULT_SPEAKER);
        }

        let model = WhisperModel::load(size, &config.language, device).await?;
        let info = EngineInfo {
            name: "whisper".to_string(),
            model: size.to_string(),
            language: config.language.clone(),
            diarization: config.diarization,
            device: device_name.to_string(),
        };
        info!("Transcription engine ready: {:?}", info);

        Ok(Self::with_recognizer(
            Arc::new(WhisperRecognizer::new(model)),
            info,
            WindowSettings::from(config),
        ))
    }

    pub fn with_recognizer(recognizer: Arc<dyn Recognizer>, info: EngineInfo, settings: WindowSettings) -> Self {
        Self { recognizer, info, settings }
    }
}

impl TranscriptionEngine for WhisperEngine {
    fn describe(&self) -> EngineInfo {
        self.info.clone()
    }

    fn create_pipeline(&self, session_id: Uuid) -> Result<Box<dyn Pipeline>, PipelineError> {
        Ok(Box::new(WhisperPipeline::new(
            session_id,
            self.recognizer.clone(),
            self.settings.clone(),
        )))
    }
}

pub struct WhisperPipeline {
    session_id: Uuid,
    recognizer: Arc<dyn Recognizer>,
    decoder: PcmDecoder,
    pending: Vec<f32>,
    /// Samples already transcribed, for line timestamps.
    consumed: usize,
    lines: Vec<TranscriptLine>,
    window_samples: usize,
    min_flush_samples: usize,
    speaker: Option<u32>,
    closed: bool,
}

impl WhisperPipeline {
    pub fn new(session_id: Uuid, recognizer: Arc<dyn Recognizer>, settings: WindowSettings) -> Self {
        let rate = f64::from(SAMPLE_RATE);
        Self {
            session_id,
            recognizer,
            decoder: PcmDecoder::new(),
            pending: Vec::new(),
            consumed: 0,
            lines: Vec::new(),
            window_samples: ((settings.window_seconds * rate) as usize).max(1),
            min_flush_samples: (settings.min_flush_seconds * rate) as usize,
            speaker: settings.diarization.then_some(DEFAULT_SPEAKER),
            closed: false,
        }
    }

    async fn transcribe_segment(&mut self, segment: Vec<f32>) -> Result<Option<TranscriptionEvent>, PipelineError> {
        let rate = f64::from(SAMPLE_RATE);
        let start = self.consumed as f64 / rate;
        let end = (self.consumed + segment.len()) as f64 / rate;
        self.consumed += segment.len();

        let recognizer = self.recognizer.clone();
        let text = tokio::task::spawn_blocking(move || recognizer.recognize(&segment))
            .await
            .map_err(|e| PipelineError::inference(format!("transcription task failed: {}", e)))??;

        let text = text.trim();
        if text.is_empty() {
            debug!(session_id = %self.session_id, "No speech in {:.1}s-{:.1}s", start, end);
            return Ok(None);
        }

        self.lines.push(TranscriptLine::new(self.speaker, text, start, end));
        Ok(Some(TranscriptionEvent::active(self.lines.clone())))
    }

    fn ensure_open(&self) -> Result<(), PipelineError> {
        if self.closed {
            return Err(PipelineError::inference("pipeline already closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Pipeline for WhisperPipeline {
    async fn push_audio(&mut self, chunk: &[u8]) -> Result<Vec<TranscriptionEvent>, PipelineError> {
        self.ensure_open()?;
        let samples = self.decoder.decode(chunk)?;
        self.pending.extend(samples);

        let mut events = Vec::new();
        while self.pending.len() >= self.window_samples {
            let segment: Vec<f32> = self.pending.drain(..self.window_samples).collect();
            if let Some(event) = self.transcribe_segment(segment).await? {
                events.push(event);
            }
        }
        Ok(events)
    }

    async fn flush(&mut self) -> Result<Vec<TranscriptionEvent>, PipelineError> {
        self.ensure_open()?;
        let remainder = std::mem::take(&mut self.pending);
        if remainder.is_empty() || remainder.len() < self.min_flush_samples {
            return Ok(Vec::new());
        }
        Ok(self.transcribe_segment(remainder).await?.into_iter().collect())
    }

    async fn close(&mut self) -> Result<(), PipelineError> {
        self.closed = true;
        self.pending = Vec::new();
        self.lines = Vec::new();
        debug!(session_id = %self.session_id, "Whisper pipeline closed");
        Ok(())
    }
}
