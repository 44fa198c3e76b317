//! # Whisper Model
//!
//! Downloads a Whisper checkpoint from the Hugging Face hub and runs greedy
//! decoding with candle.
//!
//! ## Loading Process:
//! 1. Resolve `config.json`, `tokenizer.json` and `model.safetensors` through
//!    the hub cache (downloading on first use)
//! 2. Memory-map the weights onto the selected device
//! 3. Look up the special tokens the decoder prompt needs
//! 4. Build the mel filterbank for the checkpoint's mel bin count
//!
//! ## Environment:
//! - `HF_TOKEN`: access token for gated or private mirrors
//! - `HF_HUB_CACHE` / `HF_HOME`: cache location

use super::mel;
use anyhow::{anyhow, Result};
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use std::path::PathBuf;
use tokenizers::Tokenizer;

/// Available Whisper model sizes.
///
/// ## Trade-offs:
/// Larger models are more accurate but slower and need more memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    /// Get the HuggingFace model repository name.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tiny" | "tiny.en" => Ok(ModelSize::Tiny),
            "base" | "base.en" => Ok(ModelSize::Base),
            "small" | "small.en" => Ok(ModelSize::Small),
            "medium" | "medium.en" => Ok(ModelSize::Medium),
            "large" | "large-v2" => Ok(ModelSize::Large),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A loaded Whisper model ready for transcription.
///
/// Decoding mutates the decoder's key/value cache, so transcription needs
/// `&mut self`; callers share the model behind a mutex.
pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    device: Device,
    size: ModelSize,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    prompt: Vec<u32>,
    eot_token: u32,
}

impl WhisperModel {
    /// Load a Whisper model from HuggingFace.
    pub async fn load(size: ModelSize, language: &str, device: Device) -> Result<Self> {
        tracing::info!("Loading Whisper {} model from {}", size, size.repo_name());
        let start_time = std::time::Instant::now();

        let api = hub_api()?;
        let repo = api.model(size.repo_name().to_string());

        let config_filename = repo
            .get("config.json")
            .await
            .map_err(|e| anyhow!("Failed to download config.json from {}: {}", size.repo_name(), e))?;
        let tokenizer_filename = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| anyhow!("Failed to download tokenizer.json from {}: {}", size.repo_name(), e))?;
        let model_filename = repo
            .get("model.safetensors")
            .await
            .map_err(|e| anyhow!("Failed to download model weights from {}: {}", size.repo_name(), e))?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_filename)?)?;
        tracing::debug!("Model config: {:?}", config);

        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[model_filename], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let mut prompt = vec![token_id(&tokenizer, m::SOT_TOKEN)?];
        match token_id(&tokenizer, &format!("<|{}|>", language)) {
            Ok(language_token) => prompt.push(language_token),
            Err(_) => tracing::warn!("Language '{}' unknown to the tokenizer, letting the model detect it", language),
        }
        prompt.push(token_id(&tokenizer, m::TRANSCRIBE_TOKEN)?);
        prompt.push(token_id(&tokenizer, m::NO_TIMESTAMPS_TOKEN)?);
        let eot_token = token_id(&tokenizer, m::EOT_TOKEN)?;

        let mel_filters = mel::mel_filters(m::N_FFT, config.num_mel_bins);

        tracing::info!(
            "Whisper {} model loaded in {:.2}s",
            size,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            model,
            config,
            device,
            size,
            tokenizer,
            mel_filters,
            prompt,
            eot_token,
        })
    }

    /// Transcribe up to 30 seconds of 16 kHz mono audio.
    ///
    /// Blocking and CPU/GPU heavy: call it from `spawn_blocking`.
    pub fn transcribe(&mut self, samples: &[f32]) -> Result<String> {
        if samples.is_empty() {
            return Ok(String::new());
        }
        let start_time = std::time::Instant::now();

        let mel = self.pcm_to_mel(samples)?;
        let features = self.model.encoder.forward(&mel, true)?;

        let mut tokens = self.prompt.clone();
        let mut output = Vec::new();
        let sample_len = self.config.max_target_positions / 2;

        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&tokens_t, &features, i == 0)?;

            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let next_token = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;

            if next_token == self.eot_token || is_repetitive(&output, next_token) {
                break;
            }
            tokens.push(next_token);
            output.push(next_token);
        }

        let text = self
            .tokenizer
            .decode(&output, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;

        tracing::debug!(
            "Whisper {} transcribed {:.2}s of audio in {:.2}s: '{}'",
            self.size,
            samples.len() as f64 / m::SAMPLE_RATE as f64,
            start_time.elapsed().as_secs_f64(),
            text.trim()
        );
        Ok(text.trim().to_string())
    }

    fn pcm_to_mel(&self, samples: &[f32]) -> Result<Tensor> {
        let max_samples = m::N_SAMPLES;
        let samples = &samples[..samples.len().min(max_samples)];

        let mel = m::audio::pcm_to_mel(&self.config, samples, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let n_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, n_frames), &self.device)?;

        Ok(mel.narrow(2, 0, n_frames.min(m::N_FRAMES))?)
    }
}

fn hub_api() -> Result<hf_hub::api::tokio::Api> {
    use hf_hub::api::tokio::ApiBuilder;

    let mut builder = ApiBuilder::new().with_progress(false);
    if let Ok(token) = std::env::var("HF_TOKEN") {
        builder = builder.with_token(Some(token));
    }
    if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
        builder = builder.with_cache_dir(cache_dir.into());
    } else if let Ok(hf_home) = std::env::var("HF_HOME") {
        builder = builder.with_cache_dir(PathBuf::from(hf_home).join("hub"));
    }

    builder
        .build()
        .map_err(|e| anyhow!("Failed to initialize the Hugging Face hub client: {}", e))
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("Token '{}' not found in vocabulary", token))
}

/// Greedy decoding can loop on silence; stop on a token repeated three times
/// or a repeated three-token phrase.
fn is_repetitive(tokens: &[u32], next: u32) -> bool {
    let n = tokens.len();
    if n >= 3 && tokens[n - 3..].iter().all(|&t| t == next) {
        return true;
    }
    if n >= 5 {
        let candidate = [tokens[n - 2], tokens[n - 1], next];
        if tokens[n - 5..n - 2] == candidate {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("medium".parse::<ModelSize>().unwrap(), ModelSize::Medium);
        assert_eq!("LARGE".parse::<ModelSize>().unwrap(), ModelSize::Large);
        assert_eq!("tiny.en".parse::<ModelSize>().unwrap(), ModelSize::Tiny);
        assert!("invalid".parse::<ModelSize>().is_err());
    }

    #[test]
    fn test_model_size_display_round_trips() {
        for size in [ModelSize::Tiny, ModelSize::Base, ModelSize::Small, ModelSize::Medium, ModelSize::Large] {
            assert_eq!(size.to_string().parse::<ModelSize>().unwrap(), size);
        }
        assert_eq!(ModelSize::Medium.repo_name(), "openai/whisper-medium");
    }

    #[test]
    fn test_repetition_guard() {
        assert!(!is_repetitive(&[1, 2], 2));
        assert!(is_repetitive(&[5, 7, 7, 7], 7));
        assert!(is_repetitive(&[1, 2, 3, 1, 2], 3));
        assert!(!is_repetitive(&[1, 2, 3, 4, 5], 6));
    }
}
