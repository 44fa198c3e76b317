//! # Audio Decoding
//!
//! Clients stream either raw PCM or a WAV file cut into arbitrary pieces.
//! The first bytes decide which: a `RIFF....WAVE` prefix means the header is
//! parsed (possibly across several chunks) and only the `data` payload is
//! decoded; anything else is taken as raw PCM.
//!
//! Accepted format: 16-bit little-endian PCM at 16 kHz, mono or stereo.
//! Stereo is averaged down to mono. Samples are scaled to `[-1.0, 1.0]`.
//!
//! Chunk boundaries are arbitrary, so bytes that do not complete a frame are
//! carried over to the next call.

use crate::error::PipelineError;
use byteorder::{ByteOrder, LittleEndian};

/// Sample rate the Whisper front end expects.
pub const SAMPLE_RATE: u32 = 16_000;

const RIFF: &[u8] = b"RIFF";
const MAX_HEADER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    /// Still collecting the first bytes / the WAV header.
    Detecting,
    Streaming,
}

/// Format fields from a WAV `fmt ` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavFormat {
    pub audio_format: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl WavFormat {
    const PCM: u16 = 1;
    const EXTENSIBLE: u16 = 0xFFFE;

    fn parse(body: &[u8]) -> Self {
        Self {
            audio_format: LittleEndian::read_u16(&body[0..2]),
            channels: LittleEndian::read_u16(&body[2..4]),
            sample_rate: LittleEndian::read_u32(&body[4..8]),
            bits_per_sample: LittleEndian::read_u16(&body[14..16]),
        }
    }

    fn check_supported(&self) -> Result<(), PipelineError> {
        if self.audio_format != Self::PCM && self.audio_format != Self::EXTENSIBLE {
            return Err(PipelineError::unsupported(format!(
                "WAV encoding {} (only PCM is accepted)",
                self.audio_format
            )));
        }
        if self.bits_per_sample != 16 {
            return Err(PipelineError::unsupported(format!(
                "{}-bit samples (only 16-bit is accepted)",
                self.bits_per_sample
            )));
        }
        if self.sample_rate != SAMPLE_RATE {
            return Err(PipelineError::unsupported(format!(
                "{} Hz sample rate (only {} Hz is accepted)",
                self.sample_rate, SAMPLE_RATE
            )));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(PipelineError::unsupported(format!("{} channels", self.channels)));
        }
        Ok(())
    }
}

/// Stateful decoder for one session's audio stream.
#[derive(Debug)]
pub struct PcmDecoder {
    state: DecoderState,
    /// Bytes held back while the stream type / WAV header is undecided.
    pending: Vec<u8>,
    /// Trailing bytes of an incomplete frame.
    carry: Vec<u8>,
    channels: usize,
}

impl Default for PcmDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PcmDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::Detecting,
            pending: Vec::new(),
            carry: Vec::new(),
            channels: 1,
        }
    }

    /// Decode one chunk into mono samples.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<f32>, PipelineError> {
        if self.state == DecoderState::Streaming {
            return Ok(self.samples(chunk));
        }

        self.pending.extend_from_slice(chunk);
        let Some(offset) = self.detect()? else {
            return Ok(Vec::new());
        };

        self.state = DecoderState::Streaming;
        let pending = std::mem::take(&mut self.pending);
        Ok(self.samples(&pending[offset..]))
    }

    /// Returns the offset where audio starts once the stream type is known.
    fn detect(&mut self) -> Result<Option<usize>, PipelineError> {
        let buf = &self.pending;
        if buf.len() < RIFF.len() {
            if RIFF.starts_with(buf) {
                return Ok(None);
            }
            return Ok(Some(0));
        }
        if &buf[..RIFF.len()] != RIFF {
            return Ok(Some(0));
        }

        match parse_wav_header(buf)? {
            Some((format, offset)) => {
                self.channels = usize::from(format.channels);
                Ok(Some(offset))
            }
            None if buf.len() > MAX_HEADER_BYTES => {
                Err(PipelineError::malformed("WAV header exceeds 64 KiB without a data chunk"))
            }
            None => Ok(None),
        }
    }

    fn samples(&mut self, bytes: &[u8]) -> Vec<f32> {
        let frame_len = 2 * self.channels;
        self.carry.extend_from_slice(bytes);
        let whole = self.carry.len() - self.carry.len() % frame_len;

        let samples = self.carry[..whole]
            .chunks_exact(frame_len)
            .map(|frame| {
                let sum: f32 = frame
                    .chunks_exact(2)
                    .map(|sample| f32::from(LittleEndian::read_i16(sample)) / 32768.0)
                    .sum();
                sum / self.channels as f32
            })
            .collect();

        self.carry.drain(..whole);
        samples
    }
}

/// Walk the RIFF chunks up to `data`. `Ok(None)` means more bytes are needed.
fn parse_wav_header(buf: &[u8]) -> Result<Option<(WavFormat, usize)>, PipelineError> {
    if buf.len() < 12 {
        return Ok(None);
    }
    if &buf[8..12] != b"WAVE" {
        return Err(PipelineError::malformed("RIFF container is not a WAVE file"));
    }

    let mut pos = 12;
    let mut format = None;
    loop {
        if buf.len() < pos + 8 {
            return Ok(None);
        }
        let id = &buf[pos..pos + 4];
        let size = LittleEndian::read_u32(&buf[pos + 4..pos + 8]) as usize;
        let body = pos + 8;

        match id {
            b"fmt " => {
                if size < 16 {
                    return Err(PipelineError::malformed(format!("fmt chunk of {} bytes", size)));
                }
                if buf.len() < body + 16 {
                    return Ok(None);
                }
                let parsed = WavFormat::parse(&buf[body..body + 16]);
                parsed.check_supported()?;
                format = Some(parsed);
            }
            b"data" => {
                let format = format.ok_or_else(|| PipelineError::malformed("WAV data chunk before fmt chunk"))?;
                return Ok(Some((format, body)));
            }
            _ => {}
        }

        // Chunks are word aligned.
        pos = body.saturating_add(size).saturating_add(size & 1);
    }
}
