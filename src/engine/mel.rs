//! Mel filterbank for the Whisper front end.
//!
//! Whisper checkpoints are trained on log-mel spectrograms computed with
//! Slaney-scale, area-normalized triangular filters (librosa's default). The
//! bank is a row-major `n_mels × (n_fft / 2 + 1)` matrix, the layout
//! `candle_transformers::models::whisper::audio::pcm_to_mel` expects.

use super::audio::SAMPLE_RATE;

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

pub fn hz_to_mel(hz: f64) -> f64 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

pub fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mel
    }
}

/// Build the filterbank for `n_mels` bands over an `n_fft`-point FFT at 16 kHz.
pub fn mel_filters(n_fft: usize, n_mels: usize) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let nyquist = f64::from(SAMPLE_RATE) / 2.0;

    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|i| i as f64 * nyquist / (n_freqs - 1) as f64)
        .collect();

    let max_mel = hz_to_mel(nyquist);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(i as f64 * max_mel / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for band in 0..n_mels {
        let (left, center, right) = (mel_points[band], mel_points[band + 1], mel_points[band + 2]);
        let norm = 2.0 / (right - left);

        for (bin, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - left) / (center - left);
            let falling = (right - freq) / (right - center);
            let weight = rising.min(falling).max(0.0);
            filters[band * n_freqs + bin] = (weight * norm) as f32;
        }
    }

    filters
}
