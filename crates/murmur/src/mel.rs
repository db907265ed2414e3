//! Log-mel spectrogram feature extraction.
//!
//! Implemented in a very literal way to keep numerical parity with the
//! reference behavior:
//! - Periodic Hann window, coefficients precomputed once
//! - Frames zero-padded from `WINDOW_SIZE` (400) to `FFT_SIZE` (512)
//! - Direct real DFT (no FFT) for exactness
//! - Slaney-style mel filter bank built over the *padded* transform size
//! - floor-then-log10
//!
//! Scratch buffers live on the extractor and are reused across frames; this
//! stage's latency budget is small and must not regress with allocator churn.

use crate::constants::{
    FFT_SIZE, HOP_LENGTH, MEL_BINS, MEL_FLOOR, N_FREQ, SAMPLE_RATE_HZ, WINDOW_SIZE,
};

/// Frequency of DFT bin `k`, from the padded transform size.
///
/// This is `k * sample_rate / FFT_SIZE`, *not* `k * sample_rate / WINDOW_SIZE`:
/// the filter bank must be laid out on the grid the padded transform actually
/// produces.
#[inline]
#[must_use]
pub fn fft_bin_freq(k: usize) -> f32 {
    (k as f32) * (SAMPLE_RATE_HZ as f32) / (FFT_SIZE as f32)
}

/// Number of mel frames produced for a 16 kHz waveform of `len` samples.
#[inline]
#[must_use]
pub fn frame_count(len: usize) -> usize {
    if len < WINDOW_SIZE {
        0
    } else {
        (len - WINDOW_SIZE) / HOP_LENGTH + 1
    }
}

#[inline]
fn hertz_to_mel(freq: f32) -> f32 {
    // Slaney-style mel scale.
    const MIN_LOG_HZ: f32 = 1000.0;
    const MIN_LOG_MEL: f32 = 15.0;
    // Precomputed: ln(6.4)/27.
    const LOGSTEP: f32 = 0.068_751_78;

    let mut mels = 3.0 * freq / 200.0;
    if freq >= MIN_LOG_HZ {
        mels = MIN_LOG_MEL + (freq / MIN_LOG_HZ).ln() * LOGSTEP;
    }
    mels
}

#[inline]
fn mel_to_hertz(mels: f32) -> f32 {
    const MIN_LOG_HZ: f32 = 1000.0;
    const MIN_LOG_MEL: f32 = 15.0;
    const LOGSTEP: f32 = 0.068_751_78;

    let mut freq = 200.0 * mels / 3.0;
    if mels >= MIN_LOG_MEL {
        freq = MIN_LOG_HZ * (LOGSTEP * (mels - MIN_LOG_MEL)).exp();
    }
    freq
}

fn build_mel_filters() -> Vec<f32> {
    let mut fft_freqs = vec![0.0f32; N_FREQ];
    for (f, v) in fft_freqs.iter_mut().enumerate() {
        *v = fft_bin_freq(f);
    }

    let mel_min = hertz_to_mel(0.0);
    let mel_max = hertz_to_mel((SAMPLE_RATE_HZ as f32) / 2.0);

    let mut filter_freqs = vec![0.0f32; MEL_BINS + 2];
    for (i, v) in filter_freqs.iter_mut().enumerate() {
        let mel = mel_min + (mel_max - mel_min) * (i as f32) / ((MEL_BINS + 1) as f32);
        *v = mel_to_hertz(mel);
    }

    let mut filter_diff = vec![0.0f32; MEL_BINS + 1];
    for (i, v) in filter_diff.iter_mut().enumerate() {
        *v = filter_freqs[i + 1] - filter_freqs[i];
        if *v == 0.0 {
            *v = 1e-6;
        }
    }

    let mut filters = vec![0.0f32; MEL_BINS * N_FREQ];
    for m in 0..MEL_BINS {
        let denom = filter_freqs[m + 2] - filter_freqs[m];
        let enorm = 2.0 / denom;
        for f in 0..N_FREQ {
            let down = (fft_freqs[f] - filter_freqs[m]) / filter_diff[m];
            let up = (filter_freqs[m + 2] - fft_freqs[f]) / filter_diff[m + 1];
            let mut val = down.min(up);
            if val < 0.0 {
                val = 0.0;
            }
            filters[m * N_FREQ + f] = val * enorm;
        }
    }

    filters
}

fn build_dft_tables() -> (Vec<f32>, Vec<f32>) {
    let mut cos_t = vec![0.0f32; N_FREQ * FFT_SIZE];
    let mut sin_t = vec![0.0f32; N_FREQ * FFT_SIZE];

    for k in 0..N_FREQ {
        for n in 0..FFT_SIZE {
            let angle = 2.0 * std::f32::consts::PI * (k as f32) * (n as f32) / (FFT_SIZE as f32);
            cos_t[k * FFT_SIZE + n] = angle.cos();
            sin_t[k * FFT_SIZE + n] = angle.sin();
        }
    }

    (cos_t, sin_t)
}

fn build_hann_window() -> [f32; WINDOW_SIZE] {
    let mut w = [0.0f32; WINDOW_SIZE];
    for (i, wi) in w.iter_mut().enumerate() {
        // Periodic Hann: 0.5*(1-cos(2*pi*i/N))
        let angle = 2.0 * std::f32::consts::PI * (i as f32) / (WINDOW_SIZE as f32);
        *wi = 0.5 * (1.0 - angle.cos());
    }
    w
}

/// `[n_frames, MEL_BINS]` row-major log-mel energies.
#[derive(Debug, Clone, PartialEq)]
pub struct MelSpectrogram {
    data: Vec<f32>,
    n_frames: usize,
}

impl MelSpectrogram {
    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn frame(&self, t: usize) -> &[f32] {
        &self.data[t * MEL_BINS..(t + 1) * MEL_BINS]
    }
}

/// One-shot log-mel extractor with per-instance precomputed tables and
/// reusable scratch buffers.
#[derive(Debug)]
pub struct FeatureExtractor {
    mel_filters: Vec<f32>, // [MEL_BINS * N_FREQ]
    dft_cos: Vec<f32>,     // [N_FREQ * FFT_SIZE]
    dft_sin: Vec<f32>,     // [N_FREQ * FFT_SIZE]
    window: [f32; WINDOW_SIZE],

    // Scratch, reused across frames.
    windowed: Vec<f32>, // [FFT_SIZE], tail stays zero (the padding)
    power: Vec<f32>,    // [N_FREQ]
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureExtractor {
    #[must_use]
    pub fn new() -> Self {
        let mel_filters = build_mel_filters();
        let (dft_cos, dft_sin) = build_dft_tables();
        let window = build_hann_window();

        Self {
            mel_filters,
            dft_cos,
            dft_sin,
            window,
            windowed: vec![0.0f32; FFT_SIZE],
            power: vec![0.0f32; N_FREQ],
        }
    }

    /// Extract the full spectrogram from 16 kHz mono samples.
    ///
    /// Deterministic and bit-for-bit reproducible for identical input. Empty
    /// or all-silent input yields a valid (possibly zero-frame) spectrogram.
    pub fn extract(&mut self, samples: &[f32]) -> MelSpectrogram {
        let n_frames = frame_count(samples.len());
        let mut mel = vec![0.0f32; n_frames * MEL_BINS];

        for t in 0..n_frames {
            let start = t * HOP_LENGTH;

            // Window into the zero-padded transform buffer. Elements past
            // WINDOW_SIZE were zeroed at construction and never written.
            for i in 0..WINDOW_SIZE {
                self.windowed[i] = samples[start + i] * self.window[i];
            }

            // Direct real DFT over the padded frame -> power spectrum.
            for (k, pk) in self.power.iter_mut().enumerate() {
                let mut re = 0.0f32;
                let mut im = 0.0f32;
                let cos_row = &self.dft_cos[k * FFT_SIZE..(k + 1) * FFT_SIZE];
                let sin_row = &self.dft_sin[k * FFT_SIZE..(k + 1) * FFT_SIZE];
                for n in 0..FFT_SIZE {
                    re += self.windowed[n] * cos_row[n];
                    im += self.windowed[n] * sin_row[n];
                }
                *pk = re * re + im * im;
            }

            // Mel filters, floor, log.
            let mel_row = &mut mel[t * MEL_BINS..(t + 1) * MEL_BINS];
            for (m, out_m) in mel_row.iter_mut().enumerate() {
                let filt = &self.mel_filters[m * N_FREQ..(m + 1) * N_FREQ];
                let mut sum = 0.0f32;
                for k in 0..N_FREQ {
                    sum += filt[k] * self.power[k];
                }
                if sum < MEL_FLOOR {
                    sum = MEL_FLOOR;
                }
                *out_m = sum.log10();
            }
        }

        MelSpectrogram {
            data: mel,
            n_frames,
        }
    }
}
