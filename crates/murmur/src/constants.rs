//! Model and signal-processing constants.

/// Sample rate at the system boundary (the rate callers record at).
pub const INPUT_SAMPLE_RATE_HZ: u32 = 24_000;
/// Internal processing rate; input is resampled here before feature extraction.
pub const SAMPLE_RATE_HZ: u32 = 16_000;

// Feature extraction.
pub const MEL_BINS: usize = 128;
pub const HOP_LENGTH: usize = 160; // 10ms @ 16kHz
pub const WINDOW_SIZE: usize = 400; // 25ms @ 16kHz
/// Real-transform size; frames are zero-padded from `WINDOW_SIZE` to this.
pub const FFT_SIZE: usize = 512;
pub const N_FREQ: usize = FFT_SIZE / 2 + 1; // 257
/// Filtered energies are floored here before the log.
pub const MEL_FLOOR: f32 = 1e-10;
