//! Audio utilities: mono f32 samples, linear resampling, minimal WAV input.

/// Linearly resample `input` from `src_hz` to `dst_hz`.
#[must_use]
pub fn resample_linear_mono_f32(input: &[f32], src_hz: u32, dst_hz: u32) -> Vec<f32> {
    if src_hz == dst_hz || input.is_empty() {
        return input.to_vec();
    }

    let new_n_u64 = (input.len() as u64) * u64::from(dst_hz) / u64::from(src_hz);
    let new_n = usize::try_from(new_n_u64).expect("resampled length overflowed usize");
    let mut out = vec![0.0f32; new_n];

    for (i, y) in out.iter_mut().enumerate() {
        let src_pos = (i as f32) * (src_hz as f32) / (dst_hz as f32);
        let idx = src_pos.floor() as usize;
        let frac = src_pos - (idx as f32);

        let a = input.get(idx).copied().unwrap_or(0.0);
        let b = input.get(idx + 1).copied().unwrap_or(a);
        *y = a * (1.0 - frac) + b * frac;
    }

    out
}

#[derive(Debug, Clone)]
pub struct WavData {
    pub sample_rate_hz: u32,
    pub channels: u16,
    pub samples_mono: Vec<f32>,
}

#[derive(Debug, thiserror::Error)]
pub enum WavError {
    #[error("not a valid WAV file")]
    InvalidHeader,
    #[error("unsupported WAV format (need 16-bit PCM)")]
    UnsupportedFormat,
    #[error("malformed WAV chunks")]
    MalformedChunks,
}

fn read_u16_le(p: &[u8]) -> u16 {
    u16::from_le_bytes([p[0], p[1]])
}

fn read_u32_le(p: &[u8]) -> u32 {
    u32::from_le_bytes([p[0], p[1], p[2], p[3]])
}

/// Parse WAV bytes and return mono `f32` samples at the file's sample rate.
///
/// Supports: PCM (`audio_format=1`), 16-bit, >=1 channels (downmixed).
pub fn parse_wav_bytes(data: &[u8]) -> Result<WavData, WavError> {
    if data.len() < 44 || &data[0..4] != b"RIFF" || &data[8..12] != b"WAVE" {
        return Err(WavError::InvalidHeader);
    }

    let mut channels: u16 = 0;
    let mut sample_rate_hz: u32 = 0;
    let mut bits_per_sample: u16 = 0;
    let mut audio_format: u16 = 0;

    let mut pcm_data: Option<&[u8]> = None;

    let mut p = 12usize;
    while p + 8 <= data.len() {
        let chunk_id = &data[p..p + 4];
        let chunk_size = read_u32_le(&data[p + 4..p + 8]) as usize;
        let chunk_data_start = p + 8;
        let chunk_data_end = chunk_data_start.saturating_add(chunk_size);
        if chunk_data_end > data.len() {
            break;
        }

        if chunk_id == b"fmt " && chunk_size >= 16 {
            audio_format = read_u16_le(&data[chunk_data_start..chunk_data_start + 2]);
            channels = read_u16_le(&data[chunk_data_start + 2..chunk_data_start + 4]);
            sample_rate_hz = read_u32_le(&data[chunk_data_start + 4..chunk_data_start + 8]);
            bits_per_sample = read_u16_le(&data[chunk_data_start + 14..chunk_data_start + 16]);
        } else if chunk_id == b"data" {
            pcm_data = Some(&data[chunk_data_start..chunk_data_end]);
        }

        p = chunk_data_end;
        if chunk_size & 1 == 1 {
            p = p.saturating_add(1);
        }
    }

    let Some(pcm_data) = pcm_data else {
        return Err(WavError::MalformedChunks);
    };

    if audio_format != 1 || bits_per_sample != 16 || channels < 1 {
        return Err(WavError::UnsupportedFormat);
    }

    let frame_bytes = usize::from(channels) * 2;
    let n_frames = pcm_data.len() / frame_bytes;

    let mut samples_mono = Vec::with_capacity(n_frames);
    for i in 0..n_frames {
        let frame = &pcm_data[i * frame_bytes..(i + 1) * frame_bytes];
        if channels == 1 {
            let s = i16::from_le_bytes([frame[0], frame[1]]);
            samples_mono.push((s as f32) / 32768.0);
        } else {
            let mut sum = 0.0f32;
            for c in 0..channels {
                let off = (c as usize) * 2;
                let s = i16::from_le_bytes([frame[off], frame[off + 1]]);
                sum += (s as f32) / 32768.0;
            }
            samples_mono.push(sum / (channels as f32));
        }
    }

    Ok(WavData {
        sample_rate_hz,
        channels,
        samples_mono,
    })
}
