//! Model parameter file (`config.json`) parsing.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::decoder::DecoderConfig;
use crate::encoder::EncoderConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct MurmurParams {
    pub audio: AudioParams,
    pub encoder: EncoderParams,
    pub decoder: DecoderParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioParams {
    pub input_sample_rate: u32,
    pub sample_rate: u32,
    pub num_mel_bins: usize,
    pub hop_length: usize,
    pub window_size: usize,
    pub fft_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncoderParams {
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub head_dim: usize,
    pub hidden_dim: usize,
    pub block_size: usize,
    pub norm_eps: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecoderParams {
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub hidden_dim: usize,
    pub vocab_size: usize,
    pub max_tokens: usize,
    pub rope_theta: f32,
    pub norm_eps: f32,
}

impl MurmurParams {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(json).context("parse config.json")?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let json = std::fs::read_to_string(path_ref)
            .with_context(|| format!("read {}", path_ref.display()))?;
        Self::from_json_str(&json)
    }

    pub fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig {
            n_layers: self.encoder.n_layers,
            dim: self.encoder.dim,
            n_heads: self.encoder.n_heads,
            head_dim: self.encoder.head_dim,
            hidden_dim: self.encoder.hidden_dim,
            block_size: self.encoder.block_size,
            norm_eps: self.encoder.norm_eps,
        }
    }

    pub fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig {
            n_layers: self.decoder.n_layers,
            dim: self.decoder.dim,
            hidden_dim: self.decoder.hidden_dim,
            n_heads: self.decoder.n_heads,
            n_kv_heads: self.decoder.n_kv_heads,
            head_dim: self.decoder.head_dim,
            enc_dim: self.encoder.dim,
            vocab_size: self.decoder.vocab_size,
            max_tokens: self.decoder.max_tokens,
            rope_theta: self.decoder.rope_theta,
            norm_eps: self.decoder.norm_eps,
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.audio.input_sample_rate > 0, "input_sample_rate must be > 0");
        anyhow::ensure!(self.audio.sample_rate > 0, "sample_rate must be > 0");
        anyhow::ensure!(self.audio.num_mel_bins > 0, "num_mel_bins must be > 0");
        anyhow::ensure!(self.audio.hop_length > 0, "hop_length must be > 0");
        anyhow::ensure!(self.audio.window_size > 0, "window_size must be > 0");
        anyhow::ensure!(
            self.audio.fft_size >= self.audio.window_size,
            "fft_size must be >= window_size (frames are zero-padded up, never truncated)"
        );
        self.encoder_config().validate().context("encoder config")?;
        self.decoder_config().validate().context("decoder config")?;
        Ok(())
    }
}
