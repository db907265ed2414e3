//! Block-attention audio encoder.
//!
//! A stack of identical transformer blocks (LayerNorm -> self-attention ->
//! residual -> LayerNorm -> GELU MLP -> residual) over mel frames, with
//! self-attention confined to same-block frames. Each block span runs as an
//! independent attention problem, so per-layer attention compute and scratch
//! scale with the block size, not the total sequence length. Blocks restrict
//! the attention span only; sequence length is preserved end to end.

use anyhow::Result;

use crate::constants::MEL_BINS;
use crate::math::{gelu_inplace, layer_norm_rows};
use crate::mel::MelSpectrogram;
use crate::ops::{add_inplace, attention_masked, linear, AttentionShape};
use crate::positional::SinusoidalCache;
use crate::MurmurError;

#[derive(Debug, Clone, Copy)]
pub struct EncoderConfig {
    pub n_layers: usize,
    pub dim: usize,
    pub n_heads: usize,
    pub head_dim: usize,
    pub hidden_dim: usize,
    /// Attention span in frames; `block_id(i) = i / block_size`.
    pub block_size: usize,
    pub norm_eps: f32,
}

impl EncoderConfig {
    pub fn validate(self) -> Result<()> {
        anyhow::ensure!(self.n_layers > 0, "n_layers must be > 0");
        anyhow::ensure!(self.dim > 0, "dim must be > 0");
        anyhow::ensure!(self.dim % 2 == 0, "dim must be even for sinusoidal positions");
        anyhow::ensure!(self.n_heads > 0, "n_heads must be > 0");
        anyhow::ensure!(self.head_dim > 0, "head_dim must be > 0");
        anyhow::ensure!(self.hidden_dim > 0, "hidden_dim must be > 0");
        anyhow::ensure!(self.block_size > 0, "block_size must be > 0");
        anyhow::ensure!(
            self.n_heads * self.head_dim >= self.dim,
            "n_heads * head_dim must cover dim"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EncoderLayerWeights {
    pub attn_norm_gamma: Vec<f32>, // [dim]
    pub attn_norm_beta: Vec<f32>,  // [dim]
    pub wq: Vec<f32>,              // [n_heads*head_dim, dim]
    pub bq: Vec<f32>,              // [n_heads*head_dim]
    pub wk: Vec<f32>,              // [n_heads*head_dim, dim]
    pub bk: Vec<f32>,              // [n_heads*head_dim]
    pub wv: Vec<f32>,              // [n_heads*head_dim, dim]
    pub bv: Vec<f32>,              // [n_heads*head_dim]
    pub wo: Vec<f32>,              // [dim, n_heads*head_dim]
    pub bo: Vec<f32>,              // [dim]
    pub ffn_norm_gamma: Vec<f32>,  // [dim]
    pub ffn_norm_beta: Vec<f32>,   // [dim]
    pub w1: Vec<f32>,              // [hidden_dim, dim]
    pub b1: Vec<f32>,              // [hidden_dim]
    pub w2: Vec<f32>,              // [dim, hidden_dim]
    pub b2: Vec<f32>,              // [dim]
}

impl EncoderLayerWeights {
    pub fn validate(&self, cfg: EncoderConfig) -> Result<()> {
        let q_dim = cfg.n_heads * cfg.head_dim;
        anyhow::ensure!(self.attn_norm_gamma.len() == cfg.dim, "attn_norm_gamma shape");
        anyhow::ensure!(self.attn_norm_beta.len() == cfg.dim, "attn_norm_beta shape");
        anyhow::ensure!(self.wq.len() == q_dim * cfg.dim, "wq shape");
        anyhow::ensure!(self.bq.len() == q_dim, "bq shape");
        anyhow::ensure!(self.wk.len() == q_dim * cfg.dim, "wk shape");
        anyhow::ensure!(self.bk.len() == q_dim, "bk shape");
        anyhow::ensure!(self.wv.len() == q_dim * cfg.dim, "wv shape");
        anyhow::ensure!(self.bv.len() == q_dim, "bv shape");
        anyhow::ensure!(self.wo.len() == cfg.dim * q_dim, "wo shape");
        anyhow::ensure!(self.bo.len() == cfg.dim, "bo shape");
        anyhow::ensure!(self.ffn_norm_gamma.len() == cfg.dim, "ffn_norm_gamma shape");
        anyhow::ensure!(self.ffn_norm_beta.len() == cfg.dim, "ffn_norm_beta shape");
        anyhow::ensure!(self.w1.len() == cfg.hidden_dim * cfg.dim, "w1 shape");
        anyhow::ensure!(self.b1.len() == cfg.hidden_dim, "b1 shape");
        anyhow::ensure!(self.w2.len() == cfg.dim * cfg.hidden_dim, "w2 shape");
        anyhow::ensure!(self.b2.len() == cfg.dim, "b2 shape");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EncoderWeights {
    pub input_proj: Vec<f32>, // [dim, MEL_BINS]
    pub input_bias: Vec<f32>, // [dim]
    pub layers: Vec<EncoderLayerWeights>,
}

impl EncoderWeights {
    pub fn validate(&self, cfg: EncoderConfig) -> Result<()> {
        anyhow::ensure!(
            self.input_proj.len() == cfg.dim * MEL_BINS,
            "input_proj shape"
        );
        anyhow::ensure!(self.input_bias.len() == cfg.dim, "input_bias shape");
        anyhow::ensure!(
            self.layers.len() == cfg.n_layers,
            "expected {} encoder layers, got {}",
            cfg.n_layers,
            self.layers.len()
        );
        for layer in &self.layers {
            layer.validate(cfg)?;
        }
        Ok(())
    }
}

/// Block id per frame: fixed-size chunking, monotonically non-decreasing.
#[must_use]
pub fn block_ids(n_frames: usize, block_size: usize) -> Vec<usize> {
    debug_assert!(block_size > 0);
    (0..n_frames).map(|i| i / block_size).collect()
}

/// Contiguous `[start, end)` frame spans of equal block id.
///
/// Block ids come from deterministic chunking, never untrusted input, so a
/// non-monotonic sequence is a programming error and fails the request.
pub fn block_spans(ids: &[usize]) -> Result<Vec<(usize, usize)>, MurmurError> {
    for w in ids.windows(2) {
        if w[1] < w[0] {
            return Err(MurmurError::consistency(format!(
                "block ids must be non-decreasing, got {} after {}",
                w[1], w[0]
            )));
        }
    }

    let mut spans = Vec::new();
    let mut start = 0usize;
    for i in 1..=ids.len() {
        if i == ids.len() || ids[i] != ids[start] {
            spans.push((start, i));
            start = i;
        }
    }
    Ok(spans)
}

#[derive(Debug)]
pub struct BlockAttentionEncoder {
    cfg: EncoderConfig,
    weights: EncoderWeights,
    positions: SinusoidalCache,
}

impl BlockAttentionEncoder {
    pub fn new(cfg: EncoderConfig, weights: EncoderWeights) -> Result<Self> {
        cfg.validate()?;
        weights.validate(cfg)?;
        Ok(Self {
            cfg,
            weights,
            positions: SinusoidalCache::new(cfg.dim),
        })
    }

    pub fn config(&self) -> EncoderConfig {
        self.cfg
    }

    /// Encode mel features into `[T, dim]` hidden states.
    pub fn forward(&self, mel: &MelSpectrogram) -> Result<Vec<f32>, MurmurError> {
        let t = mel.n_frames();
        let cfg = self.cfg;
        if t == 0 {
            return Ok(Vec::new());
        }

        let q_dim = cfg.n_heads * cfg.head_dim;
        let shape = AttentionShape {
            n_heads: cfg.n_heads,
            n_kv_heads: cfg.n_heads,
            head_dim: cfg.head_dim,
        };

        // Input projection + additive sinusoidal positions.
        let mut hidden = linear(
            mel.data(),
            t,
            MEL_BINS,
            &self.weights.input_proj,
            cfg.dim,
            Some(&self.weights.input_bias),
        );
        let pos = self.positions.positions(t);
        add_inplace(&mut hidden, &pos);

        let ids = block_ids(t, cfg.block_size);
        let spans = block_spans(&ids)?;
        // Frames in one span all share a block id, so each span is full
        // (unmasked) attention over at most block_size positions. The mask
        // buffer is sized by the block, never by T.
        let zero_mask = vec![0.0f32; cfg.block_size * cfg.block_size];

        let mut norm = vec![0.0f32; t * cfg.dim];
        let mut attn = vec![0.0f32; t * q_dim];
        for layer in &self.weights.layers {
            // Attention branch.
            layer_norm_rows(
                &mut norm,
                &hidden,
                &layer.attn_norm_gamma,
                &layer.attn_norm_beta,
                cfg.dim,
                cfg.norm_eps,
            );
            let q = linear(&norm, t, cfg.dim, &layer.wq, q_dim, Some(&layer.bq));
            let k = linear(&norm, t, cfg.dim, &layer.wk, q_dim, Some(&layer.bk));
            let v = linear(&norm, t, cfg.dim, &layer.wv, q_dim, Some(&layer.bv));

            for &(start, end) in &spans {
                let b = end - start;
                let span_attn = attention_masked(
                    &q[start * q_dim..end * q_dim],
                    &k[start * q_dim..end * q_dim],
                    &v[start * q_dim..end * q_dim],
                    &zero_mask[..b * b],
                    b,
                    b,
                    shape,
                );
                attn[start * q_dim..end * q_dim].copy_from_slice(&span_attn);
            }
            let attn_proj = linear(&attn, t, q_dim, &layer.wo, cfg.dim, Some(&layer.bo));
            add_inplace(&mut hidden, &attn_proj);

            // MLP branch.
            layer_norm_rows(
                &mut norm,
                &hidden,
                &layer.ffn_norm_gamma,
                &layer.ffn_norm_beta,
                cfg.dim,
                cfg.norm_eps,
            );
            let mut up = linear(&norm, t, cfg.dim, &layer.w1, cfg.hidden_dim, Some(&layer.b1));
            gelu_inplace(&mut up);
            let down = linear(&up, t, cfg.hidden_dim, &layer.w2, cfg.dim, Some(&layer.b2));
            add_inplace(&mut hidden, &down);
        }

        Ok(hidden)
    }
}
