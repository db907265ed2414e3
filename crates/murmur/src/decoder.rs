//! Autoregressive quantized text decoder.
//!
//! A stack of grouped-query-attention transformer blocks (RMSNorm -> QKV ->
//! RoPE -> cache append -> attention -> SwiGLU) over a prefix of projected
//! encoder context plus generated token embeddings. The large matrices are
//! stored quantized ([`QuantizedTensor`]) and dequantized on read.
//!
//! Execution is an explicit two-phase state machine per utterance:
//! one [`Phase::Prefill`] pass over the whole prompt (lower-triangular causal
//! mask, cache populated for every position), then [`Phase::Decode`] steps of
//! exactly one token each until the caller stops. There is no path back to
//! Prefill within an utterance.

use anyhow::Result;

use crate::kv::KvCache;
use crate::math::{rms_norm_rows, rope_interleaved_inplace, silu_inplace};
use crate::ops::{add_inplace, attention_gqa_step, attention_masked, causal_mask, linear, AttentionShape};
use crate::quant::{linear_quantized, QuantizedTensor};
use crate::MurmurError;

#[derive(Debug, Clone, Copy)]
pub struct DecoderConfig {
    pub n_layers: usize,
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    /// Encoder hidden size, for the adapter projection into the decoder stream.
    pub enc_dim: usize,
    pub vocab_size: usize,
    /// Generated-token bound; reaching it is a defined termination, not an error.
    pub max_tokens: usize,
    pub rope_theta: f32,
    pub norm_eps: f32,
}

impl DecoderConfig {
    pub fn validate(self) -> Result<()> {
        anyhow::ensure!(self.n_layers > 0, "n_layers must be > 0");
        anyhow::ensure!(self.dim > 0, "dim must be > 0");
        anyhow::ensure!(self.hidden_dim > 0, "hidden_dim must be > 0");
        anyhow::ensure!(self.n_heads > 0, "n_heads must be > 0");
        anyhow::ensure!(self.n_kv_heads > 0, "n_kv_heads must be > 0");
        anyhow::ensure!(self.head_dim > 0, "head_dim must be > 0");
        anyhow::ensure!(self.head_dim % 2 == 0, "head_dim must be even for RoPE");
        anyhow::ensure!(self.enc_dim > 0, "enc_dim must be > 0");
        anyhow::ensure!(self.vocab_size > 0, "vocab_size must be > 0");
        anyhow::ensure!(self.max_tokens > 0, "max_tokens must be > 0");
        anyhow::ensure!(
            self.n_heads % self.n_kv_heads == 0,
            "n_heads must be divisible by n_kv_heads"
        );
        anyhow::ensure!(
            self.n_heads * self.head_dim >= self.dim,
            "n_heads * head_dim must cover dim"
        );
        Ok(())
    }

    fn shape(self) -> AttentionShape {
        AttentionShape {
            n_heads: self.n_heads,
            n_kv_heads: self.n_kv_heads,
            head_dim: self.head_dim,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecoderLayerWeights {
    pub attention_norm: Vec<f32>, // [dim]
    pub wq: QuantizedTensor,      // [n_heads*head_dim, dim]
    pub wk: QuantizedTensor,      // [n_kv_heads*head_dim, dim]
    pub wv: QuantizedTensor,      // [n_kv_heads*head_dim, dim]
    pub wo: QuantizedTensor,      // [dim, n_heads*head_dim]
    pub ffn_norm: Vec<f32>,       // [dim]
    pub w1: QuantizedTensor,      // [hidden_dim, dim]
    pub w2: QuantizedTensor,      // [dim, hidden_dim]
    pub w3: QuantizedTensor,      // [hidden_dim, dim]
}

impl DecoderLayerWeights {
    pub fn validate(&self, cfg: DecoderConfig) -> Result<()> {
        let q_dim = cfg.n_heads * cfg.head_dim;
        let kv_dim = cfg.n_kv_heads * cfg.head_dim;

        let check = |t: &QuantizedTensor, rows: usize, cols: usize, name: &str| -> Result<()> {
            anyhow::ensure!(
                t.rows == rows && t.cols == cols,
                "{name} shape mismatch: got [{}, {}], want [{rows}, {cols}]",
                t.rows,
                t.cols
            );
            Ok(())
        };

        anyhow::ensure!(
            self.attention_norm.len() == cfg.dim,
            "attention_norm shape mismatch"
        );
        check(&self.wq, q_dim, cfg.dim, "wq")?;
        check(&self.wk, kv_dim, cfg.dim, "wk")?;
        check(&self.wv, kv_dim, cfg.dim, "wv")?;
        check(&self.wo, cfg.dim, q_dim, "wo")?;
        anyhow::ensure!(self.ffn_norm.len() == cfg.dim, "ffn_norm shape mismatch");
        check(&self.w1, cfg.hidden_dim, cfg.dim, "w1")?;
        check(&self.w2, cfg.dim, cfg.hidden_dim, "w2")?;
        check(&self.w3, cfg.hidden_dim, cfg.dim, "w3")?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DecoderWeights {
    pub tok_embeddings: Vec<f32>, // [vocab_size, dim]
    pub adapter: Vec<f32>,        // [dim, enc_dim]
    pub adapter_bias: Vec<f32>,   // [dim]
    pub layers: Vec<DecoderLayerWeights>,
    pub final_norm: Vec<f32>,     // [dim]
    pub lm_head: QuantizedTensor, // [vocab_size, dim]
}

impl DecoderWeights {
    pub fn validate(&self, cfg: DecoderConfig) -> Result<()> {
        anyhow::ensure!(
            self.tok_embeddings.len() == cfg.vocab_size * cfg.dim,
            "tok_embeddings shape mismatch"
        );
        anyhow::ensure!(
            self.adapter.len() == cfg.dim * cfg.enc_dim,
            "adapter shape mismatch"
        );
        anyhow::ensure!(
            self.adapter_bias.len() == cfg.dim,
            "adapter_bias shape mismatch"
        );
        anyhow::ensure!(
            self.layers.len() == cfg.n_layers,
            "expected {} decoder layers, got {}",
            cfg.n_layers,
            self.layers.len()
        );
        for layer in &self.layers {
            layer.validate(cfg)?;
        }
        anyhow::ensure!(self.final_norm.len() == cfg.dim, "final_norm shape mismatch");
        anyhow::ensure!(
            self.lm_head.rows == cfg.vocab_size && self.lm_head.cols == cfg.dim,
            "lm_head shape mismatch"
        );
        Ok(())
    }
}

/// Execution phase of one utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prefill,
    Decode,
}

#[derive(Debug)]
pub struct AutoregressiveDecoder {
    cfg: DecoderConfig,
    weights: DecoderWeights,
}

impl AutoregressiveDecoder {
    pub fn new(cfg: DecoderConfig, weights: DecoderWeights) -> Result<Self> {
        cfg.validate()?;
        weights.validate(cfg)?;
        Ok(Self { cfg, weights })
    }

    pub fn config(&self) -> DecoderConfig {
        self.cfg
    }

    /// Embedding row for one token id.
    pub fn embed_token(&self, token: u32) -> Result<&[f32], MurmurError> {
        let idx = token as usize;
        if idx >= self.cfg.vocab_size {
            return Err(MurmurError::consistency(format!(
                "token id {token} outside vocabulary of {}",
                self.cfg.vocab_size
            )));
        }
        Ok(&self.weights.tok_embeddings[idx * self.cfg.dim..(idx + 1) * self.cfg.dim])
    }

    /// Project `[T, enc_dim]` encoder hidden states into `[T, dim]` decoder rows.
    pub fn project_context(&self, encoder_states: &[f32], t: usize) -> Result<Vec<f32>, MurmurError> {
        if encoder_states.len() != t * self.cfg.enc_dim {
            return Err(MurmurError::consistency(format!(
                "encoder context has {} values, want {} ({} rows of {})",
                encoder_states.len(),
                t * self.cfg.enc_dim,
                t,
                self.cfg.enc_dim
            )));
        }
        Ok(linear(
            encoder_states,
            t,
            self.cfg.enc_dim,
            &self.weights.adapter,
            self.cfg.dim,
            Some(&self.weights.adapter_bias),
        ))
    }

    /// Start a fresh per-utterance session with an empty cache.
    #[must_use]
    pub fn begin(&self) -> DecoderSession<'_> {
        DecoderSession {
            decoder: self,
            cache: KvCache::new(self.cfg.n_layers, self.cfg.n_kv_heads, self.cfg.head_dim),
            phase: Phase::Prefill,
            positions: 0,
        }
    }

    /// One layer over `n_rows` rows starting at absolute position `pos_offset`,
    /// appending each row's K/V and attending with the given additive mask.
    fn layer_forward(
        &self,
        layer_idx: usize,
        hidden: &mut Vec<f32>,
        n_rows: usize,
        pos_offset: usize,
        mask: &[f32],
        cache: &mut KvCache,
    ) {
        let cfg = self.cfg;
        let layer = &self.weights.layers[layer_idx];
        let q_dim = cfg.n_heads * cfg.head_dim;

        let mut norm = vec![0.0f32; n_rows * cfg.dim];
        rms_norm_rows(&mut norm, hidden, &layer.attention_norm, cfg.dim, cfg.norm_eps);

        let mut q = linear_quantized(&norm, n_rows, &layer.wq, None);
        let mut k = linear_quantized(&norm, n_rows, &layer.wk, None);
        let v = linear_quantized(&norm, n_rows, &layer.wv, None);

        rope_interleaved_inplace(&mut q, n_rows, cfg.n_heads, cfg.head_dim, pos_offset, cfg.rope_theta);
        rope_interleaved_inplace(&mut k, n_rows, cfg.n_kv_heads, cfg.head_dim, pos_offset, cfg.rope_theta);

        cache.append_layer(layer_idx, &k, &v, n_rows);
        let (k_cache, v_cache) = cache.layer_tensors(layer_idx);
        let seq_len = cache.layer_len_tokens(layer_idx);

        let attn = if n_rows == 1 {
            attention_gqa_step(&q, k_cache, v_cache, seq_len, cfg.shape())
        } else {
            attention_masked(&q, k_cache, v_cache, mask, n_rows, seq_len, cfg.shape())
        };
        let attn_proj = linear_quantized(&attn, n_rows, &layer.wo, None);
        add_inplace(hidden, &attn_proj);

        rms_norm_rows(&mut norm, hidden, &layer.ffn_norm, cfg.dim, cfg.norm_eps);
        let mut gate = linear_quantized(&norm, n_rows, &layer.w1, None);
        let up = linear_quantized(&norm, n_rows, &layer.w3, None);
        silu_inplace(&mut gate);
        for (g, u) in gate.iter_mut().zip(up.iter().copied()) {
            *g *= u;
        }
        let down = linear_quantized(&gate, n_rows, &layer.w2, None);
        add_inplace(hidden, &down);
    }

    /// Final norm + LM head over the last row only.
    fn logits_for_last_row(&self, hidden: &[f32], n_rows: usize) -> Vec<f32> {
        let cfg = self.cfg;
        let last = &hidden[(n_rows - 1) * cfg.dim..n_rows * cfg.dim];
        let mut norm = vec![0.0f32; cfg.dim];
        rms_norm_rows(&mut norm, last, &self.weights.final_norm, cfg.dim, cfg.norm_eps);
        linear_quantized(&norm, 1, &self.weights.lm_head, None)
    }
}

/// Per-utterance decode state: phase, position counter, and the owned
/// key/value cache. All mutable state lives here, so independent sessions
/// over one shared [`AutoregressiveDecoder`] never interfere.
#[derive(Debug)]
pub struct DecoderSession<'a> {
    decoder: &'a AutoregressiveDecoder,
    cache: KvCache,
    phase: Phase,
    positions: usize,
}

impl DecoderSession<'_> {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Positions processed so far (prompt rows plus decode steps).
    pub fn positions_processed(&self) -> usize {
        self.positions
    }

    /// Verified cache length; must always equal [`Self::positions_processed`].
    pub fn cache_len(&self) -> Result<usize, MurmurError> {
        self.cache.len_tokens()
    }

    /// Discard all utterance state, returning to Prefill with an empty cache.
    pub fn reset(&mut self) {
        self.cache.reset();
        self.phase = Phase::Prefill;
        self.positions = 0;
    }

    fn check_cache(&self) -> Result<(), MurmurError> {
        let len = self.cache.len_tokens()?;
        if len != self.positions {
            return Err(MurmurError::consistency(format!(
                "kv cache holds {len} positions but {} were processed",
                self.positions
            )));
        }
        Ok(())
    }

    /// Process the whole prompt (`[n_rows, dim]` embedded rows) in one causal
    /// pass, populating the cache for every position. Returns logits for the
    /// last position and transitions to Decode.
    pub fn prefill(&mut self, rows: &[f32], n_rows: usize) -> Result<Vec<f32>, MurmurError> {
        if self.phase != Phase::Prefill {
            return Err(MurmurError::consistency(
                "prefill called twice within one utterance",
            ));
        }
        let cfg = self.decoder.cfg;
        if n_rows == 0 || rows.len() != n_rows * cfg.dim {
            return Err(MurmurError::consistency(format!(
                "prefill rows shape mismatch: {} values for {} rows of {}",
                rows.len(),
                n_rows,
                cfg.dim
            )));
        }
        self.check_cache()?;

        let mask = causal_mask(n_rows);
        let mut hidden = rows.to_vec();
        for layer_idx in 0..cfg.n_layers {
            self.decoder
                .layer_forward(layer_idx, &mut hidden, n_rows, 0, &mask, &mut self.cache);
        }

        self.positions = n_rows;
        self.phase = Phase::Decode;
        self.check_cache()?;
        Ok(self.decoder.logits_for_last_row(&hidden, n_rows))
    }

    /// Process exactly one new token, appending one position's K/V per layer
    /// and attending over the whole cache. Returns logits for the new position.
    pub fn step(&mut self, token: u32) -> Result<Vec<f32>, MurmurError> {
        if self.phase != Phase::Decode {
            return Err(MurmurError::consistency("decode step before prefill"));
        }
        self.check_cache()?;

        let cfg = self.decoder.cfg;
        let mut hidden = self.decoder.embed_token(token)?.to_vec();
        for layer_idx in 0..cfg.n_layers {
            self.decoder.layer_forward(
                layer_idx,
                &mut hidden,
                1,
                self.positions,
                &[],
                &mut self.cache,
            );
        }

        self.positions += 1;
        self.check_cache()?;
        Ok(self.decoder.logits_for_last_row(&hidden, 1))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{
        AutoregressiveDecoder, DecoderConfig, DecoderLayerWeights, DecoderWeights, Phase,
    };
    use crate::quant::QuantizedTensor;
    use crate::MurmurError;

    fn lcg_vec(seed: &mut u32, n: usize, amp: f32) -> Vec<f32> {
        (0..n)
            .map(|_| {
                *seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
                (((*seed >> 8) as f32) / ((1u32 << 24) as f32) * 2.0 - 1.0) * amp
            })
            .collect()
    }

    fn lcg_quant(seed: &mut u32, rows: usize, cols: usize) -> QuantizedTensor {
        let data = lcg_vec(seed, rows * cols, 0.05);
        QuantizedTensor::quantize(&data, rows, cols)
    }

    fn small_cfg() -> DecoderConfig {
        DecoderConfig {
            n_layers: 2,
            dim: 8,
            hidden_dim: 16,
            n_heads: 2,
            n_kv_heads: 1,
            head_dim: 4,
            enc_dim: 6,
            vocab_size: 11,
            max_tokens: 8,
            rope_theta: 10_000.0,
            norm_eps: 1e-5,
        }
    }

    pub(crate) fn fake_decoder(cfg: DecoderConfig, seed: u32) -> AutoregressiveDecoder {
        let mut seed = seed;
        let q_dim = cfg.n_heads * cfg.head_dim;
        let kv_dim = cfg.n_kv_heads * cfg.head_dim;

        let layers = (0..cfg.n_layers)
            .map(|_| DecoderLayerWeights {
                attention_norm: lcg_vec(&mut seed, cfg.dim, 0.05),
                wq: lcg_quant(&mut seed, q_dim, cfg.dim),
                wk: lcg_quant(&mut seed, kv_dim, cfg.dim),
                wv: lcg_quant(&mut seed, kv_dim, cfg.dim),
                wo: lcg_quant(&mut seed, cfg.dim, q_dim),
                ffn_norm: lcg_vec(&mut seed, cfg.dim, 0.05),
                w1: lcg_quant(&mut seed, cfg.hidden_dim, cfg.dim),
                w2: lcg_quant(&mut seed, cfg.dim, cfg.hidden_dim),
                w3: lcg_quant(&mut seed, cfg.hidden_dim, cfg.dim),
            })
            .collect();

        let weights = DecoderWeights {
            tok_embeddings: lcg_vec(&mut seed, cfg.vocab_size * cfg.dim, 0.1),
            adapter: lcg_vec(&mut seed, cfg.dim * cfg.enc_dim, 0.1),
            adapter_bias: lcg_vec(&mut seed, cfg.dim, 0.01),
            layers,
            final_norm: lcg_vec(&mut seed, cfg.dim, 0.05),
            lm_head: lcg_quant(&mut seed, cfg.vocab_size, cfg.dim),
        };
        AutoregressiveDecoder::new(cfg, weights).expect("valid fake decoder")
    }

    #[test]
    fn prefill_then_decode_tracks_cache_length() {
        let cfg = small_cfg();
        let decoder = fake_decoder(cfg, 7);
        let mut session = decoder.begin();
        assert_eq!(session.phase(), Phase::Prefill);

        let p = 4usize;
        let mut seed = 3u32;
        let rows = lcg_vec(&mut seed, p * cfg.dim, 0.2);
        let logits = session.prefill(&rows, p).expect("prefill");
        assert_eq!(logits.len(), cfg.vocab_size);
        assert_eq!(session.phase(), Phase::Decode);
        assert_eq!(session.cache_len().expect("cache"), p);

        let n = 3usize;
        for i in 0..n {
            let logits = session.step((i % cfg.vocab_size) as u32).expect("step");
            assert_eq!(logits.len(), cfg.vocab_size);
            assert!(logits.iter().all(|v| v.is_finite()));
        }
        // P + N exactly.
        assert_eq!(session.cache_len().expect("cache"), p + n);
        assert_eq!(session.positions_processed(), p + n);
    }

    #[test]
    fn step_after_prefill_matches_one_longer_prefill() {
        let cfg = small_cfg();
        let decoder = fake_decoder(cfg, 99);

        let p = 3usize;
        let mut seed = 17u32;
        let ctx = lcg_vec(&mut seed, p * cfg.dim, 0.2);
        let token = 5u32;

        // Path A: prefill the prompt, then one decode step for `token`.
        let mut a = decoder.begin();
        a.prefill(&ctx, p).expect("prefill a");
        let step_logits = a.step(token).expect("step");

        // Path B: a single prefill over prompt + embedded token.
        let mut extended = ctx.clone();
        extended.extend_from_slice(decoder.embed_token(token).expect("embed"));
        let mut b = decoder.begin();
        let full_logits = b.prefill(&extended, p + 1).expect("prefill b");

        for (x, y) in step_logits.iter().zip(full_logits.iter()) {
            assert!((x - y).abs() < 1e-4, "causal equivalence broken: {x} vs {y}");
        }
    }

    #[test]
    fn phase_misuse_is_a_consistency_error() {
        let cfg = small_cfg();
        let decoder = fake_decoder(cfg, 1);

        let mut session = decoder.begin();
        let err = session.step(0).unwrap_err();
        assert!(matches!(err, MurmurError::Consistency(_)));

        let rows = vec![0.1f32; 2 * cfg.dim];
        session.prefill(&rows, 2).expect("prefill");
        let err = session.prefill(&rows, 2).unwrap_err();
        assert!(matches!(err, MurmurError::Consistency(_)));
    }

    #[test]
    fn reset_allows_a_fresh_utterance() {
        let cfg = small_cfg();
        let decoder = fake_decoder(cfg, 23);

        let rows = vec![0.3f32; 2 * cfg.dim];
        let mut session = decoder.begin();
        let first = session.prefill(&rows, 2).expect("prefill 1");
        session.step(1).expect("step");

        session.reset();
        assert_eq!(session.phase(), Phase::Prefill);
        assert_eq!(session.cache_len().expect("cache"), 0);

        // Identical prompt after reset reproduces identical logits: no stale
        // context survives the reset.
        let again = session.prefill(&rows, 2).expect("prefill 2");
        assert_eq!(first, again);
    }

    #[test]
    fn out_of_vocab_token_is_rejected() {
        let cfg = small_cfg();
        let decoder = fake_decoder(cfg, 4);
        let mut session = decoder.begin();
        session
            .prefill(&vec![0.1f32; cfg.dim], 1)
            .expect("prefill");
        let err = session.step(cfg.vocab_size as u32).unwrap_err();
        assert!(matches!(err, MurmurError::Consistency(_)));
    }

    #[test]
    fn context_projection_checks_shape() {
        let cfg = small_cfg();
        let decoder = fake_decoder(cfg, 8);
        let ok = decoder.project_context(&vec![0.2f32; 3 * cfg.enc_dim], 3);
        assert_eq!(ok.expect("project").len(), 3 * cfg.dim);

        let err = decoder.project_context(&vec![0.2f32; 5], 3).unwrap_err();
        assert!(matches!(err, MurmurError::Consistency(_)));
    }
}
