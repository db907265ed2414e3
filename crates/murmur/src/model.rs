//! High-level model asset loading from a model directory.
//!
//! A model directory holds `config.json` (parameters), `tokenizer.json`
//! (vocabulary) and `model.safetensors` (weights). Decoder matrices may be
//! stored pre-quantized as `<name>.qweight` / `<name>.scales` /
//! `<name>.zero_points` triplets; when only a float `<name>.weight` is
//! present it is quantized per row at load time.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::constants::{FFT_SIZE, HOP_LENGTH, MEL_BINS, SAMPLE_RATE_HZ, WINDOW_SIZE};
use crate::decoder::{AutoregressiveDecoder, DecoderLayerWeights, DecoderWeights};
use crate::encoder::{BlockAttentionEncoder, EncoderLayerWeights, EncoderWeights};
use crate::params::MurmurParams;
use crate::quant::QuantizedTensor;
use crate::tokenizer::Vocabulary;
use crate::weights::WeightStore;

#[derive(Debug)]
pub struct ModelMetadata {
    pub params: MurmurParams,
    pub vocabulary: Vocabulary,
}

#[derive(Debug)]
pub struct ModelBundle {
    pub metadata: ModelMetadata,
    pub weights: WeightStore,
}

fn params_path(dir: &Path) -> PathBuf {
    dir.join("config.json")
}

fn tokenizer_path(dir: &Path) -> PathBuf {
    dir.join("tokenizer.json")
}

fn weights_path(dir: &Path) -> PathBuf {
    dir.join("model.safetensors")
}

impl ModelMetadata {
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let params = MurmurParams::from_path(params_path(dir)).context("load config.json")?;
        let vocabulary =
            Vocabulary::from_path(tokenizer_path(dir)).context("load tokenizer.json")?;

        // The feature extractor is compiled against fixed audio geometry, so a
        // model trained with different framing cannot be served.
        anyhow::ensure!(
            params.audio.sample_rate == SAMPLE_RATE_HZ,
            "model sample_rate {} != supported {SAMPLE_RATE_HZ}",
            params.audio.sample_rate
        );
        anyhow::ensure!(params.audio.num_mel_bins == MEL_BINS, "num_mel_bins mismatch");
        anyhow::ensure!(params.audio.hop_length == HOP_LENGTH, "hop_length mismatch");
        anyhow::ensure!(params.audio.window_size == WINDOW_SIZE, "window_size mismatch");
        anyhow::ensure!(params.audio.fft_size == FFT_SIZE, "fft_size mismatch");
        anyhow::ensure!(
            params.decoder.vocab_size == vocabulary.vocab_size(),
            "config vocab_size {} != tokenizer vocab_size {}",
            params.decoder.vocab_size,
            vocabulary.vocab_size()
        );

        Ok(Self { params, vocabulary })
    }
}

impl ModelBundle {
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let metadata = ModelMetadata::load_from_dir(dir)?;
        let weights = WeightStore::open(weights_path(dir)).context("load model.safetensors")?;
        Ok(Self { metadata, weights })
    }

    /// Fetch `<name>.weight` as a flat f32 vector of exactly `len` values.
    fn float_weight(&self, name: &str, len: usize) -> Result<Vec<f32>> {
        let full = format!("{name}.weight");
        let t = self
            .weights
            .tensor_f32(&full)
            .with_context(|| format!("load tensor {full}"))?;
        anyhow::ensure!(
            t.data.len() == len,
            "tensor {full} has {} values, want {len}",
            t.data.len()
        );
        Ok(t.data)
    }

    fn float_bias(&self, name: &str, len: usize) -> Result<Vec<f32>> {
        let full = format!("{name}.bias");
        let t = self
            .weights
            .tensor_f32(&full)
            .with_context(|| format!("load tensor {full}"))?;
        anyhow::ensure!(
            t.data.len() == len,
            "tensor {full} has {} values, want {len}",
            t.data.len()
        );
        Ok(t.data)
    }

    /// Fetch a `[rows, cols]` matrix in quantized form. Prefers the stored
    /// `qweight`/`scales`/`zero_points` triplet; falls back to quantizing a
    /// float `weight` tensor.
    fn quantized_weight(&self, name: &str, rows: usize, cols: usize) -> Result<QuantizedTensor> {
        let q_name = format!("{name}.qweight");
        if self
            .weights
            .has_tensor(&q_name)
            .with_context(|| format!("probe tensor {q_name}"))?
        {
            let q = self
                .weights
                .tensor_i8(&q_name)
                .with_context(|| format!("load tensor {q_name}"))?;
            anyhow::ensure!(
                q.data.len() == rows * cols,
                "tensor {q_name} has {} values, want {rows}x{cols}",
                q.data.len()
            );
            let scales = self.float_weight_raw(&format!("{name}.scales"), rows)?;
            let zp = self
                .weights
                .tensor_i8(&format!("{name}.zero_points"))
                .with_context(|| format!("load tensor {name}.zero_points"))?;
            anyhow::ensure!(
                zp.data.len() == rows,
                "tensor {name}.zero_points has {} values, want {rows}",
                zp.data.len()
            );
            return Ok(QuantizedTensor::from_parts(q.data, scales, zp.data, rows, cols));
        }

        let f = self.float_weight(name, rows * cols)?;
        Ok(QuantizedTensor::quantize(&f, rows, cols))
    }

    fn float_weight_raw(&self, full: &str, len: usize) -> Result<Vec<f32>> {
        let t = self
            .weights
            .tensor_f32(full)
            .with_context(|| format!("load tensor {full}"))?;
        anyhow::ensure!(
            t.data.len() == len,
            "tensor {full} has {} values, want {len}",
            t.data.len()
        );
        Ok(t.data)
    }

    /// Materialize the audio encoder.
    pub fn build_encoder(&self) -> Result<BlockAttentionEncoder> {
        let cfg = self.metadata.params.encoder_config();
        let q_dim = cfg.n_heads * cfg.head_dim;

        let mut layers = Vec::with_capacity(cfg.n_layers);
        for i in 0..cfg.n_layers {
            let p = format!("encoder.layers.{i}");
            layers.push(EncoderLayerWeights {
                attn_norm_gamma: self.float_weight(&format!("{p}.attn_norm"), cfg.dim)?,
                attn_norm_beta: self.float_bias(&format!("{p}.attn_norm"), cfg.dim)?,
                wq: self.float_weight(&format!("{p}.attention.wq"), q_dim * cfg.dim)?,
                bq: self.float_bias(&format!("{p}.attention.wq"), q_dim)?,
                wk: self.float_weight(&format!("{p}.attention.wk"), q_dim * cfg.dim)?,
                bk: self.float_bias(&format!("{p}.attention.wk"), q_dim)?,
                wv: self.float_weight(&format!("{p}.attention.wv"), q_dim * cfg.dim)?,
                bv: self.float_bias(&format!("{p}.attention.wv"), q_dim)?,
                wo: self.float_weight(&format!("{p}.attention.wo"), cfg.dim * q_dim)?,
                bo: self.float_bias(&format!("{p}.attention.wo"), cfg.dim)?,
                ffn_norm_gamma: self.float_weight(&format!("{p}.ffn_norm"), cfg.dim)?,
                ffn_norm_beta: self.float_bias(&format!("{p}.ffn_norm"), cfg.dim)?,
                w1: self.float_weight(&format!("{p}.feed_forward.w1"), cfg.hidden_dim * cfg.dim)?,
                b1: self.float_bias(&format!("{p}.feed_forward.w1"), cfg.hidden_dim)?,
                w2: self.float_weight(&format!("{p}.feed_forward.w2"), cfg.dim * cfg.hidden_dim)?,
                b2: self.float_bias(&format!("{p}.feed_forward.w2"), cfg.dim)?,
            });
        }

        let weights = EncoderWeights {
            input_proj: self.float_weight("encoder.input_proj", cfg.dim * MEL_BINS)?,
            input_bias: self.float_bias("encoder.input_proj", cfg.dim)?,
            layers,
        };
        BlockAttentionEncoder::new(cfg, weights).context("assemble encoder")
    }

    /// Materialize the text decoder.
    pub fn build_decoder(&self) -> Result<AutoregressiveDecoder> {
        let cfg = self.metadata.params.decoder_config();
        let q_dim = cfg.n_heads * cfg.head_dim;
        let kv_dim = cfg.n_kv_heads * cfg.head_dim;

        let mut layers = Vec::with_capacity(cfg.n_layers);
        for i in 0..cfg.n_layers {
            let p = format!("decoder.layers.{i}");
            layers.push(DecoderLayerWeights {
                attention_norm: self.float_weight(&format!("{p}.attention_norm"), cfg.dim)?,
                wq: self.quantized_weight(&format!("{p}.attention.wq"), q_dim, cfg.dim)?,
                wk: self.quantized_weight(&format!("{p}.attention.wk"), kv_dim, cfg.dim)?,
                wv: self.quantized_weight(&format!("{p}.attention.wv"), kv_dim, cfg.dim)?,
                wo: self.quantized_weight(&format!("{p}.attention.wo"), cfg.dim, q_dim)?,
                ffn_norm: self.float_weight(&format!("{p}.ffn_norm"), cfg.dim)?,
                w1: self.quantized_weight(
                    &format!("{p}.feed_forward.w1"),
                    cfg.hidden_dim,
                    cfg.dim,
                )?,
                w2: self.quantized_weight(
                    &format!("{p}.feed_forward.w2"),
                    cfg.dim,
                    cfg.hidden_dim,
                )?,
                w3: self.quantized_weight(
                    &format!("{p}.feed_forward.w3"),
                    cfg.hidden_dim,
                    cfg.dim,
                )?,
            });
        }

        let weights = DecoderWeights {
            tok_embeddings: self.float_weight("decoder.tok_embeddings", cfg.vocab_size * cfg.dim)?,
            adapter: self.float_weight("decoder.adapter", cfg.dim * cfg.enc_dim)?,
            adapter_bias: self.float_bias("decoder.adapter", cfg.dim)?,
            layers,
            final_norm: self.float_weight("decoder.norm", cfg.dim)?,
            lm_head: self.quantized_weight("decoder.output", cfg.vocab_size, cfg.dim)?,
        };
        AutoregressiveDecoder::new(cfg, weights).context("assemble decoder")
    }
}
