//! End-to-end transcription pipeline.
//!
//! [`Transcriber`] wires the stages together: validate and resample the
//! waveform, extract log-mel features, encode, project the encoder states
//! into the decoder stream, then run the prefill-and-decode loop until the
//! end-of-text token or the generated-token bound. Reaching the bound is a
//! defined stop; the transcript decoded so far is returned.

use anyhow::{Context, Result};

use crate::audio::resample_linear_mono_f32;
use crate::constants::SAMPLE_RATE_HZ;
use crate::decoder::AutoregressiveDecoder;
use crate::encoder::BlockAttentionEncoder;
use crate::mel::FeatureExtractor;
use crate::model::ModelBundle;
use crate::sampling::{Greedy, TokenPolicy};
use crate::tokenizer::Vocabulary;
use crate::MurmurError;

#[derive(Debug)]
pub struct Transcriber {
    encoder: BlockAttentionEncoder,
    decoder: AutoregressiveDecoder,
    vocabulary: Vocabulary,
    bos_id: u32,
    eos_id: u32,
}

impl Transcriber {
    pub fn new(
        encoder: BlockAttentionEncoder,
        decoder: AutoregressiveDecoder,
        vocabulary: Vocabulary,
    ) -> Result<Self> {
        anyhow::ensure!(
            encoder.config().dim == decoder.config().enc_dim,
            "encoder dim {} does not match decoder enc_dim {}",
            encoder.config().dim,
            decoder.config().enc_dim
        );
        anyhow::ensure!(
            decoder.config().vocab_size == vocabulary.vocab_size(),
            "decoder vocab_size {} does not match tokenizer vocab_size {}",
            decoder.config().vocab_size,
            vocabulary.vocab_size()
        );
        let bos_id = vocabulary.bos_id().context("tokenizer must define <s>")?;
        let eos_id = vocabulary.eos_id().context("tokenizer must define </s>")?;
        Ok(Self {
            encoder,
            decoder,
            vocabulary,
            bos_id,
            eos_id,
        })
    }

    pub fn from_bundle(bundle: &ModelBundle) -> Result<Self> {
        let encoder = bundle.build_encoder()?;
        let decoder = bundle.build_decoder()?;
        Self::new(encoder, decoder, bundle.metadata.vocabulary.clone())
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Transcribe with greedy token selection.
    pub fn transcribe(&self, samples: &[f32], sample_rate_hz: u32) -> Result<String, MurmurError> {
        let mut policy = Greedy;
        self.transcribe_with(samples, sample_rate_hz, &mut policy, None)
    }

    /// Transcribe with a caller-supplied [`TokenPolicy`]; `on_token` fires
    /// once per emitted token id, before detokenization.
    pub fn transcribe_with(
        &self,
        samples: &[f32],
        sample_rate_hz: u32,
        policy: &mut dyn TokenPolicy,
        mut on_token: Option<&mut dyn FnMut(u32)>,
    ) -> Result<String, MurmurError> {
        if sample_rate_hz == 0 {
            return Err(MurmurError::input("sample rate must be > 0"));
        }
        if samples.iter().any(|v| !v.is_finite()) {
            return Err(MurmurError::input("waveform contains non-finite samples"));
        }

        let resampled;
        let samples_16k: &[f32] = if sample_rate_hz == SAMPLE_RATE_HZ {
            samples
        } else {
            resampled = resample_linear_mono_f32(samples, sample_rate_hz, SAMPLE_RATE_HZ);
            &resampled
        };

        let mel = FeatureExtractor::new().extract(samples_16k);
        let t = mel.n_frames();
        if t == 0 {
            return Ok(String::new());
        }

        let encoder_states = self.encoder.forward(&mel)?;

        // Prompt: projected audio context rows, then the BOS embedding.
        let mut prompt = self.decoder.project_context(&encoder_states, t)?;
        prompt.extend_from_slice(self.decoder.embed_token(self.bos_id)?);

        let mut session = self.decoder.begin();
        let mut logits = session.prefill(&prompt, t + 1)?;

        let max_tokens = self.decoder.config().max_tokens;
        let mut token_ids = Vec::new();
        loop {
            let token = policy.select(&logits);
            if token == self.eos_id {
                break;
            }
            token_ids.push(token);
            if let Some(cb) = on_token.as_deref_mut() {
                cb(token);
            }
            // The last admissible token gets no forward pass; its logits
            // would never be consumed.
            if token_ids.len() >= max_tokens {
                break;
            }
            logits = session.step(token)?;
        }

        Ok(self.vocabulary.decode_to_utf8_lossy(&token_ids))
    }
}
