//! Vocabulary (`tokenizer.json`) decode support.
//!
//! Token ids are `special tokens` first (by rank), then regular vocab entries
//! whose bytes are stored base64-encoded. Detokenization is byte
//! concatenation with lossy UTF-8 at the end; control tokens render nothing.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct SpecialToken {
    pub id: u32,
    pub text: String,
    pub is_control: bool,
}

#[derive(Debug, Clone)]
pub struct Vocabulary {
    vocab_size: usize,
    special_token_count: usize,
    token_bytes_by_id: Vec<Option<Vec<u8>>>,
    special_tokens: Vec<SpecialToken>,
    special_lookup: HashMap<String, u32>,
}

#[derive(Debug, Deserialize)]
struct VocabFile {
    config: VocabConfig,
    vocab: Vec<VocabEntry>,
    special_tokens: Vec<SpecialEntry>,
}

#[derive(Debug, Deserialize)]
struct VocabConfig {
    vocab_size: usize,
    num_special_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct VocabEntry {
    rank: usize,
    token_bytes: String,
}

#[derive(Debug, Deserialize)]
struct SpecialEntry {
    rank: usize,
    token_str: String,
    is_control: bool,
}

impl Vocabulary {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: VocabFile = serde_json::from_str(json).context("parse tokenizer.json")?;
        anyhow::ensure!(file.config.vocab_size > 0, "vocab_size must be > 0");

        let mut special_slots = vec![None; file.config.num_special_tokens];
        let mut special_lookup = HashMap::<String, u32>::new();
        for entry in file.special_tokens {
            if entry.rank >= special_slots.len() {
                continue;
            }
            let id = entry.rank as u32;
            special_lookup.insert(entry.token_str.clone(), id);
            special_slots[entry.rank] = Some(SpecialToken {
                id,
                text: entry.token_str,
                is_control: entry.is_control,
            });
        }

        let mut special_tokens = Vec::with_capacity(special_slots.len());
        for (rank, slot) in special_slots.into_iter().enumerate() {
            special_tokens.push(slot.unwrap_or(SpecialToken {
                id: rank as u32,
                text: format!("<missing-special-{rank}>"),
                is_control: true,
            }));
        }

        let mut token_bytes_by_id = vec![None; file.config.vocab_size];
        for entry in file.vocab {
            let token_id = file.config.num_special_tokens + entry.rank;
            if token_id >= token_bytes_by_id.len() {
                continue;
            }
            let bytes = STANDARD
                .decode(entry.token_bytes.as_bytes())
                .with_context(|| format!("decode base64 for vocab rank {}", entry.rank))?;
            token_bytes_by_id[token_id] = Some(bytes);
        }

        Ok(Self {
            vocab_size: file.config.vocab_size,
            special_token_count: file.config.num_special_tokens,
            token_bytes_by_id,
            special_tokens,
            special_lookup,
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let json = std::fs::read_to_string(path_ref)
            .with_context(|| format!("read {}", path_ref.display()))?;
        Self::from_json_str(&json)
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn special_token_count(&self) -> usize {
        self.special_token_count
    }

    pub fn special_id(&self, text: &str) -> Option<u32> {
        self.special_lookup.get(text).copied()
    }

    pub fn bos_id(&self) -> Option<u32> {
        self.special_id("<s>")
    }

    pub fn eos_id(&self) -> Option<u32> {
        self.special_id("</s>")
    }

    pub fn decode_token_bytes(&self, token_id: u32) -> Option<&[u8]> {
        let idx = usize::try_from(token_id).ok()?;
        if idx >= self.vocab_size {
            return None;
        }

        if idx < self.special_token_count {
            let st = self.special_tokens.get(idx)?;
            if st.is_control {
                None
            } else {
                Some(st.text.as_bytes())
            }
        } else {
            self.token_bytes_by_id.get(idx)?.as_deref()
        }
    }

    pub fn decode_to_utf8_lossy(&self, token_ids: &[u32]) -> String {
        let mut bytes = Vec::<u8>::new();
        for &id in token_ids {
            if let Some(piece) = self.decode_token_bytes(id) {
                bytes.extend_from_slice(piece);
            }
        }
        String::from_utf8_lossy(&bytes).to_string()
    }
}
