//! Per-layer key/value cache for the autoregressive decoder.
//!
//! Append-only within one utterance; `reset()` (never truncation) between
//! utterances sharing a decoder. The cache length must equal the number of
//! positions processed so far, and all layers must agree on it.

use crate::MurmurError;

#[derive(Debug, Clone)]
struct LayerKv {
    keys: Vec<f32>,
    values: Vec<f32>,
    len_tokens: usize,
}

impl LayerKv {
    fn new() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            len_tokens: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KvCache {
    n_layers: usize,
    n_kv_heads: usize,
    head_dim: usize,
    layers: Vec<LayerKv>,
}

impl KvCache {
    #[must_use]
    pub fn new(n_layers: usize, n_kv_heads: usize, head_dim: usize) -> Self {
        debug_assert!(n_layers > 0);
        debug_assert!(n_kv_heads > 0);
        debug_assert!(head_dim > 0);

        Self {
            n_layers,
            n_kv_heads,
            head_dim,
            layers: vec![LayerKv::new(); n_layers],
        }
    }

    /// Append `n_new_tokens` positions of keys/values
    /// (`[n_new_tokens, n_kv_heads, head_dim]` each) to one layer.
    pub fn append_layer(&mut self, layer: usize, k_new: &[f32], v_new: &[f32], n_new_tokens: usize) {
        debug_assert!(layer < self.n_layers);
        if n_new_tokens == 0 {
            return;
        }
        let stride = self.n_kv_heads * self.head_dim;
        debug_assert_eq!(k_new.len(), n_new_tokens * stride);
        debug_assert_eq!(v_new.len(), n_new_tokens * stride);

        let cache = &mut self.layers[layer];
        cache.keys.extend_from_slice(k_new);
        cache.values.extend_from_slice(v_new);
        cache.len_tokens += n_new_tokens;
    }

    pub fn layer_len_tokens(&self, layer: usize) -> usize {
        self.layers[layer].len_tokens
    }

    pub fn layer_tensors(&self, layer: usize) -> (&[f32], &[f32]) {
        let cache = &self.layers[layer];
        (&cache.keys, &cache.values)
    }

    /// Cache length, verified to agree across all layers. Disagreement means
    /// a layer was skipped or double-appended and attention would run over
    /// stale or missing context.
    pub fn len_tokens(&self) -> Result<usize, MurmurError> {
        let len = self.layers[0].len_tokens;
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.len_tokens != len {
                return Err(MurmurError::consistency(format!(
                    "kv cache layer {i} holds {} tokens, layer 0 holds {len}",
                    layer.len_tokens
                )));
            }
        }
        Ok(len)
    }

    /// Discard all cached positions; required between independent utterances.
    pub fn reset(&mut self) {
        for layer in &mut self.layers {
            layer.keys.clear();
            layer.values.clear();
            layer.len_tokens = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::KvCache;

    #[test]
    fn appends_grow_every_layer_independently() {
        let mut kv = KvCache::new(2, 1, 2); // stride=2
        kv.append_layer(0, &[1.0, 2.0], &[3.0, 4.0], 1);
        kv.append_layer(1, &[10.0, 20.0, 30.0, 40.0], &[50.0, 60.0, 70.0, 80.0], 2);

        assert_eq!(kv.layer_len_tokens(0), 1);
        assert_eq!(kv.layer_len_tokens(1), 2);

        let (k0, _) = kv.layer_tensors(0);
        let (k1, _) = kv.layer_tensors(1);
        assert_eq!(k0, &[1.0, 2.0]);
        assert_eq!(k1, &[10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn length_agreement_is_enforced() {
        let mut kv = KvCache::new(2, 1, 2);
        kv.append_layer(0, &[1.0, 2.0], &[3.0, 4.0], 1);
        kv.append_layer(1, &[5.0, 6.0], &[7.0, 8.0], 1);
        assert_eq!(kv.len_tokens().expect("agree"), 1);

        // Skipping layer 1 on the next step must surface as a consistency error.
        kv.append_layer(0, &[9.0, 10.0], &[11.0, 12.0], 1);
        assert!(kv.len_tokens().is_err());
    }

    #[test]
    fn reset_returns_to_empty() {
        let mut kv = KvCache::new(1, 2, 2);
        let k: Vec<f32> = (0..12).map(|x| x as f32).collect();
        let v = k.clone();
        kv.append_layer(0, &k, &v, 3);
        assert_eq!(kv.len_tokens().expect("agree"), 3);

        kv.reset();
        assert_eq!(kv.len_tokens().expect("agree"), 0);
        let (k0, v0) = kv.layer_tensors(0);
        assert!(k0.is_empty() && v0.is_empty());
    }
}
