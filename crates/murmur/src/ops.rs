//! Inference ops shared by the encoder and decoder.

use crate::math::softmax_inplace;

/// Linear layer: `y = x * W^T + b`.
///
/// Shapes:
/// - `input`: `[n_rows, in_dim]`
/// - `weight`: `[out_dim, in_dim]`
/// - output: `[n_rows, out_dim]`
pub fn linear(
    input: &[f32],
    n_rows: usize,
    in_dim: usize,
    weight: &[f32],
    out_dim: usize,
    bias: Option<&[f32]>,
) -> Vec<f32> {
    debug_assert_eq!(input.len(), n_rows * in_dim);
    debug_assert_eq!(weight.len(), out_dim * in_dim);
    if let Some(b) = bias {
        debug_assert_eq!(b.len(), out_dim);
    }

    let mut out = vec![0.0f32; n_rows * out_dim];
    for r in 0..n_rows {
        let x = &input[r * in_dim..(r + 1) * in_dim];
        let y = &mut out[r * out_dim..(r + 1) * out_dim];
        for o in 0..out_dim {
            let w = &weight[o * in_dim..(o + 1) * in_dim];
            let mut sum = bias.map_or(0.0, |b| b[o]);
            for i in 0..in_dim {
                sum += x[i] * w[i];
            }
            y[o] = sum;
        }
    }
    out
}

pub fn add_inplace(dst: &mut [f32], src: &[f32]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src.iter().copied()) {
        *d += s;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AttentionShape {
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
}

impl AttentionShape {
    #[inline]
    pub fn kv_group(self) -> usize {
        debug_assert!(self.n_kv_heads > 0);
        debug_assert_eq!(self.n_heads % self.n_kv_heads, 0);
        self.n_heads / self.n_kv_heads
    }
}

/// Scaled dot-product attention with an explicit additive mask.
///
/// Grouped-query: each of `n_kv_heads` key/value heads serves
/// `n_heads / n_kv_heads` query heads (`n_kv_heads == n_heads` gives plain
/// multi-head attention).
///
/// Shapes:
/// - `queries`: `[q_len, n_heads, head_dim]`
/// - `keys` / `values`: `[k_len, n_kv_heads, head_dim]`
/// - `mask`: `[q_len, k_len]` additive (`0.0` keeps, `-inf` forbids)
///
/// Returns: `[q_len, n_heads * head_dim]`.
pub fn attention_masked(
    queries: &[f32],
    keys: &[f32],
    values: &[f32],
    mask: &[f32],
    q_len: usize,
    k_len: usize,
    shape: AttentionShape,
) -> Vec<f32> {
    let AttentionShape {
        n_heads,
        n_kv_heads,
        head_dim,
    } = shape;
    let kv_group = shape.kv_group();

    debug_assert_eq!(queries.len(), q_len * n_heads * head_dim);
    debug_assert_eq!(keys.len(), k_len * n_kv_heads * head_dim);
    debug_assert_eq!(values.len(), k_len * n_kv_heads * head_dim);
    debug_assert_eq!(mask.len(), q_len * k_len);

    let mut out = vec![0.0f32; q_len * n_heads * head_dim];
    let mut scores = vec![0.0f32; k_len];
    let scale = 1.0f32 / (head_dim as f32).sqrt();

    for qi in 0..q_len {
        let mask_row = &mask[qi * k_len..(qi + 1) * k_len];
        for h in 0..n_heads {
            let q_base = (qi * n_heads + h) * head_dim;
            let q = &queries[q_base..q_base + head_dim];
            let kv_h = h / kv_group;

            for (t, score) in scores.iter_mut().enumerate() {
                let bias = mask_row[t];
                if bias == f32::NEG_INFINITY {
                    *score = f32::NEG_INFINITY;
                    continue;
                }
                let k_base = (t * n_kv_heads + kv_h) * head_dim;
                let k = &keys[k_base..k_base + head_dim];
                let mut dot = 0.0f32;
                for i in 0..head_dim {
                    dot += q[i] * k[i];
                }
                *score = dot * scale + bias;
            }

            softmax_inplace(&mut scores);

            let out_h = &mut out[q_base..q_base + head_dim];
            for (t, &a) in scores.iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                let v_base = (t * n_kv_heads + kv_h) * head_dim;
                let v = &values[v_base..v_base + head_dim];
                for i in 0..head_dim {
                    out_h[i] += a * v[i];
                }
            }
        }
    }

    out
}

/// Grouped-query attention for one decode step.
///
/// The single query position attends to every cached key (all of which are
/// already causal), so no mask is needed.
///
/// Shapes:
/// - `query`: `[n_heads, head_dim]`
/// - `keys` / `values`: `[seq_len, n_kv_heads, head_dim]`
///
/// Returns: `[n_heads, head_dim]`.
pub fn attention_gqa_step(
    query: &[f32],
    keys: &[f32],
    values: &[f32],
    seq_len: usize,
    shape: AttentionShape,
) -> Vec<f32> {
    let AttentionShape {
        n_heads,
        n_kv_heads,
        head_dim,
    } = shape;
    let kv_group = shape.kv_group();

    debug_assert_eq!(query.len(), n_heads * head_dim);
    debug_assert_eq!(keys.len(), seq_len * n_kv_heads * head_dim);
    debug_assert_eq!(values.len(), seq_len * n_kv_heads * head_dim);

    let mut out = vec![0.0f32; n_heads * head_dim];
    let mut scores = vec![0.0f32; seq_len];
    let scale = 1.0f32 / (head_dim as f32).sqrt();

    for h in 0..n_heads {
        let q = &query[h * head_dim..(h + 1) * head_dim];
        let kv_h = h / kv_group;

        for (t, score) in scores.iter_mut().enumerate() {
            let k_base = (t * n_kv_heads + kv_h) * head_dim;
            let k = &keys[k_base..k_base + head_dim];
            let mut dot = 0.0f32;
            for i in 0..head_dim {
                dot += q[i] * k[i];
            }
            *score = dot * scale;
        }

        softmax_inplace(&mut scores);

        let out_h = &mut out[h * head_dim..(h + 1) * head_dim];
        for (t, &a) in scores.iter().enumerate() {
            if a == 0.0 {
                continue;
            }
            let v_base = (t * n_kv_heads + kv_h) * head_dim;
            let v = &values[v_base..v_base + head_dim];
            for i in 0..head_dim {
                out_h[i] += a * v[i];
            }
        }
    }

    out
}

/// Lower-triangular causal mask: position i may attend to j iff `j <= i`.
pub fn causal_mask(len: usize) -> Vec<f32> {
    let mut mask = vec![0.0f32; len * len];
    for i in 0..len {
        for j in (i + 1)..len {
            mask[i * len + j] = f32::NEG_INFINITY;
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::{attention_gqa_step, attention_masked, causal_mask, linear, AttentionShape};

    fn lcg_vec(seed: &mut u32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|_| {
                *seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
                ((*seed >> 8) as f32) / ((1u32 << 24) as f32) * 2.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn linear_smoke() {
        // x: [2,3], W: [2,3]
        let x = [1.0f32, 2.0, 3.0, -1.0, 0.0, 1.0];
        let w = [1.0f32, 0.0, -1.0, 2.0, 1.0, 0.0];
        let b = [0.5f32, -1.0];
        let y = linear(&x, 2, 3, &w, 2, Some(&b));
        // row0: [1-3+0.5, 2+2-1] = [-1.5, 3.0]
        // row1: [-1-1+0.5, -2+0-1] = [-1.5, -3.0]
        assert!((y[0] + 1.5).abs() < 1e-6);
        assert!((y[1] - 3.0).abs() < 1e-6);
        assert!((y[2] + 1.5).abs() < 1e-6);
        assert!((y[3] + 3.0).abs() < 1e-6);
    }

    #[test]
    fn masked_attention_last_row_matches_step() {
        let shape = AttentionShape {
            n_heads: 4,
            n_kv_heads: 2,
            head_dim: 3,
        };
        let seq = 5usize;
        let mut seed = 11u32;
        let q = lcg_vec(&mut seed, seq * shape.n_heads * shape.head_dim);
        let k = lcg_vec(&mut seed, seq * shape.n_kv_heads * shape.head_dim);
        let v = lcg_vec(&mut seed, seq * shape.n_kv_heads * shape.head_dim);

        let mask = causal_mask(seq);
        let full = attention_masked(&q, &k, &v, &mask, seq, seq, shape);

        // The last causal row sees the whole sequence, exactly like one
        // decode step with a fully populated cache.
        let q_last = &q[(seq - 1) * shape.n_heads * shape.head_dim..];
        let step = attention_gqa_step(q_last, &k, &v, seq, shape);

        let full_last = &full[(seq - 1) * shape.n_heads * shape.head_dim..];
        for (a, b) in full_last.iter().zip(step.iter()) {
            assert!((a - b).abs() < 1e-5, "got {a}, expected {b}");
        }
    }

    #[test]
    fn masked_out_positions_get_zero_weight() {
        let shape = AttentionShape {
            n_heads: 1,
            n_kv_heads: 1,
            head_dim: 2,
        };
        // One query, two keys; the second key is masked out but has a huge
        // value vector, so any leakage would be visible in the output.
        let q = [1.0f32, 0.0];
        let k = [1.0f32, 0.0, 1.0, 0.0];
        let v = [1.0f32, 2.0, 1e6, 1e6];
        let mask = [0.0f32, f32::NEG_INFINITY];

        let out = attention_masked(&q, &k, &v, &mask, 1, 2, shape);
        assert!((out[0] - 1.0).abs() < 1e-6);
        assert!((out[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn gqa_step_matches_expanded_kv_reference() {
        let shape = AttentionShape {
            n_heads: 4,
            n_kv_heads: 2,
            head_dim: 3,
        };
        let seq_len = 5usize;

        let mut seed = 123u32;
        let q = lcg_vec(&mut seed, shape.n_heads * shape.head_dim);
        let k = lcg_vec(&mut seed, seq_len * shape.n_kv_heads * shape.head_dim);
        let v = lcg_vec(&mut seed, seq_len * shape.n_kv_heads * shape.head_dim);

        let got = attention_gqa_step(&q, &k, &v, seq_len, shape);

        // Reference: expand KV heads to full MHA heads explicitly.
        let repeat = shape.n_heads / shape.n_kv_heads;
        let head_dim = shape.head_dim;
        let mut ref_out = vec![0.0f32; shape.n_heads * head_dim];
        let scale = 1.0f32 / (head_dim as f32).sqrt();
        for h in 0..shape.n_heads {
            let kv_h = h / repeat;
            let qh = &q[h * head_dim..(h + 1) * head_dim];
            let mut scores = vec![0.0f32; seq_len];
            for (t, score) in scores.iter_mut().enumerate() {
                let kb = (t * shape.n_kv_heads + kv_h) * head_dim;
                let kh = &k[kb..kb + head_dim];
                let mut dot = 0.0f32;
                for i in 0..head_dim {
                    dot += qh[i] * kh[i];
                }
                *score = dot * scale;
            }
            let m = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for s in &mut scores {
                *s = (*s - m).exp();
                sum += *s;
            }
            for s in &mut scores {
                *s /= sum;
            }

            let out_h = &mut ref_out[h * head_dim..(h + 1) * head_dim];
            for (t, score) in scores.iter().copied().enumerate() {
                let vb = (t * shape.n_kv_heads + kv_h) * head_dim;
                let vh = &v[vb..vb + head_dim];
                for i in 0..head_dim {
                    out_h[i] += score * vh[i];
                }
            }
        }

        let mut max_diff = 0.0f32;
        for (a, b) in got.iter().zip(ref_out.iter()) {
            let d = (a - b).abs();
            if d > max_diff {
                max_diff = d;
            }
        }
        assert!(max_diff < 1e-5, "max diff {max_diff}");
    }

    #[test]
    fn causal_mask_is_lower_triangular() {
        let m = causal_mask(3);
        for i in 0..3 {
            for j in 0..3 {
                let v = m[i * 3 + j];
                if j <= i {
                    assert_eq!(v, 0.0);
                } else {
                    assert_eq!(v, f32::NEG_INFINITY);
                }
            }
        }
    }
}
