//! Reduced-precision weight storage.
//!
//! Decoder matrices are stored as `i8` with a per-output-row scale and zero
//! point, and stay quantized for the lifetime of the model. The matmul
//! dequantizes on read; no full-precision copy of a weight matrix is ever
//! materialized.

/// Smallest admissible scale, so an all-constant row never divides by zero.
pub const MIN_SCALE: f32 = 1e-10;

/// `i8` tensor of shape `[rows, cols]` with per-row affine dequantization:
/// `f = (q - zero_point) * scale`.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    pub data: Vec<i8>,
    pub scales: Vec<f32>,      // [rows]
    pub zero_points: Vec<i8>,  // [rows]
    pub rows: usize,
    pub cols: usize,
}

impl QuantizedTensor {
    /// Quantize `data` (`[rows, cols]` row-major f32) with per-row asymmetric
    /// affine quantization into the full `i8` range.
    #[must_use]
    pub fn quantize(data: &[f32], rows: usize, cols: usize) -> Self {
        debug_assert_eq!(data.len(), rows * cols);

        let mut q = vec![0i8; rows * cols];
        let mut scales = vec![0.0f32; rows];
        let mut zero_points = vec![0i8; rows];

        for r in 0..rows {
            let row = &data[r * cols..(r + 1) * cols];
            let mut min_v = f32::INFINITY;
            let mut max_v = f32::NEG_INFINITY;
            for &v in row {
                min_v = min_v.min(v);
                max_v = max_v.max(v);
            }
            if !min_v.is_finite() {
                min_v = 0.0;
                max_v = 0.0;
            }
            // Keep zero exactly representable inside the row's range.
            min_v = min_v.min(0.0);
            max_v = max_v.max(0.0);

            let scale = ((max_v - min_v) / 255.0).max(MIN_SCALE);
            let zp = (-128.0 - min_v / scale).round().clamp(-128.0, 127.0) as i8;

            scales[r] = scale;
            zero_points[r] = zp;
            let q_row = &mut q[r * cols..(r + 1) * cols];
            for (dst, &v) in q_row.iter_mut().zip(row) {
                let qv = (v / scale + f32::from(zp)).round().clamp(-128.0, 127.0);
                *dst = qv as i8;
            }
        }

        Self {
            data: q,
            scales,
            zero_points,
            rows,
            cols,
        }
    }

    /// Assemble from already-quantized storage (e.g. safetensors `qweight` /
    /// `scales` / `zero_points` triplets).
    #[must_use]
    pub fn from_parts(
        data: Vec<i8>,
        scales: Vec<f32>,
        zero_points: Vec<i8>,
        rows: usize,
        cols: usize,
    ) -> Self {
        debug_assert_eq!(data.len(), rows * cols);
        debug_assert_eq!(scales.len(), rows);
        debug_assert_eq!(zero_points.len(), rows);
        Self {
            data,
            scales,
            zero_points,
            rows,
            cols,
        }
    }

    /// Dequantize one row into `out` (`out.len() == cols`).
    pub fn dequantize_row(&self, row: usize, out: &mut [f32]) {
        debug_assert!(row < self.rows);
        debug_assert_eq!(out.len(), self.cols);
        let scale = self.scales[row];
        let zp = f32::from(self.zero_points[row]);
        let q_row = &self.data[row * self.cols..(row + 1) * self.cols];
        for (dst, &q) in out.iter_mut().zip(q_row) {
            *dst = (f32::from(q) - zp) * scale;
        }
    }
}

/// Fused quantized linear layer: `y = x * dequant(W)^T + b`.
///
/// Uses the factored form `scale * (sum(x*q) - zp * sum(x))` per output row,
/// so the weight row is read once in `i8` and never expanded.
///
/// Shapes:
/// - `input`: `[n_rows, in_dim]` with `in_dim == weight.cols`
/// - output: `[n_rows, weight.rows]`
pub fn linear_quantized(
    input: &[f32],
    n_rows: usize,
    weight: &QuantizedTensor,
    bias: Option<&[f32]>,
) -> Vec<f32> {
    let in_dim = weight.cols;
    let out_dim = weight.rows;
    debug_assert_eq!(input.len(), n_rows * in_dim);
    if let Some(b) = bias {
        debug_assert_eq!(b.len(), out_dim);
    }

    let mut out = vec![0.0f32; n_rows * out_dim];
    for r in 0..n_rows {
        let x = &input[r * in_dim..(r + 1) * in_dim];
        let mut x_sum = 0.0f32;
        for &v in x {
            x_sum += v;
        }

        let y = &mut out[r * out_dim..(r + 1) * out_dim];
        for o in 0..out_dim {
            let q_row = &weight.data[o * in_dim..(o + 1) * in_dim];
            let mut dot = 0.0f32;
            for i in 0..in_dim {
                dot += x[i] * f32::from(q_row[i]);
            }
            let zp = f32::from(weight.zero_points[o]);
            y[o] = weight.scales[o] * (dot - zp * x_sum) + bias.map_or(0.0, |b| b[o]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{linear_quantized, QuantizedTensor};
    use crate::ops::linear;

    fn lcg_vec(seed: &mut u32, n: usize, amp: f32) -> Vec<f32> {
        (0..n)
            .map(|_| {
                *seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
                (((*seed >> 8) as f32) / ((1u32 << 24) as f32) * 2.0 - 1.0) * amp
            })
            .collect()
    }

    #[test]
    fn round_trip_error_is_within_half_step() {
        let mut seed = 5u32;
        let rows = 4usize;
        let cols = 32usize;
        let data = lcg_vec(&mut seed, rows * cols, 1.0);

        let q = QuantizedTensor::quantize(&data, rows, cols);
        let mut row = vec![0.0f32; cols];
        for r in 0..rows {
            q.dequantize_row(r, &mut row);
            let tol = q.scales[r] * 0.5 + 1e-6;
            for (a, b) in row.iter().zip(&data[r * cols..(r + 1) * cols]) {
                assert!((a - b).abs() <= tol, "row {r}: {a} vs {b} (tol {tol})");
            }
        }
    }

    #[test]
    fn zero_row_round_trips_to_zero() {
        let q = QuantizedTensor::quantize(&[0.0f32; 8], 1, 8);
        let mut row = vec![1.0f32; 8];
        q.dequantize_row(0, &mut row);
        assert!(row.iter().all(|v| v.abs() < 1e-9));
    }

    #[test]
    fn fused_matmul_matches_dequantize_then_linear() {
        let mut seed = 42u32;
        let rows = 6usize; // out_dim
        let cols = 16usize; // in_dim
        let n = 3usize;
        let w = lcg_vec(&mut seed, rows * cols, 0.5);
        let x = lcg_vec(&mut seed, n * cols, 1.0);
        let b = lcg_vec(&mut seed, rows, 0.1);

        let q = QuantizedTensor::quantize(&w, rows, cols);

        let mut w_deq = vec![0.0f32; rows * cols];
        for r in 0..rows {
            q.dequantize_row(r, &mut w_deq[r * cols..(r + 1) * cols]);
        }

        let fused = linear_quantized(&x, n, &q, Some(&b));
        let reference = linear(&x, n, cols, &w_deq, rows, Some(&b));

        for (a, r) in fused.iter().zip(reference.iter()) {
            assert!((a - r).abs() < 1e-4, "{a} vs {r}");
        }
    }

    #[test]
    fn asymmetric_rows_use_nonzero_zero_point() {
        // A strictly positive row forces the zero point toward -128.
        let data: Vec<f32> = (0..16).map(|i| 1.0 + (i as f32) * 0.1).collect();
        let q = QuantizedTensor::quantize(&data, 1, 16);
        assert_ne!(q.zero_points[0], 0);

        let mut row = vec![0.0f32; 16];
        q.dequantize_row(0, &mut row);
        let tol = q.scales[0] * 0.5 + 1e-6;
        for (a, b) in row.iter().zip(data.iter()) {
            assert!((a - b).abs() <= tol);
        }
    }
}
