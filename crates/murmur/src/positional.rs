//! Sinusoidal position embeddings, cached by sequence length.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Lazily built `[length, dim]` sinusoidal tables.
///
/// The table for a given length is a pure function of `(length, dim)`, built
/// once and shared; repeat lookups are O(1). The cache lives on the encoder
/// instance (not process-wide) so independent model instances stay isolated,
/// and sits behind a mutex so a shared model can serve concurrent requests.
#[derive(Debug)]
pub struct SinusoidalCache {
    dim: usize,
    tables: Mutex<HashMap<usize, Arc<[f32]>>>,
}

impl SinusoidalCache {
    #[must_use]
    pub fn new(dim: usize) -> Self {
        debug_assert!(dim > 0);
        debug_assert_eq!(dim % 2, 0);
        Self {
            dim,
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// `[length, dim]` table: `pe[pos, 2i] = sin(pos * f_i)`,
    /// `pe[pos, 2i+1] = cos(pos * f_i)` with `f_i = 10000^(-2i/dim)`.
    pub fn positions(&self, length: usize) -> Arc<[f32]> {
        // A poisoned guard is still usable: the map only ever holds fully
        // built tables, and the build itself runs outside any partial write.
        let mut tables = self
            .tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(table) = tables.get(&length) {
            return Arc::clone(table);
        }

        let table: Arc<[f32]> = build_table(length, self.dim).into();
        tables.insert(length, Arc::clone(&table));
        table
    }
}

fn build_table(length: usize, dim: usize) -> Vec<f32> {
    let mut table = vec![0.0f32; length * dim];
    for pos in 0..length {
        let row = &mut table[pos * dim..(pos + 1) * dim];
        for pair in 0..(dim / 2) {
            let freq = 10_000.0f32.powf(-((2 * pair) as f32) / (dim as f32));
            let angle = (pos as f32) * freq;
            let (sin, cos) = angle.sin_cos();
            row[2 * pair] = sin;
            row[2 * pair + 1] = cos;
        }
    }
    table
}
