//! Token selection policies for the decode loop.
//!
//! The core does not fix a policy; callers plug one in behind this trait.

/// Picks the next token id from the final layer's logits.
pub trait TokenPolicy {
    fn select(&mut self, logits: &[f32]) -> u32;
}

/// Deterministic argmax; ties resolve to the lowest token id.
#[derive(Debug, Clone, Copy, Default)]
pub struct Greedy;

impl TokenPolicy for Greedy {
    fn select(&mut self, logits: &[f32]) -> u32 {
        debug_assert!(!logits.is_empty());
        let mut best = 0usize;
        let mut best_v = f32::NEG_INFINITY;
        for (i, &v) in logits.iter().enumerate() {
            if v > best_v {
                best_v = v;
                best = i;
            }
        }
        best as u32
    }
}
