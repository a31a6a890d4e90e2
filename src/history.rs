// src/history.rs
//
// Saved-evaluation history for the demag evaluation speedup.
//
// Up to `order` exact field evaluations are kept, each tagged with its
// simulation time and a monotonically increasing sequence number. Once full,
// a new evaluation claims the slot with the lowest sequence number, so the
// storage cycles like a ring buffer without moving any field data.
//
// Between exact evaluations the field is estimated by Lagrange polynomial
// extrapolation over the stored sample times. Sample times must be distinct;
// the orchestrator guarantees this by only storing at integrator step
// boundaries once steady.

use crate::error::DemagError;
use crate::grid::Grid3D;
use crate::vector_field::VectorField3D;

pub struct HistorySlot {
    pub field: VectorField3D,
    pub time: f64,
    pub seq: u64,
}

pub struct FieldHistory {
    order: usize,
    slots: Vec<HistorySlot>,
    next_seq: u64,
}

impl FieldHistory {
    pub fn new(order: usize) -> Self {
        Self {
            order,
            slots: Vec::with_capacity(order),
            next_seq: 0,
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// All `order` slots hold a saved evaluation.
    pub fn is_full(&self) -> bool {
        self.slots.len() == self.order
    }

    /// Drop all saved evaluations (keeps allocated slots' capacity only).
    pub fn clear(&mut self) {
        self.slots.clear();
        self.next_seq = 0;
    }

    pub fn slots(&self) -> &[HistorySlot] {
        &self.slots
    }

    /// Claim the slot for a new exact evaluation at `time` and return its
    /// field buffer for the caller to fill: a fresh slot while the history
    /// is still filling, afterwards the slot with the lowest sequence
    /// number (the oldest evaluation).
    pub fn claim(&mut self, grid: Grid3D, time: f64) -> Result<&mut VectorField3D, DemagError> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let idx = if self.slots.len() < self.order {
            self.slots.push(HistorySlot {
                field: VectorField3D::try_new(grid)?,
                time,
                seq,
            });
            self.slots.len() - 1
        } else {
            let mut oldest = 0;
            for (i, slot) in self.slots.iter().enumerate() {
                if slot.seq < self.slots[oldest].seq {
                    oldest = i;
                }
            }
            self.slots[oldest].time = time;
            self.slots[oldest].seq = seq;
            oldest
        };

        Ok(&mut self.slots[idx].field)
    }

    /// Lagrange extrapolation weights at `time` over the stored sample
    /// times, in slot order: a_i = prod_{j != i} (t - t_j) / (t_i - t_j).
    ///
    /// With one sample this is [1.0] (reuse the last field unchanged).
    /// Sample times must be pairwise distinct.
    pub fn weights(&self, time: f64) -> Vec<f64> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, si)| {
                let mut a = 1.0;
                for (j, sj) in self.slots.iter().enumerate() {
                    if j != i {
                        a *= (time - sj.time) / (si.time - sj.time);
                    }
                }
                a
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn grid() -> Grid3D {
        Grid3D::new(2, 1, 1, 1e-9, 1e-9, 1e-9)
    }

    #[test]
    fn claim_fills_then_cycles_oldest() {
        let mut h = FieldHistory::new(3);
        for t in 0..4 {
            let field = h.claim(grid(), t as f64).unwrap();
            field.set_uniform(t as f64, 0.0, 0.0);
        }
        assert!(h.is_full());
        assert_eq!(h.len(), 3);

        let mut times: Vec<f64> = h.slots().iter().map(|s| s.time).collect();
        times.sort_by(f64::total_cmp);
        assert_eq!(times, vec![1.0, 2.0, 3.0]);

        // Slot data travels with its tag.
        for slot in h.slots() {
            assert_eq!(slot.field.data[0][0], slot.time);
        }
    }

    #[test]
    fn single_sample_weight_is_unity() {
        let mut h = FieldHistory::new(1);
        h.claim(grid(), 2.5).unwrap();
        assert_eq!(h.weights(7.0), vec![1.0]);
    }

    #[test]
    fn two_sample_weights_extrapolate_linearly() {
        let mut h = FieldHistory::new(2);
        h.claim(grid(), 0.0).unwrap();
        h.claim(grid(), 1.0).unwrap();

        let w = h.weights(1.5);
        assert_abs_diff_eq!(w[0], -0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(w[1], 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(w[0] + w[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn weights_reproduce_polynomials_exactly() {
        // Degree-3 polynomial through 4 samples is extrapolated exactly.
        let p = |t: f64| 2.0 - t + 0.5 * t * t - 0.125 * t * t * t;
        let mut h = FieldHistory::new(4);
        for &t in &[0.0, 0.7, 1.3, 2.0] {
            h.claim(grid(), t).unwrap();
        }
        let t_eval = 2.9;
        let w = h.weights(t_eval);
        let est: f64 = h
            .slots()
            .iter()
            .zip(&w)
            .map(|(s, &a)| a * p(s.time))
            .sum();
        assert_abs_diff_eq!(est, p(t_eval), epsilon = 1e-10);
    }

    #[test]
    fn clear_resets_history() {
        let mut h = FieldHistory::new(2);
        h.claim(grid(), 0.0).unwrap();
        h.clear();
        assert!(h.is_empty());
        assert!(!h.is_full());
    }
}
