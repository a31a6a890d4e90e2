// src/macrocell.rs
//
// Macrocell (coarse-grid) transfer for the demag convolution.
//
// When a macrocell size is requested, the convolution runs on a coarser
// grid: fine moments are averaged into macrocells on the way in, and the
// coarse field is broadcast back onto the fine cells on the way out. A
// requested size that is not an exact multiple of the native cell, or does
// not tile the grid, reverts to the native cell.

use rayon::prelude::*;

use crate::grid::Grid3D;
use crate::vector_field::VectorField3D;

/// Fine/coarse grid pair with per-axis decimation factors.
pub struct MacrocellMap {
    fine: Grid3D,
    coarse: Grid3D,
    factor: [usize; 3],
}

impl MacrocellMap {
    /// Build the map for a requested macrocell size. Returns None when the
    /// corrected size is the native cell (no coarse pass needed).
    pub fn new(fine: Grid3D, requested: [f64; 3]) -> Option<Self> {
        let factor = Self::factors(fine, requested)?;
        if factor == [1, 1, 1] {
            return None;
        }
        let coarse = Grid3D::new(
            fine.nx / factor[0],
            fine.ny / factor[1],
            fine.nz / factor[2],
            fine.dx * factor[0] as f64,
            fine.dy * factor[1] as f64,
            fine.dz * factor[2] as f64,
        );
        Some(Self { fine, coarse, factor })
    }

    /// Per-axis decimation factors for a requested size, or None when the
    /// request must revert to the native cell.
    fn factors(fine: Grid3D, requested: [f64; 3]) -> Option<[usize; 3]> {
        let axis = |req: f64, d: f64, n: usize| -> Option<usize> {
            let f = (req / d).round();
            if f < 1.0 || (f * d - req).abs() > 1e-6 * d {
                return None;
            }
            let f = f as usize;
            (n % f == 0).then_some(f)
        };

        let fx = axis(requested[0], fine.dx, fine.nx);
        let fy = axis(requested[1], fine.dy, fine.ny);
        let fz = axis(requested[2], fine.dz, fine.nz);
        match (fx, fy, fz) {
            (Some(fx), Some(fy), Some(fz)) => Some([fx, fy, fz]),
            _ => {
                tracing::warn!(
                    ?requested,
                    "macrocell size does not tile the grid, reverting to native cell"
                );
                None
            }
        }
    }

    pub fn fine(&self) -> Grid3D {
        self.fine
    }

    pub fn coarse(&self) -> Grid3D {
        self.coarse
    }

    pub fn factor(&self) -> [usize; 3] {
        self.factor
    }

    /// Average fine moments into macrocells: each coarse cell carries the
    /// total fine moment divided by the macrocell volume, so total moment is
    /// conserved.
    pub fn transfer_in(&self, fine: &VectorField3D, coarse: &mut VectorField3D) {
        debug_assert_eq!(fine.grid, self.fine);
        debug_assert_eq!(coarse.grid, self.coarse);

        let [fx, fy, fz] = self.factor;
        let g = self.fine;
        let cg = self.coarse;
        let inv = 1.0 / (fx * fy * fz) as f64;

        coarse.data.par_iter_mut().enumerate().for_each(|(cidx, out)| {
            let ci = cidx % cg.nx;
            let cj = (cidx / cg.nx) % cg.ny;
            let ck = cidx / (cg.nx * cg.ny);

            let mut acc = [0.0; 3];
            for k in ck * fz..(ck + 1) * fz {
                for j in cj * fy..(cj + 1) * fy {
                    for i in ci * fx..(ci + 1) * fx {
                        let v = fine.data[g.idx(i, j, k)];
                        acc[0] += v[0];
                        acc[1] += v[1];
                        acc[2] += v[2];
                    }
                }
            }
            *out = [acc[0] * inv, acc[1] * inv, acc[2] * inv];
        });
    }

    /// Broadcast the coarse field back, adding each macrocell's value onto
    /// every fine cell it covers.
    pub fn transfer_out_add(&self, coarse: &VectorField3D, fine: &mut VectorField3D) {
        debug_assert_eq!(coarse.grid, self.coarse);
        debug_assert_eq!(fine.grid, self.fine);

        let [fx, fy, fz] = self.factor;
        let g = self.fine;
        let cg = self.coarse;

        fine.data.par_chunks_mut(g.nx).enumerate().for_each(|(r, row)| {
            let j = r % g.ny;
            let k = r / g.ny;
            let cj = j / fy;
            let ck = k / fz;
            for (i, out) in row.iter_mut().enumerate() {
                let v = coarse.data[cg.idx(i / fx, cj, ck)];
                out[0] += v[0];
                out[1] += v[1];
                out[2] += v[2];
            }
        });
    }
}
