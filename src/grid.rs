// src/grid.rs

use serde::{Deserialize, Serialize};

/// Simple 3D finite-difference grid: nx × ny × nz cells of size dx × dy × dz.
///
/// A single-layer grid (nz = 1) selects the reduced 2D convolution path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Grid3D {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub dx: f64,
    pub dy: f64,
    pub dz: f64,
}

impl Grid3D {
    pub fn new(nx: usize, ny: usize, nz: usize, dx: f64, dy: f64, dz: f64) -> Self {
        Self { nx, ny, nz, dx, dy, dz }
    }

    /// Total number of cells.
    pub fn n_cells(&self) -> usize {
        self.nx * self.ny * self.nz
    }

    /// Convert (i, j, k) indices to a flat index into a 1D array.
    #[inline]
    pub fn idx(&self, i: usize, j: usize, k: usize) -> usize {
        debug_assert!(i < self.nx && j < self.ny && k < self.nz);
        (k * self.ny + j) * self.nx + i
    }

    /// Volume of a single cell.
    #[inline]
    pub fn cell_volume(&self) -> f64 {
        self.dx * self.dy * self.dz
    }

    /// Single cell layer along z: selects the 2D kernel/convolution path.
    #[inline]
    pub fn is_plane(&self) -> bool {
        self.nz == 1
    }

    /// Cell size normalised by its largest component. The demag tensor is
    /// scale invariant, so this only reduces floating-point error.
    pub fn normalized_cell(&self) -> [f64; 3] {
        let hmax = self.dx.max(self.dy).max(self.dz);
        [self.dx / hmax, self.dy / hmax, self.dz / hmax]
    }

    /// Padded FFT size along each axis.
    ///
    /// Open axis with n > 1: pad to 2n, so circular convolution equals linear
    /// convolution inside the usable region (2n >= 2n - 1). Periodic axis: no
    /// padding, wrap-around is the physics. Unit axis: size 1.
    pub fn padded_size(&self, pbc: PbcImages) -> [usize; 3] {
        let pad = |n: usize, images: usize| -> usize {
            if n == 1 {
                1
            } else if images > 0 {
                n
            } else {
                2 * n
            }
        };
        [pad(self.nx, pbc.x), pad(self.ny, pbc.y), pad(self.nz, pbc.z)]
    }
}

/// Number of periodic images along each axis (0 = open boundary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PbcImages {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl PbcImages {
    pub fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }

    pub fn is_none(&self) -> bool {
        self.x == 0 && self.y == 0 && self.z == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_indexing_is_consistent() {
        let g = Grid3D::new(4, 3, 2, 1.0, 1.0, 1.0);
        assert_eq!(g.idx(0, 0, 0), 0);
        assert_eq!(g.idx(1, 0, 0), 1);
        assert_eq!(g.idx(0, 1, 0), 4);
        assert_eq!(g.idx(0, 0, 1), 12);
        assert_eq!(g.idx(3, 2, 1), 23);
        assert_eq!(g.n_cells(), 24);
    }

    #[test]
    fn padded_size_pads_open_axes_only() {
        let g = Grid3D::new(8, 4, 1, 1e-9, 1e-9, 1e-9);
        assert_eq!(g.padded_size(PbcImages::default()), [16, 8, 1]);
        assert_eq!(g.padded_size(PbcImages::new(2, 0, 0)), [8, 8, 1]);
    }

    #[test]
    fn normalized_cell_has_unit_max() {
        let g = Grid3D::new(1, 1, 1, 5e-9, 2.5e-9, 1e-9);
        let h = g.normalized_cell();
        assert_eq!(h, [1.0, 0.5, 0.2]);
    }
}
