// src/vector_field.rs

use crate::error::{try_alloc, DemagError};
use crate::grid::Grid3D;

/// Vector field defined on a 3D grid. Each cell stores (vx, vy, vz).
///
/// Used both for magnetisation M (A/m) and for the demagnetising field H (A/m).
pub struct VectorField3D {
    pub grid: Grid3D,
    pub data: Vec<[f64; 3]>,
}

impl VectorField3D {
    /// Create a new zero field on the given grid.
    pub fn new(grid: Grid3D) -> Self {
        let n = grid.n_cells();
        Self {
            grid,
            data: vec![[0.0; 3]; n],
        }
    }

    /// Allocation-checked constructor; fails with an out-of-memory condition
    /// rather than aborting.
    pub fn try_new(grid: Grid3D) -> Result<Self, DemagError> {
        let data = try_alloc(grid.n_cells(), "vector field")?;
        Ok(Self { grid, data })
    }

    /// Set all cells to the same vector (vx, vy, vz).
    pub fn set_uniform(&mut self, vx: f64, vy: f64, vz: f64) {
        for cell in &mut self.data {
            *cell = [vx, vy, vz];
        }
    }

    /// Get the flat index in `data` for grid indices (i, j, k).
    #[inline]
    pub fn idx(&self, i: usize, j: usize, k: usize) -> usize {
        self.grid.idx(i, j, k)
    }

    /// Number of cells with a non-zero vector. Empty cells carry no moment
    /// and are excluded from the energy normalisation.
    pub fn nonempty_cells(&self) -> usize {
        self.data
            .iter()
            .filter(|v| v[0] != 0.0 || v[1] != 0.0 || v[2] != 0.0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonempty_count_skips_zero_cells() {
        let grid = Grid3D::new(2, 2, 1, 1.0, 1.0, 1.0);
        let mut m = VectorField3D::new(grid);
        assert_eq!(m.nonempty_cells(), 0);

        m.data[0] = [0.0, 0.0, 1.0];
        m.data[3] = [1.0, 0.0, 0.0];
        assert_eq!(m.nonempty_cells(), 2);
    }
}
