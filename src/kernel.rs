// src/kernel.rs
//
// Frequency-domain demag kernel with parity-reduced storage.
//
// Each real-space tensor component has definite parity along every axis, so
// its DFT is purely real or purely imaginary after each 1D pass. Only the
// non-negative-frequency half of each transformed axis is kept (N/2 + 1
// bins), and each component is stored as a single real array. Off-diagonal
// components are odd along exactly two axes, so their doubly-imaginary
// transforms pick up a factor i*i = -1, applied once at final packing.
//
// Frequencies above N/2 are recovered on lookup by folding the index and
// flipping the sign for each axis the component is odd in.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use crate::error::{try_alloc, DemagError};

/// Per-component parity along the three transform axes.
///
/// `true` = odd (keep the imaginary part of the 1D transform),
/// `false` = even (keep the real part).
#[derive(Debug, Clone, Copy)]
pub struct ComponentParity {
    pub odd_x: bool,
    pub odd_y: bool,
    pub odd_z: bool,
}

impl ComponentParity {
    /// Off-diagonal components are odd along two axes: i*i = -1.
    pub fn negate(&self) -> bool {
        (self.odd_x as u8 + self.odd_y as u8 + self.odd_z as u8) == 2
    }
}

/// Parities for (Dxx, Dyy, Dzz, Dxy, Dxz, Dyz).
pub const COMPONENT_PARITIES: [ComponentParity; 6] = [
    ComponentParity { odd_x: false, odd_y: false, odd_z: false },
    ComponentParity { odd_x: false, odd_y: false, odd_z: false },
    ComponentParity { odd_x: false, odd_y: false, odd_z: false },
    ComponentParity { odd_x: true, odd_y: true, odd_z: false },
    ComponentParity { odd_x: true, odd_y: false, odd_z: true },
    ComponentParity { odd_x: false, odd_y: true, odd_z: true },
];

/// Parity-reduced, real-valued frequency-domain kernel.
///
/// 3D: all six components, dimensions (Nx/2+1, Ny/2+1, Nz/2+1).
/// 2D (single layer): Dxz and Dyz vanish identically in the plane, so only
/// the diagonal components and Dxy are stored.
pub struct DemagKernel {
    /// Full padded grid dimensions.
    pub dims: [usize; 3],
    /// Stored (reduced) dimensions.
    pub kdims: [usize; 3],
    pub kxx: Vec<f64>,
    pub kyy: Vec<f64>,
    pub kzz: Vec<f64>,
    pub kxy: Vec<f64>,
    /// Empty in the 2D case.
    pub kxz: Vec<f64>,
    /// Empty in the 2D case.
    pub kyz: Vec<f64>,
}

impl DemagKernel {
    pub fn reduced_dims(dims: [usize; 3]) -> [usize; 3] {
        [dims[0] / 2 + 1, dims[1] / 2 + 1, dims[2] / 2 + 1]
    }

    pub fn alloc(dims: [usize; 3]) -> Result<Self, DemagError> {
        let kdims = Self::reduced_dims(dims);
        let len = kdims[0] * kdims[1] * kdims[2];
        let plane = dims[2] == 1;
        Ok(Self {
            dims,
            kdims,
            kxx: try_alloc(len, "kernel Kxx")?,
            kyy: try_alloc(len, "kernel Kyy")?,
            kzz: try_alloc(len, "kernel Kzz")?,
            kxy: try_alloc(len, "kernel Kxy")?,
            kxz: if plane { Vec::new() } else { try_alloc(len, "kernel Kxz")? },
            kyz: if plane { Vec::new() } else { try_alloc(len, "kernel Kyz")? },
        })
    }

    pub fn is_plane(&self) -> bool {
        self.dims[2] == 1
    }

    /// The six tensor spectrum values at a full-grid frequency bin (i, j, k).
    ///
    /// Bins above N/2 fold back onto the stored half; components odd along a
    /// folded axis flip sign.
    #[inline]
    pub fn at(&self, i: usize, j: usize, k: usize) -> [f64; 6] {
        let (fi, rx) = fold(i, self.dims[0]);
        let (fj, ry) = fold(j, self.dims[1]);
        let (fk, rz) = fold(k, self.dims[2]);
        let idx = (fk * self.kdims[1] + fj) * self.kdims[0] + fi;

        let sgn = |flip: bool| if flip { -1.0 } else { 1.0 };
        let sxy = sgn(rx) * sgn(ry);
        let sxz = sgn(rx) * sgn(rz);
        let syz = sgn(ry) * sgn(rz);

        if self.is_plane() {
            [
                self.kxx[idx],
                self.kyy[idx],
                self.kzz[idx],
                self.kxy[idx] * sxy,
                0.0,
                0.0,
            ]
        } else {
            [
                self.kxx[idx],
                self.kyy[idx],
                self.kzz[idx],
                self.kxy[idx] * sxy,
                self.kxz[idx] * sxz,
                self.kyz[idx] * syz,
            ]
        }
    }

    pub(crate) fn component_mut(&mut self, c: usize) -> &mut [f64] {
        match c {
            0 => &mut self.kxx,
            1 => &mut self.kyy,
            2 => &mut self.kzz,
            3 => &mut self.kxy,
            4 => &mut self.kxz,
            _ => &mut self.kyz,
        }
    }
}

#[inline]
fn fold(idx: usize, n: usize) -> (usize, bool) {
    if idx <= n / 2 {
        (idx, false)
    } else {
        (n - idx, true)
    }
}

/// One 1D transform pass of a scalar tensor array along one axis.
///
/// Input layout is row-major (x fastest); `pass` selects the axis. The output
/// keeps only the non-negative-frequency half along the transformed axis and
/// stores the real or imaginary part per the component's parity. Shared by
/// the host and region kernel backends.
pub(crate) struct LinePass {
    fft: std::sync::Arc<dyn rustfft::Fft<f64>>,
    len: usize,
    half: usize,
}

impl LinePass {
    pub fn new(planner: &mut FftPlanner<f64>, len: usize) -> Self {
        Self {
            fft: planner.plan_fft_forward(len),
            len,
            half: len / 2 + 1,
        }
    }

    pub fn half(&self) -> usize {
        self.half
    }

    /// Transform one gathered line of real values in place.
    pub fn transform(&self, line: &mut Vec<Complex<f64>>, input: impl Iterator<Item = f64>) {
        line.clear();
        line.extend(input.map(|v| Complex::new(v, 0.0)));
        debug_assert_eq!(line.len(), self.len);
        self.fft.process(line);
    }

    /// Extract real or imaginary parts for a sub-range of the half spectrum.
    ///
    /// The range restriction is used by the region decomposition along x;
    /// `(0, half)` keeps everything.
    pub fn extract(
        &self,
        line: &[Complex<f64>],
        take_im: bool,
        keep: (usize, usize),
        out: &mut dyn FnMut(usize, f64),
    ) {
        for b in keep.0..keep.1 {
            let v = if take_im { line[b].im } else { line[b].re };
            out(b - keep.0, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_diagonal_parities_negate() {
        assert!(!COMPONENT_PARITIES[0].negate());
        assert!(COMPONENT_PARITIES[3].negate());
        assert!(COMPONENT_PARITIES[4].negate());
        assert!(COMPONENT_PARITIES[5].negate());
    }

    #[test]
    fn fold_maps_upper_half_back() {
        assert_eq!(fold(0, 8), (0, false));
        assert_eq!(fold(4, 8), (4, false));
        assert_eq!(fold(5, 8), (3, true));
        assert_eq!(fold(7, 8), (1, true));
        assert_eq!(fold(0, 1), (0, false));
        // Odd length (periodic axis without padding).
        assert_eq!(fold(3, 5), (2, true));
    }
}
