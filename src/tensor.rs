// src/tensor.rs
//
// Real-space magnetostatic interaction tensor for rectangular-prism cells.
//
// Sign convention: H = D * M, i.e. the stored tensor D is the negated Newell
// demagnetising tensor. For a single cubic cell the self term is diag(-1/3),
// so H_self = -M/3.
//
// Near field uses Newell's closed form (asinh/atan combinations evaluated as
// triple second differences of the f and g potentials). Beyond
// ASYMPTOTIC_DISTANCE (in cells) the exact form is replaced by the far-field
// multipole expansion: point-dipole tensor plus the second-order cell-size
// correction (1/12) sum_c d_c^2 d^2/dx_c^2 applied to it.
//
// Periodic boundary conditions: contributions from periodic images are summed
// per padded-grid bin over the image range, wrap-around included. Along a
// periodic axis the padded size equals the usable size, so the circular
// convolution is the periodic physics.

use rayon::prelude::*;

use crate::error::{try_alloc, DemagError};
use crate::grid::PbcImages;

use std::f64::consts::PI;

/// Distance (in cells) beyond which the asymptotic far-field expansion
/// replaces the exact closed form.
pub const ASYMPTOTIC_DISTANCE: f64 = 30.0;

/// The six independent components of the symmetric interaction tensor over
/// the padded convolution grid: 3 diagonal + 3 off-diagonal scalar arrays.
///
/// Zero outside the physically meaningful offset range (zero-padding).
pub struct DemagTensor {
    /// Padded grid dimensions.
    pub dims: [usize; 3],
    pub dxx: Vec<f64>,
    pub dyy: Vec<f64>,
    pub dzz: Vec<f64>,
    pub dxy: Vec<f64>,
    pub dxz: Vec<f64>,
    pub dyz: Vec<f64>,
}

impl DemagTensor {
    /// Component array in (Dxx, Dyy, Dzz, Dxy, Dxz, Dyz) order.
    pub fn component(&self, c: usize) -> &[f64] {
        match c {
            0 => &self.dxx,
            1 => &self.dyy,
            2 => &self.dzz,
            3 => &self.dxy,
            4 => &self.dxz,
            _ => &self.dyz,
        }
    }
}

/// Computes the real-space tensor for a padded convolution grid.
pub struct TensorGenerator {
    /// Usable cell counts.
    pub n: [usize; 3],
    /// Padded FFT sizes.
    pub dims: [usize; 3],
    /// Cell size normalised by its largest component.
    pub h: [f64; 3],
    /// Store the r = 0 self term (true) or leave it zero (false).
    pub include_self_demag: bool,
    pub pbc: PbcImages,
    /// Threshold (cells) for switching to the asymptotic expansion.
    pub asymptotic_distance: f64,
}

impl TensorGenerator {
    pub fn new(n: [usize; 3], dims: [usize; 3], h: [f64; 3], include_self_demag: bool, pbc: PbcImages) -> Self {
        Self {
            n,
            dims,
            h,
            include_self_demag,
            pbc,
            asymptotic_distance: ASYMPTOTIC_DISTANCE,
        }
    }

    /// Fill the six tensor component arrays over the padded grid.
    ///
    /// Pure computation; the only failure mode is allocation.
    pub fn generate(&self) -> Result<DemagTensor, DemagError> {
        let [nx, ny, nz] = self.dims;
        let len = nx * ny * nz;

        let mut dxx = try_alloc(len, "tensor Dxx")?;
        let mut dyy = try_alloc(len, "tensor Dyy")?;
        let mut dzz = try_alloc(len, "tensor Dzz")?;
        let mut dxy = try_alloc(len, "tensor Dxy")?;
        let mut dxz = try_alloc(len, "tensor Dxz")?;
        let mut dyz = try_alloc(len, "tensor Dyz")?;

        let sx = self.axis_displacements(0);
        let sy = self.axis_displacements(1);
        let sz = self.axis_displacements(2);

        // Each bin is independent: data-parallel over the padded grid.
        dxx.par_iter_mut()
            .zip_eq(dyy.par_iter_mut())
            .zip_eq(dzz.par_iter_mut())
            .zip_eq(dxy.par_iter_mut())
            .zip_eq(dxz.par_iter_mut())
            .zip_eq(dyz.par_iter_mut())
            .enumerate()
            .for_each(|(idx, (((((xx, yy), zz), xy), xz), yz))| {
                let bi = idx % nx;
                let bj = (idx / nx) % ny;
                let bk = idx / (nx * ny);

                let mut acc = [0.0; 6];
                for &dk in &sz[bk] {
                    for &dj in &sy[bj] {
                        for &di in &sx[bi] {
                            let v = self.tensor_at([di, dj, dk]);
                            for c in 0..6 {
                                acc[c] += v[c];
                            }
                        }
                    }
                }

                *xx = acc[0];
                *yy = acc[1];
                *zz = acc[2];
                *xy = acc[3];
                *xz = acc[4];
                *yz = acc[5];
            });

        Ok(DemagTensor {
            dims: self.dims,
            dxx,
            dyy,
            dzz,
            dxy,
            dxz,
            dyz,
        })
    }

    /// Diagonal of the stored tensor at zero offset: exactly what the
    /// kernel's origin bin holds, periodic images included and the r = 0
    /// term only when `include_self_demag` is set.
    ///
    /// This is the coefficient the evaluation speedup subtracts before
    /// storing a sample and re-adds from the current moment, so the local
    /// response never lags. With the self term excluded the coefficient is
    /// zero and stored samples carry the whole field.
    pub fn self_coefficient(&self) -> [f64; 3] {
        let sx = self.axis_displacements(0);
        let sy = self.axis_displacements(1);
        let sz = self.axis_displacements(2);

        let mut acc = [0.0; 3];
        for &dk in &sz[0] {
            for &dj in &sy[0] {
                for &di in &sx[0] {
                    let v = self.tensor_at([di, dj, dk]);
                    acc[0] += v[0];
                    acc[1] += v[1];
                    acc[2] += v[2];
                }
            }
        }
        acc
    }

    /// Signed displacements contributing to each bin along one axis.
    ///
    /// Open axis: the bin maps to a single displacement inside the physical
    /// range (the Nyquist bin of the padded axis stays empty). Periodic axis:
    /// the bin accumulates every image displacement congruent to it, over the
    /// range +/-(n*images - 1).
    fn axis_displacements(&self, axis: usize) -> Vec<Vec<isize>> {
        let n = self.n[axis] as isize;
        let padded = self.dims[axis] as isize;
        let img = match axis {
            0 => self.pbc.x,
            1 => self.pbc.y,
            _ => self.pbc.z,
        } as isize;

        (0..padded)
            .map(|b| {
                let s0 = if b <= padded / 2 { b } else { b - padded };
                if img == 0 {
                    if s0.abs() <= n - 1 {
                        vec![s0]
                    } else {
                        vec![]
                    }
                } else {
                    let smax = n * img - 1;
                    (-img..=img)
                        .map(|t| s0 + t * padded)
                        .filter(|s| s.abs() <= smax)
                        .collect()
                }
            })
            .collect()
    }

    /// All six components at an integer cell offset.
    fn tensor_at(&self, s: [isize; 3]) -> [f64; 6] {
        if s == [0, 0, 0] {
            if self.include_self_demag {
                let d = self_demag_diag(self.h);
                return [d[0], d[1], d[2], 0.0, 0.0, 0.0];
            }
            return [0.0; 6];
        }

        let dist2 = (s[0] * s[0] + s[1] * s[1] + s[2] * s[2]) as f64;
        if dist2.sqrt() >= self.asymptotic_distance {
            asymptotic_tensor(s, self.h)
        } else {
            exact_tensor(s, self.h)
        }
    }
}

/// Self-demagnetisation diagonal diag(-Nxx, -Nyy, -Nzz) at r = 0.
pub fn self_demag_diag(h: [f64; 3]) -> [f64; 3] {
    let [dx, dy, dz] = h;
    [
        -newell_nxx(0.0, 0.0, 0.0, dx, dy, dz),
        -newell_nxx(0.0, 0.0, 0.0, dy, dx, dz),
        -newell_nxx(0.0, 0.0, 0.0, dz, dy, dx),
    ]
}

/// Exact closed-form tensor at a non-zero offset (H = D * M convention).
fn exact_tensor(s: [isize; 3], h: [f64; 3]) -> [f64; 6] {
    let [dx, dy, dz] = h;
    let x = s[0] as f64 * dx;
    let y = s[1] as f64 * dy;
    let z = s[2] as f64 * dz;

    // Component symmetry under coordinate permutation:
    // Nyy and Nzz are Nxx with axes swapped; Nxz and Nyz likewise from Nxy.
    [
        -newell_nxx(x, y, z, dx, dy, dz),
        -newell_nxx(y, x, z, dy, dx, dz),
        -newell_nxx(z, y, x, dz, dy, dx),
        -newell_nxy(x, y, z, dx, dy, dz),
        -newell_nxy(x, z, y, dx, dz, dy),
        -newell_nxy(y, z, x, dy, dz, dx),
    ]
}

#[inline]
fn weight(i: isize) -> f64 {
    if i == 0 {
        2.0
    } else {
        -1.0
    }
}

/// Newell Nxx: triple second difference of the f potential.
fn newell_nxx(x: f64, y: f64, z: f64, dx: f64, dy: f64, dz: f64) -> f64 {
    let mut sum = 0.0;
    for i in -1..=1 {
        for j in -1..=1 {
            for k in -1..=1 {
                let w = weight(i) * weight(j) * weight(k);
                sum += w * newell_f(x + i as f64 * dx, y + j as f64 * dy, z + k as f64 * dz);
            }
        }
    }
    sum / (4.0 * PI * dx * dy * dz)
}

/// Newell Nxy: triple second difference of the g potential.
fn newell_nxy(x: f64, y: f64, z: f64, dx: f64, dy: f64, dz: f64) -> f64 {
    let mut sum = 0.0;
    for i in -1..=1 {
        for j in -1..=1 {
            for k in -1..=1 {
                let w = weight(i) * weight(j) * weight(k);
                sum += w * newell_g(x + i as f64 * dx, y + j as f64 * dy, z + k as f64 * dz);
            }
        }
    }
    sum / (4.0 * PI * dx * dy * dz)
}

/// Newell's f potential (even in all arguments).
fn newell_f(x: f64, y: f64, z: f64) -> f64 {
    let x = x.abs();
    let y = y.abs();
    let z = z.abs();
    let r = (x * x + y * y + z * z).sqrt();

    let mut result = (2.0 * x * x - y * y - z * z) * r / 6.0;

    let xz2 = x * x + z * z;
    if xz2 > 0.0 {
        result += 0.5 * y * (z * z - x * x) * (y / xz2.sqrt()).asinh();
    }
    let xy2 = x * x + y * y;
    if xy2 > 0.0 {
        result += 0.5 * z * (y * y - x * x) * (z / xy2.sqrt()).asinh();
    }
    if x * r > 0.0 {
        result -= x * y * z * (y * z / (x * r)).atan();
    }
    result
}

/// Newell's g potential (odd in x and y, even in z).
fn newell_g(x: f64, y: f64, z: f64) -> f64 {
    let mut sign = 1.0;
    if x < 0.0 {
        sign = -sign;
    }
    if y < 0.0 {
        sign = -sign;
    }
    let x = x.abs();
    let y = y.abs();
    let z = z.abs();
    let r = (x * x + y * y + z * z).sqrt();

    let mut result = -(x * y * r) / 3.0;

    let xy2 = x * x + y * y;
    if xy2 > 0.0 {
        result += x * y * z * (z / xy2.sqrt()).asinh();
    }
    let yz2 = y * y + z * z;
    if yz2 > 0.0 {
        result += (y / 6.0) * (3.0 * z * z - y * y) * (x / yz2.sqrt()).asinh();
    }
    let xz2 = x * x + z * z;
    if xz2 > 0.0 {
        result += (x / 6.0) * (3.0 * z * z - x * x) * (y / xz2.sqrt()).asinh();
    }
    if z * r > 0.0 {
        result -= (z * z * z / 6.0) * (x * y / (z * r)).atan();
    }
    if y * r > 0.0 {
        result -= (z * y * y / 2.0) * (x * z / (y * r)).atan();
    }
    if x * r > 0.0 {
        result -= (z * x * x / 2.0) * (y * z / (x * r)).atan();
    }
    sign * result
}

/// Far-field multipole expansion of the cell-averaged tensor:
/// leading dipole term plus the (1/12) sum_c d_c^2 d^2/dx_c^2 correction from
/// averaging over both source and destination cells.
fn asymptotic_tensor(s: [isize; 3], h: [f64; 3]) -> [f64; 6] {
    let r = [
        s[0] as f64 * h[0],
        s[1] as f64 * h[1],
        s[2] as f64 * h[2],
    ];
    let vol = h[0] * h[1] * h[2];
    let pre = vol / (4.0 * PI);

    let comp = |a: usize, b: usize| -> f64 {
        let mut v = dipole_t(a, b, r);
        for c in 0..3 {
            v += h[c] * h[c] / 12.0 * dipole_t_d2(a, b, c, r);
        }
        pre * v
    };

    [
        comp(0, 0),
        comp(1, 1),
        comp(2, 2),
        comp(0, 1),
        comp(0, 2),
        comp(1, 2),
    ]
}

/// Point-dipole tensor T_ab = 3 x_a x_b / r^5 - delta_ab / r^3.
#[inline]
fn dipole_t(a: usize, b: usize, x: [f64; 3]) -> f64 {
    let r2 = x[0] * x[0] + x[1] * x[1] + x[2] * x[2];
    let r = r2.sqrt();
    let r3i = 1.0 / (r2 * r);
    let r5i = r3i / r2;
    let delta = if a == b { 1.0 } else { 0.0 };
    3.0 * x[a] * x[b] * r5i - delta * r3i
}

/// Second derivative of the dipole tensor, d^2 T_ab / dx_c^2.
fn dipole_t_d2(a: usize, b: usize, c: usize, x: [f64; 3]) -> f64 {
    let r2 = x[0] * x[0] + x[1] * x[1] + x[2] * x[2];
    let r = r2.sqrt();
    let r5i = 1.0 / (r2 * r2 * r);
    let r7i = r5i / r2;
    let r9i = r7i / r2;

    let dac = if a == c { 1.0 } else { 0.0 };
    let dbc = if b == c { 1.0 } else { 0.0 };
    let dab = if a == b { 1.0 } else { 0.0 };

    // d^2/dx_c^2 of 3 x_a x_b r^-5
    let term_a = 3.0
        * (2.0 * dac * dbc * r5i - 10.0 * x[c] * (dac * x[b] + dbc * x[a]) * r7i
            + x[a] * x[b] * (-5.0 * r7i + 35.0 * x[c] * x[c] * r9i));
    // d^2/dx_c^2 of -delta_ab r^-3
    let term_b = dab * (3.0 * r5i - 15.0 * x[c] * x[c] * r7i);

    term_a + term_b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid3D;
    use approx::assert_relative_eq;

    #[test]
    fn cubic_self_term_is_minus_one_third() {
        let d = self_demag_diag([1.0, 1.0, 1.0]);
        assert_relative_eq!(d[0], -1.0 / 3.0, max_relative = 1e-12);
        assert_relative_eq!(d[1], -1.0 / 3.0, max_relative = 1e-12);
        assert_relative_eq!(d[2], -1.0 / 3.0, max_relative = 1e-12);
    }

    #[test]
    fn self_term_trace_is_minus_one_for_any_cell() {
        let d = self_demag_diag([1.0, 0.5, 0.25]);
        assert_relative_eq!(d[0] + d[1] + d[2], -1.0, max_relative = 1e-12);
    }

    #[test]
    fn exact_tensor_has_documented_parity() {
        let h = [1.0, 0.8, 0.6];
        let s = [3isize, 2, 1];
        let base = exact_tensor(s, h);

        // The 27-term second differences are summed in a different order for
        // the reflected offset, so equality holds only to rounding.
        let tol = 1e-10;

        // Reflect along x: diagonals and Dyz even, Dxy and Dxz odd.
        let rx = exact_tensor([-s[0], s[1], s[2]], h);
        for c in [0, 1, 2, 5] {
            assert_relative_eq!(rx[c], base[c], max_relative = tol);
        }
        for c in [3, 4] {
            assert_relative_eq!(rx[c], -base[c], max_relative = tol);
        }

        // Reflect along y: Dxy and Dyz odd.
        let ry = exact_tensor([s[0], -s[1], s[2]], h);
        for c in [0, 1, 2, 4] {
            assert_relative_eq!(ry[c], base[c], max_relative = tol);
        }
        for c in [3, 5] {
            assert_relative_eq!(ry[c], -base[c], max_relative = tol);
        }

        // Reflect along z: Dxz and Dyz odd.
        let rz = exact_tensor([s[0], s[1], -s[2]], h);
        for c in [0, 1, 2, 3] {
            assert_relative_eq!(rz[c], base[c], max_relative = tol);
        }
        for c in [4, 5] {
            assert_relative_eq!(rz[c], -base[c], max_relative = tol);
        }
    }

    #[test]
    fn tensor_trace_vanishes_away_from_origin() {
        // The field of a dipole distribution is divergence free outside the
        // source, so Dxx + Dyy + Dzz = 0 for r != 0.
        let v = exact_tensor([4, 2, 3], [1.0, 1.0, 1.0]);
        assert!((v[0] + v[1] + v[2]).abs() < 1e-10, "trace = {}", v[0] + v[1] + v[2]);
    }

    #[test]
    fn asymptotic_matches_exact_near_threshold() {
        let h = [1.0, 0.75, 0.5];
        for s in [[30isize, 4, 2], [18, 24, 9], [0, 31, 5]] {
            let exact = exact_tensor(s, h);
            let asym = asymptotic_tensor(s, h);
            for c in 0..6 {
                let scale = exact[c].abs().max(1e-9);
                assert!(
                    (exact[c] - asym[c]).abs() / scale < 1e-4,
                    "component {} at {:?}: exact {} vs asymptotic {}",
                    c,
                    s,
                    exact[c],
                    asym[c]
                );
            }
        }
    }

    #[test]
    fn generated_tensor_obeys_reflection_symmetry() {
        let grid = Grid3D::new(4, 3, 2, 1e-9, 1e-9, 1e-9);
        let pbc = crate::grid::PbcImages::default();
        let dims = grid.padded_size(pbc);
        let gen = TensorGenerator::new([4, 3, 2], dims, grid.normalized_cell(), true, pbc);
        let t = gen.generate().unwrap();

        let [nx, ny, nz] = dims;
        let idx = |i: usize, j: usize, k: usize| (k * ny + j) * nx + i;

        for k in 0..nz {
            for j in 0..ny {
                for i in 1..nx {
                    let m = idx(i, j, k);
                    let r = idx(nx - i, j, k);
                    assert_relative_eq!(t.dxx[m], t.dxx[r], max_relative = 1e-12, epsilon = 1e-15);
                    assert_relative_eq!(t.dxy[m], -t.dxy[r], max_relative = 1e-12, epsilon = 1e-15);
                    assert_relative_eq!(t.dxz[m], -t.dxz[r], max_relative = 1e-12, epsilon = 1e-15);
                    assert_relative_eq!(t.dyz[m], t.dyz[r], max_relative = 1e-12, epsilon = 1e-15);
                }
            }
        }
    }

    #[test]
    fn self_coefficient_without_pbc_is_plain_self_term() {
        let gen = TensorGenerator::new(
            [8, 8, 1],
            [16, 16, 1],
            [1.0, 1.0, 1.0],
            true,
            crate::grid::PbcImages::default(),
        );
        let c = gen.self_coefficient();
        let d = self_demag_diag([1.0, 1.0, 1.0]);
        assert_eq!(c, d);
    }

    #[test]
    fn self_coefficient_is_zero_without_self_term() {
        let gen = TensorGenerator::new(
            [4, 4, 1],
            [8, 8, 1],
            [1.0, 1.0, 1.0],
            false,
            crate::grid::PbcImages::default(),
        );
        assert_eq!(gen.self_coefficient(), [0.0; 3]);
    }

    #[test]
    fn self_coefficient_matches_generated_origin_bin() {
        // With periodic images the coefficient must be exactly the diagonal
        // the kernel carries at zero offset, same image range included.
        let pbc = crate::grid::PbcImages::new(2, 2, 0);
        let gen = TensorGenerator::new([4, 4, 1], [4, 4, 1], [1.0, 1.0, 0.5], true, pbc);
        let t = gen.generate().unwrap();
        let c = gen.self_coefficient();
        assert_eq!(c, [t.dxx[0], t.dyy[0], t.dzz[0]]);
    }
}
