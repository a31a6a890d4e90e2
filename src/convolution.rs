// src/convolution.rs
//
// FFT-accelerated demag convolution:
//   H_i = D_ij * M_j  (discrete convolution over the padded grid)
//
// M is packed into zero-padded complex arrays, transformed, multiplied by
// the parity-reduced kernel spectrum, transformed back and cropped to the
// physical region. Open axes are zero-padded to twice the cell count so the
// circular convolution is linear inside the usable region; periodic axes are
// unpadded and the wrap-around is the physics.
//
// The 1D passes run in parallel: rows are contiguous, columns go through a
// transpose for large grids and a gather buffer for small ones.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use rayon::prelude::*;

use std::sync::Arc;

use crate::error::{try_alloc, DemagError};
use crate::grid::Grid3D;
use crate::kernel::DemagKernel;
use crate::vec3;
use crate::vector_field::VectorField3D;
use crate::MU0;

// For small grids the transpose+parallel-column FFT is slower than the
// simple gather-column approach due to extra memory traffic + rayon
// overhead.
const FFT_PAR_THRESHOLD: usize = 32_768;

#[inline]
fn use_parallel_column_fft(nx: usize, ny: usize) -> bool {
    if nx < 64 || ny < 32 {
        return false;
    }
    nx.saturating_mul(ny) >= FFT_PAR_THRESHOLD
}

/// Convolution engine: FFT plans, kernel spectrum and complex scratch.
pub struct Convolution {
    grid: Grid3D,
    dims: [usize; 3],
    n_pad: usize,
    kernel: DemagKernel,

    // Scratch buffers (in-place FFT). m* hold the transformed moment,
    // h* the field product.
    mx: Vec<Complex<f64>>,
    my: Vec<Complex<f64>>,
    mz: Vec<Complex<f64>>,
    hx: Vec<Complex<f64>>,
    hy: Vec<Complex<f64>>,
    hz: Vec<Complex<f64>>,

    fft_x_fwd: Arc<dyn Fft<f64>>,
    fft_x_inv: Arc<dyn Fft<f64>>,
    fft_y_fwd: Arc<dyn Fft<f64>>,
    fft_y_inv: Arc<dyn Fft<f64>>,
    /// Absent for a single cell layer.
    fft_z: Option<(Arc<dyn Fft<f64>>, Arc<dyn Fft<f64>>)>,

    // Scratch for transposed column FFTs (len = n_pad).
    fft_tmp: Vec<Complex<f64>>,
}

impl Convolution {
    /// The kernel fixes the padded dimensions; `grid` is the physical grid
    /// the moment lives on.
    pub fn new(grid: Grid3D, kernel: DemagKernel) -> Result<Self, DemagError> {
        let dims = kernel.dims;
        let n_pad = dims[0] * dims[1] * dims[2];

        let mut planner = FftPlanner::<f64>::new();
        let fft_x_fwd = planner.plan_fft_forward(dims[0]);
        let fft_x_inv = planner.plan_fft_inverse(dims[0]);
        let fft_y_fwd = planner.plan_fft_forward(dims[1]);
        let fft_y_inv = planner.plan_fft_inverse(dims[1]);
        let fft_z = (dims[2] > 1)
            .then(|| (planner.plan_fft_forward(dims[2]), planner.plan_fft_inverse(dims[2])));

        Ok(Self {
            grid,
            dims,
            n_pad,
            kernel,
            mx: try_alloc(n_pad, "convolution scratch Mx")?,
            my: try_alloc(n_pad, "convolution scratch My")?,
            mz: try_alloc(n_pad, "convolution scratch Mz")?,
            hx: try_alloc(n_pad, "convolution scratch Hx")?,
            hy: try_alloc(n_pad, "convolution scratch Hy")?,
            hz: try_alloc(n_pad, "convolution scratch Hz")?,
            fft_x_fwd,
            fft_x_inv,
            fft_y_fwd,
            fft_y_inv,
            fft_z,
            fft_tmp: try_alloc(n_pad, "convolution transpose scratch")?,
        })
    }

    pub fn grid(&self) -> Grid3D {
        self.grid
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Compute H = D * M into `heff` (overwrite or accumulate) and return
    /// the raw dot sum over cells of M·H.
    ///
    /// `energy_density`, when given, receives the per-cell energy density
    /// -mu0/2 M·H. `display`, when given, receives a copy of H alone.
    pub fn convolute(
        &mut self,
        m: &VectorField3D,
        heff: &mut VectorField3D,
        accumulate: bool,
        energy_density: Option<&mut [f64]>,
        display: Option<&mut VectorField3D>,
    ) -> f64 {
        debug_assert_eq!(m.grid, self.grid);
        debug_assert_eq!(heff.grid, self.grid);

        let Grid3D { nx, ny, nz, .. } = self.grid;
        let [px, py, pz] = self.dims;

        let zero = Complex::new(0.0, 0.0);
        self.mx.fill(zero);
        self.my.fill(zero);
        self.mz.fill(zero);

        // Pack M into the padded arrays (parallel over x-rows).
        self.mx
            .par_chunks_mut(px)
            .zip_eq(self.my.par_chunks_mut(px))
            .zip_eq(self.mz.par_chunks_mut(px))
            .enumerate()
            .for_each(|(r, ((mx_row, my_row), mz_row))| {
                let j = r % py;
                let k = r / py;
                if j >= ny || k >= nz {
                    return;
                }
                let src_row = &m.data[(k * ny + j) * nx..(k * ny + j) * nx + nx];
                for i in 0..nx {
                    let v = src_row[i];
                    mx_row[i].re = v[0];
                    my_row[i].re = v[1];
                    mz_row[i].re = v[2];
                }
            });

        fft3_forward(&mut self.mx, self.dims, &self.fft_x_fwd, &self.fft_y_fwd, self.fft_z.as_ref().map(|p| &p.0), &mut self.fft_tmp);
        fft3_forward(&mut self.my, self.dims, &self.fft_x_fwd, &self.fft_y_fwd, self.fft_z.as_ref().map(|p| &p.0), &mut self.fft_tmp);
        fft3_forward(&mut self.mz, self.dims, &self.fft_x_fwd, &self.fft_y_fwd, self.fft_z.as_ref().map(|p| &p.0), &mut self.fft_tmp);

        // k-space multiply (parallel per bin; deterministic). The kernel
        // lookup folds onto the reduced half spectrum internally.
        let kernel = &self.kernel;
        let mxk = &self.mx;
        let myk = &self.my;
        let mzk = &self.mz;

        self.hx
            .par_iter_mut()
            .zip_eq(self.hy.par_iter_mut())
            .zip_eq(self.hz.par_iter_mut())
            .enumerate()
            .for_each(|(idx, ((hx_i, hy_i), hz_i))| {
                let i = idx % px;
                let j = (idx / px) % py;
                let k = idx / (px * py);
                let [kxx, kyy, kzz, kxy, kxz, kyz] = kernel.at(i, j, k);

                let mx = mxk[idx];
                let my = myk[idx];
                let mz = mzk[idx];

                *hx_i = mx * kxx + my * kxy + mz * kxz;
                *hy_i = mx * kxy + my * kyy + mz * kyz;
                *hz_i = mx * kxz + my * kyz + mz * kzz;
            });

        fft3_inverse(&mut self.hx, self.dims, &self.fft_x_inv, &self.fft_y_inv, self.fft_z.as_ref().map(|p| &p.1), &mut self.fft_tmp);
        fft3_inverse(&mut self.hy, self.dims, &self.fft_x_inv, &self.fft_y_inv, self.fft_z.as_ref().map(|p| &p.1), &mut self.fft_tmp);
        fft3_inverse(&mut self.hz, self.dims, &self.fft_x_inv, &self.fft_y_inv, self.fft_z.as_ref().map(|p| &p.1), &mut self.fft_tmp);

        // Crop the physical region back into heff (parallel over rows),
        // reducing the M·H dot sum along the way.
        let hx = &self.hx;
        let hy = &self.hy;
        let hz = &self.hz;
        let m_data = &m.data;

        let dot_sum: f64 = heff
            .data
            .par_chunks_mut(nx)
            .enumerate()
            .map(|(r, row)| {
                let j = r % ny;
                let k = r / ny;
                let src_base = (k * py + j) * px;
                let mut dot = 0.0;
                for i in 0..nx {
                    let h = [hx[src_base + i].re, hy[src_base + i].re, hz[src_base + i].re];
                    let mv = m_data[r * nx + i];
                    dot += vec3::dot(mv, h);
                    if accumulate {
                        row[i][0] += h[0];
                        row[i][1] += h[1];
                        row[i][2] += h[2];
                    } else {
                        row[i] = h;
                    }
                }
                dot
            })
            .sum();

        if let Some(density) = energy_density {
            debug_assert_eq!(density.len(), m.data.len());
            density
                .par_chunks_mut(nx)
                .enumerate()
                .for_each(|(r, drow)| {
                    let j = r % ny;
                    let k = r / ny;
                    let src_base = (k * py + j) * px;
                    for i in 0..nx {
                        let mv = m_data[r * nx + i];
                        let hv = [
                            hx[src_base + i].re,
                            hy[src_base + i].re,
                            hz[src_base + i].re,
                        ];
                        drow[i] = -0.5 * MU0 * vec3::dot(mv, hv);
                    }
                });
        }

        if let Some(disp) = display {
            debug_assert_eq!(disp.grid, self.grid);
            disp.data
                .par_chunks_mut(nx)
                .enumerate()
                .for_each(|(r, row)| {
                    let j = r % ny;
                    let k = r / ny;
                    let src_base = (k * py + j) * px;
                    for i in 0..nx {
                        row[i] = [
                            hx[src_base + i].re,
                            hy[src_base + i].re,
                            hz[src_base + i].re,
                        ];
                    }
                });
        }

        dot_sum
    }
}

/// 3D forward FFT (in-place): 1D passes over x rows, y columns, z columns.
fn fft3_forward(
    data: &mut [Complex<f64>],
    dims: [usize; 3],
    fft_x: &Arc<dyn Fft<f64>>,
    fft_y: &Arc<dyn Fft<f64>>,
    fft_z: Option<&Arc<dyn Fft<f64>>>,
    tmp: &mut [Complex<f64>],
) {
    let [px, py, pz] = dims;

    // Rows (parallel).
    data.par_chunks_mut(px).for_each(|row| {
        fft_x.process(row);
    });

    // y columns, plane by plane.
    for z in 0..pz {
        let plane = &mut data[z * px * py..(z + 1) * px * py];
        fft_columns(plane, px, py, fft_y, tmp);
    }

    // z columns across planes.
    if let Some(fft_z) = fft_z {
        fft_z_columns(data, px * py, pz, fft_z, tmp);
    }
}

/// 3D inverse FFT (in-place), 1/(px*py*pz) scaling applied at the end.
fn fft3_inverse(
    data: &mut [Complex<f64>],
    dims: [usize; 3],
    fft_x_inv: &Arc<dyn Fft<f64>>,
    fft_y_inv: &Arc<dyn Fft<f64>>,
    fft_z_inv: Option<&Arc<dyn Fft<f64>>>,
    tmp: &mut [Complex<f64>],
) {
    let [px, py, pz] = dims;

    data.par_chunks_mut(px).for_each(|row| {
        fft_x_inv.process(row);
    });

    for z in 0..pz {
        let plane = &mut data[z * px * py..(z + 1) * px * py];
        fft_columns(plane, px, py, fft_y_inv, tmp);
    }

    if let Some(fft_z_inv) = fft_z_inv {
        fft_z_columns(data, px * py, pz, fft_z_inv, tmp);
    }

    // rustfft is unnormalised -> scale (parallel).
    let scale = 1.0 / (px * py * pz) as f64;
    data.par_iter_mut().for_each(|v| {
        v.re *= scale;
        v.im *= scale;
    });
}

/// FFT over the columns of one plane.
///
/// Hybrid strategy: gather-column for small planes, transpose + parallel
/// column FFT for larger ones.
fn fft_columns(
    plane: &mut [Complex<f64>],
    nx: usize,
    ny: usize,
    fft_y: &Arc<dyn Fft<f64>>,
    tmp: &mut [Complex<f64>],
) {
    let n = nx * ny;

    if !use_parallel_column_fft(nx, ny) {
        let col_buf = &mut tmp[..ny];
        for x in 0..nx {
            for y in 0..ny {
                col_buf[y] = plane[y * nx + x];
            }
            fft_y.process(col_buf);
            for y in 0..ny {
                plane[y * nx + x] = col_buf[y];
            }
        }
        return;
    }

    // Transpose path: tmp[x*ny + y] = plane[y*nx + x].
    {
        let plane_ro: &[Complex<f64>] = &*plane;
        tmp[..n].par_chunks_mut(ny).enumerate().for_each(|(x, col)| {
            for y in 0..ny {
                col[y] = plane_ro[y * nx + x];
            }
        });
    }

    tmp[..n].par_chunks_mut(ny).for_each(|col| {
        fft_y.process(col);
    });

    let tmp_ro: &[Complex<f64>] = &tmp[..n];
    plane.par_chunks_mut(nx).enumerate().for_each(|(y, row)| {
        for x in 0..nx {
            row[x] = tmp_ro[x * ny + y];
        }
    });
}

/// FFT over z lines: stride `plane` between consecutive line elements.
/// Always uses the transpose path (z lines are maximally strided).
fn fft_z_columns(
    data: &mut [Complex<f64>],
    plane: usize,
    pz: usize,
    fft_z: &Arc<dyn Fft<f64>>,
    tmp: &mut [Complex<f64>],
) {
    let n = plane * pz;

    // tmp[r*pz + z] = data[z*plane + r]
    {
        let data_ro: &[Complex<f64>] = &*data;
        tmp[..n].par_chunks_mut(pz).enumerate().for_each(|(r, line)| {
            for z in 0..pz {
                line[z] = data_ro[z * plane + r];
            }
        });
    }

    tmp[..n].par_chunks_mut(pz).for_each(|line| {
        fft_z.process(line);
    });

    let tmp_ro: &[Complex<f64>] = &tmp[..n];
    data.par_chunks_mut(plane).enumerate().for_each(|(z, out)| {
        for r in 0..plane {
            out[r] = tmp_ro[r * pz + z];
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostBackend, KernelBackend};
    use crate::grid::PbcImages;
    use crate::tensor::TensorGenerator;
    use approx::assert_abs_diff_eq;

    fn build(grid: Grid3D, pbc: PbcImages) -> Convolution {
        let dims = grid.padded_size(pbc);
        let tensor = TensorGenerator::new(
            [grid.nx, grid.ny, grid.nz],
            dims,
            grid.normalized_cell(),
            true,
            pbc,
        )
        .generate()
        .unwrap();
        let kernel = HostBackend.build(&tensor).unwrap();
        Convolution::new(grid, kernel).unwrap()
    }

    #[test]
    fn single_cubic_cell_self_field() {
        let grid = Grid3D::new(1, 1, 1, 2e-9, 2e-9, 2e-9);
        let mut conv = build(grid, PbcImages::default());

        let ms = 8.0e5;
        let mut m = VectorField3D::new(grid);
        m.set_uniform(0.0, 0.0, ms);
        let mut h = VectorField3D::new(grid);

        let dot = conv.convolute(&m, &mut h, false, None, None);

        assert_abs_diff_eq!(h.data[0][0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(h.data[0][1], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(h.data[0][2], -ms / 3.0, epsilon = ms * 1e-10);
        assert_abs_diff_eq!(dot, -ms * ms / 3.0, epsilon = ms * ms * 1e-10);
    }

    #[test]
    fn accumulate_adds_on_top() {
        let grid = Grid3D::new(2, 2, 1, 2e-9, 2e-9, 2e-9);
        let mut conv = build(grid, PbcImages::default());

        let mut m = VectorField3D::new(grid);
        m.set_uniform(1.0, 0.5, -0.25);
        let mut h = VectorField3D::new(grid);

        conv.convolute(&m, &mut h, false, None, None);
        let once = h.data.clone();
        conv.convolute(&m, &mut h, true, None, None);

        for (a, b) in h.data.iter().zip(once.iter()) {
            for c in 0..3 {
                assert_abs_diff_eq!(a[c], 2.0 * b[c], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn fft_convolution_matches_direct_sum() {
        let grid = Grid3D::new(3, 2, 2, 4e-9, 4e-9, 4e-9);
        let pbc = PbcImages::default();
        let dims = grid.padded_size(pbc);
        let tensor = TensorGenerator::new(
            [grid.nx, grid.ny, grid.nz],
            dims,
            grid.normalized_cell(),
            true,
            pbc,
        )
        .generate()
        .unwrap();

        let mut m = VectorField3D::new(grid);
        for (idx, v) in m.data.iter_mut().enumerate() {
            // Deterministic, non-symmetric moment pattern.
            let t = idx as f64;
            *v = [(0.3 * t).sin(), (0.7 * t + 1.0).cos(), 0.5 - 0.1 * t];
        }

        // Direct circular convolution over the padded tensor.
        let wrap = |d: isize, n: usize| -> usize {
            let n = n as isize;
            (((d % n) + n) % n) as usize
        };
        let mut expect = vec![[0.0; 3]; grid.n_cells()];
        for dk in 0..grid.nz {
            for dj in 0..grid.ny {
                for di in 0..grid.nx {
                    let dst = grid.idx(di, dj, dk);
                    for sk in 0..grid.nz {
                        for sj in 0..grid.ny {
                            for si in 0..grid.nx {
                                let bi = wrap(di as isize - si as isize, dims[0]);
                                let bj = wrap(dj as isize - sj as isize, dims[1]);
                                let bk = wrap(dk as isize - sk as isize, dims[2]);
                                let t_idx = (bk * dims[1] + bj) * dims[0] + bi;
                                let mv = m.data[grid.idx(si, sj, sk)];
                                let (dxx, dyy, dzz) =
                                    (tensor.dxx[t_idx], tensor.dyy[t_idx], tensor.dzz[t_idx]);
                                let (dxy, dxz, dyz) =
                                    (tensor.dxy[t_idx], tensor.dxz[t_idx], tensor.dyz[t_idx]);
                                expect[dst][0] += dxx * mv[0] + dxy * mv[1] + dxz * mv[2];
                                expect[dst][1] += dxy * mv[0] + dyy * mv[1] + dyz * mv[2];
                                expect[dst][2] += dxz * mv[0] + dyz * mv[1] + dzz * mv[2];
                            }
                        }
                    }
                }
            }
        }

        let kernel = HostBackend.build(&tensor).unwrap();
        let mut conv = Convolution::new(grid, kernel).unwrap();
        let mut h = VectorField3D::new(grid);
        let mut density = vec![0.0; grid.n_cells()];
        let mut shown = VectorField3D::new(grid);
        conv.convolute(&m, &mut h, false, Some(&mut density), Some(&mut shown));

        for (a, b) in h.data.iter().zip(expect.iter()) {
            for c in 0..3 {
                assert_abs_diff_eq!(a[c], b[c], epsilon = 1e-10);
            }
        }

        // Density is -mu0/2 M·H per cell; the display buffer carries H alone.
        for (idx, &e) in density.iter().enumerate() {
            let mv = m.data[idx];
            let hv = h.data[idx];
            let dot = mv[0] * hv[0] + mv[1] * hv[1] + mv[2] * hv[2];
            assert_abs_diff_eq!(e, -0.5 * MU0 * dot, epsilon = 1e-18);
            assert_eq!(shown.data[idx], hv);
        }
    }
}
