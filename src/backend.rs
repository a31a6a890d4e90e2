// src/backend.rs
//
// Kernel construction backends.
//
// The frequency-domain kernel is built from the real-space tensor by three
// 1D forward passes (x, then y, then z), keeping only the reduced half
// spectrum per axis. `HostBackend` runs the passes over the whole grid.
// `RegionBackend` models a multi-device build: the reduced x axis is split
// into contiguous column regions, each worker x-transforms a disjoint block
// of rows, and a single redistribution step hands every region its owned
// columns before the y/z passes proceed independently per region.
//
// Device memory is accounted against an optional byte limit so the
// out-of-device-memory path is testable without real devices. Construction
// falls back in stages: full region build, region build without the
// zero-padding preservation buffers, then host.

use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{try_alloc, DemagError};
use crate::kernel::{DemagKernel, LinePass, COMPONENT_PARITIES};
use crate::tensor::DemagTensor;

/// Builds a parity-reduced frequency kernel from a real-space tensor.
pub trait KernelBackend {
    fn build(&self, tensor: &DemagTensor) -> Result<DemagKernel, DemagError>;
}

/// Single-threaded-memory reference backend: all passes over the full grid.
pub struct HostBackend;

impl KernelBackend for HostBackend {
    fn build(&self, tensor: &DemagTensor) -> Result<DemagKernel, DemagError> {
        let [nx, ny, nz] = tensor.dims;
        let mut kernel = DemagKernel::alloc(tensor.dims)?;
        let [kx, ky, kz] = kernel.kdims;

        let mut planner = FftPlanner::new();
        let pass_x = LinePass::new(&mut planner, nx);
        let pass_y = LinePass::new(&mut planner, ny);
        let pass_z = (nz > 1).then(|| LinePass::new(&mut planner, nz));

        let ncomp = if kernel.is_plane() { 4 } else { 6 };
        let mut block: Vec<f64> = try_alloc(kx * ny * nz, "kernel pass buffer")?;

        for c in 0..ncomp {
            let p = COMPONENT_PARITIES[c];
            let src = tensor.component(c);

            // x pass: rows are contiguous, one output chunk per row.
            block
                .par_chunks_mut(kx)
                .enumerate()
                .for_each_init(
                    || Vec::with_capacity(nx),
                    |line: &mut Vec<Complex<f64>>, (r, out)| {
                        pass_x.transform(line, src[r * nx..r * nx + nx].iter().copied());
                        pass_x.extract(line, p.odd_x, (0, kx), &mut |b, v| out[b] = v);
                    },
                );

            pass_y_block(&mut block, kx, ny, nz, &pass_y, p.odd_y);
            if let Some(pz) = &pass_z {
                pass_z_block(&mut block, kx, ky, nz, pz, p.odd_z);
            }

            let sign = if p.negate() { -1.0 } else { 1.0 };
            kernel
                .component_mut(c)
                .par_iter_mut()
                .zip_eq(block[..kx * ky * kz].par_iter())
                .for_each(|(d, &s)| *d = sign * s);
        }

        Ok(kernel)
    }
}

/// Multi-region backend with device memory accounting.
///
/// `regions` is the device count; `device_memory_limit` caps the summed
/// working-buffer bytes per build (None = unlimited). With
/// `preserve_zero_padding` the y/z passes run on a copy so each region's
/// gathered (still zero-padded) input stays intact; without it they repack
/// in place, trading the extra buffer for recomputation-friendly layout.
pub struct RegionBackend {
    pub regions: usize,
    pub preserve_zero_padding: bool,
    pub device_memory_limit: Option<usize>,
}

impl RegionBackend {
    pub fn new(regions: usize) -> Self {
        Self {
            regions,
            preserve_zero_padding: true,
            device_memory_limit: None,
        }
    }
}

impl KernelBackend for RegionBackend {
    fn build(&self, tensor: &DemagTensor) -> Result<DemagKernel, DemagError> {
        let [nx, ny, nz] = tensor.dims;
        let mut kernel = DemagKernel::alloc(tensor.dims)?;
        let [kx, ky, kz] = kernel.kdims;

        let mut planner = FftPlanner::new();
        let pass_x = LinePass::new(&mut planner, nx);
        let pass_y = LinePass::new(&mut planner, ny);
        let pass_z = (nz > 1).then(|| LinePass::new(&mut planner, nz));

        let budget = DeviceBudget::new(self.device_memory_limit);
        let bounds = partition(kx, self.regions.clamp(1, kx));
        let row_ranges = partition(ny * nz, bounds.len());
        let exchange = ColumnExchange::new(&bounds);

        let ncomp = if kernel.is_plane() { 4 } else { 6 };

        for c in 0..ncomp {
            let p = COMPONENT_PARITIES[c];
            let src = tensor.component(c);

            // Step 1: each worker x-transforms its block of rows and splits
            // the half spectrum into one column strip per region.
            let strips: Vec<Vec<Vec<f64>>> = row_ranges
                .par_iter()
                .map(|&(r0, rows)| -> Result<Vec<Vec<f64>>, DemagError> {
                    let mut out = Vec::with_capacity(bounds.len());
                    for &(_, w) in &bounds {
                        out.push(budget.alloc(rows * w, "x-pass column strip")?);
                    }
                    let mut line = Vec::with_capacity(nx);
                    for r in 0..rows {
                        let row = &src[(r0 + r) * nx..(r0 + r) * nx + nx];
                        pass_x.transform(&mut line, row.iter().copied());
                        for (ri, &(x0, w)) in bounds.iter().enumerate() {
                            let dst = &mut out[ri][r * w..(r + 1) * w];
                            pass_x.extract(&line, p.odd_x, (x0, x0 + w), &mut |b, v| dst[b] = v);
                        }
                    }
                    Ok(out)
                })
                .collect::<Result<_, _>>()?;

            // Redistribution: the single synchronisation point.
            let mut regions = exchange.run(strips, &budget)?;

            // Steps 2-3: y/z passes proceed independently per region.
            regions
                .par_iter_mut()
                .try_for_each(|reg| -> Result<(), DemagError> {
                    let w = reg.width;
                    if self.preserve_zero_padding {
                        let mut work =
                            budget.alloc(reg.data.len(), "zero-padding preservation buffer")?;
                        work.copy_from_slice(&reg.data);
                        pass_y_block(&mut work, w, ny, nz, &pass_y, p.odd_y);
                        if let Some(pz) = &pass_z {
                            pass_z_block(&mut work, w, ky, nz, pz, p.odd_z);
                        }
                        budget.free(reg.data.len());
                        reg.data = work;
                    } else {
                        pass_y_block(&mut reg.data, w, ny, nz, &pass_y, p.odd_y);
                        if let Some(pz) = &pass_z {
                            pass_z_block(&mut reg.data, w, ky, nz, pz, p.odd_z);
                        }
                    }
                    Ok(())
                })?;

            // Assemble the packed component from the region columns.
            let sign = if p.negate() { -1.0 } else { 1.0 };
            kernel
                .component_mut(c)
                .par_chunks_mut(kx)
                .enumerate()
                .for_each(|(row, out)| {
                    for reg in &regions {
                        let s = &reg.data[row * reg.width..(row + 1) * reg.width];
                        for (i, &v) in s.iter().enumerate() {
                            out[reg.x0 + i] = sign * v;
                        }
                    }
                });

            for reg in regions {
                budget.free(reg.data.len());
            }
        }

        Ok(kernel)
    }
}

/// Build the kernel on the region backend, degrading in stages.
///
/// Order: full region build; region build without zero-padding preservation;
/// host build. Returns the kernel and whether the host fallback was taken.
/// Host allocation failure is fatal and propagates.
pub fn build_kernel_with_fallback(
    tensor: &DemagTensor,
    region: &RegionBackend,
) -> Result<(DemagKernel, bool), DemagError> {
    match region.build(tensor) {
        Ok(k) => return Ok((k, false)),
        Err(DemagError::OutOfDeviceMemory { what, bytes }) => {
            tracing::debug!(what, bytes, "kernel build exceeded device memory");
        }
        Err(e) => return Err(e),
    }

    if region.preserve_zero_padding {
        let reduced = RegionBackend {
            preserve_zero_padding: false,
            ..*region
        };
        match reduced.build(tensor) {
            Ok(k) => return Ok((k, false)),
            Err(DemagError::OutOfDeviceMemory { what, bytes }) => {
                tracing::debug!(what, bytes, "reduced-memory kernel build also exceeded device memory");
            }
            Err(e) => return Err(e),
        }
    }

    tracing::warn!("device kernel construction failed, computing kernel on host");
    HostBackend.build(tensor).map(|k| (k, true))
}

/// Forward pass along y over a column block of width `w`, layout x fastest.
///
/// Repacks in place: the reduced result occupies the leading `w * half * nz`
/// entries. Each line is gathered before any of it is overwritten, and a
/// line's outputs land only in its own column, so earlier planes' leftovers
/// are never re-read.
fn pass_y_block(data: &mut [f64], w: usize, ny: usize, nz: usize, pass: &LinePass, odd: bool) {
    let ky = pass.half();
    let mut line = Vec::with_capacity(ny);
    for k in 0..nz {
        for i in 0..w {
            pass.transform(&mut line, (0..ny).map(|j| data[(k * ny + j) * w + i]));
            pass.extract(&line, odd, (0, ky), &mut |jj, v| {
                data[(k * ky + jj) * w + i] = v;
            });
        }
    }
}

/// Forward pass along z over a column block already reduced along y.
fn pass_z_block(data: &mut [f64], w: usize, ky: usize, nz: usize, pass: &LinePass, odd: bool) {
    let kz = pass.half();
    let mut line = Vec::with_capacity(nz);
    for j in 0..ky {
        for i in 0..w {
            pass.transform(&mut line, (0..nz).map(|k| data[(k * ky + j) * w + i]));
            pass.extract(&line, odd, (0, kz), &mut |kk, v| {
                data[(kk * ky + j) * w + i] = v;
            });
        }
    }
}

/// One device's owned columns of the reduced x spectrum, x fastest.
struct ColumnRegion {
    x0: usize,
    width: usize,
    data: Vec<f64>,
}

/// Gathers per-worker column strips into contiguous per-region arrays.
///
/// Workers hold contiguous row blocks in ascending order, so each region's
/// array is the plain concatenation of its strips.
struct ColumnExchange<'a> {
    bounds: &'a [(usize, usize)],
}

impl<'a> ColumnExchange<'a> {
    fn new(bounds: &'a [(usize, usize)]) -> Self {
        Self { bounds }
    }

    fn run(
        &self,
        strips: Vec<Vec<Vec<f64>>>,
        budget: &DeviceBudget,
    ) -> Result<Vec<ColumnRegion>, DemagError> {
        let mut regions = Vec::with_capacity(self.bounds.len());
        for (ri, &(x0, width)) in self.bounds.iter().enumerate() {
            let total: usize = strips.iter().map(|worker| worker[ri].len()).sum();
            let mut data = budget.alloc(total, "gathered column region")?;
            let mut off = 0;
            for worker in &strips {
                let part = &worker[ri];
                data[off..off + part.len()].copy_from_slice(part);
                off += part.len();
            }
            regions.push(ColumnRegion { x0, width, data });
        }
        for worker in strips {
            for part in worker {
                budget.free(part.len());
            }
        }
        Ok(regions)
    }
}

/// Working-buffer byte accounting against an optional device limit.
struct DeviceBudget {
    limit: Option<usize>,
    used: AtomicUsize,
}

impl DeviceBudget {
    fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    fn alloc(&self, len: usize, what: &'static str) -> Result<Vec<f64>, DemagError> {
        let bytes = len * std::mem::size_of::<f64>();
        if let Some(limit) = self.limit {
            let reserved = self.used.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used + bytes <= limit).then(|| used + bytes)
            });
            if reserved.is_err() {
                return Err(DemagError::OutOfDeviceMemory { what, bytes });
            }
        }
        try_alloc(len, what)
    }

    fn free(&self, len: usize) {
        if self.limit.is_some() {
            self.used
                .fetch_sub(len * std::mem::size_of::<f64>(), Ordering::SeqCst);
        }
    }
}

/// Split `total` into `parts` contiguous (start, len) ranges, remainder
/// spread over the leading parts.
fn partition(total: usize, parts: usize) -> Vec<(usize, usize)> {
    let base = total / parts;
    let rem = total % parts;
    let mut out = Vec::with_capacity(parts);
    let mut start = 0;
    for p in 0..parts {
        let len = base + (p < rem) as usize;
        out.push((start, len));
        start += len;
    }
    out
}
