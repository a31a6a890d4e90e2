// src/demag.rs
//
// Demagnetising-field module: ties the convolution engine, the evaluation
// speedup history and the optional macrocell pass together.
//
// Per call the module is in one of three regimes:
//   - no speedup (order 0): exact convolution every call;
//   - filling: exact convolution, every evaluation saved until the history
//     holds `order` samples;
//   - steady: exact convolution (cycling the oldest slot) only at integrator
//     step boundaries, polynomial extrapolation over the saved samples in
//     between.
//
// Saved samples hold the non-local part of the field only: the self
// contribution is subtracted before storing and re-added from the *current*
// moment on extrapolation, so the local response never lags.

use rayon::prelude::*;

use crate::backend::{build_kernel_with_fallback, RegionBackend};
use crate::config::DemagConfig;
use crate::convolution::Convolution;
use crate::error::DemagError;
use crate::grid::{Grid3D, PbcImages};
use crate::history::FieldHistory;
use crate::macrocell::MacrocellMap;
use crate::tensor::TensorGenerator;
use crate::vec3;
use crate::vector_field::VectorField3D;
use crate::MU0;

struct CoarsePass {
    map: MacrocellMap,
    /// Macrocell-averaged moment, refreshed every call.
    m: VectorField3D,
}

pub struct DemagModule {
    config: DemagConfig,
    grid: Grid3D,
    coarse: Option<CoarsePass>,
    conv: Convolution,
    history: FieldHistory,
    self_coeff: [f64; 3],
    kernel_degraded: bool,
    /// Last computed field on the compute grid (coarse when macrocells are
    /// active). Doubles as the display buffer.
    h_work: VectorField3D,
    last_energy: f64,
}

impl DemagModule {
    pub fn new(grid: Grid3D, config: DemagConfig) -> Result<Self, DemagError> {
        let (coarse, conv, self_coeff, kernel_degraded) = Self::build_parts(grid, &config)?;
        let h_work = VectorField3D::try_new(conv.grid())?;
        let history = FieldHistory::new(config.clamped_order());
        Ok(Self {
            config,
            grid,
            coarse,
            conv,
            history,
            self_coeff,
            kernel_degraded,
            h_work,
            last_energy: 0.0,
        })
    }

    fn build_parts(
        grid: Grid3D,
        config: &DemagConfig,
    ) -> Result<(Option<CoarsePass>, Convolution, [f64; 3], bool), DemagError> {
        let coarse = match config.macrocell.and_then(|size| MacrocellMap::new(grid, size)) {
            Some(map) => {
                let m = VectorField3D::try_new(map.coarse())?;
                Some(CoarsePass { map, m })
            }
            None => None,
        };
        let cgrid = coarse.as_ref().map(|c| c.map.coarse()).unwrap_or(grid);

        let generator = TensorGenerator::new(
            [cgrid.nx, cgrid.ny, cgrid.nz],
            cgrid.padded_size(config.pbc_images),
            cgrid.normalized_cell(),
            config.include_self_demag,
            config.pbc_images,
        );
        let tensor = generator.generate()?;
        let self_coeff = generator.self_coefficient();

        let backend = RegionBackend {
            regions: config.devices.max(1),
            preserve_zero_padding: true,
            device_memory_limit: config.device_memory_limit,
        };
        let (kernel, degraded) = build_kernel_with_fallback(&tensor, &backend)?;
        let conv = Convolution::new(cgrid, kernel)?;

        Ok((coarse, conv, self_coeff, degraded))
    }

    /// Compute the demag field at `time`, add it into `heff`, and return the
    /// volume-averaged energy density -mu0 sum(M·H) / (2 n_nonempty).
    ///
    /// `step_boundary` marks calls at integrator step boundaries; only those
    /// refresh the history once it is full. Extrapolated calls return the
    /// energy of the last exact evaluation; macrocell mode reports zero.
    ///
    /// Precondition: evaluation times are strictly increasing across calls
    /// that save to the history. A duplicated saved timestamp divides by
    /// zero in the Lagrange weights; this is not guarded.
    pub fn update_field(
        &mut self,
        m: &VectorField3D,
        heff: &mut VectorField3D,
        time: f64,
        step_boundary: bool,
    ) -> Result<f64, DemagError> {
        debug_assert_eq!(m.grid, self.grid);
        debug_assert_eq!(heff.grid, self.grid);

        if let Some(c) = &mut self.coarse {
            c.map.transfer_in(m, &mut c.m);
        }
        let m_eval: &VectorField3D = match &self.coarse {
            Some(c) => &c.m,
            None => m,
        };

        let order = self.history.order();
        let exact = order == 0 || !self.history.is_full() || step_boundary;

        let dot = if exact {
            let dot = self.conv.convolute(m_eval, &mut self.h_work, false, None, None);
            if order > 0 {
                let c = self.self_coeff;
                let h = &self.h_work;
                let slot = self.history.claim(h.grid, time)?;
                slot.data.par_iter_mut().enumerate().for_each(|(i, s)| {
                    let hv = h.data[i];
                    let sm = vec3::hadamard(c, m_eval.data[i]);
                    *s = [hv[0] - sm[0], hv[1] - sm[1], hv[2] - sm[2]];
                });
            }
            Some(dot)
        } else {
            let w = self.history.weights(time);
            let slots = self.history.slots();
            let c = self.self_coeff;
            self.h_work.data.par_iter_mut().enumerate().for_each(|(i, h)| {
                let mut acc = vec3::hadamard(c, m_eval.data[i]);
                for (slot, &a) in slots.iter().zip(&w) {
                    let f = slot.field.data[i];
                    acc[0] += a * f[0];
                    acc[1] += a * f[1];
                    acc[2] += a * f[2];
                }
                *h = acc;
            });
            None
        };

        match &self.coarse {
            Some(c) => c.map.transfer_out_add(&self.h_work, heff),
            None => {
                heff.data
                    .par_iter_mut()
                    .zip_eq(self.h_work.data.par_iter())
                    .for_each(|(o, v)| {
                        o[0] += v[0];
                        o[1] += v[1];
                        o[2] += v[2];
                    });
            }
        }

        let energy = if self.coarse.is_some() {
            0.0
        } else if let Some(dot) = dot {
            let nonempty = m.nonempty_cells();
            if nonempty == 0 {
                0.0
            } else {
                -MU0 * dot / (2.0 * nonempty as f64)
            }
        } else {
            self.last_energy
        };
        self.last_energy = energy;
        Ok(energy)
    }

    /// Rebuild kernel, macrocell map and history for a new configuration.
    /// All saved evaluations are dropped.
    pub fn reconfigure(&mut self, config: DemagConfig) -> Result<(), DemagError> {
        let (coarse, conv, self_coeff, kernel_degraded) = Self::build_parts(self.grid, &config)?;
        self.h_work = VectorField3D::try_new(conv.grid())?;
        self.history = FieldHistory::new(config.clamped_order());
        self.coarse = coarse;
        self.conv = conv;
        self.self_coeff = self_coeff;
        self.kernel_degraded = kernel_degraded;
        self.config = config;
        self.last_energy = 0.0;
        Ok(())
    }

    /// Change the periodic image counts; implies a full kernel rebuild and
    /// history reset.
    pub fn set_pbc(&mut self, pbc: PbcImages) -> Result<(), DemagError> {
        let mut config = self.config.clone();
        config.pbc_images = pbc;
        self.reconfigure(config)
    }

    pub fn config(&self) -> &DemagConfig {
        &self.config
    }

    pub fn grid(&self) -> Grid3D {
        self.grid
    }

    /// Coarse compute grid when macrocells are active.
    pub fn macrocell_grid(&self) -> Option<Grid3D> {
        self.coarse.as_ref().map(|c| c.map.coarse())
    }

    /// Diagonal self-demagnetisation coefficient on the compute grid,
    /// periodic images included.
    pub fn self_demag_coefficient(&self) -> [f64; 3] {
        self.self_coeff
    }

    /// Number of exact evaluations currently saved.
    pub fn saved_evaluations(&self) -> usize {
        self.history.len()
    }

    /// Whether kernel construction fell back to the host path.
    pub fn kernel_degraded(&self) -> bool {
        self.kernel_degraded
    }

    pub fn last_energy(&self) -> f64 {
        self.last_energy
    }

    /// Last computed demag field on the compute grid (coarse when macrocells
    /// are active).
    pub fn field(&self) -> &VectorField3D {
        &self.h_work
    }
}
