// src/config.rs

use serde::{Deserialize, Serialize};

use crate::grid::PbcImages;

/// Highest supported extrapolation order (number of saved field evaluations).
pub const MAX_SPEEDUP_ORDER: usize = 6;

/// Configuration for the demagnetising-field module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemagConfig {
    /// Evaluation-speedup extrapolation order, 0..=6.
    ///
    /// 0 disables the speedup (exact convolution every call); K >= 1 keeps K
    /// saved evaluations and extrapolates between integrator step boundaries
    /// with a degree K-1 polynomial in time. K = 1 reuses the last saved
    /// field unchanged ("step" mode).
    pub speedup_order: usize,

    /// Periodic image counts per axis (0 = open boundary).
    pub pbc_images: PbcImages,

    /// Include the r = 0 self-demagnetisation term in the convolution kernel.
    pub include_self_demag: bool,

    /// Optional macrocell size (m). When set and coarser than the native cell,
    /// the convolution runs on the coarse grid and the field is broadcast back.
    /// A size that is not an integer multiple of the native cell along all
    /// axes is silently reverted to the native cell size.
    pub macrocell: Option<[f64; 3]>,

    /// Number of kernel-construction devices (column regions). 1 builds the
    /// whole kernel on a single region.
    #[serde(default = "default_devices")]
    pub devices: usize,

    /// Per-build device working-memory limit in bytes (None = unlimited).
    /// Exceeding it triggers the reduced-memory retry, then the host
    /// fallback.
    #[serde(default)]
    pub device_memory_limit: Option<usize>,
}

fn default_devices() -> usize {
    1
}

impl Default for DemagConfig {
    fn default() -> Self {
        Self {
            speedup_order: 0,
            pbc_images: PbcImages::default(),
            include_self_demag: true,
            macrocell: None,
            devices: 1,
            device_memory_limit: None,
        }
    }
}

impl DemagConfig {
    /// Clamp the speedup order into the supported range, warning if the
    /// requested value was out of range.
    pub fn clamped_order(&self) -> usize {
        if self.speedup_order > MAX_SPEEDUP_ORDER {
            tracing::warn!(
                requested = self.speedup_order,
                "speedup order clamped to {}",
                MAX_SPEEDUP_ORDER
            );
            MAX_SPEEDUP_ORDER
        } else {
            self.speedup_order
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_json() {
        let cfg = DemagConfig {
            speedup_order: 3,
            pbc_images: PbcImages::new(4, 4, 0),
            macrocell: Some([2e-9, 2e-9, 2e-9]),
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: DemagConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.speedup_order, 3);
        assert_eq!(back.pbc_images, PbcImages::new(4, 4, 0));
        assert_eq!(back.macrocell, Some([2e-9, 2e-9, 2e-9]));
    }

    #[test]
    fn out_of_range_order_is_clamped() {
        let cfg = DemagConfig {
            speedup_order: 9,
            ..Default::default()
        };
        assert_eq!(cfg.clamped_order(), MAX_SPEEDUP_ORDER);
    }
}
