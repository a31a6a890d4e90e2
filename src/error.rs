// src/error.rs

use thiserror::Error;

/// Failure conditions surfaced by the demag core.
///
/// Allocation failures are fatal to module initialisation: the caller is
/// expected to abort or disable the module. Device-side kernel construction
/// falling back to host computation is a warning (logged), not an error.
#[derive(Debug, Error)]
pub enum DemagError {
    #[error("out of host memory allocating {what} ({bytes} bytes)")]
    OutOfMemory { what: &'static str, bytes: usize },

    #[error("out of device memory allocating {what} ({bytes} bytes)")]
    OutOfDeviceMemory { what: &'static str, bytes: usize },
}

/// Allocate a zero-initialised vector, surfacing allocation failure as an
/// error instead of aborting the process.
pub fn try_alloc<T: Clone + Default>(len: usize, what: &'static str) -> Result<Vec<T>, DemagError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| DemagError::OutOfMemory {
        what,
        bytes: len * std::mem::size_of::<T>(),
    })?;
    v.resize(len, T::default());
    Ok(v)
}
