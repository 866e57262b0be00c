//! Particle record layout and the compact wire encoding.
//!
//! A record is `dim` position reals, `n_real` extra reals, the two identity
//! integers (`id`, `cpu`) and `n_int` extra integers. Same-process ghost
//! copies move the full record (`pdata_size` bytes). Cross-process copies
//! carry only the fields selected by `real_mask` / `int_mask`: masked reals
//! first, then masked ints, each in declared order, little-endian, no
//! padding (`cdata_size` bytes).
//!
//! Unpacking writes every masked field and sets every unmasked field to
//! zero, so remote ghosts never expose stale or uninitialized data.

use super::arena::{ParticleMut, ParticleRef};
use super::error::NeighborError;

pub type Real = f64;

pub const REAL_BYTES: usize = size_of::<Real>();
pub const INT_BYTES: usize = size_of::<i32>();
pub const MAX_DIM: usize = 3;

/// Number of identity integers leading every record (`id`, `cpu`).
pub const NUM_IDENTITY_INTS: usize = 2;
pub const ID_INDEX: usize = 0;
pub const CPU_INDEX: usize = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParticleLayout {
    dim: usize,
    n_real: usize,
    n_int: usize,
    real_mask: Vec<bool>,
    int_mask: Vec<bool>,
    cdata_size: usize,
}

impl ParticleLayout {
    /// Layout with every field transmitted.
    pub fn new(dim: usize, n_real: usize, n_int: usize) -> Result<Self, NeighborError> {
        if dim == 0 || dim > MAX_DIM {
            return Err(NeighborError::Dimension(dim));
        }
        let real_mask = vec![true; dim + n_real];
        let int_mask = vec![true; NUM_IDENTITY_INTS + n_int];
        let cdata_size = compact_size(&real_mask, &int_mask);
        Ok(Self {
            dim,
            n_real,
            n_int,
            real_mask,
            int_mask,
            cdata_size,
        })
    }

    /// Restrict the transmitted fields. Masks are fixed for the lifetime of
    /// any container built from this layout.
    pub fn with_masks(mut self, real_mask: &[bool], int_mask: &[bool]) -> Result<Self, NeighborError> {
        if real_mask.len() != self.real_stride() {
            return Err(NeighborError::RealMaskLength {
                expected: self.real_stride(),
                got: real_mask.len(),
            });
        }
        if int_mask.len() != self.int_stride() {
            return Err(NeighborError::IntMaskLength {
                expected: self.int_stride(),
                got: int_mask.len(),
            });
        }
        self.real_mask = real_mask.to_vec();
        self.int_mask = int_mask.to_vec();
        self.cdata_size = compact_size(&self.real_mask, &self.int_mask);
        Ok(self)
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn n_real(&self) -> usize {
        self.n_real
    }

    #[inline]
    pub fn n_int(&self) -> usize {
        self.n_int
    }

    /// Real fields per record (positions included).
    #[inline]
    pub fn real_stride(&self) -> usize {
        self.dim + self.n_real
    }

    /// Int fields per record (identity ints included).
    #[inline]
    pub fn int_stride(&self) -> usize {
        NUM_IDENTITY_INTS + self.n_int
    }

    pub fn real_mask(&self) -> &[bool] {
        &self.real_mask
    }

    pub fn int_mask(&self) -> &[bool] {
        &self.int_mask
    }

    #[inline]
    pub fn pdata_size(&self) -> usize {
        self.real_stride() * REAL_BYTES + self.int_stride() * INT_BYTES
    }

    #[inline]
    pub fn cdata_size(&self) -> usize {
        self.cdata_size
    }

    /// Write the compact encoding of `p` into the first `cdata_size` bytes of `dst`.
    pub fn pack(&self, p: ParticleRef<'_>, dst: &mut [u8]) {
        assert!(
            dst.len() >= self.cdata_size,
            "compact record needs {} bytes, destination holds {}",
            self.cdata_size,
            dst.len()
        );
        let mut at = 0;
        for (value, _) in p.real().iter().zip(&self.real_mask).filter(|(_, m)| **m) {
            dst[at..at + REAL_BYTES].copy_from_slice(&value.to_le_bytes());
            at += REAL_BYTES;
        }
        for (value, _) in p.int().iter().zip(&self.int_mask).filter(|(_, m)| **m) {
            dst[at..at + INT_BYTES].copy_from_slice(&value.to_le_bytes());
            at += INT_BYTES;
        }
        debug_assert_eq!(at, self.cdata_size);
    }

    /// Expand one compact record from the front of `src` into `dst`.
    /// Unmasked fields are zeroed.
    pub fn unpack(&self, src: &[u8], mut dst: ParticleMut<'_>) {
        assert!(
            src.len() >= self.cdata_size,
            "compact record needs {} bytes, source holds {}",
            self.cdata_size,
            src.len()
        );
        let mut at = 0;
        for (slot, &masked) in dst.real_mut().iter_mut().zip(&self.real_mask) {
            *slot = if masked {
                let mut raw = [0u8; REAL_BYTES];
                raw.copy_from_slice(&src[at..at + REAL_BYTES]);
                at += REAL_BYTES;
                Real::from_le_bytes(raw)
            } else {
                0.0
            };
        }
        for (slot, &masked) in dst.int_mut().iter_mut().zip(&self.int_mask) {
            *slot = if masked {
                let mut raw = [0u8; INT_BYTES];
                raw.copy_from_slice(&src[at..at + INT_BYTES]);
                at += INT_BYTES;
                i32::from_le_bytes(raw)
            } else {
                0
            };
        }
        debug_assert_eq!(at, self.cdata_size);
    }
}

fn compact_size(real_mask: &[bool], int_mask: &[bool]) -> usize {
    let reals = real_mask.iter().filter(|m| **m).count();
    let ints = int_mask.iter().filter(|m| **m).count();
    reals * REAL_BYTES + ints * INT_BYTES
}
