//! Integer cell boxes and per-level problem geometry.
//!
//! Boxes are always stored in three dimensions; unused dimensions of a 1-D
//! or 2-D problem are pinned to the single cell `0..=0`.

use super::error::NeighborError;
use super::layout::{MAX_DIM, Real};

pub type IntVect = [i32; MAX_DIM];

/// Inclusive cell-centered index box.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IntBox {
    pub lo: IntVect,
    pub hi: IntVect,
}

impl IntBox {
    #[inline]
    pub const fn new(lo: IntVect, hi: IntVect) -> Self {
        Self { lo, hi }
    }

    /// Box spanning `lo..=hi` in the first `lo.len()` dimensions.
    pub fn from_slices(lo: &[i32], hi: &[i32]) -> Self {
        assert_eq!(lo.len(), hi.len(), "box corner dimensions differ");
        assert!(lo.len() <= MAX_DIM, "box has more than {MAX_DIM} dimensions");
        let mut out = Self::new([0; MAX_DIM], [0; MAX_DIM]);
        out.lo[..lo.len()].copy_from_slice(lo);
        out.hi[..hi.len()].copy_from_slice(hi);
        out
    }

    #[inline]
    pub const fn cell(iv: IntVect) -> Self {
        Self { lo: iv, hi: iv }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        (0..MAX_DIM).any(|d| self.hi[d] < self.lo[d])
    }

    #[inline]
    pub fn length(&self, d: usize) -> i32 {
        (self.hi[d] - self.lo[d] + 1).max(0)
    }

    pub fn num_cells(&self) -> usize {
        (0..MAX_DIM).map(|d| self.length(d) as usize).product()
    }

    #[inline]
    pub fn contains(&self, iv: IntVect) -> bool {
        (0..MAX_DIM).all(|d| iv[d] >= self.lo[d] && iv[d] <= self.hi[d])
    }

    pub fn contains_box(&self, other: &IntBox) -> bool {
        self.contains(other.lo) && self.contains(other.hi)
    }

    pub fn intersects(&self, other: &IntBox) -> bool {
        (0..MAX_DIM).all(|d| self.lo[d] <= other.hi[d] && other.lo[d] <= self.hi[d])
    }

    /// Grow by `n` cells on both sides of the first `dim` dimensions.
    #[must_use]
    pub fn grow(&self, n: i32, dim: usize) -> Self {
        let mut out = *self;
        for d in 0..dim {
            out.lo[d] -= n;
            out.hi[d] += n;
        }
        out
    }

    #[must_use]
    pub fn shift(&self, by: IntVect) -> Self {
        let mut out = *self;
        for d in 0..MAX_DIM {
            out.lo[d] += by[d];
            out.hi[d] += by[d];
        }
        out
    }

    /// Coarsen by `ratio` with floor semantics (negative indices included).
    #[must_use]
    pub fn coarsen(&self, ratio: IntVect) -> Self {
        let mut out = *self;
        for d in 0..MAX_DIM {
            out.lo[d] = self.lo[d].div_euclid(ratio[d]);
            out.hi[d] = self.hi[d].div_euclid(ratio[d]);
        }
        out
    }

    /// Row-major offset of `iv` (dimension 0 fastest), or `None` outside.
    #[inline]
    pub fn linear_index(&self, iv: IntVect) -> Option<usize> {
        if !self.contains(iv) {
            return None;
        }
        let nx = self.length(0) as usize;
        let ny = self.length(1) as usize;
        let x = (iv[0] - self.lo[0]) as usize;
        let y = (iv[1] - self.lo[1]) as usize;
        let z = (iv[2] - self.lo[2]) as usize;
        Some(x + nx * (y + ny * z))
    }

    /// Iterate every cell, dimension 0 fastest.
    pub fn cells(&self) -> Cells {
        Cells {
            bx: *self,
            next: (!self.is_empty()).then_some(self.lo),
        }
    }
}

pub struct Cells {
    bx: IntBox,
    next: Option<IntVect>,
}

impl Iterator for Cells {
    type Item = IntVect;

    fn next(&mut self) -> Option<IntVect> {
        let current = self.next?;
        let mut step = current;
        self.next = None;
        for d in 0..MAX_DIM {
            if step[d] < self.bx.hi[d] {
                step[d] += 1;
                self.next = Some(step);
                break;
            }
            step[d] = self.bx.lo[d];
        }
        Some(current)
    }
}

/// Physical extent, periodicity and cell size of one refinement level.
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry {
    dim: usize,
    domain: IntBox,
    prob_lo: [Real; MAX_DIM],
    prob_hi: [Real; MAX_DIM],
    periodic: [bool; MAX_DIM],
}

impl Geometry {
    pub fn new(domain: IntBox, prob_lo: &[Real], prob_hi: &[Real]) -> Result<Self, NeighborError> {
        let dim = prob_lo.len();
        if dim == 0 || dim > MAX_DIM || prob_hi.len() != dim {
            return Err(NeighborError::Dimension(dim));
        }
        let mut lo = [0.0; MAX_DIM];
        let mut hi = [1.0; MAX_DIM];
        for d in 0..dim {
            if !(prob_hi[d] > prob_lo[d]) || domain.length(d) == 0 {
                return Err(NeighborError::ProblemDomain {
                    dim: d,
                    lo: prob_lo[d],
                    hi: prob_hi[d],
                });
            }
            lo[d] = prob_lo[d];
            hi[d] = prob_hi[d];
        }
        Ok(Self {
            dim,
            domain,
            prob_lo: lo,
            prob_hi: hi,
            periodic: [false; MAX_DIM],
        })
    }

    #[must_use]
    pub fn with_periodicity(mut self, periodic: &[bool]) -> Self {
        for (d, &p) in periodic.iter().enumerate().take(self.dim) {
            self.periodic[d] = p;
        }
        self
    }

    /// Same physical domain, `ratio` times finer.
    #[must_use]
    pub fn refine(&self, ratio: IntVect) -> Self {
        let mut out = self.clone();
        for d in 0..self.dim {
            out.domain.lo[d] = self.domain.lo[d] * ratio[d];
            out.domain.hi[d] = (self.domain.hi[d] + 1) * ratio[d] - 1;
        }
        out
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn domain(&self) -> &IntBox {
        &self.domain
    }

    #[inline]
    pub fn is_periodic(&self, d: usize) -> bool {
        self.periodic[d]
    }

    pub fn is_any_periodic(&self) -> bool {
        self.periodic.iter().any(|p| *p)
    }

    #[inline]
    pub fn prob_lo(&self, d: usize) -> Real {
        self.prob_lo[d]
    }

    #[inline]
    pub fn prob_hi(&self, d: usize) -> Real {
        self.prob_hi[d]
    }

    /// Physical domain length along `d`.
    #[inline]
    pub fn length(&self, d: usize) -> Real {
        self.prob_hi[d] - self.prob_lo[d]
    }

    #[inline]
    pub fn cell_size(&self, d: usize) -> Real {
        self.length(d) / self.domain.length(d) as Real
    }

    /// Domain extent in cells along `d`; the cell offset of one periodic image.
    #[inline]
    pub fn period_cells(&self, d: usize) -> i32 {
        self.domain.length(d)
    }

    /// Cell containing `pos` at this level's resolution.
    pub fn cell_index(&self, pos: &[Real]) -> IntVect {
        let mut iv = [0; MAX_DIM];
        for d in 0..self.dim {
            let rel = (pos[d] - self.prob_lo[d]) / self.cell_size(d);
            iv[d] = self.domain.lo[d] + rel.floor() as i32;
        }
        iv
    }

    /// Every periodic image offset in {-1, 0, +1} per periodic dimension,
    /// the zero shift first.
    pub fn periodic_shifts(&self) -> Vec<[i8; MAX_DIM]> {
        let mut shifts = vec![[0i8; MAX_DIM]];
        for d in 0..self.dim {
            if !self.periodic[d] {
                continue;
            }
            let base = shifts.clone();
            for s in [-1i8, 1] {
                shifts.extend(base.iter().map(|shift| {
                    let mut shift = *shift;
                    shift[d] = s;
                    shift
                }));
            }
        }
        shifts
    }

    /// Cell offset corresponding to a periodic image shift.
    pub fn shift_cells(&self, shift: [i8; MAX_DIM]) -> IntVect {
        let mut by = [0; MAX_DIM];
        for d in 0..self.dim {
            by[d] = shift[d] as i32 * self.period_cells(d);
        }
        by
    }
}
