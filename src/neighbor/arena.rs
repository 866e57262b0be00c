//! Fixed-stride particle storage.
//!
//! Records are split into two parallel arrays: all real fields of record
//! `i` live at `reals[i * real_stride..]`, all int fields at
//! `ints[i * int_stride..]`. Growth always zero-fills, so a freshly sized
//! ghost buffer holds well-defined records until the fill overwrites them.

use super::layout::{CPU_INDEX, ID_INDEX, ParticleLayout, Real};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParticleArray {
    real_stride: usize,
    int_stride: usize,
    reals: Vec<Real>,
    ints: Vec<i32>,
}

impl ParticleArray {
    pub fn new(layout: &ParticleLayout) -> Self {
        Self::with_capacity(layout, 0)
    }

    pub fn with_capacity(layout: &ParticleLayout, capacity: usize) -> Self {
        Self {
            real_stride: layout.real_stride(),
            int_stride: layout.int_stride(),
            reals: Vec::with_capacity(capacity * layout.real_stride()),
            ints: Vec::with_capacity(capacity * layout.int_stride()),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ints.len() / self.int_stride.max(1)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ints.is_empty()
    }

    #[inline]
    pub fn real_stride(&self) -> usize {
        self.real_stride
    }

    #[inline]
    pub fn int_stride(&self) -> usize {
        self.int_stride
    }

    pub fn clear(&mut self) {
        self.reals.clear();
        self.ints.clear();
    }

    pub fn truncate(&mut self, len: usize) {
        self.reals.truncate(len * self.real_stride);
        self.ints.truncate(len * self.int_stride);
    }

    /// Grow or shrink to `len` records; new records are zero.
    pub fn resize(&mut self, len: usize) {
        self.reals.resize(len * self.real_stride, 0.0);
        self.ints.resize(len * self.int_stride, 0);
    }

    /// Append `count` zero records and return the index of the first.
    pub fn extend_zeroed(&mut self, count: usize) -> usize {
        let first = self.len();
        self.resize(first + count);
        first
    }

    pub fn push(&mut self, real: &[Real], int: &[i32]) -> usize {
        assert_eq!(real.len(), self.real_stride, "record real field count");
        assert_eq!(int.len(), self.int_stride, "record int field count");
        let index = self.len();
        self.reals.extend_from_slice(real);
        self.ints.extend_from_slice(int);
        index
    }

    #[inline]
    pub fn get(&self, index: usize) -> ParticleRef<'_> {
        let r = index * self.real_stride;
        let i = index * self.int_stride;
        ParticleRef {
            real: &self.reals[r..r + self.real_stride],
            int: &self.ints[i..i + self.int_stride],
        }
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> ParticleMut<'_> {
        let r = index * self.real_stride;
        let i = index * self.int_stride;
        ParticleMut {
            real: &mut self.reals[r..r + self.real_stride],
            int: &mut self.ints[i..i + self.int_stride],
        }
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = ParticleRef<'_>> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    /// Raw base pointers for the lock-free fill. Callers must guarantee that
    /// concurrent writers touch disjoint records and that the array is not
    /// resized while the pointers are live.
    pub(crate) fn raw_parts_mut(&mut self) -> (*mut Real, *mut i32, usize) {
        let len = self.len();
        (self.reals.as_mut_ptr(), self.ints.as_mut_ptr(), len)
    }
}

/// Borrowed view of one record.
#[derive(Clone, Copy, Debug)]
pub struct ParticleRef<'a> {
    real: &'a [Real],
    int: &'a [i32],
}

impl<'a> ParticleRef<'a> {
    pub fn new(real: &'a [Real], int: &'a [i32]) -> Self {
        Self { real, int }
    }

    #[inline]
    pub fn pos(&self, dim: usize) -> Real {
        self.real[dim]
    }

    #[inline]
    pub fn id(&self) -> i32 {
        self.int[ID_INDEX]
    }

    #[inline]
    pub fn cpu(&self) -> i32 {
        self.int[CPU_INDEX]
    }

    #[inline]
    pub fn real(&self) -> &'a [Real] {
        self.real
    }

    #[inline]
    pub fn int(&self) -> &'a [i32] {
        self.int
    }

    pub fn to_particle(&self) -> Particle {
        Particle {
            real: self.real.to_vec(),
            int: self.int.to_vec(),
        }
    }
}

/// Mutable view of one record.
#[derive(Debug)]
pub struct ParticleMut<'a> {
    real: &'a mut [Real],
    int: &'a mut [i32],
}

impl<'a> ParticleMut<'a> {
    pub(crate) fn from_raw(real: &'a mut [Real], int: &'a mut [i32]) -> Self {
        Self { real, int }
    }

    #[inline]
    pub fn real_mut(&mut self) -> &mut [Real] {
        &mut *self.real
    }

    #[inline]
    pub fn int_mut(&mut self) -> &mut [i32] {
        &mut *self.int
    }

    #[inline]
    pub fn set_pos(&mut self, dim: usize, value: Real) {
        self.real[dim] = value;
    }

    pub fn copy_from(&mut self, src: ParticleRef<'_>) {
        self.real.copy_from_slice(src.real);
        self.int.copy_from_slice(src.int);
    }

    pub fn as_ref(&self) -> ParticleRef<'_> {
        ParticleRef {
            real: &*self.real,
            int: &*self.int,
        }
    }
}

/// Owned record, mostly for scratch space and for comparing buffers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Particle {
    pub real: Vec<Real>,
    pub int: Vec<i32>,
}

impl Particle {
    pub fn zeroed(layout: &ParticleLayout) -> Self {
        Self {
            real: vec![0.0; layout.real_stride()],
            int: vec![0; layout.int_stride()],
        }
    }

    pub fn as_ref(&self) -> ParticleRef<'_> {
        ParticleRef {
            real: &self.real,
            int: &self.int,
        }
    }

    pub fn as_mut(&mut self) -> ParticleMut<'_> {
        ParticleMut {
            real: &mut self.real,
            int: &mut self.int,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> ParticleLayout {
        ParticleLayout::new(2, 1, 1).unwrap()
    }

    #[test]
    fn push_and_get_round_trip() {
        let mut arr = ParticleArray::new(&layout());
        assert!(arr.is_empty());
        let a = arr.push(&[0.5, 1.5, 9.0], &[7, 0, 11]);
        let b = arr.push(&[2.5, 3.5, 8.0], &[8, 1, 12]);
        assert_eq!((a, b), (0, 1));
        assert_eq!(arr.len(), 2);

        let p = arr.get(1);
        assert_eq!(p.pos(0), 2.5);
        assert_eq!(p.pos(1), 3.5);
        assert_eq!(p.id(), 8);
        assert_eq!(p.cpu(), 1);
        assert_eq!(p.int()[2], 12);
    }

    #[test]
    fn resize_zero_fills_new_records() {
        let mut arr = ParticleArray::new(&layout());
        arr.push(&[1.0, 1.0, 1.0], &[1, 1, 1]);
        let first = arr.extend_zeroed(2);
        assert_eq!(first, 1);
        assert_eq!(arr.len(), 3);
        assert!(arr.get(2).real().iter().all(|v| *v == 0.0));
        assert!(arr.get(2).int().iter().all(|v| *v == 0));

        arr.truncate(1);
        assert_eq!(arr.len(), 1);
        arr.resize(2);
        assert_eq!(arr.get(1).id(), 0);
    }

    #[test]
    fn copy_from_overwrites_whole_record() {
        let mut arr = ParticleArray::new(&layout());
        arr.resize(1);
        let src = Particle {
            real: vec![4.0, 5.0, 6.0],
            int: vec![1, 2, 3],
        };
        arr.get_mut(0).copy_from(src.as_ref());
        assert_eq!(arr.get(0).to_particle(), src);
    }

    #[test]
    #[should_panic(expected = "record real field count")]
    fn push_rejects_wrong_shape() {
        let mut arr = ParticleArray::new(&layout());
        arr.push(&[1.0], &[1, 2, 3]);
    }
}
