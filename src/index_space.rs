use core::fmt;
use core::ops::Range;
use serde::{Deserialize, Serialize};




/**
 * Identifier for a Cartesian axis
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    I,
    J,
}




#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]


/**
 * Represents a rectangular region in a discrete index space
 */
pub struct IndexSpace {
    di: Range<i64>,
    dj: Range<i64>,
}




/**
 * Describes a rectangular index space. The index type is signed 64-bit integer.
 */
impl IndexSpace {


    pub fn new(di: Range<i64>, dj: Range<i64>) -> Self {

        assert!(
            di.start <= di.end && dj.start <= dj.end,
            "index space has negative volume");

        Self { di, dj }
    }


    /**
     * Return the number of indexes on each axis.
     */
    pub fn dim(&self) -> (usize, usize) {
        ((self.di.end - self.di.start) as usize,
         (self.dj.end - self.dj.start) as usize)
    }


    /**
     * Return the number of elements in this index space.
     */
    pub fn len(&self) -> usize {
        let (l, m) = self.dim();
        l * m
    }


    /**
     * Determine whether this index space has zero volume.
     */
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }


    /**
     * Return the minimum index (inclusive).
     */
    pub fn start(&self) -> (i64, i64) {
        (self.di.start, self.dj.start)
    }


    /**
     * Return the extent of this index space along one axis.
     */
    pub fn range(&self, axis: Axis) -> &Range<i64> {
        match axis {
            Axis::I => &self.di,
            Axis::J => &self.dj,
        }
    }


    /**
     * Determine whether this index space contains the given index.
     */
    pub fn contains(&self, index: (i64, i64)) -> bool {
        self.di.contains(&index.0) && self.dj.contains(&index.1)
    }


    /**
     * Determine whether another index space is a subset of this one.
     */
    pub fn contains_space(&self, other: &Self) -> bool {
        other.di.start >= self.di.start && other.di.end <= self.di.end &&
        other.dj.start >= self.dj.start && other.dj.end <= self.dj.end
    }


    /**
     * Return the overlap of this index space with another one, or `None` if
     * they do not overlap. Spaces that only touch along an edge do not
     * overlap.
     */
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let i0 = self.di.start.max(other.di.start);
        let i1 = self.di.end.min(other.di.end);
        let j0 = self.dj.start.max(other.dj.start);
        let j1 = self.dj.end.min(other.dj.end);

        if i0 < i1 && j0 < j1 {
            Some(Self::new(i0..i1, j0..j1))
        } else {
            None
        }
    }


    /**
     * Shift this index space by the given offset on each axis.
     */
    pub fn translate(&self, delta: (i64, i64)) -> Self {
        Self::new(
            self.di.start + delta.0 .. self.di.end + delta.0,
            self.dj.start + delta.1 .. self.dj.end + delta.1)
    }


    /**
     * Expand this index space by the given number of elements on each axis.
     */
    pub fn extend_all(&self, delta: i64) -> Self {
        Self::new(
            self.di.start - delta .. self.di.end + delta,
            self.dj.start - delta .. self.dj.end + delta)
    }


    /**
     * Return the linear offset for the given index, in a row-major memory
     * buffer aligned with the start of this index space.
     */
    pub fn row_major_offset(&self, index: (i64, i64)) -> usize {
        let i = (index.0 - self.di.start) as usize;
        let j = (index.1 - self.dj.start) as usize;
        let m = (self.dj.end - self.dj.start) as usize;
        i * m + j
    }


    /**
     * Return a memory region object corresponding to the selection of this
     * index space in the buffer allocated for another one. The caller is
     * responsible for making sure this space is contained in the parent.
     */
    pub fn memory_region_in(&self, parent: &Self) -> MemoryRegion {
        let start = (
            (self.di.start - parent.di.start) as usize,
            (self.dj.start - parent.dj.start) as usize);
        let count = self.dim();
        let shape = parent.dim();
        MemoryRegion { start, count, shape }
    }


    /**
     * Return an iterator which traverses the index space in row-major order
     * (C-like; the final index increases fastest).
     */
    pub fn iter(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.di.clone().flat_map(move |i| self.dj.clone().map(move |j| (i, j)))
    }
}




// ============================================================================
impl fmt::Display for IndexSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{} {}..{}]", self.di.start, self.di.end, self.dj.start, self.dj.end)
    }
}

impl From<(Range<i64>, Range<i64>)> for IndexSpace {
    fn from(range: (Range<i64>, Range<i64>)) -> Self {
        Self::new(range.0, range.1)
    }
}

impl<'a> From<(&'a Range<i64>, &'a Range<i64>)> for IndexSpace {
    fn from(range: (&'a Range<i64>, &'a Range<i64>)) -> Self {
        Self::new(range.0.clone(), range.1.clone())
    }
}

impl From<IndexSpace> for (Range<i64>, Range<i64>) {
    fn from(space: IndexSpace) -> Self {
        (space.di, space.dj)
    }
}




/**
 * Less imposing factory function to construct an IndexSpace object.
 */
pub fn range2d(di: Range<i64>, dj: Range<i64>) -> IndexSpace {
    IndexSpace::new(di, dj)
}




/**
 * A 2D memory region within a contiguous buffer.
 */
#[derive(Clone, Debug)]
pub struct MemoryRegion {
    start: (usize, usize),
    count: (usize, usize),
    shape: (usize, usize),
}




// ============================================================================
impl MemoryRegion {

    /// Return the number of values selected by this region, given the number
    /// of values stored per index.
    pub fn len(&self, chunk: usize) -> usize {
        self.count.0 * self.count.1 * chunk
    }

    pub fn is_empty(&self) -> bool {
        self.count.0 * self.count.1 == 0
    }

    pub fn iter_slice<'a, T>(&'a self, slice: &'a [T], chunk: usize) -> impl Iterator<Item = &'a [T]> {
        let start = &self.start;
        let shape = &self.shape;
        let count = &self.count;
        let r = chunk;
        let q = shape.1 * r;

        assert!(slice.len() == shape.0 * shape.1 * chunk);

        slice[start.0 * q .. (start.0 + count.0) * q]
        .chunks_exact(q).flat_map(move |j| j[start.1 * r .. (start.1 + count.1) * r]
        .chunks_exact(r))
    }

    pub fn iter_slice_mut<'a, T>(&'a self, slice: &'a mut [T], chunk: usize) -> impl Iterator<Item = &'a mut [T]> {
        let start = &self.start;
        let shape = &self.shape;
        let count = &self.count;
        let r = chunk;
        let q = shape.1 * r;

        assert!(slice.len() == shape.0 * shape.1 * chunk);

        slice[start.0 * q .. (start.0 + count.0) * q]
        .chunks_exact_mut(q).flat_map(move |j| j[start.1 * r .. (start.1 + count.1) * r]
        .chunks_exact_mut(r))
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn intersection_of_overlapping_spaces_works() {
        let a = range2d(0..10, 0..10);
        let b = range2d(5..15, -5..3);
        assert_eq!(a.intersect(&b), Some(range2d(5..10, 0..3)));
        assert_eq!(b.intersect(&a), Some(range2d(5..10, 0..3)));
    }

    #[test]
    fn spaces_touching_at_an_edge_do_not_intersect() {
        let a = range2d(0..4, 0..4);
        let b = range2d(4..8, 0..4);
        assert_eq!(a.intersect(&b), None);
    }

    #[test]
    fn translation_preserves_shape() {
        let a = range2d(0..4, 2..8).translate((-8, 3));
        assert_eq!(a, range2d(-8..-4, 5..11));
        assert_eq!(a.dim(), (4, 6));
    }

    #[test]
    fn extension_grows_every_side() {
        let a = range2d(0..4, 0..4);
        assert_eq!(a.extend_all(2), range2d(-2..6, -2..6));
        assert_eq!(a.extend_all(1).len(), 36);
        assert_eq!(a.range(Axis::J), &(0..4));
    }

    #[test]
    fn iteration_is_row_major() {
        let a = range2d(1..3, 5..7);
        let indexes: Vec<_> = a.iter().collect();
        assert_eq!(indexes, vec![(1, 5), (1, 6), (2, 5), (2, 6)]);
        assert_eq!(a.row_major_offset((2, 5)), 2);
    }

    #[test]
    fn memory_region_selects_sub_rectangle() {
        let parent = range2d(0..4, 0..3);
        let data: Vec<_> = parent.iter().flat_map(|(i, j)| vec![(i * 10 + j) as f64, -1.0]).collect();
        let region = range2d(1..3, 1..3).memory_region_in(&parent);
        let selected: Vec<_> = region.iter_slice(&data, 2).map(|s| s[0]).collect();
        assert_eq!(selected, vec![11.0, 12.0, 21.0, 22.0]);
        assert_eq!(region.len(2), 8);
    }
}
