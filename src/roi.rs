//! Region-of-interest: the axis-aligned N-d box that is the unit of lazy
//! computation.
//!
//! A `Roi` is a transient, immutable value: one `start..stop` pair per axis
//! of the slot's declared shape. Requests, dirty notifications, and
//! `execute()` calls all address data through it.

use std::fmt;
use std::ops::Range;

/// Axis-aligned sub-region of an N-dimensional shape.
///
/// Invariant: `start.len() == stop.len()` and `start[i] <= stop[i]` on
/// every axis. Bounds against a concrete shape are checked separately via
/// [`Roi::validate_within`], because a roi is often built before the slot
/// it targets is ready.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Roi {
    start: Vec<usize>,
    stop: Vec<usize>,
}

impl Roi {
    /// Build a roi from per-axis start/stop vectors.
    ///
    /// Panics if the vectors disagree in length or any axis is inverted  - 
    /// both are construction-site programming errors, not data errors.
    pub fn new(start: Vec<usize>, stop: Vec<usize>) -> Self {
        assert_eq!(
            start.len(),
            stop.len(),
            "roi start/stop must have the same number of axes"
        );
        for (axis, (&a, &b)) in start.iter().zip(stop.iter()).enumerate() {
            assert!(a <= b, "roi axis {} is inverted: {}..{}", axis, a, b);
        }
        Self { start, stop }
    }

    /// Roi covering an entire shape (the `[:]` of the slicing world).
    pub fn full(shape: &[usize]) -> Self {
        Self {
            start: vec![0; shape.len()],
            stop: shape.to_vec(),
        }
    }

    /// Build from per-axis ranges: `Roi::from_ranges([0..5, 2..4])`.
    pub fn from_ranges<I>(ranges: I) -> Self
    where
        I: IntoIterator<Item = Range<usize>>,
    {
        let (start, stop) = ranges.into_iter().map(|r| (r.start, r.end)).unzip();
        Self::new(start, stop)
    }

    /// Zero-dimensional roi, used for scalar/value slots where region
    /// addressing makes no sense.
    pub fn point() -> Self {
        Self {
            start: Vec::new(),
            stop: Vec::new(),
        }
    }

    pub fn start(&self) -> &[usize] {
        &self.start
    }

    pub fn stop(&self) -> &[usize] {
        &self.stop
    }

    /// Number of axes.
    pub fn ndim(&self) -> usize {
        self.start.len()
    }

    /// Per-axis extent (`stop - start`).
    pub fn shape(&self) -> Vec<usize> {
        self.start
            .iter()
            .zip(&self.stop)
            .map(|(a, b)| b - a)
            .collect()
    }

    /// Total number of addressed elements.
    pub fn num_elements(&self) -> usize {
        self.shape().iter().product()
    }

    /// True if any axis has zero extent.
    pub fn is_empty(&self) -> bool {
        self.start.iter().zip(&self.stop).any(|(a, b)| a == b)
    }

    /// Per-axis range iterator (for ndarray slicing).
    pub fn ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.start
            .iter()
            .zip(&self.stop)
            .map(|(&a, &b)| a..b)
    }

    /// True if `other` lies fully inside `self`.
    pub fn contains(&self, other: &Roi) -> bool {
        self.ndim() == other.ndim()
            && self
                .start
                .iter()
                .zip(&other.start)
                .all(|(outer, inner)| outer <= inner)
            && self
                .stop
                .iter()
                .zip(&other.stop)
                .all(|(outer, inner)| outer >= inner)
    }

    /// Overlapping region of two rois, or `None` if they are disjoint on
    /// some axis (zero-extent overlap counts as disjoint).
    pub fn intersection(&self, other: &Roi) -> Option<Roi> {
        if self.ndim() != other.ndim() {
            return None;
        }
        let mut start = Vec::with_capacity(self.ndim());
        let mut stop = Vec::with_capacity(self.ndim());
        for i in 0..self.ndim() {
            let a = self.start[i].max(other.start[i]);
            let b = self.stop[i].min(other.stop[i]);
            if a >= b {
                return None;
            }
            start.push(a);
            stop.push(b);
        }
        Some(Roi { start, stop })
    }

    /// Shift the roi by `offset` along every axis. The inverse of
    /// [`Roi::relative_to_self`] for a containing roi starting at `offset`.
    pub fn offset_by(&self, offset: &[usize]) -> Roi {
        debug_assert_eq!(offset.len(), self.ndim());
        Roi {
            start: self.start.iter().zip(offset).map(|(s, o)| s + o).collect(),
            stop: self.stop.iter().zip(offset).map(|(s, o)| s + o).collect(),
        }
    }

    /// Express `inner` relative to `self.start` (for indexing into a
    /// buffer that was allocated for `self`).
    ///
    /// Caller must ensure `self.contains(inner)`.
    pub fn relative_to_self(&self, inner: &Roi) -> Roi {
        debug_assert!(self.contains(inner));
        Roi {
            start: inner
                .start
                .iter()
                .zip(&self.start)
                .map(|(i, o)| i - o)
                .collect(),
            stop: inner
                .stop
                .iter()
                .zip(&self.start)
                .map(|(i, o)| i - o)
                .collect(),
        }
    }

    /// Check the roi against a concrete shape: axis count must match and
    /// every `stop` must stay within bounds.
    pub fn validate_within(&self, shape: &[usize]) -> Result<(), (Roi, Vec<usize>)> {
        let in_bounds = self.ndim() == shape.len()
            && self.stop.iter().zip(shape).all(|(s, dim)| s <= dim);
        if in_bounds {
            Ok(())
        } else {
            Err((self.clone(), shape.to_vec()))
        }
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for i in 0..self.ndim() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}..{}", self.start[i], self.stop[i])?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_and_elements() {
        let roi = Roi::from_ranges([2..5, 0..4]);
        assert_eq!(roi.shape(), vec![3, 4]);
        assert_eq!(roi.num_elements(), 12);
        assert!(!roi.is_empty());
    }

    #[test]
    fn test_full_covers_shape() {
        let roi = Roi::full(&[7, 3]);
        assert_eq!(roi.start(), &[0, 0]);
        assert_eq!(roi.stop(), &[7, 3]);
        assert!(roi.validate_within(&[7, 3]).is_ok());
        assert!(roi.validate_within(&[6, 3]).is_err());
    }

    #[test]
    fn test_containment() {
        let outer = Roi::from_ranges([0..10, 0..10]);
        let inner = Roi::from_ranges([2..5, 3..9]);
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        // Differing ndim never contains
        assert!(!outer.contains(&Roi::from_ranges([2..5])));
    }

    #[test]
    fn test_intersection() {
        let a = Roi::from_ranges([0..5, 0..5]);
        let b = Roi::from_ranges([3..8, 4..9]);
        assert_eq!(a.intersection(&b), Some(Roi::from_ranges([3..5, 4..5])));

        // Disjoint on the second axis
        let c = Roi::from_ranges([3..8, 5..9]);
        assert_eq!(a.intersection(&c), None);
    }

    #[test]
    fn test_relative_offset() {
        let block = Roi::from_ranges([10..20, 10..20]);
        let sub = Roi::from_ranges([12..15, 10..11]);
        let relative = block.relative_to_self(&sub);
        assert_eq!(relative, Roi::from_ranges([2..5, 0..1]));
        // offset_by reverses the translation
        assert_eq!(relative.offset_by(block.start()), sub);
    }

    #[test]
    #[should_panic]
    fn test_inverted_axis_panics() {
        let _ = Roi::new(vec![5], vec![2]);
    }
}
