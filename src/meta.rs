//! Side-channel metadata travelling alongside slot data.
//!
//! Metadata is assigned by an operator's `setup_outputs()` and copied  - 
//! never shared - across connections, so a downstream slot keeps a
//! consistent snapshot even while its upstream reconfigures.

use crate::roi::Roi;
use crate::value::Dtype;

/// Shape/dtype/axis metadata of a slot.
///
/// `ready` is the readiness latch: a level-0 slot is ready exactly when its
/// meta is. For array slots `shape` and `dtype` must be set before the
/// first `execute()` against the slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlotMeta {
    /// Full extent of the slot's data, one entry per axis.
    pub shape: Option<Vec<usize>>,
    /// Element type of the slot's data.
    pub dtype: Option<Dtype>,
    /// One axis key per axis, e.g. "zyx" or "tzyxc".
    pub axistags: Option<String>,
    /// Expected data range, for consumers that normalize for display.
    pub drange: Option<(f64, f64)>,
    /// Readiness latch; flips via slot configuration, not by hand.
    pub(crate) ready: bool,
}

impl SlotMeta {
    /// Meta for an array slot of the given shape and dtype.
    pub fn array(shape: Vec<usize>, dtype: Dtype) -> Self {
        Self {
            shape: Some(shape),
            dtype: Some(dtype),
            axistags: None,
            drange: None,
            ready: false,
        }
    }

    /// Meta for a slot carrying a plain (non-array) value.
    pub fn scalar() -> Self {
        Self::default()
    }

    pub fn with_axistags(mut self, tags: &str) -> Self {
        self.axistags = Some(tags.to_string());
        self
    }

    pub fn with_drange(mut self, lo: f64, hi: f64) -> Self {
        self.drange = Some((lo, hi));
        self
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    pub fn ndim(&self) -> Option<usize> {
        self.shape.as_ref().map(|s| s.len())
    }

    /// Roi spanning the slot's whole shape; zero-dimensional for value
    /// slots (they have no region structure).
    pub fn full_roi(&self) -> Roi {
        match &self.shape {
            Some(shape) => Roi::full(shape),
            None => Roi::point(),
        }
    }

    /// True if two metas describe the same data layout (readiness aside).
    /// Used to decide whether a reconfiguration actually changed anything.
    pub fn same_layout(&self, other: &SlotMeta) -> bool {
        self.shape == other.shape
            && self.dtype == other.dtype
            && self.axistags == other.axistags
            && self.drange == other.drange
    }
}
