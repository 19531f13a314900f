//! Elementwise function application.

use std::sync::Arc;

use crate::error::GraphError;
use crate::graph::Graph;
use crate::operator::{OpCore, Operator, attach};
use crate::roi::Roi;
use crate::slot::{Slot, SlotDef};
use crate::value::NdValue;

type PointwiseFn = Box<dyn Fn(f64) -> f64 + Send + Sync>;

/// Applies a scalar function to every element, preserving shape and
/// dtype. Perfectly roi-local: a requested region needs exactly that
/// region from the input, and input dirt maps to output dirt unchanged.
pub struct OpPointwise {
    core: OpCore,
    f: PointwiseFn,
}

impl OpPointwise {
    pub fn new<F>(graph: &Graph, f: F) -> Arc<Self>
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        let core = OpCore::builder("OpPointwise", graph)
            .input(SlotDef::array("Input"))
            .output(SlotDef::array("Output"))
            .build();
        attach(Arc::new(Self {
            core,
            f: Box::new(f),
        }))
    }

    pub fn input(&self) -> &Arc<Slot> {
        self.core.input("Input")
    }

    pub fn output(&self) -> &Arc<Slot> {
        self.core.output("Output")
    }
}

impl Operator for OpPointwise {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn setup_outputs(&self) -> Result<(), GraphError> {
        self.output().set_meta(self.input().meta());
        Ok(())
    }

    fn execute(
        &self,
        _slot: &Arc<Slot>,
        _subindex: &[usize],
        roi: &Roi,
        result: &mut NdValue,
    ) -> Result<(), GraphError> {
        let value = self.input().request(roi.clone()).wait()?;
        let arr = value.as_array().ok_or_else(|| {
            GraphError::Execution("pointwise input resolved to a non-array value".to_string())
        })?;
        *result = arr.map_f64(&self.f);
        Ok(())
    }

    fn propagate_dirty(&self, _slot: &Arc<Slot>, _subindex: &[usize], roi: &Roi) {
        self.output().set_dirty(roi);
    }
}
