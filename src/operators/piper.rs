//! Pass-through operator.

use std::sync::Arc;

use crate::error::GraphError;
use crate::graph::Graph;
use crate::operator::{OpCore, Operator, attach};
use crate::roi::Roi;
use crate::slot::{Slot, SlotDef};
use crate::value::NdValue;

/// Forwards its input unchanged. Useful as a stable connection point in
/// front of interchangeable upstream sources: consumers stay connected
/// to the piper while the input side is rewired.
pub struct OpArrayPiper {
    core: OpCore,
}

impl OpArrayPiper {
    pub fn new(graph: &Graph) -> Arc<Self> {
        let core = OpCore::builder("OpArrayPiper", graph)
            .input(SlotDef::array("Input"))
            .output(SlotDef::array("Output"))
            .build();
        attach(Arc::new(Self { core }))
    }

    pub fn input(&self) -> &Arc<Slot> {
        self.core.input("Input")
    }

    pub fn output(&self) -> &Arc<Slot> {
        self.core.output("Output")
    }
}

impl Operator for OpArrayPiper {
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
            GraphError::Execution("piper input resolved to a non-array value".to_string())
        })?;
        *result = arr.clone();
        Ok(())
    }

    fn propagate_dirty(&self, _slot: &Arc<Slot>, _subindex: &[usize], roi: &Roi) {
        self.output().set_dirty(roi);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Dtype;

    fn ramp(shape: &[usize]) -> NdValue {
        let n: usize = shape.iter().product();
        let data: Vec<f32> = (0..n).map(|i| i as f32).collect();
        ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(shape), data)
            .unwrap()
            .into()
    }

    #[test]
    fn test_forwards_data_and_meta() {
        let graph = Graph::for_testing();
        let op = OpArrayPiper::new(&graph);
        op.input().set_value(ramp(&[4, 5])).unwrap();

        assert!(op.output().ready());
        assert_eq!(op.output().meta().shape, Some(vec![4, 5]));
        assert_eq!(op.output().meta().dtype, Some(Dtype::F32));

        let roi = Roi::from_ranges([1..3, 0..2]);
        let out = op.output().request(roi.clone()).wait().unwrap();
        let expected = ramp(&[4, 5]).slice(&roi).unwrap();
        assert_eq!(*out.as_array().unwrap(), expected);
    }

    #[test]
    fn test_unready_until_connected() {
        let graph = Graph::for_testing();
        let op = OpArrayPiper::new(&graph);
        assert!(!op.output().ready());
        let err = op.output().request_all().wait().unwrap_err();
        assert!(err.is_not_ready());
    }
}
