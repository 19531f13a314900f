//! OperatorWrapper: lift a single-lane operator into a multi-lane one.
//!
//! The wrapper instantiates one inner copy of the wrapped operator per
//! lane and mirrors the inner slot interface one level up: a level-N
//! inner slot appears as a level-(N+1) slot on the wrapper, with subslot
//! `i` wired to lane `i`'s inner slot. Inputs named in `broadcast` stay
//! at their original level and are shared by every lane - each lane's
//! inner slot connects to the same outer slot, so one `set_value` (or
//! one upstream connection) feeds all lanes.
//!
//! Per-lane isolation falls out of the wiring: data and dirt flow only
//! along slot connections, and lanes share no connections except the
//! broadcast inputs.

use std::sync::{Arc, Mutex};

use log::debug;

use crate::error::GraphError;
use crate::graph::Graph;
use crate::operator::{OpCore, Operator, attach};
use crate::roi::Roi;
use crate::slot::{Slot, SlotDef};
use crate::value::NdValue;

type OpFactory = Arc<dyn Fn(&Graph) -> Arc<dyn Operator> + Send + Sync>;

/// Multi-lane adapter around an operator factory.
pub struct OperatorWrapper {
    core: OpCore,
    factory: OpFactory,
    broadcast: Vec<String>,
    lanes: Mutex<Vec<Arc<dyn Operator>>>,
}

impl OperatorWrapper {
    /// Wrap the operators produced by `factory`. One probe instance is
    /// created (and immediately cleaned up) to learn the slot interface.
    /// `broadcast` names the inputs shared across lanes; every other
    /// input, and every output, is promoted one level.
    pub fn new<F>(name: &str, graph: &Graph, factory: F, broadcast: &[&str]) -> Arc<Self>
    where
        F: Fn(&Graph) -> Arc<dyn Operator> + Send + Sync + 'static,
    {
        let probe = factory(graph);
        let mut builder = OpCore::builder(name, graph);
        for slot in probe.core().inputs() {
            let promoted = !broadcast.contains(&slot.name());
            let mut def = slot_def_of(slot);
            if promoted {
                def = def.level(slot.level() + 1);
            }
            builder = builder.input(def);
        }
        for slot in probe.core().outputs() {
            let def = slot_def_of(slot).level(slot.level() + 1);
            builder = builder.output(def);
        }
        probe.clean_up();

        attach(Arc::new(Self {
            core: builder.build(),
            factory: Arc::new(factory),
            broadcast: broadcast.iter().map(|s| s.to_string()).collect(),
            lanes: Mutex::new(Vec::new()),
        }))
    }

    fn is_broadcast(&self, name: &str) -> bool {
        self.broadcast.iter().any(|b| b == name)
    }

    /// Number of lanes currently wired.
    pub fn num_lanes(&self) -> usize {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// The inner operator backing lane `index`.
    pub fn lane(&self, index: usize) -> Result<Arc<dyn Operator>, GraphError> {
        self.lanes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(index)
            .cloned()
            .ok_or_else(|| GraphError::Execution(format!(
                "wrapper '{}' has no lane {} ({} lanes)",
                self.core.name(),
                index,
                self.num_lanes()
            )))
    }

    /// Append a lane. `index` must equal [`OperatorWrapper::num_lanes`];
    /// lanes grow at the end only.
    pub fn add_lane(&self, index: usize) -> Result<Arc<dyn Operator>, GraphError> {
        assert_eq!(
            index,
            self.num_lanes(),
            "lanes are appended, not inserted"
        );
        debug!("Adding lane {} to wrapper '{}'", index, self.core.name());
        let inner = (self.factory)(self.core.graph());

        for outer in self.core.inputs() {
            let inner_slot = inner.core().input(outer.name());
            if self.is_broadcast(outer.name()) {
                inner_slot.connect(outer)?;
            } else {
                outer.resize(index + 1)?;
                inner_slot.connect(&outer.subslot(index)?)?;
            }
        }
        for outer in self.core.outputs() {
            outer.resize(index + 1)?;
            outer
                .subslot(index)?
                .connect(inner.core().output(outer.name()))?;
        }

        self.lanes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&inner));
        Ok(inner)
    }

    /// Remove lane `index`, shifting later lanes down. The inner
    /// operator is cleaned up after its slots are unwired.
    pub fn remove_lane(&self, index: usize) -> Result<(), GraphError> {
        let inner = {
            let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
            if index >= lanes.len() {
                return Err(GraphError::Execution(format!(
                    "wrapper '{}' has no lane {} ({} lanes)",
                    self.core.name(),
                    index,
                    lanes.len()
                )));
            }
            lanes.remove(index)
        };
        debug!("Removing lane {} from wrapper '{}'", index, self.core.name());
        let final_len = self.num_lanes();

        // Outputs first so consumers go unready before the lane dies.
        for outer in self.core.outputs() {
            outer.remove_slot(index, final_len)?;
        }
        for outer in self.core.inputs() {
            if !self.is_broadcast(outer.name()) {
                outer.remove_slot(index, final_len)?;
            }
        }
        inner.clean_up();
        Ok(())
    }
}

impl Operator for OperatorWrapper {
    fn core(&self) -> &OpCore {
        &self.core
    }

    // Output subslots are connected straight to the inner operators'
    // outputs; the wrapper itself never computes or assigns meta.
    fn setup_outputs(&self) -> Result<(), GraphError> {
        Ok(())
    }

    fn execute(
        &self,
        slot: &Arc<Slot>,
        _subindex: &[usize],
        _roi: &Roi,
        _result: &mut NdValue,
    ) -> Result<(), GraphError> {
        Err(GraphError::Execution(format!(
            "wrapper slot '{}' computes through its lanes, not execute()",
            slot.name()
        )))
    }

    fn propagate_dirty(&self, _slot: &Arc<Slot>, _subindex: &[usize], _roi: &Roi) {
        // Dirt travels along the per-lane slot connections.
    }

    // Lanes may be empty; the wrapper is always "configured" so its
    // promoted multislots are never force-unreadied by reconfiguration.
    fn configured(&self) -> bool {
        true
    }

    fn clean_up(&self) {
        let lanes: Vec<Arc<dyn Operator>> = std::mem::take(
            &mut *self.lanes.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for lane in lanes {
            lane.clean_up();
        }
        self.core.clean_up();
    }
}

impl std::fmt::Debug for OperatorWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorWrapper")
            .field("name", &self.core.name())
            .field("lanes", &self.num_lanes())
            .field("broadcast", &self.broadcast)
            .finish()
    }
}

fn slot_def_of(slot: &Arc<Slot>) -> SlotDef {
    let mut def = match slot.stype() {
        crate::slot::Stype::Array => SlotDef::array(slot.name()),
        crate::slot::Stype::Value => SlotDef::value(slot.name()),
    };
    def = def.level(slot.level());
    if slot.is_optional() {
        def = def.optional();
    }
    def
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::SlotMeta;
    use crate::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Multiplies its input by a broadcastable factor.
    struct OpScale {
        core: OpCore,
    }

    impl Operator for OpScale {
        fn core(&self) -> &OpCore {
            &self.core
        }

        fn setup_outputs(&self) -> Result<(), GraphError> {
            let meta = self.core.input("Input").meta();
            self.core.output("Output").set_meta(SlotMeta {
                ready: false,
                ..meta
            });
            Ok(())
        }

        fn execute(
            &self,
            _slot: &Arc<Slot>,
            _subindex: &[usize],
            roi: &Roi,
            result: &mut NdValue,
        ) -> Result<(), GraphError> {
            let factor = self
                .core
                .input("Factor")
                .value()?
                .get_float()
                .ok_or_else(|| GraphError::Execution("Factor must be a float".into()))?;
            let input = self.core.input("Input").request(roi.clone()).wait()?;
            let arr = input
                .as_array()
                .ok_or_else(|| GraphError::Execution("Input must be an array".into()))?;
            *result = arr.map_f64(|x| x * factor);
            Ok(())
        }

        fn propagate_dirty(&self, _slot: &Arc<Slot>, _subindex: &[usize], roi: &Roi) {
            self.core.output("Output").set_dirty(roi);
        }
    }

    fn make_scale(graph: &Graph) -> Arc<dyn Operator> {
        let core = OpCore::builder("OpScale", graph)
            .input(SlotDef::array("Input"))
            .input(SlotDef::value("Factor"))
            .output(SlotDef::array("Output"))
            .build();
        let op: Arc<OpScale> = attach(Arc::new(OpScale { core }));
        op
    }

    fn ramp(shape: &[usize], offset: f32) -> NdValue {
        let n: usize = shape.iter().product();
        let data: Vec<f32> = (0..n).map(|i| i as f32 + offset).collect();
        ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(shape), data)
            .unwrap()
            .into()
    }

    fn scale_wrapper(graph: &Graph) -> Arc<OperatorWrapper> {
        OperatorWrapper::new("WrappedScale", graph, make_scale, &["Factor"])
    }

    #[test]
    fn test_interface_promotion() {
        let graph = Graph::for_testing();
        let wrapper = scale_wrapper(&graph);
        assert_eq!(wrapper.core().input("Input").level(), 1);
        assert_eq!(wrapper.core().input("Factor").level(), 0);
        assert_eq!(wrapper.core().output("Output").level(), 1);
        assert_eq!(wrapper.num_lanes(), 0);
    }

    #[test]
    fn test_lanes_are_isolated() {
        let graph = Graph::for_testing();
        let wrapper = scale_wrapper(&graph);
        wrapper.core().input("Factor").set_value(2.0f64).unwrap();
        wrapper.add_lane(0).unwrap();
        wrapper.add_lane(1).unwrap();

        let input = wrapper.core().input("Input");
        input.subslot(0).unwrap().set_value(ramp(&[2, 2], 0.0)).unwrap();
        input.subslot(1).unwrap().set_value(ramp(&[3, 3], 100.0)).unwrap();

        let output = wrapper.core().output("Output");
        let lane0 = output.subslot(0).unwrap().value().unwrap();
        let lane1 = output.subslot(1).unwrap().value().unwrap();
        assert_eq!(lane0.as_array().unwrap().shape(), &[2, 2]);
        assert_eq!(lane1.as_array().unwrap().shape(), &[3, 3]);
        assert_eq!(lane0.as_array().unwrap().as_f32().unwrap()[[0, 1]], 2.0);
        assert_eq!(lane1.as_array().unwrap().as_f32().unwrap()[[0, 0]], 200.0);

        // Dirtying one lane's input leaves the other lane untouched.
        let hits0 = Arc::new(AtomicUsize::new(0));
        let hits1 = Arc::new(AtomicUsize::new(0));
        let h0 = Arc::clone(&hits0);
        let _s0 = output.subslot(0).unwrap().notify_dirty(move |_| {
            h0.fetch_add(1, Ordering::SeqCst);
        });
        let h1 = Arc::clone(&hits1);
        let _s1 = output.subslot(1).unwrap().notify_dirty(move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        });

        input
            .subslot(0)
            .unwrap()
            .set_dirty(&Roi::from_ranges([0..1, 0..1]));
        assert_eq!(hits0.load(Ordering::SeqCst), 1);
        assert_eq!(hits1.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_broadcast_input_feeds_all_lanes() {
        let graph = Graph::for_testing();
        let wrapper = scale_wrapper(&graph);
        wrapper.add_lane(0).unwrap();
        wrapper.add_lane(1).unwrap();
        wrapper.core().input("Factor").set_value(3.0f64).unwrap();

        for lane in 0..2 {
            let inner = wrapper.lane(lane).unwrap();
            assert_eq!(
                inner.core().input("Factor").value().unwrap(),
                Value::Float(3.0)
            );
        }
    }

    #[test]
    fn test_remove_lane_shifts_and_cleans() {
        let graph = Graph::for_testing();
        let wrapper = scale_wrapper(&graph);
        wrapper.core().input("Factor").set_value(1.0f64).unwrap();
        wrapper.add_lane(0).unwrap();
        wrapper.add_lane(1).unwrap();

        let input = wrapper.core().input("Input");
        input.subslot(0).unwrap().set_value(ramp(&[2, 2], 0.0)).unwrap();
        input.subslot(1).unwrap().set_value(ramp(&[3, 3], 0.0)).unwrap();

        let survivor = wrapper.lane(1).unwrap();
        wrapper.remove_lane(0).unwrap();
        assert_eq!(wrapper.num_lanes(), 1);
        assert_eq!(wrapper.core().input("Input").len(), 1);
        assert_eq!(wrapper.core().output("Output").len(), 1);
        assert!(Arc::ptr_eq(&wrapper.lane(0).unwrap(), &survivor));

        // The surviving lane kept its data (formerly lane 1).
        let out = wrapper
            .core()
            .output("Output")
            .subslot(0)
            .unwrap()
            .value()
            .unwrap();
        assert_eq!(out.as_array().unwrap().shape(), &[3, 3]);
    }

    #[test]
    fn test_adding_lane_before_broadcast_value() {
        // Lane wiring must not require broadcast inputs to be ready yet.
        let graph = Graph::for_testing();
        let wrapper = scale_wrapper(&graph);
        wrapper.add_lane(0).unwrap();
        assert!(!wrapper.core().output("Output").ready());
        wrapper.core().input("Factor").set_value(2.0f64).unwrap();
        wrapper
            .core()
            .input("Input")
            .subslot(0)
            .unwrap()
            .set_value(ramp(&[2, 2], 0.0))
            .unwrap();
        assert!(wrapper.core().output("Output").ready());
    }
}
