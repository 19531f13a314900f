//! Operator: one stateful node of the computation graph.
//!
//! An operator owns a fixed, statically declared set of slots, registered
//! by name in an [`OpCore`] at construction time (an explicit registry  - 
//! consumers look slots up by name or hold the `Arc<Slot>` directly).
//!
//! Contract for implementors:
//! - `setup_outputs()` assigns meta (shape/dtype/axistags) to every output
//!   slot. It runs whenever a relevant input becomes ready or changes
//!   meta, so it must be idempotent and side-effect-light.
//! - `execute()` fills the caller-provided buffer with exactly the
//!   requested roi's worth of data. It may be called concurrently for
//!   different rois; shared operator state needs its own lock.
//! - `propagate_dirty()` translates a changed input region into dirty
//!   regions on the operator's own outputs.
//!
//! Operators nest: children registered on a parent are cleaned up
//! transitively when the parent is.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use log::{debug, error};
use uuid::Uuid;

use crate::error::GraphError;
use crate::graph::Graph;
use crate::roi::Roi;
use crate::slot::{Slot, SlotDef, SlotRole};
use crate::value::NdValue;

/// Base interface of every graph node.
pub trait Operator: Send + Sync {
    /// The slot registry and identity shared by all operators.
    fn core(&self) -> &OpCore;

    /// Assign meta to every output slot this operator can currently
    /// produce. Must be idempotent.
    fn setup_outputs(&self) -> Result<(), GraphError>;

    /// Fill `result` (pre-allocated to `roi`'s shape and the output's
    /// dtype) with the data of `slot` at `roi`. `subindex` addresses the
    /// subslot when `slot` belongs to a multislot output.
    fn execute(
        &self,
        slot: &Arc<Slot>,
        subindex: &[usize],
        roi: &Roi,
        result: &mut NdValue,
    ) -> Result<(), GraphError>;

    /// Translate "input `slot` changed within `roi`" into `set_dirty`
    /// calls on the affected outputs.
    fn propagate_dirty(&self, slot: &Arc<Slot>, subindex: &[usize], roi: &Roi);

    /// True when every required (non-optional) input slot is ready.
    fn configured(&self) -> bool {
        self.core().inputs_configured()
    }

    /// Tear down: sever all slot connections, clean up owned children.
    /// Call exactly once per operator not owned by another operator.
    fn clean_up(&self) {
        self.core().clean_up();
    }
}

/// Identity, slot registry, and ownership bookkeeping embedded in every
/// operator.
pub struct OpCore {
    id: Uuid,
    name: String,
    graph: Graph,
    inputs: IndexMap<String, Arc<Slot>>,
    outputs: IndexMap<String, Arc<Slot>>,
    children: Mutex<Vec<Arc<dyn Operator>>>,
    cleaned: AtomicBool,
}

impl OpCore {
    /// Start declaring an operator's slots.
    pub fn builder(name: &str, graph: &Graph) -> OpCoreBuilder {
        OpCoreBuilder {
            name: name.to_string(),
            graph: graph.clone(),
            inputs: IndexMap::new(),
            outputs: IndexMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Input slot by name. Panics on a name that was never declared  - 
    /// that is a construction-site typo, not a runtime condition.
    pub fn input(&self, name: &str) -> &Arc<Slot> {
        self.inputs
            .get(name)
            .unwrap_or_else(|| panic!("operator '{}' has no input slot '{}'", self.name, name))
    }

    /// Output slot by name (same panic policy as [`OpCore::input`]).
    pub fn output(&self, name: &str) -> &Arc<Slot> {
        self.outputs
            .get(name)
            .unwrap_or_else(|| panic!("operator '{}' has no output slot '{}'", self.name, name))
    }

    pub fn inputs(&self) -> impl Iterator<Item = &Arc<Slot>> {
        self.inputs.values()
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Arc<Slot>> {
        self.outputs.values()
    }

    /// All required inputs ready?
    pub fn inputs_configured(&self) -> bool {
        self.inputs
            .values()
            .all(|s| s.is_optional() || s.ready())
    }

    /// Adopt `child`: it will be cleaned up when this operator is.
    pub fn add_child(&self, child: Arc<dyn Operator>) {
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(child);
    }

    pub fn cleaned_up(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }

    /// Clear readiness of every output (operator lost its configuration).
    pub(crate) fn unconfigure_outputs(&self) {
        for out in self.outputs.values() {
            out.mark_unconfigured();
        }
    }

    pub(crate) fn clean_up(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            debug!("Operator '{}' cleaned up twice; ignoring", self.name);
            return;
        }
        debug!("Cleaning up operator '{}' ({})", self.name, self.id);

        let children: Vec<Arc<dyn Operator>> = std::mem::take(
            &mut *self.children.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for child in children {
            child.clean_up();
        }

        // Outputs first so downstream consumers go unready before their
        // upstream disappears.
        for slot in self.outputs.values() {
            slot.sever();
        }
        for slot in self.inputs.values() {
            slot.sever();
        }
    }
}

impl std::fmt::Debug for OpCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpCore")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Declarative slot registration, one call per slot.
pub struct OpCoreBuilder {
    name: String,
    graph: Graph,
    inputs: IndexMap<String, Arc<Slot>>,
    outputs: IndexMap<String, Arc<Slot>>,
}

impl OpCoreBuilder {
    pub fn input(mut self, def: SlotDef) -> Self {
        let slot = Slot::new(def, SlotRole::Input);
        self.inputs.insert(slot.name().to_string(), slot);
        self
    }

    pub fn output(mut self, def: SlotDef) -> Self {
        let slot = Slot::new(def, SlotRole::Output);
        self.outputs.insert(slot.name().to_string(), slot);
        self
    }

    pub fn build(self) -> OpCore {
        self.graph.note_operator_created();
        OpCore {
            id: Uuid::new_v4(),
            name: self.name,
            graph: self.graph,
            inputs: self.inputs,
            outputs: self.outputs,
            children: Mutex::new(Vec::new()),
            cleaned: AtomicBool::new(false),
        }
    }
}

/// Wire an operator's slots back to the operator itself. Every concrete
/// operator constructor ends with this:
///
/// ```ignore
/// let op = Arc::new(OpPointwise { core, f });
/// attach(op)
/// ```
pub fn attach<T: Operator + 'static>(op: Arc<T>) -> Arc<T> {
    let dyn_op: Arc<dyn Operator> = op.clone();
    let weak = Arc::downgrade(&dyn_op);
    for slot in op.core().inputs().chain(op.core().outputs()) {
        slot.attach_operator(weak.clone());
    }
    op
}

/// Re-run an operator's configuration after one of its inputs changed.
///
/// When all required inputs are ready, `setup_outputs()` runs and output
/// readiness follows the meta it assigned; otherwise every output goes
/// unready. A failing `setup_outputs()` leaves the outputs unready and is
/// logged - consumers observe `SlotNotReady`, the recoverable condition.
pub(crate) fn reconfigure(op: &Arc<dyn Operator>) {
    if op.core().cleaned_up() {
        return;
    }
    if op.configured() {
        if let Err(e) = op.setup_outputs() {
            error!(
                "setup_outputs failed for operator '{}': {}",
                op.core().name(),
                e
            );
            op.core().unconfigure_outputs();
        }
    } else {
        op.core().unconfigure_outputs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::Stype;

    struct OpNoop {
        core: OpCore,
    }

    impl Operator for OpNoop {
        fn core(&self) -> &OpCore {
            &self.core
        }
        fn setup_outputs(&self) -> Result<(), GraphError> {
            Ok(())
        }
        fn execute(
            &self,
            _slot: &Arc<Slot>,
            _subindex: &[usize],
            _roi: &Roi,
            _result: &mut NdValue,
        ) -> Result<(), GraphError> {
            Ok(())
        }
        fn propagate_dirty(&self, _slot: &Arc<Slot>, _subindex: &[usize], _roi: &Roi) {}
    }

    fn make_noop(graph: &Graph) -> Arc<OpNoop> {
        let core = OpCore::builder("OpNoop", graph)
            .input(SlotDef::array("Input"))
            .input(SlotDef::value("Sigma").optional())
            .output(SlotDef::array("Output"))
            .build();
        attach(Arc::new(OpNoop { core }))
    }

    #[test]
    fn test_slot_registry() {
        let graph = Graph::for_testing();
        let op = make_noop(&graph);
        assert_eq!(op.core().input("Input").name(), "Input");
        assert_eq!(op.core().output("Output").stype(), Stype::Array);
        assert_eq!(op.core().inputs().count(), 2);
        assert_eq!(op.core().outputs().count(), 1);
    }

    #[test]
    #[should_panic(expected = "no input slot")]
    fn test_unknown_slot_panics() {
        let graph = Graph::for_testing();
        let op = make_noop(&graph);
        let _ = op.core().input("Nope");
    }

    #[test]
    fn test_optional_inputs_ignored_by_configured() {
        let graph = Graph::for_testing();
        let op = make_noop(&graph);
        // Sigma is optional: only Input gates configuration
        assert!(!op.configured());
        op.core()
            .input("Input")
            .set_value(NdValue::zeros(crate::value::Dtype::U8, &[2, 2]))
            .unwrap();
        assert!(op.configured());
    }

    #[test]
    fn test_clean_up_is_idempotent_and_recursive() {
        let graph = Graph::for_testing();
        let parent = make_noop(&graph);
        let child = make_noop(&graph);
        parent.core().add_child(child.clone());

        parent.clean_up();
        assert!(parent.core().cleaned_up());
        assert!(child.core().cleaned_up());
        // Second call is a no-op
        parent.clean_up();
    }

    #[test]
    fn test_slots_know_their_operator() {
        let graph = Graph::for_testing();
        let op = make_noop(&graph);
        let owner = op.core().input("Input").operator().unwrap();
        assert_eq!(owner.core().id(), op.core().id());
    }
}
