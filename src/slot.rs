//! Slot: typed, observable connection endpoint on an operator.
//!
//! A slot either consumes data (input) or produces it (output). Inputs
//! resolve their value from an upstream partner slot or from a directly
//! assigned value; outputs resolve by running the owning operator's
//! `execute()` for the requested roi.
//!
//! # Levels
//!
//! Level 0 is a single value/array. Level N > 0 is an ordered,
//! insertion-order-significant collection of level-(N-1) subslots  - 
//! how per-lane and per-role fan-out is modeled without special-casing
//! in the engine. Subslots are independently connectable; structural
//! changes (insert/remove) propagate to equal-level partners on both
//! sides and fire `notify_inserted`/`notify_removed` exactly once each.
//!
//! # Dirty protocol
//!
//! `set_dirty(roi)` is eager in signalling, lazy in computation: it
//! notifies local observers, forwards to downstream partners, and asks the
//! owning operator to translate input dirt into output dirt - but nothing
//! recomputes until somebody issues a read.
//!
//! # Concurrency hazard (by contract)
//!
//! `ready()` and a subsequent read are not atomic: in a diamond-shaped
//! graph mid-reconfiguration a read can still fail with `SlotNotReady`.
//! That error is recoverable; callers retry or skip.

use std::sync::{Arc, Mutex, RwLock, Weak};

use log::debug;

use crate::cancel::CancellationToken;
use crate::error::GraphError;
use crate::meta::SlotMeta;
use crate::operator::{Operator, reconfigure};
use crate::request::Request;
use crate::roi::Roi;
use crate::signal::{Signal, Subscription};
use crate::value::{NdValue, Value};

/// Direction of a slot relative to its operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRole {
    Input,
    Output,
}

/// Semantic type of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stype {
    /// Region-addressable N-d array; meta must carry shape and dtype.
    Array,
    /// Single plain value (threshold, filename, flag...); no region
    /// structure, requests always return the whole value.
    Value,
}

/// Declaration of one slot, consumed by the operator builder.
#[derive(Debug, Clone)]
pub struct SlotDef {
    pub(crate) name: String,
    pub(crate) stype: Stype,
    pub(crate) level: usize,
    pub(crate) optional: bool,
}

impl SlotDef {
    pub fn array(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stype: Stype::Array,
            level: 0,
            optional: false,
        }
    }

    pub fn value(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stype: Stype::Value,
            level: 0,
            optional: false,
        }
    }

    /// Lift to a multislot of the given nesting depth.
    pub fn level(mut self, level: usize) -> Self {
        self.level = level;
        self
    }

    /// Exclude this input from the operator's configured() gate.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Dirty notification payload: which slot, which region.
#[derive(Clone)]
pub struct DirtyEvent {
    pub slot: Arc<Slot>,
    pub roi: Roi,
}

/// Structural change payload for multislots.
#[derive(Clone)]
pub struct StructureEvent {
    pub slot: Arc<Slot>,
    pub position: usize,
    pub final_size: usize,
}

type ValueCheck = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

struct SlotState {
    meta: SlotMeta,
    value: Option<Value>,
    partner: Option<Arc<Slot>>,
    downstream: Vec<Weak<Slot>>,
    subslots: Vec<Arc<Slot>>,
}

/// Connection endpoint on an operator. Always handled as `Arc<Slot>`.
pub struct Slot {
    name: String,
    role: SlotRole,
    stype: Stype,
    level: usize,
    optional: bool,
    self_weak: Weak<Slot>,
    operator: RwLock<Option<Weak<dyn Operator>>>,
    parent: RwLock<Option<Weak<Slot>>>,
    state: Mutex<SlotState>,
    value_check: RwLock<Option<ValueCheck>>,
    sig_dirty: Signal<DirtyEvent>,
    sig_ready: Signal<Arc<Slot>>,
    sig_unready: Signal<Arc<Slot>>,
    sig_inserted: Signal<StructureEvent>,
    sig_removed: Signal<StructureEvent>,
}

impl Slot {
    pub(crate) fn new(def: SlotDef, role: SlotRole) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name: def.name,
            role,
            stype: def.stype,
            level: def.level,
            optional: def.optional,
            self_weak: weak.clone(),
            operator: RwLock::new(None),
            parent: RwLock::new(None),
            state: Mutex::new(SlotState {
                meta: SlotMeta::default(),
                value: None,
                partner: None,
                downstream: Vec::new(),
                subslots: Vec::new(),
            }),
            value_check: RwLock::new(None),
            sig_dirty: Signal::new(),
            sig_ready: Signal::new(),
            sig_unready: Signal::new(),
            sig_inserted: Signal::new(),
            sig_removed: Signal::new(),
        })
    }

    /// Level-(N-1) child sharing this slot's name, stype, and operator.
    fn new_child(self: &Arc<Self>) -> Arc<Self> {
        let child = Self::new(
            SlotDef {
                name: self.name.clone(),
                stype: self.stype,
                level: self.level - 1,
                optional: self.optional,
            },
            self.role,
        );
        *child.parent.write().unwrap_or_else(|e| e.into_inner()) =
            Some(Arc::downgrade(self));
        if let Some(op) = self.operator_weak() {
            child.attach_operator(op);
        }
        child
    }

    // ========== Identity ==========

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> SlotRole {
        self.role
    }

    pub fn stype(&self) -> Stype {
        self.stype
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    fn me(&self) -> Arc<Slot> {
        self.self_weak
            .upgrade()
            .expect("slot self-reference always upgradable while the slot is alive")
    }

    /// Owning operator, if attached and still alive.
    pub fn operator(&self) -> Option<Arc<dyn Operator>> {
        self.operator
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|w| w.upgrade())
    }

    fn operator_weak(&self) -> Option<Weak<dyn Operator>> {
        self.operator
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn attach_operator(&self, op: Weak<dyn Operator>) {
        *self.operator.write().unwrap_or_else(|e| e.into_inner()) = Some(op.clone());
        for sub in self.subslots() {
            sub.attach_operator(op.clone());
        }
    }

    /// Parent multislot, when this is a subslot.
    pub fn parent(&self) -> Option<Arc<Slot>> {
        self.parent
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|w| w.upgrade())
    }

    /// Index path from the operator's registered top-level slot down to
    /// this subslot (empty for top-level slots).
    pub fn subindex(&self) -> Vec<usize> {
        let mut indices = Vec::new();
        let mut current = self.me();
        while let Some(parent) = current.parent() {
            if let Some(pos) = parent.position_of(&current) {
                indices.push(pos);
            }
            current = parent;
        }
        indices.reverse();
        indices
    }

    fn position_of(&self, child: &Arc<Slot>) -> Option<usize> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subslots
            .iter()
            .position(|s| Arc::ptr_eq(s, child))
    }

    // ========== State queries ==========

    /// Copy of the slot's current metadata.
    pub fn meta(&self) -> SlotMeta {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .meta
            .clone()
    }

    /// True iff the slot's value is resolvable right now. A multislot is
    /// ready when it is non-empty and all subslots are ready - an empty
    /// multislot is NOT ready (operators tolerating emptiness mark the
    /// slot optional).
    pub fn ready(&self) -> bool {
        if self.level == 0 {
            self.state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .meta
                .ready()
        } else {
            let subs = self.subslots();
            !subs.is_empty() && subs.iter().all(|s| s.ready())
        }
    }

    /// True if connected to a partner or holding a direct value.
    pub fn connected(&self) -> bool {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.partner.is_some() || st.value.is_some()
    }

    /// Upstream partner, if any.
    pub fn partner(&self) -> Option<Arc<Slot>> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .partner
            .clone()
    }

    fn downstream_snapshot(&self) -> Vec<Arc<Slot>> {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.downstream.retain(|w| w.strong_count() > 0);
        st.downstream.iter().filter_map(|w| w.upgrade()).collect()
    }

    // ========== Observation ==========

    /// Observe region invalidation. Delivery order across subscribers is
    /// registration order; across slots it is unspecified.
    #[must_use = "dropping the Subscription unregisters the callback"]
    pub fn notify_dirty<F: Fn(&DirtyEvent) + Send + Sync + 'static>(&self, f: F) -> Subscription {
        self.sig_dirty.subscribe(f)
    }

    #[must_use = "dropping the Subscription unregisters the callback"]
    pub fn notify_ready<F: Fn(&Arc<Slot>) + Send + Sync + 'static>(&self, f: F) -> Subscription {
        self.sig_ready.subscribe(f)
    }

    #[must_use = "dropping the Subscription unregisters the callback"]
    pub fn notify_unready<F: Fn(&Arc<Slot>) + Send + Sync + 'static>(&self, f: F) -> Subscription {
        self.sig_unready.subscribe(f)
    }

    /// Observe subslot insertion (level > 0 only).
    #[must_use = "dropping the Subscription unregisters the callback"]
    pub fn notify_inserted<F: Fn(&StructureEvent) + Send + Sync + 'static>(
        &self,
        f: F,
    ) -> Subscription {
        self.sig_inserted.subscribe(f)
    }

    /// Observe subslot removal (level > 0 only).
    #[must_use = "dropping the Subscription unregisters the callback"]
    pub fn notify_removed<F: Fn(&StructureEvent) + Send + Sync + 'static>(
        &self,
        f: F,
    ) -> Subscription {
        self.sig_removed.subscribe(f)
    }

    // ========== Direct values ==========

    /// Install a validation hook consulted by `set_value`. Rejections
    /// surface as `GraphError::Constraint` to the caller of `set_value`.
    pub fn set_value_check<F>(&self, check: F)
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        *self.value_check.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(check));
    }

    /// Assign a direct value (`check_changed` defaults to true: assigning
    /// an equal value is a silent no-op).
    pub fn set_value(&self, value: impl Into<Value>) -> Result<(), GraphError> {
        self.set_value_opts(value.into(), true)
    }

    /// Assign a direct value with explicit change-detection control.
    pub fn set_value_opts(&self, value: Value, check_changed: bool) -> Result<(), GraphError> {
        if self.stype == Stype::Array && !matches!(value, Value::Array(_)) {
            return Err(GraphError::TypeMismatch {
                slot: self.name.clone(),
                reason: format!("array slot can't hold a {} value", value.kind()),
            });
        }
        let check = self
            .value_check
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(check) = check {
            check(&value).map_err(|message| GraphError::Constraint {
                slot: self.name.clone(),
                message,
            })?;
        }

        let was_ready = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if st.partner.is_some() {
                return Err(GraphError::TypeMismatch {
                    slot: self.name.clone(),
                    reason: "slot is connected to a partner; disconnect first".to_string(),
                });
            }
            if check_changed && st.subslots.is_empty() && st.value.as_ref() == Some(&value) {
                return Ok(());
            }
            let was_ready = st.meta.ready();
            st.meta = meta_for_value(&value);
            st.value = Some(value.clone());
            was_ready
        };

        // Broadcast into existing subslots (multislot set_value).
        for sub in self.subslots() {
            sub.set_value_opts(value.clone(), check_changed)?;
        }

        if !was_ready {
            self.sig_ready.emit(&self.me());
        }
        self.configuration_changed();
        self.set_dirty_all();
        Ok(())
    }

    /// Resolve the slot's full content synchronously.
    ///
    /// Fails with `SlotNotReady` when no value is resolvable - even if a
    /// preceding `ready()` returned true (no atomicity across the two
    /// calls; see module docs).
    pub fn value(&self) -> Result<Value, GraphError> {
        let direct = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .value
            .clone();
        if let Some(v) = direct {
            return Ok(v);
        }
        self.request_all().wait()
    }

    // ========== Wiring ==========

    /// Mirror this slot's value from `partner`, subscribing to its
    /// dirty/ready/unready propagation.
    ///
    /// Base contract: levels and stypes must match exactly; no implicit
    /// adapter operators are created.
    pub fn connect(&self, partner: &Arc<Slot>) -> Result<(), GraphError> {
        if let Some(current) = self.partner() {
            if Arc::ptr_eq(&current, partner) {
                return Ok(());
            }
        }
        if self.level != partner.level {
            return Err(GraphError::LevelMismatch {
                from: self.name.clone(),
                from_level: self.level,
                to: partner.name.clone(),
                to_level: partner.level,
            });
        }
        if self.stype != partner.stype {
            return Err(GraphError::TypeMismatch {
                slot: self.name.clone(),
                reason: format!(
                    "can't connect slots of non-matching stypes ({:?} vs {:?})",
                    self.stype, partner.stype
                ),
            });
        }

        // Captured before the implicit disconnect empties this side.
        let my_len = self.len();
        self.disconnect();
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.partner = Some(Arc::clone(partner));
            st.value = None;
        }
        {
            let mut pst = partner.state.lock().unwrap_or_else(|e| e.into_inner());
            pst.downstream.push(Arc::downgrade(&self.me()));
        }

        if self.level > 0 {
            // The side with more subslots determines the count.
            let target = my_len.max(partner.len());
            partner.resize(target)?;
            self.resize(target)?;
            for i in 0..target {
                self.subslot(i)?.connect(&partner.subslot(i)?)?;
            }
        }

        self.adopt_partner_meta(partner);
        Ok(())
    }

    /// Sever the upstream link. The slot becomes unready (direct values do
    /// not survive a connect/disconnect cycle) and unreadiness propagates
    /// downstream.
    pub fn disconnect(&self) {
        for sub in self.subslots() {
            sub.disconnect();
        }

        let (partner, was_ready, had_any) = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let partner = st.partner.take();
            let was_ready = st.meta.ready();
            let had_any = partner.is_some() || st.value.is_some() || was_ready;
            st.value = None;
            st.meta = SlotMeta::default();
            (partner, was_ready, had_any)
        };
        if let Some(p) = partner {
            let mut pst = p.state.lock().unwrap_or_else(|e| e.into_inner());
            let my_ptr = self.self_weak.as_ptr();
            pst.downstream.retain(|w| w.as_ptr() != my_ptr);
        }
        if !had_any {
            return;
        }

        if self.level > 0 && self.len() > 0 {
            // Ignore the impossible level-0 error; level checked above
            let _ = self.resize(0);
        }

        if was_ready {
            self.sig_unready.emit(&self.me());
        }
        self.configuration_changed();
    }

    /// Full teardown for operator cleanup: detach every downstream
    /// consumer, sever upstream, drop all observers.
    pub(crate) fn sever(&self) {
        for d in self.downstream_snapshot() {
            d.disconnect();
        }
        self.disconnect();
        self.sig_dirty.clear();
        self.sig_ready.clear();
        self.sig_unready.clear();
        self.sig_inserted.clear();
        self.sig_removed.clear();
    }

    // ========== Meta propagation ==========

    /// Assign output metadata from `setup_outputs()`. Marks the slot
    /// ready; re-assigning an identical layout is a silent no-op so
    /// `setup_outputs()` stays cheap to re-run.
    pub fn set_meta(&self, mut meta: SlotMeta) {
        let (was_ready, layout_changed) = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let was_ready = st.meta.ready();
            let layout_changed = !st.meta.same_layout(&meta);
            meta.ready = true;
            st.meta = meta;
            (was_ready, layout_changed)
        };
        if !was_ready {
            self.sig_ready.emit(&self.me());
        }
        if layout_changed || !was_ready {
            for d in self.downstream_snapshot() {
                d.adopt_partner_meta(&self.me());
            }
        }
    }

    /// Output lost its configuration (operator inputs went unready).
    pub(crate) fn mark_unconfigured(&self) {
        let was_ready = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let was_ready = st.meta.ready();
            st.meta = SlotMeta::default();
            st.value = None;
            was_ready
        };
        for sub in self.subslots() {
            sub.mark_unconfigured();
        }
        if was_ready {
            self.sig_unready.emit(&self.me());
            for d in self.downstream_snapshot() {
                d.adopt_partner_meta(&self.me());
            }
        }
    }

    /// Copy the partner's meta and propagate the resulting transitions.
    fn adopt_partner_meta(&self, upstream: &Arc<Slot>) {
        let (was_ready, now_ready, layout_changed) = {
            let upstream_meta = upstream.meta();
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let was_ready = st.meta.ready();
            let layout_changed = !st.meta.same_layout(&upstream_meta);
            let now_ready = upstream_meta.ready();
            st.meta = upstream_meta;
            (was_ready, now_ready, layout_changed)
        };
        if !layout_changed && was_ready == now_ready {
            return;
        }
        if now_ready && !was_ready {
            self.sig_ready.emit(&self.me());
        }
        if !now_ready && was_ready {
            self.sig_unready.emit(&self.me());
        }
        self.configuration_changed();
    }

    /// React to a configuration change on this slot: rerun the owning
    /// operator's setup (inputs only), then propagate meta downstream.
    fn configuration_changed(&self) {
        if self.role == SlotRole::Input {
            if let Some(op) = self.operator() {
                reconfigure(&op);
            }
            if let Some(parent) = self.parent() {
                // Subslot readiness feeds the parent's operator too
                if parent.role == SlotRole::Input {
                    if let Some(op) = parent.operator() {
                        reconfigure(&op);
                    }
                }
            }
        }
        for d in self.downstream_snapshot() {
            d.adopt_partner_meta(&self.me());
        }
    }

    // ========== Dirty protocol ==========

    /// Mark a sub-region stale: notify observers, forward downstream, and
    /// let the owning operator translate input dirt to output dirt.
    /// Never triggers recomputation.
    pub fn set_dirty(&self, roi: &Roi) {
        if self.level == 0 && !self.state.lock().unwrap_or_else(|e| e.into_inner()).meta.ready()
        {
            return;
        }
        for d in self.downstream_snapshot() {
            d.set_dirty(roi);
        }
        self.sig_dirty.emit(&DirtyEvent {
            slot: self.me(),
            roi: roi.clone(),
        });
        if self.role == SlotRole::Input {
            if let Some(op) = self.operator() {
                if op.configured() && !op.core().cleaned_up() {
                    op.propagate_dirty(&self.me(), &self.subindex(), roi);
                }
            }
        }
    }

    /// Dirty the whole declared shape.
    pub fn set_dirty_all(&self) {
        let roi = self.meta().full_roi();
        self.set_dirty(&roi);
    }

    // ========== Requests ==========

    /// Begin an asynchronous fetch of `roi`. Does not block and does not
    /// submit; call `.submit(workers)` for pool execution or `.wait()` to
    /// resolve on the calling thread.
    pub fn request(&self, roi: Roi) -> Request<Value> {
        let slot = self.me();
        Request::new(move |token| resolve(&slot, Some(&roi), token))
    }

    /// Request the slot's full extent.
    pub fn request_all(&self) -> Request<Value> {
        let slot = self.me();
        Request::new(move |token| resolve(&slot, None, token))
    }

    // ========== Multislot structure ==========

    /// Number of subslots (0 for level-0 slots).
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subslots
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the subslot list.
    pub fn subslots(&self) -> Vec<Arc<Slot>> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subslots
            .clone()
    }

    /// Subslot at `index`.
    pub fn subslot(&self, index: usize) -> Result<Arc<Slot>, GraphError> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subslots
            .get(index)
            .cloned()
            .ok_or_else(|| GraphError::TypeMismatch {
                slot: self.name.clone(),
                reason: format!("no subslot at index {} (len {})", index, self.len()),
            })
    }

    /// Grow or shrink to exactly `size` subslots, propagating the change
    /// to equal-level partners.
    pub fn resize(&self, size: usize) -> Result<(), GraphError> {
        if self.level == 0 {
            return Err(GraphError::TypeMismatch {
                slot: self.name.clone(),
                reason: "can't resize a level-0 slot".to_string(),
            });
        }
        while self.len() < size {
            let pos = self.len();
            self.insert_slot(pos, pos + 1)?;
        }
        while self.len() > size {
            let pos = self.len() - 1;
            self.remove_slot(pos, pos)?;
        }
        Ok(())
    }

    /// Insert a new subslot at `position`. `final_size` is the intended
    /// size after the insertion wave; a slot already at (or beyond) that
    /// size ignores the call, which is what terminates propagation
    /// between mutually connected multislots.
    pub fn insert_slot(&self, position: usize, final_size: usize) -> Result<Arc<Slot>, GraphError> {
        if self.level == 0 {
            return Err(GraphError::TypeMismatch {
                slot: self.name.clone(),
                reason: "can't insert into a level-0 slot".to_string(),
            });
        }
        {
            let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if st.subslots.len() >= final_size {
                return Ok(Arc::clone(&st.subslots[position]));
            }
        }
        debug!(
            "Inserting subslot {} into '{}' (final size {})",
            position, self.name, final_size
        );
        let child = self.me().new_child();
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.subslots.insert(position, Arc::clone(&child));
        }

        // Upstream: grow the partner too, then mirror its subslot.
        if let Some(partner) = self.partner() {
            partner.insert_slot(position, final_size)?;
            child.connect(&partner.subslot(position)?)?;
        }
        // Downstream: equal-level consumers follow.
        for d in self.downstream_snapshot() {
            if d.level == self.level {
                d.insert_slot(position, final_size)?;
                d.subslot(position)?.connect(&child)?;
            }
        }

        self.sig_inserted.emit(&StructureEvent {
            slot: self.me(),
            position,
            final_size,
        });
        Ok(child)
    }

    /// Remove the subslot at `position`. `final_size` is the intended
    /// size after the removal wave (same early-exit convention as
    /// [`Slot::insert_slot`]). Removal propagates downstream only.
    pub fn remove_slot(&self, position: usize, final_size: usize) -> Result<(), GraphError> {
        if self.level == 0 {
            return Err(GraphError::TypeMismatch {
                slot: self.name.clone(),
                reason: "can't remove from a level-0 slot".to_string(),
            });
        }
        let child = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if st.subslots.len() <= final_size {
                return Ok(());
            }
            if position >= st.subslots.len() {
                return Err(GraphError::TypeMismatch {
                    slot: self.name.clone(),
                    reason: format!("no subslot at index {} to remove", position),
                });
            }
            st.subslots.remove(position)
        };
        debug!(
            "Removing subslot {} from '{}' (final size {})",
            position, self.name, final_size
        );
        child.sever();

        for d in self.downstream_snapshot() {
            if d.level == self.level {
                d.remove_slot(position, final_size)?;
            }
        }

        self.sig_removed.emit(&StructureEvent {
            slot: self.me(),
            position,
            final_size,
        });
        Ok(())
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("stype", &self.stype)
            .field("level", &self.level)
            .field("ready", &self.ready())
            .finish()
    }
}

fn meta_for_value(value: &Value) -> SlotMeta {
    let mut meta = match value {
        Value::Array(a) => SlotMeta::array(a.shape().to_vec(), a.dtype()),
        _ => SlotMeta::scalar(),
    };
    meta.ready = true;
    meta
}

/// Resolve a slot's data for `roi` (`None` = full extent), following the
/// partner chain up to a direct value or an executable output.
fn resolve(
    slot: &Arc<Slot>,
    roi: Option<&Roi>,
    token: &CancellationToken,
) -> Result<Value, GraphError> {
    if token.cancelled() {
        return Err(GraphError::Cancelled);
    }
    if slot.level() > 0 {
        return Err(GraphError::TypeMismatch {
            slot: slot.name().to_string(),
            reason: "can't request data from a multislot; index a subslot".to_string(),
        });
    }

    let (value, partner, meta) = {
        let st = slot.state.lock().unwrap_or_else(|e| e.into_inner());
        (st.value.clone(), st.partner.clone(), st.meta.clone())
    };

    if let Some(v) = value {
        return match (&v, roi) {
            (Value::Array(a), Some(r)) => {
                if *r == Roi::full(a.shape()) {
                    Ok(v)
                } else {
                    Ok(Value::Array(a.slice(r)?))
                }
            }
            _ => Ok(v),
        };
    }

    if let Some(p) = partner {
        return resolve(&p, roi, token);
    }

    // Executable output: defer to the owning operator.
    let op_name = slot
        .operator()
        .map(|op| op.core().name().to_string())
        .unwrap_or_else(|| "<detached>".to_string());
    if !meta.ready() {
        return Err(GraphError::not_ready(&op_name, slot.name()));
    }
    let op = slot
        .operator()
        .ok_or_else(|| GraphError::not_ready(&op_name, slot.name()))?;

    match slot.stype() {
        Stype::Array => {
            let shape = meta
                .shape
                .clone()
                .ok_or_else(|| GraphError::not_ready(&op_name, slot.name()))?;
            let dtype = meta
                .dtype
                .ok_or_else(|| GraphError::not_ready(&op_name, slot.name()))?;
            let roi = match roi {
                Some(r) => r.clone(),
                None => Roi::full(&shape),
            };
            roi.validate_within(&shape)
                .map_err(|(roi, shape)| GraphError::RoiOutOfBounds { roi, shape })?;
            let mut buffer = NdValue::zeros(dtype, &roi.shape());
            op.execute(slot, &slot.subindex(), &roi, &mut buffer)?;
            if buffer.shape() != roi.shape().as_slice() {
                return Err(GraphError::Execution(format!(
                    "operator '{}' produced shape {:?} for roi {}",
                    op_name,
                    buffer.shape(),
                    roi
                )));
            }
            Ok(Value::Array(buffer))
        }
        // Value outputs are assigned in setup_outputs(); reaching here
        // means the operator marked the slot ready without a value.
        Stype::Value => Err(GraphError::not_ready(&op_name, slot.name())),
    }
}
