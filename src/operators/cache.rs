//! Roi-keyed result cache with LRU eviction.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace};
use lru::LruCache;

use crate::config::DEFAULT_CACHE_BLOCKS;
use crate::error::GraphError;
use crate::graph::Graph;
use crate::operator::{OpCore, Operator, attach};
use crate::roi::Roi;
use crate::slot::{Slot, SlotDef};
use crate::value::NdValue;

/// Cache hit/miss counters, cheap enough to keep always-on.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl CacheStats {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Caches computed regions of its input, keyed by roi.
///
/// A request is served from the cache when some stored block covers the
/// requested roi (exact match or containment; containment slices the
/// stored block without copying the backing buffer). Otherwise the roi
/// is fetched upstream and stored. `propagate_dirty` evicts every block
/// intersecting the dirty region before forwarding it, so stale data is
/// never served after an upstream change.
pub struct OpArrayCache {
    core: OpCore,
    blocks: Mutex<LruCache<Roi, NdValue>>,
    // Bumped on every invalidation. A miss snapshots it before fetching
    // upstream and only stores the block if no invalidation happened in
    // between; otherwise the fetched data predates the dirty event and
    // must not be cached.
    generation: AtomicU64,
    stats: CacheStats,
}

impl OpArrayCache {
    pub fn new(graph: &Graph) -> Arc<Self> {
        Self::with_capacity(graph, DEFAULT_CACHE_BLOCKS)
    }

    /// `capacity` is a block count, not a byte budget.
    pub fn with_capacity(graph: &Graph, capacity: usize) -> Arc<Self> {
        let capacity =
            NonZeroUsize::new(capacity).unwrap_or_else(|| NonZeroUsize::new(1).unwrap());
        let core = OpCore::builder("OpArrayCache", graph)
            .input(SlotDef::array("Input"))
            .output(SlotDef::array("Output"))
            .build();
        attach(Arc::new(Self {
            core,
            blocks: Mutex::new(LruCache::new(capacity)),
            generation: AtomicU64::new(0),
            stats: CacheStats::default(),
        }))
    }

    pub fn input(&self) -> &Arc<Slot> {
        self.core.input("Input")
    }

    pub fn output(&self) -> &Arc<Slot> {
        self.core.output("Output")
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of cached blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop every cached block.
    pub fn clear(&self) {
        let mut blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        self.generation.fetch_add(1, Ordering::SeqCst);
        blocks.clear();
    }

    fn lookup(&self, roi: &Roi) -> Option<NdValue> {
        let mut blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(block) = blocks.get(roi) {
            return Some(block.clone());
        }
        // Containment scan: any stored block covering the roi serves it.
        let covering = blocks
            .iter()
            .find(|(stored, _)| stored.contains(roi))
            .map(|(stored, _)| stored.clone())?;
        let block = blocks.get(&covering)?.clone();
        let relative = covering.relative_to_self(roi);
        drop(blocks);
        block.slice(&relative).ok()
    }

    fn evict_intersecting(&self, roi: &Roi) {
        let mut blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        self.generation.fetch_add(1, Ordering::SeqCst);
        let stale: Vec<Roi> = blocks
            .iter()
            .filter(|(stored, _)| stored.intersection(roi).is_some())
            .map(|(stored, _)| stored.clone())
            .collect();
        if !stale.is_empty() {
            debug!(
                "Evicting {} cache block(s) intersecting {}",
                stale.len(),
                roi
            );
        }
        for key in stale {
            blocks.pop(&key);
        }
    }
}

impl Operator for OpArrayCache {
    fn core(&self) -> &OpCore {
        &self.core
    }

    fn setup_outputs(&self) -> Result<(), GraphError> {
        self.output().set_meta(self.input().meta());
        // Input layout changed; nothing stored is trustworthy.
        self.clear();
        Ok(())
    }

    fn execute(
        &self,
        _slot: &Arc<Slot>,
        _subindex: &[usize],
        roi: &Roi,
        result: &mut NdValue,
    ) -> Result<(), GraphError> {
        if let Some(block) = self.lookup(roi) {
            trace!("Cache hit for {}", roi);
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            *result = block;
            return Ok(());
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let fetch_generation = self.generation.load(Ordering::SeqCst);
        let value = self.input().request(roi.clone()).wait()?;
        let arr = value.as_array().ok_or_else(|| {
            GraphError::Execution("cache input resolved to a non-array value".to_string())
        })?;
        {
            let mut blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
            if self.generation.load(Ordering::SeqCst) == fetch_generation {
                blocks.put(roi.clone(), arr.clone());
            } else {
                trace!("Discarding block {} fetched across an invalidation", roi);
            }
        }
        *result = arr.clone();
        Ok(())
    }

    fn propagate_dirty(&self, _slot: &Arc<Slot>, _subindex: &[usize], roi: &Roi) {
        self.evict_intersecting(roi);
        self.output().set_dirty(roi);
    }
}
