use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{self, AtomicU64};
use std::sync::Arc;

use crate::problem::ProblemShape;
use crate::target::HardwareBudget;
use crate::tiling::TilingResult;
use crate::{plan, PlanError};

pub const DEFAULT_CAPACITY: usize = 4096;

type CacheKey = (ProblemShape, HardwareBudget);

/// A bounded memo of completed plans, shared between threads.
///
/// Lookups and inserts each hold the lock only briefly; planning runs unlocked, so two
/// threads may plan the same key at once. The first insert wins and later ones are
/// discarded. Once full, new results are returned but not retained.
pub struct TilingCache {
    entries: Mutex<HashMap<CacheKey, Arc<TilingResult>>>,
    capacity: usize,
    stats: CacheStats,
}

#[derive(Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    drops: AtomicU64,
}

impl TilingCache {
    pub fn new(capacity: usize) -> Self {
        TilingCache {
            entries: Mutex::new(HashMap::new()),
            capacity,
            stats: CacheStats::default(),
        }
    }

    /// Return the cached plan for `problem` on `budget`, planning it on a miss.
    ///
    /// Failed plans are not cached.
    pub fn get_or_plan(
        &self,
        problem: &ProblemShape,
        budget: &HardwareBudget,
    ) -> Result<Arc<TilingResult>, PlanError> {
        let key = (problem.clone(), *budget);
        if let Some(hit) = self.entries.lock().get(&key) {
            self.stats.hits.fetch_add(1, atomic::Ordering::Relaxed);
            return Ok(Arc::clone(hit));
        }
        self.stats.misses.fetch_add(1, atomic::Ordering::Relaxed);

        let planned = Arc::new(plan(problem, budget)?);

        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&key) {
            return Ok(Arc::clone(existing));
        }
        if entries.len() >= self.capacity {
            debug!("tiling cache full at {} entries; dropping {problem}", self.capacity);
            self.stats.drops.fetch_add(1, atomic::Ordering::Relaxed);
            return Ok(planned);
        }
        entries.insert(key, Arc::clone(&planned));
        Ok(planned)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.stats.hits.load(atomic::Ordering::SeqCst)
    }

    pub fn misses(&self) -> u64 {
        self.stats.misses.load(atomic::Ordering::SeqCst)
    }

    pub fn drops(&self) -> u64 {
        self.stats.drops.load(atomic::Ordering::SeqCst)
    }
}

impl Default for TilingCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
