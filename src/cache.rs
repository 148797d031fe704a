//! Execution cache
//!
//! Keyed cache of hot workflow contexts. Each entry carries an exclusive
//! async lock that must be held across load-mutate-persist, and a byte-size
//! estimate used for global eviction. Entries whose lock is currently held
//! are pinned and never evicted. Lock acquisition is cancellable: dropping
//! the future (e.g. under `tokio::time::timeout`) abandons the wait.

use lru::LruCache;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::execution::WorkflowKey;

/// Cached per-run context: the exclusive lock plus whatever state is loaded
/// under it
pub struct CachedContext<V> {
    key: WorkflowKey,
    state: AsyncMutex<Option<V>>,
    size_bytes: AtomicUsize,
}

impl<V> CachedContext<V> {
    fn new(key: WorkflowKey) -> Self {
        Self {
            key,
            state: AsyncMutex::new(None),
            size_bytes: AtomicUsize::new(BASE_CONTEXT_SIZE),
        }
    }

    pub fn key(&self) -> &WorkflowKey {
        &self.key
    }

    /// Acquire the per-run exclusive lock. At most one holder exists at a
    /// time; dropping the returned future cancels the wait.
    pub async fn lock(&self) -> ContextGuard<'_, V> {
        ContextGuard {
            context: self,
            guard: self.state.lock().await,
        }
    }

    /// Current size estimate for eviction accounting
    pub fn size_bytes(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    fn is_locked(&self) -> bool {
        self.state.try_lock().is_err()
    }
}

/// Empty-context overhead charged even before any state loads
const BASE_CONTEXT_SIZE: usize = 256;

/// Lock holder over a cached context
pub struct ContextGuard<'a, V> {
    context: &'a CachedContext<V>,
    guard: MutexGuard<'a, Option<V>>,
}

impl<V> ContextGuard<'_, V> {
    /// Loaded state, if any
    pub fn state(&self) -> Option<&V> {
        self.guard.as_ref()
    }

    pub fn state_mut(&mut self) -> Option<&mut V> {
        self.guard.as_mut()
    }

    /// Install freshly loaded state and account its size
    pub fn install(&mut self, state: V, size_bytes: usize) {
        *self.guard = Some(state);
        self.context
            .size_bytes
            .store(BASE_CONTEXT_SIZE + size_bytes, Ordering::Relaxed);
    }

    /// Drop the cached state so the next holder reloads from persistence.
    /// Used after a conditional-write conflict.
    pub fn clear(&mut self) {
        *self.guard = None;
        self.context
            .size_bytes
            .store(BASE_CONTEXT_SIZE, Ordering::Relaxed);
    }

    /// Refresh the size estimate after a mutation
    pub fn update_size(&self, size_bytes: usize) {
        self.context
            .size_bytes
            .store(BASE_CONTEXT_SIZE + size_bytes, Ordering::Relaxed);
    }
}

/// Size-bounded cache of workflow contexts
///
/// The index lock is a plain mutex held only for map operations; entry
/// contents are guarded by the per-entry async lock.
pub struct ExecutionCache<V> {
    entries: Mutex<LruCache<WorkflowKey, Arc<CachedContext<V>>>>,
    max_total_bytes: usize,
}

impl<V> ExecutionCache<V> {
    pub fn new(max_total_bytes: usize) -> Self {
        Self {
            // Capacity is governed by byte size, not entry count.
            entries: Mutex::new(LruCache::unbounded()),
            max_total_bytes,
        }
    }

    /// Shared handle for the run, creating the entry on first use
    pub fn get_or_create(&self, key: &WorkflowKey) -> Arc<CachedContext<V>> {
        let mut entries = self.entries.lock();
        if let Some(context) = entries.get(key) {
            metrics::counter!("execution_cache_hit").increment(1);
            return Arc::clone(context);
        }
        let context = Arc::new(CachedContext::new(key.clone()));
        entries.push(key.clone(), Arc::clone(&context));
        self.evict_locked(&mut entries);
        metrics::counter!("execution_cache_miss").increment(1);
        context
    }

    /// Remove the run's entry outright
    pub fn remove(&self, key: &WorkflowKey) {
        self.entries.lock().pop(key);
    }

    /// Sum of entry size estimates
    pub fn total_size_bytes(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .map(|(_, context)| context.size_bytes())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Run eviction until under budget. Locked entries are reinserted as
    /// most-recently-used and skipped.
    fn evict_locked(&self, entries: &mut LruCache<WorkflowKey, Arc<CachedContext<V>>>) {
        let mut total: usize = entries
            .iter()
            .map(|(_, context)| context.size_bytes())
            .sum();
        let mut skipped: Vec<(WorkflowKey, Arc<CachedContext<V>>)> = Vec::new();
        let mut attempts = entries.len();
        while total > self.max_total_bytes && attempts > 0 {
            attempts -= 1;
            let Some((key, context)) = entries.pop_lru() else {
                break;
            };
            if context.is_locked() {
                skipped.push((key, context));
                continue;
            }
            total -= context.size_bytes();
            metrics::counter!("execution_cache_evictions").increment(1);
        }
        for (key, context) in skipped {
            entries.push(key, context);
        }
    }
}
