//! Engine registry
//!
//! A shard needs to reach its engine and the engine holds the shard,
//! which would be a reference cycle. The registry breaks it: shards refer
//! to engines through an opaque slot keyed by shard id, and teardown is
//! explicit: unregister the engine, then drop the shard.

use dashmap::DashMap;
use std::sync::Arc;

/// Slot map from shard id to the engine driving it
pub struct EngineRegistry<E> {
    engines: DashMap<i32, Arc<E>>,
}

impl<E> EngineRegistry<E> {
    pub fn new() -> Self {
        Self {
            engines: DashMap::new(),
        }
    }

    /// Install the engine for a shard, replacing any previous registration
    pub fn register(&self, shard_id: i32, engine: Arc<E>) {
        self.engines.insert(shard_id, engine);
    }

    /// Remove the shard's engine; returns it so the caller controls drop
    /// order
    pub fn unregister(&self, shard_id: i32) -> Option<Arc<E>> {
        self.engines.remove(&shard_id).map(|(_, engine)| engine)
    }

    pub fn get(&self, shard_id: i32) -> Option<Arc<E>> {
        self.engines.get(&shard_id).map(|entry| Arc::clone(&entry))
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

impl<E> Default for EngineRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_teardown_order() {
        let registry: EngineRegistry<String> = EngineRegistry::new();
        registry.register(1, Arc::new("engine-1".to_string()));
        registry.register(2, Arc::new("engine-2".to_string()));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(1).unwrap().as_str(), "engine-1");

        let engine = registry.unregister(1).expect("was registered");
        assert!(registry.get(1).is_none());
        // The engine handle outlives its registry slot; the caller drops it
        // after the shard.
        drop(engine);
    }

    #[test]
    fn test_reregistration_replaces() {
        let registry: EngineRegistry<u32> = EngineRegistry::new();
        registry.register(1, Arc::new(1));
        registry.register(1, Arc::new(2));
        assert_eq!(*registry.get(1).unwrap(), 2);
    }
}
