//! Per-connection registry of extension instances, keyed by type.
//!
//! Extension managers (service discovery, pings, ...) live here instead of in
//! process-wide maps, so they are created and dropped with their connection.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Default)]
pub struct ExtensionRegistry {
    entries: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|entry| entry.downcast::<T>().ok())
    }

    /// Return the registered instance, creating it on first use.
    pub fn get_or_insert_with<T, F>(&self, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.get::<T>() {
            return existing;
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        // Another caller may have won the race between the two locks
        if let Some(existing) = entries
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|entry| entry.downcast::<T>().ok())
        {
            return existing;
        }
        let instance = Arc::new(init());
        entries.insert(TypeId::of::<T>(), instance.clone());
        instance
    }

    pub fn insert<T: Any + Send + Sync>(&self, instance: T) -> Option<Arc<T>> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries
            .insert(TypeId::of::<T>(), Arc::new(instance))
            .and_then(|old| old.downcast::<T>().ok())
    }

    pub fn remove<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast::<T>().ok())
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("len", &self.len())
            .finish()
    }
}
