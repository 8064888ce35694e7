//! Context Store
//!
//! Contexts are singleton objects shared by every component that declares the
//! same context key. The runtime creates one instance per key and hands out
//! `Arc` clones; any interior synchronization is the context type's own job.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{RuntimeError, RuntimeResult};

/// Type-erased shared context instance
pub type SharedContext = Arc<dyn Any + Send + Sync>;

struct ContextEntry {
    ty: ContextType,
    instance: SharedContext,
}

/// Map of context key to its single live instance
#[derive(Default, Clone)]
pub struct Contexts {
    entries: HashMap<String, Arc<ContextEntry>>,
    order: Vec<String>,
}

impl Contexts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an instance under `key`; a key is bound at most once.
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, instance: Arc<T>) -> RuntimeResult<()> {
        self.insert_erased(key.into(), ContextType::of::<T>(), instance)
    }

    pub(crate) fn insert_erased(&mut self, key: String, ty: ContextType, instance: SharedContext) -> RuntimeResult<()> {
        if self.entries.contains_key(&key) {
            return Err(RuntimeError::DuplicateContext(key));
        }
        self.order.push(key.clone());
        self.entries.insert(key, Arc::new(ContextEntry { ty, instance }));
        Ok(())
    }

    pub(crate) fn remove(&mut self, key: &str) -> bool {
        self.order.retain(|k| k != key);
        self.entries.remove(key).is_some()
    }

    /// Get the instance bound to `key` as its concrete type
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let entry = self.entries.get(key)?;
        Arc::clone(&entry.instance).downcast::<T>().ok()
    }

    /// Like [`Contexts::get`], but reports a missing or mistyped context
    pub fn require<T: Any + Send + Sync>(&self, key: &str) -> RuntimeResult<Arc<T>> {
        self.get(key).ok_or_else(|| RuntimeError::ContextUnavailable {
            key: key.to_string(),
            expected: std::any::type_name::<T>(),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Implementing type name of the context bound to `key`
    pub fn type_name(&self, key: &str) -> Option<&'static str> {
        self.entries.get(key).map(|e| e.ty.name)
    }

    pub fn context_type(&self, key: &str) -> Option<ContextType> {
        self.entries.get(key).map(|e| e.ty)
    }

    /// Keys in creation order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

impl fmt::Debug for Contexts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.order.iter().filter_map(|k| self.entries.get(k).map(|e| (k, e.ty.name))))
            .finish()
    }
}

/// Identity of a context implementation, compared when binding keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextType {
    pub id: TypeId,
    pub name: &'static str,
}

impl ContextType {
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}
