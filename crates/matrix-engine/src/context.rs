//! Execution context tiers.
//!
//! Actions share state through three independent stores:
//! - step-scoped: one per script per step, cleared when the step ends
//! - script-scoped: one per script, lives for the whole run
//! - run-scoped: one per run, owns shared resources
//!
//! Tiers are never merged. A caller always names the tier it reads.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::{Deserialize, Serialize};

type Entry = Arc<dyn Any + Send + Sync>;

/// Context tier selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextTier {
    Step,
    Script,
    Run,
}

impl std::fmt::Display for ContextTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Step => write!(f, "step"),
            Self::Script => write!(f, "script"),
            Self::Run => write!(f, "run"),
        }
    }
}

/// Typed key/value store for one context tier.
#[derive(Default)]
pub struct ContextStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a value, replacing any previous one under the same key.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.lock().insert(key.into(), Arc::new(value));
    }

    /// Get a value if present and of type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let entry = self.lock().get(key).cloned()?;
        entry.downcast::<T>().ok()
    }

    /// Remove a value. Returns true if it existed.
    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl std::fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextStore")
            .field("keys", &self.keys())
            .finish()
    }
}

/// Shared resource owned by the run (connections, sessions, listeners).
pub trait RunResource: Send + Sync {
    /// Stop any ongoing work. Called when the run is interrupted.
    fn cancel(&self);

    /// Release the resource. Called when the run ends.
    fn close(&self) {}
}

/// Run-scoped context: values plus registered resources.
#[derive(Default)]
pub struct RunContext {
    values: RwLock<HashMap<String, Entry>>,
    resources: Mutex<HashMap<String, Arc<dyn RunResource>>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let entry = self
            .values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()?;
        entry.downcast::<T>().ok()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    fn resources(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn RunResource>>> {
        self.resources.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a resource. Returns the resource previously registered under `name`.
    pub fn register_resource(
        &self,
        name: impl Into<String>,
        resource: Arc<dyn RunResource>,
    ) -> Option<Arc<dyn RunResource>> {
        self.resources().insert(name.into(), resource)
    }

    pub fn unregister_resource(&self, name: &str) -> Option<Arc<dyn RunResource>> {
        self.resources().remove(name)
    }

    pub fn resource(&self, name: &str) -> Option<Arc<dyn RunResource>> {
        self.resources().get(name).cloned()
    }

    pub fn resource_names(&self) -> Vec<String> {
        self.resources().keys().cloned().collect()
    }

    /// Cancel every registered resource.
    pub fn cancel_resources(&self) {
        let resources: Vec<_> = self.resources().values().cloned().collect();
        for resource in resources {
            resource.cancel();
        }
    }

    /// Close and forget all resources and values.
    pub fn clear(&self) {
        let resources: Vec<_> = self.resources().drain().map(|(_, r)| r).collect();
        for resource in resources {
            resource.close();
        }
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("resources", &self.resource_names())
            .finish()
    }
}

/// Contexts visible to one action execution.
#[derive(Debug, Clone)]
pub struct ExecutionScope {
    pub step: Arc<ContextStore>,
    pub script: Arc<ContextStore>,
    pub run: Arc<RunContext>,
}

impl ExecutionScope {
    pub fn new(step: Arc<ContextStore>, script: Arc<ContextStore>, run: Arc<RunContext>) -> Self {
        Self { step, script, run }
    }

    /// Scope with fresh, empty stores.
    pub fn detached() -> Self {
        Self::new(
            Arc::new(ContextStore::new()),
            Arc::new(ContextStore::new()),
            Arc::new(RunContext::new()),
        )
    }

    /// Read a value from an explicitly selected tier.
    pub fn get<T: Any + Send + Sync>(&self, tier: ContextTier, key: &str) -> Option<Arc<T>> {
        match tier {
            ContextTier::Step => self.step.get(key),
            ContextTier::Script => self.script.get(key),
            ContextTier::Run => self.run.get(key),
        }
    }

    /// Write a value into an explicitly selected tier.
    pub fn set<T: Any + Send + Sync>(&self, tier: ContextTier, key: impl Into<String>, value: T) {
        match tier {
            ContextTier::Step => self.step.set(key, value),
            ContextTier::Script => self.script.set(key, value),
            ContextTier::Run => self.run.set(key, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_context_store_typed_access() {
        let store = ContextStore::new();
        store.set("count", 5usize);
        assert_eq!(store.get::<usize>("count").as_deref(), Some(&5));
        assert!(store.get::<String>("count").is_none());
        assert!(store.remove("count"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_tiers_are_isolated() {
        let scope = ExecutionScope::detached();
        scope.set(ContextTier::Step, "session", "s1".to_string());

        assert!(scope.get::<String>(ContextTier::Step, "session").is_some());
        assert!(scope.get::<String>(ContextTier::Script, "session").is_none());
        assert!(scope.get::<String>(ContextTier::Run, "session").is_none());
    }

    struct CountingResource {
        cancelled: AtomicUsize,
        closed: AtomicUsize,
    }

    impl RunResource for CountingResource {
        fn cancel(&self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_run_context_resources() {
        let ctx = RunContext::new();
        let resource = Arc::new(CountingResource {
            cancelled: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        });
        ctx.register_resource("db", resource.clone());
        ctx.set("limit", 10u32);

        ctx.cancel_resources();
        assert_eq!(resource.cancelled.load(Ordering::SeqCst), 1);

        ctx.clear();
        assert_eq!(resource.closed.load(Ordering::SeqCst), 1);
        assert!(ctx.resource_names().is_empty());
        assert!(!ctx.contains("limit"));
    }
}
