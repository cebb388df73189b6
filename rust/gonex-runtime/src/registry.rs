//! Function registry: the only way callables cross the worker boundary.
//!
//! Tasks register callables by id at startup; the registry is shared into
//! every worker at pool initialization. Shipping source text is not
//! supported: an unregistered callable fails at spawn time.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use gonex_core::{GonexError, GonexResult};

use crate::marshal::TaskValue;
use crate::worker::WorkerEnv;

/// A registered callable. Runs on a worker thread (or inline on the
/// cooperative backend); the [`WorkerEnv`] resolves handle arguments into
/// proxies.
pub type TaskFn = Arc<dyn Fn(&WorkerEnv, Vec<TaskValue>) -> GonexResult<TaskValue> + Send + Sync>;

/// Id → callable mapping. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    fns: Arc<DashMap<String, TaskFn>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            fns: Arc::new(DashMap::new()),
        }
    }

    /// Register a callable under a stable id. Replacing an id is allowed
    /// but noisy, since running workers resolve ids dynamically.
    pub fn register<F>(&self, id: impl Into<String>, f: F)
    where
        F: Fn(&WorkerEnv, Vec<TaskValue>) -> GonexResult<TaskValue> + Send + Sync + 'static,
    {
        let id = id.into();
        if self.fns.insert(id.clone(), Arc::new(f)).is_some() {
            warn!(function = %id, "replaced an already-registered function");
        }
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.fns.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.fns.contains_key(id)
    }

    pub fn get(&self, id: &str) -> GonexResult<TaskFn> {
        self.fns
            .get(id)
            .map(|f| f.clone())
            .ok_or_else(|| GonexError::FunctionNotRegistered { id: id.to_string() })
    }

    pub fn len(&self) -> usize {
        self.fns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.fns.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
