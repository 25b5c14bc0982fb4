// src/engine/ledger.rs

//! Completed-output ledger used to satisfy `after` prerequisites.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::collab::TaskSpawner;
use crate::task::TaskProxy;

/// Records every completed `(point, name, output)` and forwards the
/// notification to the wrapped spawner.
pub struct OutputLedger {
    completed: Mutex<HashSet<(String, String, String)>>,
    inner: Arc<dyn TaskSpawner>,
}

impl OutputLedger {
    pub fn new(inner: Arc<dyn TaskSpawner>) -> Self {
        Self {
            completed: Mutex::new(HashSet::new()),
            inner,
        }
    }

    pub fn is_completed(&self, point: &str, name: &str, output: &str) -> bool {
        let guard = self.completed.lock().unwrap_or_else(|e| e.into_inner());
        guard.contains(&(point.to_string(), name.to_string(), output.to_string()))
    }

    pub fn len(&self) -> usize {
        self.completed.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TaskSpawner for OutputLedger {
    fn spawn_on_output(&self, itask: &TaskProxy, output: &str) {
        {
            let mut guard = self.completed.lock().unwrap_or_else(|e| e.into_inner());
            guard.insert((itask.point.clone(), itask.name.clone(), output.to_string()));
        }
        self.inner.spawn_on_output(itask, output);
    }
}

impl std::fmt::Debug for OutputLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputLedger")
            .field("completed", &self.len())
            .finish_non_exhaustive()
    }
}
