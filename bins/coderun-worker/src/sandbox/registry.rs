use super::Sandbox;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Process-wide table of live sandboxes, keyed by sandbox id. Entries exist
/// from creation until cleanup; whatever is left at shutdown gets reaped.
#[derive(Default)]
pub struct SandboxRegistry {
    running: Mutex<HashMap<String, Arc<dyn Sandbox>>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sandbox: Arc<dyn Sandbox>) {
        self.running.lock().insert(sandbox.id().to_string(), sandbox);
    }

    pub fn deregister(&self, id: &str) -> Option<Arc<dyn Sandbox>> {
        self.running.lock().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.running.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.running.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.lock().is_empty()
    }

    /// Kill and delete every registered sandbox. Returns how many were reaped.
    pub async fn reap_all(&self) -> usize {
        let leftovers: Vec<Arc<dyn Sandbox>> = self.running.lock().drain().map(|(_, s)| s).collect();
        if leftovers.is_empty() {
            return 0;
        }

        info!(count = leftovers.len(), "Reaping leftover sandboxes");
        for sandbox in &leftovers {
            if let Err(e) = sandbox.kill().await {
                warn!(sandbox = %sandbox.id(), error = %e, "Kill failed during reap");
            }
            if let Err(e) = sandbox.delete().await {
                warn!(sandbox = %sandbox.id(), error = %e, "Delete failed during reap");
            }
        }
        leftovers.len()
    }
}
