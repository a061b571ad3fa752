use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::config::Config;
use crate::isolate::IsolateError;
use crate::manager::BoxManager;
use crate::store::TestStorage;

/// A fixed set of box managers, leased out one at a time
#[derive(Debug)]
pub struct ManagerPool {
    managers: Vec<Arc<BoxManager>>,
    free: Arc<Mutex<Vec<Arc<BoxManager>>>>,
    permits: Arc<Semaphore>,
}

impl ManagerPool {
    /// Start one manager per configured box id
    pub async fn new(config: Arc<Config>, storage: Arc<dyn TestStorage>) -> Result<Self, IsolateError> {
        let mut managers = Vec::new();
        for id in config.grader.box_ids() {
            let manager =
                BoxManager::new(id, Arc::clone(&config), Arc::clone(&storage)).await?;
            managers.push(Arc::new(manager));
        }
        info!(boxes = managers.len(), "manager pool ready");
        Ok(Self::from_managers(managers))
    }

    pub fn from_managers(managers: Vec<Arc<BoxManager>>) -> Self {
        Self {
            free: Arc::new(Mutex::new(managers.clone())),
            permits: Arc::new(Semaphore::new(managers.len())),
            managers,
        }
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Number of managers not currently leased
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for an idle manager
    pub async fn acquire(&self) -> ManagerLease {
        // The semaphore is never closed.
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("manager pool semaphore closed"));
        let manager = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| unreachable!("permit held without a free manager"));
        debug!(box_id = manager.id(), "manager leased");
        ManagerLease {
            manager: Some(manager),
            free: Arc::clone(&self.free),
            _permit: permit,
        }
    }

    /// Release every box
    pub async fn cleanup(&self) {
        for manager in &self.managers {
            manager.cleanup().await;
        }
    }
}

/// Exclusive use of one pooled manager, returned to the pool on drop
pub struct ManagerLease {
    manager: Option<Arc<BoxManager>>,
    free: Arc<Mutex<Vec<Arc<BoxManager>>>>,
    // Dropped after the manager is back on the free list.
    _permit: OwnedSemaphorePermit,
}

impl Deref for ManagerLease {
    type Target = BoxManager;

    fn deref(&self) -> &BoxManager {
        match self.manager {
            Some(ref manager) => manager,
            None => unreachable!("lease used after release"),
        }
    }
}

impl Drop for ManagerLease {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.take() {
            debug!(box_id = manager.id(), "manager returned");
            self.free.lock().push(manager);
        }
    }
}
