use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps how many synthesis requests this process has in flight against the speech service.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    slots: Arc<Semaphore>,
    capacity: usize,
}

/// Held for the duration of one scene's synthesis; dropping it frees the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub async fn acquire(&self) -> Result<AdmissionPermit> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .context("Admission pool closed")?;
        Ok(AdmissionPermit { _permit: permit })
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
