use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::domain::VehicleId;

/// Idle entries are swept once the table grows past this.
const SWEEP_THRESHOLD: usize = 1024;

/// One async mutex per vehicle. Writers to the same vehicle queue up in
/// FIFO order; writers to different vehicles never wait on each other.
pub struct VehicleLocks {
    locks: Mutex<HashMap<VehicleId, Arc<AsyncMutex<()>>>>,
    timeout: Duration,
}

/// Held for the duration of one write; releases on drop.
pub struct VehicleGuard {
    _guard: OwnedMutexGuard<()>,
}

impl VehicleLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait up to the configured timeout for the vehicle's lock.
    /// Returns `None` when the wait runs out.
    pub async fn acquire(&self, vehicle_id: VehicleId) -> Option<VehicleGuard> {
        let mutex = self.entry(vehicle_id);

        if let Ok(guard) = mutex.clone().try_lock_owned() {
            return Some(VehicleGuard { _guard: guard });
        }

        tokio::time::timeout(self.timeout, mutex.lock_owned())
            .await
            .ok()
            .map(|guard| VehicleGuard { _guard: guard })
    }

    fn entry(&self, vehicle_id: VehicleId) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if locks.len() > SWEEP_THRESHOLD {
            // Only the map holds these, so nobody is using or waiting on them
            locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        }

        locks
            .entry(vehicle_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}
