//! GPU device leasing.
//!
//! Compute devices are a fixed pool shared by all tile workers. A worker
//! acquires a [`DeviceLease`] before running device-bound work and the lease
//! returns the device on drop, waking one waiter. Acquisition retries with
//! exponential backoff and gives up after a bounded number of attempts
//! rather than deadlocking a starved run.

use crate::core::error::DeviceError;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_ATTEMPTS: u32 = 6;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct PoolState {
    available: Mutex<Vec<u32>>,
    returned: Condvar,
}

/// Shared pool of device identifiers.
#[derive(Clone)]
pub struct DevicePool {
    state: Arc<PoolState>,
    capacity: usize,
}

/// Exclusive hold on one device; returned to the pool on drop.
#[derive(Debug)]
pub struct DeviceLease {
    device: u32,
    state: Arc<PoolState>,
}

impl DeviceLease {
    /// The leased device identifier.
    pub fn device(&self) -> u32 {
        self.device
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.state.available.lock().push(self.device);
        self.state.returned.notify_one();
    }
}

impl DevicePool {
    /// Create a pool over the given device identifiers.
    pub fn new(devices: impl IntoIterator<Item = u32>) -> Self {
        let devices: Vec<u32> = devices.into_iter().collect();
        let capacity = devices.len();
        DevicePool {
            state: Arc::new(PoolState {
                available: Mutex::new(devices),
                returned: Condvar::new(),
            }),
            capacity,
        }
    }

    /// Total number of devices managed by the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of devices currently unleased.
    pub fn available(&self) -> usize {
        self.state.available.lock().len()
    }

    /// Take a device immediately, if one is free.
    pub fn try_acquire(&self) -> Option<DeviceLease> {
        self.state.available.lock().pop().map(|device| DeviceLease {
            device,
            state: Arc::clone(&self.state),
        })
    }

    /// Take a device, waiting with default backoff if none is free.
    pub fn acquire(&self) -> Result<DeviceLease, DeviceError> {
        self.acquire_with_backoff(DEFAULT_ATTEMPTS, DEFAULT_BASE_DELAY)
    }

    /// Take a device, waiting up to `attempts` rounds of exponential
    /// backoff starting at `base_delay`.
    pub fn acquire_with_backoff(
        &self,
        attempts: u32,
        base_delay: Duration,
    ) -> Result<DeviceLease, DeviceError> {
        let mut available = self.state.available.lock();
        for attempt in 0..attempts {
            if let Some(device) = available.pop() {
                return Ok(DeviceLease {
                    device,
                    state: Arc::clone(&self.state),
                });
            }
            let delay = base_delay * 2u32.saturating_pow(attempt);
            self.state.returned.wait_for(&mut available, delay);
        }
        if let Some(device) = available.pop() {
            return Ok(DeviceLease {
                device,
                state: Arc::clone(&self.state),
            });
        }
        Err(DeviceError::Exhausted { attempts })
    }
}
