use std::ops::Deref;
use std::sync::{Arc, Weak};

use super::ResidentResource;
use super::manager::{Inner, Resident};
use crate::device::Device;

/// Shared use of the resident model.
///
/// While any lease is alive the watchdog will not evict the instance, and a
/// forced release only detaches it. Returning a lease counts as use.
pub struct Lease<R: ResidentResource> {
    resident: Arc<Resident<R>>,
    manager: Weak<Inner<R>>,
}

impl<R: ResidentResource> Lease<R> {
    pub(crate) fn new(resident: Arc<Resident<R>>, manager: Weak<Inner<R>>) -> Self {
        Self { resident, manager }
    }

    /// Device the instance was loaded for.
    pub fn device(&self) -> Device {
        self.resident.device
    }

    /// Load episode that produced this instance. Starts at 1.
    pub fn episode(&self) -> u64 {
        self.resident.episode
    }

    pub(crate) fn resident(&self) -> &Arc<Resident<R>> {
        &self.resident
    }

    pub fn same_instance(&self, other: &Lease<R>) -> bool {
        Arc::ptr_eq(&self.resident, &other.resident)
    }
}

impl<R: ResidentResource> Deref for Lease<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.resident.resource
    }
}

impl<R: ResidentResource> Drop for Lease<R> {
    fn drop(&mut self) {
        if let Some(inner) = self.manager.upgrade() {
            inner.lease_returned(&self.resident);
        }
    }
}

impl<R: ResidentResource> std::fmt::Debug for Lease<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("device", &self.device())
            .field("episode", &self.episode())
            .finish_non_exhaustive()
    }
}
