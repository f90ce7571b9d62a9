//! Application service: public NAT port allocation.
//!
//! Ports are claimed through `ProvisioningStore::reserve_port`, which is an
//! atomic set-insert, so two concurrent pipelines can never walk away with the
//! same port.

use std::sync::Arc;

use anyhow::Result;
use rand::Rng;

use crate::application::ports::ProvisioningStore;
use crate::domain::error::ProvisionError;

pub struct PortAllocator {
    store: Arc<dyn ProvisioningStore>,
    min: u16,
    max: u16,
    random_attempts: u32,
}

impl PortAllocator {
    #[must_use]
    pub fn new(
        store: Arc<dyn ProvisioningStore>,
        min: u16,
        max: u16,
        random_attempts: u32,
    ) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            store,
            min,
            max,
            random_attempts,
        }
    }

    /// Claim one unused port in `[min, max]`.
    ///
    /// Random probes first, then a linear scan so a nearly-full range still
    /// finds its last free ports.
    ///
    /// # Errors
    ///
    /// Returns `ProvisionError::ResourceExhausted` when every port is taken,
    /// or the store error if a reservation cannot be attempted.
    pub async fn allocate_unique(&self) -> Result<u16> {
        for _ in 0..self.random_attempts {
            let candidate = rand::thread_rng().gen_range(self.min..=self.max);
            if self.store.reserve_port(candidate).await? {
                return Ok(candidate);
            }
        }
        for candidate in self.min..=self.max {
            if self.store.reserve_port(candidate).await? {
                return Ok(candidate);
            }
        }
        Err(ProvisionError::ResourceExhausted {
            min: self.min,
            max: self.max,
        }
        .into())
    }

    /// Claim an `(rdp, winrm)` pair. If the second claim fails the first is
    /// returned to the pool.
    ///
    /// # Errors
    ///
    /// See [`PortAllocator::allocate_unique`].
    pub async fn allocate_pair(&self) -> Result<(u16, u16)> {
        let rdp = self.allocate_unique().await?;
        match self.allocate_unique().await {
            Ok(winrm) => Ok((rdp, winrm)),
            Err(e) => {
                self.release(rdp).await;
                Err(e)
            }
        }
    }

    /// Return a port to the pool. Failures are logged, not raised.
    pub async fn release(&self, port: u16) {
        if let Err(e) = self.store.release_port(port).await {
            tracing::warn!(port, error = %e, "failed to release port");
        }
    }
}
