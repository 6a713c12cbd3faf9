//! Address-scoped serialization
//!
//! Every read-modify-write of an address's rule set runs while holding an
//! [`AddressScope`] for that address. The scope owns its guards, so it is
//! released on drop whatever path the operation leaves by.

use super::error::{Error, Result};
use super::rule::AddressId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

/// Registry of per-address async mutexes
#[derive(Debug, Default)]
pub struct AddressLocks {
    locks: Mutex<HashMap<AddressId, Arc<AsyncMutex<()>>>>,
}

impl AddressLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, address: AddressId) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Entries nobody holds or waits on can be dropped; the map lock keeps
        // anyone from cloning them while we look.
        locks.retain(|addr, lock| *addr == address || Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(address).or_default())
    }

    /// Waits for exclusive access to one address.
    pub async fn scope(&self, address: AddressId) -> AddressScope {
        let guard = self.handle(address).lock_owned().await;
        trace!("Acquired scope for address {}", address);
        AddressScope {
            addresses: vec![address],
            _guards: vec![guard],
        }
    }

    /// Waits for exclusive access to several addresses.
    ///
    /// Addresses are locked in ascending order (duplicates removed) so two
    /// multi-address operations can never deadlock each other.
    pub async fn scope_all(&self, addresses: impl IntoIterator<Item = AddressId>) -> AddressScope {
        let mut addresses: Vec<AddressId> = addresses.into_iter().collect();
        addresses.sort_unstable();
        addresses.dedup();

        let mut guards = Vec::with_capacity(addresses.len());
        for address in &addresses {
            guards.push(self.handle(*address).lock_owned().await);
        }
        trace!("Acquired scope for {} addresses", addresses.len());
        AddressScope {
            addresses,
            _guards: guards,
        }
    }
}

/// Exclusive access to one or more addresses' rule sets
#[derive(Debug)]
pub struct AddressScope {
    addresses: Vec<AddressId>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl AddressScope {
    pub fn covers(&self, address: AddressId) -> bool {
        self.addresses.binary_search(&address).is_ok()
    }

    pub fn addresses(&self) -> &[AddressId] {
        &self.addresses
    }

    /// Fails with [`Error::Internal`] unless the scope covers `address`.
    pub fn ensure_covers(&self, address: AddressId) -> Result<()> {
        if self.covers(address) {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "address {address} is not held by the current scope"
            )))
        }
    }
}
