//! In-memory record table: one published address per service FQDN.
//!
//! The table is fed by the reconciliation loop and read by query handling.
//! Selection is sticky-lowest: the published address is kept for as long as
//! it stays in the healthy set, and otherwise fails over to the smallest
//! healthy address (plain string order).

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A point-in-time report of the healthy addresses of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEvent {
    /// Service name as configured.
    pub service: String,
    /// Addresses of currently healthy nodes, in any order. May be empty.
    pub addresses: Vec<String>,
}

impl AddressEvent {
    /// Build an event for `service`.
    pub fn new<I, S>(service: impl Into<String>, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            service: service.into(),
            addresses: addresses.into_iter().map(Into::into).collect(),
        }
    }
}

/// What [`RecordStore::reconcile`] did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// Empty address list; the previous selection (if any) stays published.
    NoAddresses,
    /// The current selection is still healthy and was kept.
    Kept,
    /// A new address was published.
    Selected(String),
}

/// Thread-safe FQDN -> address table.
#[derive(Debug, Clone)]
pub struct RecordStore {
    inner: Arc<RecordStoreInner>,
}

#[derive(Debug)]
struct RecordStoreInner {
    /// Normalised zone, without leading or trailing dots.
    zone: String,

    /// fqdn -> selected address
    records: RwLock<HashMap<String, String>>,
}

impl RecordStore {
    /// Create an empty store authoritative for `zone`.
    pub fn new(zone: &str) -> Self {
        Self {
            inner: Arc::new(RecordStoreInner {
                zone: crate::config::normalize_zone(zone),
                records: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Zone this store serves.
    pub fn zone(&self) -> &str {
        &self.inner.zone
    }

    /// Fully-qualified name for a service: `<service>.<zone>.`, lowercased.
    pub fn fqdn(&self, service: &str) -> String {
        format!("{}.{}.", service.to_ascii_lowercase(), self.inner.zone)
    }

    /// Currently published address for `fqdn`, if one was ever selected.
    ///
    /// `fqdn` is matched case-insensitively and must carry the trailing dot.
    pub fn lookup(&self, fqdn: &str) -> Option<String> {
        let records = self.inner.records.read();
        match records.get(fqdn) {
            Some(address) => Some(address.clone()),
            None if fqdn.bytes().any(|b| b.is_ascii_uppercase()) => {
                records.get(&fqdn.to_ascii_lowercase()).cloned()
            }
            None => None,
        }
    }

    /// Apply one address report for `service`.
    pub fn reconcile(&self, service: &str, mut addresses: Vec<String>) -> Reconciled {
        if addresses.is_empty() {
            return Reconciled::NoAddresses;
        }

        addresses.sort_unstable();

        let fqdn = self.fqdn(service);
        let records = self.inner.records.upgradable_read();

        if let Some(current) = records.get(&fqdn) {
            if addresses.binary_search(current).is_ok() {
                debug!(service, address = %current, "current record still healthy");
                return Reconciled::Kept;
            }
        }

        let selected = addresses.swap_remove(0);
        info!(service, address = %selected, "Updating service map record");

        let mut records = RwLockUpgradableReadGuard::upgrade(records);
        records.insert(fqdn, selected.clone());

        Reconciled::Selected(selected)
    }

    /// Number of published records.
    pub fn len(&self) -> usize {
        self.inner.records.read().len()
    }

    /// True if nothing has been published yet.
    pub fn is_empty(&self) -> bool {
        self.inner.records.read().is_empty()
    }
}
