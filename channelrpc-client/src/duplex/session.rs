//! Leases on duplex connections.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::pool::ConnectionFingerprint;

/// Counts the duplex connections currently reserved by open sessions.
#[derive(Clone, Debug, Default)]
pub struct SessionRegistry {
    active: Arc<AtomicUsize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a connection for one session.
    pub fn lease(&self, fingerprint: ConnectionFingerprint) -> ConnectionLease {
        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(?fingerprint, active, "duplex connection leased");
        ConnectionLease {
            active: Arc::clone(&self.active),
            fingerprint,
            released: AtomicBool::new(false),
        }
    }

    /// Sessions holding a lease right now.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// A reserved duplex connection. Returned exactly once.
#[derive(Debug)]
pub struct ConnectionLease {
    active: Arc<AtomicUsize>,
    fingerprint: ConnectionFingerprint,
    released: AtomicBool,
}

impl ConnectionLease {
    fn give_back(&self, forced: bool) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        let active = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        tracing::debug!(
            fingerprint = ?self.fingerprint,
            active,
            forced,
            "duplex connection released"
        );
        true
    }

    /// Return the connection after both halves closed. Only the first call
    /// has an effect; returns whether this call released it.
    pub fn release(&self) -> bool {
        self.give_back(false)
    }

    /// Force the connection back without a graceful shutdown.
    pub fn abort(&self) {
        self.give_back(true);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn fingerprint(&self) -> &ConnectionFingerprint {
        &self.fingerprint
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.give_back(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FingerprintInputs;
    use channelrpc_core::SharedMruCache;

    fn fingerprint() -> ConnectionFingerprint {
        let cache = SharedMruCache::new(4);
        ConnectionFingerprint::compute(
            &FingerprintInputs {
                duplex: true,
                ..Default::default()
            },
            &cache,
        )
    }

    #[test]
    fn test_release_is_counted_once() {
        let registry = SessionRegistry::new();
        let lease = registry.lease(fingerprint());
        let other = registry.lease(fingerprint());
        assert_eq!(registry.active(), 2);

        assert!(lease.release());
        assert!(!lease.release());
        lease.abort();
        assert_eq!(registry.active(), 1);

        drop(other);
        assert_eq!(registry.active(), 0);
        drop(lease);
        assert_eq!(registry.active(), 0);
    }
}
