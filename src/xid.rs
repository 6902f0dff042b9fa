//! Transaction ID holder.
//!
//! Exactly one xid is current at a time. Replies carrying any other value
//! belong to a superseded exchange and are dropped by the client.

use std::sync::atomic::{AtomicU32, Ordering};

/// The current DHCP transaction ID.
///
/// Backed by a single atomic word, so generate/read/set never tear.
#[derive(Debug)]
pub struct TransactionId {
    current: AtomicU32,
}

impl TransactionId {
    /// Creates a holder seeded with a random xid.
    pub fn new() -> Self {
        Self {
            current: AtomicU32::new(rand::random()),
        }
    }

    /// Generates a fresh random xid, makes it current and returns it.
    pub fn generate(&self) -> u32 {
        let xid = rand::random();
        self.current.store(xid, Ordering::SeqCst);
        xid
    }

    pub fn current(&self) -> u32 {
        self.current.load(Ordering::SeqCst)
    }

    pub fn set(&self, xid: u32) {
        self.current.store(xid, Ordering::SeqCst);
    }

    /// Returns true if `xid` matches the current transaction.
    pub fn matches(&self, xid: u32) -> bool {
        self.current() == xid
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_set_and_current() {
        let xid = TransactionId::new();
        xid.set(0xDEADBEEF);
        assert_eq!(xid.current(), 0xDEADBEEF);
        assert!(xid.matches(0xDEADBEEF));
        assert!(!xid.matches(0xDEADBEEE));
    }

    #[test]
    fn test_generate_becomes_current() {
        let xid = TransactionId::new();
        let generated = xid.generate();
        assert_eq!(xid.current(), generated);
    }

    #[test]
    fn test_generate_varies() {
        let xid = TransactionId::new();
        let values: std::collections::HashSet<u32> = (0..64).map(|_| xid.generate()).collect();
        assert!(values.len() > 1);
    }

    #[test]
    fn test_concurrent_generate_never_tears() {
        let xid = Arc::new(TransactionId::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let xid = Arc::clone(&xid);
                std::thread::spawn(move || {
                    (0..1000).map(|_| xid.generate()).collect::<Vec<u32>>()
                })
            })
            .collect();

        let mut generated = std::collections::HashSet::new();
        for handle in handles {
            generated.extend(handle.join().unwrap());
        }
        assert!(generated.contains(&xid.current()));
    }
}
