//! Lease record and its guarded state.
//!
//! The client holds at most one lease. [`LeaseState`] wraps it in a
//! [`RwLock`] so that every multi-field read (address, validity and server
//! together) and every update happens inside one critical section. The
//! receive path and timer-fired actions share the same handle.

use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Lease duration meaning "never expires" (RFC 2132 §9.2).
pub const INFINITE_LEASE: u32 = u32::MAX;

/// A lease granted by a DHCP server, or the empty "no lease" record.
///
/// When `valid` is false the address-bearing fields may still hold stale
/// values but must not be used for renewal or interface configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Address assigned to this client (`yiaddr` of the ACK).
    pub address: Ipv4Addr,

    /// Subnet mask (Option 1), if the server sent one.
    pub netmask: Option<Ipv4Addr>,

    /// First router listed in Option 3.
    pub gateway: Option<Ipv4Addr>,

    /// DNS servers (Option 6) in server order.
    pub dns_servers: Vec<Ipv4Addr>,

    /// Lease duration in seconds (Option 51).
    pub lease_duration: u32,

    /// Server that granted the lease (Option 54).
    pub server_id: Ipv4Addr,

    pub valid: bool,

    /// When the ACK binding this lease was processed.
    pub obtained_at: Option<DateTime<Utc>>,
}

impl Default for Lease {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED,
            netmask: None,
            gateway: None,
            dns_servers: Vec::new(),
            lease_duration: 0,
            server_id: Ipv4Addr::UNSPECIFIED,
            valid: false,
            obtained_at: None,
        }
    }
}

impl Lease {
    /// Returns true for a lease that never expires.
    pub fn is_infinite(&self) -> bool {
        self.lease_duration == INFINITE_LEASE
    }

    /// When the lease runs out, or `None` for unbound or infinite leases.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.is_infinite() {
            return None;
        }
        self.obtained_at
            .map(|obtained| obtained + TimeDelta::seconds(self.lease_duration as i64))
    }

    /// Returns seconds remaining until expiration, or 0 if expired or unbound.
    pub fn remaining_seconds(&self) -> i64 {
        if !self.valid {
            return 0;
        }
        if self.is_infinite() {
            return i64::MAX;
        }
        self.expires_at()
            .map(|expires| (expires - Utc::now()).num_seconds().max(0))
            .unwrap_or(0)
    }

    /// CIDR prefix length of the netmask, `/32` when no mask was given.
    pub fn prefix_len(&self) -> u32 {
        self.netmask
            .map(|mask| u32::from(mask).leading_ones())
            .unwrap_or(32)
    }

    /// DNS servers as a single space separated string.
    pub fn dns_space_separated(&self) -> String {
        join_addresses(&self.dns_servers)
    }
}

/// Joins addresses with single spaces, the form carried by client events.
pub fn join_addresses(addresses: &[Ipv4Addr]) -> String {
    addresses
        .iter()
        .map(|address| address.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Shared, lock-guarded lease record.
///
/// Cloning yields another handle to the same record.
#[derive(Debug, Clone, Default)]
pub struct LeaseState {
    inner: Arc<RwLock<Lease>>,
}

impl LeaseState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a consistent copy of the whole record.
    pub async fn snapshot(&self) -> Lease {
        self.inner.read().await.clone()
    }

    /// Returns the held address if, and only if, the lease is valid.
    pub async fn renewal_address(&self) -> Option<Ipv4Addr> {
        let lease = self.inner.read().await;
        lease.valid.then_some(lease.address)
    }

    /// Replaces the record with a freshly bound lease.
    ///
    /// Marks it valid and stamps `obtained_at`.
    pub async fn bind(&self, mut lease: Lease) -> Lease {
        lease.valid = true;
        lease.obtained_at = Some(Utc::now());
        let mut current = self.inner.write().await;
        *current = lease.clone();
        lease
    }

    /// Atomically takes the lease if it is valid, leaving the empty record.
    ///
    /// Returns `None` (and leaves the record untouched) when no valid lease
    /// is held.
    pub async fn take_valid(&self) -> Option<Lease> {
        let mut current = self.inner.write().await;
        if !current.valid {
            return None;
        }
        Some(std::mem::take(&mut *current))
    }

    /// Resets the record to empty/invalid.
    pub async fn reset(&self) {
        *self.inner.write().await = Lease::default();
    }
}
