//! Notifications published by the client state machine.
//!
//! Events are fire-and-forget. The client pushes them into an unbounded
//! channel and whoever holds the receiver republishes them.

use std::fmt;
use std::net::Ipv4Addr;

use serde::Serialize;
use tokio::sync::mpsc;

/// Sending half handed to the client.
pub type EventSink = mpsc::UnboundedSender<ClientEvent>;

/// Receiving half kept by the control surface.
pub type EventStream = mpsc::UnboundedReceiver<ClientEvent>;

/// Creates a connected sink/stream pair.
pub fn channel() -> (EventSink, EventStream) {
    mpsc::unbounded_channel()
}

/// One outcome of the DHCP exchange.
///
/// DNS lists are carried as a single space separated string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    DiscoverSent,
    OfferReceived {
        ip: Ipv4Addr,
        server: Ipv4Addr,
    },
    RequestSent,
    RenewSent,
    ReleaseSent {
        ip: Ipv4Addr,
    },
    AckReceived {
        ip: Ipv4Addr,
        netmask: Option<Ipv4Addr>,
        gateway: Option<Ipv4Addr>,
        dns: String,
        server: Ipv4Addr,
        lease_duration: u32,
    },
    IpConfigApplied {
        interface: String,
        ip: Ipv4Addr,
        netmask: Option<Ipv4Addr>,
        gateway: Option<Ipv4Addr>,
        lease_duration: u32,
        dns: String,
        server: Ipv4Addr,
    },
    DnsReceived {
        dns: String,
    },
    LeaseLost,
}

fn or_none(address: &Option<Ipv4Addr>) -> String {
    address
        .map(|address| address.to_string())
        .unwrap_or_else(|| "none".to_string())
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::DiscoverSent => write!(f, "DISCOVER sent"),
            ClientEvent::OfferReceived { ip, server } => {
                write!(f, "OFFER of {} from {}", ip, server)
            }
            ClientEvent::RequestSent => write!(f, "REQUEST sent"),
            ClientEvent::RenewSent => write!(f, "renewal REQUEST sent"),
            ClientEvent::ReleaseSent { ip } => write!(f, "RELEASE of {} sent", ip),
            ClientEvent::AckReceived {
                ip,
                netmask,
                gateway,
                dns,
                server,
                lease_duration,
            } => write!(
                f,
                "ACK from {}: {} mask {} gateway {} dns [{}] for {}s",
                server,
                ip,
                or_none(netmask),
                or_none(gateway),
                dns,
                lease_duration
            ),
            ClientEvent::IpConfigApplied { interface, ip, .. } => {
                write!(f, "applied {} to {}", ip, interface)
            }
            ClientEvent::DnsReceived { dns } => write!(f, "DNS servers [{}]", dns),
            ClientEvent::LeaseLost => write!(f, "lease lost"),
        }
    }
}
