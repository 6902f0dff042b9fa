//! # dhcpclaim
//!
//! A DHCP client library and daemon implementing the client side of
//! RFC 2131 (DHCP) and RFC 2132 (DHCP Options).
//!
//! ## Features
//!
//! - DISCOVER, OFFER, REQUEST, ACK, NAK and RELEASE exchanges
//! - Transaction ID correlation, stale replies dropped
//! - Timer-driven renewal and lease expiry
//! - Optional configuration of the interface with the granted lease
//! - Text command vocabulary and JSON event stream for external controllers
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use dhcpclaim::{ClientSettings, Config, DhcpClient, SystemInterface, UdpTransport};
//!
//! #[tokio::main]
//! async fn main() -> dhcpclaim::Result<()> {
//!     let config = Config::load_or_create("dhcpclaim.json")?;
//!     let hwaddr = dhcpclaim::interface::resolve_hardware_address(&config).await?;
//!     let (events, _stream) = dhcpclaim::event::channel();
//!     let client = DhcpClient::new(
//!         ClientSettings::from_config(&config, hwaddr),
//!         UdpTransport::bind(&config)?,
//!         SystemInterface::new(&config.interface),
//!         events,
//!     );
//!     client.start_discovery(None, false).await?;
//!     client.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`DhcpPacket`] / [`DhcpOption`] - DHCP wire codec
//! - [`TransactionId`] - the current xid
//! - [`LeaseState`] - lock-guarded lease record
//! - [`TimerScheduler`] - renew and release timers
//! - [`DhcpClient`] - the state machine
//! - [`ControlSurface`] - command vocabulary mapped onto the client
//! - [`Transport`] / [`InterfaceConfigurator`] - network and OS boundaries

pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod interface;
pub mod lease;
pub mod options;
pub mod packet;
pub mod timer;
pub mod transport;
pub mod xid;

pub use client::{ClientSettings, ClientState, DhcpClient};
pub use config::Config;
pub use control::{Command, ControlSurface, Response};
pub use error::{Error, Result};
pub use event::ClientEvent;
pub use interface::{InterfaceConfigurator, SystemInterface};
pub use lease::{Lease, LeaseState};
pub use options::{DhcpOption, MessageType};
pub use packet::DhcpPacket;
pub use timer::{TimerKind, TimerScheduler};
pub use transport::{Transport, UdpTransport};
pub use xid::TransactionId;
