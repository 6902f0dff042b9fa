//! The DHCP client state machine.
//!
//! [`DhcpClient`] owns the transaction ID, the lease record, the renew and
//! release timers and the event sink. Replies from the receive loop and
//! timer-fired actions all go through the same instance, which is shared
//! behind an [`Arc`].
//!
//! # Exchange Flow
//!
//! ```text
//! IDLE --DISCOVER--> DISCOVERING --OFFER/REQUEST--> REQUESTING --ACK--> BOUND
//!                                                       |                |
//!                                                      NAK          renew timer
//!                                                       v                v
//!                                                     IDLE <--NAK-- RENEWING --ACK--> BOUND
//! ```
//!
//! Release (explicit, timer-driven or on shutdown) returns to IDLE from any
//! state.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{ClientEvent, EventSink};
use crate::interface::InterfaceConfigurator;
use crate::lease::{Lease, LeaseState, join_addresses};
use crate::options::{DhcpOption, MessageType};
use crate::packet::{DhcpPacket, format_hwaddr};
use crate::timer::{TimerAction, TimerKind, TimerScheduler};
use crate::transport::{RECV_BUFFER_SIZE, Transport, broadcast};
use crate::xid::TransactionId;

/// Shortest delay between two renewal REQUESTs (RFC 2131 §4.4.5).
const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(60);

/// Pause after a failed receive before the socket is polled again.
const RECV_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Idle,
    Discovering,
    Requesting,
    Bound,
    Renewing,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientState::Idle => write!(f, "IDLE"),
            ClientState::Discovering => write!(f, "DISCOVERING"),
            ClientState::Requesting => write!(f, "REQUESTING"),
            ClientState::Bound => write!(f, "BOUND"),
            ClientState::Renewing => write!(f, "RENEWING"),
        }
    }
}

/// Per-instance settings the state machine needs from [`Config`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub hardware_address: [u8; 6],
    pub server_port: u16,
    pub apply_ip: bool,
    pub dump_packets: bool,
    /// Default parameter request list, used when discovery is started
    /// without an explicit one.
    pub parameter_request_list: Vec<u8>,
}

impl ClientSettings {
    pub fn from_config(config: &Config, hardware_address: [u8; 6]) -> Self {
        Self {
            hardware_address,
            server_port: config.server_port,
            apply_ip: config.apply_ip,
            dump_packets: config.dump_packets,
            parameter_request_list: config.parameter_request_list.clone(),
        }
    }
}

#[derive(Debug)]
struct Session {
    state: ClientState,
    request_outstanding: bool,
    parameter_list: Vec<u8>,
    /// Current renewal window. Zero means no renewal cadence is running.
    renew_window: Duration,
}

pub struct DhcpClient<T, C> {
    me: Weak<Self>,
    transport: T,
    interface: C,
    settings: ClientSettings,
    xid: TransactionId,
    lease: LeaseState,
    timers: TimerScheduler,
    session: Mutex<Session>,
    events: EventSink,
    shutdown: watch::Sender<bool>,
}

impl<T: Transport, C: InterfaceConfigurator> DhcpClient<T, C> {
    pub fn new(settings: ClientSettings, transport: T, interface: C, events: EventSink) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let session = Session {
            state: ClientState::Idle,
            request_outstanding: false,
            parameter_list: settings.parameter_request_list.clone(),
            renew_window: Duration::ZERO,
        };

        info!(
            "DHCP client for {} ({})",
            interface.name(),
            format_hwaddr(&settings.hardware_address)
        );

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            transport,
            interface,
            settings,
            xid: TransactionId::new(),
            lease: LeaseState::new(),
            timers: TimerScheduler::new(),
            session: Mutex::new(session),
            events,
            shutdown,
        })
    }

    /// Sends a DISCOVER and waits for offers.
    ///
    /// With `release_first`, any held lease is released beforehand. The
    /// parameter list (given, or the configured default) is remembered for
    /// the REQUESTs that follow.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SendFailure`] if the DISCOVER could not be sent.
    /// Nothing is retried.
    pub async fn start_discovery(
        &self,
        parameter_list: Option<Vec<u8>>,
        release_first: bool,
    ) -> Result<()> {
        if release_first && let Err(error) = self.send_release(None, true).await {
            warn!("Release before discovery failed: {}", error);
        }

        let params =
            parameter_list.unwrap_or_else(|| self.settings.parameter_request_list.clone());
        let xid = self.xid.generate();

        let previous = {
            let mut session = self.session.lock().await;
            session.parameter_list = params.clone();
            std::mem::replace(&mut session.state, ClientState::Discovering)
        };

        let discover = DhcpPacket::client_message(
            MessageType::Discover,
            xid,
            &self.settings.hardware_address,
            Ipv4Addr::UNSPECIFIED,
            vec![DhcpOption::ParameterRequestList(params)],
        );

        info!("Sending DISCOVER (xid {:#010x})", xid);
        if let Err(error) = self.transmit(&discover, self.broadcast()).await {
            self.session.lock().await.state = previous;
            return Err(error);
        }

        self.emit(ClientEvent::DiscoverSent);
        Ok(())
    }

    /// Checks a decoded reply against the current exchange and dispatches it.
    ///
    /// Requests and replies addressed to another hardware address are
    /// ignored. Only OFFER, ACK and NAK are acted upon.
    ///
    /// # Errors
    ///
    /// - [`Error::StaleTransaction`] if the xid is not the current one. No
    ///   state has been touched.
    /// - [`Error::Nack`] if the server refused the request.
    /// - [`Error::MalformedPacket`] if a reply lacks a field the client needs.
    /// - [`Error::SendFailure`] if the REQUEST following an OFFER failed.
    pub async fn handle_packet(&self, packet: &DhcpPacket) -> Result<()> {
        if self.is_shut_down() {
            debug!("Client shut down, dropping packet");
            return Ok(());
        }

        if !packet.is_reply() {
            debug!("Ignoring BOOTREQUEST from {}", packet.format_mac());
            return Ok(());
        }

        if packet.chaddr_bytes() != self.settings.hardware_address.as_slice() {
            debug!("Ignoring reply addressed to {}", packet.format_mac());
            return Ok(());
        }

        if !self.xid.matches(packet.xid) {
            return Err(Error::StaleTransaction {
                expected: self.xid.current(),
                received: packet.xid,
            });
        }

        match packet.message_type() {
            Some(MessageType::Offer) => self.on_offer(packet).await,
            Some(MessageType::Ack) => self.on_ack(packet).await,
            Some(MessageType::Nak) => self.on_nack(packet).await,
            Some(other) => {
                debug!("Ignoring unexpected {} message", other);
                Ok(())
            }
            None => {
                debug!("Ignoring BOOTP reply without a DHCP message type");
                Ok(())
            }
        }
    }

    /// Accepts the first OFFER received while discovering and requests it.
    pub async fn on_offer(&self, packet: &DhcpPacket) -> Result<()> {
        let state = self.state().await;
        if state != ClientState::Discovering {
            debug!("Ignoring OFFER received while {}", state);
            return Ok(());
        }

        let offered = packet.yiaddr;
        if offered.is_unspecified() {
            return Err(Error::MalformedPacket(
                "OFFER without an offered address".to_string(),
            ));
        }
        let server = packet.server_identifier().unwrap_or(packet.siaddr);

        info!("Received OFFER of {} from {}", offered, server);
        self.emit(ClientEvent::OfferReceived {
            ip: offered,
            server,
        });

        self.send_request(offered, server, None).await
    }

    /// Sends a REQUEST for `requested_ip` under the current xid.
    ///
    /// Broadcast unless `destination` is given.
    pub async fn send_request(
        &self,
        requested_ip: Ipv4Addr,
        server_id: Ipv4Addr,
        destination: Option<SocketAddrV4>,
    ) -> Result<()> {
        let xid = self.xid.current();

        let (previous_state, previous_outstanding, params) = {
            let mut session = self.session.lock().await;
            let previous_state = std::mem::replace(&mut session.state, ClientState::Requesting);
            let previous_outstanding = std::mem::replace(&mut session.request_outstanding, true);
            (
                previous_state,
                previous_outstanding,
                session.parameter_list.clone(),
            )
        };

        let request = DhcpPacket::client_message(
            MessageType::Request,
            xid,
            &self.settings.hardware_address,
            Ipv4Addr::UNSPECIFIED,
            vec![
                DhcpOption::RequestedIpAddress(requested_ip),
                DhcpOption::ServerIdentifier(server_id),
                DhcpOption::ParameterRequestList(params),
            ],
        );

        info!(
            "Sending REQUEST for {} to server {} (xid {:#010x})",
            requested_ip, server_id, xid
        );
        let destination = destination.unwrap_or_else(|| self.broadcast());
        if let Err(error) = self.transmit(&request, destination).await {
            let mut session = self.session.lock().await;
            session.state = previous_state;
            session.request_outstanding = previous_outstanding;
            return Err(error);
        }

        self.emit(ClientEvent::RequestSent);
        Ok(())
    }

    /// Sends a renewal REQUEST for the held lease under a fresh xid.
    ///
    /// Without `ciaddr`, the address is read from the lease record. While a
    /// renewal cadence is running, the next renewal is re-armed at half the
    /// current window.
    ///
    /// # Errors
    ///
    /// - [`Error::RenewOnInvalidLease`] if no `ciaddr` is given and no valid
    ///   lease is held. Nothing is sent and the lease is untouched.
    /// - [`Error::SendFailure`] if the REQUEST could not be sent.
    pub async fn send_renew(
        &self,
        ciaddr: Option<Ipv4Addr>,
        destination: Option<SocketAddrV4>,
    ) -> Result<()> {
        self.timers.cancel(TimerKind::Renew).await;

        let ciaddr = match ciaddr {
            Some(address) => address,
            None => self
                .lease
                .renewal_address()
                .await
                .ok_or(Error::RenewOnInvalidLease)?,
        };

        // Held until the next renewal is armed, so a reply to this REQUEST
        // is bound only afterwards and its timers win.
        let mut session = self.session.lock().await;

        let xid = self.xid.generate();
        let previous_state = std::mem::replace(&mut session.state, ClientState::Renewing);
        let previous_outstanding = std::mem::replace(&mut session.request_outstanding, true);

        let renew = DhcpPacket::client_message(
            MessageType::Request,
            xid,
            &self.settings.hardware_address,
            ciaddr,
            vec![DhcpOption::ParameterRequestList(session.parameter_list.clone())],
        );

        info!("Sending REQUEST to renew {} (xid {:#010x})", ciaddr, xid);
        let destination = destination.unwrap_or_else(|| self.broadcast());
        if let Err(error) = self.transmit(&renew, destination).await {
            session.state = previous_state;
            session.request_outstanding = previous_outstanding;
            return Err(error);
        }

        self.emit(ClientEvent::RenewSent);

        if !session.renew_window.is_zero() {
            let delay = (session.renew_window / 2).max(MIN_RENEW_INTERVAL);
            session.renew_window = delay;
            self.timers
                .arm(TimerKind::Renew, delay, self.renew_action())
                .await;
        }

        Ok(())
    }

    /// Releases the held lease, if any, and stops all timers.
    ///
    /// The lease record is cleared before `LeaseLost` is emitted and before
    /// the RELEASE goes out. Calling this without a valid lease only cancels
    /// the timers (and resets the interface when asked to); an exchange in
    /// progress carries on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SendFailure`] if the RELEASE could not be sent. The
    /// lease stays cleared.
    pub async fn send_release(
        &self,
        ciaddr: Option<Ipv4Addr>,
        unconfigure_interface: bool,
    ) -> Result<()> {
        self.timers.cancel_all().await;

        let result = match self.lease.take_valid().await {
            Some(lease) => {
                {
                    let mut session = self.session.lock().await;
                    session.state = ClientState::Idle;
                    session.request_outstanding = false;
                    session.renew_window = Duration::ZERO;
                }
                self.release_lease(lease, ciaddr).await
            }
            None => {
                debug!("No lease held, nothing to release");
                Ok(())
            }
        };

        if unconfigure_interface && let Err(error) = self.interface.reset().await {
            warn!(
                "Failed to unconfigure {}: {}",
                self.interface.name(),
                error
            );
        }

        result
    }

    async fn release_lease(&self, lease: Lease, ciaddr: Option<Ipv4Addr>) -> Result<()> {
        let address = ciaddr.unwrap_or(lease.address);
        let xid = self.xid.generate();

        let mut options = Vec::new();
        if !lease.server_id.is_unspecified() {
            options.push(DhcpOption::ServerIdentifier(lease.server_id));
        }

        let release = DhcpPacket::client_message(
            MessageType::Release,
            xid,
            &self.settings.hardware_address,
            address,
            options,
        );

        self.emit(ClientEvent::LeaseLost);

        info!(
            "Sending RELEASE of {} to server {} (xid {:#010x})",
            address, lease.server_id, xid
        );
        self.transmit(&release, self.broadcast()).await?;

        self.emit(ClientEvent::ReleaseSent { ip: address });
        Ok(())
    }

    /// Binds the lease carried by an ACK and re-arms both timers.
    ///
    /// An ACK with no request outstanding is still accepted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedPacket`] if the ACK lacks an address or a
    /// lease time. Nothing is changed in that case.
    pub async fn on_ack(&self, packet: &DhcpPacket) -> Result<()> {
        let lease_duration = packet.lease_time().ok_or_else(|| {
            Error::MalformedPacket("ACK without a lease time".to_string())
        })?;
        if packet.yiaddr.is_unspecified() {
            return Err(Error::MalformedPacket(
                "ACK without an assigned address".to_string(),
            ));
        }

        let lease = Lease {
            address: packet.yiaddr,
            netmask: packet.subnet_mask(),
            gateway: packet.routers().and_then(|routers| routers.first().copied()),
            dns_servers: packet.dns_servers().map(<[_]>::to_vec).unwrap_or_default(),
            lease_duration,
            server_id: packet.server_identifier().unwrap_or(packet.siaddr),
            ..Default::default()
        };

        {
            let mut session = self.session.lock().await;
            if !session.request_outstanding {
                info!("Received an ACK without an outstanding REQUEST");
            }
            session.request_outstanding = false;
            session.state = ClientState::Bound;
            session.renew_window = Duration::from_secs(u64::from(lease_duration)) / 5;
        }

        let lease = self.lease.bind(lease).await;

        self.timers.cancel_all().await;
        if lease.is_infinite() {
            info!("Lease on {} is infinite, no renewal scheduled", lease.address);
            self.session.lock().await.renew_window = Duration::ZERO;
        } else {
            let duration = Duration::from_secs(u64::from(lease_duration));
            self.timers
                .arm(TimerKind::Renew, duration / 2, self.renew_action())
                .await;
            self.timers
                .arm(TimerKind::Release, duration, self.release_action())
                .await;
        }

        info!(
            "Bound {}/{} from {} for {}s",
            lease.address,
            lease.prefix_len(),
            lease.server_id,
            lease.lease_duration
        );
        if let Some(domain) = packet.domain_name() {
            info!("Server assigned domain {}", domain);
        }

        let dns = lease.dns_space_separated();
        self.emit(ClientEvent::AckReceived {
            ip: lease.address,
            netmask: lease.netmask,
            gateway: lease.gateway,
            dns: dns.clone(),
            server: lease.server_id,
            lease_duration,
        });

        if self.settings.apply_ip {
            match self.interface.apply(&lease).await {
                Ok(()) => {
                    self.emit(ClientEvent::IpConfigApplied {
                        interface: self.interface.name().to_string(),
                        ip: lease.address,
                        netmask: lease.netmask,
                        gateway: lease.gateway,
                        lease_duration,
                        dns: dns.clone(),
                        server: lease.server_id,
                    });
                    self.emit(ClientEvent::DnsReceived { dns });
                }
                Err(error) => error!(
                    "Failed to apply {} to {}: {}",
                    lease.address,
                    self.interface.name(),
                    error
                ),
            }
        }

        Ok(())
    }

    /// Drops the lease after the server refused our REQUEST.
    ///
    /// A NAK arriving with no request outstanding is treated as stale and
    /// dropped without changing anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Nack`] once the lease has been cleared.
    pub async fn on_nack(&self, packet: &DhcpPacket) -> Result<()> {
        let server = packet.server_identifier().unwrap_or(packet.siaddr);

        {
            let mut session = self.session.lock().await;
            if !session.request_outstanding {
                debug!("Dropping NAK from {} with no outstanding REQUEST", server);
                return Ok(());
            }
            session.request_outstanding = false;
            session.state = ClientState::Idle;
            session.renew_window = Duration::ZERO;
        }

        self.timers.cancel_all().await;
        self.lease.reset().await;
        self.emit(ClientEvent::LeaseLost);

        Err(Error::Nack { server })
    }

    /// Stops renew and release traffic but keeps the last known lease.
    pub async fn freeze_renewal(&self) {
        self.timers.cancel_all().await;
        self.session.lock().await.renew_window = Duration::ZERO;
        info!("Renewal frozen, keeping the last known lease");
    }

    /// Releases any held lease, unconfigures the interface and stops the
    /// receive loop.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down DHCP client");
        let result = self.send_release(None, true).await;
        self.timers.cancel_all().await;
        self.shutdown.send_replace(true);
        result
    }

    /// Receives and handles replies until [`shutdown`](Self::shutdown).
    ///
    /// Malformed, stale and refused replies are logged and the loop keeps
    /// running. A failed receive is retried after a short pause.
    pub async fn run(&self) -> Result<()> {
        let mut stop = self.shutdown.subscribe();
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!("DHCP client listening for replies");

        loop {
            if *stop.borrow_and_update() {
                break;
            }

            let received = tokio::select! {
                _ = stop.changed() => continue,
                received = self.transport.recv(&mut buffer) => received,
            };

            match received {
                Ok((size, source)) => self.process_datagram(&buffer[..size], source).await,
                Err(error) => {
                    error!("Error receiving packet: {}", error);
                    tokio::select! {
                        _ = stop.changed() => {}
                        _ = tokio::time::sleep(RECV_RETRY_DELAY) => {}
                    }
                }
            }
        }

        info!("DHCP client stopped");
        Ok(())
    }

    async fn process_datagram(&self, data: &[u8], source: SocketAddr) {
        let packet = match DhcpPacket::parse(data) {
            Ok(packet) => packet,
            Err(error) => {
                warn!("Dropping packet from {}: {}", source, error);
                return;
            }
        };

        if self.settings.dump_packets {
            info!("Received packet from {}: {:#?}", source, packet);
        } else {
            debug!(
                "Received {} from {}",
                packet
                    .message_type()
                    .map(|kind| kind.to_string())
                    .unwrap_or_else(|| "BOOTP".to_string()),
                source
            );
        }

        match self.handle_packet(&packet).await {
            Ok(()) => {}
            Err(error @ Error::StaleTransaction { .. }) => debug!("Dropping reply: {}", error),
            Err(error @ Error::Nack { .. }) => warn!("{}", error),
            Err(error) => warn!("Error handling packet from {}: {}", source, error),
        }
    }

    fn renew_action(&self) -> TimerAction {
        let me = self.me.clone();
        Box::pin(async move {
            let Some(client) = me.upgrade() else {
                return;
            };
            match client.send_renew(None, None).await {
                Ok(()) => {}
                Err(Error::RenewOnInvalidLease) => {
                    debug!("Renew timer fired without a valid lease")
                }
                Err(error) => warn!("Scheduled renewal failed: {}", error),
            }
        })
    }

    fn release_action(&self) -> TimerAction {
        let me = self.me.clone();
        Box::pin(async move {
            let Some(client) = me.upgrade() else {
                return;
            };
            info!("Lease expired without renewal");
            if let Err(error) = client.send_release(None, true).await {
                warn!("Scheduled release failed: {}", error);
            }
        })
    }

    async fn transmit(&self, packet: &DhcpPacket, destination: SocketAddrV4) -> Result<()> {
        let data = packet.encode();
        match self.transport.send_to(&data, destination).await {
            Ok(0) => {
                warn!("Sent 0 bytes to {}", destination);
                Err(Error::SendFailure { destination })
            }
            Ok(size) => {
                debug!("Sent {} bytes to {}", size, destination);
                Ok(())
            }
            Err(error) => {
                warn!("Failed to send to {}: {}", destination, error);
                Err(Error::SendFailure { destination })
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        debug!("Event: {}", event);
        if self.events.send(event).is_err() {
            debug!("No event listener attached");
        }
    }

    fn broadcast(&self) -> SocketAddrV4 {
        broadcast(self.settings.server_port)
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn state(&self) -> ClientState {
        self.session.lock().await.state
    }

    pub async fn is_request_outstanding(&self) -> bool {
        self.session.lock().await.request_outstanding
    }

    /// Consistent copy of the lease record.
    pub async fn lease(&self) -> Lease {
        self.lease.snapshot().await
    }

    pub fn lease_state(&self) -> &LeaseState {
        &self.lease
    }

    pub fn timers(&self) -> &TimerScheduler {
        &self.timers
    }

    pub fn xid(&self) -> &TransactionId {
        &self.xid
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn interface(&self) -> &C {
        &self.interface
    }

    pub fn interface_name(&self) -> &str {
        self.interface.name()
    }

    pub fn hardware_address(&self) -> [u8; 6] {
        self.settings.hardware_address
    }

    /// DNS servers of the held lease, space separated.
    pub async fn dns_servers(&self) -> String {
        join_addresses(&self.lease.snapshot().await.dns_servers)
    }
}
