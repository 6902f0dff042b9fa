//! DHCP message codec (RFC 2131 §2).
//!
//! This module decodes server replies and builds the client's DISCOVER,
//! REQUEST and RELEASE messages. Every message is the BOOTP fixed header,
//! the DHCP magic cookie and a TLV option list closed by an End tag:
//!
//! ```text
//! offset  size  field
//!      0     1  op       1 = BOOTREQUEST, 2 = BOOTREPLY
//!      1     1  htype    1 = Ethernet
//!      2     1  hlen     6 for Ethernet
//!      3     1  hops
//!      4     4  xid      big-endian
//!      8     2  secs
//!     10     2  flags    bit 15 = broadcast
//!     12     4  ciaddr
//!     16     4  yiaddr
//!     20     4  siaddr
//!     24     4  giaddr
//!     28    16  chaddr
//!     44    64  sname
//!    108   128  file
//!    236     4  cookie   99.130.83.99
//!    240     -  options
//! ```
//!
//! Option overloading (Option 52) is not interpreted: `sname` and `file`
//! travel as opaque bytes so that decoding and re-encoding is lossless.
//! Repeated instances of one option code are concatenated (RFC 3396), so a
//! decoded message holds each code at most once.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::options::{DhcpOption, MessageType, OptionCode};

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const CHADDR_OFFSET: usize = 28;
const SNAME_OFFSET: usize = 44;
const FILE_OFFSET: usize = 108;
const COOKIE_OFFSET: usize = 236;
const OPTIONS_OFFSET: usize = 240;

/// Replies are padded to this size for BOOTP relay compatibility.
const MIN_MESSAGE_SIZE: usize = 300;

/// Relay loop guard; RFC 1542 recommends discarding above 16 hops.
const MAX_HOPS: u8 = 16;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

/// Flags bit asking servers to broadcast their reply.
pub const BROADCAST_FLAG: u16 = 0x8000;

/// One DHCP message, decoded or about to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    /// Correlates a reply with the request that caused it.
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    /// Client's own address, only filled in when renewing or releasing.
    pub ciaddr: Ipv4Addr,
    /// Address the server offers or assigns.
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    /// Hardware address, zero padded to 16 bytes.
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    /// Options in the order they appear on the wire.
    pub options: Vec<DhcpOption>,
}

fn field<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

fn address_at(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::from(field::<4>(data, offset))
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::MalformedPacket(reason.into())
}

impl DhcpPacket {
    /// Decodes a message received from the network.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedPacket`] when the buffer is shorter than the
    /// fixed header, the magic cookie is wrong, the hop count exceeds 16, an
    /// Ethernet header has `hlen != 6`, or an option is truncated or has an
    /// invalid length for its type.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < OPTIONS_OFFSET {
            return Err(malformed(format!(
                "{} bytes is shorter than the {} byte header",
                data.len(),
                OPTIONS_OFFSET
            )));
        }
        if data[COOKIE_OFFSET..OPTIONS_OFFSET] != MAGIC_COOKIE {
            return Err(malformed("Invalid magic cookie"));
        }

        let [op, htype, hlen, hops] = field::<4>(data, 0);
        if hops > MAX_HOPS {
            return Err(malformed(format!("Hop count {} exceeds {}", hops, MAX_HOPS)));
        }
        if htype == HTYPE_ETHERNET && hlen != HLEN_ETHERNET {
            return Err(malformed(format!("Ethernet header with hlen {}", hlen)));
        }

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid: u32::from_be_bytes(field(data, 4)),
            secs: u16::from_be_bytes(field(data, 8)),
            flags: u16::from_be_bytes(field(data, 10)),
            ciaddr: address_at(data, 12),
            yiaddr: address_at(data, 16),
            siaddr: address_at(data, 20),
            giaddr: address_at(data, 24),
            chaddr: field(data, CHADDR_OFFSET),
            sname: field(data, SNAME_OFFSET),
            file: field(data, FILE_OFFSET),
            options: parse_options(&data[OPTIONS_OFFSET..])?,
        })
    }

    /// Serializes the message, End-terminated and zero padded to 300 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_MESSAGE_SIZE * 2);

        out.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&self.secs.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        for address in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            out.extend_from_slice(&address.octets());
        }
        out.extend_from_slice(&self.chaddr);
        out.extend_from_slice(&self.sname);
        out.extend_from_slice(&self.file);
        out.extend_from_slice(&MAGIC_COOKIE);

        out.extend(self.options.iter().flat_map(DhcpOption::encode));
        out.push(OptionCode::End as u8);

        if out.len() < MIN_MESSAGE_SIZE {
            out.resize(MIN_MESSAGE_SIZE, 0);
        }
        out
    }

    /// Builds a message sent by this client.
    ///
    /// The broadcast flag is set, `chaddr` is `hwaddr` followed by ten zero
    /// bytes, and the option list starts with the Message Type and the
    /// Client Identifier (`0x01` followed by `hwaddr`) before `options`.
    pub fn client_message(
        message_type: MessageType,
        xid: u32,
        hwaddr: &[u8; 6],
        ciaddr: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Self {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(hwaddr);

        let client_id = std::iter::once(HTYPE_ETHERNET)
            .chain(hwaddr.iter().copied())
            .collect();

        let mut message_options = Vec::with_capacity(options.len() + 2);
        message_options.push(DhcpOption::MessageType(message_type));
        message_options.push(DhcpOption::ClientIdentifier(client_id));
        message_options.extend(options);

        Self {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid,
            secs: 0,
            flags: BROADCAST_FLAG,
            ciaddr,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0; 64],
            file: [0; 128],
            options: message_options,
        }
    }

    /// First option value `pick` accepts.
    fn find<'a, R>(&'a self, pick: impl Fn(&'a DhcpOption) -> Option<R>) -> Option<R> {
        self.options.iter().find_map(pick)
    }

    pub fn is_reply(&self) -> bool {
        self.op == BOOTREPLY
    }

    /// Option 53. `None` marks a plain BOOTP message.
    pub fn message_type(&self) -> Option<MessageType> {
        self.find(|option| match option {
            DhcpOption::MessageType(kind) => Some(*kind),
            _ => None,
        })
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.find(|option| match option {
            DhcpOption::RequestedIpAddress(address) => Some(*address),
            _ => None,
        })
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.find(|option| match option {
            DhcpOption::ServerIdentifier(address) => Some(*address),
            _ => None,
        })
    }

    pub fn client_identifier(&self) -> Option<&[u8]> {
        self.find(|option| match option {
            DhcpOption::ClientIdentifier(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.find(|option| match option {
            DhcpOption::ParameterRequestList(codes) => Some(codes.as_slice()),
            _ => None,
        })
    }

    /// Option 51, in seconds.
    pub fn lease_time(&self) -> Option<u32> {
        self.find(|option| match option {
            DhcpOption::LeaseTime(seconds) => Some(*seconds),
            _ => None,
        })
    }

    pub fn subnet_mask(&self) -> Option<Ipv4Addr> {
        self.find(|option| match option {
            DhcpOption::SubnetMask(mask) => Some(*mask),
            _ => None,
        })
    }

    pub fn routers(&self) -> Option<&[Ipv4Addr]> {
        self.find(|option| match option {
            DhcpOption::Router(routers) => Some(routers.as_slice()),
            _ => None,
        })
    }

    /// Option 6, in the order the server listed them.
    pub fn dns_servers(&self) -> Option<&[Ipv4Addr]> {
        self.find(|option| match option {
            DhcpOption::DnsServer(servers) => Some(servers.as_slice()),
            _ => None,
        })
    }

    pub fn domain_name(&self) -> Option<&str> {
        self.find(|option| match option {
            DhcpOption::DomainName(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// The meaningful prefix of `chaddr` (`hlen` bytes, at most 16).
    pub fn chaddr_bytes(&self) -> &[u8] {
        &self.chaddr[..usize::from(self.hlen).min(self.chaddr.len())]
    }

    pub fn format_mac(&self) -> String {
        format_hwaddr(self.chaddr_bytes())
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & BROADCAST_FLAG != 0
    }
}

/// Splits the option area into `(code, value)` pairs. Repeated codes are
/// joined into the first instance (RFC 3396).
fn parse_options(mut data: &[u8]) -> Result<Vec<DhcpOption>> {
    let mut values: Vec<(u8, Vec<u8>)> = Vec::new();

    while let Some((&code, rest)) = data.split_first() {
        if code == OptionCode::End as u8 {
            break;
        }
        if code == OptionCode::Pad as u8 {
            data = rest;
            continue;
        }

        let Some((&length, rest)) = rest.split_first() else {
            return Err(malformed(format!("Option {} has no length byte", code)));
        };
        let length = usize::from(length);
        if rest.len() < length {
            return Err(malformed(format!(
                "Option {} declares {} bytes, {} remain",
                code,
                length,
                rest.len()
            )));
        }

        let (value, rest) = rest.split_at(length);
        match values.iter_mut().find(|(seen, _)| *seen == code) {
            Some((_, joined)) => joined.extend_from_slice(value),
            None => values.push((code, value.to_vec())),
        }
        data = rest;
    }

    values
        .into_iter()
        .map(|(code, value)| DhcpOption::parse(code, &value))
        .collect()
}

/// Renders a hardware address as lowercase `aa:bb:cc:dd:ee:ff`.
pub fn format_hwaddr(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}
