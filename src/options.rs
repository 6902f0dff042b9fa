//! Typed DHCP options (RFC 2132).
//!
//! On the wire an option is `code`, `length`, then `length` bytes of value.
//! Values over 255 bytes span several instances of the same code (RFC 3396).
//! The client only interprets what it needs to obtain and hold a lease; any
//! other code decodes to [`DhcpOption::Unknown`] and encodes back unchanged.

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Largest value one option instance can carry behind its length byte.
const MAX_OPTION_LEN: usize = u8::MAX as usize;

/// Option codes the client interprets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    /// Single byte filler, no length.
    Pad = 0,
    SubnetMask = 1,
    /// Routers, the first one is the default gateway.
    Router = 3,
    DnsServer = 6,
    DomainName = 15,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    ClientIdentifier = 61,
    /// Closes the option list, no length.
    End = 255,
}

impl OptionCode {
    const KNOWN: [OptionCode; 12] = [
        Self::Pad,
        Self::SubnetMask,
        Self::Router,
        Self::DnsServer,
        Self::DomainName,
        Self::RequestedIpAddress,
        Self::LeaseTime,
        Self::MessageType,
        Self::ServerIdentifier,
        Self::ParameterRequestList,
        Self::ClientIdentifier,
        Self::End,
    ];
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Self::KNOWN
            .into_iter()
            .find(|code| *code as u8 == value)
            .ok_or(value)
    }
}

/// Value of Option 53.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    const ALL: [MessageType; 8] = [
        Self::Discover,
        Self::Offer,
        Self::Request,
        Self::Decline,
        Self::Ack,
        Self::Nak,
        Self::Release,
        Self::Inform,
    ];

    /// Upper-case name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        usize::from(value)
            .checked_sub(1)
            .and_then(|index| Self::ALL.get(index).copied())
            .ok_or(value)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    Router(Vec<Ipv4Addr>),
    /// Kept in the order the server sent them.
    DnsServer(Vec<Ipv4Addr>),
    DomainName(String),
    RequestedIpAddress(Ipv4Addr),
    /// Seconds; `u32::MAX` means infinite.
    LeaseTime(u32),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    /// Hardware type byte followed by the hardware address.
    ClientIdentifier(Vec<u8>),
    /// Any other code, value untouched.
    Unknown(u8, Vec<u8>),
}

fn exact<const N: usize>(data: &[u8], what: &str) -> Result<[u8; N]> {
    data.try_into().map_err(|_| {
        Error::MalformedPacket(format!(
            "{} must be {} bytes, got {}",
            what,
            N,
            data.len()
        ))
    })
}

fn address_list(data: &[u8], what: &str) -> Result<Vec<Ipv4Addr>> {
    if data.is_empty() || data.len() % 4 != 0 {
        return Err(Error::MalformedPacket(format!(
            "{} list has length {}",
            what,
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .filter_map(|chunk| <[u8; 4]>::try_from(chunk).ok())
        .map(Ipv4Addr::from)
        .collect())
}

impl DhcpOption {
    pub fn option_code(&self) -> u8 {
        let known = match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask,
            Self::Router(_) => OptionCode::Router,
            Self::DnsServer(_) => OptionCode::DnsServer,
            Self::DomainName(_) => OptionCode::DomainName,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress,
            Self::LeaseTime(_) => OptionCode::LeaseTime,
            Self::MessageType(_) => OptionCode::MessageType,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier,
            Self::Unknown(code, _) => return *code,
        };
        known as u8
    }

    /// Decodes the value of option `code`.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedPacket`] when the value length does not fit the
    /// option (a mask that isn't 4 bytes, an empty router list, ...) or the
    /// message type is outside 1..=8.
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        let Ok(known) = OptionCode::try_from(code) else {
            return Ok(Self::Unknown(code, data.to_vec()));
        };

        let option = match known {
            OptionCode::SubnetMask => Self::SubnetMask(exact::<4>(data, "Subnet mask")?.into()),
            OptionCode::Router => Self::Router(address_list(data, "Router")?),
            OptionCode::DnsServer => Self::DnsServer(address_list(data, "DNS server")?),
            // Non UTF-8 names are kept raw rather than failing the whole reply.
            OptionCode::DomainName => match String::from_utf8(data.to_vec()) {
                Ok(name) => Self::DomainName(name),
                Err(raw) => Self::Unknown(code, raw.into_bytes()),
            },
            OptionCode::RequestedIpAddress => {
                Self::RequestedIpAddress(exact::<4>(data, "Requested address")?.into())
            }
            OptionCode::LeaseTime => {
                Self::LeaseTime(u32::from_be_bytes(exact(data, "Lease time")?))
            }
            OptionCode::MessageType => {
                let [value] = exact::<1>(data, "Message type")?;
                let kind = MessageType::try_from(value).map_err(|value| {
                    Error::MalformedPacket(format!("Unknown message type: {}", value))
                })?;
                Self::MessageType(kind)
            }
            OptionCode::ServerIdentifier => {
                Self::ServerIdentifier(exact::<4>(data, "Server identifier")?.into())
            }
            OptionCode::ParameterRequestList => Self::ParameterRequestList(data.to_vec()),
            OptionCode::ClientIdentifier => Self::ClientIdentifier(data.to_vec()),
            OptionCode::Pad | OptionCode::End => {
                return Err(Error::MalformedPacket(format!(
                    "Option {} carries no value",
                    code
                )));
            }
        };
        Ok(option)
    }

    fn value(&self) -> Vec<u8> {
        match self {
            Self::SubnetMask(address)
            | Self::RequestedIpAddress(address)
            | Self::ServerIdentifier(address) => address.octets().to_vec(),
            Self::Router(addresses) | Self::DnsServer(addresses) => {
                addresses.iter().flat_map(|address| address.octets()).collect()
            }
            Self::DomainName(name) => name.as_bytes().to_vec(),
            Self::LeaseTime(seconds) => seconds.to_be_bytes().to_vec(),
            Self::MessageType(kind) => vec![*kind as u8],
            Self::ParameterRequestList(bytes)
            | Self::ClientIdentifier(bytes)
            | Self::Unknown(_, bytes) => bytes.clone(),
        }
    }

    /// Wire form: code, length, value.
    ///
    /// A value longer than 255 bytes is written as consecutive instances of
    /// the same code (RFC 3396), which the decoder joins back together.
    pub fn encode(&self) -> Vec<u8> {
        let code = self.option_code();
        let value = self.value();
        if value.is_empty() {
            return vec![code, 0];
        }

        let mut out = Vec::with_capacity(value.len() + 2 * value.len().div_ceil(MAX_OPTION_LEN));
        for fragment in value.chunks(MAX_OPTION_LEN) {
            out.push(code);
            out.push(fragment.len() as u8);
            out.extend_from_slice(fragment);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::try_from(1), Ok(MessageType::Discover));
        assert_eq!(MessageType::try_from(5), Ok(MessageType::Ack));
        assert_eq!(MessageType::try_from(8), Ok(MessageType::Inform));
        assert_eq!(MessageType::try_from(0), Err(0));
        assert_eq!(MessageType::try_from(9), Err(9));
        assert_eq!(MessageType::Nak.to_string(), "NAK");
        assert_eq!(MessageType::Release as u8, 7);
    }

    #[test]
    fn test_option_code_lookup() {
        assert_eq!(OptionCode::try_from(55), Ok(OptionCode::ParameterRequestList));
        assert_eq!(OptionCode::try_from(255), Ok(OptionCode::End));
        assert_eq!(OptionCode::try_from(42), Err(42));
    }

    #[test]
    fn test_ack_options_decode() {
        assert_eq!(
            DhcpOption::parse(1, &[255, 255, 252, 0]).unwrap(),
            DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 252, 0))
        );
        assert_eq!(
            DhcpOption::parse(51, &[0, 1, 0x51, 0x80]).unwrap(),
            DhcpOption::LeaseTime(86400)
        );
        assert_eq!(
            DhcpOption::parse(54, &[192, 0, 2, 1]).unwrap(),
            DhcpOption::ServerIdentifier(Ipv4Addr::new(192, 0, 2, 1))
        );
        assert_eq!(
            DhcpOption::parse(53, &[2]).unwrap(),
            DhcpOption::MessageType(MessageType::Offer)
        );
    }

    #[test]
    fn test_dns_order_kept() {
        let decoded = DhcpOption::parse(6, &[9, 9, 9, 9, 1, 1, 1, 1]).unwrap();
        assert_eq!(
            decoded,
            DhcpOption::DnsServer(vec![Ipv4Addr::new(9, 9, 9, 9), Ipv4Addr::new(1, 1, 1, 1)])
        );
    }

    #[test]
    fn test_bad_lengths_are_malformed() {
        for (code, data) in [
            (1u8, &[255, 255, 0][..]),
            (3, &[][..]),
            (6, &[8, 8, 8, 8, 8][..]),
            (50, &[10, 0, 0][..]),
            (51, &[0, 0][..]),
            (53, &[5, 5][..]),
            (53, &[][..]),
            (54, &[192, 0, 2, 1, 0][..]),
        ] {
            assert!(
                matches!(DhcpOption::parse(code, data), Err(Error::MalformedPacket(_))),
                "option {} with {:?}",
                code,
                data
            );
        }
        assert!(DhcpOption::parse(53, &[9]).is_err());
    }

    #[test]
    fn test_unknown_and_raw_domain() {
        assert_eq!(
            DhcpOption::parse(42, &[10, 0, 0, 1]).unwrap(),
            DhcpOption::Unknown(42, vec![10, 0, 0, 1])
        );
        let raw = DhcpOption::parse(15, &[0xc3, 0x28]).unwrap();
        assert_eq!(raw, DhcpOption::Unknown(15, vec![0xc3, 0x28]));
        assert_eq!(raw.encode(), vec![15, 2, 0xc3, 0x28]);
    }

    #[test]
    fn test_request_options_encode() {
        assert_eq!(
            DhcpOption::MessageType(MessageType::Request).encode(),
            vec![53, 1, 3]
        );
        assert_eq!(
            DhcpOption::RequestedIpAddress(Ipv4Addr::new(192, 0, 2, 10)).encode(),
            vec![50, 4, 192, 0, 2, 10]
        );
        assert_eq!(
            DhcpOption::ParameterRequestList(vec![1, 3, 6, 15, 42]).encode(),
            vec![55, 5, 1, 3, 6, 15, 42]
        );
        assert_eq!(DhcpOption::LeaseTime(3600).encode(), vec![51, 4, 0, 0, 0x0e, 0x10]);
    }

    #[test]
    fn test_long_values_split_into_fragments() {
        let routers = DhcpOption::Router(vec![Ipv4Addr::new(10, 0, 0, 1); 70]).encode();
        assert_eq!(&routers[..2], &[3, 255]);
        assert_eq!(&routers[257..259], &[3, 25]);
        assert_eq!(routers.len(), 2 + 255 + 2 + 25);

        let id = DhcpOption::ClientIdentifier(vec![7; 510]).encode();
        assert_eq!(id.len(), 2 * (2 + 255));
        assert_eq!(&id[257..259], &[61, 255]);
    }

    #[test]
    fn test_empty_value_still_encoded() {
        assert_eq!(DhcpOption::Unknown(224, Vec::new()).encode(), vec![224, 0]);
    }

    #[test]
    fn test_pad_and_end_have_no_value() {
        assert!(DhcpOption::parse(0, &[]).is_err());
        assert!(DhcpOption::parse(255, &[]).is_err());
    }
}
