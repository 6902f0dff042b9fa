use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{Error, Result};
use crate::options::OptionCode;

/// UDP port DHCP servers listen on.
pub const DHCP_SERVER_PORT: u16 = 67;

/// UDP port DHCP clients listen on.
pub const DHCP_CLIENT_PORT: u16 = 68;

/// NTP servers option (RFC 2132 §8.3), requested but not interpreted.
const NTP_SERVERS_OPTION: u8 = 42;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub interface: String,
    pub listen_address: Ipv4Addr,
    pub client_port: u16,
    pub server_port: u16,
    pub mac_address: Option<String>,
    pub apply_ip: bool,
    pub dump_packets: bool,
    pub start_on_command: bool,
    pub parameter_request_list: Vec<u8>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            listen_address: Ipv4Addr::UNSPECIFIED,
            client_port: DHCP_CLIENT_PORT,
            server_port: DHCP_SERVER_PORT,
            mac_address: None,
            apply_ip: false,
            dump_packets: false,
            start_on_command: false,
            parameter_request_list: default_parameter_request_list(),
        }
    }
}

/// Options requested from the server when the caller gives no list:
/// subnet mask, router, DNS, domain name and NTP servers.
pub fn default_parameter_request_list() -> Vec<u8> {
    vec![
        OptionCode::SubnetMask as u8,
        OptionCode::Router as u8,
        OptionCode::DnsServer as u8,
        OptionCode::DomainName as u8,
        NTP_SERVERS_OPTION,
    ]
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.interface.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "interface must not be empty".to_string(),
            ));
        }

        if self.client_port == 0 || self.server_port == 0 {
            return Err(Error::InvalidConfig(
                "client_port and server_port must be greater than 0".to_string(),
            ));
        }

        if self.client_port == self.server_port {
            return Err(Error::InvalidConfig(
                "client_port and server_port must differ".to_string(),
            ));
        }

        if self.parameter_request_list.is_empty() || self.parameter_request_list.len() > 255 {
            return Err(Error::InvalidConfig(
                "parameter_request_list must hold between 1 and 255 option codes".to_string(),
            ));
        }

        if let Some(mac) = &self.mac_address {
            parse_mac(mac)?;
        }

        Ok(())
    }

    /// Returns the configured hardware address override, if any.
    pub fn mac_override(&self) -> Result<Option<[u8; 6]>> {
        self.mac_address.as_deref().map(parse_mac).transpose()
    }
}

/// Parses an Ethernet address written as `aa:bb:cc:dd:ee:ff` (or with dashes).
pub fn parse_mac(text: &str) -> Result<[u8; 6]> {
    let normalized = text.trim().to_lowercase().replace('-', ":");
    let parts: Vec<&str> = normalized.split(':').collect();
    if parts.len() != 6 {
        return Err(Error::InvalidConfig(format!(
            "invalid MAC address {:?}: expected 6 octets",
            text
        )));
    }

    let mut mac = [0u8; 6];
    for (slot, part) in mac.iter_mut().zip(parts) {
        *slot = u8::from_str_radix(part, 16).map_err(|_| {
            Error::InvalidConfig(format!("invalid MAC address {:?}: bad octet {:?}", text, part))
        })?;
    }
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.client_port, 68);
        assert_eq!(config.server_port, 67);
    }

    #[test]
    fn test_default_parameter_request_list() {
        assert_eq!(default_parameter_request_list(), vec![1, 3, 6, 15, 42]);
    }

    #[test]
    fn test_empty_interface_rejected() {
        let config = Config {
            interface: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_same_ports_rejected() {
        let config = Config {
            client_port: 67,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_parameter_list_rejected() {
        let config = Config {
            parameter_request_list: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_mac_rejected() {
        let config = Config {
            mac_address: Some("aa:bb:cc".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("AA-bb-cc-dd-ee-0F").unwrap(),
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x0f]
        );
        assert!(parse_mac("aa:bb:cc:dd:ee:zz").is_err());
    }

    #[test]
    fn test_mac_override() {
        let config = Config {
            mac_address: Some("02:00:00:00:00:01".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.mac_override().unwrap(),
            Some([0x02, 0, 0, 0, 0, 0x01])
        );
        assert_eq!(Config::default().mac_override().unwrap(), None);
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir().join(format!("dhcpclaim_config_{}.json", std::process::id()));
        let config = Config {
            interface: "enp3s0".to_string(),
            apply_ip: true,
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = Config::load_or_create(&path).unwrap();
        assert_eq!(loaded.interface, "enp3s0");
        assert!(loaded.apply_ip);

        let _ = std::fs::remove_file(&path);
    }
}
