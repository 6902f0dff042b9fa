//! Applying a lease to the operating system's network interface.
//!
//! The client treats interface configuration as an opaque action run after
//! an ACK (when configured to) and after a release. [`SystemInterface`]
//! drives the iproute2 `ip` tool; tests use a recording mock.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{Config, parse_mac};
use crate::error::{Error, Result};
use crate::lease::Lease;

pub trait InterfaceConfigurator: Send + Sync + 'static {
    /// Name of the interface being configured.
    fn name(&self) -> &str;

    /// Assigns the lease's address, netmask and default route.
    fn apply(&self, lease: &Lease) -> impl Future<Output = Result<()>> + Send;

    /// Removes what [`apply`](Self::apply) configured.
    fn reset(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Configures an interface with the `ip` command.
#[derive(Debug)]
pub struct SystemInterface {
    interface: String,
    program: String,
    modified: AtomicBool,
}

impl SystemInterface {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            program: "ip".to_string(),
            modified: AtomicBool::new(false),
        }
    }

    fn apply_commands(&self, lease: &Lease) -> Vec<Vec<String>> {
        let dev = self.interface.clone();
        let mut commands = vec![
            vec!["addr".into(), "flush".into(), "dev".into(), dev.clone()],
            vec![
                "addr".into(),
                "add".into(),
                format!("{}/{}", lease.address, lease.prefix_len()),
                "dev".into(),
                dev.clone(),
            ],
            vec!["link".into(), "set".into(), "dev".into(), dev.clone(), "up".into()],
        ];

        if let Some(gateway) = lease.gateway {
            commands.push(vec![
                "route".into(),
                "replace".into(),
                "default".into(),
                "via".into(),
                gateway.to_string(),
                "dev".into(),
                dev,
            ]);
        }

        commands
    }

    fn reset_commands(&self) -> Vec<Vec<String>> {
        let dev = self.interface.clone();
        vec![
            vec!["addr".into(), "flush".into(), "dev".into(), dev.clone()],
            vec!["link".into(), "set".into(), "dev".into(), dev.clone(), "down".into()],
            vec!["link".into(), "set".into(), "dev".into(), dev, "up".into()],
        ]
    }

    async fn run(&self, args: &[String]) -> Result<()> {
        debug!("Running {} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|error| {
                Error::Interface(format!("Failed to run {}: {}", self.program, error))
            })?;

        if !output.status.success() {
            return Err(Error::Interface(format!(
                "{} {} failed ({}): {}",
                self.program,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl InterfaceConfigurator for SystemInterface {
    fn name(&self) -> &str {
        &self.interface
    }

    async fn apply(&self, lease: &Lease) -> Result<()> {
        self.modified.store(true, Ordering::SeqCst);
        for command in self.apply_commands(lease) {
            self.run(&command).await?;
        }
        info!(
            "Configured {} with {}/{}",
            self.interface,
            lease.address,
            lease.prefix_len()
        );
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        if !self.modified.swap(false, Ordering::SeqCst) {
            debug!("Interface {} was not modified, nothing to reset", self.interface);
            return Ok(());
        }
        for command in self.reset_commands() {
            self.run(&command).await?;
        }
        info!("Unconfigured {}", self.interface);
        Ok(())
    }
}

/// Reads an interface's MAC address from sysfs.
pub async fn hardware_address(interface: &str) -> Result<[u8; 6]> {
    let path = format!("/sys/class/net/{}/address", interface);
    let text = tokio::fs::read_to_string(&path).await.map_err(|error| {
        Error::Interface(format!("Failed to read hardware address of {}: {}", interface, error))
    })?;
    parse_mac(&text)
}

/// Returns the configured MAC override, falling back to the interface's
/// own address.
pub async fn resolve_hardware_address(config: &Config) -> Result<[u8; 6]> {
    match config.mac_override()? {
        Some(mac) => Ok(mac),
        None => hardware_address(&config.interface).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn lease() -> Lease {
        Lease {
            address: Ipv4Addr::new(192, 0, 2, 10),
            netmask: Some(Ipv4Addr::new(255, 255, 255, 0)),
            gateway: Some(Ipv4Addr::new(192, 0, 2, 1)),
            valid: true,
            ..Default::default()
        }
    }

    fn joined(commands: Vec<Vec<String>>) -> Vec<String> {
        commands.into_iter().map(|args| args.join(" ")).collect()
    }

    #[test]
    fn test_apply_commands() {
        let interface = SystemInterface::new("eth1");
        assert_eq!(
            joined(interface.apply_commands(&lease())),
            vec![
                "addr flush dev eth1",
                "addr add 192.0.2.10/24 dev eth1",
                "link set dev eth1 up",
                "route replace default via 192.0.2.1 dev eth1",
            ]
        );
    }

    #[test]
    fn test_apply_commands_without_gateway() {
        let interface = SystemInterface::new("eth1");
        let lease = Lease {
            gateway: None,
            netmask: None,
            ..lease()
        };
        assert_eq!(
            joined(interface.apply_commands(&lease)),
            vec![
                "addr flush dev eth1",
                "addr add 192.0.2.10/32 dev eth1",
                "link set dev eth1 up",
            ]
        );
    }

    #[test]
    fn test_reset_commands() {
        let interface = SystemInterface::new("eth1");
        assert_eq!(
            joined(interface.reset_commands()),
            vec![
                "addr flush dev eth1",
                "link set dev eth1 down",
                "link set dev eth1 up",
            ]
        );
    }

    #[tokio::test]
    async fn test_reset_skipped_when_unmodified() {
        let interface = SystemInterface {
            program: "/nonexistent/ip".to_string(),
            ..SystemInterface::new("eth1")
        };
        assert!(!interface.modified.load(Ordering::SeqCst));
        assert!(interface.reset().await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_command_reported() {
        let interface = SystemInterface {
            program: "/nonexistent/ip".to_string(),
            ..SystemInterface::new("eth1")
        };
        let result = interface.apply(&lease()).await;
        assert!(matches!(result, Err(Error::Interface(_))));
        assert!(interface.modified.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_mac_override_wins() {
        let config = Config {
            interface: "does-not-exist0".to_string(),
            mac_address: Some("02:00:00:00:00:01".to_string()),
            ..Default::default()
        };
        assert_eq!(
            resolve_hardware_address(&config).await.unwrap(),
            [0x02, 0, 0, 0, 0, 0x01]
        );
    }

    #[tokio::test]
    async fn test_missing_interface() {
        assert!(matches!(
            hardware_address("does-not-exist0").await,
            Err(Error::Interface(_))
        ));
    }
}
