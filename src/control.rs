//! Command vocabulary accepted from external controllers.
//!
//! Commands arrive as text (one per line in the daemon) and are mapped onto
//! client operations. Query commands answer with a [`Response`]; events
//! travel separately on the client's event channel.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::client::DhcpClient;
use crate::error::{Error, Result};
use crate::interface::InterfaceConfigurator;
use crate::transport::Transport;

/// Version string reported by `get-version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start a discovery without releasing first.
    Discover,
    Renew,
    /// Release any held lease, then discover.
    Restart,
    Release,
    FreezeRenew,
    GetVersion,
    GetInterface,
    GetPid,
    Debug(String),
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let (verb, argument) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_lowercase().as_str() {
            "discover" => Ok(Command::Discover),
            "renew" => Ok(Command::Renew),
            "restart" => Ok(Command::Restart),
            "release" => Ok(Command::Release),
            "freeze-renew" | "freezerenew" => Ok(Command::FreezeRenew),
            "get-version" | "getversion" => Ok(Command::GetVersion),
            "get-interface" | "getinterface" => Ok(Command::GetInterface),
            "get-pid" | "getpid" => Ok(Command::GetPid),
            "debug" => Ok(Command::Debug(argument.to_string())),
            _ => Err(Error::UnknownCommand(line.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Discover => write!(f, "discover"),
            Command::Renew => write!(f, "renew"),
            Command::Restart => write!(f, "restart"),
            Command::Release => write!(f, "release"),
            Command::FreezeRenew => write!(f, "freeze-renew"),
            Command::GetVersion => write!(f, "get-version"),
            Command::GetInterface => write!(f, "get-interface"),
            Command::GetPid => write!(f, "get-pid"),
            Command::Debug(message) => write!(f, "debug {}", message),
        }
    }
}

/// Reply to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum Response {
    /// The command's operation completed.
    Done { command: String },
    Version { version: String },
    Interface { interface: String },
    Pid { pid: u32 },
    /// The command failed. The daemon keeps running.
    Failed { command: String, error: String },
}

/// Maps commands onto one client instance.
pub struct ControlSurface<T, C> {
    client: Arc<DhcpClient<T, C>>,
}

impl<T: Transport, C: InterfaceConfigurator> ControlSurface<T, C> {
    pub fn new(client: Arc<DhcpClient<T, C>>) -> Self {
        Self { client }
    }

    /// Runs `command` against the client.
    ///
    /// # Errors
    ///
    /// Propagates the client operation's error (`SendFailure`,
    /// `RenewOnInvalidLease`, ...) unchanged.
    pub async fn execute(&self, command: &Command) -> Result<Response> {
        info!("Executing command: {}", command);

        let done = || Response::Done {
            command: command.to_string(),
        };

        match command {
            Command::Discover => {
                self.client.start_discovery(None, false).await?;
                Ok(done())
            }
            Command::Renew => {
                self.client.send_renew(None, None).await?;
                Ok(done())
            }
            Command::Restart => {
                self.client.start_discovery(None, true).await?;
                Ok(done())
            }
            Command::Release => {
                self.client.send_release(None, true).await?;
                Ok(done())
            }
            Command::FreezeRenew => {
                self.client.freeze_renewal().await;
                Ok(done())
            }
            Command::GetVersion => Ok(Response::Version {
                version: VERSION.to_string(),
            }),
            Command::GetInterface => Ok(Response::Interface {
                interface: self.client.interface_name().to_string(),
            }),
            Command::GetPid => Ok(Response::Pid {
                pid: std::process::id(),
            }),
            Command::Debug(message) => {
                info!("Debug: {}", message);
                Ok(done())
            }
        }
    }

    /// Parses and runs one line, folding any failure into
    /// [`Response::Failed`].
    pub async fn handle_line(&self, line: &str) -> Response {
        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(error) => {
                return Response::Failed {
                    command: line.trim().to_string(),
                    error: error.to_string(),
                };
            }
        };

        match self.execute(&command).await {
            Ok(response) => response,
            Err(error) => Response::Failed {
                command: command.to_string(),
                error: error.to_string(),
            },
        }
    }

    pub fn client(&self) -> &Arc<DhcpClient<T, C>> {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientSettings;
    use crate::event;
    use crate::lease::Lease;
    use std::net::{SocketAddr, SocketAddrV4};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: StdMutex<Vec<Vec<u8>>>,
    }

    impl Transport for RecordingTransport {
        async fn send_to(&self, data: &[u8], _destination: SocketAddrV4) -> Result<usize> {
            self.sent.lock().unwrap().push(data.to_vec());
            Ok(data.len())
        }

        async fn recv(&self, _buffer: &mut [u8]) -> Result<(usize, SocketAddr)> {
            std::future::pending().await
        }
    }

    struct NullInterface;

    impl InterfaceConfigurator for NullInterface {
        fn name(&self) -> &str {
            "eth7"
        }

        async fn apply(&self, _lease: &Lease) -> Result<()> {
            Ok(())
        }

        async fn reset(&self) -> Result<()> {
            Ok(())
        }
    }

    fn surface() -> ControlSurface<RecordingTransport, NullInterface> {
        let settings = ClientSettings {
            hardware_address: [2, 0, 0, 0, 0, 1],
            server_port: 67,
            apply_ip: false,
            dump_packets: false,
            parameter_request_list: vec![1, 3, 6],
        };
        let (sink, _stream) = event::channel();
        ControlSurface::new(DhcpClient::new(
            settings,
            RecordingTransport::default(),
            NullInterface,
            sink,
        ))
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!("discover".parse::<Command>().unwrap(), Command::Discover);
        assert_eq!(" Renew \n".parse::<Command>().unwrap(), Command::Renew);
        assert_eq!("restart".parse::<Command>().unwrap(), Command::Restart);
        assert_eq!("release".parse::<Command>().unwrap(), Command::Release);
        assert_eq!(
            "freeze-renew".parse::<Command>().unwrap(),
            Command::FreezeRenew
        );
        assert_eq!("FreezeRenew".parse::<Command>().unwrap(), Command::FreezeRenew);
        assert_eq!("get-version".parse::<Command>().unwrap(), Command::GetVersion);
        assert_eq!(
            "get-interface".parse::<Command>().unwrap(),
            Command::GetInterface
        );
        assert_eq!("get-pid".parse::<Command>().unwrap(), Command::GetPid);
        assert_eq!(
            "debug hello  world".parse::<Command>().unwrap(),
            Command::Debug("hello  world".to_string())
        );
        assert!(matches!(
            "reboot".parse::<Command>(),
            Err(Error::UnknownCommand(_))
        ));
        assert!("".parse::<Command>().is_err());
    }

    #[test]
    fn test_display_parses_back() {
        for command in [
            Command::Discover,
            Command::FreezeRenew,
            Command::GetInterface,
            Command::Debug("x".to_string()),
        ] {
            assert_eq!(command.to_string().parse::<Command>().unwrap(), command);
        }
    }

    #[tokio::test]
    async fn test_query_commands() {
        let surface = surface();
        assert_eq!(
            surface.execute(&Command::GetVersion).await.unwrap(),
            Response::Version {
                version: VERSION.to_string()
            }
        );
        assert_eq!(
            surface.execute(&Command::GetInterface).await.unwrap(),
            Response::Interface {
                interface: "eth7".to_string()
            }
        );
        assert_eq!(
            surface.execute(&Command::GetPid).await.unwrap(),
            Response::Pid {
                pid: std::process::id()
            }
        );
    }

    #[tokio::test]
    async fn test_discover_command_sends() {
        let surface = surface();
        let response = surface.execute(&Command::Discover).await.unwrap();
        assert_eq!(
            response,
            Response::Done {
                command: "discover".to_string()
            }
        );
        assert_eq!(surface.client().transport().sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_renew_without_lease_fails() {
        let surface = surface();
        assert!(matches!(
            surface.execute(&Command::Renew).await,
            Err(Error::RenewOnInvalidLease)
        ));

        let response = surface.handle_line("renew").await;
        assert!(matches!(response, Response::Failed { ref command, .. } if command == "renew"));
    }

    #[tokio::test]
    async fn test_release_and_freeze_without_lease() {
        let surface = surface();
        assert!(surface.execute(&Command::Release).await.is_ok());
        assert!(surface.execute(&Command::FreezeRenew).await.is_ok());
        assert!(surface.client().transport().sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handle_line_unknown() {
        let surface = surface();
        let response = surface.handle_line("launch rockets").await;
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["response"], "failed");
        assert_eq!(json["command"], "launch rockets");
    }
}
