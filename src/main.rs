use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use dhcpclaim::interface::resolve_hardware_address;
use dhcpclaim::{
    ClientSettings, Config, ControlSurface, DhcpClient, Result, SystemInterface, UdpTransport,
};

#[derive(Parser)]
#[command(name = "dhcpclaim")]
#[command(author, version, about = "A DHCP client daemon driven by commands on stdin", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "dhcpclaim.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Interface to run on (overrides the config file).
    #[arg(short = 'i', long)]
    ifname: Option<String>,

    /// Apply the obtained lease to the interface.
    #[arg(short = 'A', long)]
    apply_config: bool,

    /// Log every received packet in full.
    #[arg(short = 'D', long)]
    dump_packets: bool,

    /// Wait for a `discover` command instead of starting right away.
    #[arg(short = 'S', long)]
    start_on_command: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load_or_create(&cli.config)?;
    if let Some(ifname) = cli.ifname {
        config.interface = ifname;
    }
    config.apply_ip |= cli.apply_config;
    config.dump_packets |= cli.dump_packets;
    config.start_on_command |= cli.start_on_command;
    config.validate()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCP client with config: {:?}", cli.config);
            run(config).await
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let hwaddr = resolve_hardware_address(&config).await?;
    let transport = UdpTransport::bind(&config)?;
    let (events, mut stream) = dhcpclaim::event::channel();

    let client = DhcpClient::new(
        ClientSettings::from_config(&config, hwaddr),
        transport,
        SystemInterface::new(&config.interface),
        events,
    );
    let control = Arc::new(ControlSurface::new(Arc::clone(&client)));

    let receiver = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.run().await })
    };

    let commands = {
        let control = Arc::clone(&control);
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => print_json(&control.handle_line(&line).await),
                    Ok(None) => {
                        debug!("Command input closed");
                        break;
                    }
                    Err(error) => {
                        error!("Error reading commands: {}", error);
                        break;
                    }
                }
            }
        })
    };

    if config.start_on_command {
        info!("Waiting for a discover command");
    } else if let Err(error) = client.start_discovery(None, false).await {
        error!("Initial discovery failed: {}", error);
    }

    let mut signal = pin!(shutdown_signal());
    loop {
        tokio::select! {
            _ = &mut signal => break,
            Some(event) = stream.recv() => print_json(&event),
        }
    }

    info!("Received shutdown signal, releasing lease...");
    commands.abort();
    if let Err(error) = client.shutdown().await {
        error!("Failed to release lease on shutdown: {}", error);
    }

    match receiver.await {
        Ok(result) => result?,
        Err(error) => error!("Receive loop ended abnormally: {}", error),
    }

    while let Ok(event) = stream.try_recv() {
        print_json(&event);
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{}", line),
        Err(error) => error!("Failed to serialize output: {}", error),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(error) => {
                warn!("Failed to install SIGTERM handler: {}", error);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
