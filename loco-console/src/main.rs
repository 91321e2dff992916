//! Locomux throttle console
//!
//! Opens one command-station connection from a JSON config and drives
//! throttles from stdin. Without a config argument it runs against a virtual
//! DCC-EX station.

mod commands;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use commands::{ConsoleCommand, HELP};
use loco_protocol::Address;
use loco_sim::{run_virtual_station, StationCommand, VirtualCommandStation};
use loco_throttle::{
    ConnectionConfig, ConnectionEvent, ConnectionList, LayoutConnection, PathResolver, Throttle,
    TransportConfig,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "loco_protocol=info,loco_throttle=info,loco_sim=info,loco_console=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(portable) => {
            let resolver = PathResolver::from_env(program_dir());
            ConnectionConfig::load_portable(&resolver, &portable)
                .with_context(|| format!("loading connection config {}", portable))?
        }
        None => ConnectionConfig::default(),
    };

    info!("Starting locomux console on '{}'", config.name);
    let (connection, _station) = connect(config).await?;
    watch_connection(&connection).await?;

    let mut connections = ConnectionList::new();
    connections.add(connection);
    let result = repl(&connections).await;
    connections.shutdown_all().await;
    result
}

fn program_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Open the configured transport, starting a virtual station if asked to
async fn connect(
    config: ConnectionConfig,
) -> anyhow::Result<(LayoutConnection, Option<mpsc::Sender<StationCommand>>)> {
    if config.transport != TransportConfig::Virtual {
        let connection = LayoutConnection::open(config)
            .await
            .context("opening command station")?;
        return Ok((connection, None));
    }

    let (client, server) = tokio::io::duplex(4096);
    let (station_tx, station_rx) = mpsc::channel(8);
    let station = VirtualCommandStation::new("virtual", config.protocol);
    tokio::spawn(async move {
        if let Err(e) = run_virtual_station(server, station, station_rx).await {
            warn!("Virtual station stopped: {}", e);
        }
    });
    let connection = LayoutConnection::with_io(config, client)?;
    Ok((connection, Some(station_tx)))
}

/// Print faults and refusals; log raw traffic at debug
async fn watch_connection(connection: &LayoutConnection) -> anyhow::Result<()> {
    let mut events = connection.subscribe().await?;
    let name = connection.name().to_string();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::FrameOut { data, .. } => debug!("{} >> {:02X?}", name, data),
                ConnectionEvent::FrameIn { data, .. } => debug!("{} << {:02X?}", name, data),
                ConnectionEvent::Unsolicited(event) => debug!("{}: {:?}", name, event),
                ConnectionEvent::Fault(kind) => println!("[{}] fault: {:?}", name, kind),
                ConnectionEvent::AcquisitionFailed { address, reason } => {
                    println!("[{}] {} refused: {}", name, address, reason)
                }
                ConnectionEvent::Disconnected => {
                    println!("[{}] disconnected", name);
                    break;
                }
            }
        }
    });
    Ok(())
}

async fn repl(connections: &ConnectionList) -> anyhow::Result<()> {
    let Some(connection) = connections.default_connection() else {
        bail!("no connection");
    };
    let manager = connection.manager();
    let mut throttles: HashMap<u16, Throttle> = HashMap::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("{}", HELP);
    while let Some(line) = lines.next_line().await? {
        let command = match commands::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        let outcome = match command {
            ConsoleCommand::Quit => break,
            ConsoleCommand::Help => {
                println!("{}", HELP);
                Ok(())
            }
            ConsoleCommand::Acquire { address, mode } => {
                match manager.request_throttle(address, mode).await {
                    Ok(throttle) => {
                        print_events(&throttle).await?;
                        println!("acquired {} as {}", address, throttle.id());
                        if let Some(old) = throttles.insert(address.number(), throttle) {
                            old.release().await.ok();
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            ConsoleCommand::Status { address } => match manager.address_status(address).await {
                Ok(status) => {
                    println!(
                        "{}: {:?}, holders {:?}, waiting {}",
                        address, status.state, status.holders, status.waiting
                    );
                    Ok(())
                }
                Err(e) => Err(e),
            },
            ConsoleCommand::Release { number } => match throttles.remove(&number) {
                Some(throttle) => throttle.release().await,
                None => {
                    println!("no throttle for {}", number);
                    Ok(())
                }
            },
            ConsoleCommand::Speed { number, speed } => {
                with_throttle(&throttles, number, |t| t.set_speed(speed)).await
            }
            ConsoleCommand::Direction { number, direction } => {
                with_throttle(&throttles, number, |t| t.set_direction(direction)).await
            }
            ConsoleCommand::Function { number, index, on } => {
                with_throttle(&throttles, number, |t| t.set_function(index, on)).await
            }
            ConsoleCommand::EmergencyStop { number } => {
                with_throttle(&throttles, number, |t| t.emergency_stop()).await
            }
        };

        if let Err(e) = outcome {
            println!("error: {}", e);
        }
        throttles.retain(|_, t| !t.is_released());
    }

    for (_, throttle) in throttles.drain() {
        if let Err(e) = throttle.release().await {
            warn!("Releasing {}: {}", throttle.address(), e);
        }
    }
    Ok(())
}

async fn with_throttle<'a, F, Fut>(
    throttles: &'a HashMap<u16, Throttle>,
    number: u16,
    op: F,
) -> Result<(), loco_throttle::ThrottleError>
where
    F: FnOnce(&'a Throttle) -> Fut,
    Fut: std::future::Future<Output = Result<(), loco_throttle::ThrottleError>>,
{
    match throttles.get(&number) {
        Some(throttle) => op(throttle).await,
        None => {
            println!("no throttle for {} (acquire it first)", number);
            Ok(())
        }
    }
}

async fn print_events(throttle: &Throttle) -> anyhow::Result<()> {
    let mut events = throttle.subscribe().await?;
    let address: Address = throttle.address();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("[{}] {:?}", address, event);
            if event.is_terminal() {
                break;
            }
        }
    });
    Ok(())
}
