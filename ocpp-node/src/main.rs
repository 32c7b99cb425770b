//! OCPP Node - run a central system or a simulated charging station
//!
//! # Usage
//!
//! ```bash
//! # Central system on the default port
//! ocpp-node csms
//!
//! # Station CP_1 connecting to it
//! ocpp-node station --name CP_1 --url ws://localhost:9000
//! ```
//!
//! # Commands (stdin)
//!
//! Station: `st` (transaction started), `br` (base report), `au` (authorize),
//! `rr` (report).
//!
//! CSMS: `list`, `br <id>`, `start <id>`, `stop <id> <transaction>`.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use ocpp_engine::{
    handlers, AdminCommand, CentralSystem, CsmsConfig, CsmsServer, DuplicatePolicy,
    OperatorCommand, OcppError, Station, StationConfig,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// OCPP 2.0.1 central system and charging station simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Accept charging stations
    Csms {
        /// Listen address
        #[arg(long, default_value = "0.0.0.0:9000")]
        listen: SocketAddr,

        /// Heartbeat interval handed to stations, in seconds
        #[arg(long, default_value = "10")]
        heartbeat_interval: u64,

        /// Refuse a station that connects twice instead of replacing it
        #[arg(long)]
        reject_duplicates: bool,
    },

    /// Connect as a charging station
    Station {
        /// Station identity (last URL path segment)
        #[arg(short, long, default_value = "CP_1")]
        name: String,

        /// CSMS WebSocket URL without the station identity
        #[arg(long, default_value = "ws://localhost:9000")]
        url: String,

        /// Vendor name
        #[arg(long, default_value = "anewone")]
        vendor: String,

        /// Model name
        #[arg(long, default_value = "Wallbox XYZ")]
        model: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.role {
        Role::Csms {
            listen,
            heartbeat_interval,
            reject_duplicates,
        } => {
            let policy = if reject_duplicates {
                DuplicatePolicy::Reject
            } else {
                DuplicatePolicy::Replace
            };
            let config = CsmsConfig::new(listen)
                .with_heartbeat_interval(Duration::from_secs(heartbeat_interval))
                .with_duplicate_policy(policy);

            println!();
            println!("╔══════════════════════════════════════════════════════════════╗");
            println!("║                 OCPP Node - Central System                   ║");
            println!("╠══════════════════════════════════════════════════════════════╣");
            println!("║  Listen:    {:<49} ║", listen);
            println!("║  Heartbeat: {:<49} ║", format!("{}s", heartbeat_interval));
            println!("║  Duplicate: {:<49} ║", format!("{:?}", policy));
            println!("╚══════════════════════════════════════════════════════════════╝");
            println!();

            run_csms(config).await?;
        }
        Role::Station {
            name,
            url,
            vendor,
            model,
        } => {
            let config = StationConfig::new(&name, &url).with_vendor(&vendor, &model);

            println!();
            println!("╔══════════════════════════════════════════════════════════════╗");
            println!("║               OCPP Node - Charging Station                   ║");
            println!("╠══════════════════════════════════════════════════════════════╣");
            println!("║  Station:  {:<50} ║", name);
            println!("║  CSMS URL: {:<50} ║", truncate(&url, 50));
            println!("║  Model:    {:<50} ║", truncate(&format!("{} {}", vendor, model), 50));
            println!("╚══════════════════════════════════════════════════════════════╝");
            println!();

            run_station(config).await?;
        }
    }

    Ok(())
}

async fn run_csms(config: CsmsConfig) -> Result<(), OcppError> {
    let dispatcher = handlers::csms_dispatcher(config.heartbeat_interval);
    let server = CsmsServer::new(config, dispatcher);
    let central = server.central();
    let shutdown = server.shutdown_token();

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    // One listener for the whole run so an interrupt during an admin call is kept
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = &mut interrupted => {
                info!("Interrupted, shutting down");
                break;
            }
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match line.parse::<AdminCommand>() {
                    Ok(command) => {
                        tokio::select! {
                            _ = &mut interrupted => {
                                info!("Interrupted, shutting down");
                                break;
                            }
                            _ = run_admin(&central, command) => {}
                        }
                    }
                    Err(e) => warn!("{}", e),
                },
                // stdin closed; keep serving until interrupted
                None => stdin_open = false,
            },
        }
    }

    shutdown.cancel();
    match serving.await {
        Ok(outcome) => outcome,
        Err(e) => Err(OcppError::Transport(e.to_string())),
    }
}

async fn run_admin(central: &CentralSystem, command: AdminCommand) {
    match command {
        AdminCommand::List => {
            println!("Connected Charging Stations: {:?}", central.list_connected_identities());
        }
        AdminCommand::BaseReport(identity) => match central.get_base_report(&identity).await {
            Ok(response) => println!("{}: base report {:?}", identity, response.status),
            Err(e) => warn!("GetBaseReport on {} failed: {}", identity, e),
        },
        AdminCommand::Start(identity) => match central.start_transaction(&identity).await {
            Ok(response) => println!(
                "{}: start {:?}, transaction {}",
                identity,
                response.status,
                response.transaction_id.as_deref().unwrap_or("-")
            ),
            Err(e) => warn!("RequestStartTransaction on {} failed: {}", identity, e),
        },
        AdminCommand::Stop(identity, transaction) => {
            match central.stop_transaction(&identity, &transaction).await {
                Ok(response) => println!("{}: stop {:?}", identity, response.status),
                Err(e) => warn!("RequestStopTransaction on {} failed: {}", identity, e),
            }
        }
    }
}

async fn run_station(config: StationConfig) -> Result<(), OcppError> {
    let station = Station::connect(config, handlers::station_dispatcher()).await?;
    station.start_boot();

    let stdin = BufReader::new(tokio::io::stdin());
    drive_station(&station, stdin, tokio::signal::ctrl_c()).await
}

/// Trigger operator commands read from `input` until `interrupted` fires or
/// the CSMS drops the connection
async fn drive_station<R, I>(station: &Station, input: R, interrupted: I) -> Result<(), OcppError>
where
    R: AsyncBufRead + Unpin,
    I: Future,
{
    tokio::pin!(interrupted);

    let mut lines = input.lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = &mut interrupted => {
                info!("Interrupted, closing connection");
                station.close().await;
                break;
            }
            _ = station.closed() => {
                info!("Connection to CSMS closed");
                break;
            }
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match line.parse::<OperatorCommand>() {
                    Ok(command) => {
                        station.trigger(command);
                    }
                    Err(e) => warn!("{}", e),
                },
                // stdin closed; run until interrupted or dropped by the CSMS
                None => stdin_open = false,
            },
        }
    }

    Ok(())
}

/// Truncate string with ellipsis, counting chars
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
