use clap::Parser;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pasn_station::config::Config;
use pasn_station::sim::{air_collaborators, run_air, Responder};
use pasn_station::station::runner::{self, Command, HostInput};
use pasn_station::station::{BatchAction, DeviceSecurityContext, StationEvent};
use pasn_station::time::SystemClock;

#[derive(Parser)]
#[command(name = "pasn-station")]
#[command(about = "PASN pre-association authentication against simulated peers")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Deauthenticate every peer once the batch completes
    #[arg(long)]
    deauth: bool,

    /// Ignore configured comeback delays
    #[arg(long)]
    no_comeback: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Events go to stdout, logs to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("pasn-station v{}", env!("CARGO_PKG_VERSION"));
    info!("===========================================");
    info!("Station {}", config.station.own_addr);
    info!("===========================================");

    let mut sim = config.sim.clone().unwrap_or_default();
    if cli.no_comeback {
        for peer in &mut sim.peers {
            peer.comeback_after = None;
        }
    }
    let responders: Vec<Responder> = sim
        .peers
        .iter()
        .map(|p| Responder::new(p.responder(config.station.derive_kek)))
        .collect();
    let bss = responders.iter().map(Responder::bss_info).collect();
    info!("Simulating {} peer(s)", responders.len());

    let clock = SystemClock::new();
    let (air_tx, air_rx) = mpsc::unbounded_channel();
    let (input_tx, input_rx) = mpsc::channel::<HostInput>(256);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel();

    let collab = air_collaborators(air_tx, config.capabilities(), bss, clock.clone());
    let ctx = DeviceSecurityContext::new(config.station_settings(), collab, event_tx);

    // Spawn the simulated air (station frames in, replies and TX status out)
    let air_input = input_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = run_air(responders, air_rx, air_input).await {
            error!("Simulated air failed: {}", e);
        }
    });

    let own_addr = config.station.own_addr;
    let peers = sim.peers.iter().map(|p| p.batch_peer(own_addr)).collect();
    input_tx
        .send(HostInput::Command(Command::Batch {
            action: BatchAction::Authenticate,
            peers,
        }))
        .await?;

    let printer = async move {
        let mut deauth_pending = cli.deauth;
        let mut awaiting_deauth = 0usize;
        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    println!("{}", serde_json::to_string(&event)?);
                    match &event {
                        StationEvent::BatchComplete { peers, .. } if deauth_pending => {
                            deauth_pending = false;
                            awaiting_deauth = peers.len();
                            for p in peers {
                                input_tx
                                    .send(HostInput::Command(Command::Deauthenticate {
                                        own_addr: p.own_addr,
                                        peer_addr: p.peer_addr,
                                    }))
                                    .await?;
                            }
                        }
                        StationEvent::BatchComplete { .. } => break,
                        StationEvent::Deauthenticated { .. } => {
                            awaiting_deauth = awaiting_deauth.saturating_sub(1);
                            if awaiting_deauth == 0 {
                                break;
                            }
                        }
                        StationEvent::AuthStatus { .. } => {}
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }
        let _ = stop_tx.send(());
        anyhow::Ok(())
    };

    let (station_result, printer_result) =
        tokio::join!(runner::run(ctx, clock, input_rx, stop_rx), printer);
    station_result?;
    printer_result?;

    Ok(())
}
