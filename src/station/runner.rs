//! Async host loop
//!
//! Feeds frames, transmit status reports and commands into a
//! [`DeviceSecurityContext`] and polls it whenever its next deadline passes.

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::{BatchAction, BatchPeer, DeviceSecurityContext};
use crate::ieee80211::MacAddr;
use crate::pasn::ExchangeParams;
use crate::time::SystemClock;

/// Control requests from the host
#[derive(Debug, Clone)]
pub enum Command {
    AuthStart(ExchangeParams),
    AuthStop,
    Batch {
        action: BatchAction,
        peers: Vec<BatchPeer>,
    },
    Deauthenticate {
        own_addr: MacAddr,
        peer_addr: MacAddr,
    },
}

/// Everything the driver and control interface hand to the station
#[derive(Debug, Clone)]
pub enum HostInput {
    Rx(Vec<u8>),
    TxStatus { frame: Vec<u8>, acked: bool },
    Command(Command),
}

/// Run the station until `shutdown` fires or the input channel closes.
///
/// `clock` must be the clock the context was built with so deadlines map
/// onto tokio's timer.
pub async fn run(
    mut ctx: DeviceSecurityContext,
    clock: SystemClock,
    mut inputs: mpsc::Receiver<HostInput>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    info!("station {} running", ctx.settings().own_addr);

    loop {
        let deadline = ctx
            .next_deadline()
            .map(|at| Instant::from_std(clock.instant_at(at)));

        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            input = inputs.recv() => match input {
                Some(input) => handle(&mut ctx, input),
                None => {
                    info!("host input closed");
                    break;
                }
            },
            _ = wait_until(deadline) => ctx.poll(),
        }
    }

    ctx.shutdown();
    Ok(())
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn handle(ctx: &mut DeviceSecurityContext, input: HostInput) {
    match input {
        HostInput::Rx(frame) => ctx.on_rx(&frame),
        HostInput::TxStatus { frame, acked } => ctx.on_tx_status(&frame, acked),
        HostInput::Command(cmd) => {
            debug!("command: {:?}", cmd);
            let result = match cmd {
                Command::AuthStart(params) => ctx.pasn_auth_start(params).map_err(Into::into),
                Command::AuthStop => {
                    ctx.pasn_auth_stop();
                    Ok(())
                }
                Command::Batch { action, peers } => ctx.trigger_batch(action, peers).map_err(Into::into),
                Command::Deauthenticate { own_addr, peer_addr } => ctx.deauthenticate(own_addr, peer_addr),
            };
            if let Err(e) = result {
                warn!("command rejected: {}", e);
            }
        }
    }
}
