use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info};

use crate::state::SharedState;

const SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub otp_challenges: usize,
    pub interactions: usize,
    pub limiter_keys: usize,
}

/// Drop expired OTP challenges, interaction registrations and idle
/// rate-limiter windows.
pub fn sweep_once(state: &SharedState) -> SweepReport {
    SweepReport {
        otp_challenges: state.resolver.sweep(),
        interactions: state.manager.dispatcher().interactions().sweep(),
        limiter_keys: state.verify_limiter.cleanup(),
    }
}

pub async fn run(state: SharedState, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut ticker = interval(Duration::from_secs(SWEEP_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = sweep_once(&state);
                if report != SweepReport::default() {
                    debug!("sweeper: {:?}", report);
                }
            }
            _ = shutdown_rx.recv() => {
                info!("sweeper: shutdown signal received");
                break;
            }
        }
    }
}
