use std::{future::Future, time::Duration};

use tokio::{
    select,
    signal::unix::{signal, SignalKind},
    time::{interval, MissedTickBehavior},
};
use tracing::debug;

// Functions

/// Runs `tick` immediately then every `period` until SIGINT or SIGTERM is received.
pub async fn repeat_until_sigint_or_sigterm<FUT: Future<Output = ()>, TICK: FnMut() -> FUT>(
    period: Duration,
    mut tick: TICK,
) -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            _ = sigint.recv() => {
                debug!("sigint received");
                return Ok(());
            },
            _ = sigterm.recv() => {
                debug!("sigterm received");
                return Ok(());
            },
            _ = ticker.tick() => tick().await,
        }
    }
}
