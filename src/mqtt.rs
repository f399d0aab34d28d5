// mqtt.rs

use std::sync::Arc;

use log::*;
use tokio::time::{sleep, Duration};

use crate::*;

/// Backoff before reconnect attempt `attempt` (0-based): doubles from
/// `base`, capped at `max`.
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    base.checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
        .unwrap_or(max)
        .min(max)
}

/// The messaging task: warm up, set the session up, then run the receive
/// path until the session faults. Recovery from a fault is bounded by the
/// configured number of reconnect attempts; with none left the task parks.
#[allow(unreachable_code)]
pub async fn run_mqtt<T: Transport>(state: Arc<NodeState>, session: Arc<MessagingSession<T>>) -> anyhow::Result<()> {
    let config = &state.config;
    info!("Setting up MQTT-SN.");
    sleep(config.warmup()).await;

    let mut attempt = 0;
    loop {
        match session.setup(status_handler(state.clone())).await {
            Ok(()) => {
                attempt = 0;
                session.receive_until_fault().await;
                error!("MQTT session faulted.");
            }
            Err(e) => error!("MQTT setup failed: {e}"),
        }

        if attempt >= config.reconnect_retries {
            error!("MQTT giving up, session stays {}.", session.state());
            // we cannot return, otherwise the supervisor would stop the node
            loop {
                sleep(Duration::from_secs(3600)).await;
            }
        }

        let delay = reconnect_delay(
            attempt,
            Duration::from_secs(config.reconnect_base),
            Duration::from_secs(config.reconnect_max),
        );
        attempt += 1;
        warn!(
            "MQTT reconnect {attempt}/{} in {}s",
            config.reconnect_retries,
            delay.as_secs()
        );
        sleep(delay).await;
        session.reset().await;
    }
    Ok(())
}


// EOF
