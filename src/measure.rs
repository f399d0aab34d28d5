// measure.rs

use std::sync::Arc;

use log::*;
use tokio::time::{sleep, sleep_until, Duration, Instant};

use crate::*;

/// Why a sampling tick did not publish.
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error(transparent)]
    Sensor(#[from] SensorReadError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Sleep needed to wake `period` after the previous wake-up, given that
/// `elapsed` has already passed. Zero once the period is overrun.
pub fn remaining_sleep(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed)
}

/// Fixed-rate wake-up that absorbs the time spent working in between.
pub struct PeriodicWakeup {
    last: Instant,
    period: Duration,
}

impl PeriodicWakeup {
    pub fn new(period: Duration) -> Self {
        Self {
            last: Instant::now(),
            period,
        }
    }

    /// Wait until one period after the previous wake-up. If that moment
    /// has already passed, return immediately and restart the period from
    /// now instead of trying to catch up.
    pub async fn wait(&mut self) {
        let now = Instant::now();
        let remaining = remaining_sleep(self.period, now.saturating_duration_since(self.last));
        if remaining.is_zero() {
            self.last = now;
            return;
        }
        self.last += self.period;
        sleep_until(self.last).await;
    }
}

/// One sampling tick: read, log, format and publish at most-once.
pub async fn sample_once<S: PressureSensor, T: Transport>(
    sensor: &mut S,
    session: &MessagingSession<T>,
) -> Result<(), TickError> {
    let reading = read_sensor(sensor)?;
    let (whole, frac) = reading.temperature_parts();
    info!("Pressure: {}hPa", reading.pressure);
    info!("Temperature: {whole}.{frac:02}°C");

    let config = session.config();
    let payload = format_payload(&reading, &config.device_id);
    info!("[MQTT] Publishing data to MQTT Broker");
    session
        .publish(&config.topic_out, payload.as_bytes(), QoS::AtMostOnce)
        .await?;
    Ok(())
}

/// The telemetry loop. Waits for messaging setup to settle, then samples
/// forever; failed ticks are logged and skipped.
pub async fn poll_sensors<S: PressureSensor, T: Transport>(
    state: Arc<NodeState>,
    session: Arc<MessagingSession<T>>,
    mut sensor: S,
) -> anyhow::Result<()> {
    let mut session_state = session.watch_state();
    session_state
        .wait_for(|s| matches!(s, SessionState::Active | SessionState::Faulted))
        .await?;
    sleep(state.config.startup_pause()).await;

    info!("[###STARTING MEASUREMENTS###]");
    let mut wakeup = PeriodicWakeup::new(state.config.period());
    loop {
        if let Err(e) = sample_once(&mut sensor, &session).await {
            error!("Sampling tick failed: {e}");
        }
        sleep(state.config.tick_delay()).await;
        wakeup.wait().await;
    }
}


// EOF
