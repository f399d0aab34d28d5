// bin/lpsnode.rs

use std::{env, path::PathBuf, sync::Arc};

use log::*;
use lpsnode::*;
use tokio::task::LocalSet;

const DEFAULT_CONFIG: &str = "lpsnode.cfg";

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("LPS sensor node v{FW_VERSION} to MQTT-SN");
    info!("Starting up.");

    let cfg_path = env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    #[cfg(feature = "reset_settings")]
    let config = {
        let c = NodeConfig::default();
        c.to_file(&cfg_path)?;
        c
    };

    #[cfg(not(feature = "reset_settings"))]
    let config = match NodeConfig::from_file(&cfg_path) {
        None => {
            error!("Could not read config, using defaults");
            let c = NodeConfig::default();
            if let Err(e) = c.to_file(&cfg_path) {
                error!("{e}");
            } else {
                info!("Successfully saved default config.");
            }
            c
        }

        // using settings saved earlier if we could find them
        Some(c) => c,
    };
    info!("My config:\n{config:#?}");

    let state = Arc::new(NodeState::new(config));
    let transport = Arc::new(MqttSnClient::new());
    let session = Arc::new(MessagingSession::new(
        transport.clone(),
        state.config.session.clone(),
        state.config.keep_alive(),
    ));
    let surface = CommandSurface::new(state.clone(), session.watch_state());

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let res = LocalSet::new().block_on(&runtime, async move {
        let mut sup = Supervisor::new();
        sup.spawn("mqtt_receiver", {
            let transport = transport.clone();
            async move { transport.run().await.map_err(anyhow::Error::from) }
        });
        sup.spawn("run_mqtt", run_mqtt(state.clone(), session.clone()));
        sup.spawn("poll_sensors", poll_sensors(state.clone(), session.clone(), SimulatedLps::default()));
        sup.spawn("run_shell", run_shell(surface));

        info!("Entering main loop...");
        sup.run().await
    });

    info!("main() finished.");
    res
}

// EOF
