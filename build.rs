// build.rs

use std::env;

fn main() -> anyhow::Result<()> {
    let broker_addr = env::var("BROKER_ADDR").unwrap_or_else(|_| "2001:660:5307:3000::68".into());
    let broker_port = env::var("BROKER_PORT").unwrap_or_else(|_| "1885".into());
    let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| "lpsnode".into());
    let topic_in = env::var("TOPIC_IN").unwrap_or_else(|_| "sensor/control".into());
    let topic_out = env::var("TOPIC_OUT").unwrap_or_else(|_| "sensor/telemetry".into());

    for var in ["BROKER_ADDR", "BROKER_PORT", "DEVICE_ID", "TOPIC_IN", "TOPIC_OUT"] {
        println!("cargo:rerun-if-env-changed={var}");
    }
    println!("cargo:rustc-env=BROKER_ADDR={broker_addr}");
    println!("cargo:rustc-env=BROKER_PORT={broker_port}");
    println!("cargo:rustc-env=DEVICE_ID={device_id}");
    println!("cargo:rustc-env=TOPIC_IN={topic_in}");
    println!("cargo:rustc-env=TOPIC_OUT={topic_out}");

    Ok(())
}

// EOF
