// lib.rs

pub use std::sync::Arc;

pub use anyhow::bail;

mod error;
pub use error::*;

mod config;
pub use config::*;

mod state;
pub use state::*;

mod status;
pub use status::*;

mod payload;
pub use payload::*;

mod sensor;
pub use sensor::*;

mod transport;
pub use transport::*;

mod mqttsn;
pub use mqttsn::*;

mod session;
pub use session::*;

mod mqtt;
pub use mqtt::*;

mod measure;
pub use measure::*;

mod shell;
pub use shell::*;

mod supervisor;
pub use supervisor::*;

#[cfg(test)]
mod testutil;

pub const FW_VERSION: &str = env!("CARGO_PKG_VERSION");

// EOF
