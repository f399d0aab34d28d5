// config.rs

use std::{fmt, fs, path::Path, time::Duration};

use anyhow::bail;
use crc::{Crc, CRC_32_ISCSI};
use log::*;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

pub const CONFIG_BUF_SIZE: usize = 512;
pub const DEVICE_ID_MAX: usize = 32;

const DEFAULT_BROKER_PORT: u16 = 1885;
const DEFAULT_WARMUP: u64 = 10;
const DEFAULT_STARTUP_PAUSE: u64 = 3;
const DEFAULT_TICK_DELAY: u64 = 2;
const DEFAULT_PERIOD: u64 = 55;
const DEFAULT_KEEP_ALIVE: u64 = 360;
const DEFAULT_RECONNECT_BASE: u64 = 2;
const DEFAULT_RECONNECT_MAX: u64 = 60;

/// Device identifier embedded in payloads and the inbound topic.
///
/// Bounded so that the longest payload still fits [`crate::PAYLOAD_CAPACITY`],
/// and free of characters that would break the hand-assembled JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DeviceId {
    type Error = ConfigError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        if id.is_empty() || id.len() > DEVICE_ID_MAX {
            return Err(ConfigError::DeviceIdLength {
                len: id.len(),
                max: DEVICE_ID_MAX,
            });
        }
        if let Some(c) = id.chars().find(|c| matches!(c, '"' | '\\') || c.is_control()) {
            return Err(ConfigError::DeviceIdCharacter(c));
        }
        Ok(DeviceId(id))
    }
}

impl TryFrom<&str> for DeviceId {
    type Error = ConfigError;

    fn try_from(id: &str) -> Result<Self, Self::Error> {
        DeviceId::try_from(id.to_string())
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broker coordinates, fixed for the lifetime of the process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub broker_addr: String,
    pub broker_port: u16,
    pub topic_in: String,
    pub topic_out: String,
    pub device_id: DeviceId,
}

impl SessionConfig {
    /// Control topic this node listens on: `<topic_in>/<device_id>`.
    pub fn inbound_topic(&self) -> String {
        format!("{}/{}", self.topic_in, self.device_id)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            broker_addr: option_env!("BROKER_ADDR").unwrap_or("::1").into(),
            broker_port: option_env!("BROKER_PORT")
                .unwrap_or("-")
                .parse()
                .unwrap_or(DEFAULT_BROKER_PORT),
            topic_in: option_env!("TOPIC_IN").unwrap_or("sensor/control").into(),
            topic_out: option_env!("TOPIC_OUT").unwrap_or("sensor/telemetry").into(),
            device_id: option_env!("DEVICE_ID")
                .and_then(|id| DeviceId::try_from(id).ok())
                .unwrap_or_else(|| DeviceId("lpsnode".into())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub session: SessionConfig,

    // all delays in seconds
    pub warmup: u64,
    pub startup_pause: u64,
    pub tick_delay: u64,
    pub period: u64,
    pub keep_alive: u64,

    pub reconnect_retries: u32,
    pub reconnect_base: u64,
    pub reconnect_max: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            warmup: DEFAULT_WARMUP,
            startup_pause: DEFAULT_STARTUP_PAUSE,
            tick_delay: DEFAULT_TICK_DELAY,
            period: DEFAULT_PERIOD,
            keep_alive: DEFAULT_KEEP_ALIVE,
            reconnect_retries: 0,
            reconnect_base: DEFAULT_RECONNECT_BASE,
            reconnect_max: DEFAULT_RECONNECT_MAX,
        }
    }
}

impl NodeConfig {
    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup)
    }
    pub fn startup_pause(&self) -> Duration {
        Duration::from_secs(self.startup_pause)
    }
    pub fn tick_delay(&self) -> Duration {
        Duration::from_secs(self.tick_delay)
    }
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period)
    }
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive)
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        let crc = Crc::<u32>::new(&CRC_32_ISCSI);
        let digest = crc.digest();
        match postcard::from_bytes_crc32::<NodeConfig>(b, digest) {
            Ok(c) => {
                info!("Successfully parsed config.");
                Some(c)
            }
            Err(e) => {
                error!("Cannot parse config: {e:?}");
                None
            }
        }
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let mut buf = [0u8; CONFIG_BUF_SIZE];
        let crc = Crc::<u32>::new(&CRC_32_ISCSI);
        let digest = crc.digest();
        match postcard::to_slice_crc32(self, &mut buf, digest) {
            Ok(d) => Ok(d.to_vec()),
            Err(e) => bail!("Cannot encode config to buffer {e:?}"),
        }
    }

    pub fn from_file(path: &Path) -> Option<Self> {
        info!("Reading config from {}...", path.display());
        let b = match fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                error!("Config read error {e}");
                return None;
            }
        };
        info!("Got {sz} bytes. Parsing config...", sz = b.len());
        Self::from_bytes(&b)
    }

    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        let data = self.to_bytes()?;
        info!("Encoded config to {sz} bytes. Saving to {}...", path.display(), sz = data.len());
        match fs::write(path, data) {
            Ok(_) => {
                info!("Config saved.");
                Ok(())
            }
            Err(e) => bail!("Cannot save config: {e}"),
        }
    }
}


// EOF
