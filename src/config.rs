//! Runtime configuration
//!
//! Settings come from an optional JSON file named by `LOOPBACK_RTC_CONFIG`,
//! then individual environment overrides. Anything not given falls back to
//! [`DemoConfig::default`].

use std::{env, fs, net::IpAddr, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::util::select_host_address;

pub const CONFIG_PATH_ENV: &str = "LOOPBACK_RTC_CONFIG";
pub const HTTP_ADDR_ENV: &str = "LOOPBACK_RTC_HTTP_ADDR";
pub const BIND_IP_ENV: &str = "LOOPBACK_RTC_BIND_IP";
pub const LOG_ENV: &str = "LOOPBACK_RTC_LOG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Listen address of the control page.
    pub http_addr: String,
    /// Address the call endpoints bind their UDP sockets to. When unset the
    /// first routable IPv4 interface is used.
    pub bind_ip: Option<IpAddr>,
    pub capture: CaptureConfig,
    /// How long `call` keeps the connection up before hanging up.
    pub call_hold_secs: u64,
    /// Default tracing filter, `RUST_LOG` takes precedence.
    pub log_filter: String,
}

/// Settings for the synthetic capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Stop after this many frames. `None` runs until the consumer goes away.
    pub frames: Option<u64>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:3000".to_string(),
            bind_ip: None,
            capture: CaptureConfig::default(),
            call_hold_secs: 5,
            log_filter: "info".to_string(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            frames: Some(90),
        }
    }
}

impl DemoConfig {
    /// Loads the file named by `LOOPBACK_RTC_CONFIG` (if any) and applies the
    /// environment overrides on top.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Ok(addr) = env::var(HTTP_ADDR_ENV) {
            config.http_addr = addr;
        }
        if let Ok(ip) = env::var(BIND_IP_ENV) {
            config.bind_ip = Some(
                ip.parse()
                    .with_context(|| format!("{BIND_IP_ENV} is not an IP address: {ip}"))?,
            );
        }
        if let Ok(filter) = env::var(LOG_ENV) {
            config.log_filter = filter;
        }

        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// The IP endpoints bind to: configured, else the first routable
    /// interface, else loopback.
    pub fn endpoint_ip(&self) -> IpAddr {
        self.bind_ip
            .or_else(select_host_address)
            .unwrap_or(IpAddr::from([127, 0, 0, 1]))
    }
}

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides `filter`.
/// Calling it more than once is harmless.
pub fn init_log(filter: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}
