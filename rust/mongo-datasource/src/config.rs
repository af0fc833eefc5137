use crate::backend::HttpBackendConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub api_key: Option<String>,
    pub backend: HttpBackendConfig,
    pub default_range: chrono::Duration,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    mongo_ds_listen_addr: Option<String>,
    #[serde(default)]
    mongo_ds_listen_host: Option<String>,
    #[serde(default)]
    mongo_ds_listen_port: Option<u16>,
    #[serde(default)]
    mongo_ds_backend_url: Option<String>,
    #[serde(default)]
    mongo_ds_backend_api_key: Option<String>,
    #[serde(default)]
    mongo_ds_api_key: Option<String>,
    #[serde(default = "default_backend_timeout_ms")]
    mongo_ds_backend_timeout_ms: u64,
    #[serde(default = "default_range_hours")]
    mongo_ds_default_range_hours: i64,
}

const fn default_backend_timeout_ms() -> u64 {
    30_000
}

const fn default_range_hours() -> i64 {
    6
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse MONGO_DS_* environment variables")?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let listen_addr = resolve_addr(
            raw.mongo_ds_listen_addr,
            raw.mongo_ds_listen_host,
            raw.mongo_ds_listen_port,
        )?;

        let default_range = chrono::Duration::try_hours(raw.mongo_ds_default_range_hours.max(1))
            .context("MONGO_DS_DEFAULT_RANGE_HOURS is out of range")?;

        let url = raw
            .mongo_ds_backend_url
            .filter(|url| !url.trim().is_empty())
            .context("MONGO_DS_BACKEND_URL must be set")?;

        Ok(Self {
            listen_addr,
            api_key: raw.mongo_ds_api_key.filter(|key| !key.is_empty()),
            backend: HttpBackendConfig {
                url,
                api_key: raw.mongo_ds_backend_api_key.filter(|key| !key.is_empty()),
                timeout: Duration::from_millis(raw.mongo_ds_backend_timeout_ms.max(1)),
            },
            default_range,
        })
    }
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid MONGO_DS_LISTEN_ADDR value")?
            .next()
            .context("MONGO_DS_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8490);
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}
