use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use anyhow::Context;

use ota_gateway::{GatewayConfig, InviteConfig};
use ota_gateway::protocol::DEVICE_PORT;

/// Process configuration, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub http_port: u16,
    pub firmware_port: u16,
    pub spiffs_port: u16,
    /// Local IP the UDP invitations are sent from.
    pub public_ip: Option<IpAddr>,
    pub device_port: u16,
    pub max_upload_bytes: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let public_ip = match std::env::var("OTA_PUBLIC_IP") {
            Ok(v) if !v.is_empty() => Some(
                v.parse()
                    .with_context(|| format!("OTA_PUBLIC_IP is not an IP address: {}", v))?,
            ),
            _ => None,
        };

        Ok(Self {
            host: env_or("OTA_HOST", "0.0.0.0".parse()?)?,
            http_port: env_or("OTA_HTTP_PORT", 8180)?,
            firmware_port: env_or("OTA_FIRMWARE_PORT", 8181)?,
            spiffs_port: env_or("OTA_SPIFFS_PORT", 8182)?,
            public_ip,
            device_port: env_or("OTA_DEVICE_PORT", DEVICE_PORT)?,
            max_upload_bytes: env_or::<usize>("OTA_MAX_UPLOAD_MB", 10)? * 1024 * 1024,
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.http_port)
    }

    pub fn firmware_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.firmware_port)
    }

    pub fn spiffs_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.spiffs_port)
    }

    /// Protocol settings; timings keep their defaults.
    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            invite: InviteConfig {
                device_port: self.device_port,
                bind_ip: self.public_ip,
                ..InviteConfig::default()
            },
            ..GatewayConfig::default()
        }
    }
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .with_context(|| format!("invalid value for {}: {}", key, v)),
        _ => Ok(default),
    }
}
