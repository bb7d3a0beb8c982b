//! Configuration for the driver service.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use drender_protocol::{MachineImage, SoftwareTag};

/// Service configuration loaded from `DRENDER_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on for HTTP connections.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Broker coordinates for the worker frame channel.
    pub broker: BrokerConfig,

    /// Driver timing and capacity tunables.
    pub driver: DriverConfig,

    /// Software package to machine image mapping.
    pub images: ImageCatalog,

    /// Whether we're in development mode (mock cloud providers).
    pub dev_mode: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("DRENDER_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8090".to_string())
            .parse()?;

        let log_level = std::env::var("DRENDER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("DRENDER_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            listen_addr,
            log_level,
            broker: BrokerConfig::from_env(),
            driver: DriverConfig::default(),
            images: ImageCatalog::from_env(),
            dev_mode,
        })
    }
}

/// Coordinates and credentials of the worker-to-driver broker.
///
/// The broker host is learned from the first START request; everything else
/// is fixed per deployment.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub port: u16,
    pub queue: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: 5672,
            queue: "drender.driver.frames".to_string(),
            username: None,
            password: None,
        }
    }
}

impl BrokerConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("DRENDER_BROKER_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            queue: std::env::var("DRENDER_BROKER_QUEUE").unwrap_or(defaults.queue),
            username: std::env::var("DRENDER_BROKER_USERNAME").ok(),
            password: std::env::var("DRENDER_BROKER_PASSWORD").ok(),
        }
    }
}

/// Timing and capacity tunables for the driver core.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Period between liveness probes per instance.
    pub heartbeat_interval: Duration,

    /// Budget for a single health probe.
    pub probe_timeout: Duration,

    /// Period between completion sweeps per project.
    pub sweep_interval: Duration,

    /// Budget for spawning a batch of machines.
    pub spawn_timeout: Duration,

    /// Budget for a reboot plus its health verification.
    pub restart_timeout: Duration,

    /// Budget for a termination request.
    pub terminate_timeout: Duration,

    /// Budget for bucket creation and object existence checks.
    pub storage_timeout: Duration,

    /// Poll period while waiting for a rebooted machine to come back.
    pub probe_poll: Duration,

    /// Maximum concurrent cloud operations.
    pub cloud_pool_size: usize,

    /// Capacity of the driver event channel.
    pub event_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            spawn_timeout: Duration::from_secs(8 * 60),
            restart_timeout: Duration::from_secs(5 * 60),
            terminate_timeout: Duration::from_secs(8 * 60),
            storage_timeout: Duration::from_secs(60),
            probe_poll: Duration::from_secs(10),
            cloud_pool_size: 10,
            event_capacity: 256,
        }
    }
}

/// Maps a project's software tag to the machine image its workers boot.
#[derive(Debug, Clone)]
pub struct ImageCatalog {
    images: HashMap<String, MachineImage>,
}

impl Default for ImageCatalog {
    fn default() -> Self {
        let mut images = HashMap::new();
        images.insert("blender".to_string(), MachineImage::new("ami-0b1e2render3d"));
        images.insert("maya".to_string(), MachineImage::new("ami-0c4d5render6e"));
        Self { images }
    }
}

impl ImageCatalog {
    /// Catalog with defaults plus `DRENDER_IMAGE_<TAG>=<ami>` overrides.
    pub fn from_env() -> Self {
        let mut catalog = Self::default();
        for (key, value) in std::env::vars() {
            if let Some(tag) = key.strip_prefix("DRENDER_IMAGE_") {
                if !value.is_empty() {
                    catalog
                        .images
                        .insert(tag.to_ascii_lowercase(), MachineImage::new(value));
                }
            }
        }
        catalog
    }

    /// Registers or replaces an image for a software tag.
    pub fn with_image(mut self, tag: impl Into<String>, image: MachineImage) -> Self {
        self.images.insert(tag.into().to_ascii_lowercase(), image);
        self
    }

    /// Looks up the image for a software tag, case-insensitively.
    pub fn lookup(&self, software: &SoftwareTag) -> Option<&MachineImage> {
        self.images.get(&software.normalized())
    }
}
