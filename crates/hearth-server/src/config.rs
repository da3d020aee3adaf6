//! Server configuration.
//!
//! Configuration is read from a TOML file (default `hearth.toml`), then
//! overridden from the environment:
//! - `HEARTH_DOMAIN` - server domain
//! - `HEARTH_C2S_ADDR` - plain listener address
//!
//! ```toml
//! [server]
//! domain = "example.com"
//! c2s_addr = "0.0.0.0:5222"
//!
//! [karma]
//! init = 5
//! dec = 1
//!
//! [rate]
//! time = 25
//! points = 5
//!
//! [[instance]]
//! id = "local"
//! hosts = ["example.com", "*.example.com"]
//! blocklist = ["spam.example"]
//! max_body = 4096
//!
//! [[instance]]
//! id = "upstream"
//! uplink = true
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hearth_xmpp::handlers::{Blocklist, MaxBodyLength, NormalizeBody, SessionDelivery};
use hearth_xmpp::{
    ConnectionRegistry, InstanceRegistry, KarmaConfig, ParserLimits, Phase, RateLimitConfig,
    RouterConfig, XmppServerConfig,
};
use serde::Deserialize;
use thiserror::Error;

/// Configuration errors. A configuration is applied whole or not at all.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// `[server]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Domain announced to peers and used for stanzas without `to`
    pub domain: String,
    /// Plain listener address
    pub c2s_addr: SocketAddr,
    /// Outbound queue capacity per connection
    pub outbound_queue: usize,
    /// Maximum element depth per stream
    pub max_depth: usize,
    /// Maximum bytes in one stanza
    pub max_stanza_bytes: usize,
    /// Seconds between statistics flushes
    pub stats_interval: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        let server = XmppServerConfig::default();
        Self {
            domain: server.domain,
            c2s_addr: server.c2s_addr,
            outbound_queue: server.outbound_queue,
            max_depth: server.limits.max_depth,
            max_stanza_bytes: server.limits.max_stanza_bytes,
            stats_interval: server.stats_interval.as_secs(),
        }
    }
}

/// `[karma]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KarmaSection {
    pub init: i32,
    pub max: i32,
    pub inc: i32,
    pub dec: i32,
    pub penalty: i32,
    pub restore: i32,
    pub reset_meter: bool,
    /// Seconds between karma heartbeats
    pub heartbeat: u64,
}

impl Default for KarmaSection {
    fn default() -> Self {
        let karma = KarmaConfig::default();
        Self {
            init: karma.init,
            max: karma.max,
            inc: karma.inc,
            dec: karma.dec,
            penalty: karma.penalty,
            restore: karma.restore,
            reset_meter: karma.reset_meter,
            heartbeat: karma.heartbeat.as_secs(),
        }
    }
}

impl From<&KarmaSection> for KarmaConfig {
    fn from(section: &KarmaSection) -> Self {
        KarmaConfig {
            init: section.init,
            max: section.max,
            inc: section.inc,
            dec: section.dec,
            penalty: section.penalty,
            restore: section.restore,
            reset_meter: section.reset_meter,
            heartbeat: Duration::from_secs(section.heartbeat),
        }
    }
}

/// `[rate]`: connection attempts per source address. `time = 0` disables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateSection {
    /// Window in seconds
    pub time: u64,
    /// Connections allowed per window
    pub points: u32,
}

impl Default for RateSection {
    fn default() -> Self {
        let rate = RateLimitConfig::default();
        Self {
            time: rate.window.as_secs(),
            points: rate.max_points,
        }
    }
}

/// `[tls]`: direct-TLS listener.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsSection {
    pub addr: Option<SocketAddr>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

/// `[[instance]]`
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    /// Domain patterns: `host`, `*.suffix` or `*`
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Take stanzas for domains no instance matches
    #[serde(default)]
    pub uplink: bool,
    /// Sender domains whose stanzas are refused
    #[serde(default)]
    pub blocklist: Vec<String>,
    /// Longest accepted `<body/>`, in characters
    #[serde(default)]
    pub max_body: Option<usize>,
    /// Trim message bodies before delivery
    #[serde(default)]
    pub normalize_body: bool,
}

/// Main configuration struct
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub karma: KarmaSection,
    pub rate: RateSection,
    pub tls: TlsSection,
    #[serde(rename = "instance")]
    pub instances: Vec<InstanceConfig>,
}

impl Config {
    /// Load, apply environment overrides and validate.
    ///
    /// A missing file means defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let config = Self::parse(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::info!("No config file found at {:?}, using defaults", path);
            Config::default()
        };

        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text without validating.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `HEARTH_*` overrides using `lookup` to read variables.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(domain) = lookup("HEARTH_DOMAIN") {
            self.server.domain = domain;
        }
        if let Some(addr) = lookup("HEARTH_C2S_ADDR") {
            self.server.c2s_addr = addr.parse().map_err(|_| ConfigError::Env {
                var: "HEARTH_C2S_ADDR",
                value: addr.clone(),
            })?;
        }
        Ok(())
    }

    /// Check the configuration as a whole.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server_config()?;

        let mut ids = HashSet::new();
        let mut uplink: Option<&str> = None;
        for instance in &self.instances {
            if instance.id.is_empty() {
                return Err(ConfigError::Invalid("instance id must not be empty".into()));
            }
            if !ids.insert(instance.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate instance id '{}'",
                    instance.id
                )));
            }
            if instance.hosts.is_empty() && !instance.uplink {
                return Err(ConfigError::Invalid(format!(
                    "instance '{}' has no hosts",
                    instance.id
                )));
            }
            if instance.uplink {
                if let Some(first) = uplink {
                    return Err(ConfigError::Invalid(format!(
                        "both '{}' and '{}' are marked uplink",
                        first, instance.id
                    )));
                }
                uplink = Some(instance.id.as_str());
            }
        }

        self.build_registry(&Arc::new(ConnectionRegistry::new()))?;
        Ok(())
    }

    /// Settings for the stream server.
    pub fn server_config(&self) -> Result<XmppServerConfig, ConfigError> {
        let config = XmppServerConfig {
            c2s_addr: self.server.c2s_addr,
            tls_addr: self.tls.addr,
            tls_cert_path: self.tls.cert.clone(),
            tls_key_path: self.tls.key.clone(),
            domain: self.server.domain.clone(),
            karma: KarmaConfig::from(&self.karma),
            rate: RateLimitConfig {
                max_points: self.rate.points,
                window: Duration::from_secs(self.rate.time),
            },
            limits: ParserLimits {
                max_depth: self.server.max_depth,
                max_stanza_bytes: self.server.max_stanza_bytes,
            },
            outbound_queue: self.server.outbound_queue,
            stats_interval: Duration::from_secs(self.server.stats_interval),
        };
        config
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(config)
    }

    /// Settings for the router.
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            default_domain: self.server.domain.clone(),
        }
    }

    /// Build the routing registry described by `[[instance]]`.
    ///
    /// Without any instance, the server domain gets one that delivers to
    /// live streams.
    pub fn build_registry(
        &self,
        connections: &Arc<ConnectionRegistry>,
    ) -> Result<InstanceRegistry, ConfigError> {
        let mut builder = InstanceRegistry::builder();

        if self.instances.is_empty() {
            builder.instance("local", [self.server.domain.as_str()]).handler(
                "local",
                Phase::Delivery,
                SessionDelivery::new(Arc::clone(connections)),
            );
        }

        for instance in &self.instances {
            let id = instance.id.as_str();
            builder.instance(id, instance.hosts.iter().map(String::as_str));
            if instance.uplink {
                builder.uplink(id);
            }

            if instance.normalize_body {
                builder.handler(id, Phase::PreDelivery, NormalizeBody);
            }
            if !instance.blocklist.is_empty() {
                builder.handler(
                    id,
                    Phase::Conditional,
                    Blocklist::new(instance.blocklist.iter().cloned()),
                );
            }
            if let Some(max) = instance.max_body {
                builder.handler(id, Phase::Conditional, MaxBodyLength::new(max));
            }
            builder.handler(
                id,
                Phase::Delivery,
                SessionDelivery::new(Arc::clone(connections)),
            );
        }

        builder
            .build()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
