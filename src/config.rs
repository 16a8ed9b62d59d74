//! Node configuration and its TOML file format.

use std::{
    fs,
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use serde::Deserialize;
use tracing::warn;

use crate::common::{DEFAULT_K, ID_SIZE};

/// Number of peers contacted in parallel per lookup round.
pub const DEFAULT_ALPHA: usize = 3;
/// At most this many bootstrap peers are honored.
pub const MAX_BOOTSTRAP_PEERS: usize = 3;

pub const DEFAULT_API_ADDRESS: &str = "127.0.0.1:7401";
pub const DEFAULT_P2P_ADDRESS: &str = "127.0.0.1:7402";
pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(12 * 60 * 60);
pub const DEFAULT_REPUBLISH_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_FOUND_VALUE_TTL: Duration = Duration::from_secs(15);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(20 * 60);
pub const DEFAULT_ROUND_DELAY: Duration = Duration::from_millis(10);
pub const DEFAULT_ROUND_DELAY_CEILING: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Address the client API listens on.
    ///
    /// Defaults to [DEFAULT_API_ADDRESS]
    pub api_address: SocketAddr,
    /// Address the P2P listener binds to and advertises to other peers.
    /// Port `0` picks a free port, which is then advertised instead.
    ///
    /// Defaults to [DEFAULT_P2P_ADDRESS]
    pub p2p_address: SocketAddr,
    /// Peers to contact on startup, at most [MAX_BOOTSTRAP_PEERS].
    ///
    /// Defaults to none, where this node starts as the sole member of its network.
    pub bootstrap: Vec<SocketAddr>,
    /// Host key file to derive this node's Id from.
    ///
    /// Defaults to None, where a random Id is used.
    pub hostkey: Option<PathBuf>,
    /// Bucket size and replication factor.
    pub k: usize,
    /// Lookup fan-out per round.
    pub alpha: usize,
    /// Upper bound for the ttl of values stored on behalf of other peers.
    pub max_ttl: Duration,
    /// How often a stored value is re-announced to the closest peers.
    pub republish_interval: Duration,
    /// How long a value learned from a FOUND_VALUE reply is cached.
    pub found_value_ttl: Duration,
    /// How long to wait for a PONG.
    pub ping_timeout: Duration,
    /// Idle deadline of an accepted connection.
    pub idle_timeout: Duration,
    /// Pause between lookup rounds that made progress.
    ///
    /// A round without progress ends the lookup once the pause is past
    /// `round_delay_ceiling`, and otherwise grows the pause tenfold.
    pub round_delay: Duration,
    pub round_delay_ceiling: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_address: SocketAddr::from(([127, 0, 0, 1], 7401)),
            p2p_address: SocketAddr::from(([127, 0, 0, 1], 7402)),
            bootstrap: Vec::new(),
            hostkey: None,
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            max_ttl: DEFAULT_MAX_TTL,
            republish_interval: DEFAULT_REPUBLISH_INTERVAL,
            found_value_ttl: DEFAULT_FOUND_VALUE_TTL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            round_delay: DEFAULT_ROUND_DELAY,
            round_delay_ceiling: DEFAULT_ROUND_DELAY_CEILING,
        }
    }
}

/// Configuration file structure.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    hostkey: Option<PathBuf>,
    #[serde(default)]
    dht: DhtSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DhtSection {
    api_address: Option<String>,
    p2p_address: Option<String>,
    #[serde(default)]
    bootstrap: Vec<String>,
    k: Option<usize>,
    alpha: Option<usize>,
    max_ttl: Option<u64>,
    republish_interval: Option<u64>,
    found_value_ttl: Option<u64>,
    key_size: Option<usize>,
    ping_timeout_ms: Option<u64>,
    idle_timeout_secs: Option<u64>,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Config File Format
    ///
    /// ```toml
    /// hostkey = "hostkey.pem"
    ///
    /// [dht]
    /// api_address = "127.0.0.1:7401"
    /// p2p_address = "127.0.0.1:7402"
    /// bootstrap = ["127.0.0.1:7502"]
    /// k = 20
    /// alpha = 3
    /// max_ttl = 43200
    /// republish_interval = 3600
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|error| ConfigError::Io {
            path: path.display().to_string(),
            error,
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string, filling missing keys with defaults.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        let dht = file.dht;
        let defaults = Config::default();

        if let Some(key_size) = dht.key_size {
            if key_size != ID_SIZE {
                return Err(ConfigError::InvalidValue {
                    key: "key_size",
                    reason: format!("only {} byte identifiers are supported", ID_SIZE),
                });
            }
        }

        let k = dht.k.unwrap_or(defaults.k);
        if k == 0 {
            return Err(ConfigError::InvalidValue {
                key: "k",
                reason: "must be at least 1".to_string(),
            });
        }

        let alpha = dht.alpha.unwrap_or(defaults.alpha);
        if alpha == 0 {
            return Err(ConfigError::InvalidValue {
                key: "alpha",
                reason: "must be at least 1".to_string(),
            });
        }

        let mut bootstrap = dht
            .bootstrap
            .iter()
            .map(|address| parse_address(address))
            .collect::<Result<Vec<_>, _>>()?;

        if bootstrap.len() > MAX_BOOTSTRAP_PEERS {
            warn!(
                configured = bootstrap.len(),
                "Ignoring bootstrap peers beyond the first {}", MAX_BOOTSTRAP_PEERS
            );
            bootstrap.truncate(MAX_BOOTSTRAP_PEERS);
        }

        let max_ttl = duration(
            "max_ttl",
            dht.max_ttl,
            Duration::from_secs,
            defaults.max_ttl,
        )?;
        let republish_interval = duration(
            "republish_interval",
            dht.republish_interval,
            Duration::from_secs,
            defaults.republish_interval,
        )?;
        let found_value_ttl = duration(
            "found_value_ttl",
            dht.found_value_ttl,
            Duration::from_secs,
            defaults.found_value_ttl,
        )?;
        let ping_timeout = duration(
            "ping_timeout_ms",
            dht.ping_timeout_ms,
            Duration::from_millis,
            defaults.ping_timeout,
        )?;
        let idle_timeout = duration(
            "idle_timeout_secs",
            dht.idle_timeout_secs,
            Duration::from_secs,
            defaults.idle_timeout,
        )?;

        if ping_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "ping_timeout_ms",
                reason: "must be at least 1".to_string(),
            });
        }

        if idle_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "idle_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Config {
            api_address: dht
                .api_address
                .as_deref()
                .map(parse_address)
                .transpose()?
                .unwrap_or(defaults.api_address),
            p2p_address: dht
                .p2p_address
                .as_deref()
                .map(parse_address)
                .transpose()?
                .unwrap_or(defaults.p2p_address),
            bootstrap,
            hostkey: file.hostkey,
            k,
            alpha,
            max_ttl,
            republish_interval,
            found_value_ttl,
            ping_timeout,
            idle_timeout,
            round_delay: defaults.round_delay,
            round_delay_ceiling: defaults.round_delay_ceiling,
        })
    }
}

/// Convert a configured number into a [Duration], rejecting values too large to
/// be added to the current time.
fn duration(
    key: &'static str,
    value: Option<u64>,
    unit: fn(u64) -> Duration,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };

    let duration = unit(value);
    if Instant::now().checked_add(duration).is_none() {
        return Err(ConfigError::InvalidValue {
            key,
            reason: format!("{value} is out of range"),
        });
    }

    Ok(duration)
}

/// Parse `ip:port`, `[ipv6]:port` or `host:port`.
fn parse_address(address: &str) -> Result<SocketAddr, ConfigError> {
    address
        .to_socket_addrs()
        .ok()
        .and_then(|mut addresses| addresses.next())
        .ok_or_else(|| ConfigError::InvalidAddress(address.to_string()))
}

/// Errors that can occur during config loading. All of them are fatal at startup.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {error}")]
    Io {
        path: String,
        #[source]
        error: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Malformed address: {0:?}")]
    InvalidAddress(String),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}
