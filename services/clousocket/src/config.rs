//! Server configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `clousocket.toml` in the working directory.
//!
//! # Sections
//! - `[network]`: `host`, `port`
//! - `[threading]`: `thread-limit` (bounds concurrent live sessions)
//! - `[redis]`: `url`, `max-connections`
//! - `[gatehouse]`: `thread-count`, optional `max-sessions`
//! - `[caching]`: `size` (deserializer memo capacity)
//! - `[heartbeat]`: `hb-min-interval`, `hb-max-interval`, `hb-init-interval`,
//!   `hb-timeout` (all milliseconds)

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub network: NetworkConfig,
    pub threading: ThreadingConfig,
    pub redis: RedisConfig,
    pub gatehouse: GatehouseConfig,
    pub caching: CachingConfig,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ThreadingConfig {
    /// Maximum number of concurrently live sessions.
    pub thread_limit: usize,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    /// Upstream connection pool size.
    pub max_connections: usize,
}

#[derive(Debug, Clone)]
pub struct GatehouseConfig {
    /// Admission worker count.
    pub thread_count: usize,
    /// Optional cap enforced by the session-capacity rule; `None` means
    /// uncapped.
    pub max_sessions: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CachingConfig {
    pub size: usize,
}

/// Heartbeat tuning, all in milliseconds.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub init_interval_ms: u64,
    pub timeout_ms: u64,
}

/// Where the upstream store actually lives, parsed out of `redis.url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreTarget {
    /// `host:port`, ready for `TcpStream::connect`.
    pub addr: String,
    pub password: Option<String>,
    pub db: u32,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    network: Option<RawNetworkConfig>,
    threading: Option<RawThreadingConfig>,
    redis: Option<RawRedisConfig>,
    gatehouse: Option<RawGatehouseConfig>,
    caching: Option<RawCachingConfig>,
    heartbeat: Option<RawHeartbeatConfig>,
}

#[derive(Debug, Deserialize)]
struct RawNetworkConfig {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawThreadingConfig {
    #[serde(rename = "thread-limit")]
    thread_limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawRedisConfig {
    url: Option<String>,
    #[serde(rename = "max-connections")]
    max_connections: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawGatehouseConfig {
    #[serde(rename = "thread-count")]
    thread_count: Option<usize>,
    #[serde(rename = "max-sessions")]
    max_sessions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawCachingConfig {
    size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawHeartbeatConfig {
    #[serde(rename = "hb-min-interval")]
    hb_min_interval: Option<u64>,
    #[serde(rename = "hb-max-interval")]
    hb_max_interval: Option<u64>,
    #[serde(rename = "hb-init-interval")]
    hb_init_interval: Option<u64>,
    #[serde(rename = "hb-timeout")]
    hb_timeout: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from a file path.
pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let network = match raw.network {
        Some(n) => NetworkConfig {
            host: n.host.unwrap_or_else(|| "127.0.0.1".to_owned()),
            port: n.port.unwrap_or(4921),
        },
        None => NetworkConfig {
            host: "127.0.0.1".to_owned(),
            port: 4921,
        },
    };

    let threading = ThreadingConfig {
        thread_limit: raw
            .threading
            .and_then(|t| t.thread_limit)
            .unwrap_or(1024),
    };
    if threading.thread_limit == 0 {
        return Err(ConfigError::InvalidValue(
            "threading.thread-limit must be at least 1".to_owned(),
        ));
    }

    let raw_redis = raw
        .redis
        .ok_or_else(|| ConfigError::MissingField("redis".to_owned()))?;
    let redis = RedisConfig {
        url: raw_redis
            .url
            .ok_or_else(|| ConfigError::MissingField("redis.url".to_owned()))?,
        max_connections: raw_redis.max_connections.unwrap_or(4),
    };
    if redis.max_connections == 0 {
        return Err(ConfigError::InvalidValue(
            "redis.max-connections must be at least 1".to_owned(),
        ));
    }
    // Fail at load time rather than on the first store command.
    let _ = parse_store_url(&redis.url)?;

    let gatehouse = match raw.gatehouse {
        Some(g) => GatehouseConfig {
            thread_count: g.thread_count.unwrap_or(2),
            max_sessions: g.max_sessions,
        },
        None => GatehouseConfig {
            thread_count: 2,
            max_sessions: None,
        },
    };
    if gatehouse.thread_count == 0 {
        return Err(ConfigError::InvalidValue(
            "gatehouse.thread-count must be at least 1".to_owned(),
        ));
    }

    let caching = CachingConfig {
        size: raw.caching.and_then(|c| c.size).unwrap_or(1024),
    };
    if caching.size == 0 {
        return Err(ConfigError::InvalidValue(
            "caching.size must be at least 1".to_owned(),
        ));
    }

    let heartbeat = match raw.heartbeat {
        Some(h) => HeartbeatConfig {
            min_interval_ms: h.hb_min_interval.unwrap_or(1000),
            max_interval_ms: h.hb_max_interval.unwrap_or(5000),
            init_interval_ms: h.hb_init_interval.unwrap_or(2000),
            timeout_ms: h.hb_timeout.unwrap_or(3000),
        },
        None => HeartbeatConfig {
            min_interval_ms: 1000,
            max_interval_ms: 5000,
            init_interval_ms: 2000,
            timeout_ms: 3000,
        },
    };
    if heartbeat.min_interval_ms > heartbeat.max_interval_ms {
        return Err(ConfigError::InvalidValue(format!(
            "heartbeat.hb-min-interval ({}) must not exceed hb-max-interval ({})",
            heartbeat.min_interval_ms, heartbeat.max_interval_ms
        )));
    }
    if heartbeat.timeout_ms == 0 {
        return Err(ConfigError::InvalidValue(
            "heartbeat.hb-timeout must be at least 1".to_owned(),
        ));
    }

    Ok(Config {
        network,
        threading,
        redis,
        gatehouse,
        caching,
        heartbeat,
    })
}

/// Parse `redis://[user:password@]host:port[/db]` into a [`StoreTarget`].
pub fn parse_store_url(url: &str) -> Result<StoreTarget, ConfigError> {
    let rest = url
        .strip_prefix("redis://")
        .ok_or_else(|| ConfigError::InvalidValue(format!("redis.url must start with redis://: '{url}'")))?;

    let (authority, db_part) = match rest.split_once('/') {
        Some((authority, db)) => (authority, Some(db)),
        None => (rest, None),
    };

    let (password, host_port) = match authority.rsplit_once('@') {
        Some((userinfo, host_port)) => {
            // Username (if any) is ignored; the store only checks the password.
            let password = match userinfo.split_once(':') {
                Some((_, password)) => password,
                None => userinfo,
            };
            let password = (!password.is_empty()).then(|| password.to_owned());
            (password, host_port)
        }
        None => (None, authority),
    };

    if host_port.is_empty() || !host_port.contains(':') {
        return Err(ConfigError::InvalidValue(format!(
            "redis.url must include host:port: '{url}'"
        )));
    }

    let db = match db_part {
        None | Some("") => 0,
        Some(db) => db.parse::<u32>().map_err(|_| {
            ConfigError::InvalidValue(format!("redis.url database index is not a number: '{url}'"))
        })?,
    };

    Ok(StoreTarget {
        addr: host_port.to_owned(),
        password,
        db,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
