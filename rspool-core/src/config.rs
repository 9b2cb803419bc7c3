//! Per-upstream configuration, parsed from `redis://` URLs of the form
//! `redis://host:port/db?minpoolsize=5&cacheprefixes=user:,session:`.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::time::Duration;

use url::Url;

pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_MIN_POOL_SIZE: usize = 1;
pub const DEFAULT_MAX_POOL_SIZE: usize = 10;
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CACHE_SIZE_MB: usize = 100;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(360);

/// An error produced while parsing an upstream URL.
#[derive(Debug, PartialEq)]
pub enum ConfigError {
    InvalidUrl(String),
    InvalidScheme(String),
    MissingHost,
    InvalidDatabase(String),
    InvalidOption(&'static str, String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ConfigError::InvalidUrl(err) => write!(f, "invalid upstream url: {}", err),
            ConfigError::InvalidScheme(scheme) => {
                write!(f, "unsupported scheme: {} (expected redis)", scheme)
            }
            ConfigError::MissingHost => write!(f, "upstream url has no host"),
            ConfigError::InvalidDatabase(path) => write!(f, "invalid database index: {}", path),
            ConfigError::InvalidOption(key, value) => {
                write!(f, "invalid value for {}: {}", key, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Everything the proxy needs to know about one upstream: where it is, how
/// to size the connection pool, and whether (and how) to cache for it.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// `host:port` of the upstream server.
    pub address: String,
    /// Database index selected on every new connection; -1 means none.
    pub database: i64,
    /// Key prefixes the invalidator subscribes for. Empty disables the
    /// cache and the invalidator entirely.
    pub cache_prefixes: Vec<String>,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    /// Tag applied to logs for this upstream.
    pub label: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub cache_size_bytes: usize,
    pub cache_ttl: Duration,
    /// Issue `READONLY` on every new connection.
    pub readonly: bool,
}

impl UpstreamConfig {
    /// Parse an upstream URL. Every option falls back to its default when
    /// absent; an unparsable option value is an error rather than a silent
    /// default.
    pub fn from_url(raw: &str) -> Result<UpstreamConfig, ConfigError> {
        let url = Url::parse(raw).map_err(|err| ConfigError::InvalidUrl(err.to_string()))?;
        if url.scheme() != "redis" {
            return Err(ConfigError::InvalidScheme(url.scheme().to_string()));
        }
        let host = url.host_str().ok_or(ConfigError::MissingHost)?;
        let port = url.port().unwrap_or(DEFAULT_PORT);

        let path = url.path().trim_start_matches('/');
        let database = if path.is_empty() {
            -1
        } else {
            path.parse::<i64>()
                .ok()
                .filter(|db| *db >= 0)
                .ok_or_else(|| ConfigError::InvalidDatabase(path.to_string()))?
        };

        let mut config = UpstreamConfig {
            address: format!("{}:{}", host, port),
            database,
            cache_prefixes: Vec::new(),
            min_pool_size: DEFAULT_MIN_POOL_SIZE,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            label: String::new(),
            read_timeout: DEFAULT_IO_TIMEOUT,
            write_timeout: DEFAULT_IO_TIMEOUT,
            cache_size_bytes: DEFAULT_CACHE_SIZE_MB * 1024 * 1024,
            cache_ttl: DEFAULT_CACHE_TTL,
            readonly: false,
        };

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "minpoolsize" => {
                    config.min_pool_size = parse_option("minpoolsize", &value)?;
                }
                "maxpoolsize" => {
                    config.max_pool_size = parse_option("maxpoolsize", &value)?;
                }
                "label" => config.label = value.to_string(),
                "readtimeout" => {
                    config.read_timeout =
                        Duration::from_millis(parse_option("readtimeout", &value)?);
                }
                "writetimeout" => {
                    config.write_timeout =
                        Duration::from_millis(parse_option("writetimeout", &value)?);
                }
                "cacheprefixes" => {
                    config.cache_prefixes = value
                        .split(',')
                        .map(|prefix| prefix.trim())
                        .filter(|prefix| !prefix.is_empty())
                        .map(|prefix| prefix.to_string())
                        .collect();
                }
                "cachesizemb" => {
                    let mb: usize = parse_option("cachesizemb", &value)?;
                    config.cache_size_bytes = mb * 1024 * 1024;
                }
                "cachettlseconds" => {
                    config.cache_ttl = Duration::from_secs(parse_option("cachettlseconds", &value)?);
                }
                "readonly" => {
                    config.readonly = match value.as_ref() {
                        "true" | "1" => true,
                        "false" | "0" => false,
                        other => {
                            return Err(ConfigError::InvalidOption("readonly", other.to_string()))
                        }
                    };
                }
                // Unknown options are ignored so configs stay forward
                // compatible across proxy versions.
                _ => {}
            }
        }
        Ok(config)
    }

    /// The config for a dynamically discovered peer of this upstream: same
    /// options, different address.
    pub fn for_peer(&self, address: &str) -> UpstreamConfig {
        let mut config = self.clone();
        config.address = address.to_string();
        config
    }

    /// Whether this upstream gets a cache and an invalidator.
    pub fn caching_enabled(&self) -> bool {
        !self.cache_prefixes.is_empty()
    }
}

fn parse_option<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidOption(key, value.to_string()))
}
