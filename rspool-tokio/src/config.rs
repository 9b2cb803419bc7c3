//! Process-level configuration: how local endpoints are named and bound,
//! and the optional TOML file listing upstream URLs.

use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// Address family the local endpoints are served on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// Filesystem sockets named `<prefix><host>-<port>[-<db>]<suffix>`.
    Unix,
    /// Loopback TCP on ephemeral ports; the bound address is logged.
    Tcp,
}

impl FromStr for Network {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "unix" => Ok(Network::Unix),
            "tcp" => Ok(Network::Tcp),
            other => Err(format!("unknown network family: {}", other)),
        }
    }
}

/// How the per-upstream local endpoints are derived and bound.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub network: Network,
    pub prefix: String,
    pub suffix: String,
    /// Remove a stale socket file before binding.
    pub unlink: bool,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        EndpointOptions {
            network: Network::Unix,
            prefix: "/var/tmp/rspool-".to_string(),
            suffix: ".sock".to_string(),
            unlink: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    upstreams: Vec<String>,
}

/// Load the upstream URL list from a TOML file of the form
/// `upstreams = ["redis://localhost:6379?cacheprefixes=user:"]`.
pub fn load_file(path: impl AsRef<Path>) -> Result<Vec<String>, ConfigFileError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigFileError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let file: ConfigFile = toml::from_str(&raw).map_err(|source| ConfigFileError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    Ok(file.upstreams)
}
