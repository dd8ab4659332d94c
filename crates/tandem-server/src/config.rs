//! Server configuration: TOML file + CLI overrides.

use crate::relay::OverflowPolicy;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tandem_core::{RelayError, RelayResult, MAX_FRAME_SIZE};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub relay: RelaySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

/// `[relay]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    /// Handling of connections beyond the pair.
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Outbound queue depth per peer.
    #[serde(default = "default_peer_queue")]
    pub peer_queue: usize,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            overflow: OverflowPolicy::default(),
            max_frame_bytes: default_max_frame_bytes(),
            peer_queue: default_peer_queue(),
        }
    }
}

fn default_port() -> u16 {
    8080
}
fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_max_frame_bytes() -> usize {
    MAX_FRAME_SIZE
}
fn default_peer_queue() -> usize {
    64
}

impl ConfigFile {
    /// Parse a config file body.
    pub fn parse(content: &str) -> RelayResult<Self> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| RelayError::Config(format!("config parse error: {e}")))
    }
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub overflow: OverflowPolicy,
    pub max_frame_bytes: usize,
    pub peer_queue: usize,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_bind: Option<IpAddr>,
    ) -> RelayResult<Self> {
        // Load base config from file
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    ConfigFile::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::from_file(file_config, cli_port, cli_bind)
    }

    /// Merge CLI overrides into a parsed config file.
    pub fn from_file(
        file_config: ConfigFile,
        cli_port: Option<u16>,
        cli_bind: Option<IpAddr>,
    ) -> RelayResult<Self> {
        if file_config.relay.peer_queue == 0 {
            return Err(RelayError::Config("relay.peer_queue must be at least 1".into()));
        }

        Ok(Self {
            bind: cli_bind.unwrap_or(file_config.server.bind),
            port: cli_port.unwrap_or(file_config.server.port),
            overflow: file_config.relay.overflow,
            max_frame_bytes: file_config.relay.max_frame_bytes,
            peer_queue: file_config.relay.peer_queue,
        })
    }

    /// Address the WebSocket listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        let file = ConfigFile::default();
        Self {
            bind: file.server.bind,
            port: file.server.port,
            overflow: file.relay.overflow,
            max_frame_bytes: file.relay.max_frame_bytes,
            peer_queue: file.relay.peer_queue,
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
