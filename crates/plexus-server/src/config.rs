//! Server configuration: TOML file + CLI overrides.

use crate::registry::{DuplicateIdentity, RegistryConfig};
use plexus_core::{PlexusError, PlexusResult, WireFormat, DEFAULT_MAX_MESSAGE_SIZE};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub registry: RegistrySection,
}

impl ConfigFile {
    pub fn parse(content: &str) -> PlexusResult<Self> {
        toml::from_str(content).map_err(|e| PlexusError::Config(format!("config parse error: {e}")))
    }
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Only upgrade requests under this path are accepted.
    #[serde(default = "default_path")]
    pub path: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            path: default_path(),
        }
    }
}

/// `[registry]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySection {
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default)]
    pub wire_format: WireFormat,
    #[serde(default)]
    pub duplicate_identity: DuplicateIdentity,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
            inbound_capacity: default_inbound_capacity(),
            max_message_size: default_max_message_size(),
            wire_format: WireFormat::default(),
            duplicate_identity: DuplicateIdentity::default(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_path() -> String {
    "/".to_string()
}
fn default_mailbox_capacity() -> usize {
    256
}
fn default_inbound_capacity() -> usize {
    64
}
fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub mailbox_capacity: Option<usize>,
    pub wire_format: Option<WireFormat>,
    pub duplicate_identity: Option<DuplicateIdentity>,
}

/// Resolved server configuration (CLI overrides applied, values checked).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub path_prefix: String,
    pub registry: RegistryConfig,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: &ConfigOverrides) -> PlexusResult<Self> {
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
        Self::resolve(file_config, overrides)
    }

    /// Merge overrides into a parsed file and validate the result.
    pub fn resolve(file: ConfigFile, overrides: &ConfigOverrides) -> PlexusResult<Self> {
        let bind = overrides.bind.clone().unwrap_or(file.server.bind);
        let port = overrides.port.unwrap_or(file.server.port);
        let ip: IpAddr = bind
            .parse()
            .map_err(|_| PlexusError::Config(format!("invalid bind address: {bind}")))?;

        let mut path_prefix = overrides.path.clone().unwrap_or(file.server.path);
        if !path_prefix.starts_with('/') {
            path_prefix.insert(0, '/');
        }

        let registry = RegistryConfig {
            mailbox_capacity: overrides
                .mailbox_capacity
                .unwrap_or(file.registry.mailbox_capacity),
            inbound_capacity: file.registry.inbound_capacity,
            max_message_size: file.registry.max_message_size,
            wire_format: overrides.wire_format.unwrap_or(file.registry.wire_format),
            duplicate_identity: overrides
                .duplicate_identity
                .unwrap_or(file.registry.duplicate_identity),
        };
        registry.validate()?;

        Ok(Self {
            bind_addr: SocketAddr::new(ip, port),
            path_prefix,
            registry,
        })
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
