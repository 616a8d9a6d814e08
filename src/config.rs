use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::Result;

/// Connection defaults, optionally loaded from a TOML file. Command-line
/// flags override anything set here.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolConfig {
    /// Source CIMOM endpoint (host[:port]).
    #[serde(default = "default_url")]
    pub src_url: String,
    /// Target CIMOM endpoint (host[:port]).
    #[serde(default = "default_url")]
    pub target_url: String,
    /// Management namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            src_url: default_url(),
            target_url: default_url(),
            namespace: default_namespace(),
            user: None,
            password: None,
        }
    }
}

fn default_url() -> String {
    "localhost:5988".to_string()
}

fn default_namespace() -> String {
    "root/virt".to_string()
}

impl ToolConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let config: ToolConfig = toml::from_str(contents)?;
        Ok(config)
    }
}

/// Split a `host[:port]` endpoint. Only the hostname travels downstream;
/// the port is accepted for compatibility but the connection uses the
/// CIMOM default.
pub fn parse_host_port(url: &str) -> (String, Option<u16>) {
    match url.split_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().ok()),
        None => (url.to_string(), None),
    }
}
