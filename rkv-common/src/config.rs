//! # Configuration File Loader
//!
//! Purpose: Parse the line-based `key value` configuration file format used
//! to start the server, matching the original reference implementation's
//! config format (one directive per line, `#` comments, case-insensitive
//! keys).
//!
//! ## Design Principles
//! 1. **Plain Text, Not a Format**: no TOML/YAML dependency for half a dozen
//!    fields; a small hand-rolled scanner is the right tool here.
//! 2. **Forgiving Defaults**: any field absent from the file keeps its
//!    `Default` value.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{RkvError, RkvResult};

/// Server configuration loaded from a `redis.conf`-style file.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub append_only: bool,
    pub append_filename: String,
    pub max_clients: u32,
    /// This node's own address in the cluster (`host:port`); empty when not
    /// running in cluster mode.
    pub self_addr: String,
    /// Peer addresses, including `self_addr`, that make up the cluster ring.
    pub peers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "127.0.0.1".to_string(),
            port: 6379,
            append_only: false,
            append_filename: "appendonly.aof".to_string(),
            max_clients: 128,
            self_addr: String::new(),
            peers: Vec::new(),
        }
    }
}

impl Config {
    /// Loads configuration from a file path, falling back to defaults for
    /// anything the file does not mention.
    pub fn load(path: impl AsRef<Path>) -> RkvResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(Self::parse(&contents))
    }

    /// Parses configuration text directly; split out from `load` for tests.
    pub fn parse(text: &str) -> Self {
        let raw = parse_lines(text);
        let mut config = Config::default();

        if let Some(v) = raw.get("bind") {
            config.bind = v.clone();
        }
        if let Some(v) = raw.get("port") {
            if let Ok(port) = v.parse() {
                config.port = port;
            }
        }
        if let Some(v) = raw.get("appendonly") {
            config.append_only = is_yes(v);
        }
        if let Some(v) = raw.get("appendfilename") {
            config.append_filename = v.clone();
        }
        if let Some(v) = raw.get("maxclients") {
            if let Ok(max) = v.parse() {
                config.max_clients = max;
            }
        }
        if let Some(v) = raw.get("self") {
            config.self_addr = v.clone();
        }
        if let Some(v) = raw.get("peers") {
            config.peers = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config
    }

    /// True when `self`/`peers` name a cluster this node participates in.
    pub fn is_cluster_enabled(&self) -> bool {
        !self.self_addr.is_empty() && !self.peers.is_empty()
    }

    pub fn addr(&self) -> RkvResult<String> {
        if self.bind.is_empty() {
            return Err(RkvError::Protocol("empty bind address".into()));
        }
        Ok(format!("{}:{}", self.bind, self.port))
    }
}

fn is_yes(value: &str) -> bool {
    value.eq_ignore_ascii_case("yes")
}

fn parse_lines(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(space) = line.find(' ') else {
            continue;
        };
        let key = line[..space].trim().to_ascii_lowercase();
        let value = line[space + 1..].trim().to_string();
        map.insert(key, value);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_fields() {
        let text = "# comment\nbind 127.0.0.1\nport 7000\nappendonly yes\nappendfilename data.aof\nmaxclients 64\n";
        let config = Config::parse(text);
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.port, 7000);
        assert!(config.append_only);
        assert_eq!(config.append_filename, "data.aof");
        assert_eq!(config.max_clients, 64);
    }

    #[test]
    fn defaults_when_absent() {
        let config = Config::parse("");
        assert_eq!(config.port, 6379);
        assert!(!config.append_only);
    }

    #[test]
    fn parses_cluster_peers() {
        let text = "self 127.0.0.1:7000\npeers 127.0.0.1:7000, 127.0.0.1:7001,127.0.0.1:7002\n";
        let config = Config::parse(text);
        assert!(config.is_cluster_enabled());
        assert_eq!(config.peers.len(), 3);
    }
}
