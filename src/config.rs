//! Process-wide backend configuration.
//!
//! The network backend needs to know which hosts to probe and how long to
//! wait on them. Those settings are stored as JSON in the platform config
//! directory and can be overridden with the same environment variables the
//! SANE net backend honours:
//!
//! 1. `SANE_NET_HOSTS`: colon-separated host list, IPv6 literals in brackets
//! 2. `SANE_NET_TIMEOUT`: connect/read timeout in seconds

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default TCP port of `saned`.
pub const DEFAULT_PORT: u16 = 6566;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// A host running `saned`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SaneHost {
    /// Hostname or address, optionally with `:port`.
    pub hostname: String,
    /// Name shown to users; defaults to the hostname.
    #[serde(default)]
    pub display_name: String,
}

impl SaneHost {
    pub fn new(hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        Self {
            display_name: hostname.clone(),
            hostname,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// `(host, port)` pair to connect to.
    pub fn address(&self) -> (String, u16) {
        let hostname = self.hostname.trim();
        if let Some(rest) = hostname.strip_prefix('[') {
            if let Some((host, tail)) = rest.split_once(']') {
                let port = tail
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(DEFAULT_PORT);
                return (host.to_string(), port);
            }
        }
        // A single colon is a port; more than one is a bare IPv6 literal.
        if hostname.matches(':').count() == 1 {
            if let Some((host, port)) = hostname.split_once(':') {
                if let Ok(port) = port.parse() {
                    return (host.to_string(), port);
                }
            }
        }
        (hostname.to_string(), DEFAULT_PORT)
    }
}

/// Settings applied to the backend before it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaneConfig {
    pub hosts: Vec<SaneHost>,
    /// Hosts found at runtime (e.g. via service discovery); never saved.
    #[serde(skip)]
    pub transient_hosts: Vec<SaneHost>,
    pub timeout_secs: u64,
    /// Let the device choose the colour mode while previewing.
    pub preview_with_auto_color_mode: bool,
    /// Produce partial images while a scan is running.
    pub show_incomplete_scan_images: bool,
}

impl Default for SaneConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            transient_hosts: Vec::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            preview_with_auto_color_mode: true,
            show_incomplete_scan_images: true,
        }
    }
}

impl SaneConfig {
    /// `~/.config/sane-client/config.json` on Linux.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sane-client").join("config.json"))
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Load from the default location and apply environment overrides.
    pub fn load_default() -> Result<Self> {
        let mut config = match Self::default_path() {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var("SANE_NET_HOSTS").ok().as_deref(),
            std::env::var("SANE_NET_TIMEOUT").ok().as_deref(),
        );
    }

    fn apply_overrides(&mut self, hosts: Option<&str>, timeout: Option<&str>) {
        if let Some(hosts) = hosts {
            for host in split_host_list(hosts) {
                let host = SaneHost::new(host);
                if !self.all_hosts().any(|h| h.hostname == host.hostname) {
                    self.transient_hosts.push(host);
                }
            }
        }
        if let Some(timeout) = timeout {
            match timeout.trim().parse() {
                Ok(secs) => self.timeout_secs = secs,
                Err(_) => tracing::warn!("Ignoring invalid SANE_NET_TIMEOUT {:?}", timeout),
            }
        }
    }

    /// Persisted hosts followed by transient ones.
    pub fn all_hosts(&self) -> impl Iterator<Item = &SaneHost> {
        self.hosts.iter().chain(self.transient_hosts.iter())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Split `a:b:[fe80::1]` into `["a", "b", "[fe80::1]"]`.
fn split_host_list(list: &str) -> Vec<String> {
    let mut hosts = Vec::new();
    let mut current = String::new();
    let mut in_brackets = false;
    for c in list.chars() {
        match c {
            '[' => {
                in_brackets = true;
                current.push(c);
            }
            ']' => {
                in_brackets = false;
                current.push(c);
            }
            ':' if !in_brackets => {
                if !current.trim().is_empty() {
                    hosts.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        hosts.push(current.trim().to_string());
    }
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_host_list_keeps_ipv6_literals() {
        assert_eq!(
            split_host_list("scanner.local:[fe80::1]::10.0.0.5"),
            vec!["scanner.local", "[fe80::1]", "10.0.0.5"]
        );
    }

    #[test]
    fn test_host_address() {
        assert_eq!(SaneHost::new("10.0.0.5").address(), ("10.0.0.5".into(), 6566));
        assert_eq!(SaneHost::new("10.0.0.5:7000").address(), ("10.0.0.5".into(), 7000));
        assert_eq!(SaneHost::new("[::1]:7000").address(), ("::1".into(), 7000));
        assert_eq!(SaneHost::new("fe80::1").address(), ("fe80::1".into(), 6566));
    }

    #[test]
    fn test_overrides_add_transient_hosts_and_timeout() {
        let mut config = SaneConfig {
            hosts: vec![SaneHost::new("a")],
            ..SaneConfig::default()
        };
        config.apply_overrides(Some("a:b"), Some("5"));
        assert_eq!(config.transient_hosts, vec![SaneHost::new("b")]);
        assert_eq!(config.timeout(), Duration::from_secs(5));

        config.apply_overrides(None, Some("soon"));
        assert_eq!(config.timeout_secs, 5);
    }

    #[test]
    fn test_save_and_load_skip_transient_hosts() {
        let dir = std::env::temp_dir().join(format!("sane-client-config-{}", std::process::id()));
        let path = dir.join("config.json");
        let config = SaneConfig {
            hosts: vec![SaneHost::new("scanner").with_display_name("Office")],
            transient_hosts: vec![SaneHost::new("bonjour-host")],
            timeout_secs: 12,
            preview_with_auto_color_mode: false,
            show_incomplete_scan_images: true,
        };
        config.save(&path).unwrap();

        let loaded = SaneConfig::load(&path).unwrap();
        assert_eq!(loaded.hosts, config.hosts);
        assert!(loaded.transient_hosts.is_empty());
        assert_eq!(loaded.timeout_secs, 12);
        assert!(!loaded.preview_with_auto_color_mode);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = SaneConfig::load(Path::new("/nonexistent/sane-client.json")).unwrap();
        assert_eq!(config, SaneConfig::default());
    }
}
