//! Session Configuration
//!
//! Loads per-session connection settings from TOML files with environment
//! variable overrides (`TICKLINE_` prefix): the ordered endpoint list,
//! warm-standby group membership, transport tuning, and the preferred-host
//! options consumed once at session construction.

use anyhow::{Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use transport::{ConnectOptions, Endpoint, EndpointSet};

/// Top-level configuration file structure
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    /// Named sessions, each with its own endpoint list and policy
    pub sessions: Vec<SessionEntry>,
}

/// One configured session
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionEntry {
    pub name: String,

    /// Candidate endpoints in retry order; the first is the initial target
    pub endpoints: Vec<EndpointEntry>,

    /// Transport tuning
    #[serde(default)]
    pub transport: TransportSettings,

    /// Preferred-host failover options
    #[serde(default)]
    pub preferred_host: PreferredHostSettings,
}

/// One endpoint entry
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EndpointEntry {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub wsb_group: Option<String>,
}

/// Transport tuning knobs with conservative defaults
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TransportSettings {
    pub ping_timeout_secs: u64,
    pub max_fragment_size: u32,
    pub connect_timeout_ms: u64,
    pub init_timeout_ms: u64,
    pub max_write_buffers: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        let opts = ConnectOptions::default();
        Self {
            ping_timeout_secs: opts.ping_timeout.as_secs(),
            max_fragment_size: opts.max_fragment_size,
            connect_timeout_ms: opts.connect_timeout.as_millis() as u64,
            init_timeout_ms: opts.init_timeout.as_millis() as u64,
            max_write_buffers: opts.max_write_buffers,
        }
    }
}

/// Preferred-host options as they appear in configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct PreferredHostSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Six-field cron expression with second resolution; wins over the
    /// interval when present
    #[serde(default)]
    pub detection_schedule: Option<String>,
    #[serde(default)]
    pub detection_interval_secs: u64,
    #[serde(default)]
    pub preferred_channel_name: String,
    #[serde(default)]
    pub preferred_wsb_channel_name: Option<String>,
    #[serde(default)]
    pub fall_back_within_wsb_group: bool,
}

impl SessionConfig {
    /// Load configuration from a TOML file with `TICKLINE_` env overrides
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading session configuration");

        let settings = Config::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("TICKLINE").separator("__"))
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        let config: SessionConfig = settings
            .try_deserialize()
            .context("Configuration does not match the expected schema")?;

        info!(sessions = config.sessions.len(), "Session configuration loaded");
        Ok(config)
    }

    /// Find a session entry by name
    pub fn session(&self, name: &str) -> Option<&SessionEntry> {
        self.sessions.iter().find(|s| s.name == name)
    }
}

impl SessionEntry {
    /// Build the transport endpoint set from this entry
    pub fn endpoint_set(&self) -> transport::Result<EndpointSet> {
        let endpoints = self
            .endpoints
            .iter()
            .map(|e| {
                let mut endpoint = Endpoint::new(e.name.clone(), e.host.clone(), e.port);
                endpoint.tls = e.tls;
                endpoint.wsb_group = e.wsb_group.clone();
                endpoint
            })
            .collect();
        EndpointSet::new(endpoints)
    }

    /// Build connect options from this entry's transport settings
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            ping_timeout: Duration::from_secs(self.transport.ping_timeout_secs),
            max_fragment_size: self.transport.max_fragment_size,
            connect_timeout: Duration::from_millis(self.transport.connect_timeout_ms),
            init_timeout: Duration::from_millis(self.transport.init_timeout_ms),
            max_write_buffers: self.transport.max_write_buffers,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    const SAMPLE: &str = r#"
[[sessions]]
name = "consumer_1"

[[sessions.endpoints]]
name = "Channel_10"
host = "md1.example.com"
port = 14002

[[sessions.endpoints]]
name = "Channel_13"
host = "md2.example.com"
port = 14002
tls = true

[sessions.transport]
ping_timeout_secs = 60
max_fragment_size = 6144
connect_timeout_ms = 5000
init_timeout_ms = 8000
max_write_buffers = 16

[sessions.preferred_host]
enabled = true
detection_schedule = "*/10 * * * * *"
detection_interval_secs = 10
preferred_channel_name = "Channel_13"
fall_back_within_wsb_group = false
"#;

    fn write_sample() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_sample_config() {
        let file = write_sample();
        let config = SessionConfig::load(file.path()).unwrap();

        let session = config.session("consumer_1").unwrap();
        assert_eq!(session.endpoints.len(), 2);
        assert!(session.endpoints[1].tls);
        assert_eq!(session.transport.ping_timeout_secs, 60);

        let ph = &session.preferred_host;
        assert!(ph.enabled);
        assert_eq!(ph.detection_schedule.as_deref(), Some("*/10 * * * * *"));
        assert_eq!(ph.preferred_channel_name, "Channel_13");
    }

    #[test]
    fn test_endpoint_set_and_options_conversion() {
        let file = write_sample();
        let config = SessionConfig::load(file.path()).unwrap();
        let session = config.session("consumer_1").unwrap();

        let set = session.endpoint_set().unwrap();
        assert_eq!(set.primary().name, "Channel_10");
        assert!(set.find("Channel_13").unwrap().tls);

        let opts = session.connect_options();
        assert_eq!(opts.ping_timeout, Duration::from_secs(60));
        assert_eq!(opts.connect_timeout, Duration::from_millis(5000));
        assert_eq!(opts.max_write_buffers, 16);
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let minimal = r#"
[[sessions]]
name = "bare"

[[sessions.endpoints]]
name = "Channel_1"
host = "localhost"
port = 14002
"#;
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(minimal.as_bytes()).unwrap();
        file.flush().unwrap();

        let config = SessionConfig::load(file.path()).unwrap();
        let session = config.session("bare").unwrap();
        assert!(!session.preferred_host.enabled);
        assert_eq!(
            session.transport.max_fragment_size,
            ConnectOptions::default().max_fragment_size
        );
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(SessionConfig::load(Path::new("/nonexistent/sessions.toml")).is_err());
    }
}
