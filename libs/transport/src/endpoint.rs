//! Endpoint Set
//!
//! The ordered list of configured candidate endpoints a session may connect
//! to: a primary list, an optional designated preferred endpoint, and - for
//! warm-standby deployments - per-group tracking of the currently active
//! member. Endpoints are immutable once parsed from configuration and are
//! identified by name (e.g. `Channel_13`).

use crate::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One connectable (host, port) pair, optionally in a warm-standby group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Configuration name, unique within a session
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Connect through TLS
    #[serde(default)]
    pub tls: bool,
    /// Warm-standby group this endpoint belongs to, if any
    #[serde(default)]
    pub wsb_group: Option<String>,
}

impl Endpoint {
    /// Create a plain TCP endpoint
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            tls: false,
            wsb_group: None,
        }
    }

    /// Tag this endpoint as a member of a warm-standby group
    pub fn with_wsb_group(mut self, group: impl Into<String>) -> Self {
        self.wsb_group = Some(group.into());
        self
    }

    /// Enable TLS for this endpoint
    pub fn with_tls(mut self) -> Self {
        self.tls = true;
        self
    }

    /// `host:port` string for connecting
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject endpoints that can never be connected
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(TransportError::configuration(
                "Endpoint name must not be empty",
                Some("name"),
            ));
        }
        if self.host.is_empty() {
            return Err(TransportError::configuration(
                format!("Endpoint {} has an empty host", self.name),
                Some("host"),
            ));
        }
        if self.port == 0 {
            return Err(TransportError::configuration(
                format!("Endpoint {} has port 0", self.name),
                Some("port"),
            ));
        }
        Ok(())
    }
}

/// Ordered candidate endpoints plus warm-standby group state
#[derive(Debug, Clone, Default)]
pub struct EndpointSet {
    endpoints: Vec<Endpoint>,
    /// Active member per warm-standby group, tracked by endpoint name
    active_wsb: HashMap<String, String>,
}

impl EndpointSet {
    /// Build a set from configured endpoints
    ///
    /// The first listed member of each warm-standby group starts as that
    /// group's active member.
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(TransportError::configuration(
                "At least one endpoint is required",
                Some("endpoints"),
            ));
        }

        let mut active_wsb = HashMap::new();
        for endpoint in &endpoints {
            endpoint.validate()?;
            if endpoints
                .iter()
                .filter(|e| e.name == endpoint.name)
                .count()
                > 1
            {
                return Err(TransportError::configuration(
                    format!("Duplicate endpoint name: {}", endpoint.name),
                    Some("name"),
                ));
            }
            if let Some(group) = &endpoint.wsb_group {
                active_wsb
                    .entry(group.clone())
                    .or_insert_with(|| endpoint.name.clone());
            }
        }

        Ok(Self {
            endpoints,
            active_wsb,
        })
    }

    /// All endpoints in configuration order
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// First endpoint in the configured list (initial connect target)
    pub fn primary(&self) -> &Endpoint {
        &self.endpoints[0]
    }

    /// Look up an endpoint by name
    pub fn find(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    /// True when the set knows a warm-standby group by this name
    pub fn has_wsb_group(&self, group: &str) -> bool {
        self.active_wsb.contains_key(group)
    }

    /// The currently active member of a warm-standby group
    pub fn active_wsb_member(&self, group: &str) -> Option<&Endpoint> {
        let name = self.active_wsb.get(group)?;
        self.find(name)
    }

    /// Record which member of a group is currently active
    pub fn set_active_wsb_member(&mut self, group: &str, name: &str) -> Result<()> {
        let endpoint = self.find(name).ok_or_else(|| {
            TransportError::configuration(
                format!("Unknown endpoint name: {}", name),
                Some("name"),
            )
        })?;
        if endpoint.wsb_group.as_deref() != Some(group) {
            return Err(TransportError::configuration(
                format!("Endpoint {} is not a member of group {}", name, group),
                Some("wsb_group"),
            ));
        }
        self.active_wsb.insert(group.to_string(), name.to_string());
        Ok(())
    }

    /// Next endpoint on the normal retry path after a failure of `after`
    ///
    /// Round-robin from the failed entry; this is the reconnect order for
    /// channel-fatal errors, independent of the preferred-host path.
    pub fn next_after(&self, after: &str) -> &Endpoint {
        let pos = self
            .endpoints
            .iter()
            .position(|e| e.name == after)
            .unwrap_or(self.endpoints.len() - 1);
        &self.endpoints[(pos + 1) % self.endpoints.len()]
    }
}
