//! Preferred-host policy and its validation against an endpoint set

use config::PreferredHostSettings;
use serde::{Deserialize, Serialize};
use transport::{EndpointSet, TransportError};

use crate::schedule::CronSchedule;

/// Where and when a session should fall back to its preferred host
///
/// A disabled policy leaves the session on whichever endpoint ordinary
/// reconnect logic lands on. When enabled, the detection timer fires on
/// the cron `detection_schedule` when present, otherwise every
/// `detection_interval_secs` seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PreferredHostPolicy {
    pub enabled: bool,
    pub detection_schedule: Option<String>,
    pub detection_interval_secs: u64,
    pub preferred_channel_name: String,
    pub preferred_wsb_channel_name: Option<String>,
    pub fall_back_within_wsb_group: bool,
}

impl PreferredHostPolicy {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Interval-driven policy targeting `channel_name`
    pub fn interval(channel_name: impl Into<String>, interval_secs: u64) -> Self {
        Self {
            enabled: true,
            detection_interval_secs: interval_secs,
            preferred_channel_name: channel_name.into(),
            ..Self::default()
        }
    }

    /// Cron-driven policy targeting `channel_name`
    pub fn scheduled(channel_name: impl Into<String>, schedule: impl Into<String>) -> Self {
        Self {
            enabled: true,
            detection_schedule: Some(schedule.into()),
            preferred_channel_name: channel_name.into(),
            ..Self::default()
        }
    }

    pub fn from_settings(settings: &PreferredHostSettings) -> Self {
        Self {
            enabled: settings.enabled,
            detection_schedule: settings.detection_schedule.clone(),
            detection_interval_secs: settings.detection_interval_secs,
            preferred_channel_name: settings.preferred_channel_name.clone(),
            preferred_wsb_channel_name: settings.preferred_wsb_channel_name.clone(),
            fall_back_within_wsb_group: settings.fall_back_within_wsb_group,
        }
    }

    /// Reject an unusable policy before it replaces a working one
    ///
    /// A disabled policy is always valid. An enabled one must name a known
    /// endpoint, carry either a well-formed schedule or a positive interval,
    /// and any warm-standby group it names must exist in `endpoints`.
    pub fn validate(&self, endpoints: &EndpointSet) -> transport::Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.preferred_channel_name.is_empty() {
            return Err(TransportError::configuration(
                "Preferred channel name must be set when preferred host is enabled",
                Some("preferred_channel_name"),
            ));
        }
        if endpoints.find(&self.preferred_channel_name).is_none() {
            return Err(TransportError::configuration(
                format!(
                    "Preferred channel '{}' is not in the endpoint set",
                    self.preferred_channel_name
                ),
                Some("preferred_channel_name"),
            ));
        }

        match &self.detection_schedule {
            Some(expr) => {
                CronSchedule::parse(expr)?;
            }
            None => {
                if self.detection_interval_secs == 0 {
                    return Err(TransportError::configuration(
                        "Detection interval must be positive when no schedule is set",
                        Some("detection_interval_secs"),
                    ));
                }
            }
        }

        if let Some(group) = &self.preferred_wsb_channel_name {
            if !endpoints.has_wsb_group(group) {
                return Err(TransportError::configuration(
                    format!("Warm-standby group '{group}' is not in the endpoint set"),
                    Some("preferred_wsb_channel_name"),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::Endpoint;

    fn endpoints() -> EndpointSet {
        EndpointSet::new(vec![
            Endpoint::new("Channel_10", "md1.example.com", 14002),
            Endpoint::new("Channel_13", "md2.example.com", 14002),
            Endpoint::new("WSB_A_1", "wsb1.example.com", 14003).with_wsb_group("WSB_A"),
            Endpoint::new("WSB_A_2", "wsb2.example.com", 14003).with_wsb_group("WSB_A"),
        ])
        .unwrap()
    }

    #[test]
    fn test_disabled_policy_always_valid() {
        assert!(PreferredHostPolicy::disabled().validate(&endpoints()).is_ok());
    }

    #[test]
    fn test_interval_policy_valid() {
        let policy = PreferredHostPolicy::interval("Channel_10", 30);
        assert!(policy.validate(&endpoints()).is_ok());
    }

    #[test]
    fn test_unknown_endpoint_rejected() {
        let policy = PreferredHostPolicy::interval("Channel_99", 30);
        let err = policy.validate(&endpoints()).unwrap_err();
        assert!(matches!(err, TransportError::Configuration { .. }));
    }

    #[test]
    fn test_zero_interval_without_schedule_rejected() {
        let policy = PreferredHostPolicy::interval("Channel_10", 0);
        assert!(policy.validate(&endpoints()).is_err());
    }

    #[test]
    fn test_malformed_schedule_rejected() {
        let policy = PreferredHostPolicy::scheduled("Channel_10", "not a cron");
        assert!(policy.validate(&endpoints()).is_err());
    }

    #[test]
    fn test_schedule_overrides_interval_requirement() {
        let mut policy = PreferredHostPolicy::scheduled("Channel_10", "*/10 * * * * *");
        policy.detection_interval_secs = 0;
        assert!(policy.validate(&endpoints()).is_ok());
    }

    #[test]
    fn test_unknown_wsb_group_rejected() {
        let mut policy = PreferredHostPolicy::interval("Channel_10", 30);
        policy.preferred_wsb_channel_name = Some("WSB_B".into());
        policy.fall_back_within_wsb_group = true;
        assert!(policy.validate(&endpoints()).is_err());

        policy.preferred_wsb_channel_name = Some("WSB_A".into());
        assert!(policy.validate(&endpoints()).is_ok());
    }
}
