//! Detection timer and migration state for preferred-host fallback
//!
//! The controller is pure bookkeeping: it decides *when* a fallback is due
//! and *where* it should land, while the session owns the channels and
//! performs the actual connect. Time flows in through explicit arguments
//! so cycles are testable without waiting on wall clocks.

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use transport::{Endpoint, EndpointSet, TransportError};

use crate::policy::PreferredHostPolicy;
use crate::schedule::CronSchedule;

/// Where the controller is in the detection cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverPhase {
    /// Policy disabled; the timer never fires
    Disabled,
    /// Waiting for the detection timer
    Armed { next_fire: DateTime<Utc> },
    /// A candidate channel is connecting; no new cycle may start
    Migrating,
}

/// Outcome of the most recent fallback attempt
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LastAttempt {
    #[default]
    None,
    Success,
    Failed(String),
}

#[derive(Debug)]
pub struct FailoverController {
    policy: PreferredHostPolicy,
    schedule: Option<CronSchedule>,
    phase: FailoverPhase,
    last_attempt: LastAttempt,
}

impl FailoverController {
    /// Build a controller from a validated policy, arming the timer when
    /// the policy is enabled
    pub fn new(
        policy: PreferredHostPolicy,
        endpoints: &EndpointSet,
        now: DateTime<Utc>,
    ) -> transport::Result<Self> {
        let mut controller = Self {
            policy: PreferredHostPolicy::disabled(),
            schedule: None,
            phase: FailoverPhase::Disabled,
            last_attempt: LastAttempt::None,
        };
        controller.apply_policy(policy, endpoints, now)?;
        Ok(controller)
    }

    /// A controller that never fires, for sessions without fallback
    pub fn inert() -> Self {
        Self {
            policy: PreferredHostPolicy::disabled(),
            schedule: None,
            phase: FailoverPhase::Disabled,
            last_attempt: LastAttempt::None,
        }
    }

    pub fn policy(&self) -> &PreferredHostPolicy {
        &self.policy
    }

    pub fn phase(&self) -> &FailoverPhase {
        &self.phase
    }

    pub fn is_enabled(&self) -> bool {
        self.policy.enabled
    }

    pub fn is_migrating(&self) -> bool {
        matches!(self.phase, FailoverPhase::Migrating)
    }

    pub fn last_attempt(&self) -> &LastAttempt {
        &self.last_attempt
    }

    /// Swap in a new policy, validating it first
    ///
    /// On any validation error the previous policy and timer stay in place.
    /// On success the detection timer re-arms from `now` under the new
    /// settings; an in-flight migration is left to finish and re-arms on
    /// completion.
    pub fn apply_policy(
        &mut self,
        policy: PreferredHostPolicy,
        endpoints: &EndpointSet,
        now: DateTime<Utc>,
    ) -> transport::Result<()> {
        policy.validate(endpoints)?;
        let schedule = match &policy.detection_schedule {
            Some(expr) if policy.enabled => Some(CronSchedule::parse(expr)?),
            _ => None,
        };

        info!(
            enabled = policy.enabled,
            preferred = %policy.preferred_channel_name,
            schedule = policy.detection_schedule.as_deref().unwrap_or(""),
            interval_secs = policy.detection_interval_secs,
            "Applying preferred host policy"
        );
        self.policy = policy;
        self.schedule = schedule;

        if !self.is_migrating() {
            self.rearm(now);
        }
        Ok(())
    }

    /// Re-arm the detection timer from `now`, or disarm when disabled
    pub fn rearm(&mut self, now: DateTime<Utc>) {
        if !self.policy.enabled {
            self.phase = FailoverPhase::Disabled;
            return;
        }
        let next_fire = match &self.schedule {
            Some(cron) => match cron.next_fire(now) {
                Some(t) => t,
                // Expression never matches again; effectively disarmed
                None => now + chrono::Duration::days(365 * 10),
            },
            None => now + chrono::Duration::seconds(self.policy.detection_interval_secs as i64),
        };
        debug!(next_fire = %next_fire, "Detection timer armed");
        self.phase = FailoverPhase::Armed { next_fire };
    }

    /// Whether the detection timer has fired
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        matches!(&self.phase, FailoverPhase::Armed { next_fire } if now >= *next_fire)
    }

    /// Whole seconds until the timer fires; 0 while disabled or migrating
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> u64 {
        match &self.phase {
            FailoverPhase::Armed { next_fire } => {
                (*next_fire - now).num_seconds().max(0) as u64
            }
            _ => 0,
        }
    }

    /// The endpoint a fallback should connect to
    ///
    /// With warm-standby fallback configured this is the currently active
    /// member of the preferred group, otherwise the named preferred channel.
    pub fn target<'a>(&self, endpoints: &'a EndpointSet) -> Option<&'a Endpoint> {
        match &self.policy.preferred_wsb_channel_name {
            Some(group) if self.policy.fall_back_within_wsb_group => {
                endpoints.active_wsb_member(group)
            }
            _ => endpoints.find(&self.policy.preferred_channel_name),
        }
    }

    /// Whether `current` already satisfies the policy, making a cycle a no-op
    pub fn is_preferred(&self, current: &Endpoint, endpoints: &EndpointSet) -> bool {
        if !self.policy.enabled {
            return false;
        }
        match self.target(endpoints) {
            Some(target) => target.name == current.name,
            None => false,
        }
    }

    /// Enter the migrating phase; fails if a migration is already running
    pub fn begin_migration(&mut self, target: &Endpoint) -> transport::Result<()> {
        if self.is_migrating() {
            return Err(TransportError::channel_state(
                "Fallback already in progress",
                "MIGRATING",
            ));
        }
        info!(target = %target.name, "Starting preferred host fallback");
        self.phase = FailoverPhase::Migrating;
        Ok(())
    }

    /// Record the attempt outcome and re-arm the timer from `now`
    pub fn complete_migration(&mut self, result: LastAttempt, now: DateTime<Utc>) {
        info!(result = ?result, "Preferred host fallback finished");
        self.last_attempt = result;
        self.rearm(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
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

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs as i64)
    }

    #[test]
    fn test_interval_arms_and_fires() {
        let eps = endpoints();
        let ctl =
            FailoverController::new(PreferredHostPolicy::interval("Channel_10", 30), &eps, at(0))
                .unwrap();
        assert!(!ctl.due(at(29)));
        assert!(ctl.due(at(30)));
        assert_eq!(ctl.remaining_secs(at(10)), 20);
    }

    #[test]
    fn test_schedule_arms_to_next_boundary() {
        let eps = endpoints();
        let ctl = FailoverController::new(
            PreferredHostPolicy::scheduled("Channel_10", "*/10 * * * * *"),
            &eps,
            at(3),
        )
        .unwrap();
        assert!(!ctl.due(at(9)));
        assert!(ctl.due(at(10)));
    }

    #[test]
    fn test_disabled_never_fires() {
        let eps = endpoints();
        let ctl = FailoverController::new(PreferredHostPolicy::disabled(), &eps, at(0)).unwrap();
        assert_eq!(*ctl.phase(), FailoverPhase::Disabled);
        assert!(!ctl.due(at(1_000_000)));
        assert_eq!(ctl.remaining_secs(at(0)), 0);
    }

    #[test]
    fn test_invalid_policy_leaves_state_untouched() {
        let eps = endpoints();
        let mut ctl =
            FailoverController::new(PreferredHostPolicy::interval("Channel_10", 30), &eps, at(0))
                .unwrap();
        let before = ctl.phase().clone();

        let bad = PreferredHostPolicy::interval("Channel_99", 30);
        assert!(ctl.apply_policy(bad, &eps, at(5)).is_err());
        assert_eq!(*ctl.phase(), before);
        assert_eq!(ctl.policy().preferred_channel_name, "Channel_10");
    }

    #[test]
    fn test_apply_policy_rearms_from_now() {
        let eps = endpoints();
        let mut ctl =
            FailoverController::new(PreferredHostPolicy::interval("Channel_10", 30), &eps, at(0))
                .unwrap();
        ctl.apply_policy(PreferredHostPolicy::interval("Channel_13", 50), &eps, at(20))
            .unwrap();
        assert!(!ctl.due(at(69)));
        assert!(ctl.due(at(70)));
    }

    #[test]
    fn test_migration_guard_is_exclusive() {
        let eps = endpoints();
        let mut ctl =
            FailoverController::new(PreferredHostPolicy::interval("Channel_10", 30), &eps, at(0))
                .unwrap();
        let target = eps.find("Channel_10").unwrap().clone();
        ctl.begin_migration(&target).unwrap();
        assert!(ctl.begin_migration(&target).is_err());
        assert_eq!(ctl.remaining_secs(at(0)), 0);

        ctl.complete_migration(LastAttempt::Success, at(40));
        assert_eq!(*ctl.last_attempt(), LastAttempt::Success);
        // Timer restarts from completion, not from the original schedule
        assert!(!ctl.due(at(69)));
        assert!(ctl.due(at(70)));
    }

    #[test]
    fn test_wsb_target_follows_active_member() {
        let eps = endpoints();
        let mut policy = PreferredHostPolicy::interval("Channel_10", 30);
        policy.preferred_wsb_channel_name = Some("WSB_A".into());
        policy.fall_back_within_wsb_group = true;
        let ctl = FailoverController::new(policy, &eps, at(0)).unwrap();

        assert_eq!(ctl.target(&eps).unwrap().name, "WSB_A_1");

        let mut eps2 = endpoints();
        eps2.set_active_wsb_member("WSB_A", "WSB_A_2").unwrap();
        assert_eq!(ctl.target(&eps2).unwrap().name, "WSB_A_2");
        assert!(ctl.is_preferred(eps2.find("WSB_A_2").unwrap(), &eps2));
        assert!(!ctl.is_preferred(eps2.find("Channel_10").unwrap(), &eps2));
    }

    #[test]
    fn test_preferred_check_without_wsb() {
        let eps = endpoints();
        let ctl =
            FailoverController::new(PreferredHostPolicy::interval("Channel_10", 30), &eps, at(0))
                .unwrap();
        assert!(ctl.is_preferred(eps.find("Channel_10").unwrap(), &eps));
        assert!(!ctl.is_preferred(eps.find("Channel_13").unwrap(), &eps));
    }
}
