//! Session facade: one current channel, cooperative dispatch, keep-alive
//! supervision and preferred-host failover
//!
//! All work happens inside `dispatch`, the session's only suspension
//! point. A dispatch cycle parks on socket readiness (or the timeout),
//! then drives the current channel, any migration candidate, the ping
//! monitor and the detection timer, in that order.

use std::mem;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use transport::{
    Channel, ChannelRole, ChannelState, ConnectOptions, Endpoint, EndpointSet, InitProgress,
    PingMonitor, PingVerdict, Priority, ReadEvent, TransportError, WriteOutcome,
};

use crate::events::SessionEventSink;
use crate::failover::{FailoverController, LastAttempt};
use crate::policy::PreferredHostPolicy;
use crate::snapshot::ChannelInfoSnapshot;

/// The session's channel ownership, made explicit in the type
///
/// There is always exactly one current channel. During a fallback the
/// candidate exists alongside it but never replaces it until the
/// candidate's handshake completes.
pub enum CurrentChannel {
    Single(Channel),
    Migrating { current: Channel, candidate: Channel },
}

impl CurrentChannel {
    pub fn current(&self) -> &Channel {
        match self {
            CurrentChannel::Single(ch) => ch,
            CurrentChannel::Migrating { current, .. } => current,
        }
    }

    pub fn current_mut(&mut self) -> &mut Channel {
        match self {
            CurrentChannel::Single(ch) => ch,
            CurrentChannel::Migrating { current, .. } => current,
        }
    }

    pub fn is_migrating(&self) -> bool {
        matches!(self, CurrentChannel::Migrating { .. })
    }
}

pub struct Session {
    endpoints: EndpointSet,
    opts: ConnectOptions,
    channel: CurrentChannel,
    controller: FailoverController,
    ping: Option<PingMonitor>,
    sink: Box<dyn SessionEventSink>,
    role: ChannelRole,
}

impl Session {
    /// Open an outbound session against the set's primary endpoint
    ///
    /// The policy is validated up front; the connect itself completes
    /// asynchronously across `dispatch` calls.
    pub fn connect(
        endpoints: EndpointSet,
        opts: ConnectOptions,
        policy: PreferredHostPolicy,
        sink: Box<dyn SessionEventSink>,
    ) -> transport::Result<Session> {
        let controller = FailoverController::new(policy, &endpoints, Utc::now())?;
        let channel = Channel::connect(endpoints.primary(), &opts)?;
        Ok(Session {
            endpoints,
            opts,
            channel: CurrentChannel::Single(channel),
            controller,
            ping: None,
            sink,
            role: ChannelRole::Client,
        })
    }

    /// Open an outbound session from a configuration entry
    pub fn from_config(
        entry: &config::SessionEntry,
        sink: Box<dyn SessionEventSink>,
    ) -> transport::Result<Session> {
        let endpoints = entry.endpoint_set()?;
        let opts = entry.connect_options();
        let policy = PreferredHostPolicy::from_settings(&entry.preferred_host);
        Self::connect(endpoints, opts, policy, sink)
    }

    /// Wrap an accepted (provider-side) channel
    ///
    /// Inbound sessions never fail over: the controller stays inert and
    /// the snapshot always reports disabled.
    pub fn from_accepted(
        channel: Channel,
        sink: Box<dyn SessionEventSink>,
    ) -> transport::Result<Session> {
        let endpoints = EndpointSet::new(vec![channel.endpoint().clone()])?;
        let ping = match (channel.state(), channel.negotiated()) {
            (ChannelState::Active, Some(n)) => Some(PingMonitor::new(n.ping_timeout)),
            _ => None,
        };
        Ok(Session {
            endpoints,
            opts: ConnectOptions::default(),
            channel: CurrentChannel::Single(channel),
            controller: FailoverController::inert(),
            ping,
            sink,
            role: ChannelRole::Server,
        })
    }

    pub fn current_endpoint(&self) -> &Endpoint {
        self.channel.current().endpoint()
    }

    pub fn current_state(&self) -> ChannelState {
        self.channel.current().state()
    }

    pub fn is_migrating(&self) -> bool {
        self.channel.is_migrating()
    }

    pub fn endpoints(&self) -> &EndpointSet {
        &self.endpoints
    }

    /// Record which warm-standby member is active in `group`, steering
    /// future within-group fallback
    pub fn set_active_wsb_member(&mut self, group: &str, name: &str) -> transport::Result<()> {
        self.endpoints.set_active_wsb_member(group, name)
    }

    /// Run one dispatch cycle, parking at most `timeout` waiting for I/O
    ///
    /// Returns an error only for channel-fatal conditions that cannot be
    /// recovered by the normal reconnect path; everything transient is
    /// absorbed here.
    pub async fn dispatch(&mut self, timeout: Duration) -> transport::Result<()> {
        match &mut self.channel {
            CurrentChannel::Single(ch) => {
                tokio::select! {
                    _ = ch.wait_io() => {}
                    _ = tokio::time::sleep(timeout) => {}
                }
            }
            CurrentChannel::Migrating { current, candidate } => {
                tokio::select! {
                    _ = current.wait_io() => {}
                    _ = candidate.wait_io() => {}
                    _ = tokio::time::sleep(timeout) => {}
                }
            }
        }

        self.pump_current()?;
        self.pump_candidate();
        if let Some(error) = self.check_ping() {
            self.handle_current_fatal(error)?;
        }
        self.failover_tick(Utc::now());
        Ok(())
    }

    /// Queue an application payload on the current channel
    ///
    /// `BytesPending` means later `dispatch` cycles will finish the write;
    /// a resource-exhausted error means flush and retry, not failure.
    pub fn submit(&mut self, payload: Bytes, priority: Priority) -> transport::Result<WriteOutcome> {
        let outcome = self.channel.current_mut().write(payload, priority)?;
        if let Some(monitor) = self.ping.as_mut() {
            monitor.on_activity_sent(Instant::now());
        }
        Ok(outcome)
    }

    /// Replace the preferred-host policy at runtime
    ///
    /// Validation failures leave the previous policy in force. On success
    /// the detection timer re-arms immediately and the very next snapshot
    /// reflects the new fields.
    pub fn apply_preferred_host_policy(
        &mut self,
        policy: PreferredHostPolicy,
    ) -> transport::Result<()> {
        if self.role == ChannelRole::Server {
            return Err(TransportError::configuration(
                "Preferred host does not apply to accepted sessions",
                Some("preferred_host"),
            ));
        }
        self.controller
            .apply_policy(policy, &self.endpoints, Utc::now())
    }

    /// Trigger a fallback now instead of waiting for the detection timer
    ///
    /// Behaves exactly like the timer firing: a no-op when the current
    /// channel is already preferred or a migration is in flight. The timer
    /// re-arms from now either way; the configured schedule and interval
    /// are untouched.
    pub fn force_fallback(&mut self) -> transport::Result<()> {
        if self.role == ChannelRole::Server || !self.controller.is_enabled() {
            return Err(TransportError::configuration(
                "Preferred host is not enabled for this session",
                Some("preferred_host"),
            ));
        }
        if self.controller.is_migrating() {
            return Ok(());
        }
        let now = Utc::now();
        let current = self.channel.current().endpoint().clone();
        if self.controller.is_preferred(&current, &self.endpoints) {
            self.controller.rearm(now);
            return Ok(());
        }
        self.start_fallback(now);
        Ok(())
    }

    /// Point-in-time diagnostic view of the preferred-host machinery
    pub fn channel_info_snapshot(&self) -> ChannelInfoSnapshot {
        if self.role == ChannelRole::Server || !self.controller.is_enabled() {
            return ChannelInfoSnapshot::disabled();
        }
        let policy = self.controller.policy();
        ChannelInfoSnapshot {
            enabled: true,
            detection_schedule: policy.detection_schedule.clone().unwrap_or_default(),
            detection_interval_secs: policy.detection_interval_secs,
            channel_name: policy.preferred_channel_name.clone(),
            wsb_channel_name: policy.preferred_wsb_channel_name.clone().unwrap_or_default(),
            fall_back_within_wsb_group: policy.fall_back_within_wsb_group,
            is_channel_preferred: self
                .controller
                .is_preferred(self.channel.current().endpoint(), &self.endpoints),
            remaining_detection_secs: self.controller.remaining_secs(Utc::now()),
        }
    }

    /// Close everything the session holds; safe to call repeatedly
    pub fn close(&mut self) {
        match &mut self.channel {
            CurrentChannel::Single(ch) => ch.close(),
            CurrentChannel::Migrating { current, candidate } => {
                current.close();
                candidate.close();
            }
        }
        self.ping = None;
    }

    /// Drive the current channel: handshake progress, inbound events and
    /// pending writes
    fn pump_current(&mut self) -> transport::Result<()> {
        let mut fatal: Option<TransportError> = None;
        let mut came_up = false;
        {
            let ch = self.channel.current_mut();
            match ch.state() {
                ChannelState::Initializing => match ch.continue_init() {
                    Ok(InitProgress::Active) => came_up = true,
                    Ok(InitProgress::FdChange) => {
                        let endpoint = ch.endpoint().clone();
                        self.sink.on_fd_change(&endpoint);
                    }
                    Ok(InitProgress::InProgress) => {}
                    Err(e) => fatal = Some(e),
                },
                ChannelState::Active => {
                    loop {
                        match ch.read() {
                            Ok(ReadEvent::Message(payload)) => {
                                if let Some(monitor) = self.ping.as_mut() {
                                    monitor.on_activity_received();
                                }
                                self.sink.on_message(payload);
                            }
                            Ok(ReadEvent::Ping) => {
                                if let Some(monitor) = self.ping.as_mut() {
                                    monitor.on_activity_received();
                                }
                            }
                            Ok(ReadEvent::FdChange) => {
                                let endpoint = ch.endpoint().clone();
                                self.sink.on_fd_change(&endpoint);
                            }
                            Ok(ReadEvent::WouldBlock) => break,
                            Err(e) => {
                                fatal = Some(e);
                                break;
                            }
                        }
                    }
                    if fatal.is_none() {
                        match ch.flush() {
                            Ok(_) => {}
                            Err(e) if e.is_channel_fatal() => fatal = Some(e),
                            Err(_) => {}
                        }
                    }
                }
                ChannelState::Inactive | ChannelState::Closed => {}
            }
        }

        if came_up {
            self.on_current_active();
        }
        if let Some(error) = fatal {
            self.handle_current_fatal(error)?;
        }
        Ok(())
    }

    fn on_current_active(&mut self) {
        let (endpoint, ping_timeout) = {
            let ch = self.channel.current();
            let timeout = ch
                .negotiated()
                .map(|n| n.ping_timeout)
                .unwrap_or(self.opts.ping_timeout);
            (ch.endpoint().clone(), timeout)
        };
        info!(endpoint = %endpoint.name, "Channel active");
        self.ping = Some(PingMonitor::new(ping_timeout));
        self.sink.on_channel_up(&endpoint);
    }

    /// Drive a migration candidate's handshake, promoting or abandoning it
    fn pump_candidate(&mut self) {
        let mut outcome: Option<Result<(), TransportError>> = None;
        if let CurrentChannel::Migrating { candidate, .. } = &mut self.channel {
            match candidate.continue_init() {
                Ok(InitProgress::Active) => outcome = Some(Ok(())),
                Ok(_) => {}
                Err(e) => outcome = Some(Err(e)),
            }
        }
        match outcome {
            Some(Ok(())) => self.promote_candidate(Utc::now()),
            Some(Err(error)) => self.abandon_candidate(error, Utc::now()),
            None => {}
        }
    }

    /// The candidate reached ACTIVE: it becomes the current channel and
    /// the old one is retired
    fn promote_candidate(&mut self, now: DateTime<Utc>) {
        let placeholder = Channel::closed(self.channel.current().endpoint().clone());
        let prev = mem::replace(&mut self.channel, CurrentChannel::Single(placeholder));
        let (mut old, new) = match prev {
            CurrentChannel::Migrating { current, candidate } => (current, candidate),
            single => {
                self.channel = single;
                return;
            }
        };

        let old_endpoint = old.endpoint().clone();
        old.close();
        let endpoint = new.endpoint().clone();
        let ping_timeout = new
            .negotiated()
            .map(|n| n.ping_timeout)
            .unwrap_or(self.opts.ping_timeout);
        self.channel = CurrentChannel::Single(new);
        self.ping = Some(PingMonitor::new(ping_timeout));
        self.controller.complete_migration(LastAttempt::Success, now);

        info!(from = %old_endpoint.name, to = %endpoint.name, "Fallback complete");
        self.sink.on_channel_down(&old_endpoint, None);
        self.sink.on_fd_change(&endpoint);
        self.sink.on_channel_up(&endpoint);
        self.sink.on_fallback_complete(&endpoint, true);
    }

    /// The candidate failed; the current channel is untouched and the
    /// attempt is retried on the next detection cycle
    fn abandon_candidate(&mut self, error: TransportError, now: DateTime<Utc>) {
        let placeholder = Channel::closed(self.channel.current().endpoint().clone());
        let prev = mem::replace(&mut self.channel, CurrentChannel::Single(placeholder));
        let (current, mut candidate) = match prev {
            CurrentChannel::Migrating { current, candidate } => (current, candidate),
            single => {
                self.channel = single;
                return;
            }
        };

        warn!(target = %candidate.endpoint().name, %error, "Fallback candidate failed");
        candidate.close();
        let endpoint = current.endpoint().clone();
        self.channel = CurrentChannel::Single(current);
        self.controller
            .complete_migration(LastAttempt::Failed(error.to_string()), now);
        self.sink.on_fallback_complete(&endpoint, false);
    }

    fn check_ping(&mut self) -> Option<TransportError> {
        let monitor = self.ping.as_mut()?;
        let mut fatal = None;
        {
            let ch = self.channel.current_mut();
            if ch.state() != ChannelState::Active {
                return None;
            }
            let now = Instant::now();
            match monitor.check(now) {
                PingVerdict::Idle => {}
                PingVerdict::SendPing => match ch.send_ping() {
                    Ok(_) => monitor.on_activity_sent(now),
                    Err(e) if e.is_channel_fatal() => fatal = Some(e),
                    // Buffer pressure; retried next cycle
                    Err(_) => {}
                },
                PingVerdict::Lost => {
                    fatal = Some(TransportError::ping_timeout(monitor.timeout().as_secs()));
                }
            }
        }
        fatal
    }

    /// Fire the detection timer when due
    fn failover_tick(&mut self, now: DateTime<Utc>) {
        if !self.controller.due(now) {
            return;
        }
        // A cycle only starts against a live channel; the timer stays due
        // until one exists
        if self.channel.current().state() != ChannelState::Active {
            return;
        }
        let current = self.channel.current().endpoint().clone();
        if self.controller.is_preferred(&current, &self.endpoints) {
            debug!(endpoint = %current.name, "Already on preferred host");
            self.controller.rearm(now);
            return;
        }
        self.start_fallback(now);
    }

    /// Begin connecting a candidate toward the policy's target
    fn start_fallback(&mut self, now: DateTime<Utc>) {
        let Some(target) = self.controller.target(&self.endpoints).cloned() else {
            self.controller.rearm(now);
            return;
        };
        if self.controller.begin_migration(&target).is_err() {
            return;
        }
        let candidate = match Channel::connect(&target, &self.opts) {
            Ok(c) => c,
            Err(error) => {
                warn!(target = %target.name, %error, "Fallback connect failed");
                self.controller
                    .complete_migration(LastAttempt::Failed(error.to_string()), now);
                return;
            }
        };

        let placeholder = Channel::closed(target.clone());
        let prev = mem::replace(&mut self.channel, CurrentChannel::Single(placeholder));
        match prev {
            CurrentChannel::Single(current) => {
                self.channel = CurrentChannel::Migrating { current, candidate };
                self.sink.on_fallback_started(&target);
            }
            migrating => {
                // begin_migration guards against this; restore untouched
                self.channel = migrating;
            }
        }
    }

    /// The current channel hit a fatal condition: close it, notify, and
    /// reconnect through the ordinary endpoint rotation
    fn handle_current_fatal(&mut self, error: TransportError) -> transport::Result<()> {
        let endpoint = self.channel.current().endpoint().clone();
        let uptime = self.channel.current().created_at().elapsed();
        warn!(endpoint = %endpoint.name, %error, uptime_secs = uptime.as_secs(), "Current channel lost");

        if self.controller.is_migrating() {
            self.controller.complete_migration(
                LastAttempt::Failed("current channel lost during fallback".into()),
                Utc::now(),
            );
        }
        match &mut self.channel {
            CurrentChannel::Single(ch) => ch.close(),
            CurrentChannel::Migrating { current, candidate } => {
                current.close();
                candidate.close();
            }
        }
        self.ping = None;
        self.sink.on_channel_down(&endpoint, Some(&error));

        // Accepted sessions have nowhere to reconnect to
        if self.role == ChannelRole::Server {
            return Err(error);
        }

        let next = self.endpoints.next_after(&endpoint.name).clone();
        info!(endpoint = %next.name, "Reconnecting");
        let replacement = Channel::connect(&next, &self.opts)?;
        self.channel = CurrentChannel::Single(replacement);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;

    fn endpoints() -> EndpointSet {
        EndpointSet::new(vec![
            Endpoint::new("Channel_10", "127.0.0.1", 14002),
            Endpoint::new("Channel_13", "127.0.0.1", 14003),
        ])
        .unwrap()
    }

    #[test]
    fn test_connect_validates_policy_first() {
        let bad = PreferredHostPolicy::interval("Channel_99", 10);
        let err = Session::connect(
            endpoints(),
            ConnectOptions::default(),
            bad,
            Box::new(NullEventSink),
        )
        .err()
        .unwrap();
        assert!(matches!(err, TransportError::Configuration { .. }));
    }

    #[test]
    fn test_new_session_starts_on_primary() {
        let session = Session::connect(
            endpoints(),
            ConnectOptions::default(),
            PreferredHostPolicy::disabled(),
            Box::new(NullEventSink),
        )
        .unwrap();
        assert_eq!(session.current_endpoint().name, "Channel_10");
        assert_eq!(session.current_state(), ChannelState::Initializing);
        assert!(!session.is_migrating());
    }

    #[test]
    fn test_disabled_session_snapshot_is_default() {
        let mut session = Session::connect(
            endpoints(),
            ConnectOptions::default(),
            PreferredHostPolicy::disabled(),
            Box::new(NullEventSink),
        )
        .unwrap();
        assert_eq!(session.channel_info_snapshot(), ChannelInfoSnapshot::disabled());
        assert!(session.force_fallback().is_err());
    }

    #[test]
    fn test_snapshot_reflects_policy_immediately() {
        let mut session = Session::connect(
            endpoints(),
            ConnectOptions::default(),
            PreferredHostPolicy::interval("Channel_10", 30),
            Box::new(NullEventSink),
        )
        .unwrap();

        let mut policy = PreferredHostPolicy::scheduled("Channel_13", "*/5 * * * * *");
        policy.detection_interval_secs = 5;
        session.apply_preferred_host_policy(policy).unwrap();

        let snap = session.channel_info_snapshot();
        assert_eq!(snap.detection_schedule, "*/5 * * * * *");
        assert_eq!(snap.detection_interval_secs, 5);
        assert_eq!(snap.channel_name, "Channel_13");
        assert!(!snap.is_channel_preferred);
    }

    #[test]
    fn test_invalid_policy_update_keeps_previous() {
        let mut session = Session::connect(
            endpoints(),
            ConnectOptions::default(),
            PreferredHostPolicy::interval("Channel_10", 30),
            Box::new(NullEventSink),
        )
        .unwrap();

        let bad = PreferredHostPolicy::scheduled("Channel_13", "bogus");
        assert!(session.apply_preferred_host_policy(bad).is_err());
        assert_eq!(session.channel_info_snapshot().channel_name, "Channel_10");
    }
}
