//! Session Layer
//!
//! The application-facing facade over the socket transport: a session
//! owns exactly one current channel, runs a cooperative dispatch loop,
//! supervises keep-alives, and migrates to a preferred host on a
//! detection timer (interval or six-field cron schedule). Inbound
//! (accepted) sessions get the same facade with failover inert.

pub mod events;
pub mod failover;
pub mod policy;
pub mod schedule;
pub mod session;
pub mod snapshot;

// Re-export commonly used types
pub use events::{NullEventSink, RecordingSink, SessionEvent, SessionEventSink};
pub use failover::{FailoverController, FailoverPhase, LastAttempt};
pub use policy::PreferredHostPolicy;
pub use schedule::CronSchedule;
pub use session::{CurrentChannel, Session};
pub use snapshot::ChannelInfoSnapshot;
