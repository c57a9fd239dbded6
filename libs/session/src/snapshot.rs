//! Diagnostic snapshot of a session's preferred-host state
//!
//! The rendered `ph ...` lines are a compatibility surface: operators and
//! tooling locate them as substrings, so key names and the literal
//! `enabled`/`disabled` and `preferred`/`non-preferred` spellings are fixed.

use std::fmt;

/// Point-in-time view of the preferred-host machinery
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelInfoSnapshot {
    pub enabled: bool,
    pub detection_schedule: String,
    pub detection_interval_secs: u64,
    pub channel_name: String,
    pub wsb_channel_name: String,
    pub fall_back_within_wsb_group: bool,
    pub is_channel_preferred: bool,
    pub remaining_detection_secs: u64,
}

impl ChannelInfoSnapshot {
    /// The snapshot a disabled or provider-side session always reports:
    /// everything at its default, regardless of actual connectivity
    pub fn disabled() -> Self {
        Self::default()
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}

impl fmt::Display for ChannelInfoSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ph preferred host option: {}", on_off(self.enabled))?;
        writeln!(f, "ph detection time schedule: {}", self.detection_schedule)?;
        writeln!(
            f,
            "ph detection time interval: {}",
            self.detection_interval_secs
        )?;
        writeln!(f, "ph channel name: {}", self.channel_name)?;
        writeln!(f, "ph wsb channel name: {}", self.wsb_channel_name)?;
        writeln!(
            f,
            "ph fall back with in WSB group: {}",
            on_off(self.fall_back_within_wsb_group)
        )?;
        writeln!(
            f,
            "ph is channel preferred: {}",
            if self.is_channel_preferred {
                "preferred"
            } else {
                "non-preferred"
            }
        )?;
        write!(
            f,
            "ph remaining detection time: {}",
            self.remaining_detection_secs
        )
    }
}
