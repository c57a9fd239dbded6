//! Six-field cron expression evaluation for detection scheduling
//!
//! Field order is `sec min hour day-of-month month day-of-week` with second
//! resolution. Supported syntax per field: `*`, single values, ranges `a-b`,
//! steps `*/n` and `a-b/n`, and comma-separated lists. Day-of-week uses
//! 0..=6 with Sunday as 0; 7 is accepted as an alias for Sunday.
//!
//! When both day-of-month and day-of-week are restricted, a date matches if
//! either field matches, following the traditional cron rule.

use chrono::{DateTime, Datelike, Days, NaiveDate, Timelike, Utc};
use transport::TransportError;

/// Hard cap on the forward search so a never-matching expression
/// (e.g. `0 0 0 31 2 *`) terminates instead of spinning
const MAX_SEARCH_DAYS: u64 = 366 * 5;

/// A parsed six-field cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    seconds: Vec<u32>,
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse a six-field expression, rejecting malformed input synchronously
    pub fn parse(expr: &str) -> transport::Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(TransportError::configuration(
                format!(
                    "Cron expression must have 6 fields (sec min hour dom mon dow), got {}",
                    fields.len()
                ),
                Some("detection_schedule"),
            ));
        }

        let seconds = parse_field(fields[0], 0, 59)?;
        let minutes = parse_field(fields[1], 0, 59)?;
        let hours = parse_field(fields[2], 0, 23)?;
        let days_of_month = parse_field(fields[3], 1, 31)?;
        let months = parse_field(fields[4], 1, 12)?;
        let mut days_of_week = parse_field(fields[5], 0, 7)?;

        // 7 is Sunday, same as 0
        if days_of_week.contains(&7) {
            days_of_week.retain(|&d| d != 7);
            if !days_of_week.contains(&0) {
                days_of_week.insert(0, 0);
            }
        }

        Ok(Self {
            expr: expr.to_string(),
            dom_restricted: fields[3] != "*",
            dow_restricted: fields[5] != "*",
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
        })
    }

    /// The original expression text
    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// Earliest firing time strictly after `after`, or `None` if the
    /// expression never matches within the search horizon
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // Sub-second remainder is dropped; search starts at the next whole second
        let start = (after + chrono::Duration::seconds(1)).with_nanosecond(0)?;
        let start_date = start.date_naive();

        for day_offset in 0..MAX_SEARCH_DAYS {
            let date = start_date.checked_add_days(Days::new(day_offset))?;
            if !self.date_matches(date) {
                continue;
            }
            let floor = if day_offset == 0 {
                (start.hour(), start.minute(), start.second())
            } else {
                (0, 0, 0)
            };
            if let Some((h, m, s)) = self.first_time_at_or_after(floor) {
                return date.and_hms_opt(h, m, s).map(|ndt| ndt.and_utc());
            }
        }
        None
    }

    fn date_matches(&self, date: NaiveDate) -> bool {
        if !self.months.contains(&date.month()) {
            return false;
        }
        let dom_ok = self.days_of_month.contains(&date.day());
        let dow_ok = self
            .days_of_week
            .contains(&date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }

    /// Smallest (hour, minute, second) in the schedule at or after `floor`
    fn first_time_at_or_after(&self, floor: (u32, u32, u32)) -> Option<(u32, u32, u32)> {
        let (fh, fm, fs) = floor;
        for &h in &self.hours {
            if h < fh {
                continue;
            }
            let min_floor = if h == fh { fm } else { 0 };
            for &m in &self.minutes {
                if m < min_floor {
                    continue;
                }
                let sec_floor = if h == fh && m == fm { fs } else { 0 };
                for &s in &self.seconds {
                    if s >= sec_floor {
                        return Some((h, m, s));
                    }
                }
            }
        }
        None
    }
}

/// Expand one field to a sorted, deduplicated list of values
fn parse_field(field: &str, min: u32, max: u32) -> transport::Result<Vec<u32>> {
    let mut values = Vec::new();
    for part in field.split(',') {
        expand_part(part, min, max, &mut values)?;
    }
    values.sort_unstable();
    values.dedup();
    if values.is_empty() {
        return Err(malformed(field));
    }
    Ok(values)
}

fn expand_part(part: &str, min: u32, max: u32, out: &mut Vec<u32>) -> transport::Result<()> {
    let (range, step) = match part.split_once('/') {
        Some((r, s)) => {
            let step: u32 = s.parse().map_err(|_| malformed(part))?;
            if step == 0 {
                return Err(malformed(part));
            }
            (r, step)
        }
        None => (part, 1),
    };

    let (lo, hi) = if range == "*" {
        (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
        let lo: u32 = a.parse().map_err(|_| malformed(part))?;
        let hi: u32 = b.parse().map_err(|_| malformed(part))?;
        if lo > hi {
            return Err(malformed(part));
        }
        (lo, hi)
    } else {
        let v: u32 = range.parse().map_err(|_| malformed(part))?;
        (v, v)
    };

    if lo < min || hi > max {
        return Err(TransportError::configuration(
            format!("Cron value out of range {min}..={max}: '{part}'"),
            Some("detection_schedule"),
        ));
    }

    out.extend((lo..=hi).step_by(step as usize));
    Ok(())
}

fn malformed(part: &str) -> TransportError {
    TransportError::configuration(
        format!("Malformed cron field: '{part}'"),
        Some("detection_schedule"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_parse_rejects_wrong_field_count() {
        assert!(CronSchedule::parse("*/10 * * * *").is_err());
        assert!(CronSchedule::parse("* * * * * * *").is_err());
        assert!(CronSchedule::parse("").is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range_and_garbage() {
        assert!(CronSchedule::parse("60 * * * * *").is_err());
        assert!(CronSchedule::parse("* * 24 * * *").is_err());
        assert!(CronSchedule::parse("* * * 0 * *").is_err());
        assert!(CronSchedule::parse("* * * * 13 *").is_err());
        assert!(CronSchedule::parse("*/0 * * * * *").is_err());
        assert!(CronSchedule::parse("5-2 * * * * *").is_err());
        assert!(CronSchedule::parse("abc * * * * *").is_err());
    }

    #[test]
    fn test_every_ten_seconds() {
        let cron = CronSchedule::parse("*/10 * * * * *").unwrap();
        assert_eq!(
            cron.next_fire(at(2024, 1, 1, 0, 0, 3)),
            Some(at(2024, 1, 1, 0, 0, 10))
        );
        // Exactly on a boundary fires at the next one, never "now"
        assert_eq!(
            cron.next_fire(at(2024, 1, 1, 0, 0, 10)),
            Some(at(2024, 1, 1, 0, 0, 20))
        );
        // Rolls into the next minute
        assert_eq!(
            cron.next_fire(at(2024, 1, 1, 0, 0, 57)),
            Some(at(2024, 1, 1, 0, 1, 0))
        );
    }

    #[test]
    fn test_weekday_business_hours() {
        let cron = CronSchedule::parse("0 30 9 * * 1-5").unwrap();
        // 2024-01-05 is a Friday
        assert_eq!(
            cron.next_fire(at(2024, 1, 5, 9, 0, 0)),
            Some(at(2024, 1, 5, 9, 30, 0))
        );
        // After Friday's slot, the next is Monday the 8th
        assert_eq!(
            cron.next_fire(at(2024, 1, 5, 9, 30, 0)),
            Some(at(2024, 1, 8, 9, 30, 0))
        );
    }

    #[test]
    fn test_dom_skips_short_months() {
        let cron = CronSchedule::parse("0 0 0 31 * *").unwrap();
        // From mid-February the next 31st is March 31
        assert_eq!(
            cron.next_fire(at(2024, 2, 15, 12, 0, 0)),
            Some(at(2024, 3, 31, 0, 0, 0))
        );
    }

    #[test]
    fn test_dom_dow_or_rule() {
        // Fires on the 13th of the month OR any Friday
        let cron = CronSchedule::parse("0 0 0 13 * 5").unwrap();
        // 2024-09-10 is a Tuesday and 2024-09-13 is a Friday, so the
        // first hit after the 10th lands on the 13th via both legs
        assert_eq!(
            cron.next_fire(at(2024, 9, 10, 0, 0, 0)),
            Some(at(2024, 9, 13, 0, 0, 0))
        );
        // After the 13th, the next Friday (the 20th) hits on the dow leg
        assert_eq!(
            cron.next_fire(at(2024, 9, 13, 0, 0, 0)),
            Some(at(2024, 9, 20, 0, 0, 0))
        );
    }

    #[test]
    fn test_lists_and_stepped_ranges() {
        let cron = CronSchedule::parse("0,30 0-20/10 12 * * *").unwrap();
        assert_eq!(
            cron.next_fire(at(2024, 6, 1, 12, 0, 0)),
            Some(at(2024, 6, 1, 12, 0, 30))
        );
        assert_eq!(
            cron.next_fire(at(2024, 6, 1, 12, 0, 30)),
            Some(at(2024, 6, 1, 12, 10, 0))
        );
        assert_eq!(
            cron.next_fire(at(2024, 6, 1, 12, 20, 30)),
            Some(at(2024, 6, 2, 12, 0, 0))
        );
    }

    #[test]
    fn test_sunday_alias() {
        let seven = CronSchedule::parse("0 0 0 * * 7").unwrap();
        let zero = CronSchedule::parse("0 0 0 * * 0").unwrap();
        let from = at(2024, 1, 3, 0, 0, 0);
        assert_eq!(seven.next_fire(from), zero.next_fire(from));
        // 2024-01-07 is a Sunday
        assert_eq!(zero.next_fire(from), Some(at(2024, 1, 7, 0, 0, 0)));
    }

    #[test]
    fn test_impossible_date_returns_none() {
        let cron = CronSchedule::parse("0 0 0 31 2 *").unwrap();
        assert_eq!(cron.next_fire(at(2024, 1, 1, 0, 0, 0)), None);
    }

    #[test]
    fn test_yearly_rollover() {
        let cron = CronSchedule::parse("0 0 12 1 1 *").unwrap();
        assert_eq!(
            cron.next_fire(at(2024, 3, 1, 0, 0, 0)),
            Some(at(2025, 1, 1, 12, 0, 0))
        );
    }
}
