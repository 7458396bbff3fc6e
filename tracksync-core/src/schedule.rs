use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Days, Local, NaiveTime, TimeZone};

use crate::error::SyncError;

/// Wall-clock time of day at which the reconciler runs, `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    at: NaiveTime,
}

impl DailySchedule {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(|at| Self { at })
    }

    pub fn time(&self) -> NaiveTime {
        self.at
    }

    /// First occurrence strictly after `now`, in the zone of `now`.
    ///
    /// A local time skipped by a DST transition moves on to the next day.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Tz> {
        let zone = now.timezone();
        let today = now.date_naive();
        for offset in 0..=2 {
            let Some(day) = today.checked_add_days(Days::new(offset)) else {
                continue;
            };
            if let Some(candidate) = zone.from_local_datetime(&day.and_time(self.at)).earliest()
                && candidate > *now
            {
                return candidate;
            }
        }
        now.clone() + chrono::Duration::days(1)
    }

    /// Time to sleep until the next local occurrence.
    pub fn until_next(&self) -> Duration {
        let now = Local::now();
        let next = self.next_after(&now);
        (next - now).to_std().unwrap_or(Duration::ZERO)
    }
}

impl FromStr for DailySchedule {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SyncError::Configuration(format!("invalid schedule time {s:?}, expected HH:MM"));
        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        if hour.is_empty() || hour.len() > 2 || minute.len() != 2 {
            return Err(invalid());
        }
        let hour: u32 = hour.parse().map_err(|_| invalid())?;
        let minute: u32 = minute.parse().map_err(|_| invalid())?;
        Self::new(hour, minute).ok_or_else(invalid)
    }
}

impl fmt::Display for DailySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.at.format("%H:%M"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn parses_hh_mm() {
        assert_eq!("02:00".parse::<DailySchedule>().unwrap(), DailySchedule::new(2, 0).unwrap());
        assert_eq!("9:30".parse::<DailySchedule>().unwrap().to_string(), "09:30");
        for bad in ["24:00", "12:60", "1200", "12:5", "ab:cd", ""] {
            assert!(bad.parse::<DailySchedule>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn next_occurrence_is_today_or_tomorrow() {
        let schedule = DailySchedule::new(2, 0).unwrap();
        assert_eq!(
            schedule.next_after(&utc("2026-03-01T01:15:00Z")),
            utc("2026-03-01T02:00:00Z")
        );
        assert_eq!(
            schedule.next_after(&utc("2026-03-01T02:00:00Z")),
            utc("2026-03-02T02:00:00Z")
        );
        assert_eq!(
            schedule.next_after(&utc("2026-12-31T23:59:00Z")),
            utc("2027-01-01T02:00:00Z")
        );
    }
}
