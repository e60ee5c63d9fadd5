//! Budget period window arithmetic.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::budget::Period;

/// Concrete `[start, end)` window of a recurring budget period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PeriodWindow {
    /// Window containing `now` for the given period kind.
    pub fn current(period: Period, now: DateTime<Utc>) -> Self {
        let day = now.date_naive();
        let day_start = day.and_time(NaiveTime::MIN).and_utc();

        let (start, end) = match period {
            Period::Hourly => {
                let start = day_start + Duration::hours(i64::from(now.hour()));
                (start, start + Duration::hours(1))
            }
            Period::Daily => (day_start, day_start + Duration::days(1)),
            Period::Weekly => {
                // Weeks start on Monday.
                let days_since_monday = i64::from(day.weekday().num_days_from_monday());
                let start = day_start - Duration::days(days_since_monday);
                (start, start + Duration::weeks(1))
            }
            Period::Monthly => {
                let start = month_start(day).and_time(NaiveTime::MIN).and_utc();
                let end = next_month_start(day).and_time(NaiveTime::MIN).and_utc();
                (start, end)
            }
        };
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    /// Stable identifier for the window, derived from its start instant.
    pub fn id(&self) -> String {
        self.start.format("%Y%m%dT%H%M%SZ").to_string()
    }
}

fn month_start(day: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(day.year(), day.month(), 1).unwrap_or(day)
}

fn next_month_start(day: NaiveDate) -> NaiveDate {
    let (year, month) = if day.month() == 12 {
        (day.year() + 1, 1)
    } else {
        (day.year(), day.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_hourly_window() {
        let w = PeriodWindow::current(Period::Hourly, at(2025, 3, 10, 14, 37));
        assert_eq!(w.start, at(2025, 3, 10, 14, 0));
        assert_eq!(w.end, at(2025, 3, 10, 15, 0));
    }

    #[test]
    fn test_daily_window() {
        let w = PeriodWindow::current(Period::Daily, at(2025, 3, 10, 14, 37));
        assert_eq!(w.start, at(2025, 3, 10, 0, 0));
        assert_eq!(w.end, at(2025, 3, 11, 0, 0));
    }

    #[test]
    fn test_weekly_window_starts_monday() {
        // 2025-03-10 is a Monday; 2025-03-13 a Thursday.
        let w = PeriodWindow::current(Period::Weekly, at(2025, 3, 13, 9, 0));
        assert_eq!(w.start, at(2025, 3, 10, 0, 0));
        assert_eq!(w.end, at(2025, 3, 17, 0, 0));
    }

    #[test]
    fn test_monthly_window_december_rollover() {
        let w = PeriodWindow::current(Period::Monthly, at(2025, 12, 20, 8, 0));
        assert_eq!(w.start, at(2025, 12, 1, 0, 0));
        assert_eq!(w.end, at(2026, 1, 1, 0, 0));
    }

    #[test]
    fn test_contains_is_half_open() {
        let w = PeriodWindow::current(Period::Daily, at(2025, 3, 10, 12, 0));
        assert!(w.contains(w.start));
        assert!(!w.contains(w.end));
    }

    #[test]
    fn test_window_id_is_stable_within_period() {
        let a = PeriodWindow::current(Period::Monthly, at(2025, 3, 1, 0, 0));
        let b = PeriodWindow::current(Period::Monthly, at(2025, 3, 28, 23, 59));
        assert_eq!(a.id(), b.id());
    }
}
