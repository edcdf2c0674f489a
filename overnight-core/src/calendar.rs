//! Trading calendar for US exchange trading days.
//!
//! Weekends and a static holiday list are closed. The list covers the years the
//! pipeline is expected to run against; extra closures (unscheduled market
//! closures, next year's list before a release) come in through config.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use std::collections::BTreeSet;

/// Full-day US exchange closures, 2024 through 2027.
const US_HOLIDAYS: &[&str] = &[
    // 2024
    "2024-01-01", "2024-01-15", "2024-02-19", "2024-03-29", "2024-05-27",
    "2024-06-19", "2024-07-04", "2024-09-02", "2024-11-28", "2024-12-25",
    // 2025
    "2025-01-01", "2025-01-20", "2025-02-17", "2025-04-18", "2025-05-26",
    "2025-06-19", "2025-07-04", "2025-09-01", "2025-11-27", "2025-12-25",
    // 2026
    "2026-01-01", "2026-01-19", "2026-02-16", "2026-04-03", "2026-05-25",
    "2026-06-19", "2026-07-03", "2026-09-07", "2026-11-26", "2026-12-25",
    // 2027
    "2027-01-01", "2027-01-18", "2027-02-15", "2027-03-26", "2027-05-31",
    "2027-06-18", "2027-07-05", "2027-09-06", "2027-11-25", "2027-12-24",
];

/// Upper bound on consecutive closed days; anything longer is a calendar bug.
const MAX_CLOSED_RUN: usize = 10;

/// Trading calendar with weekend and holiday closures.
#[derive(Debug, Clone)]
pub struct TradingCalendar {
    holidays: BTreeSet<NaiveDate>,
}

impl TradingCalendar {
    /// Calendar with the built-in US holiday list.
    pub fn us_equities() -> Self {
        let holidays = US_HOLIDAYS
            .iter()
            .filter_map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .collect();
        Self { holidays }
    }

    /// Add further closures on top of the built-in list.
    pub fn with_extra_holidays(mut self, extra: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays.extend(extra);
        self
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    /// The closest trading day strictly before `date`.
    pub fn previous_trading_day(&self, date: NaiveDate) -> NaiveDate {
        self.step(date, -1)
    }

    /// The closest trading day strictly after `date`.
    pub fn next_trading_day(&self, date: NaiveDate) -> NaiveDate {
        self.step(date, 1)
    }

    fn step(&self, date: NaiveDate, dir: i64) -> NaiveDate {
        let mut candidate = date;
        for _ in 0..MAX_CLOSED_RUN {
            candidate += Duration::days(dir);
            if self.is_trading_day(candidate) {
                return candidate;
            }
        }
        // Unreachable with a sane holiday list; fall back to the raw step.
        date + Duration::days(dir)
    }

    /// The most recent trading day whose bars should exist as of `as_of`.
    ///
    /// `as_of` itself when it is a trading day, otherwise the previous one.
    pub fn expected_last_trading_day(&self, as_of: NaiveDate) -> NaiveDate {
        if self.is_trading_day(as_of) {
            as_of
        } else {
            self.previous_trading_day(as_of)
        }
    }

    /// Number of trading days in `(start, end]`.
    pub fn trading_days_between(&self, start: NaiveDate, end: NaiveDate) -> usize {
        let mut count = 0;
        let mut current = start;
        while current < end {
            current = self.next_trading_day(current);
            if current <= end {
                count += 1;
            }
        }
        count
    }
}

impl Default for TradingCalendar {
    fn default() -> Self {
        Self::us_equities()
    }
}

/// Market-local date for a UTC instant, using a fixed offset in hours.
pub fn market_date(now: DateTime<Utc>, utc_offset_hours: i32) -> NaiveDate {
    (now + Duration::hours(i64::from(utc_offset_hours))).date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn weekends_and_holidays_are_closed() {
        let cal = TradingCalendar::us_equities();
        assert!(!cal.is_trading_day(d("2026-10-17"))); // Saturday
        assert!(!cal.is_trading_day(d("2026-11-26"))); // Thanksgiving
        assert!(cal.is_trading_day(d("2026-10-16")));
    }

    #[test]
    fn previous_skips_weekend() {
        let cal = TradingCalendar::us_equities();
        assert_eq!(cal.previous_trading_day(d("2026-10-19")), d("2026-10-16"));
    }

    #[test]
    fn next_skips_holiday_weekend() {
        let cal = TradingCalendar::us_equities();
        // Friday 2026-07-03 is the observed Independence Day.
        assert_eq!(cal.next_trading_day(d("2026-07-02")), d("2026-07-06"));
    }

    #[test]
    fn expected_day_on_weekend_is_friday() {
        let cal = TradingCalendar::us_equities();
        assert_eq!(cal.expected_last_trading_day(d("2026-10-18")), d("2026-10-16"));
        assert_eq!(cal.expected_last_trading_day(d("2026-10-16")), d("2026-10-16"));
    }

    #[test]
    fn counts_trading_days() {
        let cal = TradingCalendar::us_equities();
        assert_eq!(cal.trading_days_between(d("2026-10-13"), d("2026-10-16")), 3);
        assert_eq!(cal.trading_days_between(d("2026-10-16"), d("2026-10-19")), 1);
        assert_eq!(cal.trading_days_between(d("2026-10-16"), d("2026-10-16")), 0);
    }

    #[test]
    fn extra_holidays_close_the_day() {
        let cal = TradingCalendar::us_equities().with_extra_holidays([d("2026-10-16")]);
        assert!(!cal.is_trading_day(d("2026-10-16")));
        assert_eq!(cal.expected_last_trading_day(d("2026-10-16")), d("2026-10-15"));
    }

    #[test]
    fn market_date_applies_offset() {
        let late_utc = Utc.with_ymd_and_hms(2026, 10, 17, 2, 0, 0).unwrap();
        assert_eq!(market_date(late_utc, -5), d("2026-10-16"));
        assert_eq!(market_date(late_utc, 0), d("2026-10-17"));
    }
}
