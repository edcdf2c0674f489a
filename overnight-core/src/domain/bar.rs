//! Bar: the daily market data unit.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Daily OHLCV bar for a single symbol.
///
/// The symbol is implied by the history file the bar lives in, so it is not
/// repeated on every record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: f64,
    pub volume: Option<u64>,
}

impl Bar {
    /// A bar is usable when its close is a finite positive price.
    pub fn is_usable(&self) -> bool {
        self.close.is_finite() && self.close > 0.0
    }
}

/// Merge incoming bars into an existing history, keyed by date.
///
/// Incoming bars always win on a date collision. The result is sorted by date
/// ascending and contains each date at most once.
pub fn merge_bars(existing: &[Bar], incoming: &[Bar]) -> Vec<Bar> {
    let mut by_date: BTreeMap<NaiveDate, Bar> = BTreeMap::new();
    for bar in existing {
        by_date.insert(bar.date, bar.clone());
    }
    for bar in incoming {
        by_date.insert(bar.date, bar.clone());
    }
    by_date.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(day: u32, close: f64) -> Bar {
        Bar {
            date: NaiveDate::from_ymd_opt(2026, 3, day).unwrap(),
            open: Some(close - 1.0),
            high: Some(close + 1.0),
            low: Some(close - 2.0),
            close,
            volume: Some(1_000),
        }
    }

    #[test]
    fn non_positive_close_is_unusable() {
        assert!(!bar(2, 0.0).is_usable());
        assert!(!bar(2, f64::NAN).is_usable());
    }

    #[test]
    fn merge_incoming_wins_on_collision() {
        let existing = vec![bar(2, 100.0), bar(3, 101.0)];
        let incoming = vec![bar(3, 555.0), bar(4, 102.0)];
        let merged = merge_bars(&existing, &incoming);

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[1].close, 555.0);
        assert_eq!(merged[2].date, NaiveDate::from_ymd_opt(2026, 3, 4).unwrap());
    }

    #[test]
    fn merge_sorts_unsorted_input() {
        let merged = merge_bars(&[bar(5, 1.0)], &[bar(3, 2.0), bar(4, 3.0)]);
        let dates: Vec<u32> = merged.iter().map(|b| chrono::Datelike::day(&b.date)).collect();
        assert_eq!(dates, vec![3, 4, 5]);
    }
}
