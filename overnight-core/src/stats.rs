//! Per-symbol and cross-sectional statistics, pure functions over closes.
//!
//! Everything here is deterministic: the same bars and policy produce the same
//! numbers bit for bit, which is what lets training artifacts be cached by
//! policy hash and last bar date.

use crate::domain::Bar;
use crate::policy::TrainingPolicy;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Statistics for one symbol over the policy's lookback window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerStats {
    pub bar_count: usize,
    pub window_bars: usize,
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
    pub last_close: f64,
    /// Mean daily log return over the window.
    pub mean_return: f64,
    /// Annualized standard deviation of daily log returns.
    pub volatility: f64,
    /// Annualized volatility over the trailing `vol_window` returns.
    pub recent_volatility: f64,
    /// Annualized drift (mean daily log return × 252).
    pub drift: f64,
    /// Largest peak-to-trough decline in the window, as a negative fraction.
    pub max_drawdown: f64,
    pub window_return: f64,
}

impl TickerStats {
    /// Compute statistics from a date-sorted history.
    ///
    /// Returns `None` when fewer than two usable closes fall in the window.
    pub fn compute(bars: &[Bar], policy: &TrainingPolicy) -> Option<Self> {
        let usable: Vec<&Bar> = bars.iter().filter(|b| b.is_usable()).collect();
        let first = usable.first()?;
        let last = usable.last()?;

        let start = usable.len().saturating_sub(policy.lookback_bars + 1);
        let closes: Vec<f64> = usable[start..].iter().map(|b| b.close).collect();
        if closes.len() < 2 {
            return None;
        }

        let returns = log_returns(&closes);
        let recent_start = returns.len().saturating_sub(policy.vol_window);
        let mean = mean_f64(&returns);

        Some(Self {
            bar_count: usable.len(),
            window_bars: closes.len(),
            first_date: first.date,
            last_date: last.date,
            last_close: last.close,
            mean_return: mean,
            volatility: annualize_vol(std_dev(&returns)),
            recent_volatility: annualize_vol(std_dev(&returns[recent_start..])),
            drift: mean * TRADING_DAYS_PER_YEAR,
            max_drawdown: max_drawdown(&closes),
            window_return: total_return(&closes),
        })
    }
}

/// Cross-sectional aggregate over every trained symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub symbol_count: usize,
    pub mean_drift: f64,
    pub median_volatility: f64,
    pub mean_max_drawdown: f64,
    /// Cross-sectional standard deviation of drift.
    pub drift_dispersion: f64,
    /// Fraction of symbols with positive drift.
    pub breadth: f64,
}

impl GlobalStats {
    pub fn aggregate(stats: &[&TickerStats]) -> Self {
        let drifts: Vec<f64> = stats.iter().map(|s| s.drift).collect();
        let mut vols: Vec<f64> = stats.iter().map(|s| s.volatility).collect();
        let drawdowns: Vec<f64> = stats.iter().map(|s| s.max_drawdown).collect();
        let positive = drifts.iter().filter(|d| **d > 0.0).count();

        Self {
            symbol_count: stats.len(),
            mean_drift: mean_f64(&drifts),
            median_volatility: median(&mut vols),
            mean_max_drawdown: mean_f64(&drawdowns),
            drift_dispersion: std_dev(&drifts),
            breadth: if stats.is_empty() {
                0.0
            } else {
                positive as f64 / stats.len() as f64
            },
        }
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

/// Daily log returns. Non-positive closes yield a zero return.
pub fn log_returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .map(|w| {
            if w[0] > 0.0 && w[1] > 0.0 {
                (w[1] / w[0]).ln()
            } else {
                0.0
            }
        })
        .collect()
}

/// Simple return from first to last close.
pub fn total_return(closes: &[f64]) -> f64 {
    match (closes.first(), closes.last()) {
        (Some(&first), Some(&last)) if first > 0.0 => (last - first) / first,
        _ => 0.0,
    }
}

/// Maximum drawdown as a negative fraction (e.g. -0.25 for a 25% decline).
pub fn max_drawdown(closes: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0_f64;
    for &c in closes {
        if c > peak {
            peak = c;
        }
        if peak > 0.0 {
            worst = worst.min((c - peak) / peak);
        }
    }
    worst
}

fn annualize_vol(daily_std: f64) -> f64 {
    daily_std * TRADING_DAYS_PER_YEAR.sqrt()
}

fn mean_f64(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1). Zero for fewer than two values.
fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = mean_f64(values);
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn series(closes: &[f64]) -> Vec<Bar> {
        let start = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                date: start + Duration::days(i as i64),
                open: None,
                high: None,
                low: None,
                close: c,
                volume: None,
            })
            .collect()
    }

    #[test]
    fn drawdown_of_rising_series_is_zero() {
        assert_eq!(max_drawdown(&[1.0, 2.0, 3.0]), 0.0);
    }

    #[test]
    fn drawdown_measures_peak_to_trough() {
        let dd = max_drawdown(&[100.0, 120.0, 90.0, 110.0]);
        assert!((dd - (-0.25)).abs() < 1e-12);
    }

    #[test]
    fn constant_prices_have_zero_vol() {
        let policy = TrainingPolicy::default();
        let stats = TickerStats::compute(&series(&[10.0; 30]), &policy).unwrap();
        assert_eq!(stats.volatility, 0.0);
        assert_eq!(stats.drift, 0.0);
        assert_eq!(stats.window_bars, 30);
    }

    #[test]
    fn window_is_bounded_by_lookback() {
        let policy = TrainingPolicy {
            min_history_bars: 0,
            lookback_bars: 5,
            vol_window: 3,
        };
        let closes: Vec<f64> = (1..=50).map(f64::from).collect();
        let stats = TickerStats::compute(&series(&closes), &policy).unwrap();
        assert_eq!(stats.window_bars, 6);
        assert_eq!(stats.bar_count, 50);
        assert_eq!(stats.last_close, 50.0);
        assert!((stats.window_return - (50.0 - 45.0) / 45.0).abs() < 1e-12);
    }

    #[test]
    fn single_bar_has_no_stats() {
        assert!(TickerStats::compute(&series(&[10.0]), &TrainingPolicy::default()).is_none());
    }

    #[test]
    fn compute_is_deterministic() {
        let closes: Vec<f64> = (0..300).map(|i| 100.0 + (i as f64 * 0.37).sin() * 5.0).collect();
        let bars = series(&closes);
        let policy = TrainingPolicy::default();
        assert_eq!(
            TickerStats::compute(&bars, &policy),
            TickerStats::compute(&bars, &policy)
        );
    }

    #[test]
    fn global_aggregate_breadth_and_median() {
        let policy = TrainingPolicy::default();
        let up = TickerStats::compute(&series(&[1.0, 2.0, 3.0]), &policy).unwrap();
        let down = TickerStats::compute(&series(&[3.0, 2.0, 1.5]), &policy).unwrap();
        let flat = TickerStats::compute(&series(&[2.0, 2.0, 2.0]), &policy).unwrap();

        let global = GlobalStats::aggregate(&[&up, &down, &flat]);
        assert_eq!(global.symbol_count, 3);
        assert!((global.breadth - 1.0 / 3.0).abs() < 1e-12);
        let mut vols = [up.volatility, down.volatility, flat.volatility];
        vols.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(global.median_volatility, vols[1]);
    }

    #[test]
    fn empty_aggregate_is_zeroed() {
        let global = GlobalStats::aggregate(&[]);
        assert_eq!(global.symbol_count, 0);
        assert_eq!(global.breadth, 0.0);
    }
}
