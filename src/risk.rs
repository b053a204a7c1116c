use chrono::Duration;
use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::series::{CoinSeries, Panel};

/// Daily percentage change at or below which a day counts as a severe drop.
pub const SEVERE_DROP_PCT: f64 = -50.0;
/// Upper bound of the moderate drop tier (exclusive of the severe tier).
pub const MODERATE_DROP_PCT: f64 = -20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Integer coding used for model inputs: Low=1, Medium=2, High=3.
    pub fn code(self) -> u8 {
        match self {
            RiskLevel::Low => 1,
            RiskLevel::Medium => 2,
            RiskLevel::High => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" | "1" => Ok(RiskLevel::Low),
            "medium" | "2" => Ok(RiskLevel::Medium),
            "high" | "3" => Ok(RiskLevel::High),
            other => Err(PipelineError::invalid(
                "risk_level",
                format!("expected Low, Medium or High, got `{other}`"),
            )),
        }
    }
}

/// Per-day flags telling whether the day closes a long enough drop streak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropTiers {
    pub severe: Vec<bool>,
    pub moderate: Vec<bool>,
}

/// Day-over-day change in percent. The first day, and any day following a zero
/// price, has no defined change.
pub fn pct_changes(prices: &[f64]) -> Vec<Option<f64>> {
    std::iter::once(None)
        .chain(prices.iter().tuple_windows().map(|(prev, next)| {
            if *prev == 0.0 {
                None
            } else {
                Some((next - prev) / prev * 100.0)
            }
        }))
        .take(prices.len())
        .collect()
}

/// Length of the run of consecutive `true` values ending at each position.
pub fn streak_lengths(flags: &[bool]) -> Vec<usize> {
    flags
        .iter()
        .scan(0usize, |run, &hit| {
            *run = if hit { *run + 1 } else { 0 };
            Some(*run)
        })
        .collect()
}

/// Marks the days on which a severe or moderate drop streak has lasted at least `streak_days`.
pub fn drop_tiers(prices: &[f64], streak_days: u32) -> DropTiers {
    let changes = pct_changes(prices);
    let severe: Vec<bool> = changes
        .iter()
        .map(|c| c.is_some_and(|c| c <= SEVERE_DROP_PCT))
        .collect();
    let moderate: Vec<bool> = changes
        .iter()
        .map(|c| c.is_some_and(|c| c > SEVERE_DROP_PCT && c <= MODERATE_DROP_PCT))
        .collect();

    let min_run = streak_days as usize;
    let qualifies = |flags: &[bool]| -> Vec<bool> {
        streak_lengths(flags)
            .into_iter()
            .map(|run| run >= min_run)
            .collect()
    };
    DropTiers {
        severe: qualifies(&severe),
        moderate: qualifies(&moderate),
    }
}

pub fn validate_risk_params(streak_days: u32, period_days: u32) -> Result<()> {
    if streak_days == 0 {
        return Err(PipelineError::invalid("streak_days", "must be at least 1"));
    }
    if period_days == 0 {
        return Err(PipelineError::invalid("period_days", "must be at least 1"));
    }
    Ok(())
}

/// Risk level of every day of one coin.
///
/// A day is `High` when any day in `[date - period_days, date)` closed a severe
/// drop streak, else `Medium` when any closed a moderate one, else `Low`. The
/// look-back is measured in calendar days, so gaps in the series shrink the
/// number of rows it covers.
pub fn risk_levels(
    series: &CoinSeries,
    streak_days: u32,
    period_days: u32,
) -> Result<Vec<RiskLevel>> {
    validate_risk_params(streak_days, period_days)?;
    Ok(levels_for(series, streak_days, period_days))
}

fn levels_for(series: &CoinSeries, streak_days: u32, period_days: u32) -> Vec<RiskLevel> {
    let dates = series.dates();
    let tiers = drop_tiers(series.prices(), streak_days);
    let severe_seen = prefix_counts(&tiers.severe);
    let moderate_seen = prefix_counts(&tiers.moderate);
    let period = Duration::days(i64::from(period_days));

    let mut start = 0usize;
    let mut out = Vec::with_capacity(dates.len());
    for (i, today) in dates.iter().enumerate() {
        let earliest = *today - period;
        while start < i && dates[start] < earliest {
            start += 1;
        }
        // rows start..i, today excluded
        let level = if severe_seen[i] > severe_seen[start] {
            RiskLevel::High
        } else if moderate_seen[i] > moderate_seen[start] {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };
        out.push(level);
    }
    out
}

fn prefix_counts(flags: &[bool]) -> Vec<usize> {
    std::iter::once(0)
        .chain(flags.iter().scan(0usize, |acc, &f| {
            *acc += usize::from(f);
            Some(*acc)
        }))
        .collect()
}

/// Risk levels for every coin of the panel, keyed by coin and aligned with its dates.
pub fn assign_risk(
    panel: &Panel,
    streak_days: u32,
    period_days: u32,
) -> Result<BTreeMap<String, Vec<RiskLevel>>> {
    validate_risk_params(streak_days, period_days)?;
    let out: BTreeMap<String, Vec<RiskLevel>> = panel
        .series_map()
        .par_iter()
        .map(|(coin, s)| (coin.clone(), levels_for(s, streak_days, period_days)))
        .collect();
    debug!(
        "assigned risk for {} coins (streak_days={}, period_days={})",
        out.len(),
        streak_days,
        period_days
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn daily(coin: &str, prices: &[f64]) -> CoinSeries {
        let points = prices
            .iter()
            .enumerate()
            .map(|(i, p)| (start() + Duration::days(i as i64), *p))
            .collect();
        CoinSeries::new(coin, points).unwrap()
    }

    #[test]
    fn pct_change_first_day_and_zero_base_undefined() {
        let c = pct_changes(&[100.0, 50.0, 0.0, 10.0]);
        assert_eq!(c[0], None);
        assert!((c[1].unwrap() + 50.0).abs() < 1e-12);
        assert!((c[2].unwrap() + 100.0).abs() < 1e-12);
        assert_eq!(c[3], None);
        assert!(pct_changes(&[]).is_empty());
    }

    #[test]
    fn streak_lengths_reset_on_false() {
        let flags = [true, true, false, true, true, true, false];
        assert_eq!(streak_lengths(&flags), vec![1, 2, 0, 1, 2, 3, 0]);
    }

    #[test]
    fn single_crash_marks_next_period_high_then_reverts() {
        let mut prices = vec![100.0, 100.0, 100.0, 40.0];
        prices.extend(std::iter::repeat(40.0).take(40));
        let levels = risk_levels(&daily("bitcoin", &prices), 1, 30).unwrap();

        let crash = 3;
        assert_eq!(levels[crash], RiskLevel::Low, "crash day itself is excluded");
        for offset in 1..=30 {
            assert_eq!(levels[crash + offset], RiskLevel::High, "day +{offset}");
        }
        assert_eq!(levels[crash + 31], RiskLevel::Low);
        assert!(levels[..crash].iter().all(|l| *l == RiskLevel::Low));
    }

    #[test]
    fn rebound_after_crash_is_still_high() {
        let mut prices = vec![100.0, 100.0, 100.0, 40.0];
        prices.extend(std::iter::repeat(100.0).take(35));
        let levels = risk_levels(&daily("bitcoin", &prices), 1, 30).unwrap();
        assert!(levels[4..=33].iter().all(|l| *l == RiskLevel::High));
        assert_eq!(levels[34], RiskLevel::Low);
    }

    #[test]
    fn severe_tier_takes_precedence_over_moderate() {
        // -30% on day 1, -60% on day 2: both tiers qualify within the window
        let prices = [100.0, 70.0, 28.0, 28.0, 28.0];
        let levels = risk_levels(&daily("x", &prices), 1, 30).unwrap();
        assert_eq!(levels[2], RiskLevel::Medium);
        assert_eq!(levels[3], RiskLevel::High);
        assert_eq!(levels[4], RiskLevel::High);
    }

    #[test]
    fn streak_requirement_delays_qualification() {
        let prices = [100.0, 75.0, 56.25, 42.1875, 42.1875, 42.1875];

        let three = drop_tiers(&prices, 3);
        assert_eq!(three.moderate, vec![false, false, false, true, false, false]);
        assert!(three.severe.iter().all(|q| !q));

        let one = drop_tiers(&prices, 1);
        assert_eq!(one.moderate, vec![false, true, true, true, false, false]);

        let levels = risk_levels(&daily("x", &prices), 3, 30).unwrap();
        assert_eq!(
            levels,
            vec![
                RiskLevel::Low,
                RiskLevel::Low,
                RiskLevel::Low,
                RiskLevel::Low,
                RiskLevel::Medium,
                RiskLevel::Medium
            ]
        );
        let levels = risk_levels(&daily("x", &prices), 1, 30).unwrap();
        assert_eq!(levels[2], RiskLevel::Medium);
    }

    #[test]
    fn exactly_fifty_percent_is_severe_and_twenty_is_moderate() {
        let tiers = drop_tiers(&[100.0, 50.0, 40.0, 39.0], 1);
        assert_eq!(tiers.severe, vec![false, true, false, false]);
        assert_eq!(tiers.moderate, vec![false, false, true, false]);
    }

    #[test]
    fn window_is_measured_in_calendar_days() {
        let d0 = start();
        let gap = CoinSeries::new(
            "x",
            vec![
                (d0, 100.0),
                (d0 + Duration::days(1), 30.0),
                (d0 + Duration::days(31), 30.0),
                (d0 + Duration::days(32), 30.0),
            ],
        )
        .unwrap();
        let levels = risk_levels(&gap, 1, 30).unwrap();
        // 30 calendar days after the crash is still inside the window, 31 is not
        assert_eq!(levels[2], RiskLevel::High);
        assert_eq!(levels[3], RiskLevel::Low);

        let sparse = CoinSeries::new(
            "y",
            vec![
                (d0, 100.0),
                (d0 + Duration::days(1), 30.0),
                (d0 + Duration::days(45), 30.0),
            ],
        )
        .unwrap();
        // the very next row, but 44 days later
        assert_eq!(risk_levels(&sparse, 1, 30).unwrap()[2], RiskLevel::Low);
    }

    #[test]
    fn coins_do_not_leak_into_each_other() {
        let mut panel = Panel::default();
        panel.insert(daily("alpha", &[100.0, 10.0, 10.0, 10.0]));
        panel.insert(daily("beta", &[100.0, 100.0, 100.0, 100.0]));

        let risk = assign_risk(&panel, 1, 30).unwrap();
        assert_eq!(risk["alpha"][2], RiskLevel::High);
        assert!(risk["beta"].iter().all(|l| *l == RiskLevel::Low));
        assert_eq!(risk["beta"].len(), 4);
    }

    #[test]
    fn zero_parameters_are_rejected() {
        let panel = Panel::default();
        assert!(matches!(
            assign_risk(&panel, 0, 30),
            Err(PipelineError::InvalidParameter { name: "streak_days", .. })
        ));
        assert!(matches!(
            assign_risk(&panel, 1, 0),
            Err(PipelineError::InvalidParameter { name: "period_days", .. })
        ));
    }

    #[test]
    fn risk_level_parses_labels_and_codes() {
        assert_eq!("high".parse::<RiskLevel>().unwrap(), RiskLevel::High);
        assert_eq!("2".parse::<RiskLevel>().unwrap(), RiskLevel::Medium);
        assert!("severe".parse::<RiskLevel>().is_err());
        assert_eq!(RiskLevel::Low.code(), 1);
    }
}
