use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::{collections::BTreeMap, fmt, str::FromStr};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::series::{CoinSeries, Panel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendMethod {
    /// OLS slope over the trailing window, scaled to the window length.
    #[default]
    Slope,
    /// Relative change between today and `window` rows back.
    CompareExtremes,
}

impl TrendMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            TrendMethod::Slope => "slope",
            TrendMethod::CompareExtremes => "compare_extremes",
        }
    }
}

impl fmt::Display for TrendMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrendMethod {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "slope" => Ok(TrendMethod::Slope),
            "compare_extremes" => Ok(TrendMethod::CompareExtremes),
            other => Err(PipelineError::invalid(
                "trend_method",
                format!("must be 'slope' or 'compare_extremes', got `{other}`"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrendLabel {
    Rising,
    Flat,
    Dropping,
    /// The statistic exists but is not finite (zero prices).
    Unknown,
}

impl TrendLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            TrendLabel::Rising => "Rising",
            TrendLabel::Flat => "Flat",
            TrendLabel::Dropping => "Dropping",
            TrendLabel::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for TrendLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrendLabel {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rising" => Ok(TrendLabel::Rising),
            "flat" => Ok(TrendLabel::Flat),
            "dropping" => Ok(TrendLabel::Dropping),
            "unknown" => Ok(TrendLabel::Unknown),
            other => Err(PipelineError::invalid(
                "trend",
                format!("expected Rising, Flat, Dropping or Unknown, got `{other}`"),
            )),
        }
    }
}

/// Trend label and rolling variance of one day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendPoint {
    pub trend: TrendLabel,
    pub variance: Option<f64>,
}

pub fn validate_trend_params(window: u32, fraction: f64) -> Result<()> {
    if window == 0 {
        return Err(PipelineError::invalid("window", "must be at least 1"));
    }
    if !(fraction.is_finite() && fraction > 0.0) {
        return Err(PipelineError::invalid(
            "fraction",
            format!("must be a positive number, got {fraction}"),
        ));
    }
    Ok(())
}

/// Three-way threshold on a relative change.
///
/// No statistic (not enough rows yet) is Flat; a non-finite one (zero price) is Unknown.
pub fn classify(rel_change: Option<f64>, fraction: f64) -> TrendLabel {
    match rel_change {
        None => TrendLabel::Flat,
        Some(r) if !r.is_finite() => TrendLabel::Unknown,
        Some(r) if r > fraction => TrendLabel::Rising,
        Some(r) if r < -fraction => TrendLabel::Dropping,
        Some(_) => TrendLabel::Flat,
    }
}

/// Sample variance over the trailing `win` rows; `None` until the window is full.
pub fn rolling_variance(prices: &[f64], win: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; prices.len()];
    if win < 2 {
        return out;
    }
    for i in (win - 1)..prices.len() {
        out[i] = Some(prices[i + 1 - win..=i].variance());
    }
    out
}

/// Least-squares slope of `y` against `0..y.len()`, in price units per row.
pub fn ols_slope(y: &[f64]) -> f64 {
    let n = y.len();
    if n < 2 {
        return 0.0;
    }
    let center = 0.5 * (n - 1) as f64;
    let mut num = 0.0;
    let mut denom = 0.0;
    for (i, v) in y.iter().enumerate() {
        let coef = i as f64 - center;
        num += coef * v;
        denom += coef * coef;
    }
    num / denom
}

/// `slope * win / price` over the trailing `window + 1` rows.
pub fn slope_changes(prices: &[f64], window: usize) -> Vec<Option<f64>> {
    let win = window + 1;
    let mut out = vec![None; prices.len()];
    for i in (win - 1)..prices.len() {
        let slope = ols_slope(&prices[i + 1 - win..=i]);
        out[i] = Some(slope * win as f64 / prices[i]);
    }
    out
}

/// `(price[t] - price[t - window]) / price[t - window]`.
pub fn extreme_changes(prices: &[f64], window: usize) -> Vec<Option<f64>> {
    prices
        .iter()
        .enumerate()
        .map(|(i, p)| {
            i.checked_sub(window).map(|j| {
                let base = prices[j];
                (p - base) / base
            })
        })
        .collect()
}

/// Trend and variance for one coin. Both windows count rows, not calendar days.
pub fn trend_points(
    series: &CoinSeries,
    method: TrendMethod,
    window: u32,
    fraction: f64,
) -> Result<Vec<TrendPoint>> {
    validate_trend_params(window, fraction)?;
    Ok(points_for(series, method, window as usize, fraction))
}

fn points_for(
    series: &CoinSeries,
    method: TrendMethod,
    window: usize,
    fraction: f64,
) -> Vec<TrendPoint> {
    let prices = series.prices();
    let variance = rolling_variance(prices, window + 1);
    let changes = match method {
        TrendMethod::Slope => slope_changes(prices, window),
        TrendMethod::CompareExtremes => extreme_changes(prices, window),
    };
    changes
        .into_iter()
        .zip(variance)
        .map(|(change, variance)| TrendPoint {
            trend: classify(change, fraction),
            variance,
        })
        .collect()
}

/// Trend and variance for every coin of the panel, aligned with each coin's dates.
pub fn assign_trend(
    panel: &Panel,
    method: TrendMethod,
    window: u32,
    fraction: f64,
) -> Result<BTreeMap<String, Vec<TrendPoint>>> {
    validate_trend_params(window, fraction)?;
    let out: BTreeMap<String, Vec<TrendPoint>> = panel
        .series_map()
        .par_iter()
        .map(|(coin, s)| (coin.clone(), points_for(s, method, window as usize, fraction)))
        .collect();
    debug!(
        "assigned trend for {} coins (method={}, window={}, fraction={})",
        out.len(),
        method,
        window,
        fraction
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn daily(coin: &str, prices: &[f64]) -> CoinSeries {
        let d0 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let points = prices
            .iter()
            .enumerate()
            .map(|(i, p)| (d0 + Duration::days(i as i64), *p))
            .collect();
        CoinSeries::new(coin, points).unwrap()
    }

    fn labels(points: &[TrendPoint]) -> Vec<TrendLabel> {
        points.iter().map(|p| p.trend).collect()
    }

    #[test]
    fn variance_requires_full_window() {
        let v = rolling_variance(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(v[0], None);
        assert_eq!(v[1], None);
        assert!((v[2].unwrap() - 1.0).abs() < 1e-12);
        assert!((v[3].unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn slope_of_line_is_exact() {
        assert!((ols_slope(&[1.0, 3.0, 5.0, 7.0]) - 2.0).abs() < 1e-12);
        assert!((ols_slope(&[10.0, 10.0, 10.0]) - 0.0).abs() < 1e-12);
        assert!((ols_slope(&[4.0, 1.0]) + 3.0).abs() < 1e-12);
    }

    #[test]
    fn compare_extremes_thresholds() {
        let s = daily("x", &[100.0, 106.0, 106.0, 100.0, 105.0]);
        let points = trend_points(&s, TrendMethod::CompareExtremes, 1, 0.05).unwrap();
        assert_eq!(
            labels(&points),
            vec![
                TrendLabel::Flat,
                TrendLabel::Rising,
                TrendLabel::Flat,
                TrendLabel::Dropping,
                TrendLabel::Flat,
            ]
        );
    }

    #[test]
    fn relative_change_equal_to_fraction_is_flat() {
        assert_eq!(classify(Some(0.05), 0.05), TrendLabel::Flat);
        assert_eq!(classify(Some(-0.05), 0.05), TrendLabel::Flat);
        assert_eq!(classify(Some(0.0500001), 0.05), TrendLabel::Rising);
        assert_eq!(classify(None, 0.05), TrendLabel::Flat);
        assert_eq!(classify(Some(f64::NAN), 0.05), TrendLabel::Unknown);
        assert_eq!(classify(Some(f64::INFINITY), 0.05), TrendLabel::Unknown);
        assert_eq!(classify(Some(f64::NEG_INFINITY), 0.05), TrendLabel::Unknown);
    }

    #[test]
    fn insufficient_history_is_flat_with_missing_variance() {
        let prices: Vec<f64> = (0..12).map(|i| 100.0 * 1.1f64.powi(i)).collect();
        let s = daily("x", &prices);
        for method in [TrendMethod::Slope, TrendMethod::CompareExtremes] {
            let points = trend_points(&s, method, 7, 0.05).unwrap();
            for p in &points[..7] {
                assert_eq!(p.trend, TrendLabel::Flat);
                assert_eq!(p.variance, None);
            }
            assert_eq!(points[7].trend, TrendLabel::Rising);
            assert!(points[7].variance.is_some());
        }
    }

    #[test]
    fn methods_agree_on_monotonic_series() {
        let rising: Vec<f64> = (0..50).map(|t| 100.0 + 10.0 * t as f64).collect();
        let dropping: Vec<f64> = (0..50).map(|t| 1000.0 - 10.0 * t as f64).collect();

        for (prices, expected) in [(rising, TrendLabel::Rising), (dropping, TrendLabel::Dropping)] {
            let s = daily("x", &prices);
            let slope = trend_points(&s, TrendMethod::Slope, 7, 0.01).unwrap();
            let extremes = trend_points(&s, TrendMethod::CompareExtremes, 7, 0.01).unwrap();
            assert_eq!(labels(&slope), labels(&extremes));
            assert!(slope[7..].iter().all(|p| p.trend == expected));
        }
    }

    #[test]
    fn zero_prices_give_unknown() {
        let s = daily("x", &[0.0, 0.0, 0.0]);
        let points = trend_points(&s, TrendMethod::CompareExtremes, 1, 0.05).unwrap();
        assert_eq!(points[1].trend, TrendLabel::Unknown);
        let points = trend_points(&s, TrendMethod::Slope, 1, 0.05).unwrap();
        assert_eq!(points[2].trend, TrendLabel::Unknown);
    }

    #[test]
    fn division_by_zero_price_gives_unknown() {
        let s = daily("x", &[0.0, 5.0, 0.0]);
        // zero base: (5 - 0) / 0
        let extremes = trend_points(&s, TrendMethod::CompareExtremes, 1, 0.05).unwrap();
        assert_eq!(
            labels(&extremes),
            vec![TrendLabel::Flat, TrendLabel::Unknown, TrendLabel::Dropping]
        );
        // zero current price: slope * 2 / 0
        let slope = trend_points(&s, TrendMethod::Slope, 1, 0.05).unwrap();
        assert_eq!(
            labels(&slope),
            vec![TrendLabel::Flat, TrendLabel::Rising, TrendLabel::Unknown]
        );
    }

    #[test]
    fn windows_count_rows_even_across_date_gaps() {
        let d0 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let s = CoinSeries::new(
            "x",
            vec![
                (d0, 1.0),
                (d0 + Duration::days(10), 2.0),
                (d0 + Duration::days(40), 3.0),
            ],
        )
        .unwrap();
        let points = trend_points(&s, TrendMethod::CompareExtremes, 2, 0.05).unwrap();
        assert!((points[2].variance.unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(points[2].trend, TrendLabel::Rising);
    }

    #[test]
    fn coins_are_processed_independently() {
        let mut panel = Panel::default();
        panel.insert(daily("up", &[1.0, 2.0, 3.0, 4.0]));
        panel.insert(daily("down", &[4.0, 3.0, 2.0, 1.0]));
        let out = assign_trend(&panel, TrendMethod::CompareExtremes, 1, 0.05).unwrap();
        assert_eq!(out["up"][1].trend, TrendLabel::Rising);
        assert_eq!(out["down"][1].trend, TrendLabel::Dropping);
        assert_eq!(out["up"][0].trend, TrendLabel::Flat);
    }

    #[test]
    fn bad_parameters_fail_fast() {
        assert!(matches!(
            "momentum".parse::<TrendMethod>(),
            Err(PipelineError::InvalidParameter { name: "trend_method", .. })
        ));
        assert_eq!(
            "compare_extremes".parse::<TrendMethod>().unwrap(),
            TrendMethod::CompareExtremes
        );
        let panel = Panel::default();
        assert!(assign_trend(&panel, TrendMethod::Slope, 0, 0.05).is_err());
        assert!(assign_trend(&panel, TrendMethod::Slope, 7, 0.0).is_err());
        assert!(assign_trend(&panel, TrendMethod::Slope, 7, f64::NAN).is_err());
    }
}
