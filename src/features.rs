use chrono::NaiveDate;
use csv::WriterBuilder;
use std::{collections::BTreeMap, path::Path};

use crate::calendar::CalendarFlags;
use crate::error::{PipelineError, Result};
use crate::risk::RiskLevel;
use crate::series::Panel;
use crate::trend::{TrendLabel, TrendPoint};

pub const PRICE_COLUMN: &str = "price_usd";
pub const REFERENCE_COLUMN: &str = "price_usd-1_orig";

/// Risk column value: the categorical level, or its integer code once mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskFeature {
    Level(RiskLevel),
    Code(u8),
}

impl RiskFeature {
    /// Integer-codes a categorical level; codes are left as they are.
    pub fn mapped(self) -> Self {
        match self {
            RiskFeature::Level(level) => RiskFeature::Code(level.code()),
            code => code,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            RiskFeature::Level(level) => level.code(),
            RiskFeature::Code(code) => code,
        }
    }

    fn matches(self, level: RiskLevel) -> bool {
        self.code() == level.code()
    }
}

impl std::fmt::Display for RiskFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskFeature::Level(level) => write!(f, "{level}"),
            RiskFeature::Code(code) => write!(f, "{code}"),
        }
    }
}

/// One observation with every engineered column attached.
///
/// `lags[k - 1]` holds `price_usd-k`. After normalization those are ratios to
/// yesterday's price and `reference_price` keeps the raw yesterday price.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub coin_id: String,
    pub date: NaiveDate,
    pub price_usd: f64,
    pub risk: Option<RiskFeature>,
    pub variance: Option<f64>,
    pub trend: Option<TrendLabel>,
    pub lags: Vec<Option<f64>>,
    pub reference_price: Option<f64>,
    pub calendar: Option<CalendarFlags>,
}

/// Which derivation steps have been applied to a table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stages {
    pub risk: bool,
    pub risk_mapped: bool,
    pub trend: bool,
    pub lag_window: usize,
    pub normalized: bool,
    pub calendar: bool,
}

/// Training table: rows ordered by coin, then date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    rows: Vec<FeatureRow>,
    stages: Stages,
}

impl FeatureTable {
    pub fn from_panel(panel: &Panel) -> Self {
        let rows = panel
            .observations()
            .into_iter()
            .map(|obs| FeatureRow {
                coin_id: obs.coin_id,
                date: obs.date,
                price_usd: obs.price_usd,
                risk: None,
                variance: None,
                trend: None,
                lags: Vec::new(),
                reference_price: None,
                calendar: None,
            })
            .collect();
        Self {
            rows,
            stages: Stages::default(),
        }
    }

    pub fn rows(&self) -> &[FeatureRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<FeatureRow> {
        self.rows
    }

    pub fn stages(&self) -> Stages {
        self.stages
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn coins(&self) -> Vec<&str> {
        let mut coins: Vec<&str> = self.rows.iter().map(|r| r.coin_id.as_str()).collect();
        coins.dedup();
        coins
    }

    /// Attaches per-coin risk levels aligned with each coin's dates.
    pub fn merge_risk(&mut self, levels: &BTreeMap<String, Vec<RiskLevel>>) -> Result<()> {
        self.merge_by_coin(levels, |row, level| row.risk = Some(RiskFeature::Level(*level)))?;
        self.stages.risk = true;
        self.stages.risk_mapped = false;
        Ok(())
    }

    /// Attaches per-coin trend labels and rolling variances.
    pub fn merge_trend(&mut self, points: &BTreeMap<String, Vec<TrendPoint>>) -> Result<()> {
        self.merge_by_coin(points, |row, point| {
            row.trend = Some(point.trend);
            row.variance = point.variance;
        })?;
        self.stages.trend = true;
        Ok(())
    }

    fn merge_by_coin<T>(
        &mut self,
        values: &BTreeMap<String, Vec<T>>,
        mut set: impl FnMut(&mut FeatureRow, &T),
    ) -> Result<()> {
        for group in self.rows.chunk_by_mut(|a, b| a.coin_id == b.coin_id) {
            let coin = group[0].coin_id.clone();
            let Some(vals) = values.get(&coin) else {
                continue;
            };
            if vals.len() != group.len() {
                return Err(PipelineError::invalid(
                    "annotations",
                    format!("{coin} has {} rows but {} values", group.len(), vals.len()),
                ));
            }
            for (row, v) in group.iter_mut().zip(vals) {
                set(row, v);
            }
        }
        Ok(())
    }

    /// Adds `price_usd-1 ..= price_usd-win`, shifting within each coin only.
    pub fn add_lagged_prices(&mut self, win: usize) -> Result<()> {
        if win == 0 {
            return Err(PipelineError::invalid("lag_window", "must be at least 1"));
        }
        for group in self.rows.chunk_by_mut(|a, b| a.coin_id == b.coin_id) {
            let prices: Vec<f64> = group.iter().map(|r| r.price_usd).collect();
            for (i, row) in group.iter_mut().enumerate() {
                row.lags = (1..=win)
                    .map(|k| i.checked_sub(k).map(|j| prices[j]))
                    .collect();
                row.reference_price = None;
            }
        }
        self.stages.lag_window = win;
        self.stages.normalized = false;
        Ok(())
    }

    /// Divides every lag by `price_usd-1`, keeping the raw value as the reference price.
    ///
    /// A zero or missing yesterday price leaves the row's lags missing.
    pub fn normalize_prices(&mut self) -> Result<()> {
        if self.stages.lag_window == 0 {
            return Err(PipelineError::invalid(
                "normalize_prices",
                "lagged prices must be generated first",
            ));
        }
        if self.stages.normalized {
            return Ok(());
        }
        for row in &mut self.rows {
            let reference = row.lags.first().copied().flatten();
            row.reference_price = reference;
            let usable = reference.filter(|r| *r != 0.0);
            for lag in &mut row.lags {
                *lag = match (*lag, usable) {
                    (Some(v), Some(r)) => Some(v / r),
                    _ => None,
                };
            }
        }
        self.stages.normalized = true;
        Ok(())
    }

    /// Replaces categorical risk levels with their integer codes. Idempotent.
    pub fn map_risk_levels(&mut self) -> Result<()> {
        if !self.stages.risk {
            return Err(PipelineError::invalid(
                "map_risk",
                "risk levels must be assigned first",
            ));
        }
        for row in &mut self.rows {
            row.risk = row.risk.map(RiskFeature::mapped);
        }
        self.stages.risk_mapped = true;
        Ok(())
    }

    pub fn add_calendar_features(&mut self) {
        for row in &mut self.rows {
            row.calendar = Some(CalendarFlags::for_date(row.date));
        }
        self.stages.calendar = true;
    }

    /// Drops rows that still miss a value in any applied column.
    pub fn drop_incomplete(&self) -> FeatureTable {
        let stages = self.stages;
        let complete = |r: &FeatureRow| {
            (!stages.risk || r.risk.is_some())
                && (!stages.trend
                    || (matches!(r.trend, Some(t) if t != TrendLabel::Unknown)
                        && r.variance.is_some_and(f64::is_finite)))
                && r.lags.len() == stages.lag_window
                && r.lags.iter().all(|l| l.is_some_and(f64::is_finite))
                && (!stages.normalized || r.reference_price.is_some())
                && (!stages.calendar || r.calendar.is_some())
        };
        self.filtered(complete)
    }

    pub fn for_coin(&self, coin_id: &str) -> FeatureTable {
        self.filtered(|r| r.coin_id == coin_id)
    }

    pub fn with_trend(&self, trend: TrendLabel) -> FeatureTable {
        self.filtered(|r| r.trend == Some(trend))
    }

    pub fn with_risk(&self, level: RiskLevel) -> FeatureTable {
        self.filtered(|r| r.risk.is_some_and(|f| f.matches(level)))
    }

    fn filtered(&self, keep: impl Fn(&FeatureRow) -> bool) -> FeatureTable {
        FeatureTable {
            rows: self.rows.iter().filter(|r| keep(r)).cloned().collect(),
            stages: self.stages,
        }
    }

    /// Column header, in output order, for the stages applied so far.
    pub fn columns(&self) -> Vec<String> {
        let s = self.stages;
        let mut cols = vec!["coin_id".to_string(), "date".to_string()];
        if s.risk {
            cols.push("risk_level".into());
        }
        if s.trend {
            cols.push("variance".into());
            cols.push("trend".into());
        }
        cols.push(PRICE_COLUMN.into());
        cols.extend((1..=s.lag_window).map(|k| format!("{PRICE_COLUMN}-{k}")));
        if s.normalized {
            cols.push(REFERENCE_COLUMN.into());
        }
        if s.calendar {
            cols.push("is_weekend".into());
            cols.push("is_US_holiday".into());
            cols.push("is_China_holiday".into());
        }
        cols
    }

    /// String cells of one row, matching [`FeatureTable::columns`]. Missing values are empty.
    pub fn record(&self, row: &FeatureRow) -> Vec<String> {
        let s = self.stages;
        let num = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
        let flag = |b: bool| if b { "1" } else { "0" }.to_string();

        let mut out = vec![row.coin_id.clone(), row.date.format("%Y-%m-%d").to_string()];
        if s.risk {
            out.push(row.risk.map(|r| r.to_string()).unwrap_or_default());
        }
        if s.trend {
            out.push(num(row.variance));
            out.push(row.trend.map(|t| t.to_string()).unwrap_or_default());
        }
        out.push(row.price_usd.to_string());
        out.extend((0..s.lag_window).map(|k| num(row.lags.get(k).copied().flatten())));
        if s.normalized {
            out.push(num(row.reference_price));
        }
        if s.calendar {
            let c = row.calendar.unwrap_or_default();
            out.push(flag(c.is_weekend));
            out.push(flag(c.is_us_holiday));
            out.push(flag(c.is_china_holiday));
        }
        out
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = WriterBuilder::new().from_path(path)?;
        wtr.write_record(self.columns())?;
        for row in &self.rows {
            wtr.write_record(self.record(row))?;
        }
        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::CoinSeries;
    use crate::trend::{TrendMethod, assign_trend};
    use chrono::Duration;

    fn panel(coins: &[(&str, &[f64])]) -> Panel {
        let d0 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mut p = Panel::default();
        for (coin, prices) in coins {
            let points = prices
                .iter()
                .enumerate()
                .map(|(i, v)| (d0 + Duration::days(i as i64), *v))
                .collect();
            p.insert(CoinSeries::new(*coin, points).unwrap());
        }
        p
    }

    #[test]
    fn lags_never_cross_coin_boundaries() {
        let mut t = FeatureTable::from_panel(&panel(&[
            ("alpha", &[1.0, 2.0, 3.0]),
            ("beta", &[10.0, 20.0]),
        ]));
        t.add_lagged_prices(2).unwrap();
        let rows = t.rows();
        assert_eq!(rows[2].lags, vec![Some(2.0), Some(1.0)]);
        assert_eq!(rows[3].coin_id, "beta");
        assert_eq!(rows[3].lags, vec![None, None]);
        assert_eq!(rows[4].lags, vec![Some(10.0), None]);
    }

    #[test]
    fn normalization_keeps_reference_price() {
        let mut t = FeatureTable::from_panel(&panel(&[("x", &[4.0, 8.0, 2.0, 5.0])]));
        t.add_lagged_prices(3).unwrap();
        t.normalize_prices().unwrap();
        let last = &t.rows()[3];
        assert_eq!(last.lags[0], Some(1.0));
        assert_eq!(last.lags[1], Some(4.0));
        assert_eq!(last.lags[2], Some(2.0));
        assert_eq!(last.reference_price, Some(2.0));

        for row in t.rows().iter().skip(1) {
            assert_eq!(row.lags[0], Some(1.0));
        }
        assert_eq!(t.rows()[0].reference_price, None);

        // second call leaves the ratios alone
        let before = t.clone();
        t.normalize_prices().unwrap();
        assert_eq!(t, before);
    }

    #[test]
    fn normalization_needs_lags() {
        let mut t = FeatureTable::from_panel(&panel(&[("x", &[1.0, 2.0])]));
        assert!(matches!(
            t.normalize_prices(),
            Err(PipelineError::InvalidParameter { name: "normalize_prices", .. })
        ));
    }

    #[test]
    fn risk_mapping_is_idempotent() {
        let mut t = FeatureTable::from_panel(&panel(&[("x", &[1.0, 2.0, 3.0])]));
        assert!(t.map_risk_levels().is_err());

        let levels = BTreeMap::from([(
            "x".to_string(),
            vec![RiskLevel::Low, RiskLevel::Medium, RiskLevel::High],
        )]);
        t.merge_risk(&levels).unwrap();
        t.map_risk_levels().unwrap();
        let once: Vec<_> = t.rows().iter().map(|r| r.risk).collect();
        t.map_risk_levels().unwrap();
        let twice: Vec<_> = t.rows().iter().map(|r| r.risk).collect();
        assert_eq!(once, twice);
        assert_eq!(
            once,
            vec![
                Some(RiskFeature::Code(1)),
                Some(RiskFeature::Code(2)),
                Some(RiskFeature::Code(3))
            ]
        );
        assert_eq!(t.with_risk(RiskLevel::High).len(), 1);
    }

    #[test]
    fn misaligned_annotations_are_rejected() {
        let mut t = FeatureTable::from_panel(&panel(&[("x", &[1.0, 2.0, 3.0])]));
        let levels = BTreeMap::from([("x".to_string(), vec![RiskLevel::Low])]);
        assert!(t.merge_risk(&levels).is_err());
    }

    #[test]
    fn drop_incomplete_removes_warmup_rows() {
        let mut t = FeatureTable::from_panel(&panel(&[("x", &[1.0, 2.0, 3.0, 4.0])]));
        let points = BTreeMap::from([(
            "x".to_string(),
            vec![
                TrendPoint { trend: TrendLabel::Flat, variance: None },
                TrendPoint { trend: TrendLabel::Rising, variance: Some(0.5) },
                TrendPoint { trend: TrendLabel::Unknown, variance: Some(0.5) },
                TrendPoint { trend: TrendLabel::Rising, variance: Some(0.5) },
            ],
        )]);
        t.merge_trend(&points).unwrap();
        t.add_lagged_prices(1).unwrap();
        let kept = t.drop_incomplete();
        let prices: Vec<_> = kept.rows().iter().map(|r| r.price_usd).collect();
        assert_eq!(prices, vec![2.0, 4.0]);
        assert_eq!(t.with_trend(TrendLabel::Rising).len(), 2);
    }

    #[test]
    fn zero_price_trends_never_reach_training() {
        let p = panel(&[("x", &[0.0, 5.0, 0.0, 4.0])]);
        // compare_extremes: 5/0 and 4/0 are undefined; slope: only the zero close is
        for (method, expected) in [(TrendMethod::CompareExtremes, 1), (TrendMethod::Slope, 2)] {
            let mut t = FeatureTable::from_panel(&p);
            t.merge_trend(&assign_trend(&p, method, 1, 0.05).unwrap()).unwrap();
            let kept = t.drop_incomplete();
            assert!(kept.rows().iter().all(|r| r.trend != Some(TrendLabel::Unknown)));
            assert_eq!(kept.len(), expected, "{method}");
        }
    }

    #[test]
    fn columns_follow_applied_stages() {
        let mut t = FeatureTable::from_panel(&panel(&[("x", &[1.0, 2.0])]));
        assert_eq!(t.columns(), vec!["coin_id", "date", "price_usd"]);

        let levels = BTreeMap::from([("x".to_string(), vec![RiskLevel::Low, RiskLevel::High])]);
        t.merge_risk(&levels).unwrap();
        t.add_lagged_prices(2).unwrap();
        t.normalize_prices().unwrap();
        t.add_calendar_features();
        assert_eq!(
            t.columns(),
            vec![
                "coin_id",
                "date",
                "risk_level",
                "price_usd",
                "price_usd-1",
                "price_usd-2",
                "price_usd-1_orig",
                "is_weekend",
                "is_US_holiday",
                "is_China_holiday"
            ]
        );
        let rec = t.record(&t.rows()[1]);
        assert_eq!(rec, vec!["x", "2024-01-02", "High", "2", "1", "", "1", "0", "0", "0"]);
        let first = t.record(&t.rows()[0]);
        assert_eq!(first[7..], ["0", "1", "1"]);
    }
}
