use chrono::{Datelike, Duration, Month, NaiveDate};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{IntegrityIssue, PipelineError, Result};

/// One daily price point, as delivered by the store: `coin_id,date,price_usd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub coin_id: String,
    pub date: NaiveDate,
    pub price_usd: f64,
}

/// Daily prices of a single coin, strictly ascending by date.
#[derive(Debug, Clone, PartialEq)]
pub struct CoinSeries {
    coin_id: String,
    dates: Vec<NaiveDate>,
    prices: Vec<f64>,
}

impl CoinSeries {
    /// Builds a series from points that must already be in strictly increasing date order.
    pub fn new(coin_id: impl Into<String>, points: Vec<(NaiveDate, f64)>) -> Result<Self> {
        let coin_id = coin_id.into();
        let mut dates = Vec::with_capacity(points.len());
        let mut prices = Vec::with_capacity(points.len());
        for (date, price) in points {
            if !price.is_finite() || price < 0.0 {
                return Err(integrity(&coin_id, date, IntegrityIssue::InvalidPrice));
            }
            if let Some(prev) = dates.last() {
                if date == *prev {
                    return Err(integrity(&coin_id, date, IntegrityIssue::DuplicateDate));
                }
                if date < *prev {
                    return Err(integrity(&coin_id, date, IntegrityIssue::NonIncreasingDate));
                }
            }
            dates.push(date);
            prices.push(price);
        }
        Ok(Self {
            coin_id,
            dates,
            prices,
        })
    }

    pub fn coin_id(&self) -> &str {
        &self.coin_id
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn prices(&self) -> &[f64] {
        &self.prices
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn observations(&self) -> impl Iterator<Item = Observation> + '_ {
        self.dates
            .iter()
            .zip(self.prices.iter())
            .map(|(d, p)| Observation {
                coin_id: self.coin_id.clone(),
                date: *d,
                price_usd: *p,
            })
    }

    fn retain(&self, keep: impl Fn(NaiveDate) -> bool) -> CoinSeries {
        let (dates, prices): (Vec<NaiveDate>, Vec<f64>) = self
            .dates
            .iter()
            .zip(self.prices.iter())
            .filter(|(d, _)| keep(**d))
            .map(|(d, p)| (*d, *p))
            .unzip();
        CoinSeries {
            coin_id: self.coin_id.clone(),
            dates,
            prices,
        }
    }
}

fn integrity(coin_id: &str, date: NaiveDate, issue: IntegrityIssue) -> PipelineError {
    PipelineError::DataIntegrity {
        coin_id: coin_id.to_string(),
        date,
        issue,
    }
}

/// All coins of one snapshot, each in its own independent buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Panel {
    series: BTreeMap<String, CoinSeries>,
}

impl Panel {
    /// Groups raw observations by coin and sorts each group by date.
    ///
    /// Input order does not matter, but a repeated (coin, date) pair is rejected
    /// instead of being silently collapsed.
    pub fn from_observations(observations: impl IntoIterator<Item = Observation>) -> Result<Self> {
        let mut grouped: BTreeMap<String, Vec<(NaiveDate, f64)>> = BTreeMap::new();
        for obs in observations {
            grouped
                .entry(obs.coin_id)
                .or_default()
                .push((obs.date, obs.price_usd));
        }

        let mut series = BTreeMap::new();
        for (coin_id, mut points) in grouped {
            points.sort_by_key(|(d, _)| *d);
            let s = CoinSeries::new(coin_id.clone(), points)?;
            debug!("loaded {} rows for {}", s.len(), coin_id);
            series.insert(coin_id, s);
        }
        Ok(Self { series })
    }

    /// Adds or replaces one coin's series.
    pub fn insert(&mut self, series: CoinSeries) {
        self.series.insert(series.coin_id.clone(), series);
    }

    pub fn get(&self, coin_id: &str) -> Option<&CoinSeries> {
        self.series.get(coin_id)
    }

    pub fn coins(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoinSeries> {
        self.series.values()
    }

    pub(crate) fn series_map(&self) -> &BTreeMap<String, CoinSeries> {
        &self.series
    }

    pub fn coin_count(&self) -> usize {
        self.series.len()
    }

    pub fn row_count(&self) -> usize {
        self.series.values().map(CoinSeries::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    pub fn latest_date(&self) -> Option<NaiveDate> {
        self.series
            .values()
            .filter_map(|s| s.dates.last().copied())
            .max()
    }

    /// Every observation, ordered by coin then date.
    pub fn observations(&self) -> Vec<Observation> {
        self.series
            .values()
            .flat_map(CoinSeries::observations)
            .collect()
    }

    /// Restricts the panel to the given coins; unknown names are ignored.
    pub fn select<S: AsRef<str>>(&self, coins: &[S]) -> Panel {
        let series = coins
            .iter()
            .filter_map(|c| self.series.get(c.as_ref()))
            .map(|s| (s.coin_id.clone(), s.clone()))
            .collect();
        Panel { series }
    }

    /// Keeps rows with `last - days < date <= last`.
    ///
    /// `last_date` defaults to the most recent date in the panel.
    pub fn last_n_days(&self, days: u32, last_date: Option<NaiveDate>) -> Panel {
        let Some(last) = last_date.or_else(|| self.latest_date()) else {
            return Panel::default();
        };
        let cutoff = last - Duration::days(i64::from(days));
        self.filter_dates(|d| d > cutoff && d <= last)
    }

    /// Keeps rows falling in the given calendar month, across all years.
    pub fn month(&self, month: &str) -> Result<Panel> {
        let month = parse_month(month)?;
        Ok(self.filter_dates(|d| d.month() == month))
    }

    fn filter_dates(&self, keep: impl Fn(NaiveDate) -> bool + Copy) -> Panel {
        let series = self
            .series
            .iter()
            .map(|(coin, s)| (coin.clone(), s.retain(keep)))
            .filter(|(_, s)| !s.is_empty())
            .collect();
        Panel { series }
    }
}

/// Accepts `1..=12`, a full month name or a three-letter abbreviation.
pub fn parse_month(month: &str) -> Result<u32> {
    let month = month.trim();
    if let Ok(n) = month.parse::<u32>() {
        if (1..=12).contains(&n) {
            return Ok(n);
        }
        return Err(PipelineError::invalid("month", format!("{n} is not in 1..=12")));
    }
    month
        .parse::<Month>()
        .map(|m| m.number_from_month())
        .map_err(|_| PipelineError::invalid("month", format!("unrecognized month `{month}`")))
}

/// Data-source seam: anything that can hand over a clean panel snapshot.
pub trait PriceSource {
    fn load(&self) -> Result<Panel>;
}

/// Reads a `coin_id,date,price_usd` CSV file.
#[derive(Debug, Clone)]
pub struct CsvPriceSource {
    path: PathBuf,
}

impl CsvPriceSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PriceSource for CsvPriceSource {
    fn load(&self) -> Result<Panel> {
        let observations = read_observations(&self.path)?;
        Panel::from_observations(observations)
    }
}

pub fn read_observations(path: &Path) -> Result<Vec<Observation>> {
    let mut rdr = ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    let mut out = Vec::new();
    for rec in rdr.deserialize::<Observation>() {
        out.push(rec?);
    }
    Ok(out)
}

/// Writes observations to `path` through a temp file in the same directory, then renames.
pub fn write_observations(path: &Path, observations: &[Observation]) -> Result<()> {
    let dir = parent_dir(path);
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut wtr = WriterBuilder::new().from_writer(tmp.as_file_mut());
        for obs in observations {
            wtr.serialize(obs)?;
        }
        wtr.flush()?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn obs(coin: &str, date: NaiveDate, price: f64) -> Observation {
        Observation {
            coin_id: coin.to_string(),
            date,
            price_usd: price,
        }
    }

    #[test]
    fn groups_and_sorts_per_coin() {
        let panel = Panel::from_observations(vec![
            obs("ethereum", d(2024, 1, 2), 2.0),
            obs("bitcoin", d(2024, 1, 3), 30.0),
            obs("bitcoin", d(2024, 1, 1), 10.0),
            obs("ethereum", d(2024, 1, 1), 1.0),
            obs("bitcoin", d(2024, 1, 2), 20.0),
        ])
        .unwrap();

        assert_eq!(panel.coins().collect::<Vec<_>>(), vec!["bitcoin", "ethereum"]);
        let btc = panel.get("bitcoin").unwrap();
        assert_eq!(btc.prices(), &[10.0, 20.0, 30.0]);
        assert_eq!(btc.dates()[0], d(2024, 1, 1));
        assert_eq!(panel.row_count(), 5);
        assert_eq!(panel.latest_date(), Some(d(2024, 1, 3)));
    }

    #[test]
    fn duplicate_coin_date_fails_fast() {
        let err = Panel::from_observations(vec![
            obs("bitcoin", d(2024, 1, 1), 10.0),
            obs("bitcoin", d(2024, 1, 1), 11.0),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DataIntegrity {
                issue: IntegrityIssue::DuplicateDate,
                ..
            }
        ));
    }

    #[test]
    fn series_rejects_unordered_dates_and_bad_prices() {
        let err =
            CoinSeries::new("x", vec![(d(2024, 1, 2), 1.0), (d(2024, 1, 1), 1.0)]).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DataIntegrity {
                issue: IntegrityIssue::NonIncreasingDate,
                ..
            }
        ));

        let err = CoinSeries::new("x", vec![(d(2024, 1, 1), -1.0)]).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DataIntegrity {
                issue: IntegrityIssue::InvalidPrice,
                ..
            }
        ));
    }

    #[test]
    fn last_n_days_window_is_left_open() {
        let points = (1..=10).map(|i| (d(2024, 3, i), i as f64)).collect();
        let mut panel = Panel::default();
        panel.insert(CoinSeries::new("bitcoin", points).unwrap());

        let recent = panel.last_n_days(3, None);
        assert_eq!(recent.get("bitcoin").unwrap().prices(), &[8.0, 9.0, 10.0]);

        let anchored = panel.last_n_days(2, Some(d(2024, 3, 5)));
        assert_eq!(anchored.get("bitcoin").unwrap().prices(), &[4.0, 5.0]);
    }

    #[test]
    fn month_filter_accepts_names_and_numbers() {
        let panel = Panel::from_observations(vec![
            obs("bitcoin", d(2023, 2, 1), 1.0),
            obs("bitcoin", d(2024, 2, 10), 2.0),
            obs("bitcoin", d(2024, 3, 1), 3.0),
        ])
        .unwrap();

        for m in ["2", "feb", "February", "FEB"] {
            let feb = panel.month(m).unwrap();
            assert_eq!(feb.get("bitcoin").unwrap().prices(), &[1.0, 2.0]);
        }
        assert!(parse_month("13").is_err());
        assert!(parse_month("smarch").is_err());
    }

    #[test]
    fn select_ignores_unknown_coins() {
        let panel = Panel::from_observations(vec![
            obs("bitcoin", d(2024, 1, 1), 1.0),
            obs("cardano", d(2024, 1, 1), 1.0),
        ])
        .unwrap();
        let sel = panel.select(&["cardano", "dogecoin"]);
        assert_eq!(sel.coins().collect::<Vec<_>>(), vec!["cardano"]);
    }

    #[test]
    fn csv_store_round_trips_through_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prices.csv");
        let rows = vec![
            obs("bitcoin", d(2024, 1, 2), 42000.5),
            obs("bitcoin", d(2024, 1, 1), 41000.0),
        ];
        write_observations(&path, &rows).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("coin_id,date,price_usd"));

        let panel = CsvPriceSource::new(&path).load().unwrap();
        assert_eq!(panel.get("bitcoin").unwrap().prices(), &[41000.0, 42000.5]);
    }
}
