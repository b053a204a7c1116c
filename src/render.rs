use chrono::NaiveDate;
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

use crate::error::Result;
use crate::features::FeatureTable;
use crate::model::Prediction;
use crate::series::Panel;
use crate::trend::{TrendLabel, TrendMethod};

/// Plot style of one coin: a named color, a marker and a line pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinStyle {
    pub color: String,
    pub marker: String,
    pub line: String,
}

impl CoinStyle {
    pub fn new(color: &str, marker: &str, line: &str) -> Self {
        Self {
            color: color.to_string(),
            marker: marker.to_string(),
            line: line.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleMap {
    styles: BTreeMap<String, CoinStyle>,
    fallback: CoinStyle,
}

impl Default for StyleMap {
    fn default() -> Self {
        let styles = BTreeMap::from([
            ("bitcoin".to_string(), CoinStyle::new("teal", "o", "-")),
            ("ethereum".to_string(), CoinStyle::new("navy", "s", "--")),
            ("cardano".to_string(), CoinStyle::new("green", "d", ":")),
        ]);
        Self {
            styles,
            fallback: CoinStyle::new("gray", ".", "-"),
        }
    }
}

impl StyleMap {
    pub fn with_style(mut self, coin_id: impl Into<String>, style: CoinStyle) -> Self {
        self.styles.insert(coin_id.into(), style);
        self
    }

    pub fn style(&self, coin_id: &str) -> &CoinStyle {
        self.styles.get(coin_id).unwrap_or(&self.fallback)
    }
}

fn trend_marker(label: TrendLabel) -> &'static str {
    match label {
        TrendLabel::Rising => "v",
        TrendLabel::Flat => "p",
        TrendLabel::Dropping => "*",
        TrendLabel::Unknown => "x",
    }
}

/// Turns panels and model output into chart views.
pub trait Renderer {
    /// Prices of every coin over the `days` days ending at `last_date`
    /// (latest date in the panel when `None`).
    fn render_history(
        &self,
        panel: &Panel,
        days: u32,
        last_date: Option<NaiveDate>,
    ) -> Result<PathBuf>;

    fn render_trend(
        &self,
        table: &FeatureTable,
        coin_id: &str,
        method: TrendMethod,
        window: u32,
        fraction: f64,
    ) -> Result<PathBuf>;

    fn render_predictions(
        &self,
        coin_id: &str,
        model_name: &str,
        predictions: &[Prediction],
    ) -> Result<PathBuf>;
}

/// Writes plot-ready CSV files, one per view, into `out_dir`.
#[derive(Debug, Clone)]
pub struct CsvRenderer {
    out_dir: PathBuf,
    styles: StyleMap,
}

impl CsvRenderer {
    pub fn new(out_dir: impl Into<PathBuf>, styles: StyleMap) -> Self {
        Self {
            out_dir: out_dir.into(),
            styles,
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    fn write(
        &self,
        file_name: &str,
        header: &[&str],
        records: Vec<Vec<String>>,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.out_dir)?;
        let path = self.out_dir.join(file_name);
        let mut wtr = WriterBuilder::new().from_path(&path)?;
        wtr.write_record(header)?;
        for rec in &records {
            wtr.write_record(rec)?;
        }
        wtr.flush()?;
        info!("view saved: {} ({} rows)", path.display(), records.len());
        Ok(path)
    }
}

impl Renderer for CsvRenderer {
    fn render_history(
        &self,
        panel: &Panel,
        days: u32,
        last_date: Option<NaiveDate>,
    ) -> Result<PathBuf> {
        let window = panel.last_n_days(days, last_date);
        let since = last_date
            .or_else(|| panel.latest_date())
            .map(|d| d.to_string())
            .unwrap_or_else(|| "none".to_string());
        let coins: Vec<&str> = panel.coins().collect();
        let file_name = format!("{}_prices_last_{days}_days_since_{since}.csv", coins.join("_"));

        let mut records = Vec::with_capacity(window.row_count());
        for series in window.iter() {
            let style = self.styles.style(series.coin_id());
            for (date, price) in series.dates().iter().zip(series.prices()) {
                records.push(vec![
                    date.to_string(),
                    series.coin_id().to_string(),
                    format!("{:.8}", price),
                    style.color.clone(),
                    style.line.clone(),
                ]);
            }
        }
        self.write(&file_name, &["date", "coin_id", "price_usd", "color", "line"], records)
    }

    fn render_trend(
        &self,
        table: &FeatureTable,
        coin_id: &str,
        method: TrendMethod,
        window: u32,
        fraction: f64,
    ) -> Result<PathBuf> {
        let file_name =
            format!("{coin_id}_trend_{method}_window_{window}_days_tolerance_{fraction}.csv");
        let color = &self.styles.style(coin_id).color;
        let records = table
            .for_coin(coin_id)
            .rows()
            .iter()
            .filter_map(|row| {
                let trend = row.trend?;
                Some(vec![
                    row.date.to_string(),
                    format!("{:.8}", row.price_usd),
                    trend.to_string(),
                    trend_marker(trend).to_string(),
                    color.clone(),
                ])
            })
            .collect();
        self.write(&file_name, &["date", "price_usd", "trend", "marker", "color"], records)
    }

    fn render_predictions(
        &self,
        coin_id: &str,
        model_name: &str,
        predictions: &[Prediction],
    ) -> Result<PathBuf> {
        let file_name = format!("preds_{coin_id}_model_{model_name}.csv");
        let style = self.styles.style(coin_id);
        let records = predictions
            .iter()
            .map(|p| {
                vec![
                    p.date.to_string(),
                    format!("{:.8}", p.actual),
                    format!("{:.8}", p.predicted),
                    style.color.clone(),
                ]
            })
            .collect();
        self.write(&file_name, &["date", "actual", "predicted", "color"], records)
    }
}
