pub mod calendar;
pub mod error;
pub mod features;
pub mod fetch;
pub mod model;
pub mod pipeline;
pub mod render;
pub mod risk;
pub mod series;
pub mod split;
pub mod trend;

pub use error::{PipelineError, Result};
pub use features::{FeatureRow, FeatureTable};
pub use pipeline::{FeaturePipeline, PipelineConfig};
pub use series::{CoinSeries, CsvPriceSource, Observation, Panel, PriceSource};

use clap::{Args, Parser};
use std::path::PathBuf;

/// Downloads daily USD prices from CoinGecko into the CSV store.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct FetchArgs {
    /// Coin ids, e.g. bitcoin,ethereum,cardano
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub coins: Option<Vec<String>>,

    /// Single day to fetch, YYYY-MM-DD
    #[arg(long)]
    pub date: Option<String>,

    /// Bulk mode start date (inclusive), YYYY-MM-DD
    #[arg(long)]
    pub start: Option<String>,

    /// Bulk mode end date (inclusive), YYYY-MM-DD. Defaults to today
    #[arg(long)]
    pub end: Option<String>,

    /// CSV store (coin_id,date,price_usd); new rows are merged in
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// CoinGecko demo API key (or set COINGECKO_API_KEY env)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Concurrent requests (mind the demo plan rate limit)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Attempts per request before the day is skipped
    #[arg(long)]
    pub attempts: Option<usize>,

    /// Wait (ms) between attempts
    #[arg(long)]
    pub retry_delay_ms: Option<u64>,

    /// Optional lock file path to prevent concurrent runs
    #[arg(long)]
    pub lock_file: Option<PathBuf>,
}

/// Shows recent prices and writes the history view.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct HistoryArgs {
    /// CSV store to read
    #[arg(long)]
    pub data: Option<PathBuf>,
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub coins: Option<Vec<String>>,
    /// Number of days to show, ending at --last-date
    #[arg(long)]
    pub days: Option<u32>,
    /// Last day of the view, YYYY-MM-DD. Defaults to the latest stored day
    #[arg(long)]
    pub last_date: Option<String>,
    /// Restrict to one calendar month (1-12, name or abbreviation), across years
    #[arg(long)]
    pub month: Option<String>,
    /// Output directory for views
    #[arg(long)]
    pub out: Option<PathBuf>,
}

/// Assigns risk levels and prints a slice of the annotated table.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct RiskArgs {
    #[arg(long)]
    pub data: Option<PathBuf>,
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub coins: Option<Vec<String>>,
    /// Consecutive down days that make a drop streak
    #[arg(long)]
    pub streak_days: Option<u32>,
    /// Calendar days a drop keeps risk elevated
    #[arg(long)]
    pub period_days: Option<u32>,
    /// Print integer codes (1/2/3) instead of labels
    #[arg(long)]
    pub map_risk: Option<bool>,
}

/// Labels price trends of one coin and writes the trend view.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct TrendArgs {
    #[arg(long)]
    pub data: Option<PathBuf>,
    #[arg(long)]
    pub coin: Option<String>,
    /// slope | compare_extremes
    #[arg(long)]
    pub method: Option<String>,
    /// Lookback in rows
    #[arg(long)]
    pub window: Option<u32>,
    /// Relative change above which a move counts as Rising/Dropping
    #[arg(long)]
    pub fraction: Option<f64>,
    #[arg(long)]
    pub out: Option<PathBuf>,
}

/// Stage switches and parameters shared by `features` and `train`.
/// Unset values fall back to [`PipelineConfig::default`].
#[derive(Args, Debug, Clone, Default)]
pub struct PipelineArgs {
    #[arg(long)]
    pub risk: Option<bool>,
    #[arg(long)]
    pub streak_days: Option<u32>,
    #[arg(long)]
    pub period_days: Option<u32>,
    #[arg(long)]
    pub map_risk: Option<bool>,
    #[arg(long)]
    pub trend: Option<bool>,
    /// slope | compare_extremes
    #[arg(long)]
    pub method: Option<String>,
    #[arg(long)]
    pub window: Option<u32>,
    #[arg(long)]
    pub fraction: Option<f64>,
    #[arg(long)]
    pub lags: Option<bool>,
    /// Number of lagged price columns
    #[arg(long)]
    pub lag_window: Option<usize>,
    /// Divide lags by yesterday's price
    #[arg(long)]
    pub normalize: Option<bool>,
    #[arg(long)]
    pub calendar: Option<bool>,
    /// Share of each coin's rows used for training
    #[arg(long)]
    pub train_fraction: Option<f64>,
}

impl PipelineArgs {
    pub fn config(&self) -> Result<PipelineConfig> {
        let d = PipelineConfig::default();
        let config = PipelineConfig {
            apply_risk: self.risk.unwrap_or(d.apply_risk),
            streak_days: self.streak_days.unwrap_or(d.streak_days),
            period_days: self.period_days.unwrap_or(d.period_days),
            map_risk: self.map_risk.unwrap_or(d.map_risk),
            apply_trend: self.trend.unwrap_or(d.apply_trend),
            trend_method: match &self.method {
                Some(m) => m.parse()?,
                None => d.trend_method,
            },
            window: self.window.unwrap_or(d.window),
            fraction: self.fraction.unwrap_or(d.fraction),
            apply_lags: self.lags.unwrap_or(d.apply_lags),
            lag_window: self.lag_window.unwrap_or(d.lag_window),
            normalize_prices: self.normalize.unwrap_or(d.normalize_prices),
            apply_calendar: self.calendar.unwrap_or(d.apply_calendar),
            train_fraction: self.train_fraction.unwrap_or(d.train_fraction),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Builds the feature table and prints its head.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct FeaturesArgs {
    #[arg(long)]
    pub data: Option<PathBuf>,
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub coins: Option<Vec<String>>,
    #[command(flatten)]
    pub pipeline: PipelineArgs,
    /// Write the full table here
    #[arg(long)]
    pub csv_out: Option<PathBuf>,
}

/// Trains one linear model per coin and reports test RMSE.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct TrainArgs {
    #[arg(long)]
    pub data: Option<PathBuf>,
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub coins: Option<Vec<String>>,
    #[command(flatten)]
    pub pipeline: PipelineArgs,
    /// Output directory for prediction views
    #[arg(long)]
    pub out: Option<PathBuf>,
}
