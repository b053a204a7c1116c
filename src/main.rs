use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use crypto_features::{
    FeaturePipeline, FeaturesArgs, FetchArgs, HistoryArgs, Panel, PipelineConfig, PriceSource,
    RiskArgs, TrainArgs, TrendArgs, fetch,
    model::{LinearRegressionTrainer, train_per_coin},
    render::{CsvRenderer, Renderer, StyleMap},
    series::CsvPriceSource,
    trend::TrendMethod,
};

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_DATA: &str = "./data/prices.csv";
const DEFAULT_OUT: &str = "./out";

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    Fetch(FetchArgs),
    History(HistoryArgs),
    Risk(RiskArgs),
    Trend(TrendArgs),
    Features(FeaturesArgs),
    Train(TrainArgs),
}

fn default_coins() -> Vec<String> {
    ["bitcoin", "ethereum", "cardano"].map(String::from).to_vec()
}

fn apply_fetch_defaults(args: &mut FetchArgs) {
    if args.coins.is_none() {
        args.coins = Some(default_coins());
    }
    if args.store.is_none() {
        args.store = Some(PathBuf::from(DEFAULT_DATA));
    }
    if args.concurrency.is_none() {
        args.concurrency = Some(1);
    }
    if args.attempts.is_none() {
        args.attempts = Some(5);
    }
    if args.retry_delay_ms.is_none() {
        args.retry_delay_ms = Some(5_000);
    }
}

fn apply_history_defaults(args: &mut HistoryArgs) {
    if args.data.is_none() {
        args.data = Some(PathBuf::from(DEFAULT_DATA));
    }
    if args.coins.is_none() {
        args.coins = Some(default_coins());
    }
    if args.days.is_none() {
        args.days = Some(30);
    }
    if args.out.is_none() {
        args.out = Some(PathBuf::from(DEFAULT_OUT));
    }
}

fn apply_risk_defaults(args: &mut RiskArgs) {
    if args.data.is_none() {
        args.data = Some(PathBuf::from(DEFAULT_DATA));
    }
    if args.streak_days.is_none() {
        args.streak_days = Some(1);
    }
    if args.period_days.is_none() {
        args.period_days = Some(30);
    }
    if args.map_risk.is_none() {
        args.map_risk = Some(false);
    }
}

fn apply_trend_defaults(args: &mut TrendArgs) {
    if args.data.is_none() {
        args.data = Some(PathBuf::from(DEFAULT_DATA));
    }
    if args.coin.is_none() {
        args.coin = Some("bitcoin".to_string());
    }
    if args.method.is_none() {
        args.method = Some(TrendMethod::Slope.to_string());
    }
    if args.window.is_none() {
        args.window = Some(7);
    }
    if args.fraction.is_none() {
        args.fraction = Some(0.05);
    }
    if args.out.is_none() {
        args.out = Some(PathBuf::from(DEFAULT_OUT));
    }
}

fn apply_features_defaults(args: &mut FeaturesArgs) {
    if args.data.is_none() {
        args.data = Some(PathBuf::from(DEFAULT_DATA));
    }
}

fn apply_train_defaults(args: &mut TrainArgs) {
    if args.data.is_none() {
        args.data = Some(PathBuf::from(DEFAULT_DATA));
    }
    if args.out.is_none() {
        args.out = Some(PathBuf::from(DEFAULT_OUT));
    }
}

fn load_panel(data: Option<&PathBuf>, coins: Option<&Vec<String>>) -> Result<Panel> {
    let path = data.context("missing --data")?;
    let panel = CsvPriceSource::new(path)
        .load()
        .with_context(|| format!("load {}", path.display()))?;
    let panel = match coins {
        Some(coins) => panel.select(coins),
        None => panel,
    };
    info!(
        "loaded {} rows for {} coins from {}",
        panel.row_count(),
        panel.coin_count(),
        path.display()
    );
    Ok(panel)
}

fn parse_day(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .with_context(|| format!("`{s}` is not YYYY-MM-DD"))
}

fn print_rows(table: &crypto_features::FeatureTable, rows: &[crypto_features::FeatureRow]) {
    println!("{}", table.columns().join(","));
    for row in rows {
        println!("{}", table.record(row).join(","));
    }
}

fn history(args: &HistoryArgs) -> Result<()> {
    let mut panel = load_panel(args.data.as_ref(), args.coins.as_ref())?;
    if let Some(month) = &args.month {
        panel = panel.month(month)?;
    }
    let last_date = args.last_date.as_deref().map(parse_day).transpose()?;
    let days = args.days.unwrap_or(30);

    let view = panel.last_n_days(days, last_date);
    for series in view.iter() {
        let prices = series.prices();
        let lo = prices.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = prices.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        println!(
            "{:<12} rows={:<4} {} .. {}  min={:.4} max={:.4}",
            series.coin_id(),
            series.len(),
            series.dates().first().map(|d| d.to_string()).unwrap_or_default(),
            series.dates().last().map(|d| d.to_string()).unwrap_or_default(),
            lo,
            hi
        );
    }

    let out = args.out.as_ref().context("missing --out")?;
    let renderer = CsvRenderer::new(out, StyleMap::default());
    let path = renderer.render_history(&panel, days, last_date)?;
    println!("View saved: {}", path.display());
    Ok(())
}

fn risk(args: &RiskArgs) -> Result<()> {
    let panel = load_panel(args.data.as_ref(), args.coins.as_ref())?;
    let config = PipelineConfig {
        streak_days: args.streak_days.unwrap_or(1),
        period_days: args.period_days.unwrap_or(30),
        map_risk: args.map_risk.unwrap_or(false),
        apply_trend: false,
        apply_lags: false,
        normalize_prices: false,
        apply_calendar: false,
        ..PipelineConfig::default()
    };
    let table = FeaturePipeline::new(config)?.run(&panel)?;

    let from = (args.period_days.unwrap_or(30) as usize).min(table.len());
    let to = (from + 30).min(table.len());
    print_rows(&table, &table.rows()[from..to]);
    Ok(())
}

fn trend(args: &TrendArgs) -> Result<()> {
    let coin = args.coin.clone().context("missing --coin")?;
    let panel = load_panel(args.data.as_ref(), Some(&vec![coin.clone()]))?;
    let method: TrendMethod = args.method.as_deref().unwrap_or("slope").parse()?;
    let window = args.window.unwrap_or(7);
    let fraction = args.fraction.unwrap_or(0.05);
    let config = PipelineConfig {
        apply_risk: false,
        map_risk: false,
        trend_method: method,
        window,
        fraction,
        apply_lags: false,
        normalize_prices: false,
        apply_calendar: false,
        ..PipelineConfig::default()
    };
    let table = FeaturePipeline::new(config)?.run(&panel)?;
    print_rows(&table, &table.rows()[..table.len().min(20)]);

    let out = args.out.as_ref().context("missing --out")?;
    let renderer = CsvRenderer::new(out, StyleMap::default());
    let path = renderer.render_trend(&table, &coin, method, window, fraction)?;
    println!("View saved: {}", path.display());
    Ok(())
}

fn features(args: &FeaturesArgs) -> Result<()> {
    let panel = load_panel(args.data.as_ref(), args.coins.as_ref())?;
    let table = FeaturePipeline::new(args.pipeline.config()?)?.run(&panel)?;

    println!("Columns: {}", table.columns().join(", "));
    print_rows(&table, &table.rows()[..table.len().min(5)]);

    if let Some(path) = &args.csv_out {
        table
            .write_csv(path)
            .with_context(|| format!("write {}", path.display()))?;
        println!("Table saved: {}", path.display());
    }
    Ok(())
}

fn train(args: &TrainArgs) -> Result<()> {
    let panel = load_panel(args.data.as_ref(), args.coins.as_ref())?;
    let config = args.pipeline.config()?;
    let table = FeaturePipeline::new(config.clone())?.run(&panel)?;

    let trainer = LinearRegressionTrainer::default();
    let reports = train_per_coin(&table, &trainer, config.train_fraction)?;

    let out = args.out.as_ref().context("missing --out")?;
    let renderer = CsvRenderer::new(out, StyleMap::default());
    println!("{:<12} {:>14} {:>8} {:>8}", "coin_id", "rmse", "train", "test");
    for report in &reports {
        println!(
            "{:<12} {:>14.4} {:>8} {:>8}",
            report.coin_id,
            report.rmse,
            report.train_rows,
            report.predictions.len()
        );
        renderer.render_predictions(&report.coin_id, report.model_name, &report.predictions)?;
    }
    info!("prediction views written to {}", renderer.out_dir().display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    match args.command {
        Some(Command::Fetch(mut fetch_args)) => {
            apply_fetch_defaults(&mut fetch_args);
            fetch::execute(&fetch_args).await?;
        }
        Some(Command::History(mut history_args)) => {
            apply_history_defaults(&mut history_args);
            history(&history_args)?;
        }
        Some(Command::Risk(mut risk_args)) => {
            apply_risk_defaults(&mut risk_args);
            risk(&risk_args)?;
        }
        Some(Command::Trend(mut trend_args)) => {
            apply_trend_defaults(&mut trend_args);
            trend(&trend_args)?;
        }
        Some(Command::Features(mut features_args)) => {
            apply_features_defaults(&mut features_args);
            features(&features_args)?;
        }
        Some(Command::Train(mut train_args)) => {
            apply_train_defaults(&mut train_args);
            train(&train_args)?;
        }
        None => {
            // Default behavior: build features and train on the default store
            println!("Running with default arguments...");
            let data = Path::new(DEFAULT_DATA);
            if !data.exists() {
                println!("No price store at {}; run `fetch` first.", data.display());
                return Ok(());
            }
            let mut train_args = TrainArgs::default();
            apply_train_defaults(&mut train_args);
            train(&train_args)?;
        }
    }
    Ok(())
}
