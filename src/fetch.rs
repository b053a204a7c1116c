use anyhow::{Context, Result, bail};
use chrono::{Duration, NaiveDate};
use futures::future::join_all;
use reqwest::{Client, header};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    env,
    fs::{self, OpenOptions},
    path::Path,
    sync::Arc,
    time::Duration as StdDuration,
};
use tokio::sync::Semaphore;
use tokio_retry::{Retry, strategy::FixedInterval};
use tracing::{error, info, warn};

use fs2::FileExt; // for file locking

use crate::FetchArgs;
use crate::series::{Observation, parent_dir, read_observations, write_observations};

pub const API_BASE: &str = "https://api.coingecko.com/api/v3";
/// The demo history endpoint only serves the trailing year.
pub const MAX_HISTORY_DAYS: i64 = 365;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub delay_ms: u64,
}

impl RetryPolicy {
    fn strategy(self) -> impl Iterator<Item = StdDuration> {
        FixedInterval::from_millis(self.delay_ms).take(self.attempts.saturating_sub(1))
    }
}

pub async fn execute(args: &FetchArgs) -> Result<()> {
    let store = args.store.as_ref().context("missing --store")?;
    let coins = args.coins.as_ref().context("missing --coins")?;
    let api_key = args
        .api_key
        .clone()
        .or_else(|| env::var("COINGECKO_API_KEY").ok());
    if api_key.is_none() {
        warn!("no COINGECKO_API_KEY set; requests will be anonymous");
    }

    // Optional single-instance lock
    let _lock_guard = args
        .lock_file
        .as_ref()
        .map(|lock_path| acquire_lock(lock_path))
        .transpose()?;

    let today = chrono::Local::now().date_naive();
    let dates = requested_dates(args, today)?;
    let dates: Vec<NaiveDate> = dates
        .into_iter()
        .filter(|d| match check_history_date(*d, today) {
            Ok(()) => true,
            Err(e) => {
                warn!("{} skipped: {}", d, e);
                false
            }
        })
        .collect();
    if dates.is_empty() {
        info!("no requestable dates; nothing to do");
        return Ok(());
    }

    let client = mk_client(api_key.as_deref())?;
    let retry = RetryPolicy {
        attempts: args.attempts.unwrap_or(5),
        delay_ms: args.retry_delay_ms.unwrap_or(5_000),
    };
    let concurrency = args.concurrency.unwrap_or(1).max(1);
    info!(
        "fetching {} coins x {} days with {} workers",
        coins.len(),
        dates.len(),
        concurrency
    );

    let fetched = fetch_prices(&client, API_BASE, coins, &dates, concurrency, retry).await;
    let existing = if store.exists() {
        read_observations(store).with_context(|| format!("read {}", store.display()))?
    } else {
        Vec::new()
    };
    let before = existing.len();
    let merged = merge_observations(existing, fetched);
    write_observations(store, &merged).with_context(|| format!("write {}", store.display()))?;
    info!(
        "{}: {} rows ({} new)",
        store.display(),
        merged.len(),
        merged.len().saturating_sub(before)
    );
    Ok(())
}

/// Single `--date`, or the inclusive `--start..=--end` range (end defaults to today).
fn requested_dates(args: &FetchArgs, today: NaiveDate) -> Result<Vec<NaiveDate>> {
    if let Some(date) = &args.date {
        return Ok(vec![parse_iso(date).context("invalid --date")?]);
    }
    let end = match &args.end {
        Some(end) => parse_iso(end).context("invalid --end")?,
        None => today,
    };
    let start = match &args.start {
        Some(start) => parse_iso(start).context("invalid --start")?,
        None => end,
    };
    let dates = date_range(start, end);
    if dates.is_empty() {
        bail!("invalid date range: {start} .. {end}");
    }
    Ok(dates)
}

fn parse_iso(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .with_context(|| format!("`{s}` is not YYYY-MM-DD"))
}

/// Every day from `start` to `end`, both included. Empty when `end < start`.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start.iter_days().take_while(|d| *d <= end).collect()
}

pub fn check_history_date(date: NaiveDate, today: NaiveDate) -> Result<()> {
    if date > today {
        bail!("date is in the future");
    }
    if date < today - Duration::days(MAX_HISTORY_DAYS) {
        bail!("date must be within the last {MAX_HISTORY_DAYS} days");
    }
    Ok(())
}

/// `dd-mm-yyyy`, the history endpoint's date format.
pub fn api_date(date: NaiveDate) -> String {
    date.format("%d-%m-%Y").to_string()
}

pub fn history_url(base: &str, coin_id: &str, date: NaiveDate) -> Result<reqwest::Url> {
    let url = reqwest::Url::parse_with_params(
        &format!("{base}/coins/{coin_id}/history"),
        &[("date", api_date(date))],
    )?;
    Ok(url)
}

/// `market_data.current_price.usd`, if the payload has one.
pub fn extract_usd_price(payload: &Value) -> Option<f64> {
    payload
        .get("market_data")?
        .get("current_price")?
        .get("usd")?
        .as_f64()
        .filter(|p| p.is_finite() && *p >= 0.0)
}

/// Acquire an exclusive file lock; keep the file handle alive to hold the lock.
pub fn acquire_lock(lock_path: &Path) -> Result<fs::File> {
    fs::create_dir_all(parent_dir(lock_path)).ok();
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(lock_path)
        .with_context(|| format!("open lock {}", lock_path.display()))?;
    file.lock_exclusive()?;
    Ok(file)
}

/// HTTP client carrying the demo key header when one is given.
pub fn mk_client(api_key: Option<&str>) -> Result<Client> {
    let mut headers = header::HeaderMap::new();
    if let Some(key) = api_key {
        headers.insert("x-cg-demo-api-key", header::HeaderValue::from_str(key)?);
    }
    let client = Client::builder()
        .default_headers(headers)
        .user_agent("crypto_features/0.1 (rust)")
        .timeout(StdDuration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .build()?;
    Ok(client)
}

async fn get_json(client: &Client, url: reqwest::Url) -> Result<Value> {
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        bail!("HTTP {status}");
    }
    Ok(resp.json::<Value>().await?)
}

/// USD price of one coin on one day; `None` when the payload has no price.
pub async fn fetch_price(
    client: &Client,
    base: &str,
    coin_id: &str,
    date: NaiveDate,
    retry: RetryPolicy,
) -> Result<Option<f64>> {
    let url = history_url(base, coin_id, date)?;
    let payload = Retry::start(retry.strategy(), || {
        let url = url.clone();
        async move {
            get_json(client, url).await.inspect_err(|e| {
                warn!("{} {}: {} -> retrying", coin_id, date, e);
            })
        }
    })
    .await?;
    Ok(extract_usd_price(&payload))
}

/// Fetches every (coin, date) pair on a bounded pool; failures are logged and skipped.
pub async fn fetch_prices(
    client: &Client,
    base: &str,
    coins: &[String],
    dates: &[NaiveDate],
    concurrency: usize,
    retry: RetryPolicy,
) -> Vec<Observation> {
    let sem = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = vec![];
    for coin in coins {
        for date in dates {
            let Ok(permit) = sem.clone().acquire_owned().await else {
                break;
            };
            let client = client.clone();
            let base = base.to_string();
            let coin = coin.clone();
            let date = *date;

            tasks.push(tokio::spawn(async move {
                let _p = permit;
                match fetch_price(&client, &base, &coin, date, retry).await {
                    Ok(Some(price_usd)) => {
                        info!("fetched {} {}: {}", coin, date, price_usd);
                        Some(Observation {
                            coin_id: coin,
                            date,
                            price_usd,
                        })
                    }
                    Ok(None) => {
                        warn!("{} {}: no USD price in payload", coin, date);
                        None
                    }
                    Err(e) => {
                        error!("failed {} {}: {}", coin, date, e);
                        None
                    }
                }
            }));
        }
    }

    join_all(tasks)
        .await
        .into_iter()
        .filter_map(|joined| joined.ok().flatten())
        .collect()
}

/// Union of stored and fetched rows; the first record of each (coin, date) wins.
pub fn merge_observations(
    existing: Vec<Observation>,
    fetched: Vec<Observation>,
) -> Vec<Observation> {
    let mut by_key: BTreeMap<(String, NaiveDate), Observation> = BTreeMap::new();
    for obs in existing.into_iter().chain(fetched) {
        by_key.entry((obs.coin_id.clone(), obs.date)).or_insert(obs);
    }
    by_key.into_values().collect()
}
