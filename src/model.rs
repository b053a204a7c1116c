use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::features::{FeatureRow, FeatureTable, PRICE_COLUMN, Stages};
use crate::split::split_per_coin;

pub trait Regressor {
    fn predict(&self, features: &[f64]) -> f64;
}

pub trait ModelTrainer {
    type Model: Regressor;

    fn name(&self) -> &'static str;
    fn fit(&self, x: &[Vec<f64>], y: &[f64]) -> Result<Self::Model>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinearModel {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl Regressor for LinearModel {
    fn predict(&self, features: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(features)
                .map(|(c, x)| c * x)
                .sum::<f64>()
    }
}

/// Least squares with intercept.
///
/// Columns are centered so the intercept is not penalized; `ridge` is scaled
/// by the mean diagonal of the centered normal matrix and keeps constant or
/// collinear columns solvable.
#[derive(Debug, Clone, Copy)]
pub struct LinearRegressionTrainer {
    pub ridge: f64,
}

impl Default for LinearRegressionTrainer {
    fn default() -> Self {
        Self { ridge: 1e-8 }
    }
}

impl ModelTrainer for LinearRegressionTrainer {
    type Model = LinearModel;

    fn name(&self) -> &'static str {
        "linear_regression"
    }

    fn fit(&self, x: &[Vec<f64>], y: &[f64]) -> Result<LinearModel> {
        let fit_err = |reason: String| PipelineError::ModelFit {
            coin_id: String::new(),
            reason,
        };
        if x.is_empty() || x.len() != y.len() {
            return Err(fit_err(format!("{} feature rows for {} targets", x.len(), y.len())));
        }
        let p = x[0].len();
        if x.iter().any(|row| row.len() != p) {
            return Err(fit_err("feature rows differ in length".into()));
        }

        let n = x.len() as f64;
        let y_mean = y.iter().sum::<f64>() / n;
        let x_mean: Vec<f64> = (0..p)
            .map(|j| x.iter().map(|row| row[j]).sum::<f64>() / n)
            .collect();

        // centered normal equations: (Xc'Xc + lambda I) b = Xc'yc
        let mut a = vec![0.0; p * p];
        let mut b = vec![0.0; p];
        for (row, target) in x.iter().zip(y) {
            let yc = target - y_mean;
            for i in 0..p {
                let xi = row[i] - x_mean[i];
                b[i] += xi * yc;
                for j in 0..p {
                    a[i * p + j] += xi * (row[j] - x_mean[j]);
                }
            }
        }
        let trace: f64 = (0..p).map(|i| a[i * p + i]).sum();
        let lambda = self.ridge * (trace / p.max(1) as f64).max(1.0);
        for i in 0..p {
            a[i * p + i] += lambda;
        }

        let coefficients = gauss_elimination(a, b, p)
            .ok_or_else(|| fit_err("normal matrix is singular".into()))?;
        if coefficients.iter().any(|c| !c.is_finite()) {
            return Err(fit_err("non-finite coefficient".into()));
        }
        let intercept = y_mean
            - coefficients
                .iter()
                .zip(&x_mean)
                .map(|(c, m)| c * m)
                .sum::<f64>();
        Ok(LinearModel {
            intercept,
            coefficients,
        })
    }
}

/// Solves `a x = b` for a row-major `n x n` matrix with partial pivoting.
fn gauss_elimination(mut a: Vec<f64>, mut b: Vec<f64>, n: usize) -> Option<Vec<f64>> {
    for col in 0..n {
        let max_row = (col..n)
            .max_by(|&r, &s| a[r * n + col].abs().total_cmp(&a[s * n + col].abs()))
            .unwrap_or(col);
        if max_row != col {
            for j in 0..n {
                a.swap(col * n + j, max_row * n + j);
            }
            b.swap(col, max_row);
        }
        if a[col * n + col].abs() < 1e-15 {
            return None;
        }
        for row in (col + 1)..n {
            let factor = a[row * n + col] / a[col * n + col];
            for j in col..n {
                a[row * n + j] -= factor * a[col * n + j];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let tail: f64 = ((i + 1)..n).map(|j| a[i * n + j] * x[j]).sum();
        x[i] = (b[i] - tail) / a[i * n + i];
    }
    Some(x)
}

/// Numeric model inputs for the applied stages, in column order.
///
/// Categorical risk, trend labels, the raw price and the reference price are
/// never inputs.
pub fn feature_names(stages: Stages) -> Vec<String> {
    let mut names = Vec::new();
    if stages.trend {
        names.push("variance".to_string());
    }
    if stages.risk && stages.risk_mapped {
        names.push("risk_level".to_string());
    }
    names.extend((1..=stages.lag_window).map(|k| format!("{PRICE_COLUMN}-{k}")));
    if stages.calendar {
        names.extend(["is_weekend", "is_US_holiday", "is_China_holiday"].map(String::from));
    }
    names
}

/// Values of [`feature_names`] for one row; `None` if any is missing.
pub fn feature_vector(row: &FeatureRow, stages: Stages) -> Option<Vec<f64>> {
    let mut out = Vec::with_capacity(stages.lag_window + 5);
    if stages.trend {
        out.push(row.variance?);
    }
    if stages.risk && stages.risk_mapped {
        out.push(f64::from(row.risk?.code()));
    }
    for k in 0..stages.lag_window {
        out.push((*row.lags.get(k)?)?);
    }
    if stages.calendar {
        let c = row.calendar?;
        let flags = [c.is_weekend, c.is_us_holiday, c.is_china_holiday];
        out.extend(flags.map(|b| if b { 1.0 } else { 0.0 }));
    }
    Some(out)
}

/// Regression target: today's price, or its ratio to yesterday's once normalized.
pub fn target(row: &FeatureRow, stages: Stages) -> Option<f64> {
    if stages.normalized {
        row.reference_price
            .filter(|r| *r != 0.0)
            .map(|r| row.price_usd / r)
    } else {
        Some(row.price_usd)
    }
}

/// Converts a model output back to an absolute price.
pub fn rescale(predicted: f64, row: &FeatureRow, stages: Stages) -> Option<f64> {
    if stages.normalized {
        row.reference_price.map(|r| predicted * r)
    } else {
        Some(predicted)
    }
}

pub fn rmse(actual: &[f64], predicted: &[f64]) -> f64 {
    let n = actual.len().min(predicted.len());
    if n == 0 {
        return f64::NAN;
    }
    let sse: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).powi(2))
        .sum();
    (sse / n as f64).sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub date: NaiveDate,
    pub actual: f64,
    pub predicted: f64,
}

/// Fitted model and out-of-sample result for one coin.
#[derive(Debug, Clone)]
pub struct CoinReport<M> {
    pub coin_id: String,
    pub model_name: &'static str,
    pub feature_names: Vec<String>,
    pub model: M,
    pub train_rows: usize,
    /// On absolute prices, whatever the target scale.
    pub rmse: f64,
    pub predictions: Vec<Prediction>,
}

fn design(rows: &[FeatureRow], stages: Stages) -> (Vec<&FeatureRow>, Vec<Vec<f64>>, Vec<f64>) {
    let mut kept = Vec::with_capacity(rows.len());
    let mut x = Vec::with_capacity(rows.len());
    let mut y = Vec::with_capacity(rows.len());
    for row in rows {
        if let (Some(features), Some(t)) = (feature_vector(row, stages), target(row, stages)) {
            kept.push(row);
            x.push(features);
            y.push(t);
        }
    }
    (kept, x, y)
}

/// Drops incomplete rows, splits every coin chronologically, fits one model
/// per coin and scores it on that coin's test rows.
///
/// Coins left with an empty train or test side are skipped with a warning.
pub fn train_per_coin<T: ModelTrainer>(
    table: &FeatureTable,
    trainer: &T,
    train_fraction: f64,
) -> Result<Vec<CoinReport<T::Model>>> {
    let complete = table.drop_incomplete();
    let stages = complete.stages();
    let names = feature_names(stages);
    info!(
        "training {} on {} complete rows with {} features",
        trainer.name(),
        complete.len(),
        names.len()
    );

    let mut reports = Vec::new();
    for split in split_per_coin(&complete, train_fraction)? {
        let (_, x_train, y_train) = design(&split.train, stages);
        let (test_rows, x_test, _) = design(&split.test, stages);
        if x_train.is_empty() || x_test.is_empty() {
            warn!(
                "skipping {}: {} train rows, {} test rows",
                split.coin_id,
                x_train.len(),
                x_test.len()
            );
            continue;
        }

        let model = trainer.fit(&x_train, &y_train).map_err(|e| match e {
            PipelineError::ModelFit { reason, .. } => PipelineError::ModelFit {
                coin_id: split.coin_id.clone(),
                reason,
            },
            other => other,
        })?;

        let predictions: Vec<Prediction> = test_rows
            .iter()
            .zip(&x_test)
            .filter_map(|(row, features)| {
                rescale(model.predict(features), row, stages).map(|predicted| Prediction {
                    date: row.date,
                    actual: row.price_usd,
                    predicted,
                })
            })
            .collect();
        let actual: Vec<f64> = predictions.iter().map(|p| p.actual).collect();
        let predicted: Vec<f64> = predictions.iter().map(|p| p.predicted).collect();
        let score = rmse(&actual, &predicted);
        info!("{}: rmse={:.4} over {} test rows", split.coin_id, score, predictions.len());

        reports.push(CoinReport {
            coin_id: split.coin_id,
            model_name: trainer.name(),
            feature_names: names.clone(),
            model,
            train_rows: x_train.len(),
            rmse: score,
            predictions,
        });
    }
    Ok(reports)
}
