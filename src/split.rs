use crate::error::{PipelineError, Result};
use crate::features::{FeatureRow, FeatureTable};

pub fn validate_train_fraction(train_fraction: f64) -> Result<()> {
    if !(train_fraction > 0.0 && train_fraction < 1.0) {
        return Err(PipelineError::invalid(
            "train_fraction",
            format!("must lie strictly between 0 and 1, got {train_fraction}"),
        ));
    }
    Ok(())
}

/// `floor(len * train_fraction)`
pub fn split_index(len: usize, train_fraction: f64) -> usize {
    ((len as f64) * train_fraction).floor() as usize
}

/// Rows before the split index train, the rest test. Order is preserved.
pub fn chronological_split<T: Clone>(
    rows: &[T],
    train_fraction: f64,
) -> Result<(Vec<T>, Vec<T>)> {
    validate_train_fraction(train_fraction)?;
    let (train, test) = rows.split_at(split_index(rows.len(), train_fraction).min(rows.len()));
    Ok((train.to_vec(), test.to_vec()))
}

/// Train/test partition of a single coin's timeline.
#[derive(Debug, Clone)]
pub struct CoinSplit {
    pub coin_id: String,
    pub train: Vec<FeatureRow>,
    pub test: Vec<FeatureRow>,
}

/// Splits every coin on its own timeline.
pub fn split_per_coin(table: &FeatureTable, train_fraction: f64) -> Result<Vec<CoinSplit>> {
    validate_train_fraction(train_fraction)?;
    table
        .rows()
        .chunk_by(|a, b| a.coin_id == b.coin_id)
        .map(|rows| {
            let (train, test) = chronological_split(rows, train_fraction)?;
            Ok(CoinSplit {
                coin_id: rows[0].coin_id.clone(),
                train,
                test,
            })
        })
        .collect()
}
