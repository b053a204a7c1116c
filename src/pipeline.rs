use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::features::FeatureTable;
use crate::risk::{assign_risk, validate_risk_params};
use crate::series::Panel;
use crate::split::validate_train_fraction;
use crate::trend::{TrendMethod, assign_trend, validate_trend_params};

/// Parameters and stage switches of one feature run.
///
/// Defaults enable every stage with the usual settings: 1-day streaks over a
/// 30-day risk period, 7-day slope trend at 5% tolerance, 7 lags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub apply_risk: bool,
    pub streak_days: u32,
    pub period_days: u32,
    pub map_risk: bool,
    pub apply_trend: bool,
    pub trend_method: TrendMethod,
    pub window: u32,
    pub fraction: f64,
    pub apply_lags: bool,
    pub lag_window: usize,
    pub normalize_prices: bool,
    pub apply_calendar: bool,
    pub train_fraction: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            apply_risk: true,
            streak_days: 1,
            period_days: 30,
            map_risk: true,
            apply_trend: true,
            trend_method: TrendMethod::Slope,
            window: 7,
            fraction: 0.05,
            apply_lags: true,
            lag_window: 7,
            normalize_prices: true,
            apply_calendar: true,
            train_fraction: 0.75,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.apply_risk {
            validate_risk_params(self.streak_days, self.period_days)?;
        } else if self.map_risk {
            return Err(PipelineError::invalid(
                "map_risk",
                "risk mapping requires risk assignment",
            ));
        }
        if self.apply_trend {
            validate_trend_params(self.window, self.fraction)?;
        }
        if self.apply_lags {
            if self.lag_window == 0 {
                return Err(PipelineError::invalid("lag_window", "must be at least 1"));
            }
        } else if self.normalize_prices {
            return Err(PipelineError::invalid(
                "normalize_prices",
                "normalization requires lagged prices",
            ));
        }
        validate_train_fraction(self.train_fraction)
    }
}

/// Applies the enabled stages in their fixed order:
/// risk, risk mapping, trend/variance, lags, normalization, calendar.
#[derive(Debug, Clone)]
pub struct FeaturePipeline {
    config: PipelineConfig,
}

impl FeaturePipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run(&self, panel: &Panel) -> Result<FeatureTable> {
        let cfg = &self.config;
        let mut table = FeatureTable::from_panel(panel);
        info!(
            "building features for {} coins, {} rows",
            panel.coin_count(),
            table.len()
        );

        if cfg.apply_risk {
            let levels = assign_risk(panel, cfg.streak_days, cfg.period_days)?;
            table.merge_risk(&levels)?;
            if cfg.map_risk {
                table.map_risk_levels()?;
            }
        }
        if cfg.apply_trend {
            let points = assign_trend(panel, cfg.trend_method, cfg.window, cfg.fraction)?;
            table.merge_trend(&points)?;
        }
        if cfg.apply_lags {
            table.add_lagged_prices(cfg.lag_window)?;
            if cfg.normalize_prices {
                table.normalize_prices()?;
            }
        }
        if cfg.apply_calendar {
            table.add_calendar_features();
        }

        info!("feature table ready with {} columns", table.columns().len());
        Ok(table)
    }
}
