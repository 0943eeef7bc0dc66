//! Process configuration.
//!
//! Loaded once from a JSON file; durations use humantime strings
//! (`"20m"`, `"9m20s"`).

use crate::error::{AppError, AppResult};
use bfx_engine::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_realtime() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Encrypted API credential file.
    pub auth_file: PathBuf,
    /// Hex-encoded unlock password hash.
    pub password_file: PathBuf,
    /// Funding currency this instance manages.
    pub currency: String,
    /// Period between the exchange's auto-loan ticks.
    #[serde(with = "humantime_serde")]
    pub auto_loan_fetch_period: Duration,
    /// Offset after a tick at which the activation window begins.
    #[serde(with = "humantime_serde")]
    pub auto_loan_fetch_shift: Duration,
    /// Offset after a tick at which the window ends.
    #[serde(with = "humantime_serde")]
    pub auto_loan_fetch_end_shift: Duration,
    /// Minimum relative rate gap (0..1) to justify refinancing.
    pub min_rate_difference: f64,
    /// Minimum order value in USD to submit a task.
    pub min_order_amount: f64,
    /// Relative ask-rate drop triggering early firing.
    pub min_rate_diff_in_ask_to_force_borrow: f64,
    /// Enable realtime order-book checking.
    #[serde(default = "default_realtime")]
    pub realtime: bool,
}

impl Config {
    pub fn load(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| AppError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.currency.is_empty() {
            return Err(AppError::Config("currency must be set".into()));
        }
        if self.auto_loan_fetch_period.is_zero() {
            return Err(AppError::Config("autoLoanFetchPeriod must be nonzero".into()));
        }
        for (name, v) in [
            ("minRateDifference", self.min_rate_difference),
            (
                "minRateDiffInAskToForceBorrow",
                self.min_rate_diff_in_ask_to_force_borrow,
            ),
        ] {
            if !(0.0..1.0).contains(&v) {
                return Err(AppError::Config(format!("{name} must be within [0, 1)")));
            }
        }
        if self.min_order_amount < 0.0 {
            return Err(AppError::Config("minOrderAmount must not be negative".into()));
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            currency: self.currency.clone(),
            auto_loan_fetch_period: self.auto_loan_fetch_period,
            auto_loan_fetch_shift: self.auto_loan_fetch_shift,
            auto_loan_fetch_end_shift: self.auto_loan_fetch_end_shift,
            min_rate_difference: self.min_rate_difference,
            min_order_amount: self.min_order_amount,
            min_rate_diff_in_ask_to_force_borrow: self.min_rate_diff_in_ask_to_force_borrow,
            realtime: self.realtime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "authFile": "auth.dat",
        "passwordFile": "password.hex",
        "currency": "UST",
        "autoLoanFetchPeriod": "20m",
        "autoLoanFetchShift": "15m",
        "autoLoanFetchEndShift": "9m 20s",
        "minRateDifference": 0.2,
        "minOrderAmount": 150,
        "minRateDiffInAskToForceBorrow": 0.1
    }"#;

    #[test]
    fn test_parse_sample() {
        let config: Config = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(config.currency, "UST");
        assert_eq!(config.auto_loan_fetch_period, Duration::from_secs(20 * 60));
        assert_eq!(
            config.auto_loan_fetch_end_shift,
            Duration::from_secs(9 * 60 + 20)
        );
        assert!(config.realtime); // default
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_bad_rate_gap() {
        let mut config: Config = serde_json::from_str(SAMPLE).unwrap();
        config.min_rate_difference = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_currency() {
        let mut config: Config = serde_json::from_str(SAMPLE).unwrap();
        config.currency.clear();
        assert!(config.validate().is_err());
    }
}
