use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::error::{AppError, AppResult};

/// Which storage backend the service runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

/// Runtime configuration, passed explicitly into every component
#[derive(Debug, Clone)]
pub struct PayoutConfig {
    pub database_url: String,
    pub bind_address: String,
    /// Days between a sale and its earnings becoming withdrawable
    pub hold_period_days: i64,
    /// Minimum available balance (minor units) before a disbursement is attempted
    pub min_payout_amount: i64,
    pub platform_fee_rate: Decimal,
    /// USD -> local currency rate used when prices are recomputed
    pub conversion_rate: Decimal,
    pub currency: String,
    pub cron_token: String,
    pub gateway_base_url: String,
    pub gateway_secret_key: String,
    pub gateway_timeout_secs: u64,
    /// 0 disables the in-process schedule loop
    pub schedule_interval_secs: u64,
    pub stale_payout_after_minutes: i64,
    pub recompute_prices: bool,
    pub storage: StorageBackend,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/payouts".to_string(),
            bind_address: "0.0.0.0:8080".to_string(),
            hold_period_days: 3,
            min_payout_amount: 10_000,
            platform_fee_rate: dec!(0.10),
            conversion_rate: dec!(56),
            currency: "PHP".to_string(),
            cron_token: String::new(),
            gateway_base_url: "https://api.paymongo.com/v1".to_string(),
            gateway_secret_key: String::new(),
            gateway_timeout_secs: 15,
            schedule_interval_secs: 0,
            stale_payout_after_minutes: 30,
            recompute_prices: false,
            storage: StorageBackend::Postgres,
        }
    }
}

/// Raw environment view; env var names lowercased by the `config` crate
#[derive(Debug, Deserialize)]
struct RawSettings {
    database_url: String,
    bind_address: String,
    payout_hold_days: i64,
    min_payout_amount: i64,
    platform_fee_rate: String,
    usd_to_local_rate: String,
    payout_currency: String,
    payouts_cron_token: String,
    paymongo_base_url: String,
    paymongo_secret_key: String,
    gateway_timeout_secs: u64,
    payout_schedule_interval_secs: u64,
    stale_payout_after_minutes: i64,
    recompute_prices: bool,
    storage: String,
}

impl PayoutConfig {
    pub fn from_env() -> AppResult<Self> {
        let defaults = Self::default();

        let settings = config::Config::builder()
            .set_default("database_url", defaults.database_url.clone())?
            .set_default("bind_address", defaults.bind_address.clone())?
            .set_default("payout_hold_days", defaults.hold_period_days)?
            .set_default("min_payout_amount", defaults.min_payout_amount)?
            .set_default("platform_fee_rate", defaults.platform_fee_rate.to_string())?
            .set_default("usd_to_local_rate", defaults.conversion_rate.to_string())?
            .set_default("payout_currency", defaults.currency.clone())?
            .set_default("payouts_cron_token", "")?
            .set_default("paymongo_base_url", defaults.gateway_base_url.clone())?
            .set_default("paymongo_secret_key", "")?
            .set_default("gateway_timeout_secs", defaults.gateway_timeout_secs)?
            .set_default("payout_schedule_interval_secs", defaults.schedule_interval_secs)?
            .set_default("stale_payout_after_minutes", defaults.stale_payout_after_minutes)?
            .set_default("recompute_prices", false)?
            .set_default("storage", "postgres")?
            .add_source(config::Environment::default())
            .build()?;

        let raw: RawSettings = settings.try_deserialize()?;

        let config = Self {
            database_url: raw.database_url,
            bind_address: raw.bind_address,
            hold_period_days: raw.payout_hold_days,
            min_payout_amount: raw.min_payout_amount,
            platform_fee_rate: parse_decimal("PLATFORM_FEE_RATE", &raw.platform_fee_rate)?,
            conversion_rate: parse_decimal("USD_TO_LOCAL_RATE", &raw.usd_to_local_rate)?,
            currency: raw.payout_currency,
            cron_token: raw.payouts_cron_token,
            gateway_base_url: raw.paymongo_base_url,
            gateway_secret_key: raw.paymongo_secret_key,
            gateway_timeout_secs: raw.gateway_timeout_secs,
            schedule_interval_secs: raw.payout_schedule_interval_secs,
            stale_payout_after_minutes: raw.stale_payout_after_minutes,
            recompute_prices: raw.recompute_prices,
            storage: match raw.storage.to_ascii_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                "postgres" => StorageBackend::Postgres,
                other => {
                    return Err(AppError::Config(format!("Unknown STORAGE backend: {}", other)))
                }
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.hold_period_days < 0 {
            return Err(AppError::Config("PAYOUT_HOLD_DAYS must not be negative".into()));
        }
        if self.min_payout_amount < 0 {
            return Err(AppError::Config("MIN_PAYOUT_AMOUNT must not be negative".into()));
        }
        if self.platform_fee_rate < Decimal::ZERO || self.platform_fee_rate >= Decimal::ONE {
            return Err(AppError::Config("PLATFORM_FEE_RATE must be in [0, 1)".into()));
        }
        if self.conversion_rate <= Decimal::ZERO {
            return Err(AppError::Config("USD_TO_LOCAL_RATE must be positive".into()));
        }
        if self.currency.trim().is_empty() {
            return Err(AppError::Config("PAYOUT_CURRENCY must be set".into()));
        }
        Ok(())
    }

    pub fn hold_period(&self) -> chrono::Duration {
        chrono::Duration::days(self.hold_period_days)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn stale_payout_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stale_payout_after_minutes)
    }
}

fn parse_decimal(name: &str, value: &str) -> AppResult<Decimal> {
    Decimal::from_str(value.trim())
        .map_err(|e| AppError::Config(format!("{} is not a decimal ({}): {}", name, value, e)))
}
