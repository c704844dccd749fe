//! Configuration module for billing-engine.

use crate::models::DunningPolicy;
use rust_decimal::Decimal;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// In-memory store when unset.
    pub database: Option<DatabaseConfig>,
    pub billing: BillingSettings,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Business defaults used by the orchestrator.
#[derive(Debug, Clone)]
pub struct BillingSettings {
    pub invoice_number_prefix: String,
    /// Percentage, e.g. 15 for 15%.
    pub default_tax_rate: Decimal,
    pub default_currency: String,
    pub payment_due_days: i64,
    pub trial_days: i64,
    pub dunning: DunningPolicy,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            invoice_number_prefix: "INV".to_string(),
            default_tax_rate: Decimal::from(15),
            default_currency: "SAR".to_string(),
            payment_due_days: 30,
            trial_days: 14,
            dunning: DunningPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub run_on_startup: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(86_400),
            run_on_startup: false,
        }
    }
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        Self::from_lookup(common, |key| env::var(key).ok())
    }

    /// Build from any key lookup, `from_env` passes the process environment.
    pub fn from_lookup<F>(common: core_config::Config, lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database = match lookup("DATABASE_URL") {
            Some(url) => Some(DatabaseConfig {
                url,
                max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_or(&lookup, "DATABASE_MIN_CONNECTIONS", 2)?,
            }),
            None => None,
        };

        let defaults = BillingSettings::default();
        let dunning = DunningPolicy::from_offsets(
            &day_list_or(&lookup, "DUNNING_STEP_DAYS", &DunningPolicy::DEFAULT_STEP_DAYS)?,
            &day_list_or(
                &lookup,
                "DUNNING_ESCALATION_DAYS",
                &DunningPolicy::DEFAULT_ESCALATION_DAYS,
            )?,
            &day_list_or(&lookup, "DUNNING_RETRY_DAYS", &DunningPolicy::DEFAULT_RETRY_DAYS)?,
            parse_or(
                &lookup,
                "DUNNING_SUSPENSION_DAY",
                DunningPolicy::DEFAULT_SUSPENSION_DAY,
            )?,
            parse_or(
                &lookup,
                "DUNNING_DEACTIVATION_DAY",
                DunningPolicy::DEFAULT_DEACTIVATION_DAY,
            )?,
        )
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Invalid dunning policy: {}", e)))?;

        let billing = BillingSettings {
            invoice_number_prefix: lookup("INVOICE_NUMBER_PREFIX")
                .unwrap_or(defaults.invoice_number_prefix),
            default_tax_rate: parse_or(&lookup, "DEFAULT_TAX_RATE", defaults.default_tax_rate)?,
            default_currency: lookup("DEFAULT_CURRENCY").unwrap_or(defaults.default_currency),
            payment_due_days: parse_or(&lookup, "PAYMENT_DUE_DAYS", defaults.payment_due_days)?,
            trial_days: parse_or(&lookup, "TRIAL_DAYS", defaults.trial_days)?,
            dunning,
        };
        if billing.default_tax_rate < Decimal::ZERO
            || billing.default_tax_rate > Decimal::ONE_HUNDRED
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DEFAULT_TAX_RATE must be between 0 and 100, got {}",
                billing.default_tax_rate
            )));
        }
        if billing.payment_due_days < 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PAYMENT_DUE_DAYS cannot be negative, got {}",
                billing.payment_due_days
            )));
        }
        if billing.trial_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TRIAL_DAYS must be positive, got {}",
                billing.trial_days
            )));
        }

        let scheduler = SchedulerConfig {
            interval: Duration::from_secs(parse_or(&lookup, "SCHEDULER_INTERVAL_SECS", 86_400u64)?),
            run_on_startup: parse_or(&lookup, "SCHEDULER_RUN_ON_STARTUP", false)?,
        };
        if scheduler.interval.is_zero() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SCHEDULER_INTERVAL_SECS must be positive"
            )));
        }

        Ok(Self {
            common,
            service_name: lookup("SERVICE_NAME").unwrap_or_else(|| "billing-engine".to_string()),
            service_version: lookup("SERVICE_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            otlp_endpoint: lookup("OTLP_ENDPOINT"),
            database,
            billing,
            scheduler,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!("{} has invalid value {:?}: {}", key, raw, e))
        }),
        None => Ok(default),
    }
}

fn day_list_or<F>(lookup: &F, key: &str, default: &[i64]) -> Result<Vec<i64>, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default.to_vec());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<i64>().map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("{} has invalid day {:?}: {}", key, part, e))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<BillingConfig, AppError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BillingConfig::from_lookup(core_config::Config::default(), |key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_variables() {
        let config = config_from(&[]).unwrap();
        assert!(config.database.is_none());
        assert_eq!(config.billing.invoice_number_prefix, "INV");
        assert_eq!(config.billing.default_tax_rate, Decimal::from(15));
        assert_eq!(config.billing.dunning, DunningPolicy::default());
        assert_eq!(config.scheduler.interval, Duration::from_secs(86_400));
    }

    #[test]
    fn dunning_schedule_is_read_from_lists() {
        let config = config_from(&[
            ("DUNNING_STEP_DAYS", "0, 2, 10, 40"),
            ("DUNNING_ESCALATION_DAYS", "10"),
            ("DUNNING_RETRY_DAYS", "2,5"),
            ("DUNNING_SUSPENSION_DAY", "10"),
            ("DUNNING_DEACTIVATION_DAY", "40"),
        ])
        .unwrap();
        let policy = &config.billing.dunning;
        assert_eq!(policy.retry_days, vec![2, 5]);
        assert_eq!(policy.steps.len(), 4);
        assert!(policy.steps[2].escalate_to_csm);
        assert_eq!(policy.steps[2].template, "subscription_suspended");
    }

    #[test]
    fn invalid_values_are_config_errors() {
        assert!(matches!(
            config_from(&[("DUNNING_SUSPENSION_DAY", "30"), ("DUNNING_DEACTIVATION_DAY", "30")]),
            Err(AppError::ConfigError(_))
        ));
        assert!(matches!(
            config_from(&[("PAYMENT_DUE_DAYS", "soon")]),
            Err(AppError::ConfigError(_))
        ));
        assert!(matches!(
            config_from(&[("DUNNING_STEP_DAYS", "7,3")]),
            Err(AppError::ConfigError(_))
        ));
    }

    #[test]
    fn billing_settings_are_range_checked() {
        for pairs in [
            [("DEFAULT_TAX_RATE", "150")],
            [("DEFAULT_TAX_RATE", "-1")],
            [("PAYMENT_DUE_DAYS", "-1")],
            [("TRIAL_DAYS", "0")],
        ] {
            assert!(
                matches!(config_from(&pairs), Err(AppError::ConfigError(_))),
                "{:?} should be rejected",
                pairs
            );
        }

        let config = config_from(&[("DEFAULT_TAX_RATE", "100"), ("PAYMENT_DUE_DAYS", "0")]).unwrap();
        assert_eq!(config.billing.default_tax_rate, Decimal::ONE_HUNDRED);
        assert_eq!(config.billing.payment_due_days, 0);
    }
}
