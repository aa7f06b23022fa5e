//! Application configuration loaded from environment variables.

use chrono::Duration;
use funding_engine::{EngineConfig, Money};

use crate::errors::{ReconcilerError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite event journal
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// How often (in seconds) the scheduler checks for due jobs
    pub tick_interval_secs: u64,
    /// Smallest accepted donation; engine default when unset
    pub min_donation: Option<Money>,
    /// Days a donor may ask for a refund; engine default when unset
    pub refund_window_days: Option<i64>,
    /// Hours before a PENDING donation is failed; engine default when unset
    pub pending_donation_expiry_hours: Option<i64>,
    /// Days before the evidence deadline at which reminders go out
    pub evidence_reminder_days: Option<Vec<i64>>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Config::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_var = |key: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| ReconcilerError::Config(format!("Missing env var: {key}")))
        };

        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./funding_events.db".to_string()),
            api_port: env_var("API_PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .map_err(|_| ReconcilerError::Config("Invalid API_PORT".to_string()))?,
            tick_interval_secs: env_var("TICK_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or_else(|| ReconcilerError::Config("Invalid TICK_INTERVAL_SECS".to_string()))?,
            min_donation: env_var("MIN_DONATION_AMOUNT")
                .ok()
                .map(|raw| {
                    Money::parse(&raw)
                        .ok()
                        .filter(Money::is_positive)
                        .ok_or_else(|| {
                            ReconcilerError::Config("Invalid MIN_DONATION_AMOUNT".to_string())
                        })
                })
                .transpose()?,
            refund_window_days: optional_positive(
                env_var("REFUND_WINDOW_DAYS").ok(),
                "REFUND_WINDOW_DAYS",
            )?,
            pending_donation_expiry_hours: optional_positive(
                env_var("PENDING_DONATION_EXPIRY_HOURS").ok(),
                "PENDING_DONATION_EXPIRY_HOURS",
            )?,
            evidence_reminder_days: env_var("EVIDENCE_REMINDER_DAYS")
                .ok()
                .map(|raw| parse_offsets(&raw))
                .transpose()?,
        })
    }

    /// Engine tunables: defaults overridden by whatever the environment set.
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = EngineConfig::default();
        if let Some(min) = self.min_donation {
            engine.min_donation = min;
        }
        if let Some(days) = self.refund_window_days {
            engine.refund_window = Duration::days(days);
        }
        if let Some(hours) = self.pending_donation_expiry_hours {
            engine.pending_donation_expiry = Duration::hours(hours);
        }
        if let Some(offsets) = &self.evidence_reminder_days {
            engine.reminder_offsets = offsets.clone();
        }
        engine
    }
}

fn optional_positive(raw: Option<String>, key: &str) -> Result<Option<i64>> {
    raw.map(|value| {
        value
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| ReconcilerError::Config(format!("Invalid {key}")))
    })
    .transpose()
}

/// `"7,3,1,0"` ⇒ `[7, 3, 1, 0]`.
fn parse_offsets(raw: &str) -> Result<Vec<i64>> {
    raw.split(',')
        .map(|part| {
            part.trim()
                .parse::<i64>()
                .ok()
                .filter(|days| *days >= 0)
                .ok_or_else(|| ReconcilerError::Config("Invalid EVIDENCE_REMINDER_DAYS".to_string()))
        })
        .collect()
}
