//! Tunables of the engine. The defaults reproduce the platform's policy.

use chrono::Duration;

use crate::ledger::{Money, Percentage};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Smallest accepted donation.
    pub min_donation: Money,
    /// How long a donor may ask for a refund after donating.
    pub refund_window: Duration,
    /// PENDING donations older than this are failed by the expiry sweep.
    pub pending_donation_expiry: Duration,
    /// Evidence window used when a campaign draft does not specify one.
    pub default_evidence_deadline_days: u32,
    /// Share of the target that completes an expired campaign outright.
    pub expiry_completion_threshold: Percentage,
    pub extension_days: i64,
    pub max_extensions: u8,
    /// Days before the evidence deadline at which a reminder goes out.
    pub reminder_offsets: Vec<i64>,
    /// Look-back window of the consistency bonus.
    pub consistency_period: Duration,
    /// Wait before the first redelivery of a failed event; doubles per attempt.
    pub delivery_retry_backoff: Duration,
    /// Attempts after which an undeliverable event is dropped and logged.
    pub max_delivery_attempts: u32,

    pub campaign_status_cadence: Duration,
    pub evidence_penalty_cadence: Duration,
    pub evidence_reminder_cadence: Duration,
    pub consistency_bonus_cadence: Duration,
    pub pending_expiry_cadence: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            min_donation: Money::from_minor(1_000),
            refund_window: Duration::days(14),
            pending_donation_expiry: Duration::hours(168),
            default_evidence_deadline_days: 15,
            expiry_completion_threshold: Percentage::from_percent(80),
            extension_days: 7,
            max_extensions: 2,
            reminder_offsets: vec![7, 3, 1, 0],
            consistency_period: Duration::days(30),
            delivery_retry_backoff: Duration::seconds(30),
            max_delivery_attempts: 5,
            campaign_status_cadence: Duration::hours(6),
            evidence_penalty_cadence: Duration::days(1),
            evidence_reminder_cadence: Duration::days(1),
            consistency_bonus_cadence: Duration::days(30),
            pending_expiry_cadence: Duration::minutes(15),
        }
    }
}
