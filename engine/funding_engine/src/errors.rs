//! Engine-wide error type.
//!
//! Every fallible operation returns [`Result`]. The variants fall into the
//! groups callers care about:
//!
//! | Group          | Variants                                                        |
//! |----------------|-----------------------------------------------------------------|
//! | Validation     | `InvalidAmount`, `InvalidCurrency`, `Validation`                |
//! | State conflict | `InvalidState`, `CampaignNotFundable`, `SettlementMismatch`, `ScoreTooLow` |
//! | Ownership      | `Forbidden`                                                     |
//! | Lookup         | `NotFound`                                                      |
//! | External       | `Gateway`, `Storage`                                            |
//!
//! Duplicate callbacks, repeated scheduler runs and evidence resubmission are
//! not errors; those paths return the stored state instead.

use thiserror::Error;

use crate::ledger::{Money, Score};
use crate::types::{CampaignId, DonationId, OrganizationId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid currency code: {0:?}")]
    InvalidCurrency(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Campaign {0} is not accepting donations")]
    CampaignNotFundable(CampaignId),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Settlement for donation {donation_id} reported {settled}, expected {expected}")]
    SettlementMismatch {
        donation_id: DonationId,
        expected: Money,
        settled: Money,
    },

    #[error("Transparency score {score} of organization {organization_id} is below the campaign creation threshold")]
    ScoreTooLow {
        organization_id: OrganizationId,
        score: Score,
    },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    pub(crate) fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable identifier for the error.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidAmount(_) => "invalid_amount",
            Error::InvalidCurrency(_) => "invalid_currency",
            Error::Validation(_) => "validation",
            Error::CampaignNotFundable(_) => "campaign_not_fundable",
            Error::InvalidState(_) => "invalid_state",
            Error::SettlementMismatch { .. } => "settlement_mismatch",
            Error::ScoreTooLow { .. } => "score_too_low",
            Error::Forbidden(_) => "forbidden",
            Error::NotFound { .. } => "not_found",
            Error::Gateway(_) => "gateway",
            Error::Storage(_) => "storage",
        }
    }

    /// `true` for errors caused by the request itself (the 4xx family).
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Error::Gateway(_) | Error::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
