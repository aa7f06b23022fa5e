//! # Types
//!
//! Aggregates, identifiers and status enums shared by all components.
//!
//! ## Status machines
//!
//! ```text
//! Donation:     Pending ──► Completed ──► Refunded
//!                  └──────► Failed
//!
//! Campaign:     Draft ──► PendingApproval ──► Active ◄──► Paused
//!                               │                │
//!                               ▼                ├──► Completed
//!                           Rejected             └──► Cancelled
//!
//! Evidence:     Pending ──► Approved
//!                  ▲  └───► Rejected
//!                  └───────────┘  (resubmit)
//! ```
//!
//! Every struct here is a plain record; transitions live in the component
//! modules so that each rule has exactly one owner.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::{Money, Score};

// ─────────────────────────────────────────────────────────
// Identifiers
// ─────────────────────────────────────────────────────────

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

uuid_id!(DonationId);
uuid_id!(TransactionId);
uuid_id!(CampaignId);
uuid_id!(EvidenceId);
uuid_id!(OrganizationId);
uuid_id!(UserId);
uuid_id!(ReportId);
uuid_id!(HistoryEntryId);
uuid_id!(
    /// Identifier of one outbox envelope; consumers de-duplicate on it.
    EventId
);

/// Who is asking for a transition. Authentication is done upstream; the
/// engine only checks roles and ownership.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    Admin(UserId),
    User(UserId),
    /// Scheduler and other internal callers.
    System,
}

impl Actor {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Actor::Admin(id) | Actor::User(id) => Some(*id),
            Actor::System => None,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Actor::Admin(_))
    }
}

// ─────────────────────────────────────────────────────────
// Donations & transactions
// ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DonationStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl DonationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Refunded => "REFUNDED",
        }
    }

    /// `true` once the settlement outcome is known.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One pledge of money to one campaign.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Donation {
    pub id: DonationId,
    pub campaign_id: CampaignId,
    /// `None` for anonymous donations.
    pub donor_id: Option<UserId>,
    pub amount: Money,
    pub currency: String,
    pub status: DonationStatus,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub refund_reason: Option<String>,
    pub refunded_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }
}

/// One settlement attempt against the payment gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub donation_id: DonationId,
    pub provider_transaction_id: String,
    pub status: TransactionStatus,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub refunded_amount: Option<Money>,
    pub refunded_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn pending(donation: &Donation, provider_transaction_id: &str, now: DateTime<Utc>) -> Self {
        Transaction {
            id: TransactionId::new(),
            donation_id: donation.id,
            provider_transaction_id: provider_transaction_id.to_string(),
            status: TransactionStatus::Pending,
            amount: donation.amount,
            created_at: now,
            error_message: None,
            refunded_amount: None,
            refunded_at: None,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Campaigns
// ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Draft,
    PendingApproval,
    Active,
    Paused,
    Completed,
    Cancelled,
    Rejected,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::PendingApproval => "PENDING_APPROVAL",
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Rejected)
    }

    /// Approved and visible to donors (possibly paused).
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }
}

/// A fundraising unit owned by one organization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub organization_id: OrganizationId,
    pub title: String,
    pub target_amount: Money,
    pub collected_amount: Money,
    pub donor_count: u32,
    pub status: CampaignStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub evidence_deadline_days: u32,
    pub extension_count: u8,
    pub rejection_reason: Option<String>,
    /// Set once the missed-evidence-deadline penalty has been applied.
    pub deadline_penalized_at: Option<DateTime<Utc>>,
    /// Last reminder offset (days before the deadline) that was sent.
    pub last_reminder_offset: Option<i64>,
}

impl Campaign {
    /// End of the evidence window; `None` until the campaign completes.
    /// A window reaching past the representable range ends at the latest
    /// representable instant.
    pub fn evidence_deadline(&self) -> Option<DateTime<Utc>> {
        self.completed_at.map(|completed| {
            completed
                .checked_add_signed(Duration::days(i64::from(self.evidence_deadline_days)))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        })
    }

    pub fn target_reached(&self) -> bool {
        self.collected_amount >= self.target_amount
    }
}

/// Input for a new campaign.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignDraft {
    pub title: String,
    pub target_amount: Money,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Falls back to the engine default (15 days) when `None`.
    pub evidence_deadline_days: Option<u32>,
}

// ─────────────────────────────────────────────────────────
// Evidence
// ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvidenceStatus {
    Pending,
    Approved,
    Rejected,
}

impl EvidenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }
}

/// Proof of spending submitted by the owning organization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub id: EvidenceId,
    pub campaign_id: CampaignId,
    pub uploaded_by: UserId,
    pub title: String,
    pub description: Option<String>,
    pub vendor_name: Option<String>,
    pub invoice_number: Option<String>,
    pub amount_spent: Money,
    pub status: EvidenceStatus,
    pub uploaded_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<UserId>,
    pub rejection_reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceSubmission {
    pub title: String,
    pub description: Option<String>,
    pub vendor_name: Option<String>,
    pub invoice_number: Option<String>,
    pub amount_spent: Money,
}

/// Partial update of a pending or rejected evidence record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidencePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub vendor_name: Option<String>,
    pub invoice_number: Option<String>,
    pub amount_spent: Option<Money>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewDecision {
    Approve,
    Reject { reason: String },
}

// ─────────────────────────────────────────────────────────
// Transparency score
// ─────────────────────────────────────────────────────────

/// Why a score moved. Every history row carries exactly one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeReason {
    EvidenceApprovedOnTime,
    EvidenceApprovedLate,
    EvidenceApprovedAfterDeadline,
    CampaignCompleted,
    MonthlyConsistencyBonus,
    EvidenceRejected,
    EvidenceDeadlineMissed,
    EvidenceLateUpload,
    CampaignCancelled,
    ReportUpheld,
    InitialScore,
    /// Written by an administrative recalculation; carries explicit scores.
    ManualAdjustment,
}

impl ChangeReason {
    pub const ALL: [ChangeReason; 12] = [
        ChangeReason::EvidenceApprovedOnTime,
        ChangeReason::EvidenceApprovedLate,
        ChangeReason::EvidenceApprovedAfterDeadline,
        ChangeReason::CampaignCompleted,
        ChangeReason::MonthlyConsistencyBonus,
        ChangeReason::EvidenceRejected,
        ChangeReason::EvidenceDeadlineMissed,
        ChangeReason::EvidenceLateUpload,
        ChangeReason::CampaignCancelled,
        ChangeReason::ReportUpheld,
        ChangeReason::InitialScore,
        ChangeReason::ManualAdjustment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EvidenceApprovedOnTime => "EVIDENCE_APPROVED_ON_TIME",
            Self::EvidenceApprovedLate => "EVIDENCE_APPROVED_LATE",
            Self::EvidenceApprovedAfterDeadline => "EVIDENCE_APPROVED_AFTER_DEADLINE",
            Self::CampaignCompleted => "CAMPAIGN_COMPLETED",
            Self::MonthlyConsistencyBonus => "MONTHLY_CONSISTENCY_BONUS",
            Self::EvidenceRejected => "EVIDENCE_REJECTED",
            Self::EvidenceDeadlineMissed => "EVIDENCE_DEADLINE_MISSED",
            Self::EvidenceLateUpload => "EVIDENCE_LATE_UPLOAD",
            Self::CampaignCancelled => "CAMPAIGN_CANCELLED",
            Self::ReportUpheld => "REPORT_UPHELD",
            Self::InitialScore => "INITIAL_SCORE",
            Self::ManualAdjustment => "MANUAL_ADJUSTMENT",
        }
    }
}

/// Mutable per-organization aggregate. `current_score` is a cached projection
/// of the history log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransparencyScore {
    pub organization_id: OrganizationId,
    pub current_score: Score,
    pub total_campaigns: u32,
    pub completed_campaigns: u32,
    pub approved_evidences: u32,
    pub rejected_evidences: u32,
    pub on_time_reports: u32,
    pub late_reports: u32,
    pub last_calculated_at: DateTime<Utc>,
}

/// One append-only row of the score log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreHistoryEntry {
    pub id: HistoryEntryId,
    pub organization_id: OrganizationId,
    pub previous_score: Score,
    pub new_score: Score,
    pub change_reason: ChangeReason,
    pub campaign_id: Option<CampaignId>,
    pub evidence_id: Option<EvidenceId>,
    pub report_id: Option<ReportId>,
    /// Envelope that caused the change, when it came from the outbox.
    #[serde(default)]
    pub source_event_id: Option<EventId>,
    pub created_at: DateTime<Utc>,
}

/// Optional references recorded alongside a score change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreLinks {
    pub campaign_id: Option<CampaignId>,
    pub evidence_id: Option<EvidenceId>,
    pub report_id: Option<ReportId>,
    pub source_event_id: Option<EventId>,
}

impl ScoreLinks {
    pub fn campaign(campaign_id: CampaignId) -> Self {
        ScoreLinks {
            campaign_id: Some(campaign_id),
            ..Default::default()
        }
    }

    pub fn evidence(campaign_id: CampaignId, evidence_id: EvidenceId) -> Self {
        ScoreLinks {
            campaign_id: Some(campaign_id),
            evidence_id: Some(evidence_id),
            ..Default::default()
        }
    }

    pub fn report(report_id: ReportId) -> Self {
        ScoreLinks {
            report_id: Some(report_id),
            ..Default::default()
        }
    }

    pub fn caused_by(self, event_id: EventId) -> Self {
        ScoreLinks {
            source_event_id: Some(event_id),
            ..self
        }
    }
}

/// Display bands; never used for gating.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreLevel {
    VeryHigh,
    High,
    Medium,
    Low,
    VeryLow,
}
