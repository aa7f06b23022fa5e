//! # Events
//!
//! Every observable side effect of the engine is a [`DomainEvent`] wrapped in
//! an [`Envelope`] and queued on the [`Outbox`]. Nothing is delivered while an
//! aggregate lock is held: components publish after their critical section and
//! [`crate::Engine::dispatch_pending`] drains the queue afterwards.
//!
//! | Kind                       | Consumed by (in-process)        |
//! |----------------------------|---------------------------------|
//! | `donation_completed`       | campaign controller             |
//! | `campaign_created`         | score engine (counters only)    |
//! | `campaign_completed`       | score engine (counters only)    |
//! | `campaign_cancelled`       | score engine (live campaigns)   |
//! | `evidence_uploaded`        | score engine (late uploads)     |
//! | `evidence_approved`        | score engine                    |
//! | `evidence_rejected`        | score engine                    |
//! | `evidence_deadline_missed` | score engine                    |
//! | everything                 | registered [`EventSubscriber`]s |
//!
//! Delivery is at-least-once. A delivery that fails for some target is
//! parked with exponential backoff and retried for the failed targets only,
//! up to [`crate::EngineConfig::max_delivery_attempts`]. In-process consumers
//! de-duplicate on [`Envelope::id`]; external subscribers must do the same.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::ledger::{Money, Score};
use crate::types::{
    CampaignId, ChangeReason, DonationId, EventId, EvidenceId, OrganizationId, ReportId, UserId,
};

/// Why a campaign reached COMPLETED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionCause {
    TargetReached,
    /// Expired with at least the completion threshold collected.
    ExpiredAboveThreshold,
    /// Expired after all extensions were used.
    ExtensionsExhausted,
    /// Closed by an administrator.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    DonationCreated {
        donation_id: DonationId,
        campaign_id: CampaignId,
        donor_id: Option<UserId>,
        amount: Money,
    },
    DonationCompleted {
        donation_id: DonationId,
        campaign_id: CampaignId,
        organization_id: OrganizationId,
        donor_id: Option<UserId>,
        amount: Money,
        provider_transaction_id: String,
    },
    DonationFailed {
        donation_id: DonationId,
        campaign_id: CampaignId,
        donor_id: Option<UserId>,
        reason: String,
    },
    DonationRefunded {
        donation_id: DonationId,
        campaign_id: CampaignId,
        donor_id: Option<UserId>,
        amount: Money,
        reason: String,
    },
    CampaignCreated {
        campaign_id: CampaignId,
        organization_id: OrganizationId,
    },
    CampaignSubmitted {
        campaign_id: CampaignId,
        organization_id: OrganizationId,
    },
    CampaignApproved {
        campaign_id: CampaignId,
        organization_id: OrganizationId,
    },
    CampaignRejected {
        campaign_id: CampaignId,
        organization_id: OrganizationId,
        reason: String,
    },
    CampaignCompleted {
        campaign_id: CampaignId,
        organization_id: OrganizationId,
        cause: CompletionCause,
        collected_amount: Money,
        target_amount: Money,
        evidence_deadline: Option<DateTime<Utc>>,
    },
    CampaignExtended {
        campaign_id: CampaignId,
        organization_id: OrganizationId,
        new_end_date: DateTime<Utc>,
        extension_count: u8,
    },
    CampaignCancelled {
        campaign_id: CampaignId,
        organization_id: OrganizationId,
        reason: String,
        /// The campaign had been approved (ACTIVE or PAUSED).
        was_live: bool,
    },
    EvidenceUploaded {
        evidence_id: EvidenceId,
        campaign_id: CampaignId,
        organization_id: OrganizationId,
        amount_spent: Money,
        /// Uploaded after the evidence deadline had passed.
        late: bool,
    },
    EvidenceApproved {
        evidence_id: EvidenceId,
        campaign_id: CampaignId,
        organization_id: OrganizationId,
        amount_spent: Money,
        on_time: bool,
        /// The missed-deadline penalty had already been applied.
        after_penalty: bool,
    },
    EvidenceRejected {
        evidence_id: EvidenceId,
        campaign_id: CampaignId,
        organization_id: OrganizationId,
        reason: String,
    },
    /// The evidence window closed with approved spending below the collected
    /// amount. Raised at most once per campaign.
    EvidenceDeadlineMissed {
        campaign_id: CampaignId,
        organization_id: OrganizationId,
        approved_spent: Money,
        collected_amount: Money,
    },
    EvidenceReminderDue {
        campaign_id: CampaignId,
        organization_id: OrganizationId,
        days_remaining: i64,
        approved_spent: Money,
        collected_amount: Money,
    },
    ScoreChanged {
        organization_id: OrganizationId,
        previous_score: Score,
        new_score: Score,
        reason: ChangeReason,
        report_id: Option<ReportId>,
    },
}

impl DomainEvent {
    /// Short identifier suitable for storage and log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DonationCreated { .. } => "donation_created",
            Self::DonationCompleted { .. } => "donation_completed",
            Self::DonationFailed { .. } => "donation_failed",
            Self::DonationRefunded { .. } => "donation_refunded",
            Self::CampaignCreated { .. } => "campaign_created",
            Self::CampaignSubmitted { .. } => "campaign_submitted",
            Self::CampaignApproved { .. } => "campaign_approved",
            Self::CampaignRejected { .. } => "campaign_rejected",
            Self::CampaignCompleted { .. } => "campaign_completed",
            Self::CampaignExtended { .. } => "campaign_extended",
            Self::CampaignCancelled { .. } => "campaign_cancelled",
            Self::EvidenceUploaded { .. } => "evidence_uploaded",
            Self::EvidenceApproved { .. } => "evidence_approved",
            Self::EvidenceRejected { .. } => "evidence_rejected",
            Self::EvidenceDeadlineMissed { .. } => "evidence_deadline_missed",
            Self::EvidenceReminderDue { .. } => "evidence_reminder_due",
            Self::ScoreChanged { .. } => "score_changed",
        }
    }

    pub fn campaign_id(&self) -> Option<CampaignId> {
        match self {
            Self::DonationCreated { campaign_id, .. }
            | Self::DonationCompleted { campaign_id, .. }
            | Self::DonationFailed { campaign_id, .. }
            | Self::DonationRefunded { campaign_id, .. }
            | Self::CampaignCreated { campaign_id, .. }
            | Self::CampaignSubmitted { campaign_id, .. }
            | Self::CampaignApproved { campaign_id, .. }
            | Self::CampaignRejected { campaign_id, .. }
            | Self::CampaignCompleted { campaign_id, .. }
            | Self::CampaignExtended { campaign_id, .. }
            | Self::CampaignCancelled { campaign_id, .. }
            | Self::EvidenceUploaded { campaign_id, .. }
            | Self::EvidenceApproved { campaign_id, .. }
            | Self::EvidenceRejected { campaign_id, .. }
            | Self::EvidenceDeadlineMissed { campaign_id, .. }
            | Self::EvidenceReminderDue { campaign_id, .. } => Some(*campaign_id),
            Self::ScoreChanged { .. } => None,
        }
    }

    pub fn organization_id(&self) -> Option<OrganizationId> {
        match self {
            Self::DonationCompleted {
                organization_id, ..
            }
            | Self::CampaignCreated {
                organization_id, ..
            }
            | Self::CampaignSubmitted {
                organization_id, ..
            }
            | Self::CampaignApproved {
                organization_id, ..
            }
            | Self::CampaignRejected {
                organization_id, ..
            }
            | Self::CampaignCompleted {
                organization_id, ..
            }
            | Self::CampaignExtended {
                organization_id, ..
            }
            | Self::CampaignCancelled {
                organization_id, ..
            }
            | Self::EvidenceUploaded {
                organization_id, ..
            }
            | Self::EvidenceApproved {
                organization_id, ..
            }
            | Self::EvidenceRejected {
                organization_id, ..
            }
            | Self::EvidenceDeadlineMissed {
                organization_id, ..
            }
            | Self::EvidenceReminderDue {
                organization_id, ..
            }
            | Self::ScoreChanged {
                organization_id, ..
            } => Some(*organization_id),
            Self::DonationCreated { .. }
            | Self::DonationFailed { .. }
            | Self::DonationRefunded { .. } => None,
        }
    }
}

/// A queued event plus delivery metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EventId,
    pub occurred_at: DateTime<Utc>,
    pub event: DomainEvent,
}

/// Targets that failed an earlier attempt and still have to see an envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailedTargets {
    /// The in-process consumers (campaign controller, score engine).
    pub consumers: bool,
    /// Names of the subscribers that failed.
    pub subscribers: Vec<&'static str>,
}

impl FailedTargets {
    pub fn is_empty(&self) -> bool {
        !self.consumers && self.subscribers.is_empty()
    }
}

/// One delivery attempt of an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub envelope: Envelope,
    /// Failed attempts so far.
    pub attempts: u32,
    pub not_before: DateTime<Utc>,
    /// `None` on the first attempt, when every target receives the envelope.
    pub retry: Option<FailedTargets>,
}

impl Delivery {
    pub fn includes_consumers(&self) -> bool {
        self.retry.as_ref().map_or(true, |failed| failed.consumers)
    }

    pub fn includes_subscriber(&self, name: &str) -> bool {
        self.retry
            .as_ref()
            .map_or(true, |failed| failed.subscribers.iter().any(|s| *s == name))
    }
}

/// In-memory outbound queue. Fresh envelopes wait in publish order; failed
/// deliveries wait in a retry queue until their backoff has elapsed.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: Mutex<VecDeque<Envelope>>,
    retries: Mutex<Vec<Delivery>>,
}

impl Outbox {
    pub fn publish(&self, event: DomainEvent, occurred_at: DateTime<Utc>) -> EventId {
        let id = EventId::new();
        self.queue.lock().push_back(Envelope {
            id,
            occurred_at,
            event,
        });
        id
    }

    /// Take every fresh envelope, oldest first.
    pub fn drain(&self) -> Vec<Envelope> {
        self.queue.lock().drain(..).collect()
    }

    /// Retries whose backoff has elapsed at `now`, followed by every fresh
    /// envelope.
    pub fn drain_due(&self, now: DateTime<Utc>) -> Vec<Delivery> {
        let mut due: Vec<Delivery> = {
            let mut retries = self.retries.lock();
            let (ready, waiting): (Vec<Delivery>, Vec<Delivery>) =
                retries.drain(..).partition(|d| d.not_before <= now);
            *retries = waiting;
            ready
        };
        due.extend(self.drain().into_iter().map(|envelope| Delivery {
            not_before: envelope.occurred_at,
            envelope,
            attempts: 0,
            retry: None,
        }));
        due
    }

    /// Park a failed delivery until `delivery.not_before`.
    pub fn requeue(&self, delivery: Delivery) {
        self.retries.lock().push(delivery);
    }

    /// Failed deliveries waiting for another attempt.
    pub fn retry_len(&self) -> usize {
        self.retries.lock().len()
    }

    /// Fresh envelopes plus waiting retries.
    pub fn len(&self) -> usize {
        self.queue.lock().len() + self.retry_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Subscriber {subscriber} failed: {message}")]
pub struct SubscriberError {
    pub subscriber: &'static str,
    pub message: String,
}

/// Receives every dispatched envelope. Used by notification and journaling
/// collaborators. A failure is logged and never undoes the state change that
/// produced the event.
pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle(&self, envelope: &Envelope) -> Result<(), SubscriberError>;
}
