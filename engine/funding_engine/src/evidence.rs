//! # Evidence review
//!
//! Organizations prove how collected funds were spent by uploading evidence
//! against a COMPLETED campaign; administrators approve or reject it.
//!
//! The evidence window runs from `completed_at` for
//! `evidence_deadline_days`. Two predicates over stored timestamps drive all
//! deadline behaviour:
//!
//! * [`evidence_on_time`]: `uploaded_at <= completed_at + days`
//! * [`is_deadline_missed`]: `now > completed_at + days`
//!
//! Evidence mutations share the campaign lock with the donation ledger.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::errors::{Error, Result};
use crate::events::DomainEvent;
use crate::ledger::{Money, Percentage};
use crate::types::{
    Actor, Campaign, CampaignId, CampaignStatus, Evidence, EvidenceId, EvidencePatch,
    EvidenceStatus, EvidenceSubmission, ReviewDecision,
};
use crate::Context;

/// `true` once the evidence window of a completed campaign has closed.
pub fn is_deadline_missed(campaign: &Campaign, now: DateTime<Utc>) -> bool {
    campaign
        .evidence_deadline()
        .is_some_and(|deadline| now > deadline)
}

/// Whether the evidence arrived inside its campaign's window. Campaigns that
/// have not completed have no window yet and count as on time.
pub fn evidence_on_time(evidence: &Evidence, campaign: &Campaign) -> bool {
    campaign
        .evidence_deadline()
        .map_or(true, |deadline| evidence.uploaded_at <= deadline)
}

/// Spending accounted for against one campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceSummary {
    pub campaign_id: CampaignId,
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub approved_spent: Money,
    pub collected_amount: Money,
    /// `approved_spent / collected_amount`.
    pub coverage: Percentage,
    pub deadline: Option<DateTime<Utc>>,
}

pub struct EvidenceWorkflow {
    ctx: Arc<Context>,
}

impl EvidenceWorkflow {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        EvidenceWorkflow { ctx }
    }

    pub fn evidence(&self, evidence_id: EvidenceId) -> Result<Evidence> {
        self.ctx
            .repos
            .evidence
            .find_evidence(evidence_id)?
            .ok_or_else(|| Error::not_found("Evidence", evidence_id))
    }

    pub fn evidence_for_campaign(&self, campaign_id: CampaignId) -> Result<Vec<Evidence>> {
        self.ctx.repos.evidence.evidence_for_campaign(campaign_id)
    }

    fn campaign(&self, campaign_id: CampaignId) -> Result<Campaign> {
        self.ctx
            .repos
            .campaigns
            .find_campaign(campaign_id)?
            .ok_or_else(|| Error::not_found("Campaign", campaign_id))
    }

    fn require_owner(&self, actor: Actor, campaign: &Campaign) -> Result<()> {
        match actor.user_id() {
            Some(user) if self.ctx.directory.is_owner(campaign.organization_id, user) => Ok(()),
            _ => Err(Error::Forbidden(format!(
                "actor does not own the organization behind campaign {}",
                campaign.id
            ))),
        }
    }

    pub fn upload_evidence(
        &self,
        actor: Actor,
        campaign_id: CampaignId,
        submission: EvidenceSubmission,
    ) -> Result<Evidence> {
        let campaign = self.campaign(campaign_id)?;
        self.require_owner(actor, &campaign)?;
        if submission.title.trim().is_empty() {
            return Err(Error::Validation("evidence title is required".into()));
        }
        if !submission.amount_spent.is_positive() {
            return Err(Error::InvalidAmount(format!(
                "amount spent must be positive, got {}",
                submission.amount_spent
            )));
        }
        submission.amount_spent.ensure_accepted("amount spent")?;
        let uploaded_by = actor
            .user_id()
            .ok_or_else(|| Error::Forbidden("evidence needs a named uploader".into()))?;

        let handle = self.ctx.campaign_locks.handle(campaign_id);
        let guard = handle.lock();

        let campaign = self.campaign(campaign_id)?;
        if campaign.status != CampaignStatus::Completed {
            return Err(Error::InvalidState(format!(
                "campaign {campaign_id} is {}, evidence is accepted only once it is COMPLETED",
                campaign.status.as_str()
            )));
        }
        let now = self.ctx.clock.now();
        let evidence = Evidence {
            id: EvidenceId::new(),
            campaign_id,
            uploaded_by,
            title: submission.title.trim().to_string(),
            description: submission.description,
            vendor_name: submission.vendor_name,
            invoice_number: submission.invoice_number,
            amount_spent: submission.amount_spent,
            status: EvidenceStatus::Pending,
            uploaded_at: now,
            reviewed_at: None,
            reviewed_by: None,
            rejection_reason: None,
        };
        self.ctx.repos.evidence.save_evidence(&evidence)?;
        drop(guard);

        let late = is_deadline_missed(&campaign, now);
        info!(
            "Evidence {} of {} uploaded for campaign {campaign_id}{}",
            evidence.id,
            evidence.amount_spent,
            if late { " after the deadline" } else { "" }
        );
        self.ctx.outbox.publish(
            DomainEvent::EvidenceUploaded {
                evidence_id: evidence.id,
                campaign_id,
                organization_id: campaign.organization_id,
                amount_spent: evidence.amount_spent,
                late,
            },
            now,
        );
        Ok(evidence)
    }

    /// Edit a PENDING or REJECTED record. A REJECTED record goes back to
    /// PENDING for another review.
    pub fn update_evidence(
        &self,
        actor: Actor,
        evidence_id: EvidenceId,
        patch: EvidencePatch,
    ) -> Result<Evidence> {
        let campaign_id = self.evidence(evidence_id)?.campaign_id;
        let campaign = self.campaign(campaign_id)?;
        self.require_owner(actor, &campaign)?;
        if patch.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(Error::Validation("evidence title cannot be blank".into()));
        }
        if let Some(amount) = patch.amount_spent {
            if !amount.is_positive() {
                return Err(Error::InvalidAmount("amount spent must be positive".into()));
            }
            amount.ensure_accepted("amount spent")?;
        }

        let handle = self.ctx.campaign_locks.handle(campaign_id);
        let _guard = handle.lock();

        let mut evidence = self.evidence(evidence_id)?;
        match evidence.status {
            EvidenceStatus::Approved => {
                return Err(Error::InvalidState(format!(
                    "evidence {evidence_id} is APPROVED and can no longer change"
                )))
            }
            EvidenceStatus::Rejected => {
                evidence.status = EvidenceStatus::Pending;
                evidence.rejection_reason = None;
                evidence.reviewed_by = None;
                evidence.reviewed_at = None;
                info!("Evidence {evidence_id} resubmitted for review");
            }
            EvidenceStatus::Pending => {}
        }

        let EvidencePatch {
            title,
            description,
            vendor_name,
            invoice_number,
            amount_spent,
        } = patch;
        if let Some(title) = title {
            evidence.title = title.trim().to_string();
        }
        if description.is_some() {
            evidence.description = description;
        }
        if vendor_name.is_some() {
            evidence.vendor_name = vendor_name;
        }
        if invoice_number.is_some() {
            evidence.invoice_number = invoice_number;
        }
        if let Some(amount) = amount_spent {
            evidence.amount_spent = amount;
        }

        self.ctx.repos.evidence.save_evidence(&evidence)?;
        Ok(evidence)
    }

    /// Withdraw a PENDING or REJECTED record.
    pub fn delete_evidence(&self, actor: Actor, evidence_id: EvidenceId) -> Result<()> {
        let campaign_id = self.evidence(evidence_id)?.campaign_id;
        let campaign = self.campaign(campaign_id)?;
        self.require_owner(actor, &campaign)?;

        let handle = self.ctx.campaign_locks.handle(campaign_id);
        let _guard = handle.lock();

        let evidence = self.evidence(evidence_id)?;
        if evidence.status == EvidenceStatus::Approved {
            return Err(Error::InvalidState(format!(
                "evidence {evidence_id} is APPROVED and cannot be deleted"
            )));
        }
        self.ctx.repos.evidence.delete_evidence(evidence_id)?;
        info!("Evidence {evidence_id} withdrawn from campaign {campaign_id}");
        Ok(())
    }

    pub fn review_evidence(
        &self,
        actor: Actor,
        evidence_id: EvidenceId,
        decision: ReviewDecision,
    ) -> Result<Evidence> {
        let reviewer = match actor {
            Actor::Admin(user) => user,
            _ => return Err(Error::Forbidden("administrator role required".into())),
        };
        if let ReviewDecision::Reject { reason } = &decision {
            if reason.trim().is_empty() {
                return Err(Error::Validation("rejection reason is required".into()));
            }
        }
        let campaign_id = self.evidence(evidence_id)?.campaign_id;

        let handle = self.ctx.campaign_locks.handle(campaign_id);
        let guard = handle.lock();

        let mut evidence = self.evidence(evidence_id)?;
        if evidence.status != EvidenceStatus::Pending {
            return Err(Error::InvalidState(format!(
                "evidence {evidence_id} is {}, only PENDING evidence can be reviewed",
                evidence.status.as_str()
            )));
        }
        let campaign = self.campaign(campaign_id)?;
        let now = self.ctx.clock.now();
        evidence.reviewed_at = Some(now);
        evidence.reviewed_by = Some(reviewer);

        let event = match decision {
            ReviewDecision::Approve => {
                evidence.status = EvidenceStatus::Approved;
                DomainEvent::EvidenceApproved {
                    evidence_id,
                    campaign_id,
                    organization_id: campaign.organization_id,
                    amount_spent: evidence.amount_spent,
                    on_time: evidence_on_time(&evidence, &campaign),
                    after_penalty: campaign.deadline_penalized_at.is_some(),
                }
            }
            ReviewDecision::Reject { reason } => {
                let reason = reason.trim().to_string();
                evidence.status = EvidenceStatus::Rejected;
                evidence.rejection_reason = Some(reason.clone());
                DomainEvent::EvidenceRejected {
                    evidence_id,
                    campaign_id,
                    organization_id: campaign.organization_id,
                    reason,
                }
            }
        };
        self.ctx.repos.evidence.save_evidence(&evidence)?;
        drop(guard);

        info!(
            "Evidence {evidence_id} reviewed: {}",
            evidence.status.as_str()
        );
        self.ctx.outbox.publish(event, now);
        Ok(evidence)
    }

    /// Sum of APPROVED spending for a campaign.
    pub fn approved_spent(&self, campaign_id: CampaignId) -> Result<Money> {
        let approved = self
            .ctx
            .repos
            .evidence
            .evidence_for_campaign(campaign_id)?
            .into_iter()
            .filter(|e| e.status == EvidenceStatus::Approved)
            .map(|e| e.amount_spent);
        Money::try_sum(approved)
    }

    pub fn summary(&self, campaign_id: CampaignId) -> Result<EvidenceSummary> {
        let campaign = self.campaign(campaign_id)?;
        let records = self.evidence_for_campaign(campaign_id)?;
        let count = |status: EvidenceStatus| records.iter().filter(|e| e.status == status).count();
        let approved_spent = Money::try_sum(
            records
                .iter()
                .filter(|e| e.status == EvidenceStatus::Approved)
                .map(|e| e.amount_spent),
        )?;

        Ok(EvidenceSummary {
            campaign_id,
            pending: count(EvidenceStatus::Pending),
            approved: count(EvidenceStatus::Approved),
            rejected: count(EvidenceStatus::Rejected),
            approved_spent,
            collected_amount: campaign.collected_amount,
            coverage: Percentage::between(approved_spent, campaign.collected_amount),
            deadline: campaign.evidence_deadline(),
        })
    }

    fn completed_campaigns(&self) -> Result<Vec<Campaign>> {
        self.ctx
            .repos
            .campaigns
            .campaigns_by_status(CampaignStatus::Completed)
    }

    /// [`Self::penalize_missed_deadline`] over every COMPLETED campaign.
    pub fn penalize_missed_deadlines(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut penalized = 0;
        for campaign in self.completed_campaigns()? {
            match self.penalize_missed_deadline(campaign.id, now) {
                Ok(true) => penalized += 1,
                Ok(false) => {}
                Err(e) => error!("Deadline check of campaign {} failed: {e}", campaign.id),
            }
        }
        Ok(penalized)
    }

    /// [`Self::remind_if_due`] over every COMPLETED campaign.
    pub fn send_reminders(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut sent = 0;
        for campaign in self.completed_campaigns()? {
            if self.remind_if_due(campaign.id, now)?.is_some() {
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Raise the missed-deadline event for a COMPLETED campaign whose window
    /// has closed with insufficient approved spending. At most once per
    /// campaign; returns whether it fired.
    pub fn penalize_missed_deadline(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let handle = self.ctx.campaign_locks.handle(campaign_id);
        let guard = handle.lock();

        let mut campaign = self.campaign(campaign_id)?;
        if campaign.status != CampaignStatus::Completed
            || campaign.deadline_penalized_at.is_some()
            || !is_deadline_missed(&campaign, now)
        {
            return Ok(false);
        }
        let approved_spent = self.approved_spent(campaign_id)?;
        if approved_spent >= campaign.collected_amount {
            return Ok(false);
        }

        campaign.deadline_penalized_at = Some(now);
        self.ctx.repos.campaigns.save_campaign(&campaign)?;
        drop(guard);

        info!(
            "Campaign {campaign_id} missed its evidence deadline: {approved_spent} of {} accounted for",
            campaign.collected_amount
        );
        self.ctx.outbox.publish(
            DomainEvent::EvidenceDeadlineMissed {
                campaign_id,
                organization_id: campaign.organization_id,
                approved_spent,
                collected_amount: campaign.collected_amount,
            },
            now,
        );
        Ok(true)
    }

    /// Emit a reminder when the whole days left in the evidence window match
    /// one of the configured offsets and spending is still unaccounted for.
    /// Each offset fires at most once. Returns the offset that fired.
    pub fn remind_if_due(&self, campaign_id: CampaignId, now: DateTime<Utc>) -> Result<Option<i64>> {
        let handle = self.ctx.campaign_locks.handle(campaign_id);
        let guard = handle.lock();

        let mut campaign = self.campaign(campaign_id)?;
        let Some(deadline) = campaign.evidence_deadline() else {
            return Ok(None);
        };
        if campaign.status != CampaignStatus::Completed {
            return Ok(None);
        }
        let days_remaining = (deadline - now).num_days();
        if now > deadline
            || !self.ctx.config.reminder_offsets.contains(&days_remaining)
            || campaign.last_reminder_offset == Some(days_remaining)
        {
            return Ok(None);
        }
        let approved_spent = self.approved_spent(campaign_id)?;
        if approved_spent >= campaign.collected_amount {
            return Ok(None);
        }

        campaign.last_reminder_offset = Some(days_remaining);
        self.ctx.repos.campaigns.save_campaign(&campaign)?;
        drop(guard);

        debug!("Evidence reminder for campaign {campaign_id}: {days_remaining} days left");
        self.ctx.outbox.publish(
            DomainEvent::EvidenceReminderDue {
                campaign_id,
                organization_id: campaign.organization_id,
                days_remaining,
                approved_spent,
                collected_amount: campaign.collected_amount,
            },
            now,
        );
        Ok(Some(days_remaining))
    }
}
