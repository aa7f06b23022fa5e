//! # Campaign lifecycle
//!
//! ```text
//! create ──► DRAFT ──submit──► PENDING_APPROVAL ──approve──► ACTIVE ◄──pause/resume──► PAUSED
//!              │                      │                         │                        │
//!        delete_draft              reject                       ├──► COMPLETED           │
//!                                     ▼                         └──► CANCELLED ◄─────────┘
//!                                 REJECTED
//! ```
//!
//! ACTIVE campaigns complete in three ways:
//!
//! | Trigger                          | Condition                                  | Cause                     |
//! |----------------------------------|--------------------------------------------|---------------------------|
//! | `on_donation_completed` / sweep  | `collected >= target`                      | `TargetReached`           |
//! | `reconcile_expired`              | ended, `collected >= 80% target`           | `ExpiredAboveThreshold`   |
//! | `reconcile_expired`              | ended, below 80%, two extensions used      | `ExtensionsExhausted`     |
//! | `complete` (administrator)       | none                                       | `Manual`                  |
//!
//! An ended campaign below 80% with fewer than two extensions gets its end
//! date pushed back seven days instead.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::errors::{Error, Result};
use crate::events::{CompletionCause, DomainEvent};
use crate::ledger::{Money, Score};
use crate::score;
use crate::types::{Actor, Campaign, CampaignDraft, CampaignId, CampaignStatus, OrganizationId};
use crate::Context;

/// Longest evidence window a campaign may ask for.
pub const MAX_EVIDENCE_DEADLINE_DAYS: u32 = 365;

/// What the expiry sweep should do with one campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryDecision {
    /// Not ACTIVE, or the end date has not passed.
    NotDue,
    Complete(CompletionCause),
    Extend { new_end_date: DateTime<Utc> },
}

/// Three-way expiry rule: complete at 80% of target, otherwise extend while
/// extensions remain, otherwise force-complete.
pub fn expiry_decision(
    campaign: &Campaign,
    now: DateTime<Utc>,
    config: &EngineConfig,
) -> ExpiryDecision {
    if campaign.status != CampaignStatus::Active || campaign.end_date >= now {
        return ExpiryDecision::NotDue;
    }
    let threshold = config
        .expiry_completion_threshold
        .of(campaign.target_amount);
    if campaign.collected_amount >= threshold {
        ExpiryDecision::Complete(CompletionCause::ExpiredAboveThreshold)
    } else if campaign.extension_count < config.max_extensions {
        ExpiryDecision::Extend {
            new_end_date: campaign.end_date + chrono::Duration::days(config.extension_days),
        }
    } else {
        ExpiryDecision::Complete(CompletionCause::ExtensionsExhausted)
    }
}

/// Outcome of one sweep over ACTIVE campaigns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub completed: usize,
    pub extended: usize,
}

pub struct CampaignController {
    ctx: Arc<Context>,
}

impl CampaignController {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        CampaignController { ctx }
    }

    pub fn campaign(&self, campaign_id: CampaignId) -> Result<Campaign> {
        self.ctx
            .repos
            .campaigns
            .find_campaign(campaign_id)?
            .ok_or_else(|| Error::not_found("Campaign", campaign_id))
    }

    pub fn campaigns_for_organization(&self, organization_id: OrganizationId) -> Result<Vec<Campaign>> {
        self.ctx
            .repos
            .campaigns
            .campaigns_for_organization(organization_id)
    }

    // ─────────────────────────────────────────────────────────
    // Authorization
    // ─────────────────────────────────────────────────────────

    fn require_owner(&self, actor: Actor, organization_id: OrganizationId) -> Result<()> {
        match actor.user_id() {
            Some(user) if self.ctx.directory.is_owner(organization_id, user) => Ok(()),
            _ => Err(Error::Forbidden(format!(
                "actor does not own organization {organization_id}"
            ))),
        }
    }

    fn require_admin(&self, actor: Actor) -> Result<()> {
        if actor.is_admin() {
            Ok(())
        } else {
            Err(Error::Forbidden("administrator role required".into()))
        }
    }

    fn require_owner_or_admin(&self, actor: Actor, organization_id: OrganizationId) -> Result<()> {
        if actor.is_admin() {
            return Ok(());
        }
        self.require_owner(actor, organization_id)
    }

    // ─────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────

    /// Re-read the campaign under its lock, apply `change`, persist, then
    /// publish whatever event `change` produced.
    fn transition<F>(&self, campaign_id: CampaignId, change: F) -> Result<Campaign>
    where
        F: FnOnce(&mut Campaign, DateTime<Utc>) -> Result<Option<DomainEvent>>,
    {
        let handle = self.ctx.campaign_locks.handle(campaign_id);
        let guard = handle.lock();

        let mut campaign = self.campaign(campaign_id)?;
        let before = campaign.clone();
        let now = self.ctx.clock.now();
        let event = change(&mut campaign, now)?;
        if campaign != before {
            self.ctx.repos.campaigns.save_campaign(&campaign)?;
        }
        drop(guard);

        if let Some(event) = event {
            info!(
                "Campaign {campaign_id} {}: now {}",
                event.kind(),
                campaign.status.as_str()
            );
            self.ctx.outbox.publish(event, now);
        }
        Ok(campaign)
    }

    pub fn create_campaign(
        &self,
        actor: Actor,
        organization_id: OrganizationId,
        draft: CampaignDraft,
    ) -> Result<Campaign> {
        self.require_owner(actor, organization_id)?;
        if !self.ctx.directory.is_verified(organization_id) {
            return Err(Error::Forbidden(format!(
                "organization {organization_id} is not verified"
            )));
        }
        let current = self.ctx.repos.scores.find_score(organization_id)?;
        if !score::can_create(current.as_ref()) {
            return Err(Error::ScoreTooLow {
                organization_id,
                score: current.map(|s| s.current_score).unwrap_or_else(Score::min),
            });
        }

        if draft.title.trim().is_empty() {
            return Err(Error::Validation("campaign title is required".into()));
        }
        if !draft.target_amount.is_positive() {
            return Err(Error::InvalidAmount(format!(
                "target amount must be positive, got {}",
                draft.target_amount
            )));
        }
        draft.target_amount.ensure_accepted("target amount")?;
        if draft.start_date >= draft.end_date {
            return Err(Error::Validation(
                "campaign start date must be before its end date".into(),
            ));
        }
        if let Some(days) = draft.evidence_deadline_days {
            if !(1..=MAX_EVIDENCE_DEADLINE_DAYS).contains(&days) {
                return Err(Error::Validation(format!(
                    "evidence deadline must be between 1 and {MAX_EVIDENCE_DEADLINE_DAYS} days, got {days}"
                )));
            }
        }

        let now = self.ctx.clock.now();
        let campaign = Campaign {
            id: CampaignId::new(),
            organization_id,
            title: draft.title.trim().to_string(),
            target_amount: draft.target_amount,
            collected_amount: Money::zero(),
            donor_count: 0,
            status: CampaignStatus::Draft,
            start_date: draft.start_date,
            end_date: draft.end_date,
            created_at: now,
            completed_at: None,
            evidence_deadline_days: draft
                .evidence_deadline_days
                .unwrap_or(self.ctx.config.default_evidence_deadline_days),
            extension_count: 0,
            rejection_reason: None,
            deadline_penalized_at: None,
            last_reminder_offset: None,
        };
        self.ctx.repos.campaigns.save_campaign(&campaign)?;

        info!(
            "Campaign {} created by organization {organization_id} with target {}",
            campaign.id, campaign.target_amount
        );
        self.ctx.outbox.publish(
            DomainEvent::CampaignCreated {
                campaign_id: campaign.id,
                organization_id,
            },
            now,
        );
        Ok(campaign)
    }

    pub fn submit(&self, actor: Actor, campaign_id: CampaignId) -> Result<Campaign> {
        let organization_id = self.campaign(campaign_id)?.organization_id;
        self.require_owner(actor, organization_id)?;
        self.transition(campaign_id, |campaign, _| {
            expect_status(campaign, &[CampaignStatus::Draft], "submitted")?;
            campaign.status = CampaignStatus::PendingApproval;
            Ok(Some(DomainEvent::CampaignSubmitted {
                campaign_id,
                organization_id,
            }))
        })
    }

    pub fn approve(&self, actor: Actor, campaign_id: CampaignId) -> Result<Campaign> {
        self.require_admin(actor)?;
        self.transition(campaign_id, |campaign, _| {
            expect_status(campaign, &[CampaignStatus::PendingApproval], "approved")?;
            campaign.status = CampaignStatus::Active;
            campaign.rejection_reason = None;
            Ok(Some(DomainEvent::CampaignApproved {
                campaign_id,
                organization_id: campaign.organization_id,
            }))
        })
    }

    pub fn reject(&self, actor: Actor, campaign_id: CampaignId, reason: &str) -> Result<Campaign> {
        self.require_admin(actor)?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(Error::Validation("rejection reason is required".into()));
        }
        self.transition(campaign_id, |campaign, _| {
            expect_status(campaign, &[CampaignStatus::PendingApproval], "rejected")?;
            campaign.status = CampaignStatus::Rejected;
            campaign.rejection_reason = Some(reason.to_string());
            Ok(Some(DomainEvent::CampaignRejected {
                campaign_id,
                organization_id: campaign.organization_id,
                reason: reason.to_string(),
            }))
        })
    }

    pub fn pause(&self, actor: Actor, campaign_id: CampaignId) -> Result<Campaign> {
        let organization_id = self.campaign(campaign_id)?.organization_id;
        self.require_owner_or_admin(actor, organization_id)?;
        self.transition(campaign_id, |campaign, _| {
            expect_status(campaign, &[CampaignStatus::Active], "paused")?;
            campaign.status = CampaignStatus::Paused;
            Ok(None)
        })
    }

    pub fn resume(&self, actor: Actor, campaign_id: CampaignId) -> Result<Campaign> {
        let organization_id = self.campaign(campaign_id)?.organization_id;
        self.require_owner_or_admin(actor, organization_id)?;
        self.transition(campaign_id, |campaign, _| {
            expect_status(campaign, &[CampaignStatus::Paused], "resumed")?;
            campaign.status = CampaignStatus::Active;
            Ok(None)
        })
    }

    pub fn cancel(&self, actor: Actor, campaign_id: CampaignId, reason: &str) -> Result<Campaign> {
        let organization_id = self.campaign(campaign_id)?.organization_id;
        self.require_owner_or_admin(actor, organization_id)?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(Error::Validation("cancellation reason is required".into()));
        }
        self.transition(campaign_id, |campaign, _| {
            expect_status(
                campaign,
                &[
                    CampaignStatus::Draft,
                    CampaignStatus::PendingApproval,
                    CampaignStatus::Active,
                    CampaignStatus::Paused,
                ],
                "cancelled",
            )?;
            let was_live = campaign.status.is_live();
            campaign.status = CampaignStatus::Cancelled;
            Ok(Some(DomainEvent::CampaignCancelled {
                campaign_id,
                organization_id,
                reason: reason.to_string(),
                was_live,
            }))
        })
    }

    /// Administrative close of an ACTIVE campaign.
    pub fn complete(&self, actor: Actor, campaign_id: CampaignId) -> Result<Campaign> {
        self.require_admin(actor)?;
        self.transition(campaign_id, |campaign, now| {
            expect_status(campaign, &[CampaignStatus::Active], "completed")?;
            Ok(Some(mark_completed(campaign, CompletionCause::Manual, now)))
        })
    }

    /// Remove a DRAFT that never received donations.
    pub fn delete_draft(&self, actor: Actor, campaign_id: CampaignId) -> Result<()> {
        let campaign = self.campaign(campaign_id)?;
        self.require_owner(actor, campaign.organization_id)?;

        let handle = self.ctx.campaign_locks.handle(campaign_id);
        let _guard = handle.lock();

        let campaign = self.campaign(campaign_id)?;
        expect_status(&campaign, &[CampaignStatus::Draft], "deleted")?;
        if !self
            .ctx
            .repos
            .donations
            .donations_for_campaign(campaign_id)?
            .is_empty()
        {
            return Err(Error::InvalidState(format!(
                "campaign {campaign_id} has donations and cannot be deleted"
            )));
        }
        self.ctx.repos.campaigns.delete_campaign(campaign_id)?;
        info!("Draft campaign {campaign_id} deleted");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────
    // Automatic completion
    // ─────────────────────────────────────────────────────────

    /// Complete the campaign if it is ACTIVE and its target is reached.
    /// Returns the completed campaign, or `None` when nothing changed.
    pub fn on_donation_completed(&self, campaign_id: CampaignId) -> Result<Option<Campaign>> {
        let mut completed = false;
        let campaign = self.transition(campaign_id, |campaign, now| {
            if campaign.status != CampaignStatus::Active || !campaign.target_reached() {
                return Ok(None);
            }
            completed = true;
            Ok(Some(mark_completed(campaign, CompletionCause::TargetReached, now)))
        })?;
        Ok(completed.then_some(campaign))
    }

    /// Sweep of the target-reached rule over every ACTIVE campaign.
    pub fn reconcile_target_reached(&self, _now: DateTime<Utc>) -> Result<usize> {
        let mut completed = 0;
        for candidate in self
            .ctx
            .repos
            .campaigns
            .campaigns_by_status(CampaignStatus::Active)?
        {
            if candidate.target_reached() && self.on_donation_completed(candidate.id)?.is_some() {
                completed += 1;
            }
        }
        Ok(completed)
    }

    /// Apply [`expiry_decision`] to every ACTIVE campaign whose end date has
    /// passed.
    pub fn reconcile_expired(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let config = &self.ctx.config;
        for candidate in self
            .ctx
            .repos
            .campaigns
            .campaigns_by_status(CampaignStatus::Active)?
        {
            if expiry_decision(&candidate, now, config) == ExpiryDecision::NotDue {
                continue;
            }

            let mut decided = ExpiryDecision::NotDue;
            self.transition(candidate.id, |campaign, _| {
                decided = expiry_decision(campaign, now, config);
                Ok(match decided {
                    ExpiryDecision::NotDue => None,
                    ExpiryDecision::Complete(cause) => Some(mark_completed(campaign, cause, now)),
                    ExpiryDecision::Extend { new_end_date } => {
                        campaign.end_date = new_end_date;
                        campaign.extension_count += 1;
                        Some(DomainEvent::CampaignExtended {
                            campaign_id: campaign.id,
                            organization_id: campaign.organization_id,
                            new_end_date,
                            extension_count: campaign.extension_count,
                        })
                    }
                })
            })?;

            match decided {
                ExpiryDecision::NotDue => debug!(
                    "Campaign {} changed before expiry handling; skipped",
                    candidate.id
                ),
                ExpiryDecision::Complete(_) => report.completed += 1,
                ExpiryDecision::Extend { .. } => report.extended += 1,
            }
        }
        Ok(report)
    }
}

fn expect_status(campaign: &Campaign, allowed: &[CampaignStatus], action: &str) -> Result<()> {
    if allowed.contains(&campaign.status) {
        Ok(())
    } else {
        Err(Error::InvalidState(format!(
            "campaign {} is {} and cannot be {action}",
            campaign.id,
            campaign.status.as_str()
        )))
    }
}

/// Close the campaign and open its evidence window.
fn mark_completed(
    campaign: &mut Campaign,
    cause: CompletionCause,
    now: DateTime<Utc>,
) -> DomainEvent {
    campaign.status = CampaignStatus::Completed;
    campaign.completed_at = Some(now);
    DomainEvent::CampaignCompleted {
        campaign_id: campaign.id,
        organization_id: campaign.organization_id,
        cause,
        collected_amount: campaign.collected_amount,
        target_amount: campaign.target_amount,
        evidence_deadline: campaign.evidence_deadline(),
    }
}
