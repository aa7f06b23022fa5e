//! # Donation ledger
//!
//! Moves one donation from creation through settlement or refund.
//!
//! ```text
//! create_donation ──► PENDING ──checkout──► (gateway) ──settle_donation──► COMPLETED ──refund──► REFUNDED
//!                        │                                      └────────► FAILED
//!                        └── expire_stale_pending ─────────────────────────► FAILED
//! ```
//!
//! Every write that touches `collected_amount` or `donor_count` runs under the
//! campaign's lock and is committed with [`DonationRepository::commit_ledger`].
//! Gateway calls are made before the lock is taken; events are published after
//! it is released.
//!
//! [`DonationRepository::commit_ledger`]: crate::storage::DonationRepository::commit_ledger

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::collaborators::{PaymentGateway, SettlementOutcome, SettlementResult};
use crate::errors::{Error, Result};
use crate::events::DomainEvent;
use crate::ledger::Money;
use crate::storage::LedgerWrite;
use crate::types::{
    Actor, Campaign, CampaignId, CampaignStatus, Donation, DonationId, DonationStatus,
    Transaction, TransactionStatus, UserId,
};
use crate::Context;

const EXPIRED_REASON: &str = "settlement window expired";

pub struct DonationLedger {
    ctx: Arc<Context>,
    gateway: Arc<dyn PaymentGateway>,
    /// Donations whose refund is currently at the provider.
    refunds_in_flight: Mutex<HashSet<DonationId>>,
}

/// Holds a donation's refund slot; released on drop.
struct RefundReservation<'a> {
    in_flight: &'a Mutex<HashSet<DonationId>>,
    donation_id: DonationId,
}

impl Drop for RefundReservation<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.donation_id);
    }
}

impl DonationLedger {
    pub(crate) fn new(ctx: Arc<Context>, gateway: Arc<dyn PaymentGateway>) -> Self {
        DonationLedger {
            ctx,
            gateway,
            refunds_in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn reserve_refund(&self, donation_id: DonationId) -> Result<RefundReservation<'_>> {
        if !self.refunds_in_flight.lock().insert(donation_id) {
            return Err(Error::InvalidState(format!(
                "a refund of donation {donation_id} is already in progress"
            )));
        }
        Ok(RefundReservation {
            in_flight: &self.refunds_in_flight,
            donation_id,
        })
    }

    pub fn donation(&self, donation_id: DonationId) -> Result<Donation> {
        self.ctx
            .repos
            .donations
            .find_donation(donation_id)?
            .ok_or_else(|| Error::not_found("Donation", donation_id))
    }

    pub fn donations_for_campaign(&self, campaign_id: CampaignId) -> Result<Vec<Donation>> {
        self.ctx.repos.donations.donations_for_campaign(campaign_id)
    }

    pub fn transactions(&self, donation_id: DonationId) -> Result<Vec<Transaction>> {
        self.ctx.repos.donations.transactions_for_donation(donation_id)
    }

    fn campaign(&self, campaign_id: CampaignId) -> Result<Campaign> {
        self.ctx
            .repos
            .campaigns
            .find_campaign(campaign_id)?
            .ok_or_else(|| Error::not_found("Campaign", campaign_id))
    }

    /// Record a new PENDING donation against an ACTIVE campaign.
    pub fn create_donation(
        &self,
        campaign_id: CampaignId,
        donor_id: Option<UserId>,
        amount: Money,
        currency: &str,
    ) -> Result<Donation> {
        if !amount.is_positive() {
            return Err(Error::InvalidAmount(format!(
                "donation amount must be positive, got {amount}"
            )));
        }
        if amount < self.ctx.config.min_donation {
            return Err(Error::InvalidAmount(format!(
                "donation amount {amount} is below the minimum of {}",
                self.ctx.config.min_donation
            )));
        }
        amount.ensure_accepted("donation amount")?;
        let currency = normalise_currency(currency)?;

        let campaign = self.campaign(campaign_id)?;
        if campaign.status != CampaignStatus::Active {
            return Err(Error::CampaignNotFundable(campaign_id));
        }

        let now = self.ctx.clock.now();
        let donation = Donation {
            id: DonationId::new(),
            campaign_id,
            donor_id,
            amount,
            currency,
            status: DonationStatus::Pending,
            created_at: now,
            settled_at: None,
            failure_reason: None,
            refund_reason: None,
            refunded_at: None,
        };
        self.ctx.repos.donations.save_donation(&donation)?;

        info!(
            "Donation {} of {} {} created for campaign {}",
            donation.id, donation.amount, donation.currency, campaign_id
        );
        self.ctx.outbox.publish(
            DomainEvent::DonationCreated {
                donation_id: donation.id,
                campaign_id,
                donor_id,
                amount,
            },
            now,
        );
        Ok(donation)
    }

    /// Start a settlement attempt with the gateway and record its pending
    /// transaction. Each call is a new attempt with its own transaction.
    pub fn checkout(&self, donation_id: DonationId) -> Result<Transaction> {
        let donation = self.donation(donation_id)?;
        if donation.status != DonationStatus::Pending {
            return Err(Error::InvalidState(format!(
                "donation {donation_id} is {}, only PENDING donations can be checked out",
                donation.status.as_str()
            )));
        }

        let pending = self
            .gateway
            .initiate_settlement(&donation)
            .map_err(|e| Error::Gateway(e.to_string()))?;

        let handle = self.ctx.campaign_locks.handle(donation.campaign_id);
        let _guard = handle.lock();

        let donation = self.donation(donation_id)?;
        if donation.status != DonationStatus::Pending {
            return Err(Error::InvalidState(format!(
                "donation {donation_id} settled while checkout was in flight"
            )));
        }
        let transaction = Transaction::pending(
            &donation,
            &pending.provider_transaction_id,
            self.ctx.clock.now(),
        );
        self.ctx.repos.donations.save_transaction(&transaction)?;

        debug!(
            "Donation {donation_id} awaiting settlement {}",
            transaction.provider_transaction_id
        );
        Ok(transaction)
    }

    /// Apply the gateway's terminal answer. Repeated callbacks for a donation
    /// or transaction that is already settled return the stored donation.
    pub fn settle_donation(
        &self,
        donation_id: DonationId,
        outcome: &SettlementOutcome,
    ) -> Result<Donation> {
        let campaign_id = self.donation(donation_id)?.campaign_id;

        let handle = self.ctx.campaign_locks.handle(campaign_id);
        let guard = handle.lock();

        let mut donation = self.donation(donation_id)?;
        let existing = self
            .ctx
            .repos
            .donations
            .find_transaction_by_provider_id(&outcome.provider_transaction_id)?;

        if let Some(transaction) = &existing {
            if transaction.donation_id != donation_id {
                return Err(Error::Validation(format!(
                    "provider transaction {} belongs to donation {}",
                    outcome.provider_transaction_id, transaction.donation_id
                )));
            }
        }
        if donation.status.is_settled()
            || existing
                .as_ref()
                .is_some_and(|t| t.status != TransactionStatus::Pending)
        {
            debug!(
                "Duplicate settlement {} for donation {donation_id} ignored ({})",
                outcome.provider_transaction_id,
                donation.status.as_str()
            );
            return Ok(donation);
        }

        let now = self.ctx.clock.now();
        let mut transaction = existing.unwrap_or_else(|| {
            Transaction::pending(&donation, &outcome.provider_transaction_id, now)
        });

        let event = match &outcome.result {
            SettlementResult::Succeeded { settled_amount } => {
                if *settled_amount != donation.amount {
                    warn!(
                        "Settlement {} for donation {donation_id} reported {settled_amount}, expected {}",
                        outcome.provider_transaction_id, donation.amount
                    );
                    return Err(Error::SettlementMismatch {
                        donation_id,
                        expected: donation.amount,
                        settled: *settled_amount,
                    });
                }

                let mut campaign = self.campaign(campaign_id)?;
                campaign.collected_amount = campaign
                    .collected_amount
                    .checked_add(donation.amount)
                    .ok_or_else(|| {
                        Error::InvalidAmount(format!(
                            "collected amount of campaign {campaign_id} overflowed"
                        ))
                    })?;
                campaign.donor_count = campaign.donor_count.saturating_add(1);

                donation.status = DonationStatus::Completed;
                donation.settled_at = Some(now);
                transaction.status = TransactionStatus::Success;

                self.ctx.repos.donations.commit_ledger(LedgerWrite {
                    donation: &donation,
                    transactions: std::slice::from_ref(&transaction),
                    campaign: Some(&campaign),
                })?;

                info!(
                    "Donation {donation_id} settled: campaign {campaign_id} collected {} from {} donors",
                    campaign.collected_amount, campaign.donor_count
                );
                DomainEvent::DonationCompleted {
                    donation_id,
                    campaign_id,
                    organization_id: campaign.organization_id,
                    donor_id: donation.donor_id,
                    amount: donation.amount,
                    provider_transaction_id: transaction.provider_transaction_id.clone(),
                }
            }
            SettlementResult::Failed { reason } => {
                self.fail(&mut donation, &mut transaction, reason, now)?
            }
            SettlementResult::TimedOut => {
                self.fail(&mut donation, &mut transaction, "settlement timed out", now)?
            }
        };

        drop(guard);
        self.ctx.outbox.publish(event, now);
        Ok(donation)
    }

    fn fail(
        &self,
        donation: &mut Donation,
        transaction: &mut Transaction,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<DomainEvent> {
        donation.status = DonationStatus::Failed;
        donation.settled_at = Some(now);
        donation.failure_reason = Some(reason.to_string());
        transaction.status = TransactionStatus::Failed;
        transaction.error_message = Some(reason.to_string());

        self.ctx.repos.donations.commit_ledger(LedgerWrite {
            donation: &*donation,
            transactions: std::slice::from_ref(&*transaction),
            campaign: None,
        })?;

        info!("Donation {} failed: {reason}", donation.id);
        Ok(DomainEvent::DonationFailed {
            donation_id: donation.id,
            campaign_id: donation.campaign_id,
            donor_id: donation.donor_id,
            reason: reason.to_string(),
        })
    }

    /// Refund a COMPLETED donation in full.
    ///
    /// Administrators may refund at any time; the donor may refund within the
    /// configured refund window. Only one refund per donation reaches the
    /// provider at a time; a concurrent attempt fails with `InvalidState`.
    pub fn refund_donation(
        &self,
        donation_id: DonationId,
        reason: &str,
        actor: Actor,
    ) -> Result<Donation> {
        let _reservation = self.reserve_refund(donation_id)?;
        let donation = self.donation(donation_id)?;
        if donation.status != DonationStatus::Completed {
            return Err(Error::InvalidState(format!(
                "donation {donation_id} is {}, only COMPLETED donations can be refunded",
                donation.status.as_str()
            )));
        }
        self.authorize_refund(&donation, actor)?;
        if reason.trim().is_empty() {
            return Err(Error::Validation("refund reason is required".into()));
        }

        let settled = self
            .transactions(donation_id)?
            .into_iter()
            .find(|t| t.status == TransactionStatus::Success)
            .ok_or_else(|| {
                Error::InvalidState(format!("donation {donation_id} has no settled transaction"))
            })?;

        let outcome = self
            .gateway
            .initiate_refund(&settled, donation.amount)
            .map_err(|e| Error::Gateway(e.to_string()))?;
        if !outcome.accepted {
            return Err(Error::Gateway(
                outcome
                    .message
                    .unwrap_or_else(|| "refund declined by the payment provider".into()),
            ));
        }

        let handle = self.ctx.campaign_locks.handle(donation.campaign_id);
        let guard = handle.lock();

        let mut donation = self.donation(donation_id)?;
        if donation.status != DonationStatus::Completed {
            warn!(
                "Refund for donation {donation_id} accepted by the provider but the donation is now {}",
                donation.status.as_str()
            );
            return Err(Error::InvalidState(format!(
                "donation {donation_id} is {}, only COMPLETED donations can be refunded",
                donation.status.as_str()
            )));
        }
        let mut transaction = self
            .transactions(donation_id)?
            .into_iter()
            .find(|t| t.id == settled.id)
            .unwrap_or(settled);
        let mut campaign = self.campaign(donation.campaign_id)?;
        let now = self.ctx.clock.now();

        if donation.amount > campaign.collected_amount {
            error!(
                "Refund of {} exceeds collected amount {} of campaign {}; clamping to zero",
                donation.amount, campaign.collected_amount, campaign.id
            );
            debug_assert!(false, "collected amount would go negative");
        }
        campaign.collected_amount = campaign.collected_amount.saturating_sub(donation.amount);
        campaign.donor_count = campaign.donor_count.saturating_sub(1);

        transaction.status = TransactionStatus::Refunded;
        transaction.refunded_amount = Some(donation.amount);
        transaction.refunded_at = Some(now);

        donation.status = DonationStatus::Refunded;
        donation.refund_reason = Some(reason.to_string());
        donation.refunded_at = Some(now);

        self.ctx.repos.donations.commit_ledger(LedgerWrite {
            donation: &donation,
            transactions: std::slice::from_ref(&transaction),
            campaign: Some(&campaign),
        })?;
        drop(guard);

        info!(
            "Donation {donation_id} refunded: campaign {} collected now {}",
            campaign.id, campaign.collected_amount
        );
        self.ctx.outbox.publish(
            DomainEvent::DonationRefunded {
                donation_id,
                campaign_id: donation.campaign_id,
                donor_id: donation.donor_id,
                amount: donation.amount,
                reason: reason.to_string(),
            },
            now,
        );
        Ok(donation)
    }

    fn authorize_refund(&self, donation: &Donation, actor: Actor) -> Result<()> {
        match actor {
            Actor::Admin(_) => Ok(()),
            Actor::User(user) if donation.donor_id == Some(user) => {
                let closes = donation.created_at + self.ctx.config.refund_window;
                if self.ctx.clock.now() <= closes {
                    Ok(())
                } else {
                    Err(Error::Forbidden(format!(
                        "refund window for donation {} closed at {closes}",
                        donation.id
                    )))
                }
            }
            _ => Err(Error::Forbidden(format!(
                "only the donor or an administrator may refund donation {}",
                donation.id
            ))),
        }
    }

    /// Fail PENDING donations older than the configured settlement window.
    /// Returns how many were expired.
    pub fn expire_stale_pending(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.ctx.config.pending_donation_expiry;
        let stale: Vec<Donation> = self
            .ctx
            .repos
            .donations
            .donations_by_status(DonationStatus::Pending)?
            .into_iter()
            .filter(|d| d.created_at < cutoff)
            .collect();

        let mut expired = 0;
        for candidate in stale {
            let handle = self.ctx.campaign_locks.handle(candidate.campaign_id);
            let guard = handle.lock();

            let mut donation = self.donation(candidate.id)?;
            if donation.status != DonationStatus::Pending || donation.created_at >= cutoff {
                continue;
            }
            let mut transactions: Vec<Transaction> = self
                .transactions(donation.id)?
                .into_iter()
                .filter(|t| t.status == TransactionStatus::Pending)
                .collect();
            for transaction in &mut transactions {
                transaction.status = TransactionStatus::Failed;
                transaction.error_message = Some(EXPIRED_REASON.to_string());
            }
            donation.status = DonationStatus::Failed;
            donation.settled_at = Some(now);
            donation.failure_reason = Some(EXPIRED_REASON.to_string());

            self.ctx.repos.donations.commit_ledger(LedgerWrite {
                donation: &donation,
                transactions: &transactions,
                campaign: None,
            })?;
            drop(guard);

            self.ctx.outbox.publish(
                DomainEvent::DonationFailed {
                    donation_id: donation.id,
                    campaign_id: donation.campaign_id,
                    donor_id: donation.donor_id,
                    reason: EXPIRED_REASON.to_string(),
                },
                now,
            );
            expired += 1;
        }

        if expired > 0 {
            info!("Expired {expired} stale pending donations");
        }
        Ok(expired)
    }
}

/// ISO-4217 shaped: three ASCII letters, stored upper-case.
fn normalise_currency(raw: &str) -> Result<String> {
    let code = raw.trim();
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(code.to_ascii_uppercase())
    } else {
        Err(Error::InvalidCurrency(raw.to_string()))
    }
}
