//! # Funding Engine
//!
//! Campaign funding and accountability core: tracks money flowing into a
//! campaign, spending evidence flowing out, and a per-organization
//! transparency score that gates future fundraising.
//!
//! | Component                | Module         | Entry point                          |
//! |--------------------------|----------------|--------------------------------------|
//! | Ledger primitives        | [`ledger`]     | [`Money`], [`Percentage`], [`Score`] |
//! | Donation state machine   | [`donation`]   | [`Engine::donations`]                |
//! | Campaign lifecycle       | [`campaign`]   | [`Engine::campaigns`]                |
//! | Evidence review          | [`evidence`]   | [`Engine::evidence`]                 |
//! | Transparency score       | [`score`]      | [`Engine::score`]                    |
//! | Reconciliation scheduler | [`scheduler`]  | [`ReconciliationScheduler`]          |
//! | Event outbox             | [`events`]     | [`Engine::dispatch_pending`]         |
//!
//! ## Architecture
//!
//! ```text
//!   request handlers ──┐                       ┌──► campaign controller (donation_completed)
//!                      ├──► components ──► Outbox ──► score engine (campaign/evidence events)
//!   scheduler tick  ───┘        │              └──► EventSubscriber (notifications, journal)
//!                               ▼
//!                         repositories
//! ```
//!
//! Components never call each other across aggregate boundaries; they
//! communicate through the outbox. Aggregate writes happen under per-campaign
//! or per-organization locks, external calls happen outside them.
//!
//! The crate is synchronous and performs no I/O of its own. Hosts supply the
//! repositories, the payment gateway, the organization directory and the clock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

pub mod campaign;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod donation;
pub mod errors;
pub mod events;
pub mod evidence;
pub mod ledger;
pub mod scheduler;
pub mod score;
pub mod storage;
pub mod types;

#[cfg(test)]
mod invariants;
#[cfg(test)]
mod test_campaigns;
#[cfg(test)]
mod test_donations;
#[cfg(test)]
mod test_score;
#[cfg(test)]
mod test_support;

pub use campaign::{CampaignController, ExpiryDecision, SweepReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    GatewayError, InMemoryDirectory, OrganizationDirectory, PaymentGateway, PendingSettlement,
    RefundOutcome, SettlementOutcome, SettlementResult,
};
pub use config::EngineConfig;
pub use donation::DonationLedger;
pub use errors::{Error, Result};
pub use events::{
    CompletionCause, Delivery, DomainEvent, Envelope, EventSubscriber, FailedTargets, Outbox,
    SubscriberError,
};
pub use evidence::{EvidenceSummary, EvidenceWorkflow};
pub use ledger::{Money, Percentage, Score};
pub use scheduler::{Job, JobReport, ReconciliationScheduler};
pub use score::{LeaderboardEntry, ProjectionAudit, ScoreEngine};
pub use storage::{KeyedLocks, MemoryStore, Repositories};
pub use types::*;

/// Shared state handed to every component.
pub(crate) struct Context {
    pub(crate) repos: Repositories,
    pub(crate) outbox: Outbox,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: EngineConfig,
    pub(crate) directory: Arc<dyn OrganizationDirectory>,
    pub(crate) campaign_locks: KeyedLocks<CampaignId>,
    pub(crate) organization_locks: KeyedLocks<OrganizationId>,
}

/// Counts from one [`Engine::dispatch_pending`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub delivered: usize,
    pub consumer_failures: usize,
    pub subscriber_failures: usize,
    /// Envelopes parked for another attempt.
    pub requeued: usize,
    /// Envelopes dropped after the last allowed attempt.
    pub dead_lettered: usize,
}

pub struct Engine {
    ctx: Arc<Context>,
    donations: DonationLedger,
    campaigns: CampaignController,
    evidence: EvidenceWorkflow,
    score: ScoreEngine,
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
}

impl Engine {
    pub fn new(
        repos: Repositories,
        gateway: Arc<dyn PaymentGateway>,
        directory: Arc<dyn OrganizationDirectory>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let ctx = Arc::new(Context {
            repos,
            outbox: Outbox::default(),
            clock,
            config,
            directory,
            campaign_locks: KeyedLocks::default(),
            organization_locks: KeyedLocks::default(),
        });
        Engine {
            donations: DonationLedger::new(ctx.clone(), gateway),
            campaigns: CampaignController::new(ctx.clone()),
            evidence: EvidenceWorkflow::new(ctx.clone()),
            score: ScoreEngine::new(ctx.clone()),
            ctx,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Engine over a fresh [`MemoryStore`].
    pub fn in_memory(
        gateway: Arc<dyn PaymentGateway>,
        directory: Arc<dyn OrganizationDirectory>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Engine::new(
            Repositories::from(MemoryStore::new()),
            gateway,
            directory,
            clock,
            config,
        )
    }

    pub fn donations(&self) -> &DonationLedger {
        &self.donations
    }

    pub fn campaigns(&self) -> &CampaignController {
        &self.campaigns
    }

    pub fn evidence(&self) -> &EvidenceWorkflow {
        &self.evidence
    }

    pub fn score(&self) -> &ScoreEngine {
        &self.score
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.ctx.clock.as_ref()
    }

    /// Events published but not yet dispatched, including parked retries.
    pub fn pending_events(&self) -> usize {
        self.ctx.outbox.len()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    /// Moderation trigger: a fraud report against the organization was upheld.
    pub fn report_upheld_for_organization(
        &self,
        organization_id: OrganizationId,
        report_id: ReportId,
    ) -> Result<TransparencyScore> {
        let score = self
            .score
            .report_upheld_for_organization(organization_id, report_id)?;
        self.dispatch_pending();
        Ok(score)
    }

    /// Drain the outbox until nothing is due. Each envelope goes to the
    /// in-process consumers first, then to every subscriber. Failures are
    /// logged and counted; they never undo the change that raised the event.
    /// A failed envelope is parked with exponential backoff and later retried
    /// for the failed targets only.
    pub fn dispatch_pending(&self) -> DispatchReport {
        let mut report = DispatchReport::default();
        loop {
            let now = self.ctx.clock.now();
            let batch = self.ctx.outbox.drain_due(now);
            if batch.is_empty() {
                return report;
            }
            let subscribers = self.subscribers.read().clone();
            for delivery in batch {
                let envelope = &delivery.envelope;
                let mut failed = FailedTargets::default();
                if delivery.includes_consumers() {
                    if let Err(e) = self.route(envelope) {
                        error!(
                            "Consumer failed on {} event {}: {e}",
                            envelope.event.kind(),
                            envelope.id
                        );
                        report.consumer_failures += 1;
                        failed.consumers = true;
                    }
                }
                for subscriber in &subscribers {
                    if !delivery.includes_subscriber(subscriber.name()) {
                        continue;
                    }
                    if let Err(e) = subscriber.handle(envelope) {
                        warn!("{e} (event {})", envelope.id);
                        report.subscriber_failures += 1;
                        failed.subscribers.push(subscriber.name());
                    }
                }
                report.delivered += 1;
                if !failed.is_empty() {
                    self.retry_later(delivery, failed, now, &mut report);
                }
            }
        }
    }

    fn retry_later(
        &self,
        mut delivery: Delivery,
        failed: FailedTargets,
        now: DateTime<Utc>,
        report: &mut DispatchReport,
    ) {
        delivery.attempts += 1;
        let config = &self.ctx.config;
        if delivery.attempts >= config.max_delivery_attempts {
            error!(
                "Giving up on {} event {} after {} attempts, undelivered to {:?}",
                delivery.envelope.event.kind(),
                delivery.envelope.id,
                delivery.attempts,
                failed
            );
            report.dead_lettered += 1;
            return;
        }
        let factor = 1i32 << (delivery.attempts - 1).min(16);
        let backoff = config.delivery_retry_backoff * factor;
        debug!(
            "Retrying {} event {} in {}s",
            delivery.envelope.event.kind(),
            delivery.envelope.id,
            backoff.num_seconds()
        );
        delivery.not_before = now + backoff;
        delivery.retry = Some(failed);
        self.ctx.outbox.requeue(delivery);
        report.requeued += 1;
    }

    fn route(&self, envelope: &Envelope) -> Result<()> {
        if let DomainEvent::DonationCompleted { campaign_id, .. } = &envelope.event {
            self.campaigns.on_donation_completed(*campaign_id)?;
        }
        self.score.apply_event(envelope)?;
        Ok(())
    }
}
