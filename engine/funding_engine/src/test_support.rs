#![allow(dead_code)]

//! Shared fixtures for the in-crate tests: fake collaborators and a harness
//! with one verified organization whose score has been initialised.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;

use crate::collaborators::{
    GatewayError, InMemoryDirectory, PaymentGateway, PendingSettlement, RefundOutcome,
    SettlementOutcome,
};
use crate::events::{Envelope, EventSubscriber, SubscriberError};
use crate::ledger::{Money, Score};
use crate::types::{
    Actor, Campaign, CampaignDraft, CampaignId, CampaignStatus, Donation, DonationId, Evidence,
    EvidenceSubmission, OrganizationId, Transaction, TransactionId, UserId,
};
use crate::storage::{MemoryStore, Repositories};
use crate::{Clock, Engine, EngineConfig, ManualClock};

pub fn money(raw: &str) -> Money {
    Money::parse(raw).unwrap()
}

pub fn score(raw: &str) -> Score {
    Score::parse(raw).unwrap()
}

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

// ─────────────────────────────────────────────────────────
// Fake collaborators
// ─────────────────────────────────────────────────────────

/// Parks the next refund call inside the gateway until released.
pub struct RefundHold {
    pub entered: mpsc::Sender<()>,
    pub release: mpsc::Receiver<()>,
}

#[derive(Default)]
pub struct RecordingGateway {
    issued: AtomicUsize,
    pub settlements: Mutex<Vec<DonationId>>,
    pub refunds: Mutex<Vec<(TransactionId, Money)>>,
    pub decline_refunds: AtomicBool,
    pub unavailable: AtomicBool,
    pub hold_refunds: Mutex<Option<RefundHold>>,
}

impl PaymentGateway for RecordingGateway {
    fn initiate_settlement(&self, donation: &Donation) -> Result<PendingSettlement, GatewayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError("connection refused".into()));
        }
        self.settlements.lock().push(donation.id);
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PendingSettlement {
            provider_transaction_id: format!("pay_{n}"),
        })
    }

    fn initiate_refund(
        &self,
        transaction: &Transaction,
        amount: Money,
    ) -> Result<RefundOutcome, GatewayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError("connection refused".into()));
        }
        self.refunds.lock().push((transaction.id, amount));
        let hold = self.hold_refunds.lock().take();
        if let Some(hold) = hold {
            let _ = hold.entered.send(());
            let _ = hold.release.recv();
        }
        if self.decline_refunds.load(Ordering::SeqCst) {
            return Ok(RefundOutcome {
                accepted: false,
                provider_refund_id: None,
                message: Some("card closed".into()),
            });
        }
        Ok(RefundOutcome {
            accepted: true,
            provider_refund_id: Some(format!("re_{}", transaction.provider_transaction_id)),
            message: None,
        })
    }
}

#[derive(Default)]
pub struct RecordingSubscriber {
    pub envelopes: Mutex<Vec<Envelope>>,
    pub failing: AtomicBool,
    pub label: Option<&'static str>,
}

impl RecordingSubscriber {
    pub fn named(label: &'static str) -> Self {
        RecordingSubscriber {
            label: Some(label),
            ..RecordingSubscriber::default()
        }
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.envelopes.lock().iter().map(|e| e.event.kind()).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }
}

impl EventSubscriber for RecordingSubscriber {
    fn name(&self) -> &'static str {
        self.label.unwrap_or("recording")
    }

    fn handle(&self, envelope: &Envelope) -> Result<(), SubscriberError> {
        self.envelopes.lock().push(envelope.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(SubscriberError {
                subscriber: self.name(),
                message: "smtp relay unavailable".into(),
            });
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────

pub struct Harness {
    pub engine: Arc<Engine>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub directory: Arc<InMemoryDirectory>,
    pub gateway: Arc<RecordingGateway>,
    pub subscriber: Arc<RecordingSubscriber>,
    pub org: OrganizationId,
    pub owner_id: UserId,
    pub admin: Actor,
}

impl Harness {
    pub fn new() -> Self {
        Harness::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let clock = Arc::new(ManualClock::new(start()));
        let directory = Arc::new(InMemoryDirectory::default());
        let gateway = Arc::new(RecordingGateway::default());
        let subscriber = Arc::new(RecordingSubscriber::default());
        let store = MemoryStore::new();
        let engine = Arc::new(Engine::new(
            Repositories::from(store.clone()),
            gateway.clone(),
            directory.clone(),
            clock.clone(),
            config,
        ));
        engine.subscribe(subscriber.clone());

        let org = OrganizationId::new();
        let owner_id = UserId::new();
        directory.register(org, owner_id, true);
        engine.score().initialize_score(org).unwrap();
        engine.dispatch_pending();

        Harness {
            engine,
            store,
            clock,
            directory,
            gateway,
            subscriber,
            org,
            owner_id,
            admin: Actor::Admin(UserId::new()),
        }
    }

    pub fn owner(&self) -> Actor {
        Actor::User(self.owner_id)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn draft(&self, target: &str) -> CampaignDraft {
        CampaignDraft {
            title: "Clean water for Hatay".into(),
            target_amount: money(target),
            start_date: self.now(),
            end_date: self.now() + Duration::days(30),
            evidence_deadline_days: None,
        }
    }

    pub fn active_campaign(&self, target: &str) -> Campaign {
        let campaigns = self.engine.campaigns();
        let campaign = campaigns
            .create_campaign(self.owner(), self.org, self.draft(target))
            .unwrap();
        campaigns.submit(self.owner(), campaign.id).unwrap();
        let campaign = campaigns.approve(self.admin, campaign.id).unwrap();
        self.engine.dispatch_pending();
        campaign
    }

    /// Create, check out and settle a donation, then dispatch.
    pub fn donate(&self, campaign_id: CampaignId, amount: &str) -> Donation {
        let ledger = self.engine.donations();
        let donation = ledger
            .create_donation(campaign_id, Some(UserId::new()), money(amount), "TRY")
            .unwrap();
        let transaction = ledger.checkout(donation.id).unwrap();
        let settled = ledger
            .settle_donation(
                donation.id,
                &SettlementOutcome::succeeded(transaction.provider_transaction_id, money(amount)),
            )
            .unwrap();
        self.engine.dispatch_pending();
        settled
    }

    /// An ACTIVE campaign funded to its target, hence COMPLETED.
    pub fn completed_campaign(&self, target: &str) -> Campaign {
        let campaign = self.active_campaign(target);
        self.donate(campaign.id, target);
        let campaign = self.campaign(campaign.id);
        assert_eq!(campaign.status, CampaignStatus::Completed);
        campaign
    }

    pub fn campaign(&self, campaign_id: CampaignId) -> Campaign {
        self.engine.campaigns().campaign(campaign_id).unwrap()
    }

    pub fn upload(&self, campaign_id: CampaignId, amount: &str) -> Evidence {
        let evidence = self
            .engine
            .evidence()
            .upload_evidence(
                self.owner(),
                campaign_id,
                EvidenceSubmission {
                    title: "Water tank invoice".into(),
                    description: Some("2 x 5t tanks".into()),
                    vendor_name: Some("Akdeniz Su".into()),
                    invoice_number: Some("INV-2024-118".into()),
                    amount_spent: money(amount),
                },
            )
            .unwrap();
        self.engine.dispatch_pending();
        evidence
    }

    pub fn current_score(&self) -> Score {
        self.engine.score().score(self.org).unwrap().current_score
    }
}
