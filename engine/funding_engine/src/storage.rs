//! # Storage
//!
//! Repository traits the components depend on, an in-memory implementation,
//! and the keyed locks used for per-aggregate serialization.
//!
//! ## Repositories
//!
//! | Trait                  | Aggregate(s)                  | Atomic write                  |
//! |------------------------|-------------------------------|-------------------------------|
//! | [`CampaignRepository`] | `Campaign`                    | `save_campaign`               |
//! | [`DonationRepository`] | `Donation`, `Transaction`     | `commit_ledger` (+ campaign)  |
//! | [`EvidenceRepository`] | `Evidence`                    | `save_evidence`               |
//! | [`ScoreRepository`]    | `TransparencyScore` + history | `commit_score`                |
//!
//! `commit_ledger` and `commit_score` exist because a settlement touches the
//! donation, its transaction and the campaign totals, and a score change touches
//! the aggregate and its history log. Each must land as one unit; a SQL backend
//! maps them to a single database transaction.
//!
//! ## Locking
//!
//! Repositories do not lock aggregates. Components take a [`KeyedLocks`]
//! guard for the campaign or organization, re-read, mutate, commit, and only
//! then publish events.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::errors::Result;
use crate::types::{
    Campaign, CampaignId, CampaignStatus, Donation, DonationId, DonationStatus, EventId, Evidence,
    EvidenceId, EvidenceStatus, OrganizationId, ScoreHistoryEntry, Transaction, TransparencyScore,
};

// ─────────────────────────────────────────────────────────
// Repository traits
// ─────────────────────────────────────────────────────────

pub trait CampaignRepository: Send + Sync {
    fn find_campaign(&self, id: CampaignId) -> Result<Option<Campaign>>;
    fn save_campaign(&self, campaign: &Campaign) -> Result<()>;
    fn campaigns_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>>;
    fn campaigns_for_organization(&self, organization_id: OrganizationId) -> Result<Vec<Campaign>>;
    fn delete_campaign(&self, id: CampaignId) -> Result<()>;
}

/// Everything one ledger mutation writes.
#[derive(Debug, Clone, Copy)]
pub struct LedgerWrite<'a> {
    pub donation: &'a Donation,
    pub transactions: &'a [Transaction],
    pub campaign: Option<&'a Campaign>,
}

pub trait DonationRepository: Send + Sync {
    fn find_donation(&self, id: DonationId) -> Result<Option<Donation>>;
    fn save_donation(&self, donation: &Donation) -> Result<()>;
    fn donations_by_status(&self, status: DonationStatus) -> Result<Vec<Donation>>;
    fn donations_for_campaign(&self, campaign_id: CampaignId) -> Result<Vec<Donation>>;
    fn find_transaction_by_provider_id(&self, provider_transaction_id: &str)
        -> Result<Option<Transaction>>;
    fn transactions_for_donation(&self, donation_id: DonationId) -> Result<Vec<Transaction>>;
    fn save_transaction(&self, transaction: &Transaction) -> Result<()>;
    /// Persist a donation, its touched transactions and optionally the
    /// campaign in one unit.
    fn commit_ledger(&self, write: LedgerWrite<'_>) -> Result<()>;
}

pub trait EvidenceRepository: Send + Sync {
    fn find_evidence(&self, id: EvidenceId) -> Result<Option<Evidence>>;
    fn save_evidence(&self, evidence: &Evidence) -> Result<()>;
    fn delete_evidence(&self, id: EvidenceId) -> Result<()>;
    fn evidence_for_campaign(&self, campaign_id: CampaignId) -> Result<Vec<Evidence>>;
    fn evidence_by_status(&self, status: EvidenceStatus) -> Result<Vec<Evidence>>;
}

pub trait ScoreRepository: Send + Sync {
    fn find_score(&self, organization_id: OrganizationId) -> Result<Option<TransparencyScore>>;
    fn all_scores(&self) -> Result<Vec<TransparencyScore>>;
    /// Counter-only update; never used for score changes. `applied` marks
    /// the envelope that caused it as consumed in the same unit.
    fn save_score(&self, score: &TransparencyScore, applied: Option<EventId>) -> Result<()>;
    /// Whether the envelope already reached the score, either through a
    /// counter update or a history row.
    fn event_applied(&self, event_id: EventId) -> Result<bool>;
    /// History for one organization, oldest first.
    fn history_for(&self, organization_id: OrganizationId) -> Result<Vec<ScoreHistoryEntry>>;
    /// Persist the aggregate and append its history row in one unit. A row
    /// carrying `source_event_id` marks that envelope as consumed.
    fn commit_score(&self, score: &TransparencyScore, entry: &ScoreHistoryEntry) -> Result<()>;
}

/// Bundle handed to the components.
#[derive(Clone)]
pub struct Repositories {
    pub campaigns: Arc<dyn CampaignRepository>,
    pub donations: Arc<dyn DonationRepository>,
    pub evidence: Arc<dyn EvidenceRepository>,
    pub scores: Arc<dyn ScoreRepository>,
}

impl From<Arc<MemoryStore>> for Repositories {
    fn from(store: Arc<MemoryStore>) -> Self {
        Repositories {
            campaigns: store.clone(),
            donations: store.clone(),
            evidence: store.clone(),
            scores: store,
        }
    }
}

// ─────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Tables {
    campaigns: HashMap<CampaignId, Campaign>,
    donations: HashMap<DonationId, Donation>,
    transactions: Vec<Transaction>,
    evidence: HashMap<EvidenceId, Evidence>,
    scores: HashMap<OrganizationId, TransparencyScore>,
    history: Vec<ScoreHistoryEntry>,
    applied_events: HashSet<EventId>,
}

/// Single-process store. One table lock makes every `commit_*` atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryStore::default())
    }

    /// Full history across organizations, oldest first.
    pub fn history_len(&self) -> usize {
        self.tables.read().history.len()
    }
}

fn upsert_transaction(rows: &mut Vec<Transaction>, transaction: &Transaction) {
    match rows.iter_mut().find(|t| t.id == transaction.id) {
        Some(row) => *row = transaction.clone(),
        None => rows.push(transaction.clone()),
    }
}

impl CampaignRepository for MemoryStore {
    fn find_campaign(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.tables.read().campaigns.get(&id).cloned())
    }

    fn save_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.tables
            .write()
            .campaigns
            .insert(campaign.id, campaign.clone());
        Ok(())
    }

    fn campaigns_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        let mut rows: Vec<Campaign> = self
            .tables
            .read()
            .campaigns
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.created_at);
        Ok(rows)
    }

    fn campaigns_for_organization(&self, organization_id: OrganizationId) -> Result<Vec<Campaign>> {
        let mut rows: Vec<Campaign> = self
            .tables
            .read()
            .campaigns
            .values()
            .filter(|c| c.organization_id == organization_id)
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.created_at);
        Ok(rows)
    }

    fn delete_campaign(&self, id: CampaignId) -> Result<()> {
        self.tables.write().campaigns.remove(&id);
        Ok(())
    }
}

impl DonationRepository for MemoryStore {
    fn find_donation(&self, id: DonationId) -> Result<Option<Donation>> {
        Ok(self.tables.read().donations.get(&id).cloned())
    }

    fn save_donation(&self, donation: &Donation) -> Result<()> {
        self.tables
            .write()
            .donations
            .insert(donation.id, donation.clone());
        Ok(())
    }

    fn donations_by_status(&self, status: DonationStatus) -> Result<Vec<Donation>> {
        let mut rows: Vec<Donation> = self
            .tables
            .read()
            .donations
            .values()
            .filter(|d| d.status == status)
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.created_at);
        Ok(rows)
    }

    fn donations_for_campaign(&self, campaign_id: CampaignId) -> Result<Vec<Donation>> {
        let mut rows: Vec<Donation> = self
            .tables
            .read()
            .donations
            .values()
            .filter(|d| d.campaign_id == campaign_id)
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.created_at);
        Ok(rows)
    }

    fn find_transaction_by_provider_id(
        &self,
        provider_transaction_id: &str,
    ) -> Result<Option<Transaction>> {
        Ok(self
            .tables
            .read()
            .transactions
            .iter()
            .find(|t| t.provider_transaction_id == provider_transaction_id)
            .cloned())
    }

    fn transactions_for_donation(&self, donation_id: DonationId) -> Result<Vec<Transaction>> {
        Ok(self
            .tables
            .read()
            .transactions
            .iter()
            .filter(|t| t.donation_id == donation_id)
            .cloned()
            .collect())
    }

    fn save_transaction(&self, transaction: &Transaction) -> Result<()> {
        upsert_transaction(&mut self.tables.write().transactions, transaction);
        Ok(())
    }

    fn commit_ledger(&self, write: LedgerWrite<'_>) -> Result<()> {
        let mut tables = self.tables.write();
        tables
            .donations
            .insert(write.donation.id, write.donation.clone());
        for transaction in write.transactions {
            upsert_transaction(&mut tables.transactions, transaction);
        }
        if let Some(campaign) = write.campaign {
            tables.campaigns.insert(campaign.id, campaign.clone());
        }
        Ok(())
    }
}

impl EvidenceRepository for MemoryStore {
    fn find_evidence(&self, id: EvidenceId) -> Result<Option<Evidence>> {
        Ok(self.tables.read().evidence.get(&id).cloned())
    }

    fn save_evidence(&self, evidence: &Evidence) -> Result<()> {
        self.tables
            .write()
            .evidence
            .insert(evidence.id, evidence.clone());
        Ok(())
    }

    fn delete_evidence(&self, id: EvidenceId) -> Result<()> {
        self.tables.write().evidence.remove(&id);
        Ok(())
    }

    fn evidence_for_campaign(&self, campaign_id: CampaignId) -> Result<Vec<Evidence>> {
        let mut rows: Vec<Evidence> = self
            .tables
            .read()
            .evidence
            .values()
            .filter(|e| e.campaign_id == campaign_id)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.uploaded_at);
        Ok(rows)
    }

    fn evidence_by_status(&self, status: EvidenceStatus) -> Result<Vec<Evidence>> {
        let mut rows: Vec<Evidence> = self
            .tables
            .read()
            .evidence
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.uploaded_at);
        Ok(rows)
    }
}

impl ScoreRepository for MemoryStore {
    fn find_score(&self, organization_id: OrganizationId) -> Result<Option<TransparencyScore>> {
        Ok(self.tables.read().scores.get(&organization_id).cloned())
    }

    fn all_scores(&self) -> Result<Vec<TransparencyScore>> {
        Ok(self.tables.read().scores.values().cloned().collect())
    }

    fn save_score(&self, score: &TransparencyScore, applied: Option<EventId>) -> Result<()> {
        let mut tables = self.tables.write();
        tables.scores.insert(score.organization_id, score.clone());
        if let Some(event_id) = applied {
            tables.applied_events.insert(event_id);
        }
        Ok(())
    }

    fn event_applied(&self, event_id: EventId) -> Result<bool> {
        Ok(self.tables.read().applied_events.contains(&event_id))
    }

    fn history_for(&self, organization_id: OrganizationId) -> Result<Vec<ScoreHistoryEntry>> {
        Ok(self
            .tables
            .read()
            .history
            .iter()
            .filter(|h| h.organization_id == organization_id)
            .cloned()
            .collect())
    }

    fn commit_score(&self, score: &TransparencyScore, entry: &ScoreHistoryEntry) -> Result<()> {
        let mut tables = self.tables.write();
        tables.scores.insert(score.organization_id, score.clone());
        if let Some(event_id) = entry.source_event_id {
            tables.applied_events.insert(event_id);
        }
        tables.history.push(entry.clone());
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Keyed locks
// ─────────────────────────────────────────────────────────

/// One mutex per key, created on first use.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        KeyedLocks {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Copy> KeyedLocks<K> {
    /// Handle for `key`; lock it with `.lock()` for the critical section.
    pub fn handle(&self, key: K) -> Arc<Mutex<()>> {
        self.locks.lock().entry(key).or_default().clone()
    }
}
