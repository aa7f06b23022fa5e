//! Narrow interfaces to the systems this engine does not own.
//!
//! * [`PaymentGateway`]: settlement and refunds. Transport, 3-D Secure and
//!   card handling stay on the other side of this trait.
//! * [`OrganizationDirectory`]: read-only ownership and verification lookups.
//!
//! Notification delivery is modelled as [`crate::events::EventSubscriber`].

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::ledger::Money;
use crate::types::{Donation, OrganizationId, Transaction, UserId};

// ─────────────────────────────────────────────────────────
// Payment gateway
// ─────────────────────────────────────────────────────────

/// Handle returned when a settlement attempt has been started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSettlement {
    pub provider_transaction_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SettlementResult {
    Succeeded { settled_amount: Money },
    Failed { reason: String },
    /// The gateway gave up waiting; treated as a failure.
    TimedOut,
}

/// Terminal answer from the gateway, delivered by callback or polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementOutcome {
    pub provider_transaction_id: String,
    #[serde(flatten)]
    pub result: SettlementResult,
}

impl SettlementOutcome {
    pub fn succeeded(provider_transaction_id: impl Into<String>, settled_amount: Money) -> Self {
        SettlementOutcome {
            provider_transaction_id: provider_transaction_id.into(),
            result: SettlementResult::Succeeded { settled_amount },
        }
    }

    pub fn failed(provider_transaction_id: impl Into<String>, reason: impl Into<String>) -> Self {
        SettlementOutcome {
            provider_transaction_id: provider_transaction_id.into(),
            result: SettlementResult::Failed {
                reason: reason.into(),
            },
        }
    }

    pub fn timed_out(provider_transaction_id: impl Into<String>) -> Self {
        SettlementOutcome {
            provider_transaction_id: provider_transaction_id.into(),
            result: SettlementResult::TimedOut,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundOutcome {
    pub accepted: bool,
    pub provider_refund_id: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct GatewayError(pub String);

pub trait PaymentGateway: Send + Sync {
    fn initiate_settlement(&self, donation: &Donation) -> Result<PendingSettlement, GatewayError>;

    fn initiate_refund(
        &self,
        transaction: &Transaction,
        amount: Money,
    ) -> Result<RefundOutcome, GatewayError>;
}

// ─────────────────────────────────────────────────────────
// Organization directory
// ─────────────────────────────────────────────────────────

pub trait OrganizationDirectory: Send + Sync {
    fn owner_of(&self, organization_id: OrganizationId) -> Option<UserId>;

    fn is_verified(&self, organization_id: OrganizationId) -> bool;

    fn is_owner(&self, organization_id: OrganizationId, user_id: UserId) -> bool {
        self.owner_of(organization_id) == Some(user_id)
    }
}

#[derive(Debug, Clone, Copy)]
struct OrganizationEntry {
    owner: UserId,
    verified: bool,
}

/// Directory backed by a map; fed by the organization service's callbacks.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    entries: RwLock<HashMap<OrganizationId, OrganizationEntry>>,
}

impl InMemoryDirectory {
    pub fn register(&self, organization_id: OrganizationId, owner: UserId, verified: bool) {
        self.entries
            .write()
            .insert(organization_id, OrganizationEntry { owner, verified });
    }

    /// Mark an organization verified for `owner`. An unknown organization is
    /// registered; a known one must already belong to `owner`, otherwise the
    /// current owner is returned and nothing changes.
    pub fn verify(&self, organization_id: OrganizationId, owner: UserId) -> Result<(), UserId> {
        let mut entries = self.entries.write();
        match entries.get_mut(&organization_id) {
            Some(entry) if entry.owner != owner => Err(entry.owner),
            Some(entry) => {
                entry.verified = true;
                Ok(())
            }
            None => {
                entries.insert(organization_id, OrganizationEntry { owner, verified: true });
                Ok(())
            }
        }
    }

    /// Returns `false` when the organization is unknown.
    pub fn set_verified(&self, organization_id: OrganizationId, verified: bool) -> bool {
        match self.entries.write().get_mut(&organization_id) {
            Some(entry) => {
                entry.verified = verified;
                true
            }
            None => false,
        }
    }
}

impl OrganizationDirectory for InMemoryDirectory {
    fn owner_of(&self, organization_id: OrganizationId) -> Option<UserId> {
        self.entries.read().get(&organization_id).map(|e| e.owner)
    }

    fn is_verified(&self, organization_id: OrganizationId) -> bool {
        self.entries
            .read()
            .get(&organization_id)
            .map(|e| e.verified)
            .unwrap_or(false)
    }
}
