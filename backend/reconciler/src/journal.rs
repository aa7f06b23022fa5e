//! Event journal: an [`EventSubscriber`] that hands every dispatched envelope
//! to a background writer task, which persists it to SQLite.
//!
//! The engine dispatches synchronously, so the subscriber only pushes onto an
//! unbounded channel; all I/O happens on the writer task.

use funding_engine::{DomainEvent, Envelope, EventSubscriber, SubscriberError};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::db;
use crate::errors::{ReconcilerError, Result};

/// A dispatched envelope flattened for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub event_id: String,
    pub kind: String,
    pub campaign_id: Option<String>,
    pub organization_id: Option<String>,
    /// The event itself, as JSON.
    pub payload: String,
    /// RFC 3339.
    pub occurred_at: String,
}

impl JournalEntry {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        Ok(JournalEntry {
            event_id: envelope.id.to_string(),
            kind: envelope.event.kind().to_string(),
            campaign_id: envelope.event.campaign_id().map(|id| id.to_string()),
            organization_id: envelope.event.organization_id().map(|id| id.to_string()),
            payload: serde_json::to_string(&envelope.event)?,
            occurred_at: envelope.occurred_at.to_rfc3339(),
        })
    }
}

/// A journal row as stored in / read from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JournalRecord {
    pub id: i64,
    pub event_id: String,
    pub kind: String,
    pub campaign_id: Option<String>,
    pub organization_id: Option<String>,
    pub payload: String,
    pub occurred_at: String,
    pub recorded_at: String,
}

impl JournalRecord {
    /// Decode the stored payload back into the engine's event type.
    pub fn event(&self) -> Result<DomainEvent> {
        serde_json::from_str(&self.payload).map_err(|e| {
            ReconcilerError::Record(format!("journal row {} is not a domain event: {e}", self.id))
        })
    }
}

pub struct JournalSubscriber {
    tx: UnboundedSender<JournalEntry>,
}

impl JournalSubscriber {
    pub fn new(tx: UnboundedSender<JournalEntry>) -> Self {
        JournalSubscriber { tx }
    }
}

impl EventSubscriber for JournalSubscriber {
    fn name(&self) -> &'static str {
        "journal"
    }

    fn handle(&self, envelope: &Envelope) -> std::result::Result<(), SubscriberError> {
        let entry = JournalEntry::from_envelope(envelope).map_err(|e| SubscriberError {
            subscriber: self.name(),
            message: e.to_string(),
        })?;
        self.tx.send(entry).map_err(|_| SubscriberError {
            subscriber: self.name(),
            message: "journal writer has stopped".to_string(),
        })
    }
}

/// Drain the channel into the database until cancelled. Entries already
/// queued at cancellation are still written.
pub async fn run_writer(
    pool: SqlitePool,
    mut rx: UnboundedReceiver<JournalEntry>,
    cancel: CancellationToken,
) {
    info!("Journal writer started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            entry = rx.recv() => match entry {
                Some(entry) => write(&pool, &entry).await,
                None => break,
            },
        }
    }

    rx.close();
    while let Ok(entry) = rx.try_recv() {
        write(&pool, &entry).await;
    }
    info!("Journal writer stopped");
}

async fn write(pool: &SqlitePool, entry: &JournalEntry) {
    match db::insert_journal_entry(pool, entry).await {
        Ok(0) => debug!("Event {} already journaled", entry.event_id),
        Ok(_) => {}
        Err(e) => error!("Failed to journal {} event {}: {e}", entry.kind, entry.event_id),
    }
}
