//! SQLite-backed repositories for the funding engine.
//!
//! The engine is synchronous, so every repository call drives its query to
//! completion with [`Handle::block_on`]. Engine calls must run on a blocking
//! thread (`spawn_blocking`), never on an async worker.
//!
//! Aggregates are stored as JSON in a `body` column next to the columns the
//! repositories filter and order on. The `commit_*` operations run in one
//! SQLite transaction.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use funding_engine::storage::{
    CampaignRepository, DonationRepository, EvidenceRepository, LedgerWrite, ScoreRepository,
};
use funding_engine::{
    Campaign, CampaignId, CampaignStatus, Donation, DonationId, DonationStatus, EventId, Evidence,
    EvidenceId, EvidenceStatus, OrganizationId, Repositories, Result as EngineResult,
    ScoreHistoryEntry, Transaction, TransparencyScore,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Executor, Sqlite, SqlitePool};
use tokio::runtime::Handle;
use tracing::error;

use crate::errors::Result;

pub struct SqliteStore {
    pool: SqlitePool,
    runtime: Handle,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, runtime: Handle) -> Arc<Self> {
        Arc::new(SqliteStore { pool, runtime })
    }

    /// One store behind all four repository seams.
    pub fn repositories(self: &Arc<Self>) -> Repositories {
        Repositories {
            campaigns: self.clone(),
            donations: self.clone(),
            evidence: self.clone(),
            scores: self.clone(),
        }
    }

    fn run<T>(&self, query: impl Future<Output = Result<T>>) -> EngineResult<T> {
        self.runtime.block_on(query).map_err(|e| {
            error!("Storage error: {e}");
            funding_engine::Error::Storage(e.to_string())
        })
    }
}

/// Fixed-width RFC 3339 so that text ordering is time ordering.
fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T> {
    Ok(serde_json::from_str(body)?)
}

fn decode_all<T: DeserializeOwned>(bodies: Vec<String>) -> Result<Vec<T>> {
    bodies.iter().map(|body| decode(body)).collect()
}

async fn upsert_campaign<'e, E>(executor: E, campaign: &Campaign) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO campaigns (id, organization_id, status, created_at, body)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (id) DO UPDATE SET
            organization_id = excluded.organization_id,
            status          = excluded.status,
            created_at      = excluded.created_at,
            body            = excluded.body
        "#,
    )
    .bind(campaign.id.to_string())
    .bind(campaign.organization_id.to_string())
    .bind(campaign.status.as_str())
    .bind(stamp(campaign.created_at))
    .bind(encode(campaign)?)
    .execute(executor)
    .await?;
    Ok(())
}

async fn upsert_donation<'e, E>(executor: E, donation: &Donation) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO donations (id, campaign_id, status, created_at, body)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (id) DO UPDATE SET
            status = excluded.status,
            body   = excluded.body
        "#,
    )
    .bind(donation.id.to_string())
    .bind(donation.campaign_id.to_string())
    .bind(donation.status.as_str())
    .bind(stamp(donation.created_at))
    .bind(encode(donation)?)
    .execute(executor)
    .await?;
    Ok(())
}

async fn upsert_transaction<'e, E>(executor: E, transaction: &Transaction) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO transactions (id, donation_id, provider_transaction_id, body)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (id) DO UPDATE SET
            provider_transaction_id = excluded.provider_transaction_id,
            body                    = excluded.body
        "#,
    )
    .bind(transaction.id.to_string())
    .bind(transaction.donation_id.to_string())
    .bind(transaction.provider_transaction_id.as_str())
    .bind(encode(transaction)?)
    .execute(executor)
    .await?;
    Ok(())
}

async fn upsert_score<'e, E>(executor: E, score: &TransparencyScore) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO scores (organization_id, body)
        VALUES (?1, ?2)
        ON CONFLICT (organization_id) DO UPDATE SET body = excluded.body
        "#,
    )
    .bind(score.organization_id.to_string())
    .bind(encode(score)?)
    .execute(executor)
    .await?;
    Ok(())
}

async fn mark_applied<'e, E>(executor: E, event_id: EventId) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT OR IGNORE INTO score_applied_events (event_id) VALUES (?1)")
        .bind(event_id.to_string())
        .execute(executor)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Campaigns
// ─────────────────────────────────────────────────────────

impl CampaignRepository for SqliteStore {
    fn find_campaign(&self, id: CampaignId) -> EngineResult<Option<Campaign>> {
        self.run(async {
            let body: Option<String> =
                sqlx::query_scalar("SELECT body FROM campaigns WHERE id = ?1")
                    .bind(id.to_string())
                    .fetch_optional(&self.pool)
                    .await?;
            body.as_deref().map(decode).transpose()
        })
    }

    fn save_campaign(&self, campaign: &Campaign) -> EngineResult<()> {
        self.run(upsert_campaign(&self.pool, campaign))
    }

    fn campaigns_by_status(&self, status: CampaignStatus) -> EngineResult<Vec<Campaign>> {
        self.run(async {
            let bodies: Vec<String> = sqlx::query_scalar(
                "SELECT body FROM campaigns WHERE status = ?1 ORDER BY created_at, seq",
            )
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
            decode_all(bodies)
        })
    }

    fn campaigns_for_organization(
        &self,
        organization_id: OrganizationId,
    ) -> EngineResult<Vec<Campaign>> {
        self.run(async {
            let bodies: Vec<String> = sqlx::query_scalar(
                "SELECT body FROM campaigns WHERE organization_id = ?1 ORDER BY created_at, seq",
            )
            .bind(organization_id.to_string())
            .fetch_all(&self.pool)
            .await?;
            decode_all(bodies)
        })
    }

    fn delete_campaign(&self, id: CampaignId) -> EngineResult<()> {
        self.run(async {
            sqlx::query("DELETE FROM campaigns WHERE id = ?1")
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }
}

// ─────────────────────────────────────────────────────────
// Donations & transactions
// ─────────────────────────────────────────────────────────

impl DonationRepository for SqliteStore {
    fn find_donation(&self, id: DonationId) -> EngineResult<Option<Donation>> {
        self.run(async {
            let body: Option<String> =
                sqlx::query_scalar("SELECT body FROM donations WHERE id = ?1")
                    .bind(id.to_string())
                    .fetch_optional(&self.pool)
                    .await?;
            body.as_deref().map(decode).transpose()
        })
    }

    fn save_donation(&self, donation: &Donation) -> EngineResult<()> {
        self.run(upsert_donation(&self.pool, donation))
    }

    fn donations_by_status(&self, status: DonationStatus) -> EngineResult<Vec<Donation>> {
        self.run(async {
            let bodies: Vec<String> = sqlx::query_scalar(
                "SELECT body FROM donations WHERE status = ?1 ORDER BY created_at, seq",
            )
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
            decode_all(bodies)
        })
    }

    fn donations_for_campaign(&self, campaign_id: CampaignId) -> EngineResult<Vec<Donation>> {
        self.run(async {
            let bodies: Vec<String> = sqlx::query_scalar(
                "SELECT body FROM donations WHERE campaign_id = ?1 ORDER BY created_at, seq",
            )
            .bind(campaign_id.to_string())
            .fetch_all(&self.pool)
            .await?;
            decode_all(bodies)
        })
    }

    fn find_transaction_by_provider_id(
        &self,
        provider_transaction_id: &str,
    ) -> EngineResult<Option<Transaction>> {
        self.run(async {
            let body: Option<String> = sqlx::query_scalar(
                "SELECT body FROM transactions WHERE provider_transaction_id = ?1 ORDER BY seq LIMIT 1",
            )
            .bind(provider_transaction_id)
            .fetch_optional(&self.pool)
            .await?;
            body.as_deref().map(decode).transpose()
        })
    }

    fn transactions_for_donation(&self, donation_id: DonationId) -> EngineResult<Vec<Transaction>> {
        self.run(async {
            let bodies: Vec<String> =
                sqlx::query_scalar("SELECT body FROM transactions WHERE donation_id = ?1 ORDER BY seq")
                    .bind(donation_id.to_string())
                    .fetch_all(&self.pool)
                    .await?;
            decode_all(bodies)
        })
    }

    fn save_transaction(&self, transaction: &Transaction) -> EngineResult<()> {
        self.run(upsert_transaction(&self.pool, transaction))
    }

    fn commit_ledger(&self, write: LedgerWrite<'_>) -> EngineResult<()> {
        self.run(async {
            let mut tx = self.pool.begin().await?;
            upsert_donation(&mut *tx, write.donation).await?;
            for transaction in write.transactions {
                upsert_transaction(&mut *tx, transaction).await?;
            }
            if let Some(campaign) = write.campaign {
                upsert_campaign(&mut *tx, campaign).await?;
            }
            tx.commit().await?;
            Ok(())
        })
    }
}

// ─────────────────────────────────────────────────────────
// Evidence
// ─────────────────────────────────────────────────────────

impl EvidenceRepository for SqliteStore {
    fn find_evidence(&self, id: EvidenceId) -> EngineResult<Option<Evidence>> {
        self.run(async {
            let body: Option<String> =
                sqlx::query_scalar("SELECT body FROM evidence WHERE id = ?1")
                    .bind(id.to_string())
                    .fetch_optional(&self.pool)
                    .await?;
            body.as_deref().map(decode).transpose()
        })
    }

    fn save_evidence(&self, evidence: &Evidence) -> EngineResult<()> {
        self.run(async {
            sqlx::query(
                r#"
                INSERT INTO evidence (id, campaign_id, status, uploaded_at, body)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT (id) DO UPDATE SET
                    status      = excluded.status,
                    uploaded_at = excluded.uploaded_at,
                    body        = excluded.body
                "#,
            )
            .bind(evidence.id.to_string())
            .bind(evidence.campaign_id.to_string())
            .bind(evidence.status.as_str())
            .bind(stamp(evidence.uploaded_at))
            .bind(encode(evidence)?)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn delete_evidence(&self, id: EvidenceId) -> EngineResult<()> {
        self.run(async {
            sqlx::query("DELETE FROM evidence WHERE id = ?1")
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn evidence_for_campaign(&self, campaign_id: CampaignId) -> EngineResult<Vec<Evidence>> {
        self.run(async {
            let bodies: Vec<String> = sqlx::query_scalar(
                "SELECT body FROM evidence WHERE campaign_id = ?1 ORDER BY uploaded_at, seq",
            )
            .bind(campaign_id.to_string())
            .fetch_all(&self.pool)
            .await?;
            decode_all(bodies)
        })
    }

    fn evidence_by_status(&self, status: EvidenceStatus) -> EngineResult<Vec<Evidence>> {
        self.run(async {
            let bodies: Vec<String> = sqlx::query_scalar(
                "SELECT body FROM evidence WHERE status = ?1 ORDER BY uploaded_at, seq",
            )
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
            decode_all(bodies)
        })
    }
}

// ─────────────────────────────────────────────────────────
// Transparency scores
// ─────────────────────────────────────────────────────────

impl ScoreRepository for SqliteStore {
    fn find_score(&self, organization_id: OrganizationId) -> EngineResult<Option<TransparencyScore>> {
        self.run(async {
            let body: Option<String> =
                sqlx::query_scalar("SELECT body FROM scores WHERE organization_id = ?1")
                    .bind(organization_id.to_string())
                    .fetch_optional(&self.pool)
                    .await?;
            body.as_deref().map(decode).transpose()
        })
    }

    fn all_scores(&self) -> EngineResult<Vec<TransparencyScore>> {
        self.run(async {
            let bodies: Vec<String> =
                sqlx::query_scalar("SELECT body FROM scores ORDER BY organization_id")
                    .fetch_all(&self.pool)
                    .await?;
            decode_all(bodies)
        })
    }

    fn save_score(&self, score: &TransparencyScore, applied: Option<EventId>) -> EngineResult<()> {
        self.run(async {
            let mut tx = self.pool.begin().await?;
            upsert_score(&mut *tx, score).await?;
            if let Some(event_id) = applied {
                mark_applied(&mut *tx, event_id).await?;
            }
            tx.commit().await?;
            Ok(())
        })
    }

    fn event_applied(&self, event_id: EventId) -> EngineResult<bool> {
        self.run(async {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM score_applied_events WHERE event_id = ?1")
                    .bind(event_id.to_string())
                    .fetch_one(&self.pool)
                    .await?;
            Ok(count > 0)
        })
    }

    fn history_for(&self, organization_id: OrganizationId) -> EngineResult<Vec<ScoreHistoryEntry>> {
        self.run(async {
            let bodies: Vec<String> = sqlx::query_scalar(
                "SELECT body FROM score_history WHERE organization_id = ?1 ORDER BY seq",
            )
            .bind(organization_id.to_string())
            .fetch_all(&self.pool)
            .await?;
            decode_all(bodies)
        })
    }

    fn commit_score(
        &self,
        score: &TransparencyScore,
        entry: &ScoreHistoryEntry,
    ) -> EngineResult<()> {
        self.run(async {
            let mut tx = self.pool.begin().await?;
            upsert_score(&mut *tx, score).await?;
            sqlx::query(
                r#"
                INSERT INTO score_history (id, organization_id, source_event_id, body)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(entry.id.to_string())
            .bind(entry.organization_id.to_string())
            .bind(entry.source_event_id.map(|id| id.to_string()))
            .bind(encode(entry)?)
            .execute(&mut *tx)
            .await?;
            if let Some(event_id) = entry.source_event_id {
                mark_applied(&mut *tx, event_id).await?;
            }
            tx.commit().await?;
            Ok(())
        })
    }
}
