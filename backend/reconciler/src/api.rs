//! Axum REST API handlers.
//!
//! Read endpoints serve the event journal, the aggregates and the
//! transparency scores. Command endpoints drive the engine's operations; the
//! acting user arrives in the body, authenticated upstream. Callback
//! endpoints receive answers from the collaborators the engine does not own:
//! the payment provider and the organization/moderation services.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use funding_engine::{
    Actor, CampaignDraft, CampaignId, Donation, DonationId, Engine, EvidenceId,
    EvidenceSubmission, InMemoryDirectory, Money, OrganizationDirectory, OrganizationId, ReportId,
    ReviewDecision, SettlementOutcome, Transaction, UserId,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::db;
use crate::journal::JournalRecord;

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub engine: Arc<Engine>,
    pub directory: Arc<InMemoryDirectory>,
}

const DEFAULT_LEADERBOARD_LIMIT: usize = 10;
const MAX_LEADERBOARD_LIMIT: usize = 100;

// ─────────────────────────────────────────────────────────
// Request & response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventsResponse {
    pub count: usize,
    pub events: Vec<JournalRecord>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub pending_events: usize,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    pub limit: Option<usize>,
}

/// Body of `POST /payments/callback`.
#[derive(Debug, Deserialize)]
pub struct PaymentCallback {
    pub donation_id: DonationId,
    pub outcome: SettlementOutcome,
}

/// Body of `POST /organizations/:id/verified`.
#[derive(Debug, Deserialize)]
pub struct VerificationCallback {
    pub owner_id: UserId,
}

/// Body of `POST /organizations/:id/campaigns`.
#[derive(Debug, Deserialize)]
pub struct CreateCampaignRequest {
    pub actor: Actor,
    pub draft: CampaignDraft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignAction {
    Submit,
    Approve,
    Reject,
    Pause,
    Resume,
    Cancel,
    Complete,
}

/// Body of `POST /campaigns/:id/transition`. `reason` is required by
/// `reject` and `cancel`.
#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub actor: Actor,
    pub action: CampaignAction,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Body of `POST /campaigns/:id/donations`.
#[derive(Debug, Deserialize)]
pub struct DonateRequest {
    #[serde(default)]
    pub donor_id: Option<UserId>,
    pub amount: Money,
    pub currency: String,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub donation: Donation,
    pub transaction: Transaction,
}

/// Body of `POST /donations/:id/refund`.
#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub actor: Actor,
    pub reason: String,
}

/// Body of `POST /campaigns/:id/evidence`.
#[derive(Debug, Deserialize)]
pub struct UploadEvidenceRequest {
    pub actor: Actor,
    pub submission: EvidenceSubmission,
}

/// Body of `POST /evidence/:id/review`.
#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub actor: Actor,
    pub decision: ReviewDecision,
}

// ─────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────

/// Failure of a handler, rendered as [`ErrorResponse`].
#[derive(Debug)]
pub enum ApiError {
    Engine(funding_engine::Error),
    Journal(crate::errors::ReconcilerError),
    Internal(String),
}

impl From<funding_engine::Error> for ApiError {
    fn from(e: funding_engine::Error) -> Self {
        ApiError::Engine(e)
    }
}

impl From<crate::errors::ReconcilerError> for ApiError {
    fn from(e: crate::errors::ReconcilerError) -> Self {
        ApiError::Journal(e)
    }
}

/// HTTP status for an engine error kind.
pub fn status_for(e: &funding_engine::Error) -> StatusCode {
    match e.kind() {
        "not_found" => StatusCode::NOT_FOUND,
        "forbidden" => StatusCode::FORBIDDEN,
        "validation" | "invalid_amount" | "invalid_currency" => StatusCode::BAD_REQUEST,
        "invalid_state" | "campaign_not_fundable" | "settlement_mismatch" | "score_too_low" => {
            StatusCode::CONFLICT
        }
        "gateway" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Engine(e) => (
                status_for(&e),
                ErrorResponse {
                    error: e.to_string(),
                    kind: e.kind(),
                },
            ),
            ApiError::Journal(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse {
                    error: e.to_string(),
                    kind: "journal",
                },
            ),
            ApiError::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse {
                    error: message,
                    kind: "internal",
                },
            ),
        };
        if status.is_server_error() {
            error!("{} ({})", body.error, body.kind);
        }
        (status, Json(serde_json::json!(body))).into_response()
    }
}

/// Engine calls take blocking locks; keep them off the async workers.
async fn with_engine<T, F>(state: &ApiState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Engine) -> funding_engine::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let engine = state.engine.clone();
    tokio::task::spawn_blocking(move || f(&engine))
        .await
        .map_err(|e| ApiError::Internal(format!("engine task failed: {e}")))?
        .map_err(ApiError::from)
}

fn ok<T: Serialize>(body: T) -> Response {
    (StatusCode::OK, Json(serde_json::json!(body))).into_response()
}

// ─────────────────────────────────────────────────────────
// Read handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        pending_events: state.engine.pending_events(),
    })
}

/// `GET /events`
///
/// Returns the whole event journal, oldest first.
pub async fn get_all_events(State(state): State<Arc<ApiState>>) -> Result<Response, ApiError> {
    let events = db::get_journal(&state.pool).await?;
    Ok(ok(EventsResponse {
        count: events.len(),
        events,
    }))
}

/// `GET /campaigns/:id/events`
pub async fn get_campaign_events(
    State(state): State<Arc<ApiState>>,
    Path(campaign_id): Path<CampaignId>,
) -> Result<Response, ApiError> {
    let events = db::get_journal_for_campaign(&state.pool, &campaign_id.to_string()).await?;
    Ok(ok(EventsResponse {
        count: events.len(),
        events,
    }))
}

/// `GET /organizations/:id/events`
pub async fn get_organization_events(
    State(state): State<Arc<ApiState>>,
    Path(organization_id): Path<OrganizationId>,
) -> Result<Response, ApiError> {
    let events =
        db::get_journal_for_organization(&state.pool, &organization_id.to_string()).await?;
    Ok(ok(EventsResponse {
        count: events.len(),
        events,
    }))
}

/// `GET /scores/:org`
pub async fn get_score(
    State(state): State<Arc<ApiState>>,
    Path(organization_id): Path<OrganizationId>,
) -> Result<Response, ApiError> {
    let score = with_engine(&state, move |engine| engine.score().score(organization_id)).await?;
    Ok(ok(score))
}

/// `GET /scores/:org/history`
pub async fn get_score_history(
    State(state): State<Arc<ApiState>>,
    Path(organization_id): Path<OrganizationId>,
) -> Result<Response, ApiError> {
    let history = with_engine(&state, move |engine| {
        engine.score().score(organization_id)?;
        engine.score().history(organization_id)
    })
    .await?;
    Ok(ok(history))
}

/// `GET /scores/:org/audit`
///
/// Cached score next to a replay of the history log.
pub async fn get_score_audit(
    State(state): State<Arc<ApiState>>,
    Path(organization_id): Path<OrganizationId>,
) -> Result<Response, ApiError> {
    let audit = with_engine(&state, move |engine| engine.score().audit(organization_id)).await?;
    Ok(ok(audit))
}

/// `GET /leaderboard?limit=N`
pub async fn get_leaderboard(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Response, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LEADERBOARD_LIMIT)
        .min(MAX_LEADERBOARD_LIMIT);
    let entries = with_engine(&state, move |engine| engine.score().leaderboard(limit)).await?;
    Ok(ok(entries))
}

// ─────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────

/// `POST /organizations/:id/campaigns`
pub async fn create_campaign(
    State(state): State<Arc<ApiState>>,
    Path(organization_id): Path<OrganizationId>,
    Json(request): Json<CreateCampaignRequest>,
) -> Result<Response, ApiError> {
    let campaign = with_engine(&state, move |engine| {
        let campaign =
            engine
                .campaigns()
                .create_campaign(request.actor, organization_id, request.draft)?;
        engine.dispatch_pending();
        Ok(campaign)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!(campaign))).into_response())
}

/// `GET /campaigns/:id`
pub async fn get_campaign(
    State(state): State<Arc<ApiState>>,
    Path(campaign_id): Path<CampaignId>,
) -> Result<Response, ApiError> {
    let campaign =
        with_engine(&state, move |engine| engine.campaigns().campaign(campaign_id)).await?;
    Ok(ok(campaign))
}

/// `POST /campaigns/:id/transition`
pub async fn transition_campaign(
    State(state): State<Arc<ApiState>>,
    Path(campaign_id): Path<CampaignId>,
    Json(request): Json<TransitionRequest>,
) -> Result<Response, ApiError> {
    let campaign = with_engine(&state, move |engine| {
        let campaigns = engine.campaigns();
        let actor = request.actor;
        let reason = request.reason.as_deref().unwrap_or_default();
        let campaign = match request.action {
            CampaignAction::Submit => campaigns.submit(actor, campaign_id),
            CampaignAction::Approve => campaigns.approve(actor, campaign_id),
            CampaignAction::Reject => campaigns.reject(actor, campaign_id, reason),
            CampaignAction::Pause => campaigns.pause(actor, campaign_id),
            CampaignAction::Resume => campaigns.resume(actor, campaign_id),
            CampaignAction::Cancel => campaigns.cancel(actor, campaign_id, reason),
            CampaignAction::Complete => campaigns.complete(actor, campaign_id),
        }?;
        engine.dispatch_pending();
        Ok(campaign)
    })
    .await?;
    Ok(ok(campaign))
}

/// `POST /campaigns/:id/donations`
///
/// Record a PENDING donation and open its settlement with the provider.
pub async fn donate(
    State(state): State<Arc<ApiState>>,
    Path(campaign_id): Path<CampaignId>,
    Json(request): Json<DonateRequest>,
) -> Result<Response, ApiError> {
    let checkout = with_engine(&state, move |engine| {
        let ledger = engine.donations();
        let donation = ledger.create_donation(
            campaign_id,
            request.donor_id,
            request.amount,
            &request.currency,
        )?;
        let transaction = ledger.checkout(donation.id)?;
        engine.dispatch_pending();
        Ok(CheckoutResponse {
            donation,
            transaction,
        })
    })
    .await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!(checkout))).into_response())
}

/// `GET /donations/:id`
pub async fn get_donation(
    State(state): State<Arc<ApiState>>,
    Path(donation_id): Path<DonationId>,
) -> Result<Response, ApiError> {
    let donation =
        with_engine(&state, move |engine| engine.donations().donation(donation_id)).await?;
    Ok(ok(donation))
}

/// `POST /donations/:id/checkout`
///
/// Retry a settlement whose earlier attempt failed or timed out.
pub async fn checkout_donation(
    State(state): State<Arc<ApiState>>,
    Path(donation_id): Path<DonationId>,
) -> Result<Response, ApiError> {
    let transaction =
        with_engine(&state, move |engine| engine.donations().checkout(donation_id)).await?;
    Ok(ok(transaction))
}

/// `POST /donations/:id/refund`
pub async fn refund_donation(
    State(state): State<Arc<ApiState>>,
    Path(donation_id): Path<DonationId>,
    Json(request): Json<RefundRequest>,
) -> Result<Response, ApiError> {
    let donation = with_engine(&state, move |engine| {
        let donation =
            engine
                .donations()
                .refund_donation(donation_id, &request.reason, request.actor)?;
        engine.dispatch_pending();
        Ok(donation)
    })
    .await?;
    Ok(ok(donation))
}

/// `POST /campaigns/:id/evidence`
pub async fn upload_evidence(
    State(state): State<Arc<ApiState>>,
    Path(campaign_id): Path<CampaignId>,
    Json(request): Json<UploadEvidenceRequest>,
) -> Result<Response, ApiError> {
    let evidence = with_engine(&state, move |engine| {
        let evidence =
            engine
                .evidence()
                .upload_evidence(request.actor, campaign_id, request.submission)?;
        engine.dispatch_pending();
        Ok(evidence)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!(evidence))).into_response())
}

/// `GET /campaigns/:id/evidence/summary`
pub async fn get_evidence_summary(
    State(state): State<Arc<ApiState>>,
    Path(campaign_id): Path<CampaignId>,
) -> Result<Response, ApiError> {
    let summary = with_engine(&state, move |engine| engine.evidence().summary(campaign_id)).await?;
    Ok(ok(summary))
}

/// `POST /evidence/:id/review`
pub async fn review_evidence(
    State(state): State<Arc<ApiState>>,
    Path(evidence_id): Path<EvidenceId>,
    Json(request): Json<ReviewRequest>,
) -> Result<Response, ApiError> {
    let evidence = with_engine(&state, move |engine| {
        let evidence =
            engine
                .evidence()
                .review_evidence(request.actor, evidence_id, request.decision)?;
        engine.dispatch_pending();
        Ok(evidence)
    })
    .await?;
    Ok(ok(evidence))
}

// ─────────────────────────────────────────────────────────
// Callback handlers
// ─────────────────────────────────────────────────────────

/// `POST /payments/callback`
///
/// Terminal settlement answer from the payment provider. Repeated callbacks
/// return the stored donation.
pub async fn payment_callback(
    State(state): State<Arc<ApiState>>,
    Json(callback): Json<PaymentCallback>,
) -> Result<Response, ApiError> {
    let donation = with_engine(&state, move |engine| {
        let donation = engine
            .donations()
            .settle_donation(callback.donation_id, &callback.outcome)?;
        engine.dispatch_pending();
        Ok(donation)
    })
    .await?;
    Ok(ok(donation))
}

/// `POST /organizations/:id/verified`
///
/// The organization service verified an organization: record it in the
/// directory and open its transparency score. Repeating the call for the
/// same owner is harmless; a different owner is refused with 409.
pub async fn organization_verified(
    State(state): State<Arc<ApiState>>,
    Path(organization_id): Path<OrganizationId>,
    Json(callback): Json<VerificationCallback>,
) -> Result<Response, ApiError> {
    if let Err(current) = state.directory.verify(organization_id, callback.owner_id) {
        warn!(
            "Refusing to hand organization {organization_id} from {current} to {}",
            callback.owner_id
        );
        return Err(ApiError::Engine(funding_engine::Error::InvalidState(format!(
            "organization {organization_id} already belongs to another owner"
        ))));
    }
    db::save_organization(&state.pool, organization_id, callback.owner_id, true).await?;
    info!("Organization {organization_id} verified");

    let score = with_engine(&state, move |engine| {
        let score = engine.score().initialize_score(organization_id)?;
        engine.dispatch_pending();
        Ok(score)
    })
    .await?;
    Ok(ok(score))
}

/// `POST /organizations/:id/unverified`
///
/// Verification was withdrawn. The score is kept; new campaigns are refused.
pub async fn organization_unverified(
    State(state): State<Arc<ApiState>>,
    Path(organization_id): Path<OrganizationId>,
) -> Result<Response, ApiError> {
    let Some(owner) = state.directory.owner_of(organization_id) else {
        return Err(ApiError::Engine(funding_engine::Error::NotFound {
            entity: "Organization",
            id: organization_id.to_string(),
        }));
    };
    state.directory.set_verified(organization_id, false);
    db::save_organization(&state.pool, organization_id, owner, false).await?;
    info!("Organization {organization_id} lost its verification");
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `POST /organizations/:id/reports/:report_id/upheld`
///
/// Moderation upheld a fraud report. Each report counts once.
pub async fn report_upheld(
    State(state): State<Arc<ApiState>>,
    Path((organization_id, report_id)): Path<(OrganizationId, ReportId)>,
) -> Result<Response, ApiError> {
    let score = with_engine(&state, move |engine| {
        engine.report_upheld_for_organization(organization_id, report_id)
    })
    .await?;
    Ok(ok(score))
}
