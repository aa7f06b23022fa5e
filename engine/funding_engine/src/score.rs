//! # Transparency score
//!
//! A bounded `[0.00, 100.00]` reputation per organization, kept as an
//! append-only history log plus a cached projection on the aggregate.
//!
//! ## Calculator
//!
//! | Reason                             | Delta   |
//! |------------------------------------|---------|
//! | `EVIDENCE_APPROVED_ON_TIME`        | +5.00   |
//! | `EVIDENCE_APPROVED_LATE`           | +3.00   |
//! | `EVIDENCE_APPROVED_AFTER_DEADLINE` | +2.00   |
//! | `CAMPAIGN_COMPLETED`               | +3.00   |
//! | `MONTHLY_CONSISTENCY_BONUS`        | +1.00   |
//! | `EVIDENCE_REJECTED`                | -5.00   |
//! | `EVIDENCE_DEADLINE_MISSED`         | -10.00  |
//! | `EVIDENCE_LATE_UPLOAD`             | -3.00   |
//! | `CAMPAIGN_CANCELLED`               | -2.00   |
//! | `REPORT_UPHELD`                    | -15.00  |
//! | `INITIAL_SCORE`                    | +50.00  |
//! | `MANUAL_ADJUSTMENT`                | explicit |
//!
//! ## Projection
//!
//! ```text
//! current_score == replay(history)
//!               == fold(0.00, |s, row| row is MANUAL_ADJUSTMENT ? row.new : clamp(s + delta(row)))
//! ```
//!
//! Every change appends its row and updates the aggregate in one
//! [`ScoreRepository::commit_score`] call made under the organization lock.
//!
//! [`ScoreRepository::commit_score`]: crate::storage::ScoreRepository::commit_score

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::events::{DomainEvent, Envelope};
use crate::ledger::Score;
use crate::types::{
    ChangeReason, EventId, HistoryEntryId, OrganizationId, ReportId, ScoreHistoryEntry,
    ScoreLevel, ScoreLinks, TransparencyScore,
};
use crate::Context;

// ─────────────────────────────────────────────────────────
// Pure calculator
// ─────────────────────────────────────────────────────────

pub fn delta(reason: ChangeReason) -> Decimal {
    let points = match reason {
        ChangeReason::EvidenceApprovedOnTime => 500,
        ChangeReason::EvidenceApprovedLate => 300,
        ChangeReason::EvidenceApprovedAfterDeadline => 200,
        ChangeReason::CampaignCompleted => 300,
        ChangeReason::MonthlyConsistencyBonus => 100,
        ChangeReason::EvidenceRejected => -500,
        ChangeReason::EvidenceDeadlineMissed => -1_000,
        ChangeReason::EvidenceLateUpload => -300,
        ChangeReason::CampaignCancelled => -200,
        ChangeReason::ReportUpheld => -1_500,
        ChangeReason::InitialScore => 5_000,
        ChangeReason::ManualAdjustment => 0,
    };
    Decimal::new(points, 2)
}

/// Score every organization starts from on verification.
pub fn initial_score() -> Score {
    Score::min().apply(delta(ChangeReason::InitialScore))
}

/// Lowest score that may still create campaigns.
pub fn creation_threshold() -> Score {
    Score::clamped(Decimal::new(40, 0))
}

pub fn approval_reason(on_time: bool, after_penalty: bool) -> ChangeReason {
    if on_time {
        ChangeReason::EvidenceApprovedOnTime
    } else if after_penalty {
        ChangeReason::EvidenceApprovedAfterDeadline
    } else {
        ChangeReason::EvidenceApprovedLate
    }
}

/// Display band. Never used for gating.
pub fn score_level(score: Score) -> ScoreLevel {
    let value = score.value();
    if value >= Decimal::new(80, 0) {
        ScoreLevel::VeryHigh
    } else if value >= Decimal::new(60, 0) {
        ScoreLevel::High
    } else if value >= Decimal::new(40, 0) {
        ScoreLevel::Medium
    } else if value >= Decimal::new(30, 0) {
        ScoreLevel::Low
    } else {
        ScoreLevel::VeryLow
    }
}

/// Campaign creation gate. No score row means the organization was never
/// verified.
pub fn can_create(score: Option<&TransparencyScore>) -> bool {
    score.is_some_and(|s| s.current_score >= creation_threshold())
}

/// `clamp(50 + 5 * approved + 3 * completed - 5 * rejected)`.
pub fn rebuild_from_counters(score: &TransparencyScore) -> Score {
    let raw = Decimal::new(50, 0)
        + Decimal::from(score.approved_evidences) * Decimal::new(5, 0)
        + Decimal::from(score.completed_campaigns) * Decimal::new(3, 0)
        - Decimal::from(score.rejected_evidences) * Decimal::new(5, 0);
    Score::clamped(raw)
}

/// Fold a history log, oldest row first.
pub fn replay(history: &[ScoreHistoryEntry]) -> Score {
    history.iter().fold(Score::min(), |current, row| {
        if row.change_reason == ChangeReason::ManualAdjustment {
            row.new_score
        } else {
            current.apply(delta(row.change_reason))
        }
    })
}

fn bump_counters(score: &mut TransparencyScore, reason: ChangeReason) {
    match reason {
        ChangeReason::EvidenceApprovedOnTime => {
            score.approved_evidences += 1;
            score.on_time_reports += 1;
        }
        ChangeReason::EvidenceApprovedLate | ChangeReason::EvidenceApprovedAfterDeadline => {
            score.approved_evidences += 1;
            score.late_reports += 1;
        }
        ChangeReason::EvidenceRejected => score.rejected_evidences += 1,
        _ => {}
    }
}

// ─────────────────────────────────────────────────────────
// Read models
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub organization_id: OrganizationId,
    pub current_score: Score,
    pub level: ScoreLevel,
    pub completed_campaigns: u32,
}

/// Cached score next to the replayed history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionAudit {
    pub organization_id: OrganizationId,
    pub cached: Score,
    pub replayed: Score,
}

impl ProjectionAudit {
    pub fn is_consistent(&self) -> bool {
        self.cached == self.replayed
    }
}

// ─────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────

enum Counter {
    TotalCampaigns,
    CompletedCampaigns,
}

pub struct ScoreEngine {
    ctx: Arc<Context>,
}

impl ScoreEngine {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        ScoreEngine { ctx }
    }

    pub fn score(&self, organization_id: OrganizationId) -> Result<TransparencyScore> {
        self.ctx
            .repos
            .scores
            .find_score(organization_id)?
            .ok_or_else(|| Error::not_found("TransparencyScore", organization_id))
    }

    pub fn history(&self, organization_id: OrganizationId) -> Result<Vec<ScoreHistoryEntry>> {
        self.ctx.repos.scores.history_for(organization_id)
    }

    pub fn can_create_campaign(&self, organization_id: OrganizationId) -> Result<bool> {
        let score = self.ctx.repos.scores.find_score(organization_id)?;
        Ok(can_create(score.as_ref()))
    }

    /// Open the score of a newly verified organization at 50.00. Calling it
    /// again returns the existing score.
    pub fn initialize_score(&self, organization_id: OrganizationId) -> Result<TransparencyScore> {
        if !self.ctx.directory.is_verified(organization_id) {
            return Err(Error::Forbidden(format!(
                "organization {organization_id} is not verified"
            )));
        }

        let handle = self.ctx.organization_locks.handle(organization_id);
        let guard = handle.lock();

        if let Some(existing) = self.ctx.repos.scores.find_score(organization_id)? {
            debug!("Score of organization {organization_id} already initialised");
            return Ok(existing);
        }
        let now = self.ctx.clock.now();
        let score = TransparencyScore {
            organization_id,
            current_score: initial_score(),
            total_campaigns: 0,
            completed_campaigns: 0,
            approved_evidences: 0,
            rejected_evidences: 0,
            on_time_reports: 0,
            late_reports: 0,
            last_calculated_at: now,
        };
        let entry = ScoreHistoryEntry {
            id: HistoryEntryId::new(),
            organization_id,
            previous_score: Score::min(),
            new_score: score.current_score,
            change_reason: ChangeReason::InitialScore,
            campaign_id: None,
            evidence_id: None,
            report_id: None,
            source_event_id: None,
            created_at: now,
        };
        self.ctx.repos.scores.commit_score(&score, &entry)?;
        drop(guard);

        info!(
            "Transparency score of organization {organization_id} initialised at {}",
            score.current_score
        );
        self.publish_change(&entry);
        Ok(score)
    }

    /// Apply one reason's delta. `INITIAL_SCORE` and `MANUAL_ADJUSTMENT` have
    /// their own entry points and are refused here.
    pub fn apply_change(
        &self,
        organization_id: OrganizationId,
        reason: ChangeReason,
        links: ScoreLinks,
    ) -> Result<TransparencyScore> {
        if matches!(
            reason,
            ChangeReason::InitialScore | ChangeReason::ManualAdjustment
        ) {
            return Err(Error::Validation(format!(
                "{} cannot be applied as an incremental change",
                reason.as_str()
            )));
        }

        let handle = self.ctx.organization_locks.handle(organization_id);
        let guard = handle.lock();
        let (score, entry) = self.commit_change(organization_id, reason, links)?;
        drop(guard);

        self.publish_change(&entry);
        Ok(score)
    }

    /// Must be called with the organization lock held.
    fn commit_change(
        &self,
        organization_id: OrganizationId,
        reason: ChangeReason,
        links: ScoreLinks,
    ) -> Result<(TransparencyScore, ScoreHistoryEntry)> {
        let mut score = self.score(organization_id)?;
        let now = self.ctx.clock.now();
        let previous = score.current_score;

        score.current_score = previous.apply(delta(reason));
        score.last_calculated_at = now;
        bump_counters(&mut score, reason);

        let entry = ScoreHistoryEntry {
            id: HistoryEntryId::new(),
            organization_id,
            previous_score: previous,
            new_score: score.current_score,
            change_reason: reason,
            campaign_id: links.campaign_id,
            evidence_id: links.evidence_id,
            report_id: links.report_id,
            source_event_id: links.source_event_id,
            created_at: now,
        };
        self.ctx.repos.scores.commit_score(&score, &entry)?;

        info!(
            "Score of organization {organization_id}: {previous} -> {} ({})",
            score.current_score,
            reason.as_str()
        );
        Ok((score, entry))
    }

    fn publish_change(&self, entry: &ScoreHistoryEntry) {
        self.ctx.outbox.publish(
            DomainEvent::ScoreChanged {
                organization_id: entry.organization_id,
                previous_score: entry.previous_score,
                new_score: entry.new_score,
                reason: entry.change_reason,
                report_id: entry.report_id,
            },
            entry.created_at,
        );
    }

    fn bump_counter(
        &self,
        organization_id: OrganizationId,
        counter: Counter,
        event_id: EventId,
    ) -> Result<()> {
        let Some(mut score) = self.ctx.repos.scores.find_score(organization_id)? else {
            debug!("Organization {organization_id} has no score yet; counter not updated");
            return Ok(());
        };
        match counter {
            Counter::TotalCampaigns => score.total_campaigns += 1,
            Counter::CompletedCampaigns => score.completed_campaigns += 1,
        }
        self.ctx.repos.scores.save_score(&score, Some(event_id))
    }

    /// Consume one dispatched envelope. Returns `false` when the envelope was
    /// already applied or carries nothing for the score.
    pub fn apply_event(&self, envelope: &Envelope) -> Result<bool> {
        let Some(organization_id) = envelope.event.organization_id() else {
            return Ok(false);
        };

        let handle = self.ctx.organization_locks.handle(organization_id);
        let guard = handle.lock();

        if self.ctx.repos.scores.event_applied(envelope.id)? {
            debug!("Envelope {} already applied to the score", envelope.id);
            return Ok(false);
        }

        let change = match &envelope.event {
            DomainEvent::CampaignCreated { .. } => {
                self.bump_counter(organization_id, Counter::TotalCampaigns, envelope.id)?;
                None
            }
            DomainEvent::CampaignCompleted { .. } => {
                self.bump_counter(organization_id, Counter::CompletedCampaigns, envelope.id)?;
                None
            }
            DomainEvent::CampaignCancelled {
                campaign_id,
                was_live: true,
                ..
            } => Some((
                ChangeReason::CampaignCancelled,
                ScoreLinks::campaign(*campaign_id),
            )),
            DomainEvent::EvidenceUploaded {
                evidence_id,
                campaign_id,
                late: true,
                ..
            } => Some((
                ChangeReason::EvidenceLateUpload,
                ScoreLinks::evidence(*campaign_id, *evidence_id),
            )),
            DomainEvent::EvidenceApproved {
                evidence_id,
                campaign_id,
                on_time,
                after_penalty,
                ..
            } => Some((
                approval_reason(*on_time, *after_penalty),
                ScoreLinks::evidence(*campaign_id, *evidence_id),
            )),
            DomainEvent::EvidenceRejected {
                evidence_id,
                campaign_id,
                ..
            } => Some((
                ChangeReason::EvidenceRejected,
                ScoreLinks::evidence(*campaign_id, *evidence_id),
            )),
            DomainEvent::EvidenceDeadlineMissed { campaign_id, .. } => Some((
                ChangeReason::EvidenceDeadlineMissed,
                ScoreLinks::campaign(*campaign_id),
            )),
            _ => return Ok(false),
        };

        let entry = match change {
            Some((reason, links)) => Some(
                self.commit_change(organization_id, reason, links.caused_by(envelope.id))?
                    .1,
            ),
            None => None,
        };
        drop(guard);

        if let Some(entry) = entry {
            self.publish_change(&entry);
        }
        Ok(true)
    }

    /// Moderation trigger. A report counts once; repeating it returns the
    /// current score.
    pub fn report_upheld_for_organization(
        &self,
        organization_id: OrganizationId,
        report_id: ReportId,
    ) -> Result<TransparencyScore> {
        let handle = self.ctx.organization_locks.handle(organization_id);
        let guard = handle.lock();

        let already = self.history(organization_id)?.iter().any(|row| {
            row.change_reason == ChangeReason::ReportUpheld && row.report_id == Some(report_id)
        });
        if already {
            debug!("Report {report_id} already applied to organization {organization_id}");
            return self.score(organization_id);
        }
        let (score, entry) = self.commit_change(
            organization_id,
            ChangeReason::ReportUpheld,
            ScoreLinks::report(report_id),
        )?;
        drop(guard);

        warn!("Report {report_id} upheld against organization {organization_id}");
        self.publish_change(&entry);
        Ok(score)
    }

    /// Rebuild the score from the counters. A result different from the cached
    /// score is written as a `MANUAL_ADJUSTMENT` row.
    pub fn recalculate(&self, organization_id: OrganizationId) -> Result<TransparencyScore> {
        let handle = self.ctx.organization_locks.handle(organization_id);
        let guard = handle.lock();

        let mut score = self.score(organization_id)?;
        let now = self.ctx.clock.now();
        let rebuilt = rebuild_from_counters(&score);
        score.last_calculated_at = now;

        if rebuilt == score.current_score {
            self.ctx.repos.scores.save_score(&score, None)?;
            debug!("Recalculated score of organization {organization_id} unchanged");
            return Ok(score);
        }

        let entry = ScoreHistoryEntry {
            id: HistoryEntryId::new(),
            organization_id,
            previous_score: score.current_score,
            new_score: rebuilt,
            change_reason: ChangeReason::ManualAdjustment,
            campaign_id: None,
            evidence_id: None,
            report_id: None,
            source_event_id: None,
            created_at: now,
        };
        score.current_score = rebuilt;
        self.ctx.repos.scores.commit_score(&score, &entry)?;
        drop(guard);

        info!(
            "Recalculated score of organization {organization_id}: {} -> {rebuilt}",
            entry.previous_score
        );
        self.publish_change(&entry);
        Ok(score)
    }

    /// Award the monthly bonus to organizations with no rejected evidence
    /// and no bonus inside the look-back window. Returns how many received it.
    pub fn apply_consistency_bonus(&self, now: DateTime<Utc>) -> Result<usize> {
        let since = now - self.ctx.config.consistency_period;
        let mut awarded = 0;

        for candidate in self.ctx.repos.scores.all_scores()? {
            let organization_id = candidate.organization_id;
            let handle = self.ctx.organization_locks.handle(organization_id);
            let guard = handle.lock();

            let disqualified = self.history(organization_id)?.iter().any(|row| {
                row.created_at > since
                    && matches!(
                        row.change_reason,
                        ChangeReason::EvidenceRejected | ChangeReason::MonthlyConsistencyBonus
                    )
            });
            if disqualified {
                continue;
            }
            let (_, entry) = self.commit_change(
                organization_id,
                ChangeReason::MonthlyConsistencyBonus,
                ScoreLinks::default(),
            )?;
            drop(guard);

            self.publish_change(&entry);
            awarded += 1;
        }
        Ok(awarded)
    }

    /// Ranked by score, highest first.
    pub fn leaderboard(&self, limit: usize) -> Result<Vec<LeaderboardEntry>> {
        let mut scores = self.ctx.repos.scores.all_scores()?;
        scores.sort_by(|a, b| {
            b.current_score
                .cmp(&a.current_score)
                .then(b.completed_campaigns.cmp(&a.completed_campaigns))
                .then(a.organization_id.cmp(&b.organization_id))
        });
        Ok(scores
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(index, score)| LeaderboardEntry {
                rank: index + 1,
                organization_id: score.organization_id,
                current_score: score.current_score,
                level: score_level(score.current_score),
                completed_campaigns: score.completed_campaigns,
            })
            .collect())
    }

    /// Organizations currently below the campaign creation threshold,
    /// lowest first.
    pub fn low_score_organizations(&self) -> Result<Vec<TransparencyScore>> {
        let threshold = creation_threshold();
        let mut low: Vec<TransparencyScore> = self
            .ctx
            .repos
            .scores
            .all_scores()?
            .into_iter()
            .filter(|s| s.current_score < threshold)
            .collect();
        low.sort_by(|a, b| a.current_score.cmp(&b.current_score));
        Ok(low)
    }

    /// Compare the cached score with a replay of the history log.
    pub fn audit(&self, organization_id: OrganizationId) -> Result<ProjectionAudit> {
        let handle = self.ctx.organization_locks.handle(organization_id);
        let _guard = handle.lock();

        let cached = self.score(organization_id)?.current_score;
        let replayed = replay(&self.history(organization_id)?);
        if cached != replayed {
            warn!(
                "Score projection of organization {organization_id} drifted: cached {cached}, replayed {replayed}"
            );
        }
        Ok(ProjectionAudit {
            organization_id,
            cached,
            replayed,
        })
    }
}
