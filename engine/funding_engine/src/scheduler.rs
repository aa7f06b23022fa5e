//! # Reconciliation scheduler
//!
//! The only place wall-clock time enters the engine. Each [`Job`] selects
//! candidates and applies a component transition; every transition re-checks
//! its precondition under the aggregate lock, so a job may be re-run at any
//! time without harm.
//!
//! | Job                         | Default cadence | Transition                                          |
//! |-----------------------------|-----------------|-----------------------------------------------------|
//! | `campaign_status`           | 6 hours         | target-reached sweep, then expiry/extension sweep   |
//! | `evidence_deadline_penalty` | 1 day           | missed evidence deadline, once per campaign         |
//! | `evidence_reminder`         | 1 day           | reminder at 7/3/1/0 days before the deadline        |
//! | `consistency_bonus`         | 30 days         | monthly bonus for organizations without rejections  |
//! | `pending_donation_expiry`   | 15 minutes      | fail donations stuck in PENDING                     |
//!
//! The scheduler does not own a timer. A host calls [`ReconciliationScheduler::tick`]
//! on its own interval; tests advance a [`crate::clock::ManualClock`] instead.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::errors::Result;
use crate::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Job {
    CampaignStatus,
    EvidenceDeadlinePenalty,
    EvidenceReminder,
    ConsistencyBonus,
    PendingDonationExpiry,
}

impl Job {
    pub const ALL: [Job; 5] = [
        Job::CampaignStatus,
        Job::EvidenceDeadlinePenalty,
        Job::EvidenceReminder,
        Job::ConsistencyBonus,
        Job::PendingDonationExpiry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Job::CampaignStatus => "campaign_status",
            Job::EvidenceDeadlinePenalty => "evidence_deadline_penalty",
            Job::EvidenceReminder => "evidence_reminder",
            Job::ConsistencyBonus => "consistency_bonus",
            Job::PendingDonationExpiry => "pending_donation_expiry",
        }
    }

    pub fn parse(raw: &str) -> Option<Job> {
        Job::ALL.into_iter().find(|job| job.as_str() == raw)
    }

    pub fn cadence(&self, config: &EngineConfig) -> Duration {
        match self {
            Job::CampaignStatus => config.campaign_status_cadence,
            Job::EvidenceDeadlinePenalty => config.evidence_penalty_cadence,
            Job::EvidenceReminder => config.evidence_reminder_cadence,
            Job::ConsistencyBonus => config.consistency_bonus_cadence,
            Job::PendingDonationExpiry => config.pending_expiry_cadence,
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one job run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub job: Job,
    pub ran_at: DateTime<Utc>,
    /// Aggregates the run changed.
    pub affected: usize,
    pub detail: String,
}

pub struct ReconciliationScheduler {
    engine: Arc<Engine>,
    last_run: Mutex<HashMap<Job, DateTime<Utc>>>,
}

impl ReconciliationScheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        ReconciliationScheduler {
            engine,
            last_run: Mutex::new(HashMap::new()),
        }
    }

    /// Seed the cadence from a persisted run, e.g. after a restart.
    pub fn restore_last_run(&self, job: Job, at: DateTime<Utc>) {
        self.last_run.lock().insert(job, at);
    }

    pub fn last_run(&self, job: Job) -> Option<DateTime<Utc>> {
        self.last_run.lock().get(&job).copied()
    }

    /// Jobs whose cadence has elapsed at `now`. A job that never ran is due.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Vec<Job> {
        let last_run = self.last_run.lock();
        let config = self.engine.config();
        Job::ALL
            .into_iter()
            .filter(|job| match last_run.get(job) {
                Some(at) => now - *at >= job.cadence(config),
                None => true,
            })
            .collect()
    }

    /// Run every due job at the engine clock's current time. A failed job is
    /// logged and stays due for the next tick. Deliveries whose backoff has
    /// elapsed are retried even when no job is due.
    pub fn tick(&self) -> Vec<JobReport> {
        let now = self.engine.clock().now();
        let mut reports = Vec::new();
        for job in self.due_jobs(now) {
            match self.run(job, now) {
                Ok(report) => reports.push(report),
                Err(e) => error!("Reconciliation job {job} failed: {e}"),
            }
        }
        self.engine.dispatch_pending();
        reports
    }

    /// Run one job regardless of its cadence, then dispatch the events it
    /// produced.
    pub fn run(&self, job: Job, now: DateTime<Utc>) -> Result<JobReport> {
        let engine = &self.engine;
        let (affected, detail) = match job {
            Job::CampaignStatus => {
                let reached = engine.campaigns().reconcile_target_reached(now)?;
                let expiry = engine.campaigns().reconcile_expired(now)?;
                (
                    reached + expiry.completed + expiry.extended,
                    format!(
                        "{reached} reached target, {} completed on expiry, {} extended",
                        expiry.completed, expiry.extended
                    ),
                )
            }
            Job::EvidenceDeadlinePenalty => {
                let penalized = engine.evidence().penalize_missed_deadlines(now)?;
                (penalized, format!("{penalized} campaigns missed their evidence deadline"))
            }
            Job::EvidenceReminder => {
                let sent = engine.evidence().send_reminders(now)?;
                (sent, format!("{sent} evidence reminders due"))
            }
            Job::ConsistencyBonus => {
                let awarded = engine.score().apply_consistency_bonus(now)?;
                (awarded, format!("{awarded} organizations received the consistency bonus"))
            }
            Job::PendingDonationExpiry => {
                let expired = engine.donations().expire_stale_pending(now)?;
                (expired, format!("{expired} pending donations expired"))
            }
        };

        self.last_run.lock().insert(job, now);
        engine.dispatch_pending();

        info!("Reconciliation job {job} done: {detail}");
        Ok(JobReport {
            job,
            ran_at: now,
            affected,
            detail,
        })
    }
}
