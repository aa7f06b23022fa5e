use std::thread;

use chrono::Duration;

use crate::events::{DomainEvent, Envelope};
use crate::invariants::{assert_score_bounds, assert_score_projection};
use crate::ledger::Score;
use crate::score::{can_create, rebuild_from_counters};
use crate::storage::{Repositories, ScoreRepository};
use crate::test_support::{money, score, Harness};
use crate::{Engine, EngineConfig};
use crate::types::{
    CampaignId, ChangeReason, EventId, EvidenceId, OrganizationId, ReportId, ScoreLevel,
    ScoreLinks, UserId,
};

/// Small deterministic generator so that failures reproduce.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

const INCREMENTAL: [ChangeReason; 10] = [
    ChangeReason::EvidenceApprovedOnTime,
    ChangeReason::EvidenceApprovedLate,
    ChangeReason::EvidenceApprovedAfterDeadline,
    ChangeReason::CampaignCompleted,
    ChangeReason::MonthlyConsistencyBonus,
    ChangeReason::EvidenceRejected,
    ChangeReason::EvidenceDeadlineMissed,
    ChangeReason::EvidenceLateUpload,
    ChangeReason::CampaignCancelled,
    ChangeReason::ReportUpheld,
];

fn verified_org(h: &Harness) -> OrganizationId {
    let org = OrganizationId::new();
    h.directory.register(org, UserId::new(), true);
    h.engine.score().initialize_score(org).unwrap();
    org
}

#[test]
fn test_projection_survives_random_sequences() {
    for seed in [7_u64, 1_337, 0x5eed_cafe, 2_024_031] {
        let h = Harness::new();
        let engine = h.engine.score();
        let mut rng = XorShift(seed);

        for _ in 0..150 {
            match rng.below(10) {
                0 => {
                    h.engine
                        .report_upheld_for_organization(h.org, ReportId::new())
                        .unwrap();
                }
                1 => {
                    engine.recalculate(h.org).unwrap();
                }
                2 => {
                    h.clock.advance(Duration::days(rng.below(40) as i64));
                    engine.apply_consistency_bonus(h.now()).unwrap();
                }
                _ => {
                    let reason = INCREMENTAL[rng.below(INCREMENTAL.len())];
                    engine.apply_change(h.org, reason, ScoreLinks::default()).unwrap();
                }
            }
            assert_score_projection(&h.engine, h.org);
        }
    }
}

#[test]
fn test_score_stays_within_bounds() {
    let h = Harness::new();
    let engine = h.engine.score();

    for _ in 0..12 {
        let updated = h
            .engine
            .report_upheld_for_organization(h.org, ReportId::new())
            .unwrap();
        assert_score_bounds(updated.current_score);
    }
    assert_eq!(h.current_score(), Score::min());

    for _ in 0..25 {
        let updated = engine
            .apply_change(h.org, ChangeReason::EvidenceApprovedOnTime, ScoreLinks::default())
            .unwrap();
        assert_score_bounds(updated.current_score);
    }
    assert_eq!(h.current_score(), Score::max());

    let last = engine.history(h.org).unwrap().pop().unwrap();
    assert_eq!(last.previous_score, Score::max());
    assert_eq!(last.new_score, Score::max());
    assert_score_projection(&h.engine, h.org);
}

#[test]
fn test_apply_change_refuses_non_incremental_reasons() {
    let h = Harness::new();
    for reason in [ChangeReason::InitialScore, ChangeReason::ManualAdjustment] {
        let err = h
            .engine
            .score()
            .apply_change(h.org, reason, ScoreLinks::default())
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
    assert_eq!(h.engine.score().history(h.org).unwrap().len(), 1);
}

#[test]
fn test_apply_change_records_links() {
    let h = Harness::new();
    let campaign_id = CampaignId::new();
    let evidence_id = EvidenceId::new();
    h.engine
        .score()
        .apply_change(
            h.org,
            ChangeReason::EvidenceRejected,
            ScoreLinks::evidence(campaign_id, evidence_id),
        )
        .unwrap();

    let row = h.engine.score().history(h.org).unwrap().pop().unwrap();
    assert_eq!(row.change_reason, ChangeReason::EvidenceRejected);
    assert_eq!(row.previous_score, score("50"));
    assert_eq!(row.new_score, score("45"));
    assert_eq!(row.campaign_id, Some(campaign_id));
    assert_eq!(row.evidence_id, Some(evidence_id));
    assert_eq!(row.report_id, None);
    assert_eq!(row.created_at, h.now());

    h.engine.dispatch_pending();
    assert_eq!(h.subscriber.count("score_changed"), 2);
}

#[test]
fn test_unknown_organization_has_no_score() {
    let h = Harness::new();
    let stranger = OrganizationId::new();
    let err = h
        .engine
        .score()
        .apply_change(stranger, ChangeReason::ReportUpheld, ScoreLinks::default())
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
    assert!(!h.engine.score().can_create_campaign(stranger).unwrap());
    assert!(!can_create(None));
}

#[test]
fn test_initialize_requires_verification_and_is_idempotent() {
    let h = Harness::new();
    let org = OrganizationId::new();
    h.directory.register(org, UserId::new(), false);

    let err = h.engine.score().initialize_score(org).unwrap_err();
    assert_eq!(err.kind(), "forbidden");
    assert!(h.engine.score().history(org).unwrap().is_empty());

    assert!(h.directory.set_verified(org, true));
    let first = h.engine.score().initialize_score(org).unwrap();
    h.clock.advance(Duration::hours(1));
    let second = h.engine.score().initialize_score(org).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.current_score, score("50"));
    let history = h.engine.score().history(org).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].change_reason, ChangeReason::InitialScore);
    assert_eq!(history[0].previous_score, Score::min());
}

#[test]
fn test_upheld_report_counts_once() {
    let h = Harness::new();
    let report = ReportId::new();

    h.engine.report_upheld_for_organization(h.org, report).unwrap();
    let repeated = h.engine.report_upheld_for_organization(h.org, report).unwrap();
    assert_eq!(repeated.current_score, score("35"));

    let other = h
        .engine
        .report_upheld_for_organization(h.org, ReportId::new())
        .unwrap();
    assert_eq!(other.current_score, score("20"));

    let upheld: Vec<_> = h
        .engine
        .score()
        .history(h.org)
        .unwrap()
        .into_iter()
        .filter(|row| row.change_reason == ChangeReason::ReportUpheld)
        .collect();
    assert_eq!(upheld.len(), 2);
    assert_eq!(upheld[0].report_id, Some(report));
    assert_score_projection(&h.engine, h.org);
}

#[test]
fn test_recalculate_writes_manual_adjustment_only_on_change() {
    let h = Harness::new();
    let engine = h.engine.score();
    h.engine
        .report_upheld_for_organization(h.org, ReportId::new())
        .unwrap();
    assert_eq!(h.current_score(), score("35"));

    h.clock.advance(Duration::hours(2));
    let rebuilt = engine.recalculate(h.org).unwrap();
    assert_eq!(rebuilt.current_score, score("50"));
    assert_eq!(rebuilt.last_calculated_at, h.now());

    let history = engine.history(h.org).unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.change_reason, ChangeReason::ManualAdjustment);
    assert_eq!(last.previous_score, score("35"));
    assert_eq!(last.new_score, score("50"));

    h.clock.advance(Duration::hours(2));
    let unchanged = engine.recalculate(h.org).unwrap();
    assert_eq!(unchanged.current_score, score("50"));
    assert_eq!(unchanged.last_calculated_at, h.now());
    assert_eq!(engine.history(h.org).unwrap().len(), history.len());
    assert_score_projection(&h.engine, h.org);
}

#[test]
fn test_rebuild_from_counters_formula() {
    let h = Harness::new();
    let mut counters = h.engine.score().score(h.org).unwrap();
    counters.approved_evidences = 4;
    counters.completed_campaigns = 2;
    counters.rejected_evidences = 1;
    assert_eq!(rebuild_from_counters(&counters), score("71"));

    counters.approved_evidences = 20;
    assert_eq!(rebuild_from_counters(&counters), Score::max());

    counters.approved_evidences = 0;
    counters.completed_campaigns = 0;
    counters.rejected_evidences = 11;
    assert_eq!(rebuild_from_counters(&counters), Score::min());
}

#[test]
fn test_envelopes_are_applied_once() {
    let h = Harness::new();
    let envelope = Envelope {
        id: EventId::new(),
        occurred_at: h.now(),
        event: DomainEvent::EvidenceRejected {
            evidence_id: EvidenceId::new(),
            campaign_id: CampaignId::new(),
            organization_id: h.org,
            reason: "blurred scan".into(),
        },
    };

    assert!(h.engine.score().apply_event(&envelope).unwrap());
    assert!(!h.engine.score().apply_event(&envelope).unwrap());
    assert_eq!(h.current_score(), score("45"));
    assert_eq!(h.engine.score().score(h.org).unwrap().rejected_evidences, 1);

    let unrelated = Envelope {
        id: EventId::new(),
        occurred_at: h.now(),
        event: DomainEvent::DonationCreated {
            donation_id: crate::types::DonationId::new(),
            campaign_id: CampaignId::new(),
            donor_id: None,
            amount: money("10"),
        },
    };
    assert!(!h.engine.score().apply_event(&unrelated).unwrap());
}

#[test]
fn test_applied_envelopes_are_remembered_by_the_store() {
    let h = Harness::new();
    let rejected = Envelope {
        id: EventId::new(),
        occurred_at: h.now(),
        event: DomainEvent::EvidenceRejected {
            evidence_id: EvidenceId::new(),
            campaign_id: CampaignId::new(),
            organization_id: h.org,
            reason: "blurred scan".into(),
        },
    };
    let created = Envelope {
        id: EventId::new(),
        occurred_at: h.now(),
        event: DomainEvent::CampaignCreated {
            campaign_id: CampaignId::new(),
            organization_id: h.org,
        },
    };
    assert!(h.engine.score().apply_event(&rejected).unwrap());
    assert!(h.engine.score().apply_event(&created).unwrap());
    assert!(h.store.event_applied(rejected.id).unwrap());
    assert!(h.store.event_applied(created.id).unwrap());
    let last = h.engine.score().history(h.org).unwrap().pop().unwrap();
    assert_eq!(last.source_event_id, Some(rejected.id));

    // A restarted engine over the same store skips both.
    let restarted = Engine::new(
        Repositories::from(h.store.clone()),
        h.gateway.clone(),
        h.directory.clone(),
        h.clock.clone(),
        EngineConfig::default(),
    );
    assert!(!restarted.score().apply_event(&rejected).unwrap());
    assert!(!restarted.score().apply_event(&created).unwrap());
    let current = restarted.score().score(h.org).unwrap();
    assert_eq!(current.current_score, score("45"));
    assert_eq!(current.total_campaigns, 1);
}

#[test]
fn test_creation_gate_is_inclusive_at_forty() {
    let h = Harness::new();
    let engine = h.engine.score();

    engine
        .apply_change(h.org, ChangeReason::EvidenceDeadlineMissed, ScoreLinks::default())
        .unwrap();
    assert_eq!(h.current_score(), score("40"));
    assert!(engine.can_create_campaign(h.org).unwrap());

    engine
        .apply_change(h.org, ChangeReason::CampaignCancelled, ScoreLinks::default())
        .unwrap();
    assert_eq!(h.current_score(), score("38"));
    assert!(!engine.can_create_campaign(h.org).unwrap());
}

#[test]
fn test_leaderboard_and_low_scores() {
    let h = Harness::new();
    let engine = h.engine.score();
    let middling = verified_org(&h);
    let reported = verified_org(&h);

    engine
        .apply_change(h.org, ChangeReason::EvidenceApprovedOnTime, ScoreLinks::default())
        .unwrap();
    h.engine
        .report_upheld_for_organization(reported, ReportId::new())
        .unwrap();

    let board = engine.leaderboard(10).unwrap();
    assert_eq!(board.len(), 3);
    assert_eq!(board[0].organization_id, h.org);
    assert_eq!(board[0].rank, 1);
    assert_eq!(board[0].current_score, score("55"));
    assert_eq!(board[0].level, ScoreLevel::Medium);
    assert_eq!(board[1].organization_id, middling);
    assert_eq!(board[2].organization_id, reported);
    assert_eq!(board[2].level, ScoreLevel::Low);

    assert_eq!(engine.leaderboard(2).unwrap().len(), 2);

    let low = engine.low_score_organizations().unwrap();
    assert_eq!(low.len(), 1);
    assert_eq!(low[0].organization_id, reported);
}

#[test]
fn test_concurrent_changes_keep_the_log_contiguous() {
    let h = Harness::new();
    let engine = h.engine.score();

    thread::scope(|scope| {
        for worker in 0..6 {
            scope.spawn(move || {
                for step in 0..20 {
                    let reason = INCREMENTAL[(worker + step) % INCREMENTAL.len()];
                    engine
                        .apply_change(h.org, reason, ScoreLinks::default())
                        .unwrap();
                }
            });
        }
    });

    assert_eq!(engine.history(h.org).unwrap().len(), 121);
    assert_score_projection(&h.engine, h.org);
}
