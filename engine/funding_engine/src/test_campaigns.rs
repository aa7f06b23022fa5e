use chrono::Duration;

use crate::campaign::{expiry_decision, ExpiryDecision, MAX_EVIDENCE_DEADLINE_DAYS};
use crate::events::{CompletionCause, DomainEvent};
use crate::invariants::{assert_campaign_totals, assert_extension_cap};
use crate::test_support::{money, score, Harness};
use crate::types::{Actor, CampaignId, CampaignStatus, OrganizationId, ReportId, UserId};

/// Cause carried by the last CampaignCompleted event of a campaign.
fn completion_cause(h: &Harness, campaign_id: CampaignId) -> Option<CompletionCause> {
    h.subscriber
        .envelopes
        .lock()
        .iter()
        .rev()
        .find_map(|envelope| match &envelope.event {
            DomainEvent::CampaignCompleted {
                campaign_id: id,
                cause,
                ..
            } if *id == campaign_id => Some(*cause),
            _ => None,
        })
}

#[test]
fn test_target_reached_completes_exactly_at_target() {
    let h = Harness::new();

    let short = h.active_campaign("1000");
    h.donate(short.id, "500");
    h.donate(short.id, "499.99");
    let campaign = h.campaign(short.id);
    assert_eq!(campaign.status, CampaignStatus::Active);
    assert_eq!(campaign.collected_amount, money("999.99"));
    assert!(campaign.completed_at.is_none());

    let exact = h.active_campaign("1000");
    h.donate(exact.id, "500");
    h.donate(exact.id, "500");
    let campaign = h.campaign(exact.id);
    assert_eq!(campaign.status, CampaignStatus::Completed);
    assert_eq!(campaign.completed_at, Some(h.now()));
    assert_eq!(
        campaign.evidence_deadline(),
        Some(h.now() + Duration::days(15))
    );
    assert_eq!(completion_cause(&h, exact.id), Some(CompletionCause::TargetReached));

    // Over-funding the first one completes it too.
    h.donate(short.id, "10");
    assert_eq!(h.campaign(short.id).status, CampaignStatus::Completed);
    assert_eq!(h.campaign(short.id).collected_amount, money("1009.99"));

    assert_campaign_totals(&h.engine, short.id);
    assert_campaign_totals(&h.engine, exact.id);
}

#[test]
fn test_completed_campaign_accepts_no_donations() {
    let h = Harness::new();
    let campaign = h.completed_campaign("500");
    let err = h
        .engine
        .donations()
        .create_donation(campaign.id, None, money("50"), "TRY")
        .unwrap_err();
    assert_eq!(err.kind(), "campaign_not_fundable");
}

#[test]
fn test_completion_updates_counters_without_moving_the_score() {
    let h = Harness::new();
    h.completed_campaign("500");
    h.active_campaign("800");

    let totals = h.engine.score().score(h.org).unwrap();
    assert_eq!(totals.total_campaigns, 2);
    assert_eq!(totals.completed_campaigns, 1);
    assert_eq!(totals.current_score, score("50"));
}

#[test]
fn test_target_sweep_catches_undispatched_completion() {
    let h = Harness::new();
    let campaign = h.active_campaign("200");
    let ledger = h.engine.donations();

    let donation = ledger
        .create_donation(campaign.id, None, money("200"), "TRY")
        .unwrap();
    let tx = ledger.checkout(donation.id).unwrap();
    ledger
        .settle_donation(
            donation.id,
            &crate::collaborators::SettlementOutcome::succeeded(
                tx.provider_transaction_id,
                money("200"),
            ),
        )
        .unwrap();
    assert_eq!(h.campaign(campaign.id).status, CampaignStatus::Active);

    let completed = h
        .engine
        .campaigns()
        .reconcile_target_reached(h.now())
        .unwrap();
    assert_eq!(completed, 1);
    assert_eq!(h.campaign(campaign.id).status, CampaignStatus::Completed);

    // The queued DonationCompleted is now a no-op for the controller.
    h.engine.dispatch_pending();
    assert_eq!(h.subscriber.count("campaign_completed"), 1);
}

#[test]
fn test_expiry_decision_threshold_is_inclusive() {
    let h = Harness::new();
    let config = h.engine.config().clone();
    let mut campaign = h.active_campaign("1000");
    let after_end = campaign.end_date + Duration::seconds(1);

    assert_eq!(
        expiry_decision(&campaign, campaign.end_date, &config),
        ExpiryDecision::NotDue
    );

    campaign.collected_amount = money("800");
    assert_eq!(
        expiry_decision(&campaign, after_end, &config),
        ExpiryDecision::Complete(CompletionCause::ExpiredAboveThreshold)
    );

    campaign.collected_amount = money("799.99");
    assert_eq!(
        expiry_decision(&campaign, after_end, &config),
        ExpiryDecision::Extend {
            new_end_date: campaign.end_date + Duration::days(7)
        }
    );

    campaign.extension_count = 2;
    assert_eq!(
        expiry_decision(&campaign, after_end, &config),
        ExpiryDecision::Complete(CompletionCause::ExtensionsExhausted)
    );

    campaign.status = CampaignStatus::Paused;
    assert_eq!(
        expiry_decision(&campaign, after_end, &config),
        ExpiryDecision::NotDue
    );
}

#[test]
fn test_expired_campaign_at_threshold_completes() {
    let h = Harness::new();
    let campaign = h.active_campaign("1000");
    h.donate(campaign.id, "800");

    h.clock.advance(Duration::days(30) + Duration::minutes(1));
    let report = h.engine.campaigns().reconcile_expired(h.now()).unwrap();
    h.engine.dispatch_pending();

    assert_eq!(report.completed, 1);
    assert_eq!(report.extended, 0);
    let campaign = h.campaign(campaign.id);
    assert_eq!(campaign.status, CampaignStatus::Completed);
    assert_eq!(campaign.extension_count, 0);
    assert_eq!(
        completion_cause(&h, campaign.id),
        Some(CompletionCause::ExpiredAboveThreshold)
    );
}

#[test]
fn test_expired_campaign_below_threshold_is_extended_twice_then_closed() {
    let h = Harness::new();
    let config = h.engine.config().clone();
    let campaign = h.active_campaign("1000");
    h.donate(campaign.id, "799.99");
    let original_end = campaign.end_date;

    h.clock.set(original_end + Duration::minutes(1));
    let report = h.engine.campaigns().reconcile_expired(h.now()).unwrap();
    assert_eq!(report.extended, 1);
    let extended = h.campaign(campaign.id);
    assert_eq!(extended.status, CampaignStatus::Active);
    assert_eq!(extended.extension_count, 1);
    assert_eq!(extended.end_date, original_end + Duration::days(7));
    assert_extension_cap(&extended, &config);

    // Running again before the new end date changes nothing.
    let report = h.engine.campaigns().reconcile_expired(h.now()).unwrap();
    assert_eq!(report, Default::default());

    h.clock.set(extended.end_date + Duration::minutes(1));
    h.engine.campaigns().reconcile_expired(h.now()).unwrap();
    let extended = h.campaign(campaign.id);
    assert_eq!(extended.extension_count, 2);
    assert_eq!(extended.end_date, original_end + Duration::days(14));

    h.clock.set(extended.end_date + Duration::minutes(1));
    let report = h.engine.campaigns().reconcile_expired(h.now()).unwrap();
    h.engine.dispatch_pending();
    assert_eq!(report.completed, 1);

    let closed = h.campaign(campaign.id);
    assert_eq!(closed.status, CampaignStatus::Completed);
    assert_eq!(closed.extension_count, 2);
    assert_extension_cap(&closed, &config);
    assert_eq!(
        completion_cause(&h, campaign.id),
        Some(CompletionCause::ExtensionsExhausted)
    );
    assert_eq!(h.subscriber.count("campaign_extended"), 2);
}

#[test]
fn test_pause_blocks_donations_until_resumed() {
    let h = Harness::new();
    let campaign = h.active_campaign("1000");
    let campaigns = h.engine.campaigns();

    let err = campaigns
        .pause(Actor::User(UserId::new()), campaign.id)
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    assert_eq!(
        campaigns.pause(h.owner(), campaign.id).unwrap().status,
        CampaignStatus::Paused
    );
    assert_eq!(
        campaigns.pause(h.owner(), campaign.id).unwrap_err().kind(),
        "invalid_state"
    );
    let err = h
        .engine
        .donations()
        .create_donation(campaign.id, None, money("50"), "TRY")
        .unwrap_err();
    assert_eq!(err.kind(), "campaign_not_fundable");

    assert_eq!(
        campaigns.resume(h.admin, campaign.id).unwrap().status,
        CampaignStatus::Active
    );
    h.donate(campaign.id, "50");
    assert_eq!(h.campaign(campaign.id).collected_amount, money("50"));
}

#[test]
fn test_cancel_penalises_only_live_campaigns() {
    let h = Harness::new();
    let campaigns = h.engine.campaigns();

    let draft = campaigns
        .create_campaign(h.owner(), h.org, h.draft("1000"))
        .unwrap();
    let err = campaigns.cancel(h.owner(), draft.id, "   ").unwrap_err();
    assert_eq!(err.kind(), "validation");
    campaigns
        .cancel(h.owner(), draft.id, "duplicate campaign")
        .unwrap();
    h.engine.dispatch_pending();
    assert_eq!(h.current_score(), score("50"));

    let live = h.active_campaign("1000");
    campaigns.pause(h.owner(), live.id).unwrap();
    let cancelled = campaigns
        .cancel(h.owner(), live.id, "venue fell through")
        .unwrap();
    h.engine.dispatch_pending();
    assert_eq!(cancelled.status, CampaignStatus::Cancelled);
    assert_eq!(h.current_score(), score("48"));

    let err = campaigns
        .cancel(h.owner(), live.id, "again")
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_state");

    let completed = h.completed_campaign("100");
    let err = campaigns
        .cancel(h.admin, completed.id, "too late")
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_state");
}

#[test]
fn test_review_of_submitted_campaigns() {
    let h = Harness::new();
    let campaigns = h.engine.campaigns();
    let campaign = campaigns
        .create_campaign(h.owner(), h.org, h.draft("1000"))
        .unwrap();

    let err = campaigns.approve(h.admin, campaign.id).unwrap_err();
    assert_eq!(err.kind(), "invalid_state");

    campaigns.submit(h.owner(), campaign.id).unwrap();
    let err = campaigns.approve(h.owner(), campaign.id).unwrap_err();
    assert_eq!(err.kind(), "forbidden");
    let err = campaigns.reject(h.admin, campaign.id, "").unwrap_err();
    assert_eq!(err.kind(), "validation");

    let rejected = campaigns
        .reject(h.admin, campaign.id, "missing permits")
        .unwrap();
    assert_eq!(rejected.status, CampaignStatus::Rejected);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("missing permits"));

    let err = campaigns.approve(h.admin, campaign.id).unwrap_err();
    assert_eq!(err.kind(), "invalid_state");

    h.engine.dispatch_pending();
    assert_eq!(h.subscriber.count("campaign_rejected"), 1);
    assert_eq!(h.current_score(), score("50"));
}

#[test]
fn test_admin_can_close_an_active_campaign() {
    let h = Harness::new();
    let campaign = h.active_campaign("1000");
    h.donate(campaign.id, "100");

    let err = h
        .engine
        .campaigns()
        .complete(h.owner(), campaign.id)
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    let closed = h.engine.campaigns().complete(h.admin, campaign.id).unwrap();
    h.engine.dispatch_pending();
    assert_eq!(closed.status, CampaignStatus::Completed);
    assert_eq!(closed.completed_at, Some(h.now()));
    assert_eq!(completion_cause(&h, campaign.id), Some(CompletionCause::Manual));
}

#[test]
fn test_delete_draft() {
    let h = Harness::new();
    let campaigns = h.engine.campaigns();
    let draft = campaigns
        .create_campaign(h.owner(), h.org, h.draft("1000"))
        .unwrap();

    let err = campaigns
        .delete_draft(Actor::User(UserId::new()), draft.id)
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    campaigns.delete_draft(h.owner(), draft.id).unwrap();
    assert_eq!(campaigns.campaign(draft.id).unwrap_err().kind(), "not_found");

    let live = h.active_campaign("1000");
    let err = campaigns.delete_draft(h.owner(), live.id).unwrap_err();
    assert_eq!(err.kind(), "invalid_state");
}

#[test]
fn test_create_campaign_validation() {
    let h = Harness::new();
    let campaigns = h.engine.campaigns();

    let mut draft = h.draft("1000");
    draft.title = "  ".into();
    assert_eq!(
        campaigns.create_campaign(h.owner(), h.org, draft).unwrap_err().kind(),
        "validation"
    );

    let draft = h.draft("0");
    assert_eq!(
        campaigns.create_campaign(h.owner(), h.org, draft).unwrap_err().kind(),
        "invalid_amount"
    );

    let mut draft = h.draft("1000");
    draft.end_date = draft.start_date;
    assert_eq!(
        campaigns.create_campaign(h.owner(), h.org, draft).unwrap_err().kind(),
        "validation"
    );

    let mut draft = h.draft("1000");
    draft.evidence_deadline_days = Some(0);
    assert_eq!(
        campaigns.create_campaign(h.owner(), h.org, draft).unwrap_err().kind(),
        "validation"
    );

    let mut draft = h.draft("1000");
    draft.evidence_deadline_days = Some(30);
    let created = campaigns.create_campaign(h.owner(), h.org, draft).unwrap();
    assert_eq!(created.evidence_deadline_days, 30);
    assert_eq!(created.status, CampaignStatus::Draft);
    assert_eq!(created.collected_amount, money("0"));
}

#[test]
fn test_evidence_window_is_bounded() {
    let h = Harness::new();
    let campaigns = h.engine.campaigns();

    for days in [366, u32::MAX] {
        let mut draft = h.draft("1000");
        draft.evidence_deadline_days = Some(days);
        let err = campaigns.create_campaign(h.owner(), h.org, draft).unwrap_err();
        assert_eq!(err.kind(), "validation", "{days} days accepted");
    }

    let mut draft = h.draft("1000");
    draft.evidence_deadline_days = Some(MAX_EVIDENCE_DEADLINE_DAYS);
    let created = campaigns.create_campaign(h.owner(), h.org, draft).unwrap();
    assert_eq!(created.evidence_deadline_days, 365);

    let err = campaigns
        .create_campaign(h.owner(), h.org, h.draft("1000000000000.01"))
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_amount");
}

#[test]
fn test_stored_oversized_window_does_not_overflow() {
    let h = Harness::new();
    let mut campaign = h.completed_campaign("1000");
    campaign.evidence_deadline_days = u32::MAX;

    let deadline = campaign.evidence_deadline().unwrap();
    assert!(deadline > h.now() + Duration::days(365));
    assert!(!crate::evidence::is_deadline_missed(&campaign, h.now()));
}

#[test]
fn test_create_campaign_gates() {
    let h = Harness::new();
    let campaigns = h.engine.campaigns();

    let err = campaigns
        .create_campaign(Actor::User(UserId::new()), h.org, h.draft("1000"))
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    let unverified = OrganizationId::new();
    let pending_owner = UserId::new();
    h.directory.register(unverified, pending_owner, false);
    let err = campaigns
        .create_campaign(Actor::User(pending_owner), unverified, h.draft("1000"))
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    // Verified, but its score was never opened.
    let fresh = OrganizationId::new();
    let fresh_owner = UserId::new();
    h.directory.register(fresh, fresh_owner, true);
    let err = campaigns
        .create_campaign(Actor::User(fresh_owner), fresh, h.draft("1000"))
        .unwrap_err();
    assert_eq!(err.kind(), "score_too_low");

    h.engine
        .report_upheld_for_organization(h.org, ReportId::new())
        .unwrap();
    assert_eq!(h.current_score(), score("35"));
    let err = campaigns
        .create_campaign(h.owner(), h.org, h.draft("1000"))
        .unwrap_err();
    assert_eq!(err.kind(), "score_too_low");
    assert!(err.is_client_error());
}
