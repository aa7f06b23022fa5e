use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;

use chrono::Duration;

use crate::collaborators::SettlementOutcome;
use crate::invariants::{assert_campaign_totals, assert_single_success};
use crate::test_support::{money, Harness, RefundHold};
use crate::types::{Actor, DonationStatus, TransactionStatus, UserId};

#[test]
fn test_create_donation_validates_amount_currency_and_campaign() {
    let h = Harness::new();
    let campaign = h.active_campaign("1000");
    let ledger = h.engine.donations();

    let err = ledger
        .create_donation(campaign.id, None, money("0"), "TRY")
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_amount");

    let err = ledger
        .create_donation(campaign.id, None, money("9.99"), "TRY")
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_amount");

    let err = ledger
        .create_donation(campaign.id, None, money("1000000000000.01"), "TRY")
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_amount");

    let err = ledger
        .create_donation(campaign.id, None, money("50"), "LIRA")
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_currency");

    let draft = h
        .engine
        .campaigns()
        .create_campaign(h.owner(), h.org, h.draft("500"))
        .unwrap();
    let err = ledger
        .create_donation(draft.id, None, money("50"), "TRY")
        .unwrap_err();
    assert_eq!(err.kind(), "campaign_not_fundable");

    let donation = ledger
        .create_donation(campaign.id, None, money("10"), "try")
        .unwrap();
    assert_eq!(donation.status, DonationStatus::Pending);
    assert_eq!(donation.currency, "TRY");
    assert!(donation.donor_id.is_none());
}

#[test]
fn test_duplicate_settlement_is_a_no_op() {
    let h = Harness::new();
    let campaign = h.active_campaign("5000");
    let ledger = h.engine.donations();

    let donation = ledger
        .create_donation(campaign.id, Some(UserId::new()), money("250"), "TRY")
        .unwrap();
    let transaction = ledger.checkout(donation.id).unwrap();
    let outcome =
        SettlementOutcome::succeeded(transaction.provider_transaction_id.clone(), money("250"));

    let first = ledger.settle_donation(donation.id, &outcome).unwrap();
    h.engine.dispatch_pending();
    let campaign_after_first = h.campaign(campaign.id);

    let second = ledger.settle_donation(donation.id, &outcome).unwrap();
    h.engine.dispatch_pending();

    assert_eq!(first, second);
    assert_eq!(h.campaign(campaign.id), campaign_after_first);
    assert_eq!(campaign_after_first.collected_amount, money("250"));
    assert_eq!(campaign_after_first.donor_count, 1);
    assert_eq!(h.subscriber.count("donation_completed"), 1);

    // A contradicting late callback changes nothing either.
    let late = SettlementOutcome::failed(transaction.provider_transaction_id, "expired card");
    let third = ledger.settle_donation(donation.id, &late).unwrap();
    assert_eq!(third.status, DonationStatus::Completed);

    assert_single_success(&h.engine, donation.id);
    assert_campaign_totals(&h.engine, campaign.id);
}

#[test]
fn test_failed_and_timed_out_settlements() {
    let h = Harness::new();
    let campaign = h.active_campaign("5000");
    let ledger = h.engine.donations();

    let declined = ledger
        .create_donation(campaign.id, None, money("40"), "TRY")
        .unwrap();
    let tx = ledger.checkout(declined.id).unwrap();
    let declined = ledger
        .settle_donation(
            declined.id,
            &SettlementOutcome::failed(tx.provider_transaction_id, "insufficient funds"),
        )
        .unwrap();
    assert_eq!(declined.status, DonationStatus::Failed);
    assert_eq!(declined.failure_reason.as_deref(), Some("insufficient funds"));

    let stalled = ledger
        .create_donation(campaign.id, None, money("40"), "TRY")
        .unwrap();
    let tx = ledger.checkout(stalled.id).unwrap();
    let stalled = ledger
        .settle_donation(
            stalled.id,
            &SettlementOutcome::timed_out(tx.provider_transaction_id),
        )
        .unwrap();
    assert_eq!(stalled.status, DonationStatus::Failed);
    let transactions = ledger.transactions(stalled.id).unwrap();
    assert_eq!(transactions[0].status, TransactionStatus::Failed);

    h.engine.dispatch_pending();
    assert_eq!(h.subscriber.count("donation_failed"), 2);
    assert_eq!(h.campaign(campaign.id).collected_amount, money("0"));
    assert_campaign_totals(&h.engine, campaign.id);
}

#[test]
fn test_settlement_amount_mismatch_leaves_state_untouched() {
    let h = Harness::new();
    let campaign = h.active_campaign("5000");
    let ledger = h.engine.donations();

    let donation = ledger
        .create_donation(campaign.id, None, money("100"), "TRY")
        .unwrap();
    let tx = ledger.checkout(donation.id).unwrap();
    let err = ledger
        .settle_donation(
            donation.id,
            &SettlementOutcome::succeeded(tx.provider_transaction_id.clone(), money("99.99")),
        )
        .unwrap_err();
    assert_eq!(err.kind(), "settlement_mismatch");

    assert_eq!(ledger.donation(donation.id).unwrap().status, DonationStatus::Pending);
    assert_eq!(ledger.transactions(donation.id).unwrap()[0].status, TransactionStatus::Pending);
    assert_eq!(h.campaign(campaign.id).collected_amount, money("0"));

    // The correct callback still goes through afterwards.
    let settled = ledger
        .settle_donation(
            donation.id,
            &SettlementOutcome::succeeded(tx.provider_transaction_id, money("100")),
        )
        .unwrap();
    assert_eq!(settled.status, DonationStatus::Completed);
}

#[test]
fn test_checkout_retry_and_stale_callback() {
    let h = Harness::new();
    let campaign = h.active_campaign("5000");
    let ledger = h.engine.donations();

    let donation = ledger
        .create_donation(campaign.id, None, money("75"), "TRY")
        .unwrap();
    let abandoned = ledger.checkout(donation.id).unwrap();
    let retried = ledger.checkout(donation.id).unwrap();
    assert_ne!(abandoned.provider_transaction_id, retried.provider_transaction_id);

    ledger
        .settle_donation(
            donation.id,
            &SettlementOutcome::succeeded(retried.provider_transaction_id, money("75")),
        )
        .unwrap();
    let after = ledger
        .settle_donation(
            donation.id,
            &SettlementOutcome::succeeded(abandoned.provider_transaction_id, money("75")),
        )
        .unwrap();

    assert_eq!(after.status, DonationStatus::Completed);
    assert_eq!(h.campaign(campaign.id).collected_amount, money("75"));
    assert_single_success(&h.engine, donation.id);

    let err = ledger.checkout(donation.id).unwrap_err();
    assert_eq!(err.kind(), "invalid_state");
}

#[test]
fn test_gateway_outage_on_checkout_records_nothing() {
    let h = Harness::new();
    let campaign = h.active_campaign("5000");
    let ledger = h.engine.donations();
    let donation = ledger
        .create_donation(campaign.id, None, money("20"), "TRY")
        .unwrap();

    h.gateway.unavailable.store(true, Ordering::SeqCst);
    let err = ledger.checkout(donation.id).unwrap_err();
    assert_eq!(err.kind(), "gateway");
    assert!(!err.is_client_error());
    assert!(ledger.transactions(donation.id).unwrap().is_empty());
    assert_eq!(ledger.donation(donation.id).unwrap().status, DonationStatus::Pending);
}

#[test]
fn test_refund_decrements_collected_by_exact_amount() {
    let h = Harness::new();
    let campaign = h.active_campaign("5000");
    h.donate(campaign.id, "300");
    let refunded = h.donate(campaign.id, "100");
    h.donate(campaign.id, "50.50");
    assert_eq!(h.campaign(campaign.id).collected_amount, money("450.50"));

    let ledger = h.engine.donations();
    let result = ledger
        .refund_donation(refunded.id, "duplicate payment", h.admin)
        .unwrap();
    assert_eq!(result.status, DonationStatus::Refunded);
    assert_eq!(result.refund_reason.as_deref(), Some("duplicate payment"));

    let campaign = h.campaign(campaign.id);
    assert_eq!(campaign.collected_amount, money("350.50"));
    assert_eq!(campaign.donor_count, 2);

    let transactions = ledger.transactions(refunded.id).unwrap();
    assert_eq!(transactions[0].status, TransactionStatus::Refunded);
    assert_eq!(transactions[0].refunded_amount, Some(money("100")));
    assert_eq!(h.gateway.refunds.lock().len(), 1);

    let err = ledger
        .refund_donation(refunded.id, "again", h.admin)
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_state");
    assert_eq!(h.gateway.refunds.lock().len(), 1);

    h.engine.dispatch_pending();
    assert_eq!(h.subscriber.count("donation_refunded"), 1);
    assert_campaign_totals(&h.engine, campaign.id);
}

#[test]
fn test_refund_of_completed_campaign_keeps_its_status() {
    let h = Harness::new();
    let campaign = h.active_campaign("1000");
    let donation = h.donate(campaign.id, "1000");
    assert!(h.campaign(campaign.id).status.is_terminal());

    h.engine
        .donations()
        .refund_donation(donation.id, "chargeback", h.admin)
        .unwrap();
    let campaign = h.campaign(campaign.id);
    assert_eq!(campaign.collected_amount, money("0"));
    assert_eq!(campaign.donor_count, 0);
    assert_eq!(campaign.status, crate::types::CampaignStatus::Completed);
}

#[test]
fn test_refund_authorization_and_window() {
    let h = Harness::new();
    let campaign = h.active_campaign("5000");
    let ledger = h.engine.donations();
    let donor = UserId::new();

    let settle = |amount: &str| {
        let donation = ledger
            .create_donation(campaign.id, Some(donor), money(amount), "TRY")
            .unwrap();
        let tx = ledger.checkout(donation.id).unwrap();
        ledger
            .settle_donation(
                donation.id,
                &SettlementOutcome::succeeded(tx.provider_transaction_id, money(amount)),
            )
            .unwrap()
    };
    let early = settle("60");
    let late = settle("70");

    let err = ledger
        .refund_donation(early.id, "changed my mind", Actor::User(UserId::new()))
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");
    let err = ledger
        .refund_donation(early.id, "changed my mind", Actor::System)
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    h.clock.advance(Duration::days(14));
    ledger
        .refund_donation(early.id, "changed my mind", Actor::User(donor))
        .unwrap();

    h.clock.advance(Duration::minutes(1));
    let err = ledger
        .refund_donation(late.id, "changed my mind", Actor::User(donor))
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    // Administrators are not bound by the window.
    ledger
        .refund_donation(late.id, "support ticket 4411", h.admin)
        .unwrap();
    assert_eq!(h.campaign(campaign.id).collected_amount, money("0"));
}

#[test]
fn test_concurrent_refunds_reach_the_provider_once() {
    let h = Harness::new();
    let campaign = h.active_campaign("1000");
    let donation = h.donate(campaign.id, "250");
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    *h.gateway.hold_refunds.lock() = Some(RefundHold {
        entered: entered_tx,
        release: release_rx,
    });

    thread::scope(|s| {
        let first = s.spawn(|| {
            h.engine
                .donations()
                .refund_donation(donation.id, "donor request", h.admin)
        });
        entered_rx.recv().unwrap();

        let err = h
            .engine
            .donations()
            .refund_donation(donation.id, "donor request", h.admin)
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_state");

        release_tx.send(()).unwrap();
        let refunded = first.join().unwrap().unwrap();
        assert_eq!(refunded.status, DonationStatus::Refunded);
    });

    assert_eq!(h.gateway.refunds.lock().len(), 1);
    h.engine.dispatch_pending();
    assert_eq!(h.campaign(campaign.id).collected_amount, money("0"));
    assert_campaign_totals(&h.engine, campaign.id);
}

#[test]
fn test_declined_refund_changes_nothing() {
    let h = Harness::new();
    let campaign = h.active_campaign("5000");
    let donation = h.donate(campaign.id, "100");

    h.gateway.decline_refunds.store(true, Ordering::SeqCst);
    let err = h
        .engine
        .donations()
        .refund_donation(donation.id, "chargeback", h.admin)
        .unwrap_err();
    assert_eq!(err.kind(), "gateway");
    assert_eq!(
        h.engine.donations().donation(donation.id).unwrap().status,
        DonationStatus::Completed
    );
    assert_eq!(h.campaign(campaign.id).collected_amount, money("100"));

    let err = h
        .engine
        .donations()
        .refund_donation(donation.id, "  ", h.admin)
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[test]
fn test_stale_pending_donations_expire() {
    let h = Harness::new();
    let campaign = h.active_campaign("5000");
    let ledger = h.engine.donations();

    let stale = ledger
        .create_donation(campaign.id, None, money("15"), "TRY")
        .unwrap();
    ledger.checkout(stale.id).unwrap();
    h.clock.advance(Duration::hours(100));
    let fresh = ledger
        .create_donation(campaign.id, None, money("15"), "TRY")
        .unwrap();

    h.clock.advance(Duration::hours(68));
    assert_eq!(ledger.expire_stale_pending(h.now()).unwrap(), 0);

    h.clock.advance(Duration::hours(1));
    assert_eq!(ledger.expire_stale_pending(h.now()).unwrap(), 1);
    assert_eq!(ledger.expire_stale_pending(h.now()).unwrap(), 0);

    let stale = ledger.donation(stale.id).unwrap();
    assert_eq!(stale.status, DonationStatus::Failed);
    assert_eq!(stale.failure_reason.as_deref(), Some("settlement window expired"));
    assert_eq!(ledger.transactions(stale.id).unwrap()[0].status, TransactionStatus::Failed);
    assert_eq!(ledger.donation(fresh.id).unwrap().status, DonationStatus::Pending);
}

#[test]
fn test_concurrent_settlements_do_not_lose_updates() {
    let h = Harness::new();
    let campaign = h.active_campaign("100000");
    let ledger = h.engine.donations();

    thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..10 {
                    let donation = ledger
                        .create_donation(campaign.id, None, money("12.50"), "TRY")
                        .unwrap();
                    let tx = ledger.checkout(donation.id).unwrap();
                    let outcome =
                        SettlementOutcome::succeeded(tx.provider_transaction_id, money("12.50"));
                    ledger.settle_donation(donation.id, &outcome).unwrap();
                    ledger.settle_donation(donation.id, &outcome).unwrap();
                }
            });
        }
    });

    let campaign = h.campaign(campaign.id);
    assert_eq!(campaign.collected_amount, money("1000"));
    assert_eq!(campaign.donor_count, 80);
    assert_campaign_totals(&h.engine, campaign.id);
}
