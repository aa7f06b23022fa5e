#![allow(dead_code)]

//! Assertion helpers for the properties the engine must hold after every
//! operation. Tests call them after each step rather than only at the end.

use crate::config::EngineConfig;
use crate::ledger::{Money, Score};
use crate::score;
use crate::types::{
    Campaign, CampaignId, DonationId, DonationStatus, OrganizationId, TransactionStatus,
};
use crate::Engine;

/// Collected amount is never negative.
pub fn assert_collected_non_negative(campaign: &Campaign) {
    assert!(
        campaign.collected_amount >= Money::zero(),
        "campaign {} has negative collected amount {}",
        campaign.id,
        campaign.collected_amount
    );
}

/// `collected_amount` equals the sum of COMPLETED donations and
/// `donor_count` their number.
pub fn assert_campaign_totals(engine: &Engine, campaign_id: CampaignId) {
    let campaign = engine.campaigns().campaign(campaign_id).unwrap();
    let completed: Vec<_> = engine
        .donations()
        .donations_for_campaign(campaign_id)
        .unwrap()
        .into_iter()
        .filter(|d| d.status == DonationStatus::Completed)
        .collect();

    assert_collected_non_negative(&campaign);
    assert_eq!(
        campaign.collected_amount,
        Money::try_sum(completed.iter().map(|d| d.amount)).unwrap(),
        "collected amount of campaign {campaign_id} drifted from its donations"
    );
    assert_eq!(
        campaign.donor_count as usize,
        completed.len(),
        "donor count of campaign {campaign_id} drifted from its donations"
    );
}

/// At most one successful transaction per donation.
pub fn assert_single_success(engine: &Engine, donation_id: DonationId) {
    let successes = engine
        .donations()
        .transactions(donation_id)
        .unwrap()
        .into_iter()
        .filter(|t| t.status == TransactionStatus::Success)
        .count();
    assert!(
        successes <= 1,
        "donation {donation_id} has {successes} successful transactions"
    );
}

/// `extension_count` never exceeds the configured cap.
pub fn assert_extension_cap(campaign: &Campaign, config: &EngineConfig) {
    assert!(
        campaign.extension_count <= config.max_extensions,
        "campaign {} extended {} times",
        campaign.id,
        campaign.extension_count
    );
}

pub fn assert_score_bounds(value: Score) {
    assert!(
        value >= Score::min() && value <= Score::max(),
        "score {value} is outside [0.00, 100.00]"
    );
}

/// Cached score equals the replayed history and the latest row.
pub fn assert_score_projection(engine: &Engine, organization_id: OrganizationId) {
    let cached = engine.score().score(organization_id).unwrap().current_score;
    let history = engine.score().history(organization_id).unwrap();

    assert_score_bounds(cached);
    assert_eq!(
        cached,
        score::replay(&history),
        "cached score of organization {organization_id} differs from its history"
    );
    if let Some(last) = history.last() {
        assert_eq!(cached, last.new_score);
    }
    for pair in history.windows(2) {
        assert_eq!(
            pair[0].new_score, pair[1].previous_score,
            "history of organization {organization_id} is not contiguous"
        );
    }
    assert!(engine.score().audit(organization_id).unwrap().is_consistent());
}
