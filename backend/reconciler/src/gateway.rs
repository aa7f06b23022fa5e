//! Payment gateway adapter for the host.
//!
//! The provider settles asynchronously: `initiate_settlement` only reserves a
//! provider transaction id, and the terminal answer arrives later on
//! `POST /payments/callback`. Refunds are accepted immediately.

use funding_engine::{
    Donation, GatewayError, Money, PaymentGateway, PendingSettlement, RefundOutcome, Transaction,
};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct DeferredGateway;

impl PaymentGateway for DeferredGateway {
    fn initiate_settlement(&self, donation: &Donation) -> Result<PendingSettlement, GatewayError> {
        let provider_transaction_id = format!("pay_{}", Uuid::new_v4().simple());
        info!(
            "Settlement {provider_transaction_id} opened for donation {} ({} {})",
            donation.id, donation.amount, donation.currency
        );
        Ok(PendingSettlement {
            provider_transaction_id,
        })
    }

    fn initiate_refund(
        &self,
        transaction: &Transaction,
        amount: Money,
    ) -> Result<RefundOutcome, GatewayError> {
        let provider_refund_id = format!("re_{}", Uuid::new_v4().simple());
        info!(
            "Refund {provider_refund_id} of {amount} issued against {}",
            transaction.provider_transaction_id
        );
        Ok(RefundOutcome {
            accepted: true,
            provider_refund_id: Some(provider_refund_id),
            message: None,
        })
    }
}
