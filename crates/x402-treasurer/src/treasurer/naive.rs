use std::sync::Arc;
use x402_treasurer_types::proto::PaymentChallenge;

use super::{Approval, Decision, SpendPolicy, Treasurer};
use crate::ledger::LedgerError;
use crate::wallet::Wallet;

/// Approves the first requirement, in server order, that the wallet can pay.
///
/// No external state is consulted and nothing is reserved. This offers **no spend
/// protection**: a server can ask for any amount and it will be paid. Use it only
/// with trusted servers or offline testing.
pub struct NaiveTreasurer {
    wallet: Arc<dyn Wallet>,
}

impl NaiveTreasurer {
    pub fn new(wallet: Arc<dyn Wallet>) -> Self {
        Self { wallet }
    }
}

#[async_trait::async_trait]
impl Treasurer for NaiveTreasurer {
    async fn evaluate(&self, challenge: &PaymentChallenge) -> Decision {
        match SpendPolicy::default().candidates(self.wallet.as_ref(), challenge) {
            Ok(candidates) => match candidates.first() {
                Some(requirement) => Decision::Approved(Approval {
                    requirement: (*requirement).clone(),
                    reservation: None,
                }),
                None => Decision::Denied(super::DenialReason::NoSupportedMethod),
            },
            Err(reason) => Decision::Denied(reason),
        }
    }

    async fn confirm(&self, _approval: &Approval) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn release(&self, _approval: &Approval) -> Result<(), LedgerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::treasurer::DenialReason;
    use crate::treasurer::tests::{challenge, requirement, wallet};

    #[tokio::test]
    async fn test_first_supported_in_server_order() {
        let treasurer = NaiveTreasurer::new(Arc::new(wallet()));
        let decision = treasurer
            .evaluate(&challenge(vec![
                requirement("solana", "So1", 1),
                requirement("base", "0xExpensive", 1_000_000),
                requirement("base", "0xCheap", 1),
            ]))
            .await;
        let Decision::Approved(approval) = decision else {
            panic!("expected approval, got {decision:?}");
        };
        assert_eq!(approval.requirement.pay_to, "0xExpensive");
        assert!(approval.reservation.is_none());
    }

    #[tokio::test]
    async fn test_nothing_supported() {
        let treasurer = NaiveTreasurer::new(Arc::new(wallet()));
        assert_eq!(
            treasurer
                .evaluate(&challenge(vec![requirement("solana", "So1", 1)]))
                .await,
            Decision::Denied(DenialReason::NetworkUnsupported)
        );
    }
}
