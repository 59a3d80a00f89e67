use std::sync::Arc;
use std::time::Duration;
use x402_treasurer_types::proto::PaymentChallenge;

use super::{Approval, Decision, DenialReason, SpendPolicy, Treasurer};
use crate::ledger::{LedgerDecision, LedgerError, SpendLedger};
use crate::wallet::Wallet;

#[cfg(feature = "telemetry")]
use tracing::{debug, instrument, warn};

/// Approves the cheapest payable requirement that a [`SpendLedger`] agrees to reserve.
///
/// Requirements are filtered by wallet support and the [`SpendPolicy`], sorted by
/// amount (ties keep server order) and offered to the ledger one by one. Any
/// ledger error or timeout denies with
/// [`ExternalServiceUnavailable`](DenialReason::ExternalServiceUnavailable):
/// the treasurer never fails open.
pub struct LimitTreasurer {
    wallet: Arc<dyn Wallet>,
    ledger: Arc<dyn SpendLedger>,
    policy: SpendPolicy,
    ledger_timeout: Duration,
}

impl LimitTreasurer {
    pub const DEFAULT_LEDGER_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(wallet: Arc<dyn Wallet>, ledger: Arc<dyn SpendLedger>) -> Self {
        Self {
            wallet,
            ledger,
            policy: SpendPolicy::default(),
            ledger_timeout: Self::DEFAULT_LEDGER_TIMEOUT,
        }
    }

    pub fn with_policy(mut self, policy: SpendPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_ledger_timeout(mut self, timeout: Duration) -> Self {
        self.ledger_timeout = timeout;
        self
    }

    pub fn policy(&self) -> &SpendPolicy {
        &self.policy
    }
}

#[async_trait::async_trait]
impl Treasurer for LimitTreasurer {
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "x402.treasurer.evaluate", skip_all, fields(payer = %self.wallet.payer()))
    )]
    async fn evaluate(&self, challenge: &PaymentChallenge) -> Decision {
        let mut candidates = match self.policy.candidates(self.wallet.as_ref(), challenge) {
            Ok(candidates) => candidates,
            Err(reason) => return Decision::Denied(reason),
        };
        candidates.sort_by_key(|r| r.amount);

        let payer = self.wallet.payer();
        let mut first_denial = None;
        for requirement in candidates {
            let reserved = tokio::time::timeout(
                self.ledger_timeout,
                self.ledger.check_and_reserve(payer, requirement),
            )
            .await;
            match reserved {
                Ok(Ok(LedgerDecision::Reserved(reservation))) => {
                    #[cfg(feature = "telemetry")]
                    debug!(reservation = %reservation.id, amount = %requirement.amount, "Reserved spend");
                    return Decision::Approved(Approval {
                        requirement: requirement.clone(),
                        reservation: Some(reservation),
                    });
                }
                Ok(Ok(LedgerDecision::Denied(reason))) => {
                    #[cfg(feature = "telemetry")]
                    debug!(%reason, amount = %requirement.amount, "Ledger denied requirement");
                    first_denial.get_or_insert(reason);
                }
                Ok(Err(_e)) => {
                    #[cfg(feature = "telemetry")]
                    warn!(error = %_e, "Ledger unavailable, denying payment");
                    return Decision::Denied(DenialReason::ExternalServiceUnavailable);
                }
                Err(_elapsed) => {
                    #[cfg(feature = "telemetry")]
                    warn!(timeout = ?self.ledger_timeout, "Ledger timed out, denying payment");
                    return Decision::Denied(DenialReason::ExternalServiceUnavailable);
                }
            }
        }
        Decision::Denied(first_denial.unwrap_or(DenialReason::AmountExceedsLimit))
    }

    async fn confirm(&self, approval: &Approval) -> Result<(), LedgerError> {
        match &approval.reservation {
            Some(reservation) => self.ledger.confirm(&reservation.id).await,
            None => Ok(()),
        }
    }

    async fn release(&self, approval: &Approval) -> Result<(), LedgerError> {
        match &approval.reservation {
            Some(reservation) => self.ledger.release(&reservation.id).await,
            None => Ok(()),
        }
    }
}
