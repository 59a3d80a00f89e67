//! Spend policy.
//!
//! A [`Treasurer`] looks at a challenge and either approves exactly one of its
//! requirements or denies it with a [`DenialReason`]. Approval may hold a ledger
//! reservation, which the caller must later [`confirm`](Treasurer::confirm) once
//! the authorization is signed or [`release`](Treasurer::release) if it is not.

use serde::{Deserialize, Serialize};
use std::fmt;
use x402_treasurer_types::networks::Network;
use x402_treasurer_types::proto::{PaymentChallenge, PaymentRequirement, TokenAmount};
use x402_treasurer_types::timestamp::UnixTimestamp;

use crate::ledger::{LedgerError, Reservation};
use crate::wallet::Wallet;

mod limit;
mod naive;

pub use limit::*;
pub use naive::*;

/// Why a payment was not approved. Serialized in snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NoSupportedMethod,
    AmountExceedsLimit,
    RecipientNotAllowed,
    NetworkUnsupported,
    /// Every remaining requirement had already lapsed when it was evaluated.
    RequirementExpired,
    ExternalServiceUnavailable,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::NoSupportedMethod => "no_supported_method",
            DenialReason::AmountExceedsLimit => "amount_exceeds_limit",
            DenialReason::RecipientNotAllowed => "recipient_not_allowed",
            DenialReason::NetworkUnsupported => "network_unsupported",
            DenialReason::RequirementExpired => "requirement_expired",
            DenialReason::ExternalServiceUnavailable => "external_service_unavailable",
        }
    }

    /// Reads a reason code as sent by a remote ledger, in snake_case or kebab-case.
    pub fn from_code(code: &str) -> Option<Self> {
        let normalized = code.trim().to_ascii_lowercase().replace('-', "_");
        [
            DenialReason::NoSupportedMethod,
            DenialReason::AmountExceedsLimit,
            DenialReason::RecipientNotAllowed,
            DenialReason::NetworkUnsupported,
            DenialReason::RequirementExpired,
            DenialReason::ExternalServiceUnavailable,
        ]
        .into_iter()
        .find(|reason| reason.as_str() == normalized)
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An approved requirement, with the ledger reservation backing it if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Approval {
    pub requirement: PaymentRequirement,
    pub reservation: Option<Reservation>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Approved(Approval),
    Denied(DenialReason),
}

#[async_trait::async_trait]
pub trait Treasurer: Send + Sync {
    async fn evaluate(&self, challenge: &PaymentChallenge) -> Decision;

    /// Commits the spend held by `approval`.
    async fn confirm(&self, approval: &Approval) -> Result<(), LedgerError>;

    /// Returns the spend held by `approval`.
    async fn release(&self, approval: &Approval) -> Result<(), LedgerError>;
}

/// Static bounds every approved requirement must satisfy.
///
/// Empty/`None` fields impose no bound.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpendPolicy {
    /// Networks payments may settle on, on top of what the wallet supports.
    pub networks: Option<Vec<Network>>,
    /// Recipients that may be paid. Compared case-insensitively.
    pub allowed_recipients: Option<Vec<String>>,
    pub max_amount_per_payment: Option<TokenAmount>,
}

impl SpendPolicy {
    fn allows_network(&self, network: &Network) -> bool {
        self.networks
            .as_ref()
            .is_none_or(|networks| networks.contains(network))
    }

    fn allows_recipient(&self, requirement: &PaymentRequirement) -> bool {
        self.allowed_recipients
            .as_ref()
            .is_none_or(|allowed| allowed.iter().any(|r| requirement.pays_to(r)))
    }

    fn allows_amount(&self, amount: TokenAmount) -> bool {
        self.max_amount_per_payment.is_none_or(|max| amount <= max)
    }

    /// Requirements of `challenge` that `wallet` can pay within these bounds, in server order.
    ///
    /// Filters one criterion at a time, and names the criterion that removed the last
    /// candidate when nothing survives.
    pub fn candidates<'a>(
        &self,
        wallet: &dyn Wallet,
        challenge: &'a PaymentChallenge,
    ) -> Result<Vec<&'a PaymentRequirement>, DenialReason> {
        self.candidates_at(wallet, challenge, UnixTimestamp::now())
    }

    /// [`candidates`](Self::candidates) as evaluated at `now`.
    pub fn candidates_at<'a>(
        &self,
        wallet: &dyn Wallet,
        challenge: &'a PaymentChallenge,
        now: UnixTimestamp,
    ) -> Result<Vec<&'a PaymentRequirement>, DenialReason> {
        let candidates = non_empty(
            challenge
                .accepts()
                .iter()
                .filter(|r| wallet.supports_scheme(&r.scheme))
                .collect(),
            DenialReason::NoSupportedMethod,
        )?;
        let candidates = non_empty(
            candidates
                .into_iter()
                .filter(|r| wallet.supports(r) && self.allows_network(&r.network))
                .collect(),
            DenialReason::NetworkUnsupported,
        )?;
        let candidates = non_empty(
            candidates
                .into_iter()
                .filter(|r| self.allows_recipient(r))
                .collect(),
            DenialReason::RecipientNotAllowed,
        )?;
        let candidates = non_empty(
            candidates
                .into_iter()
                .filter(|r| !r.is_expired_at(now))
                .collect(),
            DenialReason::RequirementExpired,
        )?;
        non_empty(
            candidates
                .into_iter()
                .filter(|r| self.allows_amount(r.amount))
                .collect(),
            DenialReason::AmountExceedsLimit,
        )
    }
}

fn non_empty<T>(items: Vec<T>, reason: DenialReason) -> Result<Vec<T>, DenialReason> {
    if items.is_empty() {
        Err(reason)
    } else {
        Ok(items)
    }
}
