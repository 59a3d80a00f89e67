//! Server-side verification of payment authorizations.
//!
//! [`ReplayGuard`] accepts each `(signer, nonce)` pair once. Before recording the
//! pair it checks that the signature recovers to the intent's signer, that this
//! signer may act for the intent's payer, that the intent has not expired and
//! that it commits to exactly the `accepted` requirement. Pairs are forgotten
//! once their intent has expired, since an expired intent is refused anyway.
//!
//! A payer always signs for itself. Any other signer needs a grant from the
//! guard's [`SignerAuthority`], for example a smart-account session key listed
//! in [`SessionGrants`].

use alloy_primitives::{Address, B256, Signature, SignatureError};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use http::HeaderValue;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use x402_treasurer_types::proto::{AuthorizationCodecError, PaymentAuthorization};
use x402_treasurer_types::timestamp::UnixTimestamp;

#[cfg(feature = "telemetry")]
use tracing::{debug, instrument};

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error(transparent)]
    Decode(#[from] AuthorizationCodecError),
    #[error("Failed to encode payment intent: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),
    #[error("Signature recovers to {recovered}, intent names signer {expected}")]
    SignerMismatch { expected: Address, recovered: Address },
    #[error("Authorization expired at {0}")]
    Expired(UnixTimestamp),
    #[error("Signed intent does not match the accepted requirement")]
    IntentMismatch,
    #[error("{signer} may not sign for {payer}")]
    UnauthorizedSigner { payer: Address, signer: Address },
    #[error("Nonce {nonce} already used by {signer}")]
    NonceAlreadyUsed { signer: Address, nonce: B256 },
}

/// Decides whether a key other than the payer may sign the payer's intents.
pub trait SignerAuthority: Send + Sync {
    fn may_sign_for(&self, payer: Address, signer: Address) -> bool;
}

/// Grants no delegation: every intent must be signed by its payer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfSignedOnly;

impl SignerAuthority for SelfSignedOnly {
    fn may_sign_for(&self, _: Address, _: Address) -> bool {
        false
    }
}

/// Session keys known to act for smart accounts.
#[derive(Debug, Default)]
pub struct SessionGrants {
    grants: DashSet<(Address, Address)>,
}

impl SessionGrants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, account: Address, session_key: Address) {
        self.grants.insert((account, session_key));
    }

    pub fn revoke(&self, account: Address, session_key: Address) {
        self.grants.remove(&(account, session_key));
    }
}

impl SignerAuthority for SessionGrants {
    fn may_sign_for(&self, payer: Address, signer: Address) -> bool {
        self.grants.contains(&(payer, signer))
    }
}

impl<T: SignerAuthority + ?Sized> SignerAuthority for Arc<T> {
    fn may_sign_for(&self, payer: Address, signer: Address) -> bool {
        (**self).may_sign_for(payer, signer)
    }
}

/// An authorization that passed every check and has been recorded.
#[derive(Debug, Clone)]
pub struct VerifiedPayment {
    pub authorization: PaymentAuthorization,
    pub signer: Address,
}

impl VerifiedPayment {
    pub fn payer(&self) -> Address {
        self.authorization.payer()
    }

    pub fn nonce(&self) -> B256 {
        self.authorization.nonce()
    }
}

pub struct ReplayGuard {
    used: DashMap<(Address, B256), UnixTimestamp>,
    checks: AtomicU64,
    authority: Box<dyn SignerAuthority>,
}

impl fmt::Debug for ReplayGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayGuard")
            .field("used", &self.used.len())
            .finish()
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self {
            used: DashMap::new(),
            checks: AtomicU64::new(0),
            authority: Box::new(SelfSignedOnly),
        }
    }
}

impl ReplayGuard {
    /// Every this many checks, expired entries are dropped.
    const PRUNE_EVERY: u64 = 256;

    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts intents signed by keys `authority` lets act for their payer.
    pub fn with_authority<A: SignerAuthority + 'static>(mut self, authority: A) -> Self {
        self.authority = Box::new(authority);
        self
    }

    /// Decodes a `X-PAYMENT` / `PAYMENT-SIGNATURE` header value and checks it.
    pub fn check_header(&self, value: &HeaderValue) -> Result<VerifiedPayment, SettlementError> {
        let authorization = PaymentAuthorization::from_header_value(value)?;
        self.check(authorization)
    }

    pub fn check(
        &self,
        authorization: PaymentAuthorization,
    ) -> Result<VerifiedPayment, SettlementError> {
        self.check_at(authorization, UnixTimestamp::now())
    }

    #[cfg_attr(
        feature = "telemetry",
        instrument(
            name = "x402.settlement.check",
            skip_all,
            fields(
                payer = %authorization.payer(),
                signer = %authorization.intent().signer,
                nonce = %authorization.nonce()
            )
        )
    )]
    fn check_at(
        &self,
        authorization: PaymentAuthorization,
        now: UnixTimestamp,
    ) -> Result<VerifiedPayment, SettlementError> {
        let intent = authorization.intent();
        let message = intent.canonical_bytes()?;
        let signature = Signature::from_raw(authorization.signature())?;
        let recovered = signature.recover_address_from_msg(&message)?;
        if recovered != intent.signer {
            return Err(SettlementError::SignerMismatch {
                expected: intent.signer,
                recovered,
            });
        }
        if intent.payer != intent.signer
            && !self.authority.may_sign_for(intent.payer, intent.signer)
        {
            #[cfg(feature = "telemetry")]
            debug!("Rejected authorization from a signer without a grant");
            return Err(SettlementError::UnauthorizedSigner {
                payer: intent.payer,
                signer: intent.signer,
            });
        }
        if intent.is_expired_at(now) {
            return Err(SettlementError::Expired(intent.valid_before));
        }
        if !intent.binds(&authorization.accepted) {
            return Err(SettlementError::IntentMismatch);
        }

        if self.checks.fetch_add(1, Ordering::Relaxed) % Self::PRUNE_EVERY == 0 {
            self.prune(now);
        }
        match self.used.entry((intent.signer, intent.nonce)) {
            Entry::Occupied(_) => {
                #[cfg(feature = "telemetry")]
                debug!("Rejected replayed authorization");
                Err(SettlementError::NonceAlreadyUsed {
                    signer: intent.signer,
                    nonce: intent.nonce,
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(intent.valid_before);
                Ok(VerifiedPayment {
                    authorization,
                    signer: recovered,
                })
            }
        }
    }

    /// Forgets nonces of intents expired at `now`.
    pub fn prune(&self, now: UnixTimestamp) {
        self.used.retain(|_, valid_before| now < *valid_before);
    }

    /// Number of nonces currently remembered.
    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}
