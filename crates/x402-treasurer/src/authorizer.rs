//! From challenge to signed authorization.
//!
//! [`PaymentAuthorizer::authorize`] runs one short-lived state machine per 402:
//!
//! ```text
//! Idle -> ChallengeReceived -> PolicyEvaluating -> Approved -> Signing -> AuthorizationReady
//!                      \                     \                      \
//!                       `-> Denied            `-> Denied             `-> Denied
//! ```
//!
//! The states visited are returned as a trail on both outcomes. Nothing is kept
//! between invocations: every call gets its own nonce and its own reservation.
//!
//! A reservation taken during policy evaluation is either confirmed once the
//! header is ready or released on any failure. If the future is dropped while
//! signing, a guard spawns the release on the current runtime. A future dropped
//! inside the ledger call itself leaves the reservation to expire by TTL.

use alloy_primitives::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use x402_treasurer_types::proto::{
    AuthorizationCodecError, PaymentAuthorization, PaymentChallenge, PaymentIntent,
    PaymentRequirement,
};
use x402_treasurer_types::timestamp::UnixTimestamp;

use crate::challenge::{ChallengeParseError, parse_challenge};
use crate::nonce::NonceSource;
use crate::treasurer::{Approval, Decision, DenialReason, Treasurer};
use crate::wallet::{SigningError, Wallet};

#[cfg(feature = "telemetry")]
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthorizerState {
    Idle,
    ChallengeReceived,
    PolicyEvaluating,
    Approved,
    Signing,
    AuthorizationReady,
    Denied,
}

impl fmt::Display for AuthorizerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthorizerState::Idle => "idle",
            AuthorizerState::ChallengeReceived => "challenge_received",
            AuthorizerState::PolicyEvaluating => "policy_evaluating",
            AuthorizerState::Approved => "approved",
            AuthorizerState::Signing => "signing",
            AuthorizerState::AuthorizationReady => "authorization_ready",
            AuthorizerState::Denied => "denied",
        };
        f.write_str(s)
    }
}

/// States visited by one authorization attempt, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trail(Vec<AuthorizerState>);

impl Trail {
    fn new() -> Self {
        Self(vec![AuthorizerState::Idle])
    }

    fn enter(&mut self, state: AuthorizerState) {
        #[cfg(feature = "telemetry")]
        debug!(from = %self.current(), to = %state, "Authorizer transition");
        self.0.push(state);
    }

    pub fn current(&self) -> AuthorizerState {
        self.0.last().copied().unwrap_or(AuthorizerState::Idle)
    }

    pub fn states(&self) -> &[AuthorizerState] {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Denial {
    #[error("Malformed payment challenge: {0}")]
    MalformedChallenge(#[from] ChallengeParseError),
    #[error("Payment denied: {0}")]
    Policy(DenialReason),
    #[error("Failed to sign payment: {0}")]
    SigningFailed(#[source] SigningError),
    #[error(transparent)]
    Encoding(#[from] AuthorizationCodecError),
}

/// A denied authorization attempt.
#[derive(Debug, thiserror::Error)]
#[error("{denial}")]
pub struct AuthorizationDenied {
    pub denial: Denial,
    pub trail: Trail,
}

/// A signed authorization ready to be attached to the retried request.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub authorization: PaymentAuthorization,
    pub header_value: HeaderValue,
    pub trail: Trail,
}

impl Authorization {
    pub fn header_name(&self) -> &'static str {
        self.authorization.header_name()
    }

    pub fn requirement(&self) -> &PaymentRequirement {
        &self.authorization.accepted
    }
}

/// Releases an approval's reservation unless disarmed.
struct ReleaseOnDrop {
    treasurer: Arc<dyn Treasurer>,
    approval: Option<Approval>,
}

impl ReleaseOnDrop {
    fn new(treasurer: Arc<dyn Treasurer>, approval: Approval) -> Self {
        Self {
            treasurer,
            approval: Some(approval),
        }
    }

    fn disarm(mut self) -> Option<Approval> {
        self.approval.take()
    }

    async fn release(mut self) {
        if let Some(approval) = self.approval.take() {
            let _result = self.treasurer.release(&approval).await;
            #[cfg(feature = "telemetry")]
            if let Err(e) = _result {
                warn!(error = %e, "Failed to release reservation");
            }
        }
    }
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        let Some(approval) = self.approval.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let treasurer = self.treasurer.clone();
            handle.spawn(async move {
                let _ = treasurer.release(&approval).await;
            });
        }
    }
}

/// Turns 402 challenges into signed authorization headers.
#[derive(Clone)]
pub struct PaymentAuthorizer {
    wallet: Arc<dyn Wallet>,
    treasurer: Arc<dyn Treasurer>,
    nonces: Arc<NonceSource>,
    authorization_ttl: Duration,
    signing_timeout: Duration,
}

impl fmt::Debug for PaymentAuthorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentAuthorizer")
            .field("payer", &self.wallet.payer())
            .field("authorization_ttl", &self.authorization_ttl)
            .field("signing_timeout", &self.signing_timeout)
            .finish()
    }
}

impl PaymentAuthorizer {
    pub const DEFAULT_AUTHORIZATION_TTL: Duration = Duration::from_secs(60);
    pub const DEFAULT_SIGNING_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(wallet: Arc<dyn Wallet>, treasurer: Arc<dyn Treasurer>) -> Self {
        Self {
            wallet,
            treasurer,
            nonces: Arc::new(NonceSource::new()),
            authorization_ttl: Self::DEFAULT_AUTHORIZATION_TTL,
            signing_timeout: Self::DEFAULT_SIGNING_TIMEOUT,
        }
    }

    /// How long a signed intent stays valid, before requirement caps apply.
    pub fn with_authorization_ttl(mut self, ttl: Duration) -> Self {
        self.authorization_ttl = ttl;
        self
    }

    pub fn with_signing_timeout(mut self, timeout: Duration) -> Self {
        self.signing_timeout = timeout;
        self
    }

    /// Shares a nonce source, e.g. between several authorizers of one wallet.
    pub fn with_nonce_source(mut self, nonces: Arc<NonceSource>) -> Self {
        self.nonces = nonces;
        self
    }

    pub fn wallet(&self) -> &Arc<dyn Wallet> {
        &self.wallet
    }

    /// Parses a raw 402 response and authorizes it.
    pub async fn authorize_response(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Authorization, AuthorizationDenied> {
        let mut trail = Trail::new();
        match parse_challenge(status, headers, body) {
            Ok(challenge) => self.run(&challenge, trail).await,
            Err(e) => {
                trail.enter(AuthorizerState::Denied);
                Err(AuthorizationDenied {
                    denial: Denial::MalformedChallenge(e),
                    trail,
                })
            }
        }
    }

    pub async fn authorize(
        &self,
        challenge: &PaymentChallenge,
    ) -> Result<Authorization, AuthorizationDenied> {
        self.run(challenge, Trail::new()).await
    }

    #[cfg_attr(
        feature = "telemetry",
        instrument(
            name = "x402.authorizer.authorize",
            skip_all,
            fields(payer = %self.wallet.payer(), version = %challenge.version())
        )
    )]
    async fn run(
        &self,
        challenge: &PaymentChallenge,
        mut trail: Trail,
    ) -> Result<Authorization, AuthorizationDenied> {
        trail.enter(AuthorizerState::ChallengeReceived);
        trail.enter(AuthorizerState::PolicyEvaluating);
        let approval = match self.treasurer.evaluate(challenge).await {
            Decision::Approved(approval) => approval,
            Decision::Denied(reason) => {
                #[cfg(feature = "telemetry")]
                debug!(%reason, "Payment denied by treasurer");
                return deny(trail, Denial::Policy(reason));
            }
        };
        trail.enter(AuthorizerState::Approved);
        let requirement = approval.requirement.clone();
        let guard = ReleaseOnDrop::new(self.treasurer.clone(), approval);

        trail.enter(AuthorizerState::Signing);
        let (authorization, header_value) = match self.sign(challenge, &requirement).await {
            Ok(signed) => signed,
            Err(denial) => {
                #[cfg(feature = "telemetry")]
                warn!(error = %denial, "Authorization failed, releasing reservation");
                guard.release().await;
                return deny(trail, denial);
            }
        };

        if let Some(approval) = guard.disarm()
            && let Err(_e) = self.treasurer.confirm(&approval).await
        {
            #[cfg(feature = "telemetry")]
            warn!(error = %_e, "Failed to confirm reservation, denying payment");
            let _ = self.treasurer.release(&approval).await;
            return deny(
                trail,
                Denial::Policy(DenialReason::ExternalServiceUnavailable),
            );
        }

        trail.enter(AuthorizerState::AuthorizationReady);
        Ok(Authorization {
            authorization,
            header_value,
            trail,
        })
    }

    async fn sign(
        &self,
        challenge: &PaymentChallenge,
        requirement: &PaymentRequirement,
    ) -> Result<(PaymentAuthorization, HeaderValue), Denial> {
        let issued_at = UnixTimestamp::now();
        let valid_before = self.valid_before(issued_at, requirement);
        // The requirement may lapse between policy evaluation and signing.
        if valid_before <= issued_at {
            return Err(Denial::Policy(DenialReason::RequirementExpired));
        }
        let intent = PaymentIntent::new(
            requirement,
            self.wallet.payer(),
            self.wallet.signer(),
            self.nonces.next(self.wallet.payer()),
            issued_at,
            valid_before,
        );
        let message = intent
            .canonical_bytes()
            .map_err(|e| Denial::SigningFailed(SigningError::Encoding(e)))?;
        let signature = tokio::time::timeout(self.signing_timeout, self.wallet.sign(&message))
            .await
            .map_err(|_| Denial::SigningFailed(SigningError::Timeout(self.signing_timeout)))?
            .map_err(Denial::SigningFailed)?;
        let authorization = PaymentAuthorization::new(
            challenge.version(),
            requirement.clone(),
            intent,
            Bytes::from(signature.as_bytes().to_vec()),
        );
        let header_value = authorization.to_header_value()?;
        Ok((authorization, header_value))
    }

    /// `issued_at + ttl`, capped by the requirement's `validUntil` and `maxTimeoutSeconds`.
    fn valid_before(
        &self,
        issued_at: UnixTimestamp,
        requirement: &PaymentRequirement,
    ) -> UnixTimestamp {
        let mut valid_before = issued_at + self.authorization_ttl;
        if let Some(max_timeout) = requirement.max_timeout_seconds {
            valid_before = valid_before.min(issued_at + max_timeout);
        }
        if let Some(valid_until) = requirement.valid_until {
            valid_before = valid_before.min(valid_until);
        }
        valid_before
    }
}

fn deny<T>(mut trail: Trail, denial: Denial) -> Result<T, AuthorizationDenied> {
    trail.enter(AuthorizerState::Denied);
    Err(AuthorizationDenied { denial, trail })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerError, LocalLedger, SpendLimit};
    use crate::treasurer::tests::{challenge, requirement};
    use crate::treasurer::{LimitTreasurer, NaiveTreasurer};
    use crate::wallet::AccountWallet;
    use alloy_primitives::{Address, Signature};
    use alloy_signer_local::PrivateKeySigner;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use x402_treasurer_types::networks::Network;
    use x402_treasurer_types::proto::{TokenAmount, X402Version};

    struct StuckWallet(Address);

    #[async_trait::async_trait]
    impl Wallet for StuckWallet {
        fn payer(&self) -> Address {
            self.0
        }
        fn signer(&self) -> Address {
            self.0
        }
        fn supports_scheme(&self, _: &str) -> bool {
            true
        }
        fn supports_network(&self, _: &Network) -> bool {
            true
        }
        async fn sign(&self, _: &[u8]) -> Result<Signature, SigningError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(SigningError::Unavailable("never".into()))
        }
    }

    fn limited(ceiling: u64) -> (Arc<AccountWallet>, Arc<LocalLedger>, PaymentAuthorizer) {
        let wallet = Arc::new(AccountWallet::new(PrivateKeySigner::random()));
        let ledger = Arc::new(LocalLedger::new(SpendLimit::ceiling(ceiling)));
        let treasurer = LimitTreasurer::new(wallet.clone(), ledger.clone());
        let authorizer = PaymentAuthorizer::new(wallet.clone(), Arc::new(treasurer));
        (wallet, ledger, authorizer)
    }

    #[tokio::test]
    async fn test_within_limit_signs_and_commits() {
        let (wallet, ledger, authorizer) = limited(5_000);
        let req = requirement("base-sepolia", "0xA", 1_000);
        let authorization = authorizer.authorize(&challenge(vec![req.clone()])).await.unwrap();

        assert_eq!(authorization.header_name(), "X-PAYMENT");
        assert_eq!(
            authorization.trail.states(),
            &[
                AuthorizerState::Idle,
                AuthorizerState::ChallengeReceived,
                AuthorizerState::PolicyEvaluating,
                AuthorizerState::Approved,
                AuthorizerState::Signing,
                AuthorizerState::AuthorizationReady,
            ]
        );
        let decoded =
            PaymentAuthorization::from_header_value(&authorization.header_value).unwrap();
        assert_eq!(decoded.accepted, req);
        assert_eq!(decoded.payer(), wallet.payer());
        assert!(decoded.intent().binds(&req));

        let message = decoded.intent().canonical_bytes().unwrap();
        let signature = Signature::from_raw(decoded.signature()).unwrap();
        assert_eq!(
            signature.recover_address_from_msg(&message).unwrap(),
            wallet.signer()
        );

        let snapshot = ledger.snapshot(wallet.payer(), &req.network, &req.asset);
        assert_eq!(snapshot.committed, TokenAmount::from(1_000));
        assert_eq!(snapshot.outstanding_reservations, 0);
    }

    #[tokio::test]
    async fn test_over_limit_denied_without_reservation() {
        let (wallet, ledger, authorizer) = limited(500);
        let req = requirement("base-sepolia", "0xA", 1_000);
        let denied = authorizer
            .authorize(&challenge(vec![req.clone()]))
            .await
            .unwrap_err();
        assert!(matches!(
            denied.denial,
            Denial::Policy(DenialReason::AmountExceedsLimit)
        ));
        assert_eq!(denied.trail.current(), AuthorizerState::Denied);
        assert!(!denied.trail.states().contains(&AuthorizerState::Signing));
        let snapshot = ledger.snapshot(wallet.payer(), &req.network, &req.asset);
        assert_eq!(snapshot.outstanding_reservations, 0);
        assert_eq!(snapshot.committed, TokenAmount::ZERO);
    }

    #[tokio::test]
    async fn test_malformed_challenge_skips_policy() {
        let (_, _, authorizer) = limited(5_000);
        let denied = authorizer
            .authorize_response(StatusCode::PAYMENT_REQUIRED, &HeaderMap::new(), b"{}")
            .await
            .unwrap_err();
        assert!(matches!(
            denied.denial,
            Denial::MalformedChallenge(ChallengeParseError::Malformed(_))
        ));
        assert_eq!(
            denied.trail.states(),
            &[AuthorizerState::Idle, AuthorizerState::Denied]
        );
    }

    #[tokio::test]
    async fn test_v2_challenge_uses_signature_header() {
        let wallet = Arc::new(AccountWallet::new(PrivateKeySigner::random()));
        let authorizer =
            PaymentAuthorizer::new(wallet.clone(), Arc::new(NaiveTreasurer::new(wallet)));
        let challenge = PaymentChallenge::new(
            X402Version::V2,
            vec![requirement("eip155:8453", "0xA", 10)],
        )
        .unwrap();
        let authorization = authorizer.authorize(&challenge).await.unwrap();
        assert_eq!(authorization.header_name(), "PAYMENT-SIGNATURE");
    }

    #[tokio::test]
    async fn test_validity_window_is_capped() {
        let (_, _, authorizer) = limited(5_000);
        let authorizer = authorizer.with_authorization_ttl(Duration::from_secs(600));
        let req = requirement("base-sepolia", "0xA", 1).with_max_timeout_seconds(30);
        let authorization = authorizer.authorize(&challenge(vec![req])).await.unwrap();
        let intent = authorization.authorization.intent();
        assert_eq!(intent.valid_before, intent.issued_at + 30);

        let until = UnixTimestamp::now() + 5;
        let req = requirement("base-sepolia", "0xA", 1).with_valid_until(until);
        let authorization = authorizer.authorize(&challenge(vec![req])).await.unwrap();
        assert_eq!(authorization.authorization.intent().valid_before, until);
    }

    #[tokio::test]
    async fn test_expired_requirement_commits_nothing() {
        let (wallet, ledger, authorizer) = limited(5_000);
        let lapsed = requirement("base-sepolia", "0xA", 1_000)
            .with_valid_until(UnixTimestamp::from_secs(UnixTimestamp::now().as_secs() - 10));
        let no_window = requirement("base-sepolia", "0xA", 1_000).with_max_timeout_seconds(0);
        for req in [lapsed, no_window] {
            let denied = authorizer
                .authorize(&challenge(vec![req.clone()]))
                .await
                .unwrap_err();
            assert!(matches!(
                denied.denial,
                Denial::Policy(DenialReason::RequirementExpired)
            ));
            assert!(!denied.trail.states().contains(&AuthorizerState::Signing));
            let snapshot = ledger.snapshot(wallet.payer(), &req.network, &req.asset);
            assert_eq!(snapshot.committed, TokenAmount::ZERO);
            assert_eq!(snapshot.outstanding_reservations, 0);
        }
    }

    /// Approves whatever it is shown, counting releases.
    #[derive(Default)]
    struct ApproveAll {
        released: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Treasurer for ApproveAll {
        async fn evaluate(&self, challenge: &PaymentChallenge) -> Decision {
            Decision::Approved(Approval {
                requirement: challenge.accepts()[0].clone(),
                reservation: None,
            })
        }

        async fn confirm(&self, _: &Approval) -> Result<(), LedgerError> {
            Ok(())
        }

        async fn release(&self, _: &Approval) -> Result<(), LedgerError> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_requirement_lapsed_after_approval_is_released() {
        let wallet = Arc::new(AccountWallet::new(PrivateKeySigner::random()));
        let treasurer = Arc::new(ApproveAll::default());
        let authorizer = PaymentAuthorizer::new(wallet, treasurer.clone());
        let req =
            requirement("base-sepolia", "0xA", 1).with_valid_until(UnixTimestamp::from_secs(1));
        let denied = authorizer
            .authorize(&challenge(vec![req]))
            .await
            .unwrap_err();
        assert!(matches!(
            denied.denial,
            Denial::Policy(DenialReason::RequirementExpired)
        ));
        assert!(denied.trail.states().contains(&AuthorizerState::Signing));
        assert_eq!(treasurer.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_nonces_never_repeat() {
        let (_, _, authorizer) = limited(5_000);
        let challenge = challenge(vec![requirement("base-sepolia", "0xA", 1)]);
        let a = authorizer.authorize(&challenge).await.unwrap();
        let b = authorizer.authorize(&challenge).await.unwrap();
        assert_ne!(a.authorization.nonce(), b.authorization.nonce());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signing_timeout_releases_reservation() {
        let wallet = Arc::new(StuckWallet(Address::repeat_byte(3)));
        let ledger = Arc::new(LocalLedger::new(SpendLimit::ceiling(5_000u64)));
        let treasurer = LimitTreasurer::new(wallet.clone(), ledger.clone());
        let authorizer = PaymentAuthorizer::new(wallet.clone(), Arc::new(treasurer))
            .with_signing_timeout(Duration::from_millis(100));
        let req = requirement("base-sepolia", "0xA", 1_000);
        let denied = authorizer
            .authorize(&challenge(vec![req.clone()]))
            .await
            .unwrap_err();
        assert!(matches!(
            denied.denial,
            Denial::SigningFailed(SigningError::Timeout(_))
        ));
        let snapshot = ledger.snapshot(wallet.payer(), &req.network, &req.asset);
        assert_eq!(snapshot.outstanding_reservations, 0);
        assert_eq!(snapshot.reserved, TokenAmount::ZERO);
    }

    #[tokio::test]
    async fn test_cancelled_signing_releases_reservation() {
        let wallet = Arc::new(StuckWallet(Address::repeat_byte(4)));
        let ledger = Arc::new(LocalLedger::new(SpendLimit::ceiling(5_000u64)));
        let treasurer = LimitTreasurer::new(wallet.clone(), ledger.clone());
        let authorizer = PaymentAuthorizer::new(wallet.clone(), Arc::new(treasurer));
        let req = requirement("base-sepolia", "0xA", 1_000);
        let challenge = challenge(vec![req.clone()]);

        let attempt = tokio::time::timeout(
            Duration::from_millis(50),
            authorizer.authorize(&challenge),
        )
        .await;
        assert!(attempt.is_err());
        // The guard's release runs as its own task.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let snapshot = ledger.snapshot(wallet.payer(), &req.network, &req.asset);
        assert_eq!(snapshot.outstanding_reservations, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_authorizations_single_approval() {
        let (_, _, authorizer) = limited(1_000);
        let challenge = challenge(vec![requirement("base-sepolia", "0xA", 1_000)]);
        let handles: Vec<_> = (0..12)
            .map(|_| {
                let authorizer = authorizer.clone();
                let challenge = challenge.clone();
                tokio::spawn(async move { authorizer.authorize(&challenge).await })
            })
            .collect();
        let mut approved = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => approved += 1,
                Err(denied) => assert!(matches!(
                    denied.denial,
                    Denial::Policy(DenialReason::AmountExceedsLimit)
                )),
            }
        }
        assert_eq!(approved, 1);
    }
}
