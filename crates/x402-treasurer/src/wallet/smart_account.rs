use alloy_primitives::{Address, Signature};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use std::sync::Arc;
use x402_treasurer_types::networks::Network;
use x402_treasurer_types::timestamp::UnixTimestamp;

use super::{SigningError, SupportedMethods, Wallet};

#[cfg(feature = "telemetry")]
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum SessionValidationError {
    /// The session key has been revoked or has expired.
    #[error("{0}")]
    Invalid(String),
    /// Validity could not be determined.
    #[error("{0}")]
    Unavailable(String),
}

/// Decides whether a session key may still sign for a smart account.
///
/// The on-chain check belongs to the smart-account infrastructure; implementations
/// only ask it.
#[async_trait::async_trait]
pub trait SessionValidator: Send + Sync {
    async fn validate(&self, account: Address, session_key: Address)
    -> Result<(), SessionValidationError>;
}

/// Accepts every session key.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysValid;

#[async_trait::async_trait]
impl SessionValidator for AlwaysValid {
    async fn validate(&self, _: Address, _: Address) -> Result<(), SessionValidationError> {
        Ok(())
    }
}

/// A session key granted until a fixed instant.
#[derive(Debug, Clone, Copy)]
pub struct SessionWindow {
    pub valid_until: UnixTimestamp,
}

#[async_trait::async_trait]
impl SessionValidator for SessionWindow {
    async fn validate(
        &self,
        account: Address,
        session_key: Address,
    ) -> Result<(), SessionValidationError> {
        if UnixTimestamp::now() >= self.valid_until {
            return Err(SessionValidationError::Invalid(format!(
                "session key {session_key} for {account} expired at {}",
                self.valid_until
            )));
        }
        Ok(())
    }
}

/// A smart account operated through a delegated session key.
///
/// The smart-account address is the payer and the session key is the signer, so
/// every signed intent names both.
#[derive(Clone)]
pub struct SmartAccountWallet {
    account: Address,
    session_key: Arc<PrivateKeySigner>,
    validator: Arc<dyn SessionValidator>,
    methods: SupportedMethods,
}

impl std::fmt::Debug for SmartAccountWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartAccountWallet")
            .field("account", &self.account)
            .field("session_key", &self.session_key.address())
            .field("methods", &self.methods)
            .finish()
    }
}

impl SmartAccountWallet {
    pub fn new(account: Address, session_key: PrivateKeySigner) -> Self {
        Self {
            account,
            session_key: Arc::new(session_key),
            validator: Arc::new(AlwaysValid),
            methods: SupportedMethods::default(),
        }
    }

    pub fn with_validator<V: SessionValidator + 'static>(mut self, validator: V) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    pub fn with_methods(mut self, methods: SupportedMethods) -> Self {
        self.methods = methods;
        self
    }
}

#[async_trait::async_trait]
impl Wallet for SmartAccountWallet {
    fn payer(&self) -> Address {
        self.account
    }

    fn signer(&self) -> Address {
        self.session_key.address()
    }

    fn supports_scheme(&self, scheme: &str) -> bool {
        self.methods.supports_scheme(scheme)
    }

    fn supports_network(&self, network: &Network) -> bool {
        self.methods.supports_network(network)
    }

    async fn sign(&self, message: &[u8]) -> Result<Signature, SigningError> {
        let session_key = self.session_key.address();
        self.validator
            .validate(self.account, session_key)
            .await
            .map_err(|e| {
                #[cfg(feature = "telemetry")]
                warn!(account = %self.account, %session_key, error = %e, "Session key rejected");
                match e {
                    SessionValidationError::Invalid(reason) => SigningError::SessionInvalid(reason),
                    SessionValidationError::Unavailable(reason) => {
                        SigningError::Unavailable(reason)
                    }
                }
            })?;
        Ok(self.session_key.sign_message(message).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    const ACCOUNT: Address = address!("0x2222222222222222222222222222222222222222");

    struct Unreachable;

    #[async_trait::async_trait]
    impl SessionValidator for Unreachable {
        async fn validate(&self, _: Address, _: Address) -> Result<(), SessionValidationError> {
            Err(SessionValidationError::Unavailable("bundler down".into()))
        }
    }

    #[tokio::test]
    async fn test_payer_is_account_and_signature_is_session_key() {
        let wallet = SmartAccountWallet::new(ACCOUNT, PrivateKeySigner::random());
        assert_eq!(wallet.payer(), ACCOUNT);
        assert_ne!(wallet.signer(), ACCOUNT);
        let signature = wallet.sign(b"intent").await.unwrap();
        assert_eq!(
            signature.recover_address_from_msg(b"intent").unwrap(),
            wallet.signer()
        );
    }

    #[tokio::test]
    async fn test_expired_session_window() {
        let wallet = SmartAccountWallet::new(ACCOUNT, PrivateKeySigner::random())
            .with_validator(SessionWindow {
                valid_until: UnixTimestamp::from_secs(1),
            });
        assert!(matches!(
            wallet.sign(b"intent").await,
            Err(SigningError::SessionInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_validator_unavailable() {
        let wallet = SmartAccountWallet::new(ACCOUNT, PrivateKeySigner::random())
            .with_validator(Unreachable);
        assert!(matches!(
            wallet.sign(b"intent").await,
            Err(SigningError::Unavailable(_))
        ));
    }
}
