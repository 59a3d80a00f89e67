//! Signing capability.
//!
//! A [`Wallet`] owns an identity and signs the canonical bytes of a
//! [`PaymentIntent`](x402_treasurer_types::proto::PaymentIntent). It is shared
//! read-only by every request in flight, so implementations keep no mutable state.

use alloy_primitives::{Address, Signature};
use std::time::Duration;
use x402_treasurer_types::networks::{Network, known_evm_networks};
use x402_treasurer_types::proto::PaymentRequirement;

mod account;
mod smart_account;

pub use account::*;
pub use smart_account::*;

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    /// The session key is no longer authorized to act for the smart account.
    #[error("Session key is not authorized: {0}")]
    SessionInvalid(String),
    /// The session validity check could not be completed.
    #[error("Signing unavailable: {0}")]
    Unavailable(String),
    #[error("Signer failed: {0}")]
    Signer(#[from] alloy_signer::Error),
    #[error("Failed to encode payment intent: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Signing timed out after {0:?}")]
    Timeout(Duration),
}

/// A signing identity.
///
/// `payer` is the account funds come from; `signer` is the key whose signature
/// appears on the authorization. They differ for smart accounts.
#[async_trait::async_trait]
pub trait Wallet: Send + Sync {
    fn payer(&self) -> Address;

    fn signer(&self) -> Address;

    fn supports_scheme(&self, scheme: &str) -> bool;

    fn supports_network(&self, network: &Network) -> bool;

    /// Whether the wallet can pay `requirement` at all.
    fn supports(&self, requirement: &PaymentRequirement) -> bool {
        self.supports_scheme(&requirement.scheme) && self.supports_network(&requirement.network)
    }

    /// Signs `message` as an EIP-191 personal message.
    async fn sign(&self, message: &[u8]) -> Result<Signature, SigningError>;
}

/// Schemes and networks a wallet is willing to pay on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedMethods {
    pub schemes: Vec<String>,
    pub networks: Vec<Network>,
}

impl Default for SupportedMethods {
    /// The `exact` scheme on every known EVM network.
    fn default() -> Self {
        Self {
            schemes: vec!["exact".to_string()],
            networks: known_evm_networks(),
        }
    }
}

impl SupportedMethods {
    pub fn new<S, N>(schemes: S, networks: N) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        N: IntoIterator,
        N::Item: Into<Network>,
    {
        Self {
            schemes: schemes.into_iter().map(Into::into).collect(),
            networks: networks.into_iter().map(Into::into).collect(),
        }
    }

    pub fn supports_scheme(&self, scheme: &str) -> bool {
        self.schemes.iter().any(|s| s == scheme)
    }

    pub fn supports_network(&self, network: &Network) -> bool {
        self.networks.contains(network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_methods() {
        let methods = SupportedMethods::default();
        assert!(methods.supports_scheme("exact"));
        assert!(!methods.supports_scheme("upto"));
        assert!(methods.supports_network(&Network::new("eip155:84532")));
        assert!(!methods.supports_network(&Network::new("solana")));
    }
}
