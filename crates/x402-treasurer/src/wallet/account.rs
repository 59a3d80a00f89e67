use alloy_primitives::{Address, Signature};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use std::sync::Arc;
use x402_treasurer_types::networks::Network;

use super::{SigningError, SupportedMethods, Wallet};

/// A wallet backed by a locally held private key. Payer and signer are the same address.
#[derive(Debug, Clone)]
pub struct AccountWallet {
    signer: Arc<PrivateKeySigner>,
    methods: SupportedMethods,
}

impl AccountWallet {
    pub fn new(signer: PrivateKeySigner) -> Self {
        Self {
            signer: Arc::new(signer),
            methods: SupportedMethods::default(),
        }
    }

    pub fn with_methods(mut self, methods: SupportedMethods) -> Self {
        self.methods = methods;
        self
    }

    pub fn methods(&self) -> &SupportedMethods {
        &self.methods
    }
}

#[async_trait::async_trait]
impl Wallet for AccountWallet {
    fn payer(&self) -> Address {
        self.signer.address()
    }

    fn signer(&self) -> Address {
        self.signer.address()
    }

    fn supports_scheme(&self, scheme: &str) -> bool {
        self.methods.supports_scheme(scheme)
    }

    fn supports_network(&self, network: &Network) -> bool {
        self.methods.supports_network(network)
    }

    async fn sign(&self, message: &[u8]) -> Result<Signature, SigningError> {
        Ok(self.signer.sign_message(message).await?)
    }
}
