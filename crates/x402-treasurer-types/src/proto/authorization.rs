use alloy_primitives::{Address, B256, Bytes};
use http::HeaderValue;
use serde::{Deserialize, Serialize};

use crate::networks::Network;
use crate::proto::{PaymentRequirement, TokenAmount, X402Version};
use crate::timestamp::UnixTimestamp;
use crate::util::{Base64Bytes, Base64JsonError};

/// Request header carrying a V1 authorization.
pub const X_PAYMENT_HEADER: &str = "X-PAYMENT";
/// Request header carrying a V2 authorization.
pub const PAYMENT_SIGNATURE_HEADER: &str = "PAYMENT-SIGNATURE";
/// Response header carrying a V2 challenge.
pub const PAYMENT_REQUIRED_HEADER: &str = "PAYMENT-REQUIRED";
/// Response headers carrying a settlement receipt (V1, V2).
pub const X_PAYMENT_RESPONSE_HEADER: &str = "X-PAYMENT-RESPONSE";
pub const PAYMENT_RESPONSE_HEADER: &str = "PAYMENT-RESPONSE";

/// Every header that belongs to the payment handshake.
pub const PAYMENT_HEADERS: &[&str] = &[
    X_PAYMENT_HEADER,
    PAYMENT_SIGNATURE_HEADER,
    PAYMENT_REQUIRED_HEADER,
    X_PAYMENT_RESPONSE_HEADER,
    PAYMENT_RESPONSE_HEADER,
];

/// Prefix of every signed intent, so the signature cannot be replayed as another message type.
pub const INTENT_DOMAIN_TAG: &[u8] = b"x402-treasurer:payment-intent:v1\n";

/// What the payer commits to: one requirement, one nonce, one validity window.
///
/// `payer` is the account funds are drawn from. `signer` is the key that signs;
/// for a plain account both are equal, for a smart account `signer` is the
/// session key and `payer` the smart-account address, which therefore becomes
/// part of the signed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntent {
    pub scheme: String,
    pub network: Network,
    pub pay_to: String,
    pub asset: String,
    pub amount: TokenAmount,
    #[serde(default)]
    pub resource: Option<String>,
    pub payer: Address,
    pub signer: Address,
    pub nonce: B256,
    pub issued_at: UnixTimestamp,
    pub valid_before: UnixTimestamp,
}

impl PaymentIntent {
    pub fn new(
        requirement: &PaymentRequirement,
        payer: Address,
        signer: Address,
        nonce: B256,
        issued_at: UnixTimestamp,
        valid_before: UnixTimestamp,
    ) -> Self {
        Self {
            scheme: requirement.scheme.clone(),
            network: requirement.network.clone(),
            pay_to: requirement.pay_to.clone(),
            asset: requirement.asset.clone(),
            amount: requirement.amount,
            resource: requirement.resource.clone(),
            payer,
            signer,
            nonce,
            issued_at,
            valid_before,
        }
    }

    /// The exact bytes a wallet signs: [`INTENT_DOMAIN_TAG`] followed by the intent
    /// as compact JSON with fields in declaration order.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = INTENT_DOMAIN_TAG.to_vec();
        serde_json::to_writer(&mut bytes, self)?;
        Ok(bytes)
    }

    /// Whether this intent commits to exactly the terms of `requirement`.
    pub fn binds(&self, requirement: &PaymentRequirement) -> bool {
        self.scheme == requirement.scheme
            && self.network == requirement.network
            && requirement.pays_to(&self.pay_to)
            && self.asset == requirement.asset
            && self.amount == requirement.amount
            && self.resource == requirement.resource
    }

    pub fn is_expired_at(&self, now: UnixTimestamp) -> bool {
        now >= self.valid_before
    }
}

/// The signed intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedIntent {
    pub intent: PaymentIntent,
    pub signature: Bytes,
}

/// A payment authorization, as sent in the `X-PAYMENT` or `PAYMENT-SIGNATURE` header.
///
/// ```json
/// {
///   "x402Version": 1,
///   "scheme": "exact",
///   "network": "base-sepolia",
///   "accepted": { "...": "the requirement object, verbatim" },
///   "payload": { "intent": { "...": "..." }, "signature": "0x..." }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAuthorization {
    pub x402_version: X402Version,
    pub scheme: String,
    pub network: Network,
    pub accepted: PaymentRequirement,
    pub payload: SignedIntent,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthorizationCodecError {
    #[error("Failed to encode authorization: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Failed to decode authorization: {0}")]
    Decode(#[from] Base64JsonError),
    #[error("Authorization is not a valid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
}

impl PaymentAuthorization {
    pub fn new(
        version: X402Version,
        accepted: PaymentRequirement,
        intent: PaymentIntent,
        signature: Bytes,
    ) -> Self {
        Self {
            x402_version: version,
            scheme: accepted.scheme.clone(),
            network: accepted.network.clone(),
            accepted,
            payload: SignedIntent { intent, signature },
        }
    }

    pub fn intent(&self) -> &PaymentIntent {
        &self.payload.intent
    }

    pub fn signature(&self) -> &Bytes {
        &self.payload.signature
    }

    pub fn payer(&self) -> Address {
        self.payload.intent.payer
    }

    pub fn nonce(&self) -> B256 {
        self.payload.intent.nonce
    }

    /// Name of the header this authorization is sent in.
    pub fn header_name(&self) -> &'static str {
        self.x402_version.authorization_header()
    }

    /// Base64 JSON header value.
    pub fn to_header_value(&self) -> Result<HeaderValue, AuthorizationCodecError> {
        let encoded = Base64Bytes::encode_json(self).map_err(|e| match e {
            Base64JsonError::Json(e) => AuthorizationCodecError::Encode(e),
            other => AuthorizationCodecError::Decode(other),
        })?;
        Ok(HeaderValue::from_bytes(encoded.as_ref())?)
    }

    pub fn from_header_value(value: &HeaderValue) -> Result<Self, AuthorizationCodecError> {
        Self::from_header_bytes(value.as_bytes())
    }

    pub fn from_header_bytes(bytes: &[u8]) -> Result<Self, AuthorizationCodecError> {
        let authorization = Base64Bytes::from(bytes).decode_json()?;
        Ok(authorization)
    }
}
