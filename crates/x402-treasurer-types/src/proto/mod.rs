//! Wire types for 402 challenges and payment authorizations.
//!
//! A server that wants to be paid answers with HTTP 402 and a list of
//! [`PaymentRequirement`]s, either as a JSON body (V1) or as a base64 JSON
//! `PAYMENT-REQUIRED` header (V2). The buyer picks one requirement, signs a
//! [`PaymentIntent`] bound to it, and resends the request with a
//! [`PaymentAuthorization`] in a single header.
//!
//! All JSON uses camelCase field names. Requirement objects are kept verbatim so
//! unknown fields survive the round trip back to the server.

use alloy_primitives::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use serde_with::{VecSkipError, serde_as};
use std::fmt;
use std::fmt::Display;
use std::ops::Deref;
use std::str::FromStr;

use crate::networks::Network;
use crate::timestamp::UnixTimestamp;

mod authorization;

pub use authorization::*;

/// Protocol version of a challenge, and of the authorization sent in reply.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum X402Version {
    /// JSON body challenge, `X-PAYMENT` authorization header.
    V1,
    /// `PAYMENT-REQUIRED` header challenge, `PAYMENT-SIGNATURE` authorization header.
    V2,
}

impl X402Version {
    pub fn as_u8(&self) -> u8 {
        match self {
            X402Version::V1 => 1,
            X402Version::V2 => 2,
        }
    }

    /// The request header an authorization for this version travels in.
    pub fn authorization_header(&self) -> &'static str {
        match self {
            X402Version::V1 => X_PAYMENT_HEADER,
            X402Version::V2 => PAYMENT_SIGNATURE_HEADER,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unsupported x402 version {0}")]
pub struct UnsupportedVersion(pub u8);

impl TryFrom<u8> for X402Version {
    type Error = UnsupportedVersion;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(X402Version::V1),
            2 => Ok(X402Version::V2),
            other => Err(UnsupportedVersion(other)),
        }
    }
}

impl Serialize for X402Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for X402Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let num = u8::deserialize(deserializer)?;
        X402Version::try_from(num).map_err(de::Error::custom)
    }
}

impl Display for X402Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// An amount in the smallest unit of an asset.
///
/// Serialized as a decimal string. Deserialization accepts a decimal string or a
/// non-negative JSON integer; anything else (negative, fractional, hex) is rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TokenAmount(pub U256);

impl TokenAmount {
    pub const ZERO: TokenAmount = TokenAmount(U256::ZERO);

    pub fn checked_add(self, rhs: TokenAmount) -> Option<TokenAmount> {
        self.0.checked_add(rhs.0).map(TokenAmount)
    }

    pub fn saturating_sub(self, rhs: TokenAmount) -> TokenAmount {
        TokenAmount(self.0.saturating_sub(rhs.0))
    }
}

impl Deref for TokenAmount {
    type Target = U256;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        TokenAmount(U256::from(value))
    }
}

impl From<U256> for TokenAmount {
    fn from(value: U256) -> Self {
        TokenAmount(value)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Amount must be a non-negative integer, got {0:?}")]
pub struct TokenAmountParseError(String);

impl FromStr for TokenAmount {
    type Err = TokenAmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TokenAmountParseError(s.to_string()));
        }
        U256::from_str_radix(s, 10)
            .map(TokenAmount)
            .map_err(|_| TokenAmountParseError(s.to_string()))
    }
}

impl Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            String(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(TokenAmount::from(n)),
            Raw::String(s) => s.parse().map_err(de::Error::custom),
        }
    }
}

fn default_scheme() -> String {
    "exact".to_string()
}

/// The fields of a requirement object the buyer reasons about.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequirementFields {
    #[serde(default = "default_scheme")]
    scheme: String,
    network: Network,
    #[serde(alias = "recipient")]
    pay_to: String,
    #[serde(default)]
    asset: String,
    #[serde(alias = "maxAmountRequired")]
    amount: TokenAmount,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    resource: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    max_timeout_seconds: Option<u64>,
    #[serde(default)]
    valid_until: Option<UnixTimestamp>,
    #[serde(default)]
    extra: Option<serde_json::Value>,
}

/// One payment option offered by a server.
///
/// Parsed from a requirement object that must carry a recipient (`payTo`), an
/// amount (`maxAmountRequired` in V1, `amount` in V2) and a `network`. Every
/// other field, known or not, is kept in the original object and sent back
/// verbatim as the `accepted` requirement of an authorization.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRequirement {
    pub scheme: String,
    pub network: Network,
    pub pay_to: String,
    pub asset: String,
    pub amount: TokenAmount,
    pub price: Option<String>,
    pub resource: Option<String>,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    pub max_timeout_seconds: Option<u64>,
    pub valid_until: Option<UnixTimestamp>,
    pub extra: Option<serde_json::Value>,
    original: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum RequirementError {
    #[error("requirement must be a JSON object")]
    NotAnObject,
    #[error("requirement has an empty {0}")]
    EmptyField(&'static str),
    #[error(transparent)]
    Fields(#[from] serde_json::Error),
}

impl PaymentRequirement {
    /// Builds a requirement in V2 field naming.
    pub fn new(
        scheme: impl Into<String>,
        network: impl Into<Network>,
        pay_to: impl Into<String>,
        asset: impl Into<String>,
        amount: impl Into<TokenAmount>,
    ) -> Self {
        let mut original = serde_json::Map::new();
        let scheme = scheme.into();
        let network = network.into();
        let pay_to = pay_to.into();
        let asset = asset.into();
        let amount = amount.into();
        original.insert("scheme".into(), scheme.clone().into());
        original.insert("network".into(), network.as_str().into());
        original.insert("payTo".into(), pay_to.clone().into());
        original.insert("asset".into(), asset.clone().into());
        original.insert("amount".into(), amount.to_string().into());
        Self {
            scheme,
            network,
            pay_to,
            asset,
            amount,
            price: None,
            resource: None,
            description: None,
            mime_type: None,
            max_timeout_seconds: None,
            valid_until: None,
            extra: None,
            original,
        }
    }

    pub fn with_max_timeout_seconds(mut self, secs: u64) -> Self {
        self.max_timeout_seconds = Some(secs);
        self.original
            .insert("maxTimeoutSeconds".into(), secs.into());
        self
    }

    pub fn with_valid_until(mut self, valid_until: UnixTimestamp) -> Self {
        self.valid_until = Some(valid_until);
        self.original
            .insert("validUntil".into(), valid_until.to_string().into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        let resource = resource.into();
        self.original
            .insert("resource".into(), resource.clone().into());
        self.resource = Some(resource);
        self
    }

    /// Parses one requirement object from a challenge.
    pub fn from_json(value: serde_json::Value) -> Result<Self, RequirementError> {
        let serde_json::Value::Object(original) = value else {
            return Err(RequirementError::NotAnObject);
        };
        let fields: RequirementFields =
            serde_json::from_value(serde_json::Value::Object(original.clone()))?;
        if fields.pay_to.trim().is_empty() {
            return Err(RequirementError::EmptyField("payTo"));
        }
        if fields.network.as_str().trim().is_empty() {
            return Err(RequirementError::EmptyField("network"));
        }
        Ok(Self {
            scheme: fields.scheme,
            network: fields.network,
            pay_to: fields.pay_to,
            asset: fields.asset,
            amount: fields.amount,
            price: fields.price,
            resource: fields.resource,
            description: fields.description,
            mime_type: fields.mime_type,
            max_timeout_seconds: fields.max_timeout_seconds,
            valid_until: fields.valid_until,
            extra: fields.extra,
            original,
        })
    }

    /// The requirement object exactly as the server sent it.
    pub fn original(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.original
    }

    /// Fields this crate does not interpret, preserved for forward-compatible policies.
    pub fn extension(&self, key: &str) -> Option<&serde_json::Value> {
        const KNOWN: &[&str] = &[
            "scheme",
            "network",
            "payTo",
            "recipient",
            "asset",
            "amount",
            "maxAmountRequired",
            "price",
            "resource",
            "description",
            "mimeType",
            "maxTimeoutSeconds",
            "validUntil",
            "extra",
        ];
        if KNOWN.contains(&key) {
            return None;
        }
        self.original.get(key)
    }

    /// Case-insensitive recipient comparison, so EVM checksum casing does not matter.
    pub fn pays_to(&self, recipient: &str) -> bool {
        self.pay_to.eq_ignore_ascii_case(recipient)
    }

    /// Whether no authorization signed at `now` could still be valid: `validUntil`
    /// has passed, or `maxTimeoutSeconds` leaves no window at all.
    pub fn is_expired_at(&self, now: UnixTimestamp) -> bool {
        self.max_timeout_seconds == Some(0) || self.valid_until.is_some_and(|until| until <= now)
    }
}

impl Serialize for PaymentRequirement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.original.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PaymentRequirement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        PaymentRequirement::from_json(value).map_err(de::Error::custom)
    }
}

/// V2 description of the resource being paid for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// The JSON document of a 402 challenge, as found in a V1 body or a decoded V2 header.
///
/// Requirement objects that fail to parse are skipped, so the list may be shorter
/// than what the server sent, or empty.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    #[serde(default)]
    pub x402_version: Option<u8>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub resource: Option<ResourceInfo>,
    #[serde_as(as = "VecSkipError<_>")]
    pub accepts: Vec<PaymentRequirement>,
}

/// An ordered, non-empty set of payment options from one 402 response.
///
/// Order is the server's preference.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentChallenge {
    version: X402Version,
    resource: Option<ResourceInfo>,
    error: Option<String>,
    accepts: Vec<PaymentRequirement>,
}

impl PaymentChallenge {
    /// Returns `None` if `accepts` is empty.
    pub fn new(version: X402Version, accepts: Vec<PaymentRequirement>) -> Option<Self> {
        if accepts.is_empty() {
            return None;
        }
        Some(Self {
            version,
            resource: None,
            error: None,
            accepts,
        })
    }

    pub fn with_resource(mut self, resource: Option<ResourceInfo>) -> Self {
        self.resource = resource;
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    pub fn version(&self) -> X402Version {
        self.version
    }

    pub fn resource(&self) -> Option<&ResourceInfo> {
        self.resource.as_ref()
    }

    /// The server's error text, e.g. why a previous authorization was refused.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn accepts(&self) -> &[PaymentRequirement] {
        &self.accepts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_amount_serde() {
        let a: TokenAmount = serde_json::from_str("\"1000\"").unwrap();
        let b: TokenAmount = serde_json::from_str("1000").unwrap();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"1000\"");
        assert!(serde_json::from_str::<TokenAmount>("-5").is_err());
        assert!(serde_json::from_str::<TokenAmount>("1.5").is_err());
        assert!(serde_json::from_str::<TokenAmount>("\"0x10\"").is_err());
        assert!(serde_json::from_str::<TokenAmount>("\"\"").is_err());
    }

    #[test]
    fn test_requirement_v1_fields_and_extensions() {
        let req: PaymentRequirement = serde_json::from_value(json!({
            "scheme": "exact",
            "network": "base-sepolia",
            "maxAmountRequired": "1000",
            "payTo": "0xA",
            "asset": "USDC",
            "price": "$0.001",
            "resource": "http://localhost/mcp",
            "mimeType": "application/json",
            "maxTimeoutSeconds": 300,
            "extra": {"name": "USDC", "version": "2"},
            "outputSchema": {"type": "object"}
        }))
        .unwrap();
        assert_eq!(req.amount, TokenAmount::from(1000));
        assert_eq!(req.max_timeout_seconds, Some(300));
        assert_eq!(req.price.as_deref(), Some("$0.001"));
        assert_eq!(req.extension("outputSchema"), Some(&json!({"type": "object"})));
        assert_eq!(req.extension("payTo"), None);
        let echoed = serde_json::to_value(&req).unwrap();
        assert_eq!(echoed["maxAmountRequired"], json!("1000"));
        assert_eq!(echoed["price"], json!("$0.001"));
        assert_eq!(echoed["outputSchema"], json!({"type": "object"}));
    }

    #[test]
    fn test_requirement_expiry() {
        let now = UnixTimestamp::from_secs(1_000);
        let req = PaymentRequirement::new("exact", "base", "0xA", "USDC", 1u64);
        assert!(!req.is_expired_at(now));
        assert!(req.clone().with_max_timeout_seconds(0).is_expired_at(now));
        assert!(!req.clone().with_max_timeout_seconds(1).is_expired_at(now));
        assert!(req.clone().with_valid_until(now).is_expired_at(now));
        assert!(!req.with_valid_until(now + 1).is_expired_at(now));
    }

    #[test]
    fn test_requirement_defaults_scheme() {
        let req: PaymentRequirement = serde_json::from_value(json!({
            "network": "base-sepolia", "amount": 1000, "asset": "USDC", "recipient": "0xA"
        }))
        .unwrap();
        assert_eq!(req.scheme, "exact");
        assert_eq!(req.pay_to, "0xA");
    }

    #[test]
    fn test_requirement_missing_fields() {
        for value in [
            json!({"network": "base", "amount": "1"}),
            json!({"network": "base", "payTo": "0xA"}),
            json!({"payTo": "0xA", "amount": "1"}),
            json!({"network": "base", "payTo": "", "amount": "1"}),
            json!({"network": "base", "payTo": "0xA", "amount": "-1"}),
            json!("not an object"),
        ] {
            assert!(PaymentRequirement::from_json(value).is_err());
        }
    }

    #[test]
    fn test_payment_required_skips_bad_entries() {
        let doc: PaymentRequired = serde_json::from_value(json!({
            "x402Version": 1,
            "accepts": [
                {"network": "base", "payTo": "0xA"},
                {"network": "base", "payTo": "0xB", "maxAmountRequired": "5", "scheme": "future"}
            ]
        }))
        .unwrap();
        assert_eq!(doc.accepts.len(), 1);
        assert_eq!(doc.accepts[0].scheme, "future");
    }

    #[test]
    fn test_challenge_never_empty() {
        assert!(PaymentChallenge::new(X402Version::V1, vec![]).is_none());
        let req = PaymentRequirement::new("exact", "base", "0xA", "USDC", 1u64);
        let challenge = PaymentChallenge::new(X402Version::V2, vec![req]).unwrap();
        assert_eq!(challenge.accepts().len(), 1);
        assert_eq!(challenge.version().authorization_header(), "PAYMENT-SIGNATURE");
    }
}
