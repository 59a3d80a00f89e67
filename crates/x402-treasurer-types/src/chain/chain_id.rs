//! CAIP-2 chain identifier types.
//!
//! A CAIP-2 chain id has two parts separated by a colon:
//!
//! - **Namespace**: the blockchain family (`eip155` for EVM, `solana` for Solana)
//! - **Reference**: the chain within the family (`8453` for Base, `84532` for Base Sepolia)
//!
//! # Examples
//!
//! ```
//! use x402_treasurer_types::chain::ChainId;
//!
//! let base = ChainId::new("eip155", "8453");
//! assert_eq!(base.to_string(), "eip155:8453");
//!
//! let sepolia: ChainId = "eip155:84532".parse().unwrap();
//! assert_eq!(sepolia.reference, "84532");
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt;
use std::str::FromStr;

use crate::networks;

/// Namespace of EVM-compatible chains.
pub const EIP155_NAMESPACE: &str = "eip155";

/// A CAIP-2 compliant blockchain identifier.
///
/// Serializes to and from the colon-separated string form, `"eip155:8453"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId {
    /// The blockchain namespace (e.g., `eip155`).
    pub namespace: String,
    /// The chain-specific reference (e.g., `8453`).
    pub reference: String,
}

impl ChainId {
    /// Creates a new chain id from namespace and reference components.
    pub fn new<N: Into<String>, R: Into<String>>(namespace: N, reference: R) -> Self {
        Self {
            namespace: namespace.into(),
            reference: reference.into(),
        }
    }

    /// Returns the namespace component of the chain id.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the reference component of the chain id.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Whether this chain belongs to the EVM (`eip155`) family.
    pub fn is_evm(&self) -> bool {
        self.namespace == EIP155_NAMESPACE
    }

    /// Numeric EVM chain id, if this is an `eip155` chain with a numeric reference.
    pub fn evm_chain_id(&self) -> Option<u64> {
        if !self.is_evm() {
            return None;
        }
        self.reference.parse().ok()
    }

    /// Looks up a chain id by its well-known network name.
    ///
    /// ```
    /// use x402_treasurer_types::chain::ChainId;
    ///
    /// let base = ChainId::from_network_name("base").unwrap();
    /// assert_eq!(base.to_string(), "eip155:8453");
    /// assert!(ChainId::from_network_name("unknown").is_none());
    /// ```
    pub fn from_network_name(network_name: &str) -> Option<Self> {
        networks::chain_id_by_network_name(network_name).cloned()
    }

    /// Returns the well-known network name for this chain id, if any.
    pub fn as_network_name(&self) -> Option<&'static str> {
        networks::network_name_by_chain_id(self)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.reference)
    }
}

impl From<ChainId> for String {
    fn from(value: ChainId) -> Self {
        value.to_string()
    }
}

/// Error returned when parsing an invalid chain id string.
///
/// Both components of `namespace:reference` must be non-empty.
#[derive(Debug, thiserror::Error)]
#[error("Invalid chain id format {0}")]
pub struct ChainIdFormatError(String);

impl FromStr for ChainId {
    type Err = ChainIdFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((namespace, reference)) if !namespace.is_empty() && !reference.is_empty() => {
                Ok(ChainId::new(namespace, reference))
            }
            _ => Err(ChainIdFormatError(s.into())),
        }
    }
}

impl Serialize for ChainId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChainId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ChainId::from_str(&s).map_err(de::Error::custom)
    }
}
