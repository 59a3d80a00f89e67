//! Known networks and the [`Network`] identifier.
//!
//! Challenges name networks either by a friendly V1 name (`"base-sepolia"`) or by a
//! CAIP-2 chain id (`"eip155:84532"`). Wallets and spend policies declare the
//! networks they support in whichever form is convenient; [`Network`] compares the
//! two forms by their canonical chain id so `"base-sepolia" == "eip155:84532"`.
//!
//! Unknown names are not an error. A network that is neither a known name nor a
//! parseable CAIP-2 id is kept verbatim and only equals the same string.
//!
//! ```
//! use x402_treasurer_types::networks::Network;
//!
//! let by_name = Network::new("base-sepolia");
//! let by_caip: Network = "eip155:84532".parse().unwrap();
//! assert_eq!(by_name, by_caip);
//! assert_eq!(by_name.as_str(), "base-sepolia");
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::LazyLock;

use crate::chain::ChainId;

/// A known network definition with its chain id and human-readable name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Human-readable network name (e.g., "base-sepolia").
    pub name: &'static str,
    /// CAIP-2 namespace (e.g., "eip155").
    pub namespace: &'static str,
    /// Chain reference (e.g., "84532").
    pub reference: &'static str,
}

impl NetworkInfo {
    /// Create a [`ChainId`] from this network info.
    pub fn chain_id(&self) -> ChainId {
        ChainId::new(self.namespace, self.reference)
    }
}

/// Well-known networks that V1 servers refer to by name.
pub static KNOWN_NETWORKS: &[NetworkInfo] = &[
    NetworkInfo {
        name: "ethereum",
        namespace: "eip155",
        reference: "1",
    },
    NetworkInfo {
        name: "base",
        namespace: "eip155",
        reference: "8453",
    },
    NetworkInfo {
        name: "base-sepolia",
        namespace: "eip155",
        reference: "84532",
    },
    NetworkInfo {
        name: "polygon",
        namespace: "eip155",
        reference: "137",
    },
    NetworkInfo {
        name: "polygon-amoy",
        namespace: "eip155",
        reference: "80002",
    },
    NetworkInfo {
        name: "avalanche",
        namespace: "eip155",
        reference: "43114",
    },
    NetworkInfo {
        name: "avalanche-fuji",
        namespace: "eip155",
        reference: "43113",
    },
    NetworkInfo {
        name: "sei",
        namespace: "eip155",
        reference: "1329",
    },
    NetworkInfo {
        name: "sei-testnet",
        namespace: "eip155",
        reference: "1328",
    },
    NetworkInfo {
        name: "celo",
        namespace: "eip155",
        reference: "42220",
    },
    NetworkInfo {
        name: "celo-sepolia",
        namespace: "eip155",
        reference: "11142220",
    },
    NetworkInfo {
        name: "solana",
        namespace: "solana",
        reference: "5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp",
    },
    NetworkInfo {
        name: "solana-devnet",
        namespace: "solana",
        reference: "EtWTRABZaYq6iMfeYKouRu166VU2xqa1",
    },
];

static NAME_TO_CHAIN_ID: LazyLock<HashMap<&'static str, ChainId>> = LazyLock::new(|| {
    KNOWN_NETWORKS
        .iter()
        .map(|n| (n.name, n.chain_id()))
        .collect()
});

static CHAIN_ID_TO_NAME: LazyLock<HashMap<ChainId, &'static str>> = LazyLock::new(|| {
    KNOWN_NETWORKS
        .iter()
        .map(|n| (n.chain_id(), n.name))
        .collect()
});

/// Looks up a chain id by well-known network name.
pub fn chain_id_by_network_name(name: &str) -> Option<&ChainId> {
    NAME_TO_CHAIN_ID.get(name)
}

/// Reverse lookup of [`chain_id_by_network_name`].
pub fn network_name_by_chain_id(chain_id: &ChainId) -> Option<&'static str> {
    CHAIN_ID_TO_NAME.get(chain_id).copied()
}

/// All known EVM networks, by name.
pub fn known_evm_networks() -> Vec<Network> {
    KNOWN_NETWORKS
        .iter()
        .filter(|n| n.namespace == crate::chain::EIP155_NAMESPACE)
        .map(|n| Network::new(n.name))
        .collect()
}

/// A network identifier as it appeared on the wire.
///
/// Keeps the original spelling for serialization and compares by canonical
/// [`ChainId`] whenever one can be derived.
#[derive(Debug, Clone)]
pub struct Network {
    raw: String,
    chain_id: Option<ChainId>,
}

impl Network {
    pub fn new<S: Into<String>>(raw: S) -> Self {
        let raw = raw.into();
        let chain_id = ChainId::from_network_name(&raw).or_else(|| raw.parse::<ChainId>().ok());
        Self { raw, chain_id }
    }

    /// The identifier exactly as written by the server or configuration.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Canonical CAIP-2 chain id, when the identifier is known or CAIP-2 formatted.
    pub fn chain_id(&self) -> Option<&ChainId> {
        self.chain_id.as_ref()
    }

    pub fn is_evm(&self) -> bool {
        self.chain_id.as_ref().is_some_and(ChainId::is_evm)
    }

    /// Stable key used for equality, hashing and ledger bookkeeping.
    pub fn canonical(&self) -> String {
        match &self.chain_id {
            Some(chain_id) => chain_id.to_string(),
            None => self.raw.clone(),
        }
    }
}

impl PartialEq for Network {
    fn eq(&self, other: &Self) -> bool {
        match (&self.chain_id, &other.chain_id) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.raw == other.raw,
            _ => false,
        }
    }
}

impl Eq for Network {}

impl Hash for Network {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Network {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Network::new(s))
    }
}

impl From<&str> for Network {
    fn from(value: &str) -> Self {
        Network::new(value)
    }
}

impl From<ChainId> for Network {
    fn from(value: ChainId) -> Self {
        Network {
            raw: value.to_string(),
            chain_id: Some(value),
        }
    }
}

impl Serialize for Network {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Network {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Network::new(s))
    }
}
