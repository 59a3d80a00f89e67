//! Blockchain identifiers.
//!
//! Payment requirements name the network they settle on. Servers speaking V1 use
//! friendly names (`base-sepolia`), V2 servers use CAIP-2 chain ids
//! (`eip155:84532`). [`ChainId`] is the canonical form both are compared in.

mod chain_id;

pub use chain_id::*;
