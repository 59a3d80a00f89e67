//! Spend ledgers.
//!
//! A [`SpendLedger`] keeps cumulative spend per `(payer, network, asset)` and
//! answers one question atomically: may this amount be spent on top of what is
//! already committed and reserved? A positive answer reserves the amount. The
//! reservation is then either confirmed (spend becomes committed) or released;
//! if neither happens it expires.
//!
//! - [`LocalLedger`] keeps state in process.
//! - [`RemoteLedger`] asks an external authorization service over HTTP.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use x402_treasurer_types::networks::Network;
use x402_treasurer_types::proto::{PaymentRequirement, TokenAmount};
use x402_treasurer_types::timestamp::UnixTimestamp;

use crate::treasurer::DenialReason;

mod local;
mod remote;

pub use local::*;
pub use remote::*;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(String);

impl ReservationId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// 128 random bits, hex encoded.
    pub fn random() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(alloy_primitives::hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Spend held for one payment until it is confirmed, released or expires.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub id: ReservationId,
    pub payer: Address,
    pub network: Network,
    pub asset: String,
    pub amount: TokenAmount,
    pub expires_at: Option<UnixTimestamp>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerDecision {
    Reserved(Reservation),
    Denied(DenialReason),
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Remote(#[from] RemoteLedgerError),
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
    #[error("Unknown or expired reservation {0}")]
    UnknownReservation(ReservationId),
}

#[async_trait::async_trait]
pub trait SpendLedger: Send + Sync {
    /// Atomically checks `requirement.amount` against the payer's limit and reserves it.
    async fn check_and_reserve(
        &self,
        payer: Address,
        requirement: &PaymentRequirement,
    ) -> Result<LedgerDecision, LedgerError>;

    /// Turns a reservation into committed spend.
    async fn confirm(&self, id: &ReservationId) -> Result<(), LedgerError>;

    /// Drops a reservation. Releasing an unknown or expired reservation is not an error.
    async fn release(&self, id: &ReservationId) -> Result<(), LedgerError>;
}
