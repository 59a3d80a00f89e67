#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Buyer-side [x402](https://www.x402.org) payments for `reqwest`.
//!
//! When a server answers `402 Payment Required`, something has to decide whether
//! to pay, pick one of the offered options, sign for it and retry. This crate
//! splits that into small capabilities:
//!
//! - a [`Wallet`](wallet::Wallet) signs canonical payment intents
//!   ([`AccountWallet`](wallet::AccountWallet) or
//!   [`SmartAccountWallet`](wallet::SmartAccountWallet));
//! - a [`Treasurer`](treasurer::Treasurer) decides whether a challenge may be paid
//!   ([`NaiveTreasurer`](treasurer::NaiveTreasurer) approves anything,
//!   [`LimitTreasurer`](treasurer::LimitTreasurer) reserves spend against a
//!   [`SpendLedger`](ledger::SpendLedger));
//! - the [`PaymentAuthorizer`](authorizer::PaymentAuthorizer) turns one challenge
//!   into one signed authorization header;
//! - [`Payments`](client::Payments) is the `reqwest-middleware` layer that retries
//!   a 402 exactly once.
//!
//! ## Quickstart
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use alloy_signer_local::PrivateKeySigner;
//! use x402_treasurer::{Payments, ReqwestWithPayments, ReqwestWithPaymentsBuild};
//! use x402_treasurer::ledger::{LocalLedger, SpendLimit};
//! use x402_treasurer::treasurer::LimitTreasurer;
//! use x402_treasurer::wallet::AccountWallet;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let signer: PrivateKeySigner = "0x...".parse()?;
//! let wallet = Arc::new(AccountWallet::new(signer));
//! let ledger = Arc::new(LocalLedger::new(SpendLimit::ceiling(5_000u64)));
//! let treasurer = LimitTreasurer::new(wallet.clone(), ledger);
//! let http = reqwest::Client::new()
//!     .with_payments(Payments::new(wallet, treasurer))
//!     .build();
//! let response = http.get("https://api.example.com/paid").send().await?;
//! # Ok(())
//! # }
//! ```

pub mod authorizer;
mod builder;
pub mod challenge;
pub mod client;
pub mod ledger;
pub mod nonce;
pub mod settlement;
pub mod treasurer;
pub mod wallet;

pub use builder::*;
pub use client::{PaymentError, PaymentReceipt, Payments};

pub use x402_treasurer_types as types;
