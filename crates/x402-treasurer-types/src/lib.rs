#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core wire types for buyer-side x402 payments.
//!
//! This crate holds everything that crosses a process boundary when a client pays
//! for a resource over HTTP 402: the challenge a server sends, the requirements it
//! lists, and the signed authorization the client sends back. It carries no I/O and
//! no policy; those live in `x402-treasurer`.
//!
//! # Modules
//!
//! - [`chain`] - CAIP-2 chain identifiers
//! - [`config`] - `$VAR` / `${VAR}` resolution for configuration values
//! - [`networks`] - Registry of well-known networks and the [`networks::Network`] identifier
//! - [`proto`] - Challenge, requirement and authorization wire formats
//! - [`timestamp`] - Unix timestamps used for authorization windows
//! - [`util`] - Base64 helpers
//!
//! # Protocol Versions
//!
//! - **V1**: the challenge is a JSON body `{"accepts": [...]}` and the authorization
//!   travels in the `X-PAYMENT` header.
//! - **V2**: the challenge is a base64 JSON `PAYMENT-REQUIRED` header and the
//!   authorization travels in the `PAYMENT-SIGNATURE` header.

pub mod chain;
pub mod config;
pub mod networks;
pub mod proto;
pub mod timestamp;
pub mod util;
