//! Helpers shared by the wire types.
//!
//! - [`b64`] - base64 and base64-JSON encoding

pub mod b64;

pub use b64::*;
