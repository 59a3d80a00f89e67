//! Transparent x402-paying HTTP proxy.
//!
//! Clients talk plain HTTP (including MCP streamable HTTP and SSE) to the proxy;
//! the proxy forwards to the upstream and, when the upstream answers
//! `402 Payment Required`, pays within the configured policy and retries. The
//! client never sees a 402.
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | CLI and JSON configuration, wallet and treasurer wiring |
//! | [`error`] | Proxy errors and their HTTP status codes |
//! | [`forward`] | The forwarding handler and router |
//! | [`run`] | Server startup and graceful shutdown |
//! | [`session`] | MCP session registry |
//! | [`util`] | Signal handling and telemetry |
//!
//! ```bash
//! X402_PRIVATE_KEY=0x... cargo run --package x402-proxy -- --target https://tools.example.com/mcp
//! ```

pub mod config;
pub mod error;
pub mod forward;
pub mod run;
pub mod session;
pub mod util;

pub use run::run;
