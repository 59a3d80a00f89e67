//! `x402-proxy` entrypoint.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG`, `HOST`, `PORT`, `X402_PROXY_TARGET`, `X402_PRIVATE_KEY` override the config file
//! - `RUST_LOG` sets the log filter
//! - `OTEL_*` variables enable span export (with the `telemetry` feature)

use std::process;

#[tokio::main]
async fn main() {
    let result = x402_proxy::run().await;
    if let Err(e) = result {
        println!("{e}");
        process::exit(1)
    }
}
