//! Proxy configuration.
//!
//! Settings come from a JSON file (`--config`, default `config.json`), with CLI
//! flags and their environment variables taking precedence. Secrets may be
//! written as `"$VAR"` or `"${VAR}"`.
//!
//! ```json
//! {
//!   "port": 8402,
//!   "target": "https://tools.example.com/mcp",
//!   "wallet": { "type": "account", "private_key": "$BUYER_PRIVATE_KEY" },
//!   "treasurer": { "type": "local", "ceiling": "5000000", "window_secs": 86400 },
//!   "networks": ["base", "base-sepolia"],
//!   "allowed_recipients": ["0x209693Bc6afc0C5328bA36FaF03C514EF312287C"],
//!   "max_amount_per_payment": "1000000"
//! }
//! ```

use alloy_primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use clap::Parser;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use x402_treasurer::authorizer::PaymentAuthorizer;
use x402_treasurer::ledger::{LocalLedger, RemoteLedger, RemoteLedgerError, SpendLimit};
use x402_treasurer::treasurer::{LimitTreasurer, NaiveTreasurer, SpendPolicy, Treasurer};
use x402_treasurer::wallet::{
    AccountWallet, SessionWindow, SmartAccountWallet, SupportedMethods, Wallet,
};
use x402_treasurer::Payments;
use x402_treasurer_types::config::LiteralOrEnv;
use x402_treasurer_types::networks::Network;
use x402_treasurer_types::proto::TokenAmount;
use x402_treasurer_types::timestamp::UnixTimestamp;

#[derive(Parser, Debug, Default)]
#[command(name = "x402-proxy")]
#[command(about = "Transparent HTTP proxy that pays x402 challenges")]
pub struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    pub config: PathBuf,
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,
    #[arg(long, env = "HOST")]
    pub host: Option<IpAddr>,
    /// Default upstream when a request has no `?target=`
    #[arg(long, env = "X402_PROXY_TARGET")]
    pub target: Option<Url>,
    /// Account private key, used when the config file names no wallet
    #[arg(long, env = "X402_PRIVATE_KEY", hide_env_values = true)]
    pub private_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalletConfig {
    Account {
        private_key: LiteralOrEnv<PrivateKeySigner>,
    },
    SmartAccount {
        address: Address,
        session_key: LiteralOrEnv<PrivateKeySigner>,
        #[serde(default)]
        session_valid_until: Option<UnixTimestamp>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreasurerConfig {
    /// Pays whatever the wallet supports. No spend protection.
    #[default]
    Naive,
    Local {
        ceiling: TokenAmount,
        #[serde(default)]
        window_secs: Option<u64>,
        #[serde(default)]
        reservation_ttl_secs: Option<u64>,
        #[serde(default)]
        ledger_timeout_ms: Option<u64>,
    },
    Remote {
        url: LiteralOrEnv<Url>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        headers: HashMap<String, LiteralOrEnv<String>>,
        #[serde(default)]
        ledger_timeout_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "config_defaults::default_port")]
    port: u16,
    #[serde(default = "config_defaults::default_host")]
    host: IpAddr,
    #[serde(default)]
    target: Option<Url>,
    #[serde(default)]
    wallet: Option<WalletConfig>,
    #[serde(default)]
    treasurer: TreasurerConfig,
    #[serde(default)]
    networks: Option<Vec<Network>>,
    #[serde(default)]
    allowed_recipients: Option<Vec<String>>,
    #[serde(default)]
    max_amount_per_payment: Option<TokenAmount>,
    #[serde(default = "config_defaults::default_signing_timeout_ms")]
    signing_timeout_ms: u64,
    #[serde(default = "config_defaults::default_authorization_ttl_secs")]
    authorization_ttl_secs: u64,
    #[serde(default = "config_defaults::default_session_idle_timeout_secs")]
    session_idle_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: config_defaults::default_port(),
            host: config_defaults::default_host(),
            target: None,
            wallet: None,
            treasurer: TreasurerConfig::default(),
            networks: None,
            allowed_recipients: None,
            max_amount_per_payment: None,
            signing_timeout_ms: config_defaults::default_signing_timeout_ms(),
            authorization_ttl_secs: config_defaults::default_authorization_ttl_secs(),
            session_idle_timeout_secs: config_defaults::default_session_idle_timeout_secs(),
        }
    }
}

pub mod config_defaults {
    use std::net::{IpAddr, Ipv4Addr};

    pub const DEFAULT_PORT: u16 = 8402;

    pub fn default_port() -> u16 {
        DEFAULT_PORT
    }

    pub fn default_host() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    pub fn default_signing_timeout_ms() -> u64 {
        10_000
    }

    pub fn default_authorization_ttl_secs() -> u64 {
        60
    }

    pub fn default_session_idle_timeout_secs() -> u64 {
        30 * 60
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("No wallet configured: set \"wallet\" in the config file or X402_PRIVATE_KEY")]
    MissingWallet,
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),
    #[error("Invalid ledger header {0}")]
    InvalidHeader(String),
    #[error(transparent)]
    RemoteLedger(#[from] RemoteLedgerError),
}

impl Config {
    /// Loads from CLI arguments and the file they point at.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(CliArgs::parse())
    }

    /// A missing file yields defaults; a file that exists but does not parse is an error.
    pub fn load_with(cli: CliArgs) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(content) => serde_json::from_str::<Config>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %cli.config.display(), "No config file, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(cli.config, e)),
        };
        if let Some(port) = cli.port {
            config.port = port;
        }
        if let Some(host) = cli.host {
            config.host = host;
        }
        if cli.target.is_some() {
            config.target = cli.target;
        }
        if config.wallet.is_none()
            && let Some(private_key) = cli.private_key
        {
            let signer = private_key
                .parse::<PrivateKeySigner>()
                .map_err(|e| ConfigError::InvalidPrivateKey(e.to_string()))?;
            config.wallet = Some(WalletConfig::Account {
                private_key: LiteralOrEnv::from_literal(signer),
            });
        }
        if config.wallet.is_none() {
            return Err(ConfigError::MissingWallet);
        }
        Ok(config)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn target(&self) -> Option<&Url> {
        self.target.as_ref()
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    fn methods(&self) -> SupportedMethods {
        match &self.networks {
            Some(networks) => SupportedMethods::new(["exact"], networks.iter().cloned()),
            None => SupportedMethods::default(),
        }
    }

    fn policy(&self) -> SpendPolicy {
        SpendPolicy {
            networks: self.networks.clone(),
            allowed_recipients: self.allowed_recipients.clone(),
            max_amount_per_payment: self.max_amount_per_payment,
        }
    }

    pub fn wallet(&self) -> Result<Arc<dyn Wallet>, ConfigError> {
        let wallet: Arc<dyn Wallet> = match &self.wallet {
            None => return Err(ConfigError::MissingWallet),
            Some(WalletConfig::Account { private_key }) => Arc::new(
                AccountWallet::new(private_key.inner().clone()).with_methods(self.methods()),
            ),
            Some(WalletConfig::SmartAccount {
                address,
                session_key,
                session_valid_until,
            }) => {
                let wallet = SmartAccountWallet::new(*address, session_key.inner().clone())
                    .with_methods(self.methods());
                match session_valid_until {
                    Some(valid_until) => Arc::new(wallet.with_validator(SessionWindow {
                        valid_until: *valid_until,
                    })),
                    None => Arc::new(wallet),
                }
            }
        };
        Ok(wallet)
    }

    pub fn treasurer(&self, wallet: Arc<dyn Wallet>) -> Result<Arc<dyn Treasurer>, ConfigError> {
        let treasurer: Arc<dyn Treasurer> = match &self.treasurer {
            TreasurerConfig::Naive => {
                if self.policy() != SpendPolicy::default() {
                    tracing::warn!("Spend policy is ignored by the naive treasurer");
                }
                tracing::warn!("Naive treasurer configured: payments are not limited");
                Arc::new(NaiveTreasurer::new(wallet))
            }
            TreasurerConfig::Local {
                ceiling,
                window_secs,
                reservation_ttl_secs,
                ledger_timeout_ms,
            } => {
                let limit = match window_secs {
                    Some(secs) => SpendLimit::per_window(*ceiling, Duration::from_secs(*secs)),
                    None => SpendLimit::ceiling(*ceiling),
                };
                let mut ledger = LocalLedger::new(limit);
                if let Some(secs) = reservation_ttl_secs {
                    ledger = ledger.with_reservation_ttl(Duration::from_secs(*secs));
                }
                Arc::new(limit_treasurer(
                    wallet,
                    Arc::new(ledger),
                    self.policy(),
                    *ledger_timeout_ms,
                ))
            }
            TreasurerConfig::Remote {
                url,
                timeout_ms,
                headers,
                ledger_timeout_ms,
            } => {
                let mut ledger = RemoteLedger::try_from(url.inner().as_str())?;
                if !headers.is_empty() {
                    ledger = ledger.with_headers(header_map(headers)?);
                }
                if let Some(ms) = timeout_ms {
                    ledger = ledger.with_timeout(Duration::from_millis(*ms));
                }
                Arc::new(limit_treasurer(
                    wallet,
                    Arc::new(ledger),
                    self.policy(),
                    *ledger_timeout_ms,
                ))
            }
        };
        Ok(treasurer)
    }

    /// The payments middleware described by this configuration.
    pub fn payments(&self) -> Result<Payments, ConfigError> {
        let wallet = self.wallet()?;
        let treasurer = self.treasurer(wallet.clone())?;
        let authorizer = PaymentAuthorizer::new(wallet, treasurer)
            .with_signing_timeout(Duration::from_millis(self.signing_timeout_ms))
            .with_authorization_ttl(Duration::from_secs(self.authorization_ttl_secs));
        Ok(Payments::from_authorizer(authorizer))
    }
}

fn limit_treasurer(
    wallet: Arc<dyn Wallet>,
    ledger: Arc<dyn x402_treasurer::ledger::SpendLedger>,
    policy: SpendPolicy,
    ledger_timeout_ms: Option<u64>,
) -> LimitTreasurer {
    let treasurer = LimitTreasurer::new(wallet, ledger).with_policy(policy);
    match ledger_timeout_ms {
        Some(ms) => treasurer.with_ledger_timeout(Duration::from_millis(ms)),
        None => treasurer,
    }
}

fn header_map(headers: &HashMap<String, LiteralOrEnv<String>>) -> Result<HeaderMap, ConfigError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::try_from(name.as_str())
            .map_err(|_| ConfigError::InvalidHeader(format!("name {name:?}")))?;
        let value = HeaderValue::try_from(value.inner().as_str())
            .map_err(|_| ConfigError::InvalidHeader(format!("value for {name}")))?;
        map.insert(name, value);
    }
    Ok(map)
}
