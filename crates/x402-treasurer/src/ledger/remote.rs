//! A [`SpendLedger`] backed by an external authorization service over HTTP.
//!
//! The service owns the spend counters and exposes three JSON endpoints relative
//! to its base URL:
//!
//! - `POST ./check-and-reserve` with `{payer, network, asset, amount, payTo, reservationId}`,
//!   answering `{approved, reason?, reservationId?, expiresAt?}`
//! - `POST ./confirm` with `{reservationId}`
//! - `POST ./release` with `{reservationId}`
//!
//! `reservationId` in the request is a client-generated proposal; the service may
//! answer with its own id, which is then used for confirm and release. Any
//! non-200 status is an error, and errors deny payment upstream.
//!
//! ```rust
//! use x402_treasurer::ledger::RemoteLedger;
//!
//! let ledger = RemoteLedger::try_from("https://ledger.example.com/v1").unwrap();
//! assert_eq!(ledger.check_and_reserve_url().as_str(), "https://ledger.example.com/v1/check-and-reserve");
//! ```

use alloy_primitives::Address;
use http::{HeaderMap, StatusCode};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;
use url::Url;
use x402_treasurer_types::networks::Network;
use x402_treasurer_types::proto::{PaymentRequirement, TokenAmount};
use x402_treasurer_types::timestamp::UnixTimestamp;

use super::{LedgerDecision, LedgerError, Reservation, ReservationId, SpendLedger};
use crate::treasurer::DenialReason;

#[cfg(feature = "telemetry")]
use tracing::{Instrument, Span};

#[derive(Debug, thiserror::Error)]
pub enum RemoteLedgerError {
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        context: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("HTTP error: {context}: {source}")]
    Http {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to deserialize JSON: {context}: {source}")]
    JsonDeserialization {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Unexpected HTTP status {status}: {context}: {body}")]
    HttpStatus {
        context: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("Failed to read response body as text: {context}: {source}")]
    ResponseBodyRead {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckAndReserveRequest<'a> {
    pub payer: Address,
    pub network: &'a Network,
    pub asset: &'a str,
    pub amount: TokenAmount,
    pub pay_to: &'a str,
    pub reservation_id: &'a ReservationId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckAndReserveResponse {
    pub approved: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub reservation_id: Option<ReservationId>,
    #[serde(default)]
    pub expires_at: Option<UnixTimestamp>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReservationRequest<'a> {
    reservation_id: &'a ReservationId,
}

#[derive(Clone, Debug)]
pub struct RemoteLedger {
    base_url: Url,
    check_and_reserve_url: Url,
    confirm_url: Url,
    release_url: Url,
    client: Client,
    headers: HeaderMap,
    timeout: Option<Duration>,
}

impl RemoteLedger {
    pub fn try_new(base_url: Url) -> Result<Self, RemoteLedgerError> {
        let join = |path: &str, context: &'static str| {
            base_url
                .join(path)
                .map_err(|source| RemoteLedgerError::UrlParse { context, source })
        };
        let check_and_reserve_url = join(
            "./check-and-reserve",
            "Failed to construct ./check-and-reserve URL",
        )?;
        let confirm_url = join("./confirm", "Failed to construct ./confirm URL")?;
        let release_url = join("./release", "Failed to construct ./release URL")?;
        Ok(Self {
            client: Client::new(),
            base_url,
            check_and_reserve_url,
            confirm_url,
            release_url,
            headers: HeaderMap::new(),
            timeout: None,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn check_and_reserve_url(&self) -> &Url {
        &self.check_and_reserve_url
    }

    pub fn confirm_url(&self) -> &Url {
        &self.confirm_url
    }

    pub fn release_url(&self) -> &Url {
        &self.release_url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn timeout(&self) -> &Option<Duration> {
        &self.timeout
    }

    /// Headers sent with every request, e.g. an `Authorization` bearer token.
    pub fn with_headers(&self, headers: HeaderMap) -> Self {
        let mut this = self.clone();
        this.headers = headers;
        this
    }

    /// Per-request timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut this = self.clone();
        this.timeout = Some(timeout);
        this
    }

    pub async fn check_and_reserve_raw(
        &self,
        request: &CheckAndReserveRequest<'_>,
    ) -> Result<CheckAndReserveResponse, RemoteLedgerError> {
        let response = self
            .post(
                &self.check_and_reserve_url,
                "POST /check-and-reserve",
                request,
            )
            .await?;
        let result = response
            .json::<CheckAndReserveResponse>()
            .await
            .map_err(|e| RemoteLedgerError::JsonDeserialization {
                context: "POST /check-and-reserve",
                source: e,
            });
        record_result_on_span(&result);
        result
    }

    /// POSTs `payload` and checks for `200 OK`. The body is left unread.
    async fn post<T>(
        &self,
        url: &Url,
        context: &'static str,
        payload: &T,
    ) -> Result<reqwest::Response, RemoteLedgerError>
    where
        T: Serialize + ?Sized,
    {
        let mut req = self.client.post(url.clone()).json(payload);
        for (key, value) in self.headers.iter() {
            req = req.header(key, value);
        }
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let result = match req.send().await {
            Err(e) => Err(RemoteLedgerError::Http { context, source: e }),
            Ok(response) if response.status() == StatusCode::OK => Ok(response),
            Ok(response) => {
                let status = response.status();
                match response.text().await {
                    Ok(body) => Err(RemoteLedgerError::HttpStatus {
                        context,
                        status,
                        body,
                    }),
                    Err(e) => Err(RemoteLedgerError::ResponseBodyRead { context, source: e }),
                }
            }
        };
        record_result_on_span(&result);
        result
    }

    async fn reserve(
        &self,
        payer: Address,
        requirement: &PaymentRequirement,
    ) -> Result<LedgerDecision, LedgerError> {
        let proposed = ReservationId::random();
        let response = self
            .check_and_reserve_raw(&CheckAndReserveRequest {
                payer,
                network: &requirement.network,
                asset: &requirement.asset,
                amount: requirement.amount,
                pay_to: &requirement.pay_to,
                reservation_id: &proposed,
            })
            .await?;
        if !response.approved {
            // A ledger that denies without a recognised reason is enforcing a limit.
            let reason = response
                .reason
                .as_deref()
                .and_then(DenialReason::from_code)
                .unwrap_or(DenialReason::AmountExceedsLimit);
            return Ok(LedgerDecision::Denied(reason));
        }
        Ok(LedgerDecision::Reserved(Reservation {
            id: response.reservation_id.unwrap_or(proposed),
            payer,
            network: requirement.network.clone(),
            asset: requirement.asset.clone(),
            amount: requirement.amount,
            expires_at: response.expires_at,
        }))
    }

    async fn finish(
        &self,
        url: &Url,
        context: &'static str,
        id: &ReservationId,
    ) -> Result<(), LedgerError> {
        self.post(url, context, &ReservationRequest { reservation_id: id })
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SpendLedger for RemoteLedger {
    #[cfg(feature = "telemetry")]
    async fn check_and_reserve(
        &self,
        payer: Address,
        requirement: &PaymentRequirement,
    ) -> Result<LedgerDecision, LedgerError> {
        with_span(
            self.reserve(payer, requirement),
            tracing::info_span!("x402.remote_ledger.check_and_reserve", %payer, timeout = ?self.timeout),
        )
        .await
    }

    #[cfg(not(feature = "telemetry"))]
    async fn check_and_reserve(
        &self,
        payer: Address,
        requirement: &PaymentRequirement,
    ) -> Result<LedgerDecision, LedgerError> {
        self.reserve(payer, requirement).await
    }

    async fn confirm(&self, id: &ReservationId) -> Result<(), LedgerError> {
        self.finish(&self.confirm_url, "POST /confirm", id).await
    }

    async fn release(&self, id: &ReservationId) -> Result<(), LedgerError> {
        self.finish(&self.release_url, "POST /release", id).await
    }
}

impl TryFrom<&str> for RemoteLedger {
    type Error = RemoteLedgerError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        // One trailing slash, so relative joins append instead of replacing the last segment.
        let mut normalized = value.trim_end_matches('/').to_string();
        normalized.push('/');
        let url = Url::parse(&normalized).map_err(|e| RemoteLedgerError::UrlParse {
            context: "Failed to parse base url",
            source: e,
        })?;
        RemoteLedger::try_new(url)
    }
}

impl TryFrom<String> for RemoteLedger {
    type Error = RemoteLedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RemoteLedger::try_from(value.as_str())
    }
}

#[cfg(feature = "telemetry")]
fn record_result_on_span<R, E: Display>(result: &Result<R, E>) {
    let span = Span::current();
    match result {
        Ok(_) => {
            span.record("otel.status_code", "OK");
        }
        Err(err) => {
            span.record("otel.status_code", "ERROR");
            span.record("error.message", tracing::field::display(err));
            tracing::event!(tracing::Level::ERROR, error = %err, "Request to ledger failed");
        }
    }
}

#[cfg(not(feature = "telemetry"))]
fn record_result_on_span<R, E: Display>(_result: &Result<R, E>) {}

#[cfg(feature = "telemetry")]
fn with_span<F: Future>(fut: F, span: Span) -> impl Future<Output = F::Output> {
    fut.instrument(span)
}
