//! The retrying `reqwest` middleware.
//!
//! [`Payments`] sends the request as is. A `402 Payment Required` answer is read
//! as a challenge and handed to the [`PaymentAuthorizer`]; if that yields an
//! authorization, the request is sent again, once, with the payment header. The
//! response to the paid retry carries a [`PaymentReceipt`] in its extensions.
//!
//! A 402 that cannot be read as a challenge is returned to the caller as it
//! came, so it can be inspected rather than lost in an error.

use alloy_primitives::{Address, B256};
use http::{Extensions, HeaderMap, StatusCode, Version};
use reqwest::{Request, Response};
use reqwest_middleware as rqm;
use std::sync::Arc;
use std::time::Duration;
use x402_treasurer_types::networks::Network;
use x402_treasurer_types::proto::{AuthorizationCodecError, TokenAmount, X402Version};

use crate::authorizer::{Authorization, AuthorizationDenied, Denial, PaymentAuthorizer};
use crate::challenge::parse_challenge;
use crate::treasurer::{DenialReason, Treasurer};
use crate::wallet::{SigningError, Wallet};

#[cfg(feature = "telemetry")]
use tracing::{debug, info, instrument, trace, warn};

/// Attached to the response of a paid retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    pub version: X402Version,
    pub payer: Address,
    pub network: Network,
    pub asset: String,
    pub pay_to: String,
    pub amount: TokenAmount,
    pub nonce: B256,
}

impl From<&Authorization> for PaymentReceipt {
    fn from(authorization: &Authorization) -> Self {
        let intent = authorization.authorization.intent();
        Self {
            version: authorization.authorization.x402_version,
            payer: intent.payer,
            network: intent.network.clone(),
            asset: intent.asset.clone(),
            pay_to: intent.pay_to.clone(),
            amount: intent.amount,
            nonce: intent.nonce,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Payment denied: {0}")]
    PaymentDenied(DenialReason),
    #[error("Failed to sign payment: {0}")]
    SigningFailed(#[source] SigningError),
    #[error(transparent)]
    Encoding(#[from] AuthorizationCodecError),
    /// The server answered the paid retry with another 402.
    #[error("Payment rejected by server: {}", .reason.as_deref().unwrap_or("no reason given"))]
    PaymentRejected {
        reason: Option<String>,
        receipt: PaymentReceipt,
    },
    #[error("Request body is not cloneable, cannot retry with payment")]
    RequestNotCloneable,
}

impl PaymentError {
    /// The payment error inside a middleware error, if any.
    ///
    /// Transport failures stay `reqwest_middleware::Error::Reqwest` and yield `None`.
    pub fn from_middleware_error(error: &rqm::Error) -> Option<&PaymentError> {
        match error {
            rqm::Error::Middleware(e) => e.downcast_ref::<PaymentError>(),
            rqm::Error::Reqwest(_) => None,
        }
    }
}

/// `reqwest-middleware` layer that pays 402 challenges.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use alloy_signer_local::PrivateKeySigner;
/// use x402_treasurer::{Payments, ReqwestWithPayments, ReqwestWithPaymentsBuild};
/// use x402_treasurer::treasurer::NaiveTreasurer;
/// use x402_treasurer::wallet::AccountWallet;
///
/// let wallet = Arc::new(AccountWallet::new(PrivateKeySigner::random()));
/// let payments = Payments::new(wallet.clone(), NaiveTreasurer::new(wallet));
/// let http = reqwest::Client::new().with_payments(payments).build();
/// ```
#[derive(Debug, Clone)]
pub struct Payments {
    authorizer: PaymentAuthorizer,
}

impl Payments {
    pub fn new<W, T>(wallet: Arc<W>, treasurer: T) -> Self
    where
        W: Wallet + 'static,
        T: Treasurer + 'static,
    {
        Self {
            authorizer: PaymentAuthorizer::new(wallet, Arc::new(treasurer)),
        }
    }

    pub fn from_authorizer(authorizer: PaymentAuthorizer) -> Self {
        Self { authorizer }
    }

    pub fn with_authorization_ttl(mut self, ttl: Duration) -> Self {
        self.authorizer = self.authorizer.with_authorization_ttl(ttl);
        self
    }

    pub fn with_signing_timeout(mut self, timeout: Duration) -> Self {
        self.authorizer = self.authorizer.with_signing_timeout(timeout);
        self
    }

    pub fn authorizer(&self) -> &PaymentAuthorizer {
        &self.authorizer
    }
}

#[async_trait::async_trait]
impl rqm::Middleware for Payments {
    #[cfg_attr(feature = "telemetry", instrument(name = "x402.client.handle", skip_all, err))]
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: rqm::Next<'_>,
    ) -> rqm::Result<Response> {
        let retry_req = req.try_clone();
        let res = next.clone().run(req, extensions).await?;

        if res.status() != StatusCode::PAYMENT_REQUIRED {
            #[cfg(feature = "telemetry")]
            trace!(status = ?res.status(), "No payment required, returning response");
            return Ok(res);
        }

        #[cfg(feature = "telemetry")]
        info!(url = %res.url(), "Received 402 Payment Required, processing payment");

        let status = res.status();
        let version = res.version();
        let headers = res.headers().clone();
        let body = res.bytes().await?;

        // Nothing is reserved or signed for a request that could not be resent.
        let Some(mut retry) = retry_req else {
            return Err(middleware_error(PaymentError::RequestNotCloneable));
        };

        let authorization = match self
            .authorizer
            .authorize_response(status, &headers, &body)
            .await
        {
            Ok(authorization) => authorization,
            Err(AuthorizationDenied { denial, .. }) => {
                let error = match denial {
                    Denial::MalformedChallenge(_e) => {
                        #[cfg(feature = "telemetry")]
                        warn!(error = %_e, "Unreadable 402 challenge, returning it unchanged");
                        return Ok(rebuild_response(status, version, headers, body));
                    }
                    Denial::Policy(reason) => PaymentError::PaymentDenied(reason),
                    Denial::SigningFailed(e) => PaymentError::SigningFailed(e),
                    Denial::Encoding(e) => PaymentError::Encoding(e),
                };
                return Err(middleware_error(error));
            }
        };

        retry
            .headers_mut()
            .insert(authorization.header_name(), authorization.header_value.clone());
        let receipt = PaymentReceipt::from(&authorization);

        #[cfg(feature = "telemetry")]
        debug!(
            header = authorization.header_name(),
            network = %receipt.network,
            amount = %receipt.amount,
            "Retrying request with payment"
        );

        let mut res = next.run(retry, extensions).await?;
        if res.status() == StatusCode::PAYMENT_REQUIRED {
            let headers = res.headers().clone();
            let body = res.bytes().await?;
            let reason = rejection_reason(&headers, &body);
            #[cfg(feature = "telemetry")]
            warn!(reason = ?reason, "Paid retry answered with 402");
            return Err(middleware_error(PaymentError::PaymentRejected { reason, receipt }));
        }
        res.extensions_mut().insert(receipt);
        Ok(res)
    }
}

fn middleware_error(error: PaymentError) -> rqm::Error {
    rqm::Error::Middleware(error.into())
}

/// The server's explanation for refusing a paid retry: the challenge `error`
/// field, a bare JSON `error`, or the body text.
fn rejection_reason(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    if let Ok(challenge) = parse_challenge(StatusCode::PAYMENT_REQUIRED, headers, body)
        && let Some(error) = challenge.error()
    {
        return Some(error.to_string());
    }
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body)
        && let Some(error) = value.get("error").and_then(|e| e.as_str())
    {
        return Some(error.to_string());
    }
    let text = String::from_utf8_lossy(body).trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// A response equal to the buffered one, for handing a consumed 402 back to the caller.
fn rebuild_response(
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: impl Into<reqwest::Body>,
) -> Response {
    let mut response = http::Response::new(body.into());
    *response.status_mut() = status;
    *response.version_mut() = version;
    *response.headers_mut() = headers;
    Response::from(response)
}
