//! Parsing of 402 responses into a [`PaymentChallenge`].
//!
//! A V2 server sends the challenge as a base64 JSON `PAYMENT-REQUIRED` header; a
//! V1 server sends `{"accepts": [...]}` as the body. The header wins when both
//! are present and the header is readable.

use http::{HeaderMap, StatusCode};
use x402_treasurer_types::proto::{
    PAYMENT_REQUIRED_HEADER, PaymentChallenge, PaymentRequired, X402Version,
};
use x402_treasurer_types::util::Base64Bytes;

#[cfg(feature = "telemetry")]
use tracing::debug;

/// Why a response could not be read as a payment challenge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChallengeParseError {
    #[error("Response status {0} is not 402 Payment Required")]
    NotPaymentRequired(StatusCode),
    #[error("402 response carries no challenge")]
    MissingBody,
    #[error("402 challenge is malformed: {0}")]
    Malformed(String),
    #[error("402 challenge lists no acceptable payment requirements")]
    NoAcceptableRequirements,
}

/// Parses a 402 response. Pure: reads only its arguments.
pub fn parse_challenge(
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<PaymentChallenge, ChallengeParseError> {
    if status != StatusCode::PAYMENT_REQUIRED {
        return Err(ChallengeParseError::NotPaymentRequired(status));
    }

    let header_error = match headers.get(PAYMENT_REQUIRED_HEADER) {
        Some(value) => match Base64Bytes::from(value.as_bytes()).decode_json::<PaymentRequired>() {
            Ok(document) => {
                #[cfg(feature = "telemetry")]
                debug!("Parsed V2 challenge from header");
                return into_challenge(X402Version::V2, document);
            }
            Err(e) => Some(e.to_string()),
        },
        None => None,
    };

    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(match header_error {
            Some(e) => ChallengeParseError::Malformed(e),
            None => ChallengeParseError::MissingBody,
        });
    }

    let document = serde_json::from_slice::<PaymentRequired>(body)
        .map_err(|e| ChallengeParseError::Malformed(e.to_string()))?;
    let version = match document.x402_version {
        Some(2) => X402Version::V2,
        _ => X402Version::V1,
    };
    #[cfg(feature = "telemetry")]
    debug!(%version, "Parsed challenge from body");
    into_challenge(version, document)
}

fn into_challenge(
    version: X402Version,
    document: PaymentRequired,
) -> Result<PaymentChallenge, ChallengeParseError> {
    let challenge = PaymentChallenge::new(version, document.accepts)
        .ok_or(ChallengeParseError::NoAcceptableRequirements)?;
    Ok(challenge
        .with_resource(document.resource)
        .with_error(document.error))
}
