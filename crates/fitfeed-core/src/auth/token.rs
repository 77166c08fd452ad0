//! Reading the `exp` claim out of an access token.
//!
//! The signature is never checked: the client only needs to know when the
//! server will stop accepting the token, and the server remains the
//! authority on validity.

use std::time::Duration;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// JWT segments are base64url without padding, but some issuers pad anyway.
const JWT_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Token has no payload segment")]
    MissingPayload,

    #[error("Token payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Token payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Token payload has no usable exp claim")]
    MissingExpiry,
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<f64>,
}

/// Decode the `exp` claim of a JWT, in epoch milliseconds
pub fn decode_expiry_millis(token: &str) -> Result<i64, TokenError> {
    let payload = token
        .split('.')
        .nth(1)
        .filter(|s| !s.is_empty())
        .ok_or(TokenError::MissingPayload)?;
    let bytes = JWT_ENGINE.decode(payload)?;
    let claims: Claims = serde_json::from_slice(&bytes)?;

    match claims.exp {
        Some(exp) if exp.is_finite() && exp > 0.0 => Ok((exp * 1000.0) as i64),
        _ => Err(TokenError::MissingExpiry),
    }
}

/// Expiry of `token`, or `now + default_validity` when it cannot be decoded.
///
/// The fallback is an approximation with no confirmation from the server;
/// the reactive refresh path covers the case where it guesses too long.
pub fn expiry_or_default(token: &str, now_millis: i64, default_validity: Duration) -> i64 {
    match decode_expiry_millis(token) {
        Ok(expiry) => expiry,
        Err(e) => {
            warn!(error = %e, "Failed to decode token expiry, assuming default validity");
            now_millis + default_validity.as_millis() as i64
        }
    }
}

#[cfg(test)]
pub(crate) fn make_jwt(exp_secs: i64, subject: &str) -> String {
    let header = JWT_ENGINE.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = JWT_ENGINE.encode(format!(r#"{{"sub":"{}","exp":{}}}"#, subject, exp_secs));
    format!("{}.{}.signature", header, claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_expiry() {
        let token = make_jwt(1_700_000_000, "liftlarry");
        assert_eq!(decode_expiry_millis(&token).unwrap(), 1_700_000_000_000);
    }

    #[test]
    fn test_decode_padded_payload() {
        let payload = base64::engine::general_purpose::URL_SAFE.encode(r#"{"exp":1700000000}"#);
        let token = format!("h.{}.s", payload);
        assert_eq!(decode_expiry_millis(&token).unwrap(), 1_700_000_000_000);
    }

    #[test]
    fn test_decode_failures() {
        assert!(matches!(decode_expiry_millis("opaque"), Err(TokenError::MissingPayload)));
        assert!(matches!(decode_expiry_millis("a..c"), Err(TokenError::MissingPayload)));
        assert!(matches!(decode_expiry_millis("a.!!!.c"), Err(TokenError::Base64(_))));

        let not_json = JWT_ENGINE.encode("not json");
        assert!(matches!(
            decode_expiry_millis(&format!("a.{}.c", not_json)),
            Err(TokenError::Json(_))
        ));

        let no_exp = JWT_ENGINE.encode(r#"{"sub":"x"}"#);
        assert!(matches!(
            decode_expiry_millis(&format!("a.{}.c", no_exp)),
            Err(TokenError::MissingExpiry)
        ));
    }

    #[test]
    fn test_expiry_or_default_falls_back() {
        let now = 1_000_000;
        let expiry = expiry_or_default("garbage", now, Duration::from_secs(15 * 60));
        assert_eq!(expiry, now + 15 * 60 * 1000);

        let token = make_jwt(5_000, "x");
        assert_eq!(expiry_or_default(&token, now, Duration::from_secs(60)), 5_000_000);
    }
}
