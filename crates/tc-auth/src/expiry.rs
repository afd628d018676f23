//! Normalizing the many ways providers express token lifetimes

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::DateTime;
use tc_cache::SetOptions;

use crate::errors::{AuthError, Result};

/// Parse an ISO 8601 / RFC 3339 timestamp into epoch milliseconds
pub fn iso_to_ms(timestamp: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(timestamp)
        .ok()
        .map(|t| t.timestamp_millis())
}

/// Absolute expiry for a relative lifetime in seconds
pub fn after_seconds(obtained_on: i64, expires_in: u64) -> i64 {
    let lifetime_ms = i64::try_from(expires_in)
        .unwrap_or(i64::MAX)
        .saturating_mul(1000);
    obtained_on.saturating_add(lifetime_ms)
}

/// Cache options for an optional absolute expiry; absent falls back to the default horizon
pub fn set_options(obtained_on: i64, expires_on: Option<i64>) -> SetOptions {
    SetOptions {
        obtained_on: Some(obtained_on),
        expires_on,
    }
}

/// Decode the claims segment of a compact JWT without verifying it
pub fn jwt_claims(step: &'static str, token: &str) -> Result<serde_json::Value> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::invalid_response(step, "token is not a JWT"))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::invalid_response(step, format!("bad JWT encoding: {e}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// `exp` claim of a JWT in epoch milliseconds; out-of-range values count as absent
pub fn jwt_exp_ms(step: &'static str, token: &str) -> Result<Option<i64>> {
    let claims = jwt_claims(step, token)?;
    Ok(claims
        .get("exp")
        .and_then(|exp| exp.as_i64())
        .and_then(|exp| exp.checked_mul(1000)))
}

#[cfg(test)]
pub(crate) fn fake_jwt(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES384","x5u":"key"}"#);
    let body = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{body}.c2ln")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_iso_with_seven_fraction_digits() {
        let ms = iso_to_ms("2024-01-15T00:00:00.1234567Z").unwrap();
        assert_eq!(ms, 1_705_276_800_123);
        assert_eq!(iso_to_ms("yesterday"), None);
    }

    #[test]
    fn test_jwt_exp() {
        let token = fake_jwt(&json!({ "exp": 1_700_000_000 }));
        assert_eq!(jwt_exp_ms("test", &token).unwrap(), Some(1_700_000_000_000));

        let no_exp = fake_jwt(&json!({ "sub": "x" }));
        assert_eq!(jwt_exp_ms("test", &no_exp).unwrap(), None);

        let huge = fake_jwt(&json!({ "exp": i64::MAX }));
        assert_eq!(jwt_exp_ms("test", &huge).unwrap(), None);
    }

    #[test]
    fn test_not_a_jwt() {
        assert!(matches!(
            jwt_claims("test", "opaque"),
            Err(AuthError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_after_seconds() {
        assert_eq!(after_seconds(1_000, 60), 61_000);
        assert_eq!(after_seconds(1_000, u64::MAX), i64::MAX);
    }
}
