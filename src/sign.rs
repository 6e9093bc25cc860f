// ===============================
// src/sign.rs
// ===============================
//
// HMAC-SHA256 request signatures in the two canonical shapes the supported
// exchanges use:
// - query-string signing (Binance): signature over the encoded query
// - verb+path+expires+body signing (Bitmex): signature over the
//   concatenation, with `expires` doubling as the anti-replay nonce
//
// Signing is pure: same inputs, same hex output. Timestamps/expiries are
// produced by the callers and passed in.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ApiError;

type HmacSha256 = Hmac<Sha256>;

pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Unix-seconds expiry for expiring signatures, `lead` seconds ahead.
pub fn expires_secs(lead: u64) -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    (now + lead) as i64
}

pub fn hmac_sha256_hex(secret: &str, message: &str) -> Result<String, ApiError> {
    if secret.is_empty() {
        return Err(ApiError::Crypto("empty api secret".into()));
    }
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ApiError::Crypto(e.to_string()))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Query-string canonicalization: the signature covers exactly the encoded
/// query that goes on the wire.
pub fn sign_query(secret: &str, query: &str) -> Result<String, ApiError> {
    hmac_sha256_hex(secret, query)
}

/// Verb+path+expires+body canonicalization. `path` includes the query string
/// for GET/DELETE, `body` is the form payload for POST (empty otherwise).
pub fn sign_request(
    secret: &str,
    verb: &str,
    path: &str,
    expires: i64,
    body: &str,
) -> Result<String, ApiError> {
    hmac_sha256_hex(secret, &format!("{verb}{path}{expires}{body}"))
}

/// Encode `(key, value)` pairs into a query string, percent-encoding values.
pub fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_sha256_known_vector() {
        // RFC-style reference vector
        let sig = hmac_sha256_hex("key", "The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(
            sig,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn query_signing_matches_binance_docs_example() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn request_signing_is_deterministic_and_covers_all_parts() {
        let a = sign_request("s3cret", "GET", "/api/v1/order?reverse=true", 1700000000, "").unwrap();
        let b = sign_request("s3cret", "GET", "/api/v1/order?reverse=true", 1700000000, "").unwrap();
        assert_eq!(a, b);
        let c = sign_request("s3cret", "GET", "/api/v1/order?reverse=true", 1700000001, "").unwrap();
        assert_ne!(a, c);
        // identical to hand-concatenated input
        let manual =
            hmac_sha256_hex("s3cret", "GET/api/v1/order?reverse=true1700000000").unwrap();
        assert_eq!(a, manual);
    }

    #[test]
    fn empty_secret_is_a_crypto_error() {
        let err = sign_query("", "a=1").unwrap_err();
        assert!(matches!(err, ApiError::Crypto(_)));
    }

    #[test]
    fn encode_query_percent_encodes_values() {
        let q = encode_query(&[
            ("filter", r#"{"open":"true"}"#.to_string()),
            ("count", "10".to_string()),
        ]);
        assert_eq!(q, "filter=%7B%22open%22%3A%22true%22%7D&count=10");
    }
}
