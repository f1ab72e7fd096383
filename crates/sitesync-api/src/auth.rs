//! Shared-secret checks for node-to-node requests

use axum::http::HeaderMap;
use sitesync_core::transport::wire::{API_KEY_HEADER, SERVER_ID_HEADER};

use crate::error::AppError;

pub fn extract_api_key(headers: &HeaderMap) -> Result<&str, AppError> {
    let value = headers
        .get(API_KEY_HEADER)
        .ok_or_else(|| AppError::unauthorized("Missing x-api-key header"))?;
    let key = value
        .to_str()
        .map_err(|_| AppError::unauthorized("x-api-key header is not valid UTF-8"))?
        .trim();
    if key.is_empty() {
        return Err(AppError::unauthorized("Empty x-api-key header"));
    }
    Ok(key)
}

/// Calling node, when it identified itself
pub fn caller_server_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SERVER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

/// Compare without short-circuiting on the first differing byte
pub fn keys_match(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.as_bytes();
    if expected.len() != provided.len() {
        return false;
    }
    expected
        .iter()
        .zip(provided)
        .fold(0_u8, |diff, (left, right)| diff | (left ^ right))
        == 0
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn api_key_extractor_accepts_header() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static(" secret "));

        assert_eq!(extract_api_key(&headers).unwrap(), "secret");
    }

    #[test]
    fn api_key_extractor_rejects_missing_or_empty() {
        let mut headers = HeaderMap::new();
        assert!(extract_api_key(&headers).is_err());

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("  "));
        assert!(extract_api_key(&headers).is_err());
    }

    #[test]
    fn server_id_header_is_optional() {
        let mut headers = HeaderMap::new();
        assert_eq!(caller_server_id(&headers), None);

        headers.insert(SERVER_ID_HEADER, HeaderValue::from_static("site-a"));
        assert_eq!(caller_server_id(&headers).as_deref(), Some("site-a"));
    }

    #[test]
    fn keys_match_requires_exact_value() {
        assert!(keys_match("secret", "secret"));
        assert!(!keys_match("secret", "secreT"));
        assert!(!keys_match("secret", "secret2"));
    }
}
