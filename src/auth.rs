use crate::config::AppConfig;
use crate::error::RelayError;
use http::header::AUTHORIZATION;
use rustc_hash::FxHashSet;

/// Compact key index used in hot-path authentication.
pub enum AllowedClientKeys {
    Empty,
    Single { raw: Box<str>, bearer: Box<str> },
    Multiple(FxHashSet<String>),
}

/// Extract the client key from `Authorization: Bearer <key>`.
///
/// # Errors
///
/// Returns `RelayError::Auth` when no bearer key is present.
pub fn extract_api_key(headers: &http::HeaderMap) -> Result<&str, RelayError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .ok_or_else(|| RelayError::Auth("Missing API key".to_string()))
}

/// Authenticate an incoming request by checking its bearer key against
/// pre-indexed `allowed_keys`.
///
/// # Errors
///
/// Returns `RelayError::Auth` when the API key is missing or invalid.
pub fn authenticate(
    headers: &http::HeaderMap,
    allowed_keys: &AllowedClientKeys,
) -> Result<(), RelayError> {
    match allowed_keys {
        AllowedClientKeys::Single { bearer, .. } => match headers.get(AUTHORIZATION) {
            Some(value) if value.as_bytes() == bearer.as_bytes() => Ok(()),
            Some(_) => Err(RelayError::Auth("Invalid API key".to_string())),
            None => Err(RelayError::Auth("Missing API key".to_string())),
        },
        AllowedClientKeys::Multiple(allowed_set) => {
            let client_key = extract_api_key(headers)?;
            if allowed_set.contains(client_key) {
                Ok(())
            } else {
                Err(RelayError::Auth("Invalid API key".to_string()))
            }
        }
        AllowedClientKeys::Empty => Err(RelayError::Auth("Invalid API key".to_string())),
    }
}

/// Build a hash-set index for allowed client keys.
#[must_use]
pub fn build_allowed_key_set(config: &AppConfig) -> AllowedClientKeys {
    let mut allowed_set: FxHashSet<String> = config
        .client_authentication
        .allowed_keys
        .iter()
        .cloned()
        .collect();

    match allowed_set.len() {
        0 => AllowedClientKeys::Empty,
        1 => match allowed_set.drain().next() {
            Some(single_key) => AllowedClientKeys::Single {
                bearer: format!("Bearer {single_key}").into_boxed_str(),
                raw: single_key.into_boxed_str(),
            },
            None => AllowedClientKeys::Empty,
        },
        _ => AllowedClientKeys::Multiple(allowed_set),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientAuthConfig, FeaturesConfig, ServerConfig, UpstreamConfig};

    fn make_config(allowed_keys: Vec<String>) -> AppConfig {
        AppConfig {
            server: ServerConfig::default(),
            upstream: UpstreamConfig {
                base_url: "http://127.0.0.1:9".into(),
                api_key: "k".into(),
                chat_path: "/chat".into(),
                models_path: None,
            },
            models: vec![],
            client_authentication: ClientAuthConfig { allowed_keys },
            features: FeaturesConfig::default(),
        }
    }

    fn bearer(key: &str) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        headers.insert("authorization", format!("Bearer {key}").parse().unwrap());
        headers
    }

    #[test]
    fn test_extract_bearer() {
        let headers = bearer("sk-test123");
        assert_eq!(extract_api_key(&headers).unwrap(), "sk-test123");
    }

    #[test]
    fn test_extract_missing_key() {
        let headers = http::HeaderMap::new();
        let err = extract_api_key(&headers).unwrap_err();
        assert!(matches!(err, RelayError::Auth(ref message) if message == "Missing API key"));
    }

    #[test]
    fn test_extract_rejects_non_bearer_scheme() {
        let mut headers = http::HeaderMap::new();
        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert!(extract_api_key(&headers).is_err());
    }

    #[test]
    fn test_authenticate_single_key() {
        let key_index = build_allowed_key_set(&make_config(vec!["valid-key".to_string()]));
        assert!(authenticate(&bearer("valid-key"), &key_index).is_ok());
        let err = authenticate(&bearer("wrong-key"), &key_index).unwrap_err();
        assert!(matches!(err, RelayError::Auth(ref message) if message == "Invalid API key"));
        let err = authenticate(&http::HeaderMap::new(), &key_index).unwrap_err();
        assert!(matches!(err, RelayError::Auth(ref message) if message == "Missing API key"));
    }

    #[test]
    fn test_authenticate_multiple_keys() {
        let key_index =
            build_allowed_key_set(&make_config(vec!["a".to_string(), "b".to_string()]));
        assert!(authenticate(&bearer("a"), &key_index).is_ok());
        assert!(authenticate(&bearer("b"), &key_index).is_ok());
        assert!(authenticate(&bearer("c"), &key_index).is_err());
    }

    #[test]
    fn test_build_allowed_key_set_multiple() {
        let config = make_config(vec!["a".to_string(), "b".to_string(), "a".to_string()]);
        match build_allowed_key_set(&config) {
            AllowedClientKeys::Multiple(set) => {
                assert!(set.contains("a"));
                assert!(set.contains("b"));
                assert_eq!(set.len(), 2);
            }
            _ => panic!("expected multiple-key index"),
        }
    }

    #[test]
    fn test_build_allowed_key_set_single() {
        let config = make_config(vec!["single".to_string(), "single".to_string()]);
        match build_allowed_key_set(&config) {
            AllowedClientKeys::Single { raw, bearer } => {
                assert_eq!(raw.as_ref(), "single");
                assert_eq!(bearer.as_ref(), "Bearer single");
            }
            _ => panic!("expected single-key index"),
        }
    }

    #[test]
    fn test_build_allowed_key_set_empty() {
        let index = build_allowed_key_set(&make_config(vec![]));
        assert!(matches!(index, AllowedClientKeys::Empty));
        assert!(authenticate(&bearer("x"), &index).is_err());
    }
}
