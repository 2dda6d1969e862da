use std::collections::HashSet;

use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_allowed_keys(config)?;
    validate_upstream(config)?;
    validate_models(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if server.timeout == 0 {
        return Err(validation_err("server.timeout must be greater than 0"));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    Ok(())
}

fn validate_allowed_keys(config: &AppConfig) -> Result<(), ConfigError> {
    if config.client_authentication.allowed_keys.is_empty() {
        return Err(validation_err("allowed_keys cannot be empty"));
    }
    for key in &config.client_authentication.allowed_keys {
        if key.trim().is_empty() {
            return Err(validation_err("allowed_keys contains an empty key"));
        }
    }
    Ok(())
}

fn validate_upstream(config: &AppConfig) -> Result<(), ConfigError> {
    let upstream = &config.upstream;
    let parsed = url::Url::parse(&upstream.base_url)
        .map_err(|err| validation_err(format!("upstream.base_url is not a valid URL: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(
            "upstream.base_url must use http:// or https://",
        ));
    }
    if upstream.api_key.trim().is_empty() {
        return Err(validation_err(format!(
            "upstream.api_key cannot be empty (set it in the file or via {})",
            super::UPSTREAM_API_KEY_ENV
        )));
    }
    if let Some(models_path) = upstream.models_path.as_deref() {
        if models_path.trim().is_empty() {
            return Err(validation_err(
                "upstream.models_path cannot be empty when set",
            ));
        }
    }
    Ok(())
}

fn validate_models(config: &AppConfig) -> Result<(), ConfigError> {
    if config.models.is_empty() && config.upstream.models_path.is_none() {
        return Err(validation_err(
            "models cannot be empty when upstream.models_path is disabled",
        ));
    }

    let mut seen = HashSet::with_capacity(config.models.len());
    for entry in &config.models {
        if entry.id.trim().is_empty() {
            return Err(validation_err("models contains an entry with an empty id"));
        }
        if entry.provider.trim().is_empty() || entry.name.trim().is_empty() {
            return Err(validation_err(format!(
                "Model '{}': provider and name must not be empty",
                entry.id
            )));
        }
        if !seen.insert(entry.id.as_str()) {
            return Err(validation_err(format!(
                "Model '{}' is listed more than once",
                entry.id
            )));
        }
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}
