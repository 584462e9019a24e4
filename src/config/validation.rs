use crate::config::types::{Config, OutputConfig, ProxyConfig, ScraperConfig};
use crate::ConfigError;
use url::Url;

/// Upper bound for concurrent detail fetches
const MAX_CONCURRENCY: usize = 32;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_scraper_config(&config.scraper)?;
    validate_proxy_config(&config.proxy)?;
    validate_output_config(&config.output)?;
    Ok(())
}

/// Validates fetch, retry and polling settings
fn validate_scraper_config(config: &ScraperConfig) -> Result<(), ConfigError> {
    let base = Url::parse(&config.base_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid base-url: {}", e)))?;

    if base.scheme() != "http" && base.scheme() != "https" {
        return Err(ConfigError::InvalidUrl(format!(
            "base-url must use http or https, got '{}'",
            config.base_url
        )));
    }

    config
        .index_url()
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid search-path: {}", e)))?;

    if config.max_retries < 1 {
        return Err(ConfigError::Validation(
            "max-retries must be >= 1".to_string(),
        ));
    }

    if config.detail_max_retries < 1 {
        return Err(ConfigError::Validation(
            "detail-max-retries must be >= 1".to_string(),
        ));
    }

    if config.request_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "request-timeout-secs must be >= 1".to_string(),
        ));
    }

    if config.concurrency_limit < 1 || config.concurrency_limit > MAX_CONCURRENCY {
        return Err(ConfigError::Validation(format!(
            "concurrency-limit must be between 1 and {}, got {}",
            MAX_CONCURRENCY, config.concurrency_limit
        )));
    }

    if !config.backoff_factor.is_finite() || config.backoff_factor < 1.0 {
        return Err(ConfigError::Validation(format!(
            "backoff-factor must be >= 1.0, got {}",
            config.backoff_factor
        )));
    }

    if config.poll_interval_min_ms > config.poll_interval_max_ms {
        return Err(ConfigError::Validation(format!(
            "poll-interval-min-ms ({}) must not exceed poll-interval-max-ms ({})",
            config.poll_interval_min_ms, config.poll_interval_max_ms
        )));
    }

    if config.max_consecutive_failures < 1 {
        return Err(ConfigError::Validation(
            "max-consecutive-failures must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates proxy settings
fn validate_proxy_config(config: &ProxyConfig) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&config.direct_probability) {
        return Err(ConfigError::Validation(format!(
            "direct-probability must be between 0 and 1, got {}",
            config.direct_probability
        )));
    }

    for address in &config.addresses {
        Url::parse(address).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid proxy address '{}': {}", address, e))
        })?;
    }

    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }

    Ok(())
}
