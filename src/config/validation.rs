//! Configuration validation logic.

use http::Uri;

use crate::config::schema::ProxyConfig;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation error: {}", self.0)
    }
}

/// Validate a ProxyConfig for semantic correctness.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    // 1. Metrics sampler bounds
    if config.stats.bufsize < 2 {
        errors.push(ValidationError(
            "stats.bufsize must be greater than or equal to 2".to_string(),
        ));
    }
    if config.stats.spfactor < 1 {
        errors.push(ValidationError(
            "stats.spfactor must be greater than 0".to_string(),
        ));
    }

    // 2. Fixed upstream URL shape
    if !config.upstream.is_empty() {
        match config.upstream.parse::<Uri>() {
            Ok(uri) => {
                match uri.scheme_str() {
                    Some("http") | Some("https") => {}
                    _ => errors.push(ValidationError(
                        "upstream url scheme should be http or https".to_string(),
                    )),
                }
                if uri.host().is_none_or(str::is_empty) {
                    errors.push(ValidationError("upstream url has no hostname".to_string()));
                }
            }
            Err(err) => {
                errors.push(ValidationError(format!("upstream url is invalid: {}", err)));
            }
        }
    }

    // 3. Timeouts (basic check)
    if config.timeouts.write_secs == 0 || config.timeouts.proxy_read_secs == 0 {
        tracing::warn!("timeouts are set to 0, requests might time out immediately");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
