//! Network connectivity validation
//!
//! Checks that configured provider API endpoints accept TCP connections.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Validate provider endpoint reachability
pub async fn validate_endpoints(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    let mut endpoints = Vec::new();
    if let Some(ref commercial) = config.providers.commercial {
        endpoints.push(("commercial", commercial.api_url.as_str()));
    }
    if let Some(ref cloud) = config.providers.cloud {
        endpoints.push(("cloud", cloud.api_url.as_str()));
    }

    for (name, raw) in endpoints {
        let address = match endpoint_address(raw) {
            Ok(address) => address,
            Err(message) => {
                result.add_error(ValidationError::new(
                    ErrorCategory::Network,
                    format!("Provider '{}' endpoint '{}': {}", name, raw, message),
                ));
                continue;
            }
        };

        match timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                result.add_error(ValidationError::new(
                    ErrorCategory::Network,
                    format!("Provider '{}' endpoint '{}' unreachable: {}", name, address, e),
                ));
            }
            Err(_) => {
                result.add_warning(ValidationWarning::new(format!(
                    "Provider '{}' endpoint '{}' connection timeout ({}s)",
                    name,
                    address,
                    CONNECT_TIMEOUT.as_secs()
                )));
            }
        }
    }

    result
}

/// `host:port` for an API base URL
fn endpoint_address(raw: &str) -> Result<String, String> {
    let url = Url::parse(raw).map_err(|e| e.to_string())?;
    let host = url.host_str().ok_or_else(|| "URL has no host".to_string())?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| "URL has no port and an unknown scheme".to_string())?;
    Ok(format!("{}:{}", host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommercialCaConfig, ProvidersConfig};

    #[test]
    fn test_endpoint_address() {
        assert_eq!(
            endpoint_address("https://api.reseller.example/v1").unwrap(),
            "api.reseller.example:443"
        );
        assert_eq!(
            endpoint_address("http://127.0.0.1:8080/").unwrap(),
            "127.0.0.1:8080"
        );
        assert!(endpoint_address("not a url").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let config = Config {
            providers: ProvidersConfig {
                commercial: Some(CommercialCaConfig {
                    // TEST-NET-1, never routable
                    api_url: "https://192.0.2.1:9999".to_string(),
                    username: "u".to_string(),
                    password: "p".to_string(),
                    session_ttl_secs: 3600,
                    batch_size: 50,
                    batch_delay_ms: 0,
                    request_timeout_secs: 30,
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let result = validate_endpoints(&config).await;
        assert!(!result.errors.is_empty() || !result.warnings.is_empty());
    }
}
