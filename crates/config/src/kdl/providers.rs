//! Provider KDL parsing.

use anyhow::Result;
use kdl::KdlNode;
use tracing::trace;

use certmill_common::{CircuitBreakerConfig, ProviderKind};

use crate::sections::*;

use super::helpers::{
    child, get_bool_entry, get_secret_entry, get_string_args, get_string_entry, get_u64_entry,
};

/// Parse `providers { ... }`
pub fn parse_providers(node: &KdlNode) -> Result<ProvidersConfig> {
    trace!("Parsing providers configuration block");

    let preference_raw = get_string_args(node, "preference");
    let preference = if preference_raw.is_empty() {
        ProviderKind::ALL.to_vec()
    } else {
        preference_raw
            .iter()
            .map(|s| {
                s.parse::<ProviderKind>().map_err(|e| {
                    anyhow::anyhow!("{} in 'providers.preference'. Valid providers: commercial, cloud, free-acme", e)
                })
            })
            .collect::<Result<Vec<_>>>()?
    };

    let commercial = child(node, "commercial").map(parse_commercial).transpose()?;
    let cloud = child(node, "cloud").map(parse_cloud).transpose()?;
    let free_acme = child(node, "free-acme").map(parse_free_acme).transpose()?;
    let circuit_breaker = child(node, "circuit-breaker")
        .map(parse_circuit_breaker)
        .transpose()?
        .unwrap_or_default();

    let config = ProvidersConfig {
        preference,
        commercial,
        cloud,
        free_acme,
        circuit_breaker,
    };

    trace!(configured = ?config.configured(), "Parsed providers configuration");
    Ok(config)
}

fn parse_free_acme(node: &KdlNode) -> Result<FreeAcmeConfig> {
    let defaults = FreeAcmeConfig::default();
    Ok(FreeAcmeConfig {
        enabled: get_bool_entry(node, "enabled").unwrap_or(true),
        signer_url: get_string_entry(node, "signer-url"),
        signer_timeout_secs: get_u64_entry(node, "signer-timeout-secs")?
            .unwrap_or(defaults.signer_timeout_secs),
    })
}

fn required(node: &KdlNode, key: &str) -> Result<String> {
    get_string_entry(node, key).ok_or_else(|| {
        anyhow::anyhow!(
            "Provider '{}' requires a '{}' field",
            node.name().value(),
            key
        )
    })
}

fn required_secret(node: &KdlNode, key: &str) -> Result<String> {
    get_secret_entry(node, key)?.ok_or_else(|| {
        anyhow::anyhow!(
            "Provider '{}' requires '{}' or '{}-env'",
            node.name().value(),
            key,
            key
        )
    })
}

fn parse_commercial(node: &KdlNode) -> Result<CommercialCaConfig> {
    let batch_size = match get_u64_entry(node, "batch-size")? {
        Some(v) => usize::try_from(v)?,
        None => default_batch_size(),
    };

    Ok(CommercialCaConfig {
        api_url: required(node, "api-url")?,
        username: required(node, "username")?,
        password: required_secret(node, "password")?,
        session_ttl_secs: get_u64_entry(node, "session-ttl-secs")?
            .unwrap_or_else(default_session_ttl),
        batch_size,
        batch_delay_ms: get_u64_entry(node, "batch-delay-ms")?.unwrap_or_else(default_batch_delay),
        request_timeout_secs: get_u64_entry(node, "request-timeout-secs")?
            .unwrap_or_else(default_request_timeout),
    })
}

fn parse_cloud(node: &KdlNode) -> Result<CloudCaConfig> {
    Ok(CloudCaConfig {
        api_url: required(node, "api-url")?,
        project: required(node, "project")?,
        location: get_string_entry(node, "location").unwrap_or_else(default_location),
        access_token: required_secret(node, "access-token")?,
        operation_timeout_secs: get_u64_entry(node, "operation-timeout-secs")?
            .unwrap_or_else(default_operation_timeout),
        operation_poll_secs: get_u64_entry(node, "operation-poll-secs")?
            .unwrap_or_else(default_operation_poll),
        request_timeout_secs: get_u64_entry(node, "request-timeout-secs")?
            .unwrap_or_else(default_request_timeout),
    })
}

fn parse_circuit_breaker(node: &KdlNode) -> Result<CircuitBreakerConfig> {
    let defaults = CircuitBreakerConfig::default();
    let small = |key: &str, default: u32| -> Result<u32> {
        match get_u64_entry(node, key)? {
            Some(v) => Ok(u32::try_from(v)?),
            None => Ok(default),
        }
    };

    Ok(CircuitBreakerConfig {
        failure_threshold: small("failure-threshold", defaults.failure_threshold)?,
        success_threshold: small("success-threshold", defaults.success_threshold)?,
        timeout_seconds: get_u64_entry(node, "timeout-secs")?.unwrap_or(defaults.timeout_seconds),
        half_open_max_requests: small("half-open-max-requests", defaults.half_open_max_requests)?,
    })
}
