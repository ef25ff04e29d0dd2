//! Engine, order, validation, polling, renewal and EAB KDL parsing.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Result;
use kdl::KdlNode;
use tracing::trace;

use crate::sections::*;

use super::helpers::{get_string_args, get_string_entry, get_u64_entry};

/// Parse `engine { ... }`
pub fn parse_engine(node: &KdlNode) -> Result<EngineConfig> {
    let defaults = EngineConfig::default();
    let config = EngineConfig {
        data_dir: get_string_entry(node, "data-dir")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir),
        worker_tick_secs: get_u64_entry(node, "worker-tick-secs")?
            .unwrap_or(defaults.worker_tick_secs),
    };

    trace!(
        data_dir = %config.data_dir.display(),
        worker_tick_secs = config.worker_tick_secs,
        "Parsed engine configuration"
    );
    Ok(config)
}

/// Parse `orders { ... }`
pub fn parse_orders(node: &KdlNode) -> Result<OrderConfig> {
    let defaults = OrderConfig::default();
    Ok(OrderConfig {
        order_ttl_hours: get_u64_entry(node, "order-ttl-hours")?
            .unwrap_or(defaults.order_ttl_hours),
        authorization_ttl_hours: get_u64_entry(node, "authorization-ttl-hours")?
            .unwrap_or(defaults.authorization_ttl_hours),
    })
}

/// Parse `validation { ... }`
pub fn parse_validation(node: &KdlNode) -> Result<ChallengeValidationConfig> {
    let defaults = ChallengeValidationConfig::default();

    let mut dns_nameservers = Vec::new();
    for raw in get_string_args(node, "dns-nameservers") {
        let ip: IpAddr = raw
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid nameserver address '{}' in 'validation'", raw))?;
        dns_nameservers.push(ip);
    }

    let http_attempts = match get_u64_entry(node, "http-attempts")? {
        Some(v) => u32::try_from(v)
            .map_err(|_| anyhow::anyhow!("'http-attempts' is out of range: {}", v))?,
        None => defaults.http_attempts,
    };

    let config = ChallengeValidationConfig {
        http_timeout_secs: get_u64_entry(node, "http-timeout-secs")?
            .unwrap_or(defaults.http_timeout_secs),
        http_attempts,
        http_retry_backoff_ms: get_u64_entry(node, "http-retry-backoff-ms")?
            .unwrap_or(defaults.http_retry_backoff_ms),
        http_port: match get_u64_entry(node, "http-port")? {
            Some(v) => u16::try_from(v)
                .map_err(|_| anyhow::anyhow!("'http-port' is out of range: {}", v))?,
            None => defaults.http_port,
        },
        dns_nameservers,
        dns_timeout_secs: get_u64_entry(node, "dns-timeout-secs")?
            .unwrap_or(defaults.dns_timeout_secs),
    };

    trace!(
        http_timeout_secs = config.http_timeout_secs,
        http_attempts = config.http_attempts,
        nameservers = config.dns_nameservers.len(),
        "Parsed validation configuration"
    );
    Ok(config)
}

/// Parse `polling { ... }`
pub fn parse_polling(node: &KdlNode) -> Result<PollingConfig> {
    let defaults = PollingConfig::default();
    let max_attempts = match get_u64_entry(node, "max-attempts")? {
        Some(v) => {
            u32::try_from(v).map_err(|_| anyhow::anyhow!("'max-attempts' is out of range: {}", v))?
        }
        None => defaults.max_attempts,
    };

    Ok(PollingConfig {
        interval_secs: get_u64_entry(node, "interval-secs")?.unwrap_or(defaults.interval_secs),
        max_attempts,
    })
}

/// Parse `renewal { ... }`
pub fn parse_renewal(node: &KdlNode) -> Result<RenewalConfig> {
    let renew_before_days = match get_u64_entry(node, "renew-before-days")? {
        Some(v) => u32::try_from(v)
            .map_err(|_| anyhow::anyhow!("'renew-before-days' is out of range: {}", v))?,
        None => RenewalConfig::default().renew_before_days,
    };
    Ok(RenewalConfig { renew_before_days })
}

/// Parse `eab { ... }` plan quotas
pub fn parse_eab(node: &KdlNode) -> Result<EabConfig> {
    let defaults = EabConfig::default();
    let quota = |key: &str, default: u32| -> Result<u32> {
        match get_u64_entry(node, key)? {
            Some(v) => u32::try_from(v)
                .map_err(|_| anyhow::anyhow!("EAB quota '{}' is out of range: {}", key, v)),
            None => Ok(default),
        }
    };

    Ok(EabConfig {
        basic: quota("basic", defaults.basic)?,
        professional: quota("professional", defaults.professional)?,
        enterprise: quota("enterprise", defaults.enterprise)?,
    })
}
