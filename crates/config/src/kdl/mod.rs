//! KDL configuration parsing.
//!
//! Top-level nodes map one-to-one onto [`Config`] sections. Unknown
//! top-level nodes are rejected so that typos do not silently fall back
//! to defaults.

use anyhow::Result;
use tracing::trace;

use crate::Config;

mod engine;
mod helpers;
mod providers;

/// Parse a complete KDL document into a [`Config`]
pub fn parse_config(content: &str) -> Result<Config> {
    let doc: ::kdl::KdlDocument = content.parse().map_err(|e: ::kdl::KdlError| {
        let report = miette::Report::new(e);
        anyhow::anyhow!("Invalid KDL configuration:\n{:?}", report)
    })?;

    let mut config = Config::default();

    for node in doc.nodes() {
        let name = node.name().value();
        trace!(section = %name, "Parsing configuration section");

        match name {
            "engine" => config.engine = engine::parse_engine(node)?,
            "orders" => config.orders = engine::parse_orders(node)?,
            "validation" => config.validation = engine::parse_validation(node)?,
            "polling" => config.polling = engine::parse_polling(node)?,
            "renewal" => config.renewal = engine::parse_renewal(node)?,
            "eab" => config.eab = engine::parse_eab(node)?,
            "providers" => config.providers = providers::parse_providers(node)?,
            other => {
                return Err(anyhow::anyhow!(
                    "Unknown configuration section '{}'. Valid sections: engine, orders, validation, polling, renewal, eab, providers",
                    other
                ));
            }
        }
    }

    Ok(config)
}
