//! Small accessors over KDL nodes.
//!
//! Settings are written as child nodes with a single argument
//! (`interval-secs 300`), lists as child nodes with several arguments
//! (`preference "cloud" "free-acme"`).

use kdl::{KdlNode, KdlValue};

/// Find a direct child node by name
pub fn child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()?
        .nodes()
        .iter()
        .find(|n| n.name().value() == name)
}

/// Positional (unnamed) argument values of a node
fn args(node: &KdlNode) -> impl Iterator<Item = &KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
}

fn first_arg<'a>(node: &'a KdlNode, key: &str) -> Option<&'a KdlValue> {
    child(node, key).and_then(|c| args(c).next())
}

pub fn get_string_entry(node: &KdlNode, key: &str) -> Option<String> {
    first_arg(node, key)
        .and_then(|v| v.as_string())
        .map(str::to_string)
}

pub fn get_int_entry(node: &KdlNode, key: &str) -> Option<i128> {
    first_arg(node, key).and_then(|v| v.as_integer())
}

pub fn get_bool_entry(node: &KdlNode, key: &str) -> Option<bool> {
    first_arg(node, key).and_then(|v| v.as_bool())
}

/// All string arguments of a child node
pub fn get_string_args(node: &KdlNode, key: &str) -> Vec<String> {
    child(node, key)
        .map(|c| {
            args(c)
                .filter_map(|v| v.as_string())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Unsigned integer setting; negative or oversized values are an error
pub fn get_u64_entry(node: &KdlNode, key: &str) -> anyhow::Result<Option<u64>> {
    match get_int_entry(node, key) {
        None => Ok(None),
        Some(v) => u64::try_from(v).map(Some).map_err(|_| {
            anyhow::anyhow!(
                "'{}' in '{}' must be a non-negative integer, got {}",
                key,
                node.name().value(),
                v
            )
        }),
    }
}

/// Read a secret either inline (`password "..."`) or from the environment
/// (`password-env "VAR"`)
pub fn get_secret_entry(node: &KdlNode, key: &str) -> anyhow::Result<Option<String>> {
    if let Some(value) = get_string_entry(node, key) {
        return Ok(Some(value));
    }

    let env_key = format!("{}-env", key);
    match get_string_entry(node, &env_key) {
        Some(var) => std::env::var(&var).map(Some).map_err(|_| {
            anyhow::anyhow!(
                "'{}' in '{}' names environment variable '{}' which is not set",
                env_key,
                node.name().value(),
                var
            )
        }),
        None => Ok(None),
    }
}
