//! Primary domain extraction for commercial CA orders
//!
//! The reseller API is inconsistent about where it reports an order's
//! domain. Candidates are tried in a fixed order and the first one that
//! passes the domain syntax rule wins:
//!
//! 1. explicit `domain` field
//! 2. `domains` list
//! 3. SAN list
//! 4. Common Name of the submitted CSR
//! 5. host of a domain-validation URL
//!
//! Upstream order ids (`B12345`) are skipped quietly. Any other candidate
//! that is not a domain is logged as an anomaly.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::domain::{is_valid_domain, normalize};

/// Shapes the upstream uses for its own order and product ids
static ID_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[A-Za-z]{0,4}-?\d{3,}$").ok());

fn looks_like_upstream_id(candidate: &str) -> bool {
    ID_PATTERN.as_ref().is_some_and(|re| re.is_match(candidate))
}

/// Every place a commercial CA response may carry the domain
#[derive(Debug, Clone, Default)]
pub struct DomainSources {
    pub domain: Option<String>,
    pub domains: Vec<String>,
    pub san: Vec<String>,
    pub csr_pem: Option<String>,
    pub validation_urls: Vec<String>,
}

impl DomainSources {
    /// Collect candidates from an upstream order document
    pub fn from_order(doc: &Value) -> Self {
        Self {
            domain: doc
                .get("domain")
                .or_else(|| doc.get("common_name"))
                .and_then(Value::as_str)
                .map(str::to_string),
            domains: string_list(doc.get("domains")),
            san: string_list(doc.get("san").or_else(|| doc.get("dns_names"))),
            csr_pem: doc.get("csr").and_then(Value::as_str).map(str::to_string),
            validation_urls: string_list(doc.get("validation_urls")),
        }
    }
}

/// Arrays of strings, or a single comma separated string
fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Common Name from the subject of a PEM-encoded CSR
pub fn csr_common_name(csr_pem: &str) -> Option<String> {
    use x509_parser::certification_request::X509CertificationRequest;
    use x509_parser::pem::parse_x509_pem;
    use x509_parser::prelude::FromDer;

    let (_, pem) = parse_x509_pem(csr_pem.as_bytes())
        .map_err(|e| debug!(error = %e, "CSR is not valid PEM"))
        .ok()?;
    let (_, csr) = X509CertificationRequest::from_der(&pem.contents)
        .map_err(|e| debug!(error = %e, "CSR DER did not parse"))
        .ok()?;

    let cn = csr
        .certification_request_info
        .subject
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);
    cn
}

fn url_host(raw: &str) -> Option<String> {
    url::Url::parse(raw.trim())
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

/// Check one candidate; `None` moves on to the next
fn accept(source: &'static str, raw: &str) -> Option<String> {
    let candidate = normalize(raw);
    if candidate.is_empty() {
        return None;
    }
    if is_valid_domain(&candidate) {
        trace!(source, domain = %candidate, "Domain candidate accepted");
        return Some(candidate);
    }
    if looks_like_upstream_id(raw.trim()) {
        debug!(source, candidate = %raw, "Skipping upstream id in domain field");
    } else {
        warn!(source, candidate = %raw, "Unrecognised domain candidate shape");
    }
    None
}

/// First syntactically valid domain in the fallback chain
pub fn extract_domain(sources: &DomainSources) -> Option<String> {
    if let Some(found) = sources.domain.as_deref().and_then(|d| accept("domain", d)) {
        return Some(found);
    }
    if let Some(found) = sources.domains.iter().find_map(|d| accept("domains", d)) {
        return Some(found);
    }
    if let Some(found) = sources.san.iter().find_map(|d| accept("san", d)) {
        return Some(found);
    }
    if let Some(found) = sources
        .csr_pem
        .as_deref()
        .and_then(csr_common_name)
        .and_then(|cn| accept("csr_common_name", &cn))
    {
        return Some(found);
    }
    sources
        .validation_urls
        .iter()
        .filter_map(|u| url_host(u))
        .find_map(|host| accept("validation_url", &host))
}
