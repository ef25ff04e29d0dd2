//! Domain name syntax
//!
//! Shared by identifier validation and the commercial CA's domain
//! extraction. A single leading `*.` label is accepted for wildcards.

use once_cell::sync::Lazy;
use regex::Regex;

/// Maximum length of a DNS name in presentation format
const MAX_DOMAIN_LEN: usize = 253;

static DOMAIN_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^(\*\.)?([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z][a-z0-9-]{0,61}[a-z0-9]$").ok()
});

/// Lowercase, trim and drop a trailing root dot
pub fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Whether `domain` (already normalized) is a syntactically valid host name
pub fn is_valid_domain(domain: &str) -> bool {
    domain.len() <= MAX_DOMAIN_LEN
        && DOMAIN_RE.as_ref().is_some_and(|re| re.is_match(domain))
}

pub fn is_wildcard(domain: &str) -> bool {
    domain.starts_with("*.")
}

/// Domain with any wildcard label removed (`*.example.com` -> `example.com`)
pub fn base_domain(domain: &str) -> &str {
    domain.strip_prefix("*.").unwrap_or(domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_domains() {
        assert!(is_valid_domain("example.com"));
        assert!(is_valid_domain("www.example.co.uk"));
        assert!(is_valid_domain("*.example.com"));
        assert!(is_valid_domain("xn--bcher-kva.example"));
        assert!(is_valid_domain("a-b.example.io"));
    }

    #[test]
    fn test_invalid_domains() {
        assert!(!is_valid_domain("B12345"));
        assert!(!is_valid_domain("b12345"));
        assert!(!is_valid_domain("localhost"));
        assert!(!is_valid_domain("*.*.example.com"));
        assert!(!is_valid_domain("www.*.example.com"));
        assert!(!is_valid_domain("-bad.example.com"));
        assert!(!is_valid_domain("example.123"));
        assert!(!is_valid_domain("exa mple.com"));
        assert!(!is_valid_domain(""));
        assert!(!is_valid_domain(&format!("{}.com", "a.".repeat(130))));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Example.COM. "), "example.com");
        assert_eq!(base_domain("*.example.com"), "example.com");
        assert!(is_wildcard("*.example.com"));
        assert!(!is_wildcard("example.com"));
    }
}
