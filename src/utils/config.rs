// src/utils/config.rs
//! Interposer configuration from the process environment
//!
//! The shim has no config file: everything arrives through environment
//! variables injected by the launcher (or set by hand). Parsing happens once
//! at runtime init and the result is immutable for the process lifetime.

use std::env;
use std::path::PathBuf;

/// Environment variable naming the identity bundle list
pub const ENV_IDENTITIES: &str = "SOCKVEIL_IDENTITIES";

/// Environment variable overriding the overlay domain suffixes
pub const ENV_DOMAINS: &str = "SOCKVEIL_DOMAINS";

/// Environment variable holding the log filter (EnvFilter syntax)
pub const ENV_LOG: &str = "SOCKVEIL_LOG";

/// Environment variable redirecting the side log channel to a file
pub const ENV_LOG_FILE: &str = "SOCKVEIL_LOG_FILE";

/// Default overlay top-level suffix
pub const DEFAULT_DOMAIN: &str = ".ziti";

/// Interposer configuration
#[derive(Debug, Clone)]
pub struct ShimConfig {
    /// Identity bundle paths, in load order
    pub identity_sources: Vec<PathBuf>,

    /// Overlay domain suffixes, lowercase, each with a leading dot
    pub overlay_domains: Vec<String>,

    /// Log filter directive, if any
    pub log_filter: Option<String>,

    /// Side log file path; stderr when absent
    pub log_file: Option<PathBuf>,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            identity_sources: vec![],
            overlay_domains: vec![DEFAULT_DOMAIN.to_string()],
            log_filter: None,
            log_file: None,
        }
    }
}

impl ShimConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Self {
        let identity_sources = env::var(ENV_IDENTITIES)
            .map(|v| split_sources(&v))
            .unwrap_or_default();

        let overlay_domains = env::var(ENV_DOMAINS)
            .map(|v| split_domains(&v))
            .ok()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_DOMAIN.to_string()]);

        Self {
            identity_sources,
            overlay_domains,
            log_filter: env::var(ENV_LOG).ok().filter(|v| !v.is_empty()),
            log_file: env::var(ENV_LOG_FILE).ok().map(PathBuf::from),
        }
    }
}

/// Split an identity source list on `:` and `,`
fn split_sources(raw: &str) -> Vec<PathBuf> {
    raw.split([':', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Split and normalize a domain suffix list: lowercase, leading dot enforced
fn split_domains(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let lower = s.to_ascii_lowercase();
            if lower.starts_with('.') {
                lower
            } else {
                format!(".{lower}")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_domain() {
        let config = ShimConfig::default();
        assert_eq!(config.overlay_domains, vec![".ziti".to_string()]);
        assert!(config.identity_sources.is_empty());
    }

    #[test]
    fn test_split_sources_colon_and_comma() {
        let sources = split_sources("/a/id.json:/b/id.json,/c/id.json");
        assert_eq!(sources.len(), 3);
        assert_eq!(sources[0], PathBuf::from("/a/id.json"));
        assert_eq!(sources[2], PathBuf::from("/c/id.json"));
    }

    #[test]
    fn test_split_sources_skips_empty_segments() {
        let sources = split_sources("::/a/id.json,,");
        assert_eq!(sources.len(), 1);
    }

    #[test]
    fn test_split_domains_normalized() {
        let domains = split_domains("Ziti, .Corp ,private");
        assert_eq!(domains, vec![".ziti", ".corp", ".private"]);
    }
}
