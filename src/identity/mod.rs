// src/identity/mod.rs
//! Overlay identities
//!
//! An identity is a credential bundle authorizing use of the overlay network:
//! a JSON file naming the controller endpoint and carrying the credential
//! material. Bundles are loaded once at process start, are immutable for the
//! process lifetime, and are dropped at process exit.

pub mod store;

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::utils::errors::{Result, ShimError};

pub use store::IdentityStore;

/// Credential material carried by a bundle
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialMaterial {
    /// Client certificate, PEM
    pub cert: String,

    /// Client private key, PEM
    pub key: String,

    /// Controller CA bundle, PEM
    #[serde(default)]
    pub ca: Option<String>,
}

/// Validity window for a credential
#[derive(Debug, Clone, Deserialize)]
pub struct ValidityWindow {
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,

    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
}

/// A parsed identity bundle
#[derive(Debug, Clone, Deserialize)]
pub struct Identity {
    /// Identifier, unique within one process
    pub id: String,

    /// Overlay controller endpoint
    pub controller: String,

    /// Credential material
    pub credentials: CredentialMaterial,

    /// Optional validity window
    #[serde(default)]
    pub validity: Option<ValidityWindow>,
}

impl Identity {
    /// Parse a bundle from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            ShimError::Config(format!("unreadable identity bundle {}: {e}", path.display()))
        })?;
        let identity: Identity = serde_json::from_str(&raw).map_err(|e| {
            ShimError::Config(format!("malformed identity bundle {}: {e}", path.display()))
        })?;
        Ok(identity)
    }

    /// Check the validity window against `now`
    pub fn check_validity(&self, now: DateTime<Utc>) -> Result<()> {
        if let Some(window) = &self.validity {
            if let Some(not_before) = window.not_before {
                if now < not_before {
                    return Err(ShimError::Auth(format!(
                        "identity {} not yet valid (not_before {not_before})",
                        self.id
                    )));
                }
            }
            if let Some(not_after) = window.not_after {
                if now > not_after {
                    return Err(ShimError::Auth(format!(
                        "identity {} expired (not_after {not_after})",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::io::Write;

    fn bundle_json(validity: &str) -> String {
        format!(
            r#"{{
                "id": "dev-client",
                "controller": "https://ctrl.example.org:1280",
                "credentials": {{ "cert": "PEM", "key": "PEM", "ca": "PEM" }}{validity}
            }}"#
        )
    }

    #[test]
    fn test_parse_bundle() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bundle_json("").as_bytes()).unwrap();

        let identity = Identity::from_file(file.path()).unwrap();
        assert_eq!(identity.id, "dev-client");
        assert_eq!(identity.controller, "https://ctrl.example.org:1280");
        assert!(identity.validity.is_none());
    }

    #[test]
    fn test_unreadable_bundle_is_config_error() {
        let err = Identity::from_file(Path::new("/nonexistent/id.json")).unwrap_err();
        assert!(matches!(err, ShimError::Config(_)));
    }

    #[test]
    fn test_malformed_bundle_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();

        let err = Identity::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ShimError::Config(_)));
    }

    #[test]
    fn test_expired_identity_is_auth_error() {
        let past = (Utc::now() - Duration::days(1)).to_rfc3339();
        let json = bundle_json(&format!(r#", "validity": {{ "not_after": "{past}" }}"#));
        let identity: Identity = serde_json::from_str(&json).unwrap();

        let err = identity.check_validity(Utc::now()).unwrap_err();
        assert!(matches!(err, ShimError::Auth(_)));
    }

    #[test]
    fn test_future_identity_is_auth_error() {
        let future = (Utc::now() + Duration::days(1)).to_rfc3339();
        let json = bundle_json(&format!(r#", "validity": {{ "not_before": "{future}" }}"#));
        let identity: Identity = serde_json::from_str(&json).unwrap();

        let err = identity.check_validity(Utc::now()).unwrap_err();
        assert!(matches!(err, ShimError::Auth(_)));
    }

    #[test]
    fn test_open_window_is_valid() {
        let json = bundle_json("");
        let identity: Identity = serde_json::from_str(&json).unwrap();
        assert!(identity.check_validity(Utc::now()).is_ok());
    }
}
