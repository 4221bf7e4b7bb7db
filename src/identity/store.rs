// src/identity/store.rs
//! Identity store
//!
//! Loads every credential bundle named by configuration, authenticates each
//! one eagerly against the overlay controller, and keeps the resulting
//! sessions for the process lifetime. Later connection attempts never pay
//! authentication latency. A bundle that fails to load or authenticate is
//! logged and excluded; the store itself never fails the host process.

use std::path::Path;

use chrono::Utc;
use tracing::{info, warn};

use crate::identity::Identity;
use crate::overlay::{OverlayClient, Session};
use crate::utils::errors::{Result, ShimError};

/// An identity with its eagerly established session
#[derive(Debug, Clone)]
pub struct AuthenticatedIdentity {
    pub identity: Identity,
    pub session: Session,
}

/// Process-wide identity store
pub struct IdentityStore {
    /// Authenticated identities, in load order
    identities: Vec<AuthenticatedIdentity>,
}

impl IdentityStore {
    /// Load and authenticate every bundle in `sources`, in order.
    ///
    /// Failures are per-identity, never total: the returned store holds
    /// whatever authenticated successfully, possibly nothing.
    pub fn load(client: &dyn OverlayClient, sources: &[impl AsRef<Path>]) -> Self {
        let mut identities = Vec::new();

        for source in sources {
            let path = source.as_ref();
            match Self::load_one(client, path) {
                Ok(authenticated) => {
                    info!(
                        identity = %authenticated.identity.id,
                        controller = %authenticated.identity.controller,
                        "identity authenticated"
                    );
                    identities.push(authenticated);
                }
                Err(e) => {
                    warn!(bundle = %path.display(), error = %e, "identity excluded");
                }
            }
        }

        if identities.is_empty() {
            warn!("no usable identity; overlay disabled, running pass-through only");
        }

        Self { identities }
    }

    /// Construct a store from already-authenticated identities (tests)
    pub fn from_authenticated(identities: Vec<AuthenticatedIdentity>) -> Self {
        Self { identities }
    }

    fn load_one(client: &dyn OverlayClient, path: &Path) -> Result<AuthenticatedIdentity> {
        let identity = Identity::from_file(path)?;
        identity.check_validity(Utc::now())?;
        let session = client.authenticate(&identity)?;
        Ok(AuthenticatedIdentity { identity, session })
    }

    /// Authenticated identities in load order
    pub fn enumerate(&self) -> impl Iterator<Item = &AuthenticatedIdentity> {
        self.identities.iter()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// `NoIdentity` when the store is empty, `Ok` otherwise
    pub fn require_any(&self) -> Result<()> {
        if self.identities.is_empty() {
            Err(ShimError::NoIdentity)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::LoopbackOverlay;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_bundle(id: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "id": "{id}",
                "controller": "https://ctrl.example.org:1280",
                "credentials": {{ "cert": "PEM", "key": "PEM" }}
            }}"#
        )
        .unwrap();
        file
    }

    fn write_expired_bundle(id: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "id": "{id}",
                "controller": "https://ctrl.example.org:1280",
                "credentials": {{ "cert": "PEM", "key": "PEM" }},
                "validity": {{ "not_after": "2001-01-01T00:00:00Z" }}
            }}"#
        )
        .unwrap();
        file
    }

    #[test]
    fn test_load_order_preserved() {
        let overlay = LoopbackOverlay::new();
        let first = write_bundle("first");
        let second = write_bundle("second");

        let store = IdentityStore::load(&overlay, &[first.path(), second.path()]);
        let ids: Vec<_> = store.enumerate().map(|a| a.identity.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
        assert_eq!(overlay.auth_calls(), 2);
    }

    #[test]
    fn test_bad_bundle_excluded_others_loaded() {
        let overlay = LoopbackOverlay::new();
        let good = write_bundle("good");

        let store = IdentityStore::load(
            &overlay,
            &[Path::new("/nonexistent/id.json"), good.path()],
        );
        assert_eq!(store.len(), 1);
        assert!(store.require_any().is_ok());
    }

    #[test]
    fn test_expired_bundle_excluded_without_auth_call() {
        let overlay = LoopbackOverlay::new();
        let expired = write_expired_bundle("old");

        let store = IdentityStore::load(&overlay, &[expired.path()]);
        assert!(store.is_empty());
        assert_eq!(overlay.auth_calls(), 0);
    }

    #[test]
    fn test_rejected_identity_excluded() {
        let overlay = LoopbackOverlay::new();
        overlay.reject_identity("spurned");
        let spurned = write_bundle("spurned");
        let good = write_bundle("good");

        let store = IdentityStore::load(&overlay, &[spurned.path(), good.path()]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.enumerate().next().unwrap().identity.id, "good");
    }

    #[test]
    fn test_empty_store_reports_no_identity() {
        let overlay = LoopbackOverlay::new();
        let store = IdentityStore::load(&overlay, &Vec::<&Path>::new());
        assert!(matches!(store.require_any(), Err(ShimError::NoIdentity)));
    }
}
