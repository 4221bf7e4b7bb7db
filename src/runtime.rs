// src/runtime.rs
//! Process-wide interposer runtime
//!
//! One runtime per host process, created lazily on the first intercepted call
//! (dynamic-loader context is too fragile for eager construction) and never
//! torn down before exit: descriptors own their tunnels, and the process
//! reclaims everything else. All global state — loaded identities, the
//! descriptor table, the resolution cache — lives behind this singleton and
//! is reached only through its accessors.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::info;

use crate::classify::HostnameClassifier;
use crate::fdtable::DescriptorTable;
use crate::identity::IdentityStore;
use crate::observability;
use crate::overlay::{LoopbackOverlay, OverlayClient};
use crate::router::ConnectionRouter;
use crate::utils::config::ShimConfig;

/// Environment variable mapping service names to local endpoints for the
/// loopback overlay backend: `name=host:port`, comma-separated
pub const ENV_SERVICES: &str = "SOCKVEIL_SERVICES";

static RUNTIME: OnceCell<Arc<Runtime>> = OnceCell::new();

/// The interposer's root object
pub struct Runtime {
    config: ShimConfig,
    router: ConnectionRouter,
    table: Arc<DescriptorTable>,
    identities: Arc<IdentityStore>,
}

impl Runtime {
    /// The process-wide runtime, bootstrapped from the environment on first use
    pub fn global() -> &'static Arc<Runtime> {
        RUNTIME.get_or_init(|| Arc::new(Self::bootstrap()))
    }

    /// Install a runtime built around a specific overlay client.
    ///
    /// For embedders and tests; must run before the first intercepted call
    /// touches `global`. Returns false when the runtime already exists.
    pub fn install(client: Arc<dyn OverlayClient>, config: ShimConfig) -> bool {
        RUNTIME
            .set(Arc::new(Self::build(config, client)))
            .is_ok()
    }

    /// The already-installed runtime, if any (does not bootstrap)
    pub fn try_global() -> Option<&'static Arc<Runtime>> {
        RUNTIME.get()
    }

    fn bootstrap() -> Runtime {
        let config = ShimConfig::from_env();
        observability::init_logging(&config);
        let client = Arc::new(default_client());
        Self::build(config, client)
    }

    fn build(config: ShimConfig, client: Arc<dyn OverlayClient>) -> Runtime {
        let identities = Arc::new(IdentityStore::load(
            client.as_ref(),
            &config.identity_sources,
        ));
        let table = Arc::new(DescriptorTable::new());
        let classifier = HostnameClassifier::new(config.overlay_domains.clone());

        info!(
            identities = identities.len(),
            domains = ?config.overlay_domains,
            "interposer runtime ready"
        );

        let router = ConnectionRouter::new(
            classifier,
            Arc::clone(&identities),
            client,
            Arc::clone(&table),
        );

        Runtime {
            config,
            router,
            table,
            identities,
        }
    }

    pub fn router(&self) -> &ConnectionRouter {
        &self.router
    }

    pub fn table(&self) -> &DescriptorTable {
        &self.table
    }

    pub fn identities(&self) -> &IdentityStore {
        &self.identities
    }

    pub fn config(&self) -> &ShimConfig {
        &self.config
    }
}

/// Default overlay backend: the loopback client, with any services named by
/// `SOCKVEIL_SERVICES` pre-registered. With nothing registered every overlay
/// name fails resolution and the process runs effectively pass-through.
fn default_client() -> LoopbackOverlay {
    let overlay = LoopbackOverlay::new();

    if let Ok(raw) = std::env::var(ENV_SERVICES) {
        for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match entry.split_once('=').map(|(name, addr)| (name, addr.parse())) {
                Some((name, Ok(addr))) => overlay.register_service(name, addr),
                _ => {
                    tracing::warn!(entry, "ignoring malformed service mapping");
                }
            }
        }
    }

    overlay
}

#[cfg(test)]
mod tests {
    use super::*;

    // The singleton is per-process, so these tests share one runtime; they
    // only assert properties that hold regardless of install order.

    #[test]
    fn test_global_bootstrap_is_stable() {
        let a = Runtime::global();
        let b = Runtime::global();
        assert!(Arc::ptr_eq(a, b));
        assert!(Runtime::try_global().is_some());
    }

    #[test]
    fn test_install_after_bootstrap_is_rejected() {
        let _ = Runtime::global();
        let installed = Runtime::install(
            Arc::new(LoopbackOverlay::new()),
            ShimConfig::default(),
        );
        assert!(!installed);
    }
}
