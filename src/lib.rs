// src/lib.rs
//! Sockveil Interposition Library
//!
//! A dynamic-linker socket interposer: preloaded into an unmodified process,
//! it redirects DNS resolution and outbound TCP connections for configured
//! overlay hostnames through an authenticated overlay-network tunnel, while
//! all other traffic passes through the real network stack untouched.
//!
//! # Architecture
//!
//! The library is structured into several key modules:
//!
//! - **shim**: libc symbol interception and the real-function table
//! - **router**: classification, resolution cache, and dial orchestration
//! - **fdtable**: descriptor state and tunneled-connection semantics
//! - **classify**: overlay/external hostname classification
//! - **identity**: credential bundles and the authenticated identity store
//! - **overlay**: overlay client seam and the loopback backend
//! - **runtime**: the process-wide init-once singleton
//! - **observability**: the side log channel
//! - **utils**: configuration and error taxonomy

// Public module exports
pub mod classify;
pub mod fdtable;
pub mod identity;
pub mod observability;
pub mod overlay;
pub mod router;
pub mod runtime;
pub mod shim;
pub mod utils;

// Re-export commonly used types
pub use classify::{HostClass, HostnameClassifier};
pub use fdtable::{DescriptorEntry, DescriptorTable, OverlayConnection};
pub use identity::{Identity, IdentityStore};
pub use overlay::{OverlayClient, OverlayStream, ServiceHandle};
pub use router::ConnectionRouter;
pub use runtime::Runtime;
pub use utils::config::ShimConfig;
pub use utils::errors::{Result, ShimError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
