// src/overlay/mod.rs
//! Overlay network client seam
//!
//! The overlay protocol itself is an external collaborator. The interposer
//! talks to it through the traits here: authenticate an identity into a
//! session, resolve a hostname to a service, dial a service into a byte
//! stream. The loopback implementation backs tests and demos; a production
//! SDK client plugs in through `runtime::init_with_client`.

pub mod loopback;

use crate::identity::Identity;
use crate::utils::errors::Result;

pub use loopback::LoopbackOverlay;

/// An authenticated overlay session
///
/// Opaque to the interposer beyond the identity it belongs to; the token
/// carries whatever the client implementation needs to route later calls.
#[derive(Debug, Clone)]
pub struct Session {
    /// Identifier of the identity this session authenticates
    pub identity_id: String,

    /// Client-private session token
    pub token: String,
}

/// Result of a successful hostname resolution against the overlay
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    /// Logical service name
    pub name: String,

    /// Client-private routing metadata
    pub routing_token: String,
}

/// A live tunneled byte stream
///
/// Blocking transport semantics: `recv` blocks until data, EOF (`Ok(0)`) or a
/// transport error; `send` returns the number of bytes accepted, which may be
/// short. One reader and one writer may use the stream concurrently, so the
/// two halves take `&self`.
pub trait OverlayStream: Send + Sync {
    /// Send bytes toward the service; returns bytes accepted
    fn send(&self, buf: &[u8]) -> Result<usize>;

    /// Receive bytes from the service; `Ok(0)` means orderly EOF
    fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Tear the stream down; further sends fail, pending recvs unblock
    fn shutdown(&self);
}

/// Overlay network client
pub trait OverlayClient: Send + Sync {
    /// Establish an authenticated session for an identity
    fn authenticate(&self, identity: &Identity) -> Result<Session>;

    /// Resolve a hostname to a service visible to this session, if any
    fn resolve(&self, session: &Session, hostname: &str) -> Result<Option<ServiceHandle>>;

    /// Dial a resolved service on the given port
    fn dial(
        &self,
        session: &Session,
        handle: &ServiceHandle,
        port: u16,
    ) -> Result<Box<dyn OverlayStream>>;
}
