// src/overlay/loopback.rs
//! Loopback overlay client
//!
//! Maps service names to local TCP endpoints, standing in for the real overlay
//! SDK in tests and demos. Resolution and authentication are instrumented with
//! call counters so tests can assert on cache behavior.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::identity::Identity;
use crate::overlay::{OverlayClient, OverlayStream, ServiceHandle, Session};
use crate::utils::errors::{Result, ShimError};

/// In-process overlay backed by local TCP services
pub struct LoopbackOverlay {
    /// Service name to endpoint mapping
    services: DashMap<String, SocketAddr>,

    /// Identity ids the controller rejects outright
    rejected: Mutex<HashSet<String>>,

    /// Total `resolve` calls observed
    resolve_calls: AtomicU64,

    /// `resolve` calls per hostname
    resolve_counts: DashMap<String, u64>,

    /// Total `authenticate` calls observed
    auth_calls: AtomicU64,
}

impl LoopbackOverlay {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            rejected: Mutex::new(HashSet::new()),
            resolve_calls: AtomicU64::new(0),
            resolve_counts: DashMap::new(),
            auth_calls: AtomicU64::new(0),
        }
    }

    /// Register a service name backed by a local endpoint
    pub fn register_service(&self, name: impl Into<String>, addr: SocketAddr) {
        let name = name.into();
        debug!(service = %name, %addr, "registering loopback service");
        self.services.insert(name, addr);
    }

    /// Mark an identity as rejected by the controller
    pub fn reject_identity(&self, id: impl Into<String>) {
        self.rejected.lock().insert(id.into());
    }

    pub fn resolve_calls(&self) -> u64 {
        self.resolve_calls.load(Ordering::Relaxed)
    }

    /// `resolve` calls observed for one hostname
    pub fn resolve_calls_for(&self, hostname: &str) -> u64 {
        self.resolve_counts.get(hostname).map(|e| *e).unwrap_or(0)
    }

    pub fn auth_calls(&self) -> u64 {
        self.auth_calls.load(Ordering::Relaxed)
    }
}

impl Default for LoopbackOverlay {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayClient for LoopbackOverlay {
    fn authenticate(&self, identity: &Identity) -> Result<Session> {
        self.auth_calls.fetch_add(1, Ordering::Relaxed);

        if self.rejected.lock().contains(&identity.id) {
            return Err(ShimError::Auth(format!(
                "controller rejected identity {}",
                identity.id
            )));
        }

        Ok(Session {
            identity_id: identity.id.clone(),
            token: format!("loopback-session-{}", identity.id),
        })
    }

    fn resolve(&self, _session: &Session, hostname: &str) -> Result<Option<ServiceHandle>> {
        self.resolve_calls.fetch_add(1, Ordering::Relaxed);
        *self.resolve_counts.entry(hostname.to_string()).or_insert(0) += 1;

        Ok(self.services.get(hostname).map(|entry| ServiceHandle {
            name: hostname.to_string(),
            routing_token: entry.value().to_string(),
        }))
    }

    fn dial(
        &self,
        _session: &Session,
        handle: &ServiceHandle,
        _port: u16,
    ) -> Result<Box<dyn OverlayStream>> {
        let addr: SocketAddr = handle.routing_token.parse().map_err(|_| {
            ShimError::Dial(handle.name.clone(), "stale routing token".to_string())
        })?;

        let stream = TcpStream::connect(addr)
            .map_err(|e| ShimError::Dial(handle.name.clone(), e.to_string()))?;

        Ok(Box::new(TcpOverlayStream::new(stream)))
    }
}

/// Overlay stream backed by a plain TCP connection
struct TcpOverlayStream {
    stream: TcpStream,
}

impl TcpOverlayStream {
    fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl OverlayStream for TcpOverlayStream {
    fn send(&self, buf: &[u8]) -> Result<usize> {
        (&self.stream)
            .write(buf)
            .map_err(|e| ShimError::Transport(e.to_string()))
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        (&self.stream)
            .read(buf)
            .map_err(|e| ShimError::Transport(e.to_string()))
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn identity(id: &str) -> Identity {
        serde_json::from_str(&format!(
            r#"{{
                "id": "{id}",
                "controller": "https://ctrl.example.org:1280",
                "credentials": {{ "cert": "PEM", "key": "PEM" }}
            }}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_authenticate_and_reject() {
        let overlay = LoopbackOverlay::new();
        overlay.reject_identity("bad");

        assert!(overlay.authenticate(&identity("good")).is_ok());
        let err = overlay.authenticate(&identity("bad")).unwrap_err();
        assert!(matches!(err, ShimError::Auth(_)));
        assert_eq!(overlay.auth_calls(), 2);
    }

    #[test]
    fn test_resolve_known_and_unknown() {
        let overlay = LoopbackOverlay::new();
        overlay.register_service("httpbin.ziti", "127.0.0.1:9999".parse().unwrap());
        let session = overlay.authenticate(&identity("dev")).unwrap();

        assert!(overlay.resolve(&session, "httpbin.ziti").unwrap().is_some());
        assert!(overlay.resolve(&session, "other.ziti").unwrap().is_none());
        assert_eq!(overlay.resolve_calls(), 2);
    }

    #[test]
    fn test_dial_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let overlay = LoopbackOverlay::new();
        overlay.register_service("echo.ziti", addr);
        let session = overlay.authenticate(&identity("dev")).unwrap();
        let handle = overlay.resolve(&session, "echo.ziti").unwrap().unwrap();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).unwrap();
            conn.write_all(&buf).unwrap();
        });

        let stream = overlay.dial(&session, &handle, 80).unwrap();
        assert_eq!(stream.send(b"hello").unwrap(), 5);

        let mut buf = [0u8; 5];
        let mut read = 0;
        while read < 5 {
            read += stream.recv(&mut buf[read..]).unwrap();
        }
        assert_eq!(&buf, b"hello");

        server.join().unwrap();
    }

    #[test]
    fn test_dial_refused() {
        let overlay = LoopbackOverlay::new();
        // Bind then drop to get an address nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        overlay.register_service("gone.ziti", addr);

        let session = overlay.authenticate(&identity("dev")).unwrap();
        let handle = overlay.resolve(&session, "gone.ziti").unwrap().unwrap();
        let err = overlay.dial(&session, &handle, 80).err().unwrap();
        assert!(matches!(err, ShimError::Dial(..)));
    }
}
