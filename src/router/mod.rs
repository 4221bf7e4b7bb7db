// src/router/mod.rs
//! Connection router
//!
//! The decision core between intercepted calls and the overlay. A connection
//! attempt moves through `Requested -> Classified -> {Resolving, PassThrough}
//! -> {Established, Failed}`:
//!
//! - resolution classifies the hostname; external names pass through to the
//!   real resolver, overlay names resolve against the overlay client using the
//!   first identity (in load order) whose resolve succeeds;
//! - a successful resolution allocates an intercept address (carrier-grade NAT
//!   range) standing in for the hostname, so the application's ordinary
//!   resolve-then-connect flow carries the route to the later `connect`;
//! - `connect` on an intercept address dials the overlay and registers the
//!   tunneled descriptor; anything else passes through untouched.
//!
//! Successful resolutions are cached for the process lifetime; service
//! topology is assumed stable within a run.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::classify::{HostClass, HostnameClassifier};
use crate::fdtable::{DescriptorEntry, DescriptorTable, OverlayConnection};
use crate::identity::IdentityStore;
use crate::overlay::{OverlayClient, ServiceHandle, Session};
use crate::utils::errors::{Result, ShimError};

/// First intercept address handed out: 100.64.0.1
const POOL_BASE: u32 = 0x6440_0001;

/// Last intercept address in the 100.64.0.0/10 range
const POOL_END: u32 = 0x647f_fffe;

/// A cached overlay route for one hostname
#[derive(Clone)]
struct ResolvedRoute {
    handle: ServiceHandle,
    session: Session,
    addr: Ipv4Addr,
}

/// Outcome of routing a `connect` attempt
pub enum ConnectDecision {
    /// Not an intercept address; caller invokes the real connect
    PassThrough,

    /// Tunnel established and registered for the descriptor
    Established,

    /// Overlay path failed; surface the standard-equivalent error
    Failed(ShimError),
}

/// Outcome of routing a resolution attempt
#[derive(Debug)]
pub enum ResolveDecision {
    /// External name; caller invokes the real resolver
    PassThrough,

    /// Overlay name resolved to an intercept address
    Intercept(Ipv4Addr),
}

/// Connection router
pub struct ConnectionRouter {
    classifier: HostnameClassifier,
    identities: Arc<IdentityStore>,
    client: Arc<dyn OverlayClient>,
    table: Arc<DescriptorTable>,

    /// hostname (lowercase) -> cached route
    routes: DashMap<String, ResolvedRoute>,

    /// intercept address bits -> hostname
    reverse: DashMap<u32, String>,

    /// Next intercept address to hand out
    next_addr: AtomicU32,
}

impl ConnectionRouter {
    pub fn new(
        classifier: HostnameClassifier,
        identities: Arc<IdentityStore>,
        client: Arc<dyn OverlayClient>,
        table: Arc<DescriptorTable>,
    ) -> Self {
        Self {
            classifier,
            identities,
            client,
            table,
            routes: DashMap::new(),
            reverse: DashMap::new(),
            next_addr: AtomicU32::new(POOL_BASE),
        }
    }

    pub fn classifier(&self) -> &HostnameClassifier {
        &self.classifier
    }

    pub fn table(&self) -> &DescriptorTable {
        &self.table
    }

    /// Route a resolution attempt.
    ///
    /// External names and every degraded condition that must not break
    /// ordinary traffic return `PassThrough`; overlay names either yield an
    /// intercept address or the standard name-not-found error.
    pub fn resolve_host(&self, hostname: &str) -> Result<ResolveDecision> {
        if self.classifier.classify(hostname) == HostClass::External {
            return Ok(ResolveDecision::PassThrough);
        }

        let key = hostname.trim_end_matches('.').to_ascii_lowercase();

        if let Some(route) = self.routes.get(&key) {
            debug!(host = %key, addr = %route.addr, "resolve cache hit");
            return Ok(ResolveDecision::Intercept(route.addr));
        }

        self.identities.require_any()?;

        // First identity whose resolve succeeds wins; no load balancing.
        for authenticated in self.identities.enumerate() {
            match self.client.resolve(&authenticated.session, &key) {
                Ok(Some(handle)) => {
                    let addr = self.allocate_addr(&key)?;
                    info!(
                        host = %key,
                        service = %handle.name,
                        identity = %authenticated.identity.id,
                        %addr,
                        "overlay service resolved"
                    );
                    self.routes.insert(
                        key.clone(),
                        ResolvedRoute {
                            handle,
                            session: authenticated.session.clone(),
                            addr,
                        },
                    );
                    return Ok(ResolveDecision::Intercept(addr));
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        host = %key,
                        identity = %authenticated.identity.id,
                        error = %e,
                        "overlay resolve attempt failed"
                    );
                }
            }
        }

        Err(ShimError::Resolve(key))
    }

    /// Hostname behind an intercept address, if the address is ours
    pub fn lookup_addr(&self, addr: Ipv4Addr) -> Option<String> {
        self.reverse.get(&u32::from(addr)).map(|e| e.value().clone())
    }

    /// Route a `connect` attempt for a descriptor.
    ///
    /// Ordinary addresses pass through. An intercept address dials the cached
    /// route and registers the tunneled descriptor so later reads and writes
    /// are redirected.
    pub fn connect_addr(&self, fd: i32, addr: Ipv4Addr, port: u16) -> ConnectDecision {
        let Some(hostname) = self.lookup_addr(addr) else {
            return ConnectDecision::PassThrough;
        };

        let Some(route) = self.routes.get(&hostname).map(|r| r.value().clone()) else {
            // Reverse mapping without a route: resolution state was torn down.
            return ConnectDecision::Failed(ShimError::Resolve(hostname));
        };

        debug!(fd, host = %hostname, %addr, port, "dialing overlay service");

        match self.client.dial(&route.session, &route.handle, port) {
            Ok(stream) => {
                let conn = OverlayConnection::spawn(hostname.clone(), port, stream);
                self.table.register(fd, DescriptorEntry::Tunneled(conn));
                info!(fd, host = %hostname, port, "tunnel established");
                ConnectDecision::Established
            }
            Err(e) => {
                warn!(fd, host = %hostname, error = %e, "overlay dial failed");
                ConnectDecision::Failed(match e {
                    ShimError::Dial(..) => e,
                    other => ShimError::Dial(hostname, other.to_string()),
                })
            }
        }
    }

    /// Allocate the next intercept address and record its reverse mapping
    fn allocate_addr(&self, hostname: &str) -> Result<Ipv4Addr> {
        let bits = self.next_addr.fetch_add(1, Ordering::Relaxed);
        if bits > POOL_END {
            return Err(ShimError::Resolve(format!(
                "intercept address pool exhausted resolving {hostname}"
            )));
        }
        self.reverse.insert(bits, hostname.to_string());
        Ok(Ipv4Addr::from(bits))
    }
}
