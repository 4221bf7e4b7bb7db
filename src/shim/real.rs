// src/shim/real.rs
//! Real libc entry points
//!
//! The capability-substitution table: every symbol this library shadows is
//! resolved here, once, to the next definition in link order via
//! `dlsym(RTLD_NEXT)`. Wrappers call through this table for pass-through
//! traffic; calling the plain symbol would recurse into ourselves.

use std::ffi::{c_char, c_int, c_void};

use libc::{addrinfo, nfds_t, pollfd, size_t, sockaddr, socklen_t, ssize_t, timeval};
use once_cell::sync::Lazy;

pub type GetaddrinfoFn = unsafe extern "C" fn(
    *const c_char,
    *const c_char,
    *const addrinfo,
    *mut *mut addrinfo,
) -> c_int;
pub type FreeaddrinfoFn = unsafe extern "C" fn(*mut addrinfo);
pub type GetnameinfoFn = unsafe extern "C" fn(
    *const sockaddr,
    socklen_t,
    *mut c_char,
    socklen_t,
    *mut c_char,
    socklen_t,
    c_int,
) -> c_int;
pub type ConnectFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
pub type SendFn = unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
pub type RecvFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t;
pub type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
pub type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
pub type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
pub type PollFn = unsafe extern "C" fn(*mut pollfd, nfds_t, c_int) -> c_int;
pub type SelectFn = unsafe extern "C" fn(
    c_int,
    *mut libc::fd_set,
    *mut libc::fd_set,
    *mut libc::fd_set,
    *mut timeval,
) -> c_int;
pub type SetsockoptFn =
    unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int;

/// Resolved real implementations of every shadowed symbol
pub struct RealFns {
    pub getaddrinfo: GetaddrinfoFn,
    pub freeaddrinfo: FreeaddrinfoFn,
    pub getnameinfo: GetnameinfoFn,
    pub connect: ConnectFn,
    pub send: SendFn,
    pub recv: RecvFn,
    pub read: ReadFn,
    pub write: WriteFn,
    pub close: CloseFn,
    pub poll: PollFn,
    pub select: SelectFn,
    pub setsockopt: SetsockoptFn,
}

/// Resolve one symbol past ourselves; a miss is unrecoverable for the whole
/// process, so fail loudly rather than loop back into our own wrapper.
fn must_resolve(name: &'static str) -> *mut c_void {
    let cname = std::ffi::CString::new(name).expect("symbol name");
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, cname.as_ptr()) };
    if sym.is_null() {
        // No sane fallback exists; aborting beats infinite recursion.
        eprintln!("sockveil: unresolvable libc symbol {name}");
        std::process::abort();
    }
    sym
}

macro_rules! resolve_fn {
    ($name:literal) => {
        unsafe { std::mem::transmute(must_resolve($name)) }
    };
}

static REAL: Lazy<RealFns> = Lazy::new(|| RealFns {
    getaddrinfo: resolve_fn!("getaddrinfo"),
    freeaddrinfo: resolve_fn!("freeaddrinfo"),
    getnameinfo: resolve_fn!("getnameinfo"),
    connect: resolve_fn!("connect"),
    send: resolve_fn!("send"),
    recv: resolve_fn!("recv"),
    read: resolve_fn!("read"),
    write: resolve_fn!("write"),
    close: resolve_fn!("close"),
    poll: resolve_fn!("poll"),
    select: resolve_fn!("select"),
    setsockopt: resolve_fn!("setsockopt"),
});

/// The real-function table, resolved on first use
pub fn real() -> &'static RealFns {
    &REAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_resolves() {
        // Without LD_PRELOAD the next definition is libc itself.
        let fns = real();
        let rc = unsafe { (fns.close)(-1) };
        assert_eq!(rc, -1);
    }
}
