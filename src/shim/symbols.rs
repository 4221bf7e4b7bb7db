// src/shim/symbols.rs
//! Shadowed libc entry points (Linux)
//!
//! Each export keeps the exact calling convention of the symbol it replaces
//! and hands pass-through traffic to the real implementation from the
//! capability table. Overlay traffic is recognized either by hostname
//! (resolution calls) or by intercept address (connect), and from then on by
//! descriptor-table membership.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::time::{Duration, Instant};

use libc::{nfds_t, pollfd, size_t, sockaddr, socklen_t, ssize_t, timeval};
use tracing::debug;

use crate::fdtable::{ReadOutcome, WriteOutcome};
use crate::router::{ConnectDecision, ResolveDecision};
use crate::runtime::Runtime;
use crate::shim::real::real;
use crate::shim::{
    build_synth_addrinfo, extract_target, fd_nonblocking, fd_timeouts, free_synth_chain,
    service_port, set_errno, timeval_to_duration, SockTarget,
};

/// Re-poll slice for emulated multiplexing over mixed descriptor sets
const POLL_SLICE_MS: c_int = 20;

/// # Safety
/// libc contract of `getaddrinfo`.
#[no_mangle]
pub unsafe extern "C" fn getaddrinfo(
    node: *const c_char,
    service: *const c_char,
    hints: *const libc::addrinfo,
    res: *mut *mut libc::addrinfo,
) -> c_int {
    let fallback = || unsafe { (real().getaddrinfo)(node, service, hints, res) };

    if node.is_null() || res.is_null() {
        return fallback();
    }
    let Ok(host) = unsafe { CStr::from_ptr(node) }.to_str() else {
        return fallback();
    };

    // Resolution is the overlay's entry gate: the one place the runtime
    // bootstraps.
    let runtime = Runtime::global();
    match runtime.router().resolve_host(host) {
        Ok(ResolveDecision::PassThrough) => fallback(),
        Ok(ResolveDecision::Intercept(addr)) => {
            // An IPv6-only request cannot carry a v4 intercept address; the
            // name must still never leak to real DNS.
            if !hints.is_null() && unsafe { (*hints).ai_family } == libc::AF_INET6 {
                return libc::EAI_NONAME;
            }

            let service_str = if service.is_null() {
                None
            } else {
                unsafe { CStr::from_ptr(service) }.to_str().ok()
            };
            let want_canon =
                !hints.is_null() && unsafe { (*hints).ai_flags } & libc::AI_CANONNAME != 0;

            let target = SockTarget {
                addr,
                port: service_port(service_str),
            };
            let chain = unsafe {
                build_synth_addrinfo(target, want_canon.then_some(host), hints)
            };
            if chain.is_null() {
                return libc::EAI_MEMORY;
            }
            unsafe { *res = chain };
            debug!(host, %addr, "resolution intercepted");
            0
        }
        Err(e) => {
            debug!(host, error = %e, "overlay resolution failed");
            e.gai_code()
        }
    }
}

/// # Safety
/// libc contract of `freeaddrinfo`.
#[no_mangle]
pub unsafe extern "C" fn freeaddrinfo(res: *mut libc::addrinfo) {
    if !unsafe { free_synth_chain(res) } {
        unsafe { (real().freeaddrinfo)(res) };
    }
}

/// # Safety
/// libc contract of `getnameinfo`.
#[no_mangle]
pub unsafe extern "C" fn getnameinfo(
    addr: *const sockaddr,
    addrlen: socklen_t,
    host: *mut c_char,
    hostlen: socklen_t,
    serv: *mut c_char,
    servlen: socklen_t,
    flags: c_int,
) -> c_int {
    let fallback =
        || unsafe { (real().getnameinfo)(addr, addrlen, host, hostlen, serv, servlen, flags) };

    let Some(runtime) = Runtime::try_global() else {
        return fallback();
    };
    let Some(target) = (unsafe { extract_target(addr, addrlen) }) else {
        return fallback();
    };
    let Some(hostname) = runtime.router().lookup_addr(target.addr) else {
        return fallback();
    };

    if !host.is_null() && hostlen > 0 {
        let n = hostname.len().min(hostlen as usize - 1);
        unsafe {
            std::ptr::copy_nonoverlapping(hostname.as_ptr() as *const c_char, host, n);
            *host.add(n) = 0;
        }
    }
    if !serv.is_null() && servlen > 0 {
        let port = target.port.to_string();
        let n = port.len().min(servlen as usize - 1);
        unsafe {
            std::ptr::copy_nonoverlapping(port.as_ptr() as *const c_char, serv, n);
            *serv.add(n) = 0;
        }
    }
    0
}

/// # Safety
/// libc contract of `connect`.
#[no_mangle]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    let fallback = || unsafe { (real().connect)(fd, addr, len) };

    // Intercept addresses only exist after a resolution bootstrapped the
    // runtime, so an uninitialized runtime cannot own this destination.
    let Some(runtime) = Runtime::try_global() else {
        return fallback();
    };
    let Some(target) = (unsafe { extract_target(addr, len) }) else {
        return fallback();
    };

    match runtime.router().connect_addr(fd, target.addr, target.port) {
        ConnectDecision::PassThrough => fallback(),
        ConnectDecision::Established => {
            // The entry inherits whatever timeouts the application already
            // configured on the descriptor.
            if let Some(conn) = runtime.table().tunnel(fd) {
                let (recv, send) = fd_timeouts(fd);
                conn.set_timeouts(recv, send);
            }
            0
        }
        ConnectDecision::Failed(e) => {
            set_errno(e.errno());
            -1
        }
    }
}

fn tunneled_read(fd: c_int, buf: *mut c_void, len: size_t) -> Option<ssize_t> {
    let runtime = Runtime::try_global()?;
    let conn = runtime.table().tunnel(fd)?;

    if buf.is_null() {
        set_errno(libc::EFAULT);
        return Some(-1);
    }
    let slice = unsafe { std::slice::from_raw_parts_mut(buf as *mut u8, len) };

    Some(match conn.read(slice, fd_nonblocking(fd)) {
        ReadOutcome::Data(n) => n as ssize_t,
        ReadOutcome::Eof => 0,
        ReadOutcome::WouldBlock => {
            set_errno(libc::EWOULDBLOCK);
            -1
        }
        ReadOutcome::TimedOut => {
            set_errno(libc::EAGAIN);
            -1
        }
        ReadOutcome::Closed | ReadOutcome::Reset => {
            set_errno(libc::ECONNRESET);
            -1
        }
    })
}

fn tunneled_write(fd: c_int, buf: *const c_void, len: size_t) -> Option<ssize_t> {
    let runtime = Runtime::try_global()?;
    let conn = runtime.table().tunnel(fd)?;

    if buf.is_null() {
        set_errno(libc::EFAULT);
        return Some(-1);
    }
    let slice = unsafe { std::slice::from_raw_parts(buf as *const u8, len) };

    Some(match conn.write(slice, fd_nonblocking(fd)) {
        WriteOutcome::Accepted(n) => n as ssize_t,
        WriteOutcome::WouldBlock => {
            set_errno(libc::EWOULDBLOCK);
            -1
        }
        WriteOutcome::Closed => {
            set_errno(libc::EPIPE);
            -1
        }
        WriteOutcome::Reset => {
            set_errno(libc::ECONNRESET);
            -1
        }
    })
}

/// # Safety
/// libc contract of `read`.
#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, len: size_t) -> ssize_t {
    match tunneled_read(fd, buf, len) {
        Some(n) => n,
        None => unsafe { (real().read)(fd, buf, len) },
    }
}

/// # Safety
/// libc contract of `recv`.
#[no_mangle]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    // Flagged receives (MSG_PEEK and friends) on tunneled descriptors are not
    // emulated; plain receives share the read path.
    if flags == 0 {
        if let Some(n) = tunneled_read(fd, buf, len) {
            return n;
        }
    }
    unsafe { (real().recv)(fd, buf, len, flags) }
}

/// # Safety
/// libc contract of `write`.
#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, len: size_t) -> ssize_t {
    match tunneled_write(fd, buf, len) {
        Some(n) => n,
        None => unsafe { (real().write)(fd, buf, len) },
    }
}

/// # Safety
/// libc contract of `send`.
#[no_mangle]
pub unsafe extern "C" fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    if flags == 0 || flags == libc::MSG_NOSIGNAL {
        if let Some(n) = tunneled_write(fd, buf, len) {
            return n;
        }
    }
    unsafe { (real().send)(fd, buf, len, flags) }
}

/// # Safety
/// libc contract of `close`.
#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    if let Some(runtime) = Runtime::try_global() {
        runtime.table().close(fd);
    }
    unsafe { (real().close)(fd) }
}

/// # Safety
/// libc contract of `setsockopt`.
#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if let Some(runtime) = Runtime::try_global() {
        if let Some(conn) = runtime.table().tunnel(fd) {
            if level == libc::SOL_SOCKET
                && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
                && !optval.is_null()
                && optlen as usize >= std::mem::size_of::<timeval>()
            {
                let timeout = timeval_to_duration(unsafe { &*(optval as *const timeval) });
                if optname == libc::SO_RCVTIMEO {
                    conn.set_recv_timeout(timeout);
                } else {
                    conn.set_send_timeout(timeout);
                }
            }
            // Tunneled descriptors accept any option; the kernel socket no
            // longer carries the data path.
            return 0;
        }
    }
    unsafe { (real().setsockopt)(fd, level, optname, optval, optlen) }
}

/// Readiness events an emulated descriptor reports for a poll request
fn tunneled_revents(conn: &crate::fdtable::OverlayConnection, events: i16) -> i16 {
    let readiness = conn.readiness();
    let mut revents = 0i16;
    if readiness.readable && (events & libc::POLLIN) != 0 {
        revents |= libc::POLLIN;
    }
    if readiness.writable && (events & libc::POLLOUT) != 0 {
        revents |= libc::POLLOUT;
    }
    if readiness.error {
        revents |= libc::POLLERR;
    }
    revents
}

/// # Safety
/// libc contract of `poll`.
#[no_mangle]
pub unsafe extern "C" fn poll(fds: *mut pollfd, nfds: nfds_t, timeout: c_int) -> c_int {
    let fallback = || unsafe { (real().poll)(fds, nfds, timeout) };

    let Some(runtime) = Runtime::try_global() else {
        return fallback();
    };
    if fds.is_null() || nfds == 0 {
        return fallback();
    }

    let set = unsafe { std::slice::from_raw_parts_mut(fds, nfds as usize) };
    let tunneled: Vec<usize> = set
        .iter()
        .enumerate()
        .filter(|(_, p)| p.fd >= 0 && runtime.table().tunnel(p.fd).is_some())
        .map(|(i, _)| i)
        .collect();
    if tunneled.is_empty() {
        return fallback();
    }

    let deadline = (timeout >= 0).then(|| Instant::now() + Duration::from_millis(timeout as u64));

    loop {
        let mut ready = 0;

        for p in set.iter_mut() {
            p.revents = 0;
        }
        for &i in &tunneled {
            if let Some(conn) = runtime.table().tunnel(set[i].fd) {
                set[i].revents = tunneled_revents(&conn, set[i].events);
            } else {
                // Tunnel vanished mid-poll: closed by another thread.
                set[i].revents = libc::POLLERR;
            }
            if set[i].revents != 0 {
                ready += 1;
            }
        }

        // Real descriptors ride a zero-timeout real poll per slice.
        let mut others: Vec<pollfd> = Vec::new();
        let mut other_idx: Vec<usize> = Vec::new();
        for (i, p) in set.iter().enumerate() {
            if !tunneled.contains(&i) {
                others.push(*p);
                other_idx.push(i);
            }
        }
        if !others.is_empty() {
            let rc = unsafe { (real().poll)(others.as_mut_ptr(), others.len() as nfds_t, 0) };
            if rc < 0 {
                return rc;
            }
            if rc > 0 {
                for (slot, p) in other_idx.iter().zip(others.iter()) {
                    set[*slot].revents = p.revents;
                    if p.revents != 0 {
                        ready += 1;
                    }
                }
            }
        }

        if ready > 0 {
            return ready;
        }
        if timeout == 0 {
            return 0;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return 0;
            }
        }

        std::thread::sleep(Duration::from_millis(POLL_SLICE_MS as u64));
    }
}

/// # Safety
/// libc contract of `select`.
#[no_mangle]
pub unsafe extern "C" fn select(
    nfds: c_int,
    readfds: *mut libc::fd_set,
    writefds: *mut libc::fd_set,
    errorfds: *mut libc::fd_set,
    timeout: *mut timeval,
) -> c_int {
    let fallback = || unsafe { (real().select)(nfds, readfds, writefds, errorfds, timeout) };

    let Some(runtime) = Runtime::try_global() else {
        return fallback();
    };
    if nfds <= 0 {
        return fallback();
    }

    let requested = |set: *mut libc::fd_set, fd: c_int| -> bool {
        !set.is_null() && unsafe { libc::FD_ISSET(fd, set) }
    };

    let mut tunneled: Vec<c_int> = Vec::new();
    for fd in 0..nfds {
        if (requested(readfds, fd) || requested(writefds, fd) || requested(errorfds, fd))
            && runtime.table().tunnel(fd).is_some()
        {
            tunneled.push(fd);
        }
    }
    if tunneled.is_empty() {
        return fallback();
    }

    let total = (!timeout.is_null()).then(|| unsafe {
        Duration::new(
            (*timeout).tv_sec.max(0) as u64,
            ((*timeout).tv_usec.max(0) as u32) * 1000,
        )
    });
    let deadline = total.map(|t| Instant::now() + t);

    // Snapshot the request; each slice rebuilds the result sets from it.
    let want_read = tunneled
        .iter()
        .map(|&fd| requested(readfds, fd))
        .collect::<Vec<_>>();
    let want_write = tunneled
        .iter()
        .map(|&fd| requested(writefds, fd))
        .collect::<Vec<_>>();
    let snapshot_read = unsafe { readfds.as_ref().copied() };
    let snapshot_write = unsafe { writefds.as_ref().copied() };
    let snapshot_error = unsafe { errorfds.as_ref().copied() };

    loop {
        let restore = |dst: *mut libc::fd_set, src: &Option<libc::fd_set>| {
            if let (false, Some(src)) = (dst.is_null(), src) {
                unsafe { *dst = *src };
            }
        };
        restore(readfds, &snapshot_read);
        restore(writefds, &snapshot_write);
        restore(errorfds, &snapshot_error);

        // Take the tunneled descriptors out of the sets handed to the kernel.
        for &fd in &tunneled {
            for set in [readfds, writefds, errorfds] {
                if !set.is_null() {
                    unsafe { libc::FD_CLR(fd, set) };
                }
            }
        }

        let mut slice_tv = timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let rc = unsafe {
            (real().select)(nfds, readfds, writefds, errorfds, &mut slice_tv as *mut timeval)
        };
        if rc < 0 {
            return rc;
        }
        let mut ready = rc;

        for (i, &fd) in tunneled.iter().enumerate() {
            let Some(conn) = runtime.table().tunnel(fd) else {
                if !errorfds.is_null() {
                    unsafe { libc::FD_SET(fd, errorfds) };
                    ready += 1;
                }
                continue;
            };
            // Like the kernel, count one per set bit, not per descriptor.
            let readiness = conn.readiness();
            if want_read[i] && readiness.readable && !readfds.is_null() {
                unsafe { libc::FD_SET(fd, readfds) };
                ready += 1;
            }
            if want_write[i] && readiness.writable && !writefds.is_null() {
                unsafe { libc::FD_SET(fd, writefds) };
                ready += 1;
            }
            if readiness.error && !errorfds.is_null() {
                unsafe { libc::FD_SET(fd, errorfds) };
                ready += 1;
            }
        }

        if ready > 0 {
            return ready;
        }
        match deadline {
            Some(deadline) if Instant::now() >= deadline => return 0,
            Some(_) | None => {}
        }
        if total == Some(Duration::ZERO) {
            return 0;
        }

        std::thread::sleep(Duration::from_millis(POLL_SLICE_MS as u64));
    }
}
