// src/shim/mod.rs
//! Dynamic-linker interposition layer
//!
//! `symbols` exports the shadowed libc entry points; `real` holds the
//! resolved originals. The helpers here do the sockaddr surgery and the
//! synthesized-`addrinfo` bookkeeping shared between wrappers.
//!
//! Wrappers on hot paths (`read`, `write`, `close`, `poll`) never bootstrap
//! the runtime: until a resolution has run through `getaddrinfo` there cannot
//! be a tunneled descriptor, so an uninitialized runtime means pass-through.

pub mod real;

#[cfg(target_os = "linux")]
pub mod symbols;

use std::ffi::{c_char, c_int};
use std::mem;
use std::net::Ipv4Addr;
use std::ptr;
use std::time::Duration;

use dashmap::DashSet;
use once_cell::sync::Lazy;

/// Destination extracted from a `sockaddr`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockTarget {
    pub addr: Ipv4Addr,
    /// Host byte order
    pub port: u16,
}

/// Pull an IPv4 destination out of a `sockaddr`, accepting plain `AF_INET`
/// and v4-mapped `AF_INET6`. Anything else is not routable by the overlay.
///
/// # Safety
/// `addr` must point to at least `len` valid bytes of a sockaddr.
pub unsafe fn extract_target(addr: *const libc::sockaddr, len: libc::socklen_t) -> Option<SockTarget> {
    if addr.is_null() {
        return None;
    }

    match i32::from(unsafe { (*addr).sa_family }) {
        libc::AF_INET => {
            if (len as usize) < mem::size_of::<libc::sockaddr_in>() {
                return None;
            }
            let v4 = unsafe { &*(addr as *const libc::sockaddr_in) };
            Some(SockTarget {
                addr: Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr)),
                port: u16::from_be(v4.sin_port),
            })
        }
        libc::AF_INET6 => {
            if (len as usize) < mem::size_of::<libc::sockaddr_in6>() {
                return None;
            }
            let v6 = unsafe { &*(addr as *const libc::sockaddr_in6) };
            let octets = v6.sin6_addr.s6_addr;
            let mapped = octets[..10].iter().all(|&b| b == 0)
                && octets[10] == 0xff
                && octets[11] == 0xff;
            if !mapped {
                return None;
            }
            Some(SockTarget {
                addr: Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]),
                port: u16::from_be(v6.sin6_port),
            })
        }
        _ => None,
    }
}

/// Port for a `getaddrinfo` service argument: numeric, or the handful of
/// schemes an overlay service is dialed with in practice.
pub fn service_port(service: Option<&str>) -> u16 {
    match service {
        None => 0,
        Some(s) => match s.parse::<u16>() {
            Ok(port) => port,
            Err(_) => match s {
                "http" | "www" => 80,
                "https" => 443,
                _ => 0,
            },
        },
    }
}

/// Set the calling thread's errno
pub fn set_errno(err: c_int) {
    #[cfg(target_os = "linux")]
    unsafe {
        *libc::__errno_location() = err;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = err;
}

/// O_NONBLOCK state of a descriptor, queried live from the kernel. The
/// descriptor stays a real OS socket even while tunneled, so the kernel
/// remains the source of truth for its flags.
pub fn fd_nonblocking(fd: c_int) -> bool {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    flags != -1 && (flags & libc::O_NONBLOCK) != 0
}

/// Receive/send timeouts currently set on a descriptor via socket options
pub fn fd_timeouts(fd: c_int) -> (Option<Duration>, Option<Duration>) {
    (
        read_timeout_opt(fd, libc::SO_RCVTIMEO),
        read_timeout_opt(fd, libc::SO_SNDTIMEO),
    )
}

fn read_timeout_opt(fd: c_int, opt: c_int) -> Option<Duration> {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    let mut len = mem::size_of::<libc::timeval>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &mut tv as *mut libc::timeval as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    timeval_to_duration(&tv)
}

/// Zero timeval means "no timeout", per the socket option convention
pub fn timeval_to_duration(tv: &libc::timeval) -> Option<Duration> {
    if tv.tv_sec <= 0 && tv.tv_usec <= 0 {
        None
    } else {
        Some(Duration::new(tv.tv_sec as u64, (tv.tv_usec as u32) * 1000))
    }
}

/// Head pointers of `addrinfo` chains we synthesized, so the interposed
/// `freeaddrinfo` can tell ours from the real resolver's
static SYNTH_CHAINS: Lazy<DashSet<usize>> = Lazy::new(DashSet::new);

/// Build a single-entry `addrinfo` chain for an intercept address.
///
/// One `calloc` block holds the `addrinfo` and its `sockaddr_in`, mirroring
/// the layout the real resolver uses, and the head pointer is registered for
/// the matching free path.
///
/// # Safety
/// Returns an owning raw pointer; release through `free_synth_chain`.
pub unsafe fn build_synth_addrinfo(
    target: SockTarget,
    canonname: Option<&str>,
    hints: *const libc::addrinfo,
) -> *mut libc::addrinfo {
    let (socktype, protocol) = if hints.is_null() {
        (libc::SOCK_STREAM, 0)
    } else {
        let h = unsafe { &*hints };
        let socktype = if h.ai_socktype != 0 {
            h.ai_socktype
        } else {
            libc::SOCK_STREAM
        };
        (socktype, h.ai_protocol)
    };

    let block_len = mem::size_of::<libc::addrinfo>() + mem::size_of::<libc::sockaddr_in>();
    let block = unsafe { libc::calloc(1, block_len) };
    if block.is_null() {
        return ptr::null_mut();
    }

    let ai = block as *mut libc::addrinfo;
    let sa = unsafe { (block as *mut u8).add(mem::size_of::<libc::addrinfo>()) }
        as *mut libc::sockaddr_in;

    unsafe {
        (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
        (*sa).sin_port = target.port.to_be();
        (*sa).sin_addr.s_addr = u32::from(target.addr).to_be();

        (*ai).ai_flags = 0;
        (*ai).ai_family = libc::AF_INET;
        (*ai).ai_socktype = socktype;
        (*ai).ai_protocol = protocol;
        (*ai).ai_addrlen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        (*ai).ai_addr = sa as *mut libc::sockaddr;
        (*ai).ai_canonname = match canonname {
            Some(name) => synth_cstring(name),
            None => ptr::null_mut(),
        };
        (*ai).ai_next = ptr::null_mut();
    }

    SYNTH_CHAINS.insert(ai as usize);
    ai
}

/// Free a chain if it is one of ours; false means it belongs to the real
/// resolver and must go to the real `freeaddrinfo`.
///
/// # Safety
/// `head` must be a chain head previously returned by `getaddrinfo`.
pub unsafe fn free_synth_chain(head: *mut libc::addrinfo) -> bool {
    if head.is_null() || SYNTH_CHAINS.remove(&(head as usize)).is_none() {
        return false;
    }
    unsafe {
        let canonname = (*head).ai_canonname;
        if !canonname.is_null() {
            libc::free(canonname as *mut libc::c_void);
        }
        libc::free(head as *mut libc::c_void);
    }
    true
}

/// C string on the libc heap
unsafe fn synth_cstring(s: &str) -> *mut c_char {
    let buf = unsafe { libc::malloc(s.len() + 1) } as *mut c_char;
    if buf.is_null() {
        return ptr::null_mut();
    }
    unsafe {
        ptr::copy_nonoverlapping(s.as_ptr() as *const c_char, buf, s.len());
        *buf.add(s.len()) = 0;
    }
    buf
}
