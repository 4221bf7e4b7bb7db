// src/utils/errors.rs
//! Error taxonomy for the interposer
//!
//! Every failure in the overlay path maps to exactly one variant here, and every
//! variant maps to a single standard errno (or `getaddrinfo` result code) at the
//! intercepted-call boundary. Overlay-internal detail never crosses that boundary;
//! it goes to the side log channel instead.

use thiserror::Error;

/// Convenience result type used throughout the crate
pub type Result<T> = std::result::Result<T, ShimError>;

/// Interposer error taxonomy
#[derive(Debug, Error)]
pub enum ShimError {
    /// Bad or missing identity source, or malformed environment. Non-fatal:
    /// the offending identity is skipped and loading continues.
    #[error("config error: {0}")]
    Config(String),

    /// Credential present but expired or rejected by the overlay controller.
    /// The identity is excluded; remaining identities are still tried.
    #[error("auth error: {0}")]
    Auth(String),

    /// No identity authenticated successfully; the interposer runs in pure
    /// pass-through mode.
    #[error("no usable identity loaded")]
    NoIdentity,

    /// Overlay hostname not found by any identity.
    #[error("overlay resolve failed for {0}")]
    Resolve(String),

    /// Service resolved but the dial failed.
    #[error("overlay dial failed for {0}: {1}")]
    Dial(String, String),

    /// Tunneled connection broken mid-stream.
    #[error("overlay transport error: {0}")]
    Transport(String),
}

impl ShimError {
    /// The errno equivalent an application would observe from the real
    /// networking stack for this failure class.
    pub fn errno(&self) -> i32 {
        match self {
            ShimError::Config(_) | ShimError::Auth(_) => libc::EHOSTUNREACH,
            ShimError::NoIdentity => libc::EHOSTUNREACH,
            ShimError::Resolve(_) => libc::EHOSTUNREACH,
            ShimError::Dial(..) => libc::ECONNREFUSED,
            ShimError::Transport(_) => libc::ECONNRESET,
        }
    }

    /// The `getaddrinfo` result code for failures surfaced through name
    /// resolution. Matches an external DNS miss so application retry logic is
    /// unaffected.
    pub fn gai_code(&self) -> i32 {
        match self {
            ShimError::Resolve(_) | ShimError::NoIdentity => libc::EAI_NONAME,
            _ => libc::EAI_FAIL,
        }
    }
}

impl From<std::io::Error> for ShimError {
    fn from(err: std::io::Error) -> Self {
        ShimError::Transport(err.to_string())
    }
}
