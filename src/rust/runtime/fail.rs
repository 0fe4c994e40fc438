// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::std::{
    error,
    fmt,
    io,
};

//==============================================================================
// Structures
//==============================================================================

/// Failure
///
/// Every fallible operation of the load balancer reports a POSIX error number
/// together with a short description of what was being attempted.
#[derive(Clone, PartialEq, Eq)]
pub struct Fail {
    /// Error code.
    pub errno: libc::c_int,
    /// Cause.
    pub cause: String,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate Functions for Failures
impl Fail {
    /// Creates a new Failure
    pub fn new(errno: libc::c_int, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
        }
    }

    /// Wraps an I/O error, prefixing its description with the failed operation.
    pub fn from_io(op: &str, e: io::Error) -> Self {
        Self {
            errno: e.raw_os_error().unwrap_or(libc::EIO),
            cause: format!("{}: {}", op, e),
        }
    }

    /// Wraps the current value of `errno`.
    pub fn last_os_error(op: &str) -> Self {
        Self::from_io(op, io::Error::last_os_error())
    }

    /// Whether the address allocator ran out of addresses.
    pub fn is_address_exhausted(&self) -> bool {
        self.errno == libc::EADDRNOTAVAIL
    }

    /// Whether the failure is a transient condition that a retry may clear.
    pub fn is_transient(&self) -> bool {
        matches!(self.errno, libc::EAGAIN | libc::EINTR | libc::ECONNABORTED)
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (errno={})", self.cause, self.errno)
    }
}

impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fail {{ errno: {}, cause: {:?} }}", self.errno, self.cause)
    }
}

impl error::Error for Fail {}

impl From<io::Error> for Fail {
    fn from(e: io::Error) -> Self {
        Self::from_io("i/o error", e)
    }
}

impl From<nix::Error> for Fail {
    fn from(e: nix::Error) -> Self {
        Self {
            errno: e as libc::c_int,
            cause: e.desc().to_string(),
        }
    }
}

impl From<serde_json::Error> for Fail {
    fn from(e: serde_json::Error) -> Self {
        Self {
            errno: libc::EBADMSG,
            cause: format!("malformed repair state: {}", e),
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
