// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Failure values carried in a unit's result slot.

use std::io;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;

use thiserror::Error;

/// Result of a finished unit: its value or the failure it captured.
pub type Outcome<T> = Result<T, Failure>;

/// Everything a unit can fail with.
///
/// OS-call failures are captured here and travel up the continuation chain
/// exactly like values. Protocol misuse (reading a result early, awaiting a
/// combinator outside a task) is not a `Failure`; it panics.
#[derive(Debug, Error)]
pub enum Failure {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to register fd {fd} with the reactor: {source}")]
    Register {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("fd {0} already has a pending registration from another unit")]
    Busy(RawFd),

    #[error("invalid IPv4 address `{0}`")]
    InvalidAddress(String),

    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },

    #[error("unit panicked: {0}")]
    Panicked(String),

    #[error("when_any needs at least one unit")]
    NoUnits,

    #[error("runtime went idle before the unit finished")]
    Stalled,

    #[error("{0}")]
    Custom(String),
}

impl Failure {
    /// A user-level failure with a message, for computations that want to
    /// fail without an OS error behind them.
    pub fn custom(msg: impl Into<String>) -> Self {
        Failure::Custom(msg.into())
    }

    /// The raw OS error code, if this failure came from a syscall.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Failure::Io(e) => e.raw_os_error(),
            Failure::Register { source, .. } | Failure::Connect { source, .. } => {
                source.raw_os_error()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(Failure::custom("boom").to_string(), "boom");
        assert_eq!(
            Failure::Busy(7).to_string(),
            "fd 7 already has a pending registration from another unit"
        );
        assert_eq!(
            Failure::InvalidAddress("1.2.3".into()).to_string(),
            "invalid IPv4 address `1.2.3`"
        );
    }

    #[test]
    fn raw_os_error_passthrough() {
        let f = Failure::Connect {
            addr: SocketAddrV4::new([127, 0, 0, 1].into(), 1),
            source: io::Error::from_raw_os_error(libc::ECONNREFUSED),
        };
        assert_eq!(f.raw_os_error(), Some(libc::ECONNREFUSED));
        assert_eq!(Failure::NoUnits.raw_os_error(), None);
    }
}
