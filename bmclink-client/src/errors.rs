//! Error types for bmclink-client.

use std::{fmt, io};

use bmclink_proto::rakp;

/// The error type returned from any operation that talks to a BMC.
#[derive(Debug)]
pub enum IpmiError {
    /// The session is broken or logged out; nothing further will work.
    NotConnected,
    /// The retry budget ran out waiting for a reply.
    Timeout,
    /// The RAKP key exchange failed terminally.
    Rakp(rakp::Error),
    /// A login-phase protocol error, already rendered via the fixed tables.
    Login(String),
    /// A command completed with an error the operation cannot proceed past.
    Protocol(String),
    /// Serial-over-LAN activation or runtime failure.
    Sol(String),
    /// The caller handed over something invalid (user id, password,
    /// privilege level).
    InvalidArgument(String),
    /// The BMC wants something this client does not implement.
    Unsupported(String),
    /// Socket-level failure.
    Io(io::Error),
}

impl fmt::Display for IpmiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Session no longer connected"),
            Self::Timeout => write!(f, "timeout"),
            Self::Rakp(e) => write!(f, "{e}"),
            Self::Login(s) => write!(f, "{s}"),
            Self::Protocol(s) => write!(f, "{s}"),
            Self::Sol(s) => write!(f, "{s}"),
            Self::InvalidArgument(s) => write!(f, "{s}"),
            Self::Unsupported(s) => write!(f, "{s}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for IpmiError {}

impl From<io::Error> for IpmiError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<rakp::Error> for IpmiError {
    fn from(e: rakp::Error) -> Self {
        Self::Rakp(e)
    }
}

impl IpmiError {
    /// Whether the session survives this error (the caller may issue more
    /// commands).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::Timeout | Self::Rakp(_) | Self::Login(_)
        )
    }
}
