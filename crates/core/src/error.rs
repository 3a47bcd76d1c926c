use std::fmt;

use crate::role::Role;

/// Error taxonomy for the dispatch core. Configuration/bind/capability
/// errors are fatal and propagate out of `initialize`; everything else is
/// contained within a single dispatch-loop iteration.
#[derive(Debug)]
pub enum CoreError {
    ConfigInvalid(String),
    BindFailed(Role, std::io::Error),
    RecvCapabilityMissing(String),
    Unexpected(&'static str),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::ConfigInvalid(msg) => write!(f, "invalid configuration: {msg}"),
            CoreError::BindFailed(role, err) => write!(f, "bind failed for {role:?}: {err}"),
            CoreError::RecvCapabilityMissing(msg) => write!(f, "ancillary recv capability missing: {msg}"),
            CoreError::Unexpected(msg) => write!(f, "unexpected state transition: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

/// Why one datagram's processing stopped short of a response. Never
/// propagated as an `Err` out of the dispatch loop — logged and swallowed.
#[derive(Debug)]
pub enum HandlerError {
    /// The adapter declined with a STUN error code to send back to the
    /// client (e.g. 400 for a CHANGE-REQUEST toggling to an invalid role).
    Declined(u16),
    /// Method outside the supported set (TURN-only, relaying, etc).
    UnsupportedMethod,
}
