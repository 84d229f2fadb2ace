//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use tracing::{error, warn};

// KRSC errors.
#[derive(Debug)]
pub enum Error {
    InvalidMessage(String),
    UnknownTable(u32),
    NotFound(IpNetwork, u8),
    MultipathCorruption(IpNetwork, u8),
    Unsupported(String),
    TransportError(IoError),
}

// Netlink transport I/O errors.
#[derive(Debug)]
pub enum IoError {
    SocketError(std::io::Error),
    SendError(std::io::Error),
    RecvError(std::io::Error),
}

// ===== impl Error =====

impl Error {
    pub fn log(&self) {
        match self {
            Error::InvalidMessage(reason) => {
                warn!(%reason, "{}", self);
            }
            Error::UnknownTable(rtableid) => {
                // Too noisy during reloads; no log line by design.
                let _ = rtableid;
            }
            Error::NotFound(prefix, priority) => {
                warn!(%prefix, %priority, "{}", self);
            }
            Error::MultipathCorruption(prefix, priority) => {
                error!(%prefix, %priority, "{}", self);
            }
            Error::Unsupported(what) => {
                warn!(%what, "{}", self);
            }
            Error::TransportError(error) => {
                error.log();
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidMessage(..) => {
                write!(f, "malformed netlink message")
            }
            Error::UnknownTable(rtableid) => {
                write!(f, "unknown routing table {rtableid}")
            }
            Error::NotFound(..) => {
                write!(f, "route not found")
            }
            Error::MultipathCorruption(..) => {
                write!(f, "multipath chain corruption detected")
            }
            Error::Unsupported(..) => {
                write!(f, "unsupported address family")
            }
            Error::TransportError(..) => error_transport_fmt(f),
        }
    }
}

fn error_transport_fmt(f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "netlink transport error")
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::TransportError(error) => Some(error),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Error {
        Error::TransportError(error)
    }
}

// ===== impl IoError =====

impl IoError {
    pub(crate) fn log(&self) {
        match self {
            IoError::SocketError(error)
            | IoError::SendError(error)
            | IoError::RecvError(error) => {
                warn!(error = %with_source(error), "{}", self);
            }
        }
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoError::SocketError(..) => {
                write!(f, "failed to open netlink socket")
            }
            IoError::SendError(..) => {
                write!(f, "failed to send netlink message")
            }
            IoError::RecvError(..) => {
                write!(f, "failed to receive netlink message")
            }
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoError::SocketError(error)
            | IoError::SendError(error)
            | IoError::RecvError(error) => Some(error),
        }
    }
}

// ===== global functions =====

fn with_source<E: std::error::Error>(error: E) -> String {
    if let Some(source) = error.source() {
        format!("{} ({})", error, with_source(source))
    } else {
        error.to_string()
    }
}

// Aborts the process after logging a fatal invariant violation. Mirrors
// the source's `fatalx`: invariant breakage is not recoverable in-process,
// a supervisor is expected to restart with a fresh kernel sync.
#[track_caller]
pub fn fatal(msg: &str) -> ! {
    error!(invariant = %msg, "fatal invariant violation");
    std::process::abort();
}

// Helper trait so callers can attach a `NotFound`/`MultipathCorruption`
// prefix+priority pair without repeating the destructuring at each site.
pub(crate) fn not_found(prefix: IpNetwork, priority: u8) -> Error {
    Error::NotFound(prefix, priority)
}

pub(crate) fn multipath_corruption(prefix: IpNetwork, priority: u8) -> Error {
    Error::MultipathCorruption(prefix, priority)
}

pub(crate) fn unsupported(addr: IpAddr) -> Error {
    Error::Unsupported(format!("{addr}"))
}
