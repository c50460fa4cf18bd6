//! The VM console capability consumed by the script engine.
//!
//! This module defines the [`VmConsole`] trait, the common interface for
//! anything that can push keystrokes into a guest and capture its display.
//! The production implementation is [`QmpClient`](crate::qmp::QmpClient);
//! tests substitute recording stubs.
//!
//! # Transport Selection
//!
//! Use [`ConnectConfig`] to pick the monitor transport at runtime:
//!
//! ```
//! use vmatic_core::vm::ConnectConfig;
//!
//! // Unix socket monitor (the common case)
//! let config = ConnectConfig::parse("/run/vm/qmp.sock").unwrap();
//!
//! // TCP monitor
//! let config = ConnectConfig::parse("localhost:4444").unwrap();
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur while talking to the VM monitor.
///
/// All variants map to the engine's fatal `VMCommunicationError` class; the
/// script layer never retries transport failures on its own.
#[derive(Error, Debug)]
pub enum VmError {
    /// Attempted an operation without an active monitor connection.
    #[error("not connected to VM monitor")]
    NotConnected,

    /// Failed to establish the monitor connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The monitor accepted the command but reported an error.
    #[error("monitor command failed: {0}")]
    CommandFailed(String),

    /// The monitor sent something that is not valid QMP.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An I/O error occurred on the monitor stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A connect or read operation exceeded its timeout.
    #[error("operation timed out")]
    Timeout,
}

/// Where to find the QMP monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectConfig {
    /// A Unix domain socket, e.g. `-qmp unix:/run/vm/qmp.sock,server,nowait`.
    Unix {
        /// Filesystem path of the socket.
        path: PathBuf,
    },
    /// A TCP monitor, e.g. `-qmp tcp:localhost:4444,server,nowait`.
    Tcp {
        /// The hostname or IP address the monitor listens on.
        host: String,
        /// The TCP port.
        port: u16,
    },
}

impl ConnectConfig {
    /// Parses a user-supplied monitor address.
    ///
    /// `host:port` selects TCP; anything else is treated as a Unix socket
    /// path. A trailing `:port` only counts when the port parses as a number,
    /// so paths containing colons still work.
    pub fn parse(addr: &str) -> Result<Self, VmError> {
        if addr.is_empty() {
            return Err(VmError::ConnectionFailed("empty monitor address".into()));
        }
        if let Some((host, port)) = addr.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                if !host.is_empty() && !host.contains('/') {
                    return Ok(ConnectConfig::Tcp {
                        host: host.to_string(),
                        port,
                    });
                }
            }
        }
        Ok(ConnectConfig::Unix {
            path: PathBuf::from(addr),
        })
    }
}

/// A guest console that accepts keystrokes and can be screenshotted.
///
/// Implementations must be shareable across the engine and the debugger's
/// read-only screen probe, hence `Send + Sync` and `&self` methods.
#[async_trait]
pub trait VmConsole: Send + Sync {
    /// Presses and releases a single key, given by its QMP qcode name
    /// (e.g. `ret`, `tab`, `f2`).
    async fn send_key(&self, name: &str) -> Result<(), VmError>;

    /// Presses a set of keys together (e.g. `["ctrl", "alt", "f2"]`) and
    /// releases them.
    async fn send_combo(&self, keys: &[String]) -> Result<(), VmError>;

    /// Types `text` into the console one character at a time, sleeping
    /// `delay` between keystrokes. Does not append Enter.
    async fn send_string(&self, text: &str, delay: Duration) -> Result<(), VmError>;

    /// Captures the current console display to `output` (PPM format, as
    /// produced by QEMU's `screendump`).
    async fn screenshot(&self, output: &Path) -> Result<(), VmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_unix_path() {
        let config = ConnectConfig::parse("/run/vm/qmp.sock").unwrap();
        assert_eq!(
            config,
            ConnectConfig::Unix {
                path: PathBuf::from("/run/vm/qmp.sock")
            }
        );
    }

    #[test]
    fn parse_tcp_address() {
        let config = ConnectConfig::parse("localhost:4444").unwrap();
        assert_eq!(
            config,
            ConnectConfig::Tcp {
                host: "localhost".to_string(),
                port: 4444
            }
        );
    }

    #[test]
    fn parse_path_with_colon_stays_unix() {
        // The "port" is not numeric, so this is a path.
        let config = ConnectConfig::parse("/tmp/qmp:sock").unwrap();
        assert!(matches!(config, ConnectConfig::Unix { .. }));
    }

    #[test]
    fn parse_path_with_numeric_suffix_after_slash_stays_unix() {
        let config = ConnectConfig::parse("/var/run/vm:1234/qmp.sock").unwrap();
        assert!(matches!(config, ConnectConfig::Unix { .. }));
    }

    #[test]
    fn parse_empty_is_an_error() {
        assert!(ConnectConfig::parse("").is_err());
    }
}
