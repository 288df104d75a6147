/// Core abstractions shared by every route
pub mod address;
pub mod connection;
pub mod destination;
pub mod route;

use std::time::Duration;

/// How a route may be used by clients.
///
/// The numeric values are part of the observable surface (stats and
/// diagnostics render them) and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessMode {
    ReadWrite = 1,
    ReadOnly = 2,
}

impl AccessMode {
    /// Parse the textual form used in configuration files. Anything else is
    /// the undefined sentinel and must be rejected before a route is built.
    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "read-write" => Some(AccessMode::ReadWrite),
            "read-only" => Some(AccessMode::ReadOnly),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AccessMode::ReadWrite => "read-write",
            AccessMode::ReadOnly => "read-only",
        }
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// Route option defaults. The buffer length matches the server-side default;
// the client connect timeout is the server's connect_timeout minus one.
pub const DEFAULT_WAIT_TIMEOUT: u64 = 0; // 0 = no idle timeout once established
pub const DEFAULT_MAX_CONNECTIONS: usize = 512;
pub const DEFAULT_DESTINATION_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_NET_BUFFER_LENGTH: usize = 16384;
pub const DEFAULT_MAX_CONNECT_ERRORS: u64 = 100;
pub const DEFAULT_CLIENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(9);
