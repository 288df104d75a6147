/// Destination and bind addresses
///
/// Accepts `"host"`, `"host:port"` and `"[v6]:port"`. A port of 0 after
/// parsing means "use the protocol default" and is filled in with
/// [`RouteAddress::with_default_port`].
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::protocol::ProtocolKind;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid address '{0}': empty host")]
    EmptyHost(String),

    #[error("invalid address '{0}': malformed IP literal")]
    MalformedIp(String),

    #[error("invalid address '{0}': host contains invalid characters")]
    InvalidHost(String),

    #[error("invalid address '{0}': port out of range or not a number")]
    InvalidPort(String),

    #[error("invalid address '{0}'")]
    Malformed(String),
}

/// A parsed `host:port` pair. Equality and hashing are structural over both
/// fields; display is stable and re-parseable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteAddress {
    pub host: String,
    pub port: u16,
}

impl RouteAddress {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse an address in one of the accepted textual forms.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(AddressError::EmptyHost(input.to_string()));
        }

        if let Some(rest) = s.strip_prefix('[') {
            // bracketed IPv6, optionally followed by :port
            let close = rest
                .find(']')
                .ok_or_else(|| AddressError::Malformed(input.to_string()))?;
            let host = &rest[..close];
            if host.parse::<Ipv6Addr>().is_err() {
                return Err(AddressError::MalformedIp(input.to_string()));
            }
            let tail = &rest[close + 1..];
            let port = if tail.is_empty() {
                0
            } else {
                let digits = tail
                    .strip_prefix(':')
                    .ok_or_else(|| AddressError::Malformed(input.to_string()))?;
                Self::parse_port(digits, input)?
            };
            return Ok(Self::new(host, port));
        }

        // an unbracketed literal with more than one colon can only be IPv6
        if s.matches(':').count() > 1 {
            if s.parse::<Ipv6Addr>().is_err() {
                return Err(AddressError::MalformedIp(input.to_string()));
            }
            return Ok(Self::new(s, 0));
        }

        let (host, port) = match s.split_once(':') {
            Some((host, digits)) => (host, Self::parse_port(digits, input)?),
            None => (s, 0),
        };

        Self::validate_host(host, input)?;
        Ok(Self::new(host, port))
    }

    fn parse_port(digits: &str, input: &str) -> Result<u16, AddressError> {
        if digits.is_empty() {
            return Err(AddressError::InvalidPort(input.to_string()));
        }
        digits
            .parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(input.to_string()))
    }

    fn validate_host(host: &str, input: &str) -> Result<(), AddressError> {
        if host.is_empty() {
            return Err(AddressError::EmptyHost(input.to_string()));
        }
        // a host made only of digits and dots must be a well-formed IPv4
        // literal; this is what rejects "127.0.0.1.2"
        if host.chars().all(|c| c.is_ascii_digit() || c == '.') {
            if host.parse::<Ipv4Addr>().is_err() {
                return Err(AddressError::MalformedIp(input.to_string()));
            }
            return Ok(());
        }
        if !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
        {
            return Err(AddressError::InvalidHost(input.to_string()));
        }
        Ok(())
    }

    /// Fill in a zero port with the protocol's default.
    pub fn with_default_port(mut self, protocol: ProtocolKind) -> Self {
        if self.port == 0 {
            self.port = protocol.default_port();
        }
        self
    }
}

impl fmt::Display for RouteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
