//! Server addresses: the identity key for pooling and routing.

use std::fmt;
use std::str::FromStr;

use crate::error::DriverError;

/// Default Bolt port.
pub const DEFAULT_PORT: u16 = 7687;

/// A `host:port` pair identifying one server.
///
/// Addresses are compared verbatim: `localhost:7687` and `127.0.0.1:7687`
/// are different pool keys, exactly as the routing table reports them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parses `host`, `host:port`, `[v6]` or `[v6]:port`.
    pub fn parse(s: &str) -> Result<Self, DriverError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DriverError::Configuration("empty address".into()));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                DriverError::Configuration(format!("unterminated IPv6 address: {s}"))
            })?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p, s)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => {
                    return Err(DriverError::Configuration(format!("invalid address: {s}")));
                }
            };
            return Ok(Self::new(host, port));
        }

        match s.rsplit_once(':') {
            // More than one colon without brackets: a bare IPv6 host.
            Some((host, _)) if host.contains(':') => Ok(Self::new(s, DEFAULT_PORT)),
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(DriverError::Configuration(format!("missing host: {s}")));
                }
                Ok(Self::new(host, parse_port(port, s)?))
            }
            None => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }

    /// The `host:port` string handed to the socket layer.
    pub(crate) fn to_socket_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(p: &str, whole: &str) -> Result<u16, DriverError> {
    p.parse::<u16>()
        .map_err(|_| DriverError::Configuration(format!("invalid port in address: {whole}")))
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_socket_string())
    }
}

impl FromStr for Address {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_only_uses_default_port() {
        let a = Address::parse("graph.local").unwrap();
        assert_eq!(a, Address::new("graph.local", DEFAULT_PORT));
    }

    #[test]
    fn parse_host_and_port() {
        let a: Address = "10.0.0.1:7688".parse().unwrap();
        assert_eq!(a.host(), "10.0.0.1");
        assert_eq!(a.port(), 7688);
        assert_eq!(a.to_string(), "10.0.0.1:7688");
    }

    #[test]
    fn parse_ipv6() {
        let a = Address::parse("[::1]:9000").unwrap();
        assert_eq!(a.host(), "::1");
        assert_eq!(a.port(), 9000);
        assert_eq!(a.to_string(), "[::1]:9000");

        let bare = Address::parse("::1").unwrap();
        assert_eq!(bare.port(), DEFAULT_PORT);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Address::parse("").is_err());
        assert!(Address::parse("host:notaport").is_err());
        assert!(Address::parse(":7687").is_err());
        assert!(Address::parse("[::1").is_err());
    }
}
