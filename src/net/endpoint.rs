//! Resolved TCP endpoints.
//!
//! An [`Endpoint`] is immutable once created and cheap to share by
//! reference: every worker thread reads the same listen/upstream
//! endpoints for the lifetime of the process.

use crate::error::ResolveError;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

/// A resolved "host:port" pair with its printable form cached at
/// creation time.
#[derive(Debug, Clone)]
pub struct Endpoint {
    addr: SocketAddr,
    display: String,
}

impl Endpoint {
    /// Parse and resolve a "host:port" string.
    ///
    /// The *last* `:` separates host from port, so IPv6 literals must be
    /// bracketed (`[::1]:6379`) the way `SocketAddr`'s own `FromStr`
    /// requires. For `is_server` endpoints, an empty host or a literal
    /// `*` is treated as a request for the IPv4 wildcard address
    /// (`0.0.0.0`), standing in for the original implementation's
    /// `AI_PASSIVE` resolver hint.
    pub fn resolve(arg: &str, is_server: bool) -> Result<Self, ResolveError> {
        let (host, port_str) = arg
            .rsplit_once(':')
            .ok_or_else(|| ResolveError::MissingPort(arg.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let port: u16 = port_str
            .parse()
            .map_err(|_| ResolveError::MissingPort(arg.to_string()))?;

        if is_server && (host.is_empty() || host == "*") {
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            return Ok(Endpoint {
                addr,
                display: addr.to_string(),
            });
        }

        let mut addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| ResolveError::Lookup(arg.to_string(), e))?
            .collect();

        if addrs.is_empty() {
            return Err(ResolveError::NoAddresses(arg.to_string()));
        }

        // Prefer IPv4 when both families are present in the result set.
        addrs.sort_by_key(|a| !a.is_ipv4());
        let addr = addrs[0];

        Ok(Endpoint {
            addr,
            display: addr.to_string(),
        })
    }

    /// The resolved socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `true` if this endpoint resolved to an IPv4 address.
    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_literal_ipv4() {
        let ep = Endpoint::resolve("127.0.0.1:6380", false).unwrap();
        assert_eq!(ep.addr(), "127.0.0.1:6380".parse().unwrap());
        assert_eq!(ep.to_string(), "127.0.0.1:6380");
    }

    #[test]
    fn resolves_bracketed_ipv6() {
        let ep = Endpoint::resolve("[::1]:6380", false).unwrap();
        assert!(ep.addr().is_ipv6());
        assert_eq!(ep.addr().port(), 6380);
    }

    #[test]
    fn server_wildcard_on_empty_host() {
        let ep = Endpoint::resolve(":6380", true).unwrap();
        assert_eq!(ep.addr(), "0.0.0.0:6380".parse().unwrap());
    }

    #[test]
    fn server_wildcard_on_star() {
        let ep = Endpoint::resolve("*:6380", true).unwrap();
        assert_eq!(ep.addr(), "0.0.0.0:6380".parse().unwrap());
    }

    #[test]
    fn missing_port_is_an_error() {
        assert!(matches!(
            Endpoint::resolve("localhost", false),
            Err(ResolveError::MissingPort(_))
        ));
    }

    #[test]
    fn last_colon_delimits_port() {
        // last ':' splits host from port, consistent with the original
        // implementation's strrchr(arg, ':') behavior.
        let ep = Endpoint::resolve("127.0.0.1:6380", false).unwrap();
        assert_eq!(ep.addr().port(), 6380);
    }
}
