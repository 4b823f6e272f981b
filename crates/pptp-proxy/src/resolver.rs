//! Name resolution for listen/remote endpoints and ACL subnets.
//!
//! Thin wrapper over `tokio::net::lookup_host` that keeps IPv4 results only,
//! plus `host[:port]` endpoint parsing with the PPTP default port.

use pptp_core::{ProxyError, ProxyResult};
use std::net::{Ipv4Addr, SocketAddrV4};
use tokio::net;
use tracing::{debug, warn};

/// TCP port of the PPTP control connection.
pub const PPTP_PORT: u16 = 1723;

/// Stateless async resolver; the struct exists only for namespacing.
pub struct Resolver;

impl Resolver {
    /// Resolve a hostname, dotted-quad or decimal integer to an IPv4 address.
    ///
    /// Numeric addresses are returned without a lookup.
    pub async fn resolve(name: &str) -> ProxyResult<Ipv4Addr> {
        if let Some(ip) = parse_numeric(name) {
            return Ok(ip);
        }

        // lookup_host requires a port
        let lookup_addr = format!("{}:0", name);
        let result = net::lookup_host(&lookup_addr).await;
        match result {
            Ok(mut addrs) => {
                let found = addrs.find_map(|addr| match addr.ip() {
                    std::net::IpAddr::V4(ip) => Some(ip),
                    std::net::IpAddr::V6(_) => None,
                });
                match found {
                    Some(ip) => {
                        debug!(name = %name, ip = %ip, "resolved");
                        Ok(ip)
                    }
                    None => {
                        debug!(name = %name, "no IPv4 address found");
                        Err(ProxyError::Resolve(format!("{name}: no IPv4 address")))
                    }
                }
            }
            Err(e) => {
                warn!(name = %name, error = %e, "name resolution failed");
                Err(ProxyError::Resolve(format!("{name}: {e}")))
            }
        }
    }

    /// Parse and resolve `host[:port]`; the port defaults to 1723.
    pub async fn resolve_endpoint(endpoint: &str) -> ProxyResult<SocketAddrV4> {
        let (host, port) = split_host_port(endpoint)?;
        let ip = Self::resolve(host).await?;
        Ok(SocketAddrV4::new(ip, port))
    }
}

/// Dotted quad or plain decimal (`0` in `0/0`).
pub fn parse_numeric(s: &str) -> Option<Ipv4Addr> {
    s.parse::<Ipv4Addr>()
        .ok()
        .or_else(|| s.parse::<u32>().ok().map(Ipv4Addr::from))
}

/// Split `host[:port]` without resolving anything.
pub fn split_host_port(endpoint: &str) -> ProxyResult<(&str, u16)> {
    let endpoint = endpoint.trim();
    match endpoint.split_once(':') {
        None if !endpoint.is_empty() => Ok((endpoint, PPTP_PORT)),
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| {
                ProxyError::Config(format!("address {endpoint} has an invalid port"))
            })?;
            Ok((host, port))
        }
        _ => Err(ProxyError::Config(format!("invalid address '{endpoint}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_defaults_port() {
        assert_eq!(split_host_port("10.0.0.5").unwrap(), ("10.0.0.5", 1723));
        assert_eq!(split_host_port("vpn.example.com:4000").unwrap(), ("vpn.example.com", 4000));
        assert!(split_host_port("10.0.0.5:http").is_err());
        assert!(split_host_port(":1723").is_err());
        assert!(split_host_port("").is_err());
    }

    #[tokio::test]
    async fn literal_needs_no_lookup() {
        let addr = Resolver::resolve_endpoint("0.0.0.0").await.unwrap();
        assert_eq!(addr, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 1723));
    }

    #[tokio::test]
    async fn decimal_needs_no_lookup() {
        let addr = Resolver::resolve_endpoint("0").await.unwrap();
        assert_eq!(addr, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 1723));
        assert_eq!(
            Resolver::resolve("167772165").await.unwrap(),
            Ipv4Addr::new(10, 0, 0, 5)
        );
        assert_eq!(parse_numeric("vpn"), None);
    }

    #[tokio::test]
    async fn resolve_localhost() {
        let ip = Resolver::resolve("localhost").await;
        assert_eq!(ip.unwrap(), Ipv4Addr::LOCALHOST);
    }

    #[tokio::test]
    async fn resolve_invalid() {
        let result = Resolver::resolve("this.host.definitely.does.not.exist.invalid").await;
        assert!(matches!(result, Err(ProxyError::Resolve(_))));
    }
}
