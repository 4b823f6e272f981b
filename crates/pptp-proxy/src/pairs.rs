//! Listener pairs: a bound local listening socket plus the remote PPTP
//! server every accepted caller is forwarded to.
//!
//! Pairs are built once at startup from `[listen[:port],]remote[:port]`
//! specs and never change afterwards.

use crate::resolver::{Resolver, PPTP_PORT};
use pptp_core::{ProxyError, ProxyResult};
use socket2::{Domain, Socket, Type};
use std::net::{SocketAddr, SocketAddrV4};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

const LISTEN_BACKLOG: i32 = 100;

/// A parsed but unresolved forwarding pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairSpec {
    pub listen: String,
    pub remote: String,
}

impl PairSpec {
    /// Parse `[listen[:port],]remote[:port]`. Without a listen part the
    /// pair listens on `0.0.0.0:1723`.
    pub fn parse(spec: &str) -> ProxyResult<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(ProxyError::Config("empty argument for --proxy".into()));
        }
        let (listen, remote) = match spec.split_once(',') {
            Some((listen, remote)) => (listen.trim().to_string(), remote.trim().to_string()),
            None => (format!("0.0.0.0:{PPTP_PORT}"), spec.to_string()),
        };
        if listen.is_empty() || remote.is_empty() {
            return Err(ProxyError::Config(format!("invalid pair '{spec}'")));
        }
        Ok(Self { listen, remote })
    }
}

/// A listening socket and the remote endpoint it forwards to.
#[derive(Debug)]
pub struct ListenerPair {
    pub listener: TcpListener,
    /// Address the listener is bound to.
    pub listen_addr: SocketAddrV4,
    pub remote_addr: SocketAddrV4,
    /// The listen part as configured, for log lines.
    pub listen_name: String,
    /// The remote part as configured, for log lines.
    pub remote_name: String,
}

impl ListenerPair {
    /// Bind a listening socket with `SO_REUSEADDR` for `listen_addr`.
    pub fn bind(
        spec: &PairSpec,
        listen_addr: SocketAddrV4,
        remote_addr: SocketAddrV4,
    ) -> ProxyResult<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::V4(listen_addr).into())?;
        socket.listen(LISTEN_BACKLOG)?;

        let listener = TcpListener::from_std(socket.into())?;
        let listen_addr = match listener.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => listen_addr,
        };

        Ok(Self {
            listener,
            listen_addr,
            remote_addr,
            listen_name: spec.listen.clone(),
            remote_name: spec.remote.clone(),
        })
    }

    /// Two pairs conflict when they use the same port and either address is
    /// the wildcard or both are equal.
    fn conflicts_with(&self, addr: &SocketAddrV4) -> bool {
        self.listen_addr.port() == addr.port()
            && (self.listen_addr.ip() == addr.ip()
                || addr.ip().is_unspecified()
                || self.listen_addr.ip().is_unspecified())
    }
}

/// Resolve and bind every pair. Pairs that cannot be resolved, conflict with
/// an earlier pair, or fail to bind are skipped with a warning.
pub async fn bind_pairs(specs: &[String]) -> Vec<ListenerPair> {
    let mut pairs: Vec<ListenerPair> = Vec::new();

    for raw in specs {
        let spec = match PairSpec::parse(raw) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(pair = %raw, error = %e, "ignoring pair");
                continue;
            }
        };

        let listen_addr = match Resolver::resolve_endpoint(&spec.listen).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!(listen = %spec.listen, remote = %spec.remote, error = %e,
                    "pair ignored: listen address can not be resolved");
                continue;
            }
        };
        let remote_addr = match Resolver::resolve_endpoint(&spec.remote).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!(listen = %spec.listen, remote = %spec.remote, error = %e,
                    "pair ignored: peer address can not be resolved");
                continue;
            }
        };

        // Port 0 asks the OS for a port and cannot clash.
        if listen_addr.port() != 0 {
            if let Some(existing) = pairs.iter().find(|p| p.conflicts_with(&listen_addr)) {
                warn!(
                    listen = %spec.listen,
                    remote = %spec.remote,
                    existing_listen = %existing.listen_name,
                    existing_remote = %existing.remote_name,
                    "pair ignored: conflicts with a previously specified pair"
                );
                continue;
            }
        }

        match ListenerPair::bind(&spec, listen_addr, remote_addr) {
            Ok(pair) => {
                info!(listen = %pair.listen_addr, remote = %pair.remote_addr, "proxy pair ready");
                pairs.push(pair);
            }
            Err(e) => warn!(listen = %spec.listen, error = %e, "couldn't bind listen socket, pair ignored"),
        }
    }

    debug!(count = pairs.len(), "listener pairs bound");
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn spec_with_and_without_listen_part() {
        assert_eq!(
            PairSpec::parse("10.0.0.5").unwrap(),
            PairSpec {
                listen: "0.0.0.0:1723".into(),
                remote: "10.0.0.5".into()
            }
        );
        assert_eq!(
            PairSpec::parse("127.0.0.1:1724,vpn.example.com:1723").unwrap(),
            PairSpec {
                listen: "127.0.0.1:1724".into(),
                remote: "vpn.example.com:1723".into()
            }
        );
        assert!(PairSpec::parse("").is_err());
        assert!(PairSpec::parse("127.0.0.1,").is_err());
    }

    #[tokio::test]
    async fn binds_ephemeral_port() {
        let pairs = bind_pairs(&["127.0.0.1:0,10.0.0.5:1723".to_string()]).await;
        assert_eq!(pairs.len(), 1);
        assert_ne!(pairs[0].listen_addr.port(), 0);
        assert_eq!(pairs[0].remote_addr, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 1723));
    }

    #[tokio::test]
    async fn conflicting_pair_is_skipped() {
        let first = bind_pairs(&["127.0.0.1:0,10.0.0.5".to_string()]).await;
        let port = first[0].listen_addr.port();
        drop(first);

        let specs = vec![
            format!("127.0.0.1:{port},10.0.0.5"),
            format!("0.0.0.0:{port},10.0.0.6"),
        ];
        let pairs = bind_pairs(&specs).await;
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].remote_addr.ip(), &Ipv4Addr::new(10, 0, 0, 5));
    }

    #[tokio::test]
    async fn unparsable_pair_is_skipped() {
        let pairs = bind_pairs(&["127.0.0.1:notaport,10.0.0.5".to_string()]).await;
        assert!(pairs.is_empty());
    }
}
