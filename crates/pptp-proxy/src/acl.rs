//! Caller admission: subnet allowlist plus optional external check commands.
//!
//! The policy layer is split into two types:
//!
//! - [`AclPolicy`]: the plain configuration (subnet strings and commands).
//! - [`AccessControl`]: the runtime counterpart holding parsed subnets; it
//!   answers [`AccessControl::admit_source`] for every accepted connection.

use crate::resolver::{parse_numeric, Resolver};
use pptp_core::{ProxyError, ProxyResult};
use std::net::Ipv4Addr;
use tokio::process::Command;
use tracing::{debug, warn};

/// Static admission configuration.
///
/// Subnets are written `net/mask`, where `mask` is either a dotted quad
/// (`255.255.0.0`) or a prefix length (`16`). `net` may be a hostname.
/// Commands are run as `CMD <ip>`; exit status 0 admits the caller.
///
/// With neither subnets nor commands, everything is admitted (`0/0`).
#[derive(Debug, Clone, Default)]
pub struct AclPolicy {
    pub subnets: Vec<String>,
    pub commands: Vec<String>,
}

/// One admitted network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    pub network: Ipv4Addr,
    pub mask: Ipv4Addr,
}

impl Subnet {
    /// Parse `net/mask`, resolving `net` if it is a hostname.
    pub async fn parse(spec: &str) -> ProxyResult<Self> {
        let (net, mask) = spec.split_once('/').ok_or_else(|| {
            ProxyError::Config(format!("{spec}: incorrect acl syntax, should be net/mask"))
        })?;

        let network = match parse_numeric(net) {
            Some(ip) => ip,
            None => Resolver::resolve(net)
                .await
                .map_err(|_| ProxyError::Config(format!("couldn't resolve subnet {net} in acl {spec}")))?,
        };

        let mask = match (mask.parse::<Ipv4Addr>(), mask.parse::<u32>()) {
            (Ok(ip), _) => ip,
            (_, Ok(bits)) if bits <= 32 => prefix_mask(bits),
            _ => {
                return Err(ProxyError::Config(format!(
                    "couldn't parse subnet mask {mask} in acl {spec}"
                )))
            }
        };

        Ok(Self { network, mask })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.mask);
        u32::from(ip) & mask == u32::from(self.network) & mask
    }
}

fn prefix_mask(bits: u32) -> Ipv4Addr {
    if bits == 0 {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::from(u32::MAX << (32 - bits))
    }
}

/// Runtime admission check built from an [`AclPolicy`].
#[derive(Debug)]
pub struct AccessControl {
    subnets: Vec<Subnet>,
    commands: Vec<String>,
}

impl AccessControl {
    /// Parse every subnet of the policy. A malformed entry is a fatal
    /// configuration error.
    pub async fn new(policy: AclPolicy) -> ProxyResult<Self> {
        let mut subnets = Vec::with_capacity(policy.subnets.len());
        for spec in &policy.subnets {
            let subnet = Subnet::parse(spec).await?;
            debug!(acl = %spec, network = %subnet.network, mask = %subnet.mask, "adding acl");
            subnets.push(subnet);
        }

        if subnets.is_empty() && policy.commands.is_empty() {
            debug!("no acl specified, forcing 0/0 (all allowed)");
            subnets.push(Subnet {
                network: Ipv4Addr::UNSPECIFIED,
                mask: Ipv4Addr::UNSPECIFIED,
            });
        }

        Ok(Self {
            subnets,
            commands: policy.commands,
        })
    }

    /// Decide whether a caller from `ip` may open a link.
    pub async fn admit_source(&self, ip: Ipv4Addr) -> bool {
        if let Some(subnet) = self.subnets.iter().find(|s| s.contains(ip)) {
            debug!(ip = %ip, network = %subnet.network, mask = %subnet.mask, "acl match, authorized");
            return true;
        }

        for cmd in &self.commands {
            let line = format!("{cmd} {ip}");
            match Command::new("sh").arg("-c").arg(&line).status().await {
                Ok(status) => {
                    debug!(ip = %ip, cmd = %line, status = ?status.code(), "acl command returned");
                    if status.success() {
                        return true;
                    }
                }
                Err(e) => warn!(cmd = %line, error = %e, "acl command failed to run"),
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(subnets: &[&str], commands: &[&str]) -> AclPolicy {
        AclPolicy {
            subnets: subnets.iter().map(|s| s.to_string()).collect(),
            commands: commands.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn empty_policy_admits_everyone() {
        let acl = AccessControl::new(AclPolicy::default()).await.unwrap();
        assert!(acl.admit_source(Ipv4Addr::new(203, 0, 113, 9)).await);
    }

    #[tokio::test]
    async fn dotted_and_prefix_masks() {
        let acl = AccessControl::new(policy(&["10.0.0.0/255.0.0.0", "192.168.1.0/24"], &[]))
            .await
            .unwrap();
        assert!(acl.admit_source(Ipv4Addr::new(10, 20, 30, 40)).await);
        assert!(acl.admit_source(Ipv4Addr::new(192, 168, 1, 77)).await);
        assert!(!acl.admit_source(Ipv4Addr::new(192, 168, 2, 77)).await);
        assert!(!acl.admit_source(Ipv4Addr::new(11, 0, 0, 1)).await);
    }

    #[tokio::test]
    async fn zero_slash_zero_matches_all() {
        let subnet = Subnet::parse("0/0").await.unwrap();
        assert!(subnet.contains(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[tokio::test]
    async fn malformed_entries_are_rejected() {
        assert!(Subnet::parse("10.0.0.0").await.is_err());
        assert!(Subnet::parse("10.0.0.0/33").await.is_err());
    }

    #[tokio::test]
    async fn command_decides_when_no_subnet_matches() {
        let allow = AccessControl::new(policy(&["10.0.0.0/8"], &["true"])).await.unwrap();
        assert!(allow.admit_source(Ipv4Addr::new(172, 16, 0, 1)).await);

        let deny = AccessControl::new(policy(&["10.0.0.0/8"], &["false"])).await.unwrap();
        assert!(!deny.admit_source(Ipv4Addr::new(172, 16, 0, 1)).await);
    }
}
