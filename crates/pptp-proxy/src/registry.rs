//! Registry of live links, shared by the dispatch loop and the GRE task.
//!
//! Access discipline:
//!
//! - [`LinkRegistry::read`] may run in many tasks at once; structural changes
//!   cannot happen while any read is in progress.
//! - [`LinkRegistry::write`] is exclusive. It waits for in-flight reads to
//!   finish and, once queued, holds back new readers until it is done.
//!
//! Only the dispatch loop writes, once per iteration, to apply the batch of
//! new and dead links. `tokio::sync::RwLock` provides exactly this fair,
//! write-preferring queue.

use crate::link::Link;
use pptp_core::{CallId, Side, UNSET_CALL_ID};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Where a GRE unit goes after resolution.
#[derive(Debug, Clone)]
pub struct Route {
    pub link: Arc<Link>,
    /// The side the unit is delivered to.
    pub side: Side,
    pub destination: Ipv4Addr,
    /// Id written into the unit before delivery.
    pub real_id: CallId,
    /// Source address for raw delivery; `None` lets the kernel choose.
    pub spoof_source: Option<Ipv4Addr>,
    /// Deliver as a PPTP-IN-TCP frame on the destination's control channel.
    pub wrap: bool,
}

/// Ordered collection of live links.
#[derive(Debug, Default)]
pub struct LinkRegistry {
    links: RwLock<Vec<Arc<Link>>>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with shared access to the links.
    pub async fn read<R>(&self, f: impl FnOnce(&[Arc<Link>]) -> R) -> R {
        let links = self.links.read().await;
        f(&links)
    }

    /// Run `f` with exclusive access to the links.
    pub async fn write<R>(&self, f: impl FnOnce(&mut Vec<Arc<Link>>) -> R) -> R {
        let mut links = self.links.write().await;
        f(&mut links)
    }

    /// Clone the current set of links.
    pub async fn snapshot(&self) -> Vec<Arc<Link>> {
        self.read(|links| links.to_vec()).await
    }

    /// Insert `added` and remove `removed` in one exclusive section.
    pub async fn apply(&self, added: Vec<Arc<Link>>, removed: &[Arc<Link>]) {
        let (inserted, dropped) = (added.len(), removed.len());
        let remaining = self
            .write(|links| {
                links.extend(added);
                links.retain(|link| !removed.iter().any(|dead| Arc::ptr_eq(dead, link)));
                links.len()
            })
            .await;
        debug!(inserted, dropped, remaining, "link registry updated");
    }

    /// Global reverse lookup: the counterpart of `id` in the first link that
    /// knows it (fake caller ↔ real caller, fake callee ↔ real callee).
    pub async fn resolve_counterpart(&self, id: CallId) -> Option<CallId> {
        self.read(|links| counterpart_in(links, id)).await
    }

    /// Resolve a GRE unit from `source` carrying `call_id`.
    pub async fn find_peer(&self, source: Ipv4Addr, call_id: CallId) -> Option<Route> {
        self.read(|links| route_in(links, source, call_id)).await
    }

    /// Number of live links.
    pub async fn count(&self) -> usize {
        self.read(|links| links.len()).await
    }
}

/// Counterpart lookup over a snapshot of links.
pub fn counterpart_in(links: &[Arc<Link>], id: CallId) -> Option<CallId> {
    if id == UNSET_CALL_ID {
        return None;
    }
    links.iter().find_map(|link| {
        let ids = link.call_ids();
        if id == ids.fake_caller {
            Some(ids.real_caller)
        } else if id == ids.real_caller {
            Some(ids.fake_caller)
        } else if id == ids.fake_callee {
            Some(ids.real_callee)
        } else if id == ids.real_callee {
            Some(ids.fake_callee)
        } else {
            None
        }
    })
}

/// GRE peer resolution over a snapshot of links.
///
/// A unit from the callee addressed to the caller's fake id goes to the
/// caller; a unit from the caller addressed to the callee's fake id goes to
/// the callee. Anything else has no route.
pub fn route_in(links: &[Arc<Link>], source: Ipv4Addr, call_id: CallId) -> Option<Route> {
    if call_id == UNSET_CALL_ID {
        return None;
    }
    links.iter().find_map(|link| {
        if call_id == link.fake_id(Side::Caller) && source == link.address(Side::Callee) {
            Some(Route {
                link: link.clone(),
                side: Side::Caller,
                destination: link.address(Side::Caller),
                real_id: link.real_id(Side::Caller),
                spoof_source: Some(link.caller_return_addr()),
                wrap: link.can_wrap(Side::Caller),
            })
        } else if call_id == link.fake_id(Side::Callee) && source == link.address(Side::Caller) {
            Some(Route {
                link: link.clone(),
                side: Side::Callee,
                destination: link.address(Side::Callee),
                real_id: link.real_id(Side::Callee),
                spoof_source: None,
                wrap: link.can_wrap(Side::Callee),
            })
        } else {
            None
        }
    })
}
