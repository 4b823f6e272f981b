//! Control-plane dispatch loop.
//!
//! One task owns the listeners, the id allocator and every write to the
//! link registry. Each iteration:
//!
//! 1. snapshots the live links,
//! 2. waits until a listener has a pending caller or a control socket is
//!    readable, then collects every other event that is already ready,
//! 3. admits new callers and runs the control rewriter for readable sockets,
//!    staging new links and dead ones,
//! 4. applies the staged changes to the registry in one write.

use crate::acl::AccessControl;
use crate::control::{self, ControlContext, ReadOutcome};
use crate::gre::DataPlane;
use crate::link::Link;
use crate::pairs::ListenerPair;
use crate::registry::LinkRegistry;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use pptp_core::{IdAllocator, ProxyError, ProxyResult, Side};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// A readiness event collected in one iteration.
enum Readiness {
    /// A caller is waiting on the listener of pair `usize`.
    Incoming(usize, io::Result<(TcpStream, SocketAddr)>),
    /// A control socket of a link became readable (or failed).
    Control(Arc<Link>, Side, io::Result<()>),
}

pub struct Dispatcher {
    pairs: Vec<ListenerPair>,
    registry: Arc<LinkRegistry>,
    data_plane: Arc<DataPlane>,
    access: AccessControl,
    ids: IdAllocator,
    wrap_enabled: bool,
    packet_dump: bool,
}

impl Dispatcher {
    pub fn new(
        pairs: Vec<ListenerPair>,
        registry: Arc<LinkRegistry>,
        data_plane: Arc<DataPlane>,
        access: AccessControl,
        wrap_enabled: bool,
        packet_dump: bool,
    ) -> Self {
        Self {
            pairs,
            registry,
            data_plane,
            access,
            ids: IdAllocator::new(),
            wrap_enabled,
            packet_dump,
        }
    }

    /// Run until an unrecoverable error.
    pub async fn run(mut self) -> ProxyResult<()> {
        info!(
            pairs = self.pairs.len(),
            wrap = self.wrap_enabled,
            "dispatch loop started"
        );
        loop {
            self.poll_once().await?;
        }
    }

    /// One iteration of the loop.
    pub async fn poll_once(&mut self) -> ProxyResult<()> {
        let links = self.registry.snapshot().await;
        if self.pairs.is_empty() && links.is_empty() {
            return Err(ProxyError::Other("no listeners and no links to wait on".into()));
        }

        let events = wait_ready(&self.pairs, &links).await;
        drop(links);

        let mut added: Vec<Arc<Link>> = Vec::new();
        let mut removed: Vec<Arc<Link>> = Vec::new();

        for event in events {
            match event {
                Readiness::Incoming(idx, Ok((stream, peer))) => {
                    if let Some(link) = self.admit(idx, stream, peer).await {
                        added.push(link);
                    }
                }
                Readiness::Incoming(idx, Err(e)) => {
                    warn!(listen = %self.pairs[idx].listen_name, error = %e, "accept failed");
                }
                Readiness::Control(link, side, ready) => {
                    if removed.iter().any(|dead| Arc::ptr_eq(dead, &link)) {
                        continue;
                    }
                    if let Err(e) = ready {
                        warn!(side = %side, caller = %link.address(Side::Caller), error = %e,
                            "control socket failed");
                        removed.push(link);
                        continue;
                    }

                    let mut ctx = ControlContext {
                        registry: &self.registry,
                        data_plane: &self.data_plane,
                        ids: &mut self.ids,
                        wrap_enabled: self.wrap_enabled,
                        packet_dump: self.packet_dump,
                    };
                    match control::handle_readable(&link, side, &mut ctx).await {
                        Ok(ReadOutcome::Open) => {}
                        Ok(ReadOutcome::Closed) => removed.push(link),
                        Err(e) => {
                            warn!(
                                side = %side,
                                caller = %link.address(Side::Caller),
                                remote = %link.remote_name(),
                                error = %e,
                                "tearing down link"
                            );
                            removed.push(link);
                        }
                    }
                }
            }
        }

        if !added.is_empty() || !removed.is_empty() {
            self.registry.apply(added, &removed).await;
        }
        Ok(())
    }

    /// Run admission for an accepted caller and connect it to the pair's
    /// remote server.
    async fn admit(&self, idx: usize, stream: TcpStream, peer: SocketAddr) -> Option<Arc<Link>> {
        let pair = &self.pairs[idx];
        let caller_addr: Ipv4Addr = match peer {
            SocketAddr::V4(addr) => *addr.ip(),
            SocketAddr::V6(addr) => {
                warn!(peer = %addr, listen = %pair.listen_name, "non-IPv4 caller rejected");
                return None;
            }
        };

        if !self.access.admit_source(caller_addr).await {
            warn!(
                listen = %pair.listen_name,
                error = %ProxyError::AccessDenied(caller_addr),
                "connection refused"
            );
            return None;
        }
        debug!(caller = %caller_addr, listen = %pair.listen_name, "caller admitted");

        match Link::establish(stream, caller_addr, pair).await {
            Ok(link) => Some(Arc::new(link)),
            Err(e) => {
                warn!(caller = %caller_addr, remote = %pair.remote_name, error = %e,
                    "couldn't connect to peer");
                None
            }
        }
    }
}

/// Wait for the first readiness event, then drain every event that is
/// already ready without waiting again.
async fn wait_ready(pairs: &[ListenerPair], links: &[Arc<Link>]) -> Vec<Readiness> {
    let mut pending: FuturesUnordered<BoxFuture<'_, Readiness>> = FuturesUnordered::new();

    for (idx, pair) in pairs.iter().enumerate() {
        pending.push(async move { Readiness::Incoming(idx, pair.listener.accept().await) }.boxed());
    }
    for link in links {
        for side in [Side::Caller, Side::Callee] {
            let link = link.clone();
            pending.push(
                async move {
                    let ready = link.channel(side).readable().await;
                    Readiness::Control(link, side, ready)
                }
                .boxed(),
            );
        }
    }

    let mut ready = Vec::new();
    if let Some(first) = pending.next().await {
        ready.push(first);
    }
    while let Some(Some(event)) = pending.next().now_or_never() {
        ready.push(event);
    }
    ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AclPolicy;
    use crate::gre::testing::RecordingSink;
    use crate::pairs::bind_pairs;
    use pptp_core::wire::{read_call_id, CALL_ID_OFFSET, CONTROL_MAGIC, MESSAGE_KIND_CONTROL};
    use std::net::SocketAddrV4;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn fake_remote() -> (TcpListener, SocketAddrV4) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = match listener.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => unreachable!(),
        };
        (listener, addr)
    }

    async fn dispatcher(remote: SocketAddrV4, policy: AclPolicy) -> (Dispatcher, SocketAddrV4) {
        let pairs = bind_pairs(&[format!("127.0.0.1:0,{remote}")]).await;
        let listen = pairs[0].listen_addr;
        let registry = Arc::new(LinkRegistry::new());
        let plane = Arc::new(DataPlane::new(
            registry.clone(),
            Arc::new(RecordingSink::default()),
            false,
        ));
        let access = AccessControl::new(policy).await.unwrap();
        (
            Dispatcher::new(pairs, registry, plane, access, true, false),
            listen,
        )
    }

    fn outgoing_call_request(call_id: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 168];
        buf[0..2].copy_from_slice(&168u16.to_be_bytes());
        buf[2..4].copy_from_slice(&MESSAGE_KIND_CONTROL);
        buf[4..8].copy_from_slice(&CONTROL_MAGIC);
        buf[8..10].copy_from_slice(&7u16.to_be_bytes());
        buf[12..14].copy_from_slice(&call_id.to_le_bytes());
        buf
    }

    #[tokio::test]
    async fn caller_is_linked_and_relayed() {
        let (remote, remote_addr) = fake_remote().await;
        let (mut dispatcher, listen) = dispatcher(remote_addr, AclPolicy::default()).await;

        let mut client = TcpStream::connect(listen).await.unwrap();
        dispatcher.poll_once().await.unwrap();
        assert_eq!(dispatcher.registry.count().await, 1);
        let (mut server, _) = remote.accept().await.unwrap();

        client.write_all(&outgoing_call_request(0x0010)).await.unwrap();
        dispatcher.poll_once().await.unwrap();

        let mut forwarded = vec![0u8; 168];
        server.read_exact(&mut forwarded).await.unwrap();
        assert_eq!(read_call_id(&forwarded, CALL_ID_OFFSET), Some(1));
    }

    #[tokio::test]
    async fn closed_caller_removes_link() {
        let (remote, remote_addr) = fake_remote().await;
        let (mut dispatcher, listen) = dispatcher(remote_addr, AclPolicy::default()).await;

        let client = TcpStream::connect(listen).await.unwrap();
        dispatcher.poll_once().await.unwrap();
        let (mut server, _) = remote.accept().await.unwrap();
        assert_eq!(dispatcher.registry.count().await, 1);

        drop(client);
        dispatcher.poll_once().await.unwrap();
        assert_eq!(dispatcher.registry.count().await, 0);

        // The callee connection is closed with the link.
        let mut buf = [0u8; 1];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn denied_caller_is_not_linked() {
        let (_remote, remote_addr) = fake_remote().await;
        let policy = AclPolicy {
            subnets: vec!["10.0.0.0/8".into()],
            commands: Vec::new(),
        };
        let (mut dispatcher, listen) = dispatcher(remote_addr, policy).await;

        let mut client = TcpStream::connect(listen).await.unwrap();
        dispatcher.poll_once().await.unwrap();
        assert_eq!(dispatcher.registry.count().await, 0);

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unreachable_remote_is_not_linked() {
        let (remote, remote_addr) = fake_remote().await;
        drop(remote);
        let (mut dispatcher, listen) = dispatcher(remote_addr, AclPolicy::default()).await;

        let _client = TcpStream::connect(listen).await.unwrap();
        dispatcher.poll_once().await.unwrap();
        assert_eq!(dispatcher.registry.count().await, 0);
    }
}
