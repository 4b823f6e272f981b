//! A proxied PPTP control connection between a caller and a callee.
//!
//! The call ids and wrap flags are filled in by the control rewriter as
//! messages go by and read concurrently by the GRE task, so they live in
//! atomics. The two control channels are owned by the link and closed when
//! the last reference to it is dropped.

mod channel;

pub use channel::ControlChannel;

use crate::pairs::ListenerPair;
use pptp_core::{CallId, ProxyError, ProxyResult, Side, UNSET_CALL_ID};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// How long to wait for the remote PPTP server to accept a connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-side call state.
#[derive(Debug)]
struct Endpoint {
    addr: Ipv4Addr,
    channel: ControlChannel,
    real_id: AtomicU32,
    fake_id: AtomicU32,
    can_wrap: AtomicBool,
}

impl Endpoint {
    fn new(addr: Ipv4Addr, stream: TcpStream) -> Self {
        Self {
            addr,
            channel: ControlChannel::new(stream),
            real_id: AtomicU32::new(UNSET_CALL_ID),
            fake_id: AtomicU32::new(UNSET_CALL_ID),
            can_wrap: AtomicBool::new(false),
        }
    }
}

/// Snapshot of a link's four call ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallIds {
    pub real_caller: CallId,
    pub fake_caller: CallId,
    pub real_callee: CallId,
    pub fake_callee: CallId,
}

#[derive(Debug)]
pub struct Link {
    caller: Endpoint,
    callee: Endpoint,
    /// Local address the caller connected to; source of raw GRE sent back
    /// toward the caller.
    caller_return_addr: Ipv4Addr,
    /// Remote server as configured, for log lines.
    remote_name: String,
}

impl Link {
    pub fn new(
        caller: TcpStream,
        caller_addr: Ipv4Addr,
        caller_return_addr: Ipv4Addr,
        callee: TcpStream,
        callee_addr: Ipv4Addr,
        remote_name: impl Into<String>,
    ) -> Self {
        Self {
            caller: Endpoint::new(caller_addr, caller),
            callee: Endpoint::new(callee_addr, callee),
            caller_return_addr,
            remote_name: remote_name.into(),
        }
    }

    /// Connect an accepted caller to the pair's remote server.
    pub async fn establish(
        caller: TcpStream,
        caller_addr: Ipv4Addr,
        pair: &ListenerPair,
    ) -> ProxyResult<Self> {
        let caller_return_addr = match caller.local_addr()? {
            SocketAddr::V4(addr) => *addr.ip(),
            SocketAddr::V6(addr) => {
                return Err(ProxyError::Other(format!("unexpected IPv6 local address {addr}")))
            }
        };
        debug!(caller = %caller_addr, local = %caller_return_addr, remote = %pair.remote_name,
            "connecting to peer");

        let callee = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(pair.remote_addr))
            .await
            .map_err(|_| {
                ProxyError::Other(format!("timed out connecting to server {}", pair.remote_name))
            })??;

        info!(
            caller = %caller_addr,
            remote = %pair.remote_name,
            interface = %pair.listen_name,
            "new proxy connection"
        );

        Ok(Self::new(
            caller,
            caller_addr,
            caller_return_addr,
            callee,
            *pair.remote_addr.ip(),
            pair.remote_name.clone(),
        ))
    }

    fn endpoint(&self, side: Side) -> &Endpoint {
        match side {
            Side::Caller => &self.caller,
            Side::Callee => &self.callee,
        }
    }

    pub fn channel(&self, side: Side) -> &ControlChannel {
        &self.endpoint(side).channel
    }

    pub fn address(&self, side: Side) -> Ipv4Addr {
        self.endpoint(side).addr
    }

    pub fn caller_return_addr(&self) -> Ipv4Addr {
        self.caller_return_addr
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn real_id(&self, side: Side) -> CallId {
        self.endpoint(side).real_id.load(Ordering::Acquire)
    }

    pub fn fake_id(&self, side: Side) -> CallId {
        self.endpoint(side).fake_id.load(Ordering::Acquire)
    }

    /// Record the id `side` announced and the fake id standing in for it.
    pub fn set_call_ids(&self, side: Side, real: CallId, fake: CallId) {
        let endpoint = self.endpoint(side);
        endpoint.real_id.store(real, Ordering::Release);
        endpoint.fake_id.store(fake, Ordering::Release);
    }

    pub fn can_wrap(&self, side: Side) -> bool {
        self.endpoint(side).can_wrap.load(Ordering::Acquire)
    }

    pub fn set_can_wrap(&self, side: Side) {
        self.endpoint(side).can_wrap.store(true, Ordering::Release);
    }

    pub fn call_ids(&self) -> CallIds {
        CallIds {
            real_caller: self.real_id(Side::Caller),
            fake_caller: self.fake_id(Side::Caller),
            real_callee: self.real_id(Side::Callee),
            fake_callee: self.fake_id(Side::Callee),
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        info!(caller = %self.caller.addr, remote = %self.remote_name, "end proxy connection");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// A connected loopback pair: (relay end, endpoint end).
    pub async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, connected.unwrap())
    }

    /// A link plus the endpoint ends of its two control connections.
    pub struct TestLink {
        pub link: Arc<Link>,
        pub caller_end: TcpStream,
        pub callee_end: TcpStream,
    }

    pub async fn test_link(caller_addr: Ipv4Addr, callee_addr: Ipv4Addr) -> TestLink {
        let (caller, caller_end) = socket_pair().await;
        let (callee, callee_end) = socket_pair().await;
        let link = Link::new(
            caller,
            caller_addr,
            Ipv4Addr::new(192, 0, 2, 1),
            callee,
            callee_addr,
            "test-remote",
        );
        TestLink {
            link: Arc::new(link),
            caller_end,
            callee_end,
        }
    }
}
