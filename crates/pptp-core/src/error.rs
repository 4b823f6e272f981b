use std::net::Ipv4Addr;
use thiserror::Error;

use crate::ids::CallId;

/// Errors produced by the relay.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("config error: {0}")]
    Config(String),

    #[error("cannot resolve {0}")]
    Resolve(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("unknown peer {source_addr} for call id 0x{call_id:X}")]
    UnknownPeer {
        source_addr: Ipv4Addr,
        call_id: CallId,
    },

    #[error("no counterpart for call id 0x{0:X}")]
    UnmappedCallId(CallId),

    #[error("{0} call id space exhausted")]
    IdSpaceExhausted(&'static str),

    #[error("access denied for {0}")]
    AccessDenied(Ipv4Addr),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
