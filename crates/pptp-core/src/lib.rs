//! pptp-core: protocol library for the PPTP relay.
//!
//! Provides the control-message and GRE wire layout, PPTP-IN-TCP framing,
//! the fake call-id allocator, and the shared error type. Performs no I/O.

pub mod codec;
pub mod error;
pub mod hexdump;
pub mod ids;
pub mod wire;

// Re-export commonly used items at crate root.
pub use codec::{unwrap_frames, wrap_gre_unit, WRAP_HEADER_LEN};
pub use error::{ProxyError, ProxyResult};
pub use hexdump::hex_dump;
pub use ids::{CallId, IdAllocator, Side, UNSET_CALL_ID};
pub use wire::{classify, ControlType, FrameKind};
