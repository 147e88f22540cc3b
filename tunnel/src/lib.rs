//! Multiplexed reverse tunnel shared by Host and Runner.
//!
//! - [`protocol`] — the 8-byte framed wire format (spec.md §4.A).
//! - [`relay`] — the Runner-side tunnel server that relays frames between a
//!   container's registration connection and the Host's attachment (§4.A/J).
//! - [`proxy`] — the Host-side local listener that mints client ids and
//!   dials into a container's tunnel (§4.A/L).

pub mod protocol;
pub mod proxy;
pub mod relay;

pub use protocol::{ClientId, Frame, MessageType, Protocol};
pub use proxy::{ProxyError, SessionRegistry, TunnelSession};
pub use relay::Relay;
