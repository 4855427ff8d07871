//! Network subsystem: endpoint URLs, the connection seam, and sessions

pub mod endpoint;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use endpoint::SessionIdentity;
pub use session::{SessionEvent, SessionNotice, SessionTimeouts, TransportSession};
pub use transport::{Connector, Frame, FrameStream, WsConnector};
