use crate::core::frame::{CloseStatus, Frame};
use crate::error::Result;
use std::net::SocketAddr;

/// Transport the session writes frames to
///
/// A connection belongs to exactly one session. The embedding transport
/// feeds inbound frames by calling `Session::receive_frame` and reports I/O
/// failures through `Session::transport_failed`; this trait covers the
/// opposite direction.
///
/// Writes for one session are already serialized by the session's write
/// lock, so implementations never see two concurrent `write_frame` calls
/// from the same session.
pub trait Connection: Send + Sync + 'static {
    /// Write one frame to the peer
    fn write_frame(&self, frame: Frame) -> Result<()>;

    /// Tear down the transport once the session has decided to terminate
    ///
    /// Called exactly once, after the close handshake completed or the
    /// session was closed abnormally.
    fn disconnect(&self, status: &CloseStatus);

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}
