//! The transport seam. The engine owns no sockets: the host supplies an
//! implementation of [`Transport`] and forwards its connection and stream
//! events into the pool. Callbacks may arrive on any thread.

use std::num::NonZeroU64;

/// Opaque handle to a live transport connection. Zero is reserved for
/// "no connection", which is why the inner value is non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(NonZeroU64);

impl ConnectionHandle {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(ConnectionHandle)
    }

    pub fn raw(self) -> u64 {
        self.0.get()
    }
}

/// Connection-level events the host forwards from its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection is up and streams may flow.
    Connected(ConnectionHandle),
    /// Local shutdown finished; the handle is dead.
    ShutdownComplete,
    /// The peer closed the connection.
    ShutdownByPeer,
    /// The transport gave up on the connection (timeout, path failure).
    ShutdownByTransport,
}

/// Stream-level events the host forwards for a single receive or send slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent<'a> {
    /// The transport finished sending the slot's payload.
    SendComplete,
    /// A fragment of incoming stream data.
    Receive(&'a [u8]),
    /// The peer aborted its send; drop whatever accumulated.
    PeerSendAborted,
    /// The peer finished sending; the accumulated payload is complete.
    PeerSendShutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to create connection")]
    ConnectionCreate,
    #[error("failed to start connection")]
    ConnectionStart,
    #[error("failed to create stream")]
    StreamCreate,
    #[error("failed to start stream")]
    StreamStart,
    #[error("failed to send on stream")]
    StreamSend,
}

/// What the engine asks of the host's transport. Implementations must be
/// callable from multiple threads; the engine never assumes an event loop.
pub trait Transport: Send + Sync {
    /// Open a connection to `address:port`. The sink is where this
    /// connection's events go from now on; completion is signalled later
    /// through [`ConnectionEvent::Connected`].
    fn connect(
        &self,
        address: &str,
        port: u16,
        events: crate::pool::EventSink,
    ) -> Result<ConnectionHandle, TransportError>;

    /// Send a payload on a fresh unidirectional stream. The token ties the
    /// eventual `SendComplete` back to the pool slot holding the payload.
    fn send(
        &self,
        handle: ConnectionHandle,
        token: crate::pool::SlotToken,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Begin connection shutdown. Completion is signalled through
    /// [`ConnectionEvent::ShutdownComplete`].
    fn shutdown(&self, handle: ConnectionHandle);
}
