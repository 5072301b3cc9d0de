//! Concurrent message-buffer pool bridging transport callbacks to the
//! synchronous poll API.
//!
//! Each connection owns a fixed bank of receive and send slots. A slot is
//! one atomic tri-state (FREE, IN_USE, COMPLETE) plus a buffer; state moves
//! only by compare-and-swap, so a transport callback thread and the client
//! thread never hand a slot to each other twice. Buffers grow as needed and
//! keep their capacity when cleared.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use tracing::warn;

use crate::transport::{ConnectionEvent, ConnectionHandle, StreamEvent};

/// Slots per direction per connection.
pub const SLOT_COUNT: usize = 32;

const FREE: u8 = 0;
const IN_USE: u8 = 1;
const COMPLETE: u8 = 2;

/// Ticket for one slot, handed to the transport so its stream events find
/// their way back. Only the pool can mint one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotToken {
    dir: Dir,
    index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Recv,
    Send,
}

struct Slot {
    state: AtomicU8,
    buf: Mutex<Vec<u8>>,
}

impl Slot {
    fn new() -> Self {
        Slot {
            state: AtomicU8::new(FREE),
            buf: Mutex::new(Vec::new()),
        }
    }

    fn try_claim(&self, from: u8) -> bool {
        self.state
            .compare_exchange(from, IN_USE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Slot bank and connection handle for a single server link.
pub struct Link {
    // 0 means not connected; ConnectionHandle is non-zero by construction.
    handle: AtomicU64,
    recv: [Slot; SLOT_COUNT],
    send: [Slot; SLOT_COUNT],
}

impl Link {
    pub fn new() -> Self {
        Link {
            handle: AtomicU64::new(0),
            recv: std::array::from_fn(|_| Slot::new()),
            send: std::array::from_fn(|_| Slot::new()),
        }
    }

    /// The live connection handle, if any.
    pub fn connection_handle(&self) -> Option<ConnectionHandle> {
        ConnectionHandle::new(self.handle.load(Ordering::Acquire))
    }

    /// Apply a connection-level event. On connect the handle is published
    /// and every send slot is marked COMPLETE, making the whole send bank
    /// claimable; any shutdown clears the handle.
    pub fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected(handle) => {
                for slot in &self.send {
                    slot.state.store(COMPLETE, Ordering::Release);
                }
                self.handle.store(handle.raw(), Ordering::Release);
            }
            ConnectionEvent::ShutdownComplete
            | ConnectionEvent::ShutdownByPeer
            | ConnectionEvent::ShutdownByTransport => {
                self.handle.store(0, Ordering::Release);
            }
        }
    }

    /// Claim a receive slot for a peer-initiated stream. `None` means the
    /// bank is exhausted and the caller must abort the stream.
    pub fn reserve_recv_slot(&self) -> Option<SlotToken> {
        for (index, slot) in self.recv.iter().enumerate() {
            if slot.try_claim(FREE) {
                match slot.buf.lock() {
                    Ok(mut buf) => buf.clear(),
                    Err(poisoned) => poisoned.into_inner().clear(),
                }
                return Some(SlotToken {
                    dir: Dir::Recv,
                    index,
                });
            }
        }
        warn!("receive slots exhausted, peer stream will be aborted");
        None
    }

    /// Apply a stream event to the slot the token names.
    pub fn handle_stream_event(&self, token: SlotToken, event: StreamEvent<'_>) {
        match (token.dir, event) {
            (Dir::Recv, StreamEvent::Receive(data)) => {
                self.with_buf(token, |buf| buf.extend_from_slice(data));
            }
            (Dir::Recv, StreamEvent::PeerSendShutdown) => {
                self.recv[token.index].state.store(COMPLETE, Ordering::Release);
            }
            (Dir::Recv, StreamEvent::PeerSendAborted) => {
                self.with_buf(token, Vec::clear);
                self.recv[token.index].state.store(FREE, Ordering::Release);
            }
            (Dir::Send, StreamEvent::SendComplete) => {
                self.with_buf(token, Vec::clear);
                self.send[token.index].state.store(FREE, Ordering::Release);
            }
            (dir, event) => {
                warn!(?dir, ?event, "stream event does not apply to this slot");
            }
        }
    }

    /// Claim a send slot. FREE and COMPLETE slots are both claimable; an
    /// IN_USE slot is still travelling through the transport. `None` is
    /// send-queue-full backpressure.
    pub fn acquire_send_slot(&self) -> Option<SlotToken> {
        for (index, slot) in self.send.iter().enumerate() {
            if slot.try_claim(FREE) || slot.try_claim(COMPLETE) {
                return Some(SlotToken {
                    dir: Dir::Send,
                    index,
                });
            }
        }
        None
    }

    /// Stage the payload a claimed send slot will carry until SendComplete.
    pub fn fill_send(&self, token: SlotToken, payload: &[u8]) {
        debug_assert_eq!(token.dir, Dir::Send);
        self.with_buf(token, |buf| {
            buf.clear();
            buf.extend_from_slice(payload);
        });
    }

    /// Return a claimed send slot without sending (e.g. the transport
    /// refused the payload).
    pub fn release_send_slot(&self, token: SlotToken) {
        debug_assert_eq!(token.dir, Dir::Send);
        self.with_buf(token, Vec::clear);
        self.send[token.index].state.store(FREE, Ordering::Release);
    }

    /// Take the next completed receive payload, if any. The payload is
    /// copied out and the slot returns to FREE with its capacity intact.
    pub fn poll_complete(&self) -> Option<Vec<u8>> {
        for slot in &self.recv {
            if slot.try_claim(COMPLETE) {
                let out = match slot.buf.lock() {
                    Ok(mut buf) => {
                        let out = buf.to_vec();
                        buf.clear();
                        out
                    }
                    Err(poisoned) => {
                        let mut buf = poisoned.into_inner();
                        let out = buf.to_vec();
                        buf.clear();
                        out
                    }
                };
                slot.state.store(FREE, Ordering::Release);
                return Some(out);
            }
        }
        None
    }

    fn with_buf(&self, token: SlotToken, f: impl FnOnce(&mut Vec<u8>)) {
        let slot = match token.dir {
            Dir::Recv => &self.recv[token.index],
            Dir::Send => &self.send[token.index],
        };
        match slot.buf.lock() {
            Ok(mut buf) => f(&mut buf),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl Default for Link {
    fn default() -> Self {
        Link::new()
    }
}

/// Cloneable handle the transport uses to feed events back into a link.
/// This is what the host's callback threads hold; the owning session keeps
/// the server object itself.
#[derive(Clone)]
pub struct EventSink {
    link: std::sync::Arc<Link>,
}

impl EventSink {
    pub(crate) fn new(link: std::sync::Arc<Link>) -> Self {
        EventSink { link }
    }

    pub fn connection_event(&self, event: ConnectionEvent) {
        self.link.handle_connection_event(event);
    }

    /// Claim a receive slot for a peer-initiated stream. On `None` the
    /// transport must abort the stream.
    pub fn peer_stream_started(&self) -> Option<SlotToken> {
        self.link.reserve_recv_slot()
    }

    pub fn stream_event(&self, token: SlotToken, event: StreamEvent<'_>) {
        self.link.handle_stream_event(token, event);
    }
}
