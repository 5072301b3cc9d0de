//! Client sessions: contexts, per-server links and the two-hop connection.
//!
//! A [`Context`] fixes the client's role and bounds how many server links
//! it may hold. A [`Server`] is one link: connect/disconnect, the
//! encrypt-and-send path and the poll-decrypt-decode receive path. A
//! [`Connection`] drives the whole client flow: authenticate against the
//! connection server, follow the redirect, authenticate against the
//! communication server, then exchange messages on the channel.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::auth::{AuthError, AuthEvent, Credentials, HopAuth};
use crate::chunk::{self, Assembler, ChunkError};
use crate::crypto::{self, CryptoError, Key};
use crate::error::{Error, ParamError};
use crate::pool::{EventSink, Link};
use crate::protocol::{Actor, NetMessage, CHANNEL_LEN, MESSAGE_BUFFER_LEN};
use crate::transport::{Transport, TransportError};
use crate::wire::{self, DecodeError, EncodeError};

/// Channels a connection may hold open at once.
pub const CHANNEL_COUNT: usize = 4;

/// Heartbeat interval assumed until the server dictates one.
pub const DEFAULT_HEARTBEAT_S: u32 = 60;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SendError {
    #[error("not connected")]
    Disconnected,
    #[error("send queue is full")]
    QueueFull,
    #[error("no message key for an encrypted kind")]
    NoKey,
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecvError {
    #[error("no message key for an encrypted kind")]
    NoKey,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

fn noted<T>(res: Result<T, Error>) -> Result<T, Error> {
    if let Err(err) = &res {
        crate::error::set_last(err);
    }
    res
}

/// Client context: role, a bound on concurrent server links and the
/// default timeout for blocking waits.
#[derive(Debug, Clone)]
pub struct Context {
    actor: Actor,
    max_servers: usize,
    timeout: Duration,
    live: Arc<AtomicUsize>,
}

impl Context {
    pub fn new(actor: Actor, max_servers: usize, timeout: Duration) -> Result<Self, ParamError> {
        if !actor.is_client() {
            return Err(ParamError::ServerActor);
        }
        if max_servers == 0 {
            return Err(ParamError::ZeroCapacity);
        }
        Ok(Context {
            actor,
            max_servers,
            timeout,
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn actor(&self) -> Actor {
        self.actor
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// Open a new server link, counting against the context bound. The
    /// slot is returned when the server is dropped.
    pub fn open_server(&self, transport: Arc<dyn Transport>) -> Result<Server, ParamError> {
        let claimed = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_servers).then_some(n + 1)
            });
        if claimed.is_err() {
            return Err(ParamError::ServerLimit);
        }
        Ok(Server {
            link: Arc::new(Link::new()),
            transport,
            key: None,
            assembler: Assembler::new(),
            next_chunk_id: 0,
            live: Arc::clone(&self.live),
        })
    }
}

/// One server link: the slot bank, the transport it sends through and the
/// message key once the hop is authenticated.
pub struct Server {
    link: Arc<Link>,
    transport: Arc<dyn Transport>,
    key: Option<Key>,
    assembler: Assembler,
    next_chunk_id: u32,
    live: Arc<AtomicUsize>,
}

impl Server {
    /// Sink for the host's transport callbacks on this link.
    pub fn events(&self) -> EventSink {
        EventSink::new(Arc::clone(&self.link))
    }

    pub fn is_connected(&self) -> bool {
        self.link.connection_handle().is_some()
    }

    pub fn set_key(&mut self, key: Key) {
        self.key = Some(key);
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Start connecting. With `wait` the call polls until the transport
    /// reports the connection up or the timeout elapses.
    pub fn connect(
        &mut self,
        address: &str,
        port: u16,
        wait: Option<Duration>,
    ) -> Result<(), Error> {
        noted(self.connect_inner(address, port, wait))
    }

    fn connect_inner(
        &mut self,
        address: &str,
        port: u16,
        wait: Option<Duration>,
    ) -> Result<(), Error> {
        if address.is_empty() {
            return Err(ParamError::EmptyAddress.into());
        }
        if port == 0 {
            return Err(ParamError::InvalidPort.into());
        }
        if self.is_connected() {
            return Ok(());
        }
        self.transport.connect(address, port, self.events())?;
        if let Some(timeout) = wait {
            wait_for(timeout, || self.is_connected())?;
        }
        Ok(())
    }

    /// Start disconnecting and forget the hop's key and partial transfers.
    /// With `wait` the call polls until shutdown completes.
    pub fn disconnect(&mut self, wait: Option<Duration>) -> Result<(), Error> {
        noted(self.disconnect_inner(wait))
    }

    fn disconnect_inner(&mut self, wait: Option<Duration>) -> Result<(), Error> {
        self.key = None;
        self.assembler.clear();
        let handle = match self.link.connection_handle() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        self.transport.shutdown(handle);
        if let Some(timeout) = wait {
            wait_for(timeout, || !self.is_connected())?;
        }
        Ok(())
    }

    /// Encode, seal if the kind calls for it, and hand the buffer to the
    /// transport. Buffers over the wire maximum go out as chunk parts.
    pub fn send(&mut self, msg: &NetMessage) -> Result<(), SendError> {
        let buf = self.encode_sealed(msg)?;
        if buf.len() <= MESSAGE_BUFFER_LEN {
            return self.send_raw(&buf);
        }
        let id = self.next_chunk_id;
        self.next_chunk_id = self.next_chunk_id.wrapping_add(1);
        debug!(id, len = buf.len(), "splitting oversized message");
        for part in chunk::split(id, &buf) {
            self.send_raw(&wire::encode(&part)?)?;
        }
        Ok(())
    }

    fn encode_sealed(&self, msg: &NetMessage) -> Result<Vec<u8>, SendError> {
        let buf = wire::encode(msg)?;
        if !msg.kind().is_encrypted() {
            return Ok(buf);
        }
        let key = self.key.as_ref().ok_or(SendError::NoKey)?;
        // The kind tag stays plaintext for dispatch; only the payload
        // behind it is sealed.
        let mut out = Vec::with_capacity(1 + crypto::SEAL_OVERHEAD + buf.len());
        out.push(buf[0]);
        out.extend_from_slice(&crypto::seal(key, &buf[1..])?);
        Ok(out)
    }

    fn send_raw(&self, payload: &[u8]) -> Result<(), SendError> {
        let handle = self
            .link
            .connection_handle()
            .ok_or(SendError::Disconnected)?;
        let token = self.link.acquire_send_slot().ok_or(SendError::QueueFull)?;
        self.link.fill_send(token, payload);
        if let Err(err) = self.transport.send(handle, token, payload) {
            self.link.release_send_slot(token);
            return Err(err.into());
        }
        Ok(())
    }

    /// Take the next completed message, if any. Chunk parts are absorbed
    /// into the assembler and surface as the whole message once complete.
    pub fn receive(&mut self) -> Result<Option<NetMessage>, RecvError> {
        while let Some(buf) = self.link.poll_complete() {
            if buf.is_empty() {
                warn!("dropping empty stream payload");
                continue;
            }
            if let Some(msg) = self.process(buf)? {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    // Iterative on purpose: a reassembled payload may itself be a chunk
    // message, and recursion would hand the peer our stack depth.
    fn process(&mut self, mut buf: Vec<u8>) -> Result<Option<NetMessage>, RecvError> {
        loop {
            if buf.is_empty() {
                return Err(RecvError::Decode(DecodeError::UnexpectedEnd));
            }
            let plain = self.open_sealed(&buf)?;
            match wire::decode(&plain)? {
                NetMessage::Chunk {
                    kind,
                    id,
                    part,
                    data,
                } => match self.assembler.ingest(kind, id, part, data)? {
                    Some(whole) => buf = whole,
                    None => return Ok(None),
                },
                msg => return Ok(Some(msg)),
            }
        }
    }

    fn open_sealed(&self, buf: &[u8]) -> Result<Vec<u8>, RecvError> {
        let encrypted = crate::protocol::MessageKind::from_u8(buf[0])
            .map(|k| k.is_encrypted())
            .unwrap_or(false);
        if !encrypted {
            return Ok(buf.to_vec());
        }
        let key = self.key.as_ref().ok_or(RecvError::NoKey)?;
        let plain = crypto::open(key, &buf[1..])?;
        let mut out = Vec::with_capacity(1 + plain.len());
        out.push(buf[0]);
        out.extend_from_slice(&plain);
        Ok(out)
    }

    /// Poll for the next message until `timeout` elapses.
    pub fn receive_wait(&mut self, timeout: Duration) -> Result<NetMessage, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(msg) = self.receive()? {
                return Ok(msg);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl std::fmt::Debug for Server {
    // Manual impl: the transport is a trait object.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("connected", &self.is_connected())
            .field("has_key", &self.key.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(handle) = self.link.connection_handle() {
            self.transport.shutdown(handle);
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> Result<(), Error> {
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Location fix cached per connection and sent as a Location message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationFix {
    pub latitude: f32,
    pub longitude: f32,
    pub elevation: f32,
    pub facing: f32,
    pub timestamp: u64,
}

/// The client's view of one account connection: the connection-server hop
/// plus up to [`CHANNEL_COUNT`] authenticated channels.
pub struct Connection {
    context: Context,
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    connection_server: Server,
    channels: HashMap<String, Server>,
    // Application messages drained from a channel but not yet handed out.
    inbox: HashMap<String, VecDeque<NetMessage>>,
    heartbeat_interval: u32,
    last_heartbeat_sent: Instant,
    last_location: Option<LocationFix>,
}

impl Connection {
    pub fn new(
        context: &Context,
        transport: Arc<dyn Transport>,
        credentials: Credentials,
    ) -> Result<Self, ParamError> {
        let connection_server = context.open_server(Arc::clone(&transport))?;
        Ok(Connection {
            context: context.clone(),
            transport,
            credentials,
            connection_server,
            channels: HashMap::new(),
            inbox: HashMap::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_S,
            last_heartbeat_sent: Instant::now(),
            last_location: None,
        })
    }

    pub fn connection_server(&self) -> &Server {
        &self.connection_server
    }

    pub fn channel(&self, name: &str) -> Option<&Server> {
        self.channels.get(name)
    }

    pub fn is_authenticated(&self, channel: &str) -> bool {
        self.channels
            .get(channel)
            .map(|s| s.is_connected() && s.has_key())
            .unwrap_or(false)
    }

    /// Run the whole handshake for one channel: connect and authenticate
    /// against the connection server, follow its redirect, authenticate
    /// against the communication server and keep the derived key. Blocking
    /// waits use the context's default timeout. Any failure tears down
    /// every server this connection holds.
    pub fn authenticate(&mut self, address: &str, port: u16, channel: &str) -> Result<(), Error> {
        noted(self.authenticate_inner(address, port, channel))
    }

    fn authenticate_inner(&mut self, address: &str, port: u16, channel: &str) -> Result<(), Error> {
        let timeout = self.context.timeout;
        if channel.is_empty() {
            return Err(ParamError::EmptyChannel.into());
        }
        if channel.len() > CHANNEL_LEN {
            return Err(ParamError::ChannelTooLong.into());
        }
        if !self.channels.contains_key(channel) && self.channels.len() >= CHANNEL_COUNT {
            return Err(ParamError::ChannelLimit.into());
        }
        let result = self.run_handshake(address, port, channel, timeout);
        if result.is_err() {
            // One failed hop invalidates the whole handshake.
            self.disconnect_all(Some(timeout));
        }
        result
    }

    fn run_handshake(
        &mut self,
        address: &str,
        port: u16,
        channel: &str,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.connection_server.connect(address, port, Some(timeout))?;

        let mut hop = HopAuth::new(
            self.credentials.clone(),
            self.context.actor(),
            Some(channel.to_string()),
        );
        self.connection_server.send(&hop.begin())?;
        let (redirect_address, redirect_port) = loop {
            let msg = self.connection_server.receive_wait(timeout)?;
            match hop.handle(&msg)? {
                AuthEvent::Send(reply) => self.connection_server.send(&reply)?,
                AuthEvent::Redirect { address, port } => break (address, port),
                AuthEvent::Authenticated(_) => {
                    return Err(AuthError::UnexpectedMessage(msg.kind()).into())
                }
            }
        };
        let redirect_port =
            u16::try_from(redirect_port).map_err(|_| ParamError::InvalidPort)?;
        debug!(
            address = %redirect_address,
            port = redirect_port,
            channel,
            "redirected to communication server"
        );

        let mut server = self.context.open_server(Arc::clone(&self.transport))?;
        server.connect(&redirect_address, redirect_port, Some(timeout))?;
        let mut hop = HopAuth::new(self.credentials.clone(), self.context.actor(), None);
        server.send(&hop.begin())?;
        loop {
            let msg = server.receive_wait(timeout)?;
            match hop.handle(&msg)? {
                AuthEvent::Send(reply) => server.send(&reply)?,
                AuthEvent::Authenticated(key) => {
                    server.set_key(key);
                    break;
                }
                AuthEvent::Redirect { .. } => {
                    return Err(AuthError::UnexpectedMessage(msg.kind()).into())
                }
            }
        }
        // Announce our presence on the channel.
        server.send(&NetMessage::Hello {
            actor: self.context.actor(),
        })?;
        self.channels.insert(channel.to_string(), server);
        Ok(())
    }

    /// Tear down every channel and the connection server link.
    pub fn disconnect_all(&mut self, wait: Option<Duration>) {
        self.inbox.clear();
        for (name, mut server) in self.channels.drain() {
            if server.disconnect(wait).is_err() {
                warn!(channel = %name, "channel shutdown timed out");
            }
        }
        if self.connection_server.disconnect(wait).is_err() {
            warn!("connection server shutdown timed out");
        }
    }

    fn channel_mut(&mut self, channel: &str) -> Result<&mut Server, Error> {
        self.channels
            .get_mut(channel)
            .ok_or_else(|| ParamError::UnknownChannel.into())
    }

    pub fn send(&mut self, channel: &str, msg: &NetMessage) -> Result<(), Error> {
        noted(
            self.channel_mut(channel)
                .and_then(|server| server.send(msg).map_err(Error::from)),
        )
    }

    pub fn send_text(&mut self, channel: &str, body: &str) -> Result<(), Error> {
        let msg = NetMessage::Text {
            timestamp: unix_now(),
            body: body.to_string(),
        };
        self.send(channel, &msg)
    }

    pub fn send_location(&mut self, channel: &str, fix: LocationFix) -> Result<(), Error> {
        self.last_location = Some(fix);
        let msg = NetMessage::Location {
            latitude: fix.latitude,
            longitude: fix.longitude,
            elevation: fix.elevation,
            facing: fix.facing,
            timestamp: fix.timestamp,
        };
        self.send(channel, &msg)
    }

    /// Take the next message from a channel. Every completed buffer is
    /// drained first so heartbeats take effect no matter where they sit in
    /// the queue; heartbeats adjust the interval and re-arm the deadline,
    /// incoming location fixes update the cache and surface to the caller.
    pub fn receive(&mut self, channel: &str) -> Result<Option<NetMessage>, Error> {
        noted(self.receive_inner(channel))
    }

    fn receive_inner(&mut self, channel: &str) -> Result<Option<NetMessage>, Error> {
        if let Some(msg) = self.inbox.get_mut(channel).and_then(VecDeque::pop_front) {
            return Ok(Some(msg));
        }
        while let Some(msg) = self.channel_mut(channel)?.receive()? {
            match msg {
                NetMessage::Heartbeat { seconds } => {
                    self.heartbeat_interval = seconds;
                    // A dictated interval re-arms the deadline.
                    self.last_heartbeat_sent = Instant::now();
                }
                other => {
                    if let NetMessage::Location {
                        latitude,
                        longitude,
                        elevation,
                        facing,
                        timestamp,
                    } = &other
                    {
                        self.last_location = Some(LocationFix {
                            latitude: *latitude,
                            longitude: *longitude,
                            elevation: *elevation,
                            facing: *facing,
                            timestamp: *timestamp,
                        });
                    }
                    self.inbox
                        .entry(channel.to_string())
                        .or_default()
                        .push_back(other);
                }
            }
        }
        Ok(self.inbox.get_mut(channel).and_then(VecDeque::pop_front))
    }

    /// Seconds left before the next heartbeat is due.
    pub fn seconds_until_heartbeat(&self) -> u64 {
        u64::from(self.heartbeat_interval)
            .saturating_sub(self.last_heartbeat_sent.elapsed().as_secs())
    }

    /// Send a heartbeat on every channel and reset the deadline.
    pub fn send_heartbeat(&mut self) -> Result<(), Error> {
        let msg = NetMessage::Heartbeat {
            seconds: self.heartbeat_interval,
        };
        let result = (|| {
            for server in self.channels.values_mut() {
                server.send(&msg)?;
            }
            Ok(())
        })()
        .map_err(Error::Send);
        if result.is_ok() {
            self.last_heartbeat_sent = Instant::now();
        }
        noted(result)
    }

    pub fn last_location(&self) -> Option<LocationFix> {
        self.last_location
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect_all(None);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageKind, ProtocolError, SALT_LEN, TEXT_LEN};
    use crate::transport::{ConnectionEvent, ConnectionHandle, StreamEvent};
    use std::sync::Mutex;

    const PASSWORD: &str = "P1";
    const SALT: [u8; SALT_LEN] = [7; SALT_LEN];
    const CONN_ADDR: &str = "10.0.0.1";
    const COMM_ADDR: &str = "10.0.0.2";
    const TIMEOUT: Duration = Duration::from_secs(2);

    fn creds(password: &str) -> Credentials {
        Credentials {
            mail: "user@example.org".into(),
            password: password.into(),
            device_key: "D1".into(),
        }
    }

    // Scripted two-server backend behind the Transport trait. Everything
    // happens synchronously inside send(), so tests never actually wait.
    struct MockBackend {
        inner: Mutex<MockInner>,
    }

    #[derive(Default)]
    struct MockInner {
        next_handle: u64,
        conns: HashMap<u64, MockConn>,
    }

    struct MockConn {
        sink: EventSink,
        is_connection_server: bool,
        nonce: u32,
        key: Option<Key>,
    }

    impl MockBackend {
        fn new() -> Arc<Self> {
            Arc::new(MockBackend {
                inner: Mutex::new(MockInner::default()),
            })
        }

        fn deliver(sink: &EventSink, payload: &[u8]) {
            let token = sink.peer_stream_started().unwrap();
            sink.stream_event(token, StreamEvent::Receive(payload));
            sink.stream_event(token, StreamEvent::PeerSendShutdown);
        }

        fn respond(conn: &mut MockConn, payload: &[u8]) -> Vec<Vec<u8>> {
            let kind = MessageKind::from_u8(payload[0]).unwrap();
            let msg = if kind.is_encrypted() {
                let key = conn.key.as_ref().unwrap();
                let mut plain = vec![payload[0]];
                plain.extend_from_slice(&crypto::open(key, &payload[1..]).unwrap());
                wire::decode(&plain).unwrap()
            } else {
                wire::decode(payload).unwrap()
            };
            match msg {
                NetMessage::AuthRequest { .. } => {
                    conn.nonce = 0x00C0_FFEE;
                    vec![wire::encode(&NetMessage::AuthChallenge {
                        salt: SALT,
                        nonce: conn.nonce,
                        strength: 0,
                        version: crate::protocol::PROTOCOL_VERSION,
                    })
                    .unwrap()]
                }
                NetMessage::AuthProof { sealed_nonce, .. } => {
                    let key = crypto::derive_key(PASSWORD, &SALT, 0).unwrap();
                    let ok = crypto::open_nonce(&key, &sealed_nonce) == Ok(conn.nonce);
                    let error = if ok { 0 } else { ProtocolError::WrongAnswer.code() };
                    if ok {
                        conn.key = Some(key);
                    }
                    let mut replies =
                        vec![wire::encode(&NetMessage::AuthResult { error }).unwrap()];
                    if ok && !conn.is_connection_server {
                        // The communication server dictates its heartbeat.
                        replies.push(
                            wire::encode(&NetMessage::Heartbeat { seconds: 30 }).unwrap(),
                        );
                    }
                    replies
                }
                NetMessage::ChannelRequest { .. } => {
                    vec![wire::encode(&NetMessage::ChannelResponse {
                        address: COMM_ADDR.into(),
                        port: 9100,
                    })
                    .unwrap()]
                }
                NetMessage::Text { timestamp, body } => {
                    let key = conn.key.as_ref().unwrap();
                    let buf = wire::encode(&NetMessage::Text { timestamp, body }).unwrap();
                    let mut sealed = vec![buf[0]];
                    sealed.extend_from_slice(&crypto::seal(key, &buf[1..]).unwrap());
                    vec![sealed]
                }
                _ => Vec::new(),
            }
        }
    }

    impl Transport for MockBackend {
        fn connect(
            &self,
            address: &str,
            _port: u16,
            events: EventSink,
        ) -> Result<ConnectionHandle, TransportError> {
            let mut inner = self.inner.lock().unwrap();
            inner.next_handle += 1;
            let handle = ConnectionHandle::new(inner.next_handle).unwrap();
            events.connection_event(ConnectionEvent::Connected(handle));
            inner.conns.insert(
                handle.raw(),
                MockConn {
                    sink: events,
                    is_connection_server: address == CONN_ADDR,
                    nonce: 0,
                    key: None,
                },
            );
            Ok(handle)
        }

        fn send(
            &self,
            handle: ConnectionHandle,
            token: crate::pool::SlotToken,
            payload: &[u8],
        ) -> Result<(), TransportError> {
            let mut inner = self.inner.lock().unwrap();
            let conn = inner
                .conns
                .get_mut(&handle.raw())
                .ok_or(TransportError::StreamSend)?;
            conn.sink.stream_event(token, StreamEvent::SendComplete);
            let replies = Self::respond(conn, payload);
            for reply in replies {
                Self::deliver(&conn.sink, &reply);
            }
            Ok(())
        }

        fn shutdown(&self, handle: ConnectionHandle) {
            let mut inner = self.inner.lock().unwrap();
            if let Some(conn) = inner.conns.remove(&handle.raw()) {
                conn.sink
                    .connection_event(ConnectionEvent::ShutdownComplete);
            }
        }
    }

    // Records outgoing buffers and never answers; for send-path tests.
    struct CollectTransport {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl CollectTransport {
        fn new() -> Arc<Self> {
            Arc::new(CollectTransport {
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    impl Transport for CollectTransport {
        fn connect(
            &self,
            _address: &str,
            _port: u16,
            events: EventSink,
        ) -> Result<ConnectionHandle, TransportError> {
            let handle = ConnectionHandle::new(1).unwrap();
            events.connection_event(ConnectionEvent::Connected(handle));
            Ok(handle)
        }

        fn send(
            &self,
            _handle: ConnectionHandle,
            token: crate::pool::SlotToken,
            payload: &[u8],
        ) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(payload.to_vec());
            // Tests that need the sink deliver SendComplete themselves;
            // leaving slots IN_USE exercises backpressure paths too.
            let _ = token;
            Ok(())
        }

        fn shutdown(&self, _handle: ConnectionHandle) {}
    }

    #[test]
    fn context_rejects_server_actors() {
        assert_eq!(
            Context::new(Actor::ConnectionServer, 4, TIMEOUT).unwrap_err(),
            ParamError::ServerActor
        );
        assert_eq!(
            Context::new(Actor::App, 0, TIMEOUT).unwrap_err(),
            ParamError::ZeroCapacity
        );
    }

    #[test]
    fn context_bounds_live_servers() {
        let ctx = Context::new(Actor::App, 1, TIMEOUT).unwrap();
        let transport = CollectTransport::new();
        let first = ctx.open_server(transport.clone()).unwrap();
        assert_eq!(
            ctx.open_server(transport.clone()).unwrap_err(),
            ParamError::ServerLimit
        );
        drop(first);
        assert!(ctx.open_server(transport).is_ok());
    }

    // Context and Server must stay Debug so assertions can format them.
    #[test]
    fn handles_format_for_debugging() {
        let ctx = Context::new(Actor::App, 1, TIMEOUT).unwrap();
        let server = ctx.open_server(CollectTransport::new()).unwrap();
        assert!(format!("{ctx:?}").contains("App"));
        assert!(format!("{server:?}").contains("connected"));
    }

    #[test]
    fn authenticate_then_echo_text() {
        let ctx = Context::new(Actor::App, 4, TIMEOUT).unwrap();
        let backend = MockBackend::new();
        let mut conn = Connection::new(&ctx, backend, creds(PASSWORD)).unwrap();

        conn.authenticate(CONN_ADDR, 9000, "speech").unwrap();
        assert!(conn.is_authenticated("speech"));

        conn.send_text("speech", "hi").unwrap();
        let mut got = None;
        for _ in 0..10 {
            if let Some(msg) = conn.receive("speech").unwrap() {
                got = Some(msg);
                break;
            }
        }
        match got {
            Some(NetMessage::Text { body, .. }) => assert_eq!(body, "hi"),
            other => panic!("unexpected {other:?}"),
        }

        // The mock's post-auth heartbeat was absorbed on the way, even
        // though the echo sat ahead of it in the completed queue.
        assert!(conn.seconds_until_heartbeat() <= 30);
        conn.send_heartbeat().unwrap();
    }

    #[test]
    fn dictated_heartbeat_rearms_deadline() {
        let ctx = Context::new(Actor::App, 4, TIMEOUT).unwrap();
        let backend = MockBackend::new();
        let mut conn = Connection::new(&ctx, backend, creds(PASSWORD)).unwrap();
        conn.authenticate(CONN_ADDR, 9000, "speech").unwrap();

        // The server dictated 30s during the handshake; one receive pass
        // absorbs it and restarts the countdown from the new interval.
        assert!(conn.receive("speech").unwrap().is_none());
        assert!(conn.seconds_until_heartbeat() <= 30);
        assert!(conn.seconds_until_heartbeat() >= 29);
    }

    #[test]
    fn wrong_password_collapses_every_hop() {
        let ctx = Context::new(Actor::App, 4, TIMEOUT).unwrap();
        let backend = MockBackend::new();
        let mut conn = Connection::new(&ctx, backend, creds("wrong")).unwrap();

        let err = conn
            .authenticate(CONN_ADDR, 9000, "speech")
            .unwrap_err();
        assert_eq!(
            err,
            Error::Auth(AuthError::Rejected(ProtocolError::WrongAnswer))
        );
        assert!(!conn.is_authenticated("speech"));
        assert!(!conn.connection_server().is_connected());
        assert_eq!(crate::error::take_last_error(), Some(err));
    }

    #[test]
    fn channel_parameters_validated() {
        let ctx = Context::new(Actor::App, 4, TIMEOUT).unwrap();
        let backend = MockBackend::new();
        let mut conn = Connection::new(&ctx, backend, creds(PASSWORD)).unwrap();

        assert_eq!(
            conn.authenticate(CONN_ADDR, 9000, "").unwrap_err(),
            Error::Param(ParamError::EmptyChannel)
        );
        let long = "c".repeat(CHANNEL_LEN + 1);
        assert_eq!(
            conn.authenticate(CONN_ADDR, 9000, &long).unwrap_err(),
            Error::Param(ParamError::ChannelTooLong)
        );
        assert_eq!(
            conn.send_text("nope", "hi").unwrap_err(),
            Error::Param(ParamError::UnknownChannel)
        );
    }

    #[test]
    fn encrypted_send_requires_key_and_connection() {
        let ctx = Context::new(Actor::App, 4, TIMEOUT).unwrap();
        let transport = CollectTransport::new();
        let mut server = ctx.open_server(transport).unwrap();

        let text = NetMessage::Text {
            timestamp: 0,
            body: "hi".into(),
        };
        assert_eq!(server.send(&text).unwrap_err(), SendError::NoKey);

        server.set_key(Key::from_bytes([1; 32]));
        assert_eq!(server.send(&text).unwrap_err(), SendError::Disconnected);
    }

    #[test]
    fn oversized_text_goes_out_chunked_and_reassembles() {
        let ctx = Context::new(Actor::App, 4, TIMEOUT).unwrap();
        let transport = CollectTransport::new();
        let key = Key::from_bytes([9; 32]);

        let mut sender = ctx.open_server(transport.clone() as Arc<dyn Transport>).unwrap();
        sender.set_key(key.clone());
        sender.connect("10.0.0.5", 9000, None).unwrap();

        let body = "x".repeat(TEXT_LEN);
        sender
            .send(&NetMessage::Text {
                timestamp: 42,
                body: body.clone(),
            })
            .unwrap();

        let sent = transport.sent.lock().unwrap().clone();
        assert!(sent.len() >= 2);
        for buf in &sent {
            assert!(buf.len() <= MESSAGE_BUFFER_LEN);
            assert_eq!(buf[0], MessageKind::Chunk as u8);
        }

        // Loop the chunk parts back into a receiving server with the key.
        let mut receiver = ctx.open_server(transport).unwrap();
        receiver.set_key(key);
        let sink = receiver.events();
        for buf in &sent {
            let token = sink.peer_stream_started().unwrap();
            sink.stream_event(token, StreamEvent::Receive(buf));
            sink.stream_event(token, StreamEvent::PeerSendShutdown);
        }
        match receiver.receive().unwrap() {
            Some(NetMessage::Text { timestamp, body: got }) => {
                assert_eq!(timestamp, 42);
                assert_eq!(got, body);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn received_location_updates_cache() {
        let ctx = Context::new(Actor::App, 4, TIMEOUT).unwrap();
        let backend = MockBackend::new();
        let mut conn = Connection::new(&ctx, backend, creds(PASSWORD)).unwrap();
        conn.authenticate(CONN_ADDR, 9000, "speech").unwrap();

        let fix = LocationFix {
            latitude: 48.13,
            longitude: 11.57,
            elevation: 520.0,
            facing: 90.0,
            timestamp: 7,
        };
        conn.send_location("speech", fix).unwrap();
        assert_eq!(conn.last_location(), Some(fix));
    }
}
