//! Courier wire protocol: actors, message kinds, typed payloads and version.

/// Current protocol version. Carried in auth and pairing messages so either
/// side can reject skew before doing any cryptographic work.
pub const PROTOCOL_VERSION: u8 = 1;

/// Max server address length in bytes (wire field width).
pub const ADDRESS_LEN: usize = 256;
/// Max account mail length in bytes.
pub const MAIL_LEN: usize = 128;
/// Max channel name length in bytes.
pub const CHANNEL_LEN: usize = 128;
/// Device key length in bytes.
pub const DEVICE_KEY_LEN: usize = 25;
/// Derived key length in bytes (Argon2 output, ChaCha20-Poly1305 key).
pub const KEY_LEN: usize = 32;
/// Password salt length in bytes.
pub const SALT_LEN: usize = 16;
/// Max wire message size including the kind tag.
pub const MESSAGE_BUFFER_LEN: usize = 1024;
/// Max text body length: buffer minus tag and u64 timestamp.
pub const TEXT_LEN: usize = MESSAGE_BUFFER_LEN - 9;
/// Max custom payload length: buffer minus tag.
pub const CUSTOM_LEN: usize = MESSAGE_BUFFER_LEN - 1;
/// Sealed pairing nonce: AEAD nonce (12) + tag (16) + u32 nonce.
pub const SEALED_NONCE_LEN: usize = 12 + 16 + 4;
/// Max chunk data length: buffer minus tag, chunk kind, id and part.
pub const CHUNK_DATA_LEN: usize = MESSAGE_BUFFER_LEN - 10;

/// Role an endpoint plays. Contexts may only be created for client roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Actor {
    App = 0,
    PlatformListen = 1,
    PlatformSay = 2,
    PlatformUser = 3,
    ConnectionServer = 4,
    CommunicationServer = 5,
}

impl Actor {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Actor::App),
            1 => Some(Actor::PlatformListen),
            2 => Some(Actor::PlatformSay),
            3 => Some(Actor::PlatformUser),
            4 => Some(Actor::ConnectionServer),
            5 => Some(Actor::CommunicationServer),
            _ => None,
        }
    }

    /// True for the roles allowed to create a client context.
    pub fn is_client(self) -> bool {
        !matches!(self, Actor::ConnectionServer | Actor::CommunicationServer)
    }
}

/// Wire message kind. The first byte of every wire buffer is this tag;
/// 0 is reserved for unknown data and is never sendable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Unknown = 0,
    Hello = 1,
    Heartbeat = 2,
    AuthRequest = 3,
    AuthChallenge = 4,
    AuthProof = 5,
    AuthResult = 6,
    ChannelRequest = 7,
    ChannelResponse = 8,
    PairChallenge = 9,
    PairProof = 10,
    PairResult = 11,
    Text = 12,
    Location = 13,
    Custom = 14,
    Chunk = 15,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MessageKind::Unknown),
            1 => Some(MessageKind::Hello),
            2 => Some(MessageKind::Heartbeat),
            3 => Some(MessageKind::AuthRequest),
            4 => Some(MessageKind::AuthChallenge),
            5 => Some(MessageKind::AuthProof),
            6 => Some(MessageKind::AuthResult),
            7 => Some(MessageKind::ChannelRequest),
            8 => Some(MessageKind::ChannelResponse),
            9 => Some(MessageKind::PairChallenge),
            10 => Some(MessageKind::PairProof),
            11 => Some(MessageKind::PairResult),
            12 => Some(MessageKind::Text),
            13 => Some(MessageKind::Location),
            14 => Some(MessageKind::Custom),
            15 => Some(MessageKind::Chunk),
            _ => None,
        }
    }

    /// Kinds whose payload travels inside the encryption envelope.
    /// The tag byte itself always stays plaintext for dispatch.
    pub fn is_encrypted(self) -> bool {
        matches!(
            self,
            MessageKind::Text | MessageKind::Location | MessageKind::Custom
        )
    }
}

/// Chunk part marker inside a [`NetMessage::Chunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkKind {
    Chunk = 0,
    End = 1,
}

impl ChunkKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ChunkKind::Chunk),
            1 => Some(ChunkKind::End),
            _ => None,
        }
    }
}

/// All wire message types. Encoding is fixed-offset little-endian (see the
/// wire module); string fields are NUL-padded to their declared width.
#[derive(Debug, Clone, PartialEq)]
pub enum NetMessage {
    /// Announce an actor joining the channel.
    Hello { actor: Actor },
    /// Liveness signal; carries the interval until the next one is due.
    Heartbeat { seconds: u32 },
    /// Open the auth exchange. Carries the protocol version for skew checks.
    AuthRequest {
        mail: String,
        device_key: String,
        actor: Actor,
        version: u8,
    },
    /// Server challenge: salt and strength for the password KDF, nonce to seal.
    AuthChallenge {
        salt: [u8; SALT_LEN],
        nonce: u32,
        strength: u8,
        version: u8,
    },
    /// Client proof: the challenge nonce sealed under the derived key.
    AuthProof {
        version: u8,
        sealed_nonce: [u8; SEALED_NONCE_LEN],
    },
    /// Auth outcome; 0 is success, otherwise a [`ProtocolError`] code.
    AuthResult { error: u8 },
    /// Ask the connection server to route to a channel.
    ChannelRequest { channel: String },
    /// Communication server endpoint for the requested channel.
    ChannelResponse { address: String, port: u32 },
    /// Pairing: initiator sends a nonce for the target actor to seal.
    PairChallenge {
        version: u8,
        nonce: u32,
        target: Actor,
    },
    /// Pairing answer: sealed nonce plus the responder's device key.
    PairProof {
        version: u8,
        sealed_nonce: [u8; SEALED_NONCE_LEN],
        device_key: String,
    },
    /// Pairing outcome both sides observe; 0 is success.
    PairResult { result: u8 },
    /// UTF-8 text. Empty body is valid.
    Text { timestamp: u64, body: String },
    /// User location fix.
    Location {
        latitude: f32,
        longitude: f32,
        elevation: f32,
        facing: f32,
        timestamp: u64,
    },
    /// Opaque application payload.
    Custom { data: Vec<u8> },
    /// Part of an oversized logical message (see the chunk module).
    Chunk {
        kind: ChunkKind,
        id: u32,
        part: u32,
        data: Vec<u8>,
    },
}

impl NetMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            NetMessage::Hello { .. } => MessageKind::Hello,
            NetMessage::Heartbeat { .. } => MessageKind::Heartbeat,
            NetMessage::AuthRequest { .. } => MessageKind::AuthRequest,
            NetMessage::AuthChallenge { .. } => MessageKind::AuthChallenge,
            NetMessage::AuthProof { .. } => MessageKind::AuthProof,
            NetMessage::AuthResult { .. } => MessageKind::AuthResult,
            NetMessage::ChannelRequest { .. } => MessageKind::ChannelRequest,
            NetMessage::ChannelResponse { .. } => MessageKind::ChannelResponse,
            NetMessage::PairChallenge { .. } => MessageKind::PairChallenge,
            NetMessage::PairProof { .. } => MessageKind::PairProof,
            NetMessage::PairResult { .. } => MessageKind::PairResult,
            NetMessage::Text { .. } => MessageKind::Text,
            NetMessage::Location { .. } => MessageKind::Location,
            NetMessage::Custom { .. } => MessageKind::Custom,
            NetMessage::Chunk { .. } => MessageKind::Chunk,
        }
    }
}

/// Protocol-level result codes carried in AuthResult / PairResult messages.
/// Discriminants are written out; bounds are never computed from another
/// constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(u8)]
pub enum ProtocolError {
    #[error("unknown protocol error")]
    Unknown = 1,
    #[error("no device found for device key")]
    NoDevice = 2,
    #[error("answer to challenge was wrong")]
    WrongAnswer = 3,
    #[error("protocol version mismatch")]
    Version = 4,
    #[error("unknown actor")]
    UnknownActor = 5,
    #[error("invalid message size")]
    MessageSize = 6,
    #[error("nonce was wrong")]
    Nonce = 7,
    #[error("already connected")]
    AlreadyConnected = 8,
    #[error("server is full")]
    Full = 9,
    #[error("server is down for maintenance")]
    Maintenance = 10,
    #[error("no matching channel")]
    NoChannel = 11,
}

impl ProtocolError {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ProtocolError::Unknown),
            2 => Some(ProtocolError::NoDevice),
            3 => Some(ProtocolError::WrongAnswer),
            4 => Some(ProtocolError::Version),
            5 => Some(ProtocolError::UnknownActor),
            6 => Some(ProtocolError::MessageSize),
            7 => Some(ProtocolError::Nonce),
            8 => Some(ProtocolError::AlreadyConnected),
            9 => Some(ProtocolError::Full),
            10 => Some(ProtocolError::Maintenance),
            11 => Some(ProtocolError::NoChannel),
            _ => None,
        }
    }
}
