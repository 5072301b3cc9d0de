//! Fixed-offset wire codec: kind tag byte + little-endian payload layout.
//!
//! Every multi-byte integer and float is written little-endian regardless
//! of host byte order (`to_le_bytes` / `from_le_bytes` do the normalization;
//! on big-endian hosts that is the 4- or 8-byte mirror). String fields are
//! fixed-width, NUL-padded and truncated to the field width; decoding stops
//! at the first NUL or the field boundary, whichever comes first.

use crate::protocol::{
    Actor, ChunkKind, MessageKind, NetMessage, ADDRESS_LEN, CHANNEL_LEN, CHUNK_DATA_LEN,
    CUSTOM_LEN, DEVICE_KEY_LEN, MAIL_LEN, SALT_LEN, SEALED_NONCE_LEN, TEXT_LEN,
};

/// Error encoding a message (payload over its declared bound).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("payload of {kind:?} is {len} bytes, limit {max}")]
    TooLarge {
        kind: MessageKind,
        len: usize,
        max: usize,
    },
}

/// Error decoding a wire buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown message kind tag {0}")]
    UnknownKind(u8),
    #[error("buffer ends before the payload layout does")]
    UnexpectedEnd,
    #[error("invalid actor byte {0}")]
    InvalidActor(u8),
    #[error("invalid chunk kind byte {0}")]
    InvalidChunkKind(u8),
    #[error("string field is not valid UTF-8")]
    Utf8,
}

/// Encode a message into a wire buffer: tag byte first, then the payload
/// at fixed offsets.
pub fn encode(msg: &NetMessage) -> Result<Vec<u8>, EncodeError> {
    let mut w = Writer::new(msg.kind());
    match msg {
        NetMessage::Hello { actor } => {
            w.put_u8(*actor as u8);
        }
        NetMessage::Heartbeat { seconds } => {
            w.put_u32(*seconds);
        }
        NetMessage::AuthRequest {
            mail,
            device_key,
            actor,
            version,
        } => {
            w.put_str_fixed(mail, MAIL_LEN);
            w.put_str_fixed(device_key, DEVICE_KEY_LEN);
            w.put_u8(*actor as u8);
            w.put_u8(*version);
        }
        NetMessage::AuthChallenge {
            salt,
            nonce,
            strength,
            version,
        } => {
            w.put_bytes(salt);
            w.put_u32(*nonce);
            w.put_u8(*strength);
            w.put_u8(*version);
        }
        NetMessage::AuthProof {
            version,
            sealed_nonce,
        } => {
            w.put_u8(*version);
            w.put_bytes(sealed_nonce);
        }
        NetMessage::AuthResult { error } => {
            w.put_u8(*error);
        }
        NetMessage::ChannelRequest { channel } => {
            w.put_str_fixed(channel, CHANNEL_LEN);
        }
        NetMessage::ChannelResponse { address, port } => {
            w.put_str_fixed(address, ADDRESS_LEN);
            w.put_u32(*port);
        }
        NetMessage::PairChallenge {
            version,
            nonce,
            target,
        } => {
            w.put_u8(*version);
            w.put_u32(*nonce);
            w.put_u8(*target as u8);
        }
        NetMessage::PairProof {
            version,
            sealed_nonce,
            device_key,
        } => {
            w.put_u8(*version);
            w.put_bytes(sealed_nonce);
            w.put_str_fixed(device_key, DEVICE_KEY_LEN);
        }
        NetMessage::PairResult { result } => {
            w.put_u8(*result);
        }
        NetMessage::Text { timestamp, body } => {
            w.put_u64(*timestamp);
            // Variable field: truncated to the declared width, never padded.
            // Empty text is valid and ends the buffer right here.
            w.put_bytes(truncate_str(body, TEXT_LEN).as_bytes());
        }
        NetMessage::Location {
            latitude,
            longitude,
            elevation,
            facing,
            timestamp,
        } => {
            w.put_f32(*latitude);
            w.put_f32(*longitude);
            w.put_f32(*elevation);
            w.put_f32(*facing);
            w.put_u64(*timestamp);
        }
        NetMessage::Custom { data } => {
            if data.len() > CUSTOM_LEN {
                return Err(EncodeError::TooLarge {
                    kind: MessageKind::Custom,
                    len: data.len(),
                    max: CUSTOM_LEN,
                });
            }
            w.put_bytes(data);
        }
        NetMessage::Chunk {
            kind,
            id,
            part,
            data,
        } => {
            if data.len() > CHUNK_DATA_LEN {
                return Err(EncodeError::TooLarge {
                    kind: MessageKind::Chunk,
                    len: data.len(),
                    max: CHUNK_DATA_LEN,
                });
            }
            w.put_u8(*kind as u8);
            w.put_u32(*id);
            w.put_u32(*part);
            w.put_bytes(data);
        }
    }
    Ok(w.finish())
}

/// Decode a wire buffer (tag byte included). Unknown tags are a hard
/// error, never silently dropped. Trailing padding after a fixed layout
/// is tolerated.
pub fn decode(bytes: &[u8]) -> Result<NetMessage, DecodeError> {
    let mut r = Reader::new(bytes);
    let tag = r.u8()?;
    let kind = MessageKind::from_u8(tag).ok_or(DecodeError::UnknownKind(tag))?;
    match kind {
        MessageKind::Unknown => Err(DecodeError::UnknownKind(tag)),
        MessageKind::Hello => Ok(NetMessage::Hello {
            actor: r.actor()?,
        }),
        MessageKind::Heartbeat => Ok(NetMessage::Heartbeat { seconds: r.u32()? }),
        MessageKind::AuthRequest => Ok(NetMessage::AuthRequest {
            mail: r.str_fixed(MAIL_LEN)?,
            device_key: r.str_fixed(DEVICE_KEY_LEN)?,
            actor: r.actor()?,
            version: r.u8()?,
        }),
        MessageKind::AuthChallenge => Ok(NetMessage::AuthChallenge {
            salt: r.array::<SALT_LEN>()?,
            nonce: r.u32()?,
            strength: r.u8()?,
            version: r.u8()?,
        }),
        MessageKind::AuthProof => Ok(NetMessage::AuthProof {
            version: r.u8()?,
            sealed_nonce: r.array::<SEALED_NONCE_LEN>()?,
        }),
        MessageKind::AuthResult => Ok(NetMessage::AuthResult { error: r.u8()? }),
        MessageKind::ChannelRequest => Ok(NetMessage::ChannelRequest {
            channel: r.str_fixed(CHANNEL_LEN)?,
        }),
        MessageKind::ChannelResponse => Ok(NetMessage::ChannelResponse {
            address: r.str_fixed(ADDRESS_LEN)?,
            port: r.u32()?,
        }),
        MessageKind::PairChallenge => Ok(NetMessage::PairChallenge {
            version: r.u8()?,
            nonce: r.u32()?,
            target: r.actor()?,
        }),
        MessageKind::PairProof => Ok(NetMessage::PairProof {
            version: r.u8()?,
            sealed_nonce: r.array::<SEALED_NONCE_LEN>()?,
            device_key: r.str_fixed(DEVICE_KEY_LEN)?,
        }),
        MessageKind::PairResult => Ok(NetMessage::PairResult { result: r.u8()? }),
        MessageKind::Text => {
            let timestamp = r.u64()?;
            let rest = r.rest();
            let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            let body = std::str::from_utf8(&rest[..end])
                .map_err(|_| DecodeError::Utf8)?
                .to_owned();
            Ok(NetMessage::Text { timestamp, body })
        }
        MessageKind::Location => Ok(NetMessage::Location {
            latitude: r.f32()?,
            longitude: r.f32()?,
            elevation: r.f32()?,
            facing: r.f32()?,
            timestamp: r.u64()?,
        }),
        MessageKind::Custom => Ok(NetMessage::Custom {
            data: r.rest().to_vec(),
        }),
        MessageKind::Chunk => {
            let kind_byte = r.u8()?;
            let kind =
                ChunkKind::from_u8(kind_byte).ok_or(DecodeError::InvalidChunkKind(kind_byte))?;
            Ok(NetMessage::Chunk {
                kind,
                id: r.u32()?,
                part: r.u32()?,
                data: r.rest().to_vec(),
            })
        }
    }
}

/// Truncate to at most `max` bytes without splitting a UTF-8 sequence.
fn truncate_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new(kind: MessageKind) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.push(kind as u8);
        Writer { buf }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Fixed-width string field: truncated at a char boundary, NUL-padded.
    fn put_str_fixed(&mut self, s: &str, width: usize) {
        let trimmed = truncate_str(s, width);
        self.buf.extend_from_slice(trimmed.as_bytes());
        self.buf.resize(self.buf.len() + (width - trimmed.len()), 0);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(DecodeError::UnexpectedEnd);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        Ok(self.take(N)?.try_into().unwrap())
    }

    fn actor(&mut self) -> Result<Actor, DecodeError> {
        let v = self.u8()?;
        Actor::from_u8(v).ok_or(DecodeError::InvalidActor(v))
    }

    /// Fixed-width string field: stops at the first NUL or the boundary.
    fn str_fixed(&mut self, width: usize) -> Result<String, DecodeError> {
        let raw = self.take(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
        std::str::from_utf8(&raw[..end])
            .map(str::to_owned)
            .map_err(|_| DecodeError::Utf8)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}
