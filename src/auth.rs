//! Authentication and device pairing.
//!
//! Every server hop runs the same challenge/proof exchange: the client
//! announces itself, the server answers with a KDF salt and a nonce, the
//! client derives the password key and returns the nonce sealed under it.
//! On the connection-server hop the exchange continues with a channel
//! request and ends in a redirect to a communication server.
//!
//! Version skew is rejected before any key derivation happens; Argon2 work
//! for a server we cannot talk to is wasted work.

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;

use crate::crypto::{self, CryptoError, KdfError, Key};
use crate::protocol::{Actor, MessageKind, NetMessage, ProtocolError, PROTOCOL_VERSION};

/// Account identity used for every hop of a handshake.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub mail: String,
    pub password: String,
    pub device_key: String,
}

/// What the state machine wants done after consuming a server message.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    /// Send this message to the server.
    Send(NetMessage),
    /// The hop is authenticated; this is the derived message key.
    Authenticated(Key),
    /// Connection-server hop finished: reconnect to this endpoint.
    Redirect { address: String, port: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("server speaks protocol version {0}, this client speaks {PROTOCOL_VERSION}")]
    VersionMismatch(u8),
    #[error("unexpected {0:?} during handshake")]
    UnexpectedMessage(MessageKind),
    #[error("server rejected the handshake: {0}")]
    Rejected(ProtocolError),
    #[error(transparent)]
    Kdf(#[from] KdfError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HopState {
    AwaitChallenge,
    AwaitResult,
    AwaitChannel,
    Done,
}

/// Challenge/proof exchange against one server. Construct with a channel
/// name for the connection-server hop (the exchange then ends in a
/// redirect) or without one for the communication-server hop (it ends in
/// the derived key).
pub struct HopAuth {
    credentials: Credentials,
    actor: Actor,
    channel: Option<String>,
    state: HopState,
    key: Option<Key>,
}

impl HopAuth {
    pub fn new(credentials: Credentials, actor: Actor, channel: Option<String>) -> Self {
        HopAuth {
            credentials,
            actor,
            channel,
            state: HopState::AwaitChallenge,
            key: None,
        }
    }

    /// The opening message of the hop.
    pub fn begin(&self) -> NetMessage {
        NetMessage::AuthRequest {
            mail: self.credentials.mail.clone(),
            device_key: self.credentials.device_key.clone(),
            actor: self.actor,
            version: PROTOCOL_VERSION,
        }
    }

    /// Consume one server message and advance the hop.
    pub fn handle(&mut self, msg: &NetMessage) -> Result<AuthEvent, AuthError> {
        match (self.state, msg) {
            (
                HopState::AwaitChallenge,
                NetMessage::AuthChallenge {
                    salt,
                    nonce,
                    strength,
                    version,
                },
            ) => {
                if *version != PROTOCOL_VERSION {
                    return Err(AuthError::VersionMismatch(*version));
                }
                let key = crypto::derive_key(&self.credentials.password, salt, *strength)?;
                let sealed_nonce = crypto::seal_nonce(&key, *nonce)?;
                self.key = Some(key);
                self.state = HopState::AwaitResult;
                Ok(AuthEvent::Send(NetMessage::AuthProof {
                    version: PROTOCOL_VERSION,
                    sealed_nonce,
                }))
            }
            (HopState::AwaitResult, NetMessage::AuthResult { error }) => {
                if *error != 0 {
                    let code =
                        ProtocolError::from_code(*error).unwrap_or(ProtocolError::Unknown);
                    return Err(AuthError::Rejected(code));
                }
                match self.channel.take() {
                    Some(channel) => {
                        self.state = HopState::AwaitChannel;
                        Ok(AuthEvent::Send(NetMessage::ChannelRequest { channel }))
                    }
                    None => {
                        self.state = HopState::Done;
                        // The challenge precedes the result, so the key is set.
                        self.key
                            .clone()
                            .map(AuthEvent::Authenticated)
                            .ok_or(AuthError::UnexpectedMessage(MessageKind::AuthResult))
                    }
                }
            }
            (HopState::AwaitChannel, NetMessage::ChannelResponse { address, port }) => {
                self.state = HopState::Done;
                debug!(%address, port = *port, "channel granted");
                Ok(AuthEvent::Redirect {
                    address: address.clone(),
                    port: *port,
                })
            }
            (_, msg) => Err(AuthError::UnexpectedMessage(msg.kind())),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == HopState::Done
    }
}

/// Pairing, initiator side: an authenticated device invites a new device
/// of `target` role. The new device proves it knows the account password
/// by sealing our nonce under the same derived key.
pub struct PairInitiator {
    key: Key,
    target: Actor,
    nonce: Option<u32>,
}

/// Device key of a successfully paired device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedDevice {
    pub device_key: String,
}

impl PairInitiator {
    pub fn new(key: Key, target: Actor) -> Self {
        PairInitiator {
            key,
            target,
            nonce: None,
        }
    }

    /// Open the exchange with a fresh random nonce.
    pub fn challenge(&mut self) -> NetMessage {
        let nonce = OsRng.next_u32();
        self.nonce = Some(nonce);
        NetMessage::PairChallenge {
            version: PROTOCOL_VERSION,
            nonce,
            target: self.target,
        }
    }

    /// Consume the proof. Returns the result message to send either way;
    /// the paired device is `Some` only on success. A proof sealed under
    /// the wrong key (wrong password on the new device) fails here.
    pub fn handle_proof(
        &mut self,
        msg: &NetMessage,
    ) -> Result<(NetMessage, Option<PairedDevice>), AuthError> {
        let (version, sealed_nonce, device_key) = match msg {
            NetMessage::PairProof {
                version,
                sealed_nonce,
                device_key,
            } => (*version, sealed_nonce, device_key),
            other => return Err(AuthError::UnexpectedMessage(other.kind())),
        };
        if version != PROTOCOL_VERSION {
            return Err(AuthError::VersionMismatch(version));
        }
        let expected = match self.nonce {
            Some(nonce) => nonce,
            None => return Err(AuthError::UnexpectedMessage(MessageKind::PairProof)),
        };
        let failure = |code: ProtocolError| {
            (
                NetMessage::PairResult {
                    result: code.code(),
                },
                None,
            )
        };
        let opened = match crypto::open_nonce(&self.key, sealed_nonce) {
            Ok(n) => n,
            Err(_) => return Ok(failure(ProtocolError::WrongAnswer)),
        };
        if opened != expected {
            return Ok(failure(ProtocolError::Nonce));
        }
        Ok((
            NetMessage::PairResult { result: 0 },
            Some(PairedDevice {
                device_key: device_key.clone(),
            }),
        ))
    }
}

/// Pairing, responder side: the new device answering a challenge with its
/// device key and the sealed nonce.
pub struct PairResponder {
    key: Key,
    device_key: String,
}

impl PairResponder {
    pub fn new(key: Key, device_key: String) -> Self {
        PairResponder { key, device_key }
    }

    pub fn handle_challenge(&self, msg: &NetMessage) -> Result<NetMessage, AuthError> {
        let (version, nonce) = match msg {
            NetMessage::PairChallenge { version, nonce, .. } => (*version, *nonce),
            other => return Err(AuthError::UnexpectedMessage(other.kind())),
        };
        if version != PROTOCOL_VERSION {
            return Err(AuthError::VersionMismatch(version));
        }
        Ok(NetMessage::PairProof {
            version: PROTOCOL_VERSION,
            sealed_nonce: crypto::seal_nonce(&self.key, nonce)?,
            device_key: self.device_key.clone(),
        })
    }

    pub fn handle_result(&self, msg: &NetMessage) -> Result<(), AuthError> {
        match msg {
            NetMessage::PairResult { result: 0 } => Ok(()),
            NetMessage::PairResult { result } => Err(AuthError::Rejected(
                ProtocolError::from_code(*result).unwrap_or(ProtocolError::Unknown),
            )),
            other => Err(AuthError::UnexpectedMessage(other.kind())),
        }
    }
}
