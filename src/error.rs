//! Crate-level error aggregation and the thread-local last-error slot.

use std::cell::RefCell;

/// Caller-supplied parameter was unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParamError {
    #[error("contexts exist for client roles only")]
    ServerActor,
    #[error("server capacity must be at least one")]
    ZeroCapacity,
    #[error("channel name is empty")]
    EmptyChannel,
    #[error("channel name exceeds the wire field width")]
    ChannelTooLong,
    #[error("server address is empty")]
    EmptyAddress,
    #[error("port is out of range")]
    InvalidPort,
    #[error("context server limit reached")]
    ServerLimit,
    #[error("channel limit reached")]
    ChannelLimit,
    #[error("no such channel")]
    UnknownChannel,
}

/// Any failure the engine can report.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Param(#[from] ParamError),
    #[error(transparent)]
    Encode(#[from] crate::wire::EncodeError),
    #[error(transparent)]
    Decode(#[from] crate::wire::DecodeError),
    #[error(transparent)]
    Kdf(#[from] crate::crypto::KdfError),
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
    #[error(transparent)]
    Chunk(#[from] crate::chunk::ChunkError),
    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),
    #[error(transparent)]
    Auth(#[from] crate::auth::AuthError),
    #[error(transparent)]
    Send(#[from] crate::session::SendError),
    #[error(transparent)]
    Recv(#[from] crate::session::RecvError),
    #[error("operation timed out")]
    Timeout,
}

thread_local! {
    static LAST_ERROR: RefCell<Option<Error>> = const { RefCell::new(None) };
}

/// Record an error in the calling thread's slot.
pub(crate) fn set_last(err: &Error) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(err.clone()));
}

/// The most recent error recorded on this thread, if any.
pub fn last_error() -> Option<Error> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// Take and clear this thread's recorded error.
pub fn take_last_error() -> Option<Error> {
    LAST_ERROR.with(|slot| slot.borrow_mut().take())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_error_is_per_thread() {
        set_last(&Error::Timeout);
        assert_eq!(last_error(), Some(Error::Timeout));

        std::thread::spawn(|| {
            assert_eq!(last_error(), None);
        })
        .join()
        .unwrap();

        assert_eq!(take_last_error(), Some(Error::Timeout));
        assert_eq!(last_error(), None);
    }
}
