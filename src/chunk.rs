//! Chunked transfer of logical messages larger than one wire buffer.
//!
//! The sender splits a payload into numbered parts under one transfer id;
//! the last part is marked End. The assembler tolerates parts arriving out
//! of order and transfers interleaving, and caps how much it will hold for
//! peers that never finish.

use std::collections::{BTreeMap, HashMap};

use tracing::warn;

use crate::protocol::{ChunkKind, NetMessage, CHUNK_DATA_LEN};

/// Open transfers held at once before new ids are refused.
pub const MAX_OPEN_MESSAGES: usize = 8;
/// Total bytes buffered across open transfers before parts are refused.
pub const MAX_BUFFERED_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("too many unfinished chunked messages")]
    TooManyMessages,
    #[error("chunk reassembly buffer limit reached")]
    BufferLimit,
}

#[derive(Default)]
struct Transfer {
    parts: BTreeMap<u32, Vec<u8>>,
    // Part index of the End chunk, once seen. The End part carries the
    // highest index, so the transfer is done when parts 0..=end are here.
    end_part: Option<u32>,
}

impl Transfer {
    // Contiguity matters, not just the count: parts 0..=end must all be
    // present, with nothing substituting from past the end marker.
    fn complete(&self) -> bool {
        match self.end_part {
            Some(end) => {
                self.parts.len() as u64 == u64::from(end) + 1
                    && self.parts.last_key_value().map(|(k, _)| *k) == Some(end)
            }
            None => false,
        }
    }
}

/// Reassembles chunked messages, keyed by transfer id and part index.
pub struct Assembler {
    open: HashMap<u32, Transfer>,
    buffered: usize,
    max_open: usize,
    max_bytes: usize,
}

impl Assembler {
    pub fn new() -> Self {
        Self::with_limits(MAX_OPEN_MESSAGES, MAX_BUFFERED_BYTES)
    }

    pub fn with_limits(max_open: usize, max_bytes: usize) -> Self {
        Assembler {
            open: HashMap::new(),
            buffered: 0,
            max_open,
            max_bytes,
        }
    }

    /// Feed one chunk. Returns the reassembled payload once every part up
    /// to and including the End part has arrived, with parts concatenated
    /// in ascending part order regardless of arrival order.
    pub fn ingest(
        &mut self,
        kind: ChunkKind,
        id: u32,
        part: u32,
        data: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, ChunkError> {
        if !self.open.contains_key(&id) && self.open.len() >= self.max_open {
            warn!(id, open = self.open.len(), "refusing new chunked message");
            return Err(ChunkError::TooManyMessages);
        }
        if let Some(end) = self.open.get(&id).and_then(|t| t.end_part) {
            if part > end {
                warn!(id, part, end, "ignoring chunk part past the end marker");
                return Ok(None);
            }
        }
        if self.buffered + data.len() > self.max_bytes {
            warn!(id, buffered = self.buffered, "chunk buffer limit reached");
            return Err(ChunkError::BufferLimit);
        }

        let transfer = self.open.entry(id).or_default();
        self.buffered += data.len();
        if let Some(old) = transfer.parts.insert(part, data) {
            // Duplicate part: the newer copy wins.
            self.buffered -= old.len();
        }
        if kind == ChunkKind::End {
            transfer.end_part = Some(part);
            // Anything already stored past the end marker cannot belong
            // to this transfer.
            while let Some((&stray, _)) = transfer.parts.last_key_value() {
                if stray <= part {
                    break;
                }
                if let Some(old) = transfer.parts.remove(&stray) {
                    self.buffered -= old.len();
                    warn!(id, part = stray, end = part, "dropping chunk part past the end marker");
                }
            }
        }

        if !transfer.complete() {
            return Ok(None);
        }
        let transfer = self.open.remove(&id).unwrap_or_default();
        let total: usize = transfer.parts.values().map(Vec::len).sum();
        self.buffered -= total;
        let mut out = Vec::with_capacity(total);
        for data in transfer.parts.into_values() {
            out.extend_from_slice(&data);
        }
        Ok(Some(out))
    }

    /// Drop every open transfer, e.g. on connection teardown.
    pub fn clear(&mut self) {
        self.open.clear();
        self.buffered = 0;
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Assembler::new()
    }
}

/// Split a payload into chunk messages under `id`. The final part carries
/// the End marker; an empty payload yields a single empty End part.
pub fn split(id: u32, data: &[u8]) -> Vec<NetMessage> {
    let mut out = Vec::new();
    let mut parts = data.chunks(CHUNK_DATA_LEN).enumerate().peekable();
    if parts.peek().is_none() {
        return vec![NetMessage::Chunk {
            kind: ChunkKind::End,
            id,
            part: 0,
            data: Vec::new(),
        }];
    }
    while let Some((part, piece)) = parts.next() {
        let kind = if parts.peek().is_none() {
            ChunkKind::End
        } else {
            ChunkKind::Chunk
        };
        out.push(NetMessage::Chunk {
            kind,
            id,
            part: part as u32,
            data: piece.to_vec(),
        });
    }
    out
}
