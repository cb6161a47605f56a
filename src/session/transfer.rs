//! Chunked transfer of recorded media over a [`DataChannel`].
//!
//! Every binary frame starts with an 8 bytes header: big endian `u32`
//! transfer ID followed by big endian `u32` sequence number of the chunk.
//! Transfer is finished by a [`TransferTrailer`] carried in a system command
//! message, which lets the receiver check that nothing has been lost.
//!
//! [`DataChannel`]: crate::platform::DataChannel

use std::collections::{BTreeMap, HashMap};

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use peerlink_signalling_proto::{ParseError, TransferTrailer};

/// Length of the header every chunk frame starts with.
pub const HEADER_LEN: usize = 8;

/// Single chunk of a transfer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Chunk {
    /// ID of the transfer this chunk belongs to.
    pub transfer_id: u32,

    /// Position of this chunk in its transfer.
    pub seq: u32,

    /// Payload bytes.
    pub data: Bytes,
}

impl Chunk {
    /// Parses a binary frame received over a data channel.
    ///
    /// # Errors
    ///
    /// With [`ParseError::MalformedChunk`] if the frame is shorter than
    /// [`HEADER_LEN`].
    pub fn parse(mut frame: Bytes) -> Result<Self, ParseError> {
        if frame.len() < HEADER_LEN {
            return Err(ParseError::MalformedChunk(frame.len()));
        }
        let transfer_id = frame.get_u32();
        let seq = frame.get_u32();
        Ok(Self {
            transfer_id,
            seq,
            data: frame,
        })
    }

    /// Encodes this [`Chunk`] into a binary frame.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut frame = BytesMut::with_capacity(HEADER_LEN + self.data.len());
        frame.put_u32(self.transfer_id);
        frame.put_u32(self.seq);
        frame.extend_from_slice(&self.data);
        frame.freeze()
    }
}

/// Splits `payload` into frames of at most `chunk_size` payload bytes each,
/// returning them along with the [`TransferTrailer`] finishing the transfer.
///
/// Empty `payload` produces no frames at all.
#[must_use]
pub fn split(
    transfer_id: u32,
    payload: &Bytes,
    chunk_size: usize,
) -> (Vec<Bytes>, TransferTrailer) {
    let chunk_size = chunk_size.max(1);
    let mut frames = Vec::with_capacity(payload.len() / chunk_size + 1);
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + chunk_size).min(payload.len());
        let chunk = Chunk {
            transfer_id,
            seq: frames.len() as u32,
            data: payload.slice(offset..end),
        };
        frames.push(chunk.encode());
        offset = end;
    }
    let trailer = TransferTrailer {
        id: transfer_id,
        chunks: frames.len() as u32,
        length: payload.len() as u64,
    };
    (frames, trailer)
}

/// Buffers received [`Chunk`]s per transfer until their trailers arrive.
#[derive(Debug, Default)]
pub struct Reassembler {
    transfers: HashMap<u32, BTreeMap<u32, Bytes>>,
}

impl Reassembler {
    /// Buffers the provided [`Chunk`].
    pub fn push(&mut self, chunk: Chunk) {
        let _ = self
            .transfers
            .entry(chunk.transfer_id)
            .or_default()
            .insert(chunk.seq, chunk.data);
    }

    /// Concatenates all the chunks buffered for the transfer described by the
    /// provided `trailer`, in their sequence order.
    ///
    /// The transfer's buffer is discarded in any case.
    ///
    /// # Errors
    ///
    /// With [`ParseError::IncompleteTransfer`] if the buffered chunks don't
    /// match the `trailer`.
    pub fn finish(
        &mut self,
        trailer: &TransferTrailer,
    ) -> Result<Bytes, ParseError> {
        let chunks = self.transfers.remove(&trailer.id).unwrap_or_default();
        let length: usize = chunks.values().map(Bytes::len).sum();
        let is_contiguous =
            chunks.keys().enumerate().all(|(i, seq)| i as u32 == *seq);

        if !is_contiguous
            || chunks.len() as u32 != trailer.chunks
            || length as u64 != trailer.length
        {
            return Err(ParseError::IncompleteTransfer {
                id: trailer.id,
                expected_chunks: trailer.chunks,
                expected_length: trailer.length,
                chunks: chunks.len() as u32,
                length: length as u64,
            });
        }

        let mut blob = BytesMut::with_capacity(length);
        for data in chunks.values() {
            blob.extend_from_slice(data);
        }
        Ok(blob.freeze())
    }

    /// Returns number of transfers awaiting their trailers.
    #[inline]
    #[must_use]
    pub fn pending(&self) -> usize {
        self.transfers.len()
    }

    /// Discards all the buffered chunks.
    #[inline]
    pub fn clear(&mut self) {
        self.transfers.clear();
    }
}
