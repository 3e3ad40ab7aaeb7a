//! Chunked extended message support.
//!
//! Extended messages may exceed the maximum packet size. They are split into chunks
//! of up to 26 bytes each, and every chunk after the first is requested by the receiver.
//!
//! See [6.12.2.1].
use heapless::Vec;

use super::ExtendedHeader;
use crate::protocol_layer::message::ParseError;

/// Maximum data bytes in a single extended message chunk.
pub const MAX_EXTENDED_MSG_CHUNK_LEN: usize = 26;

/// Maximum total extended message length (data only, excluding headers).
pub const MAX_EXTENDED_MSG_LEN: usize = 260;

/// Result of processing a received chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChunkResult {
    /// Message is complete and fully assembled.
    Complete(Vec<u8, MAX_EXTENDED_MSG_LEN>),
    /// Need more chunks. Contains the chunk number to request next.
    NeedMoreChunks(u8),
    /// Received a chunk request from the other side.
    ChunkRequested(u8),
}

/// Assembler for chunked extended messages.
///
/// Chunks are accumulated at increasing offsets. The message is only complete when the
/// offset reaches the declared size, padding in the last chunk is cut off.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChunkedMessageAssembler {
    buffer: Vec<u8, MAX_EXTENDED_MSG_LEN>,
    expected_size: u16,
    next_chunk: u8,
    in_progress: bool,
}

impl ChunkedMessageAssembler {
    /// Create a new chunked message assembler.
    pub const fn new() -> Self {
        Self {
            buffer: Vec::new(),
            expected_size: 0,
            next_chunk: 0,
            in_progress: false,
        }
    }

    /// Drop any partially assembled message.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Check if assembly is currently in progress.
    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    /// Process a received chunk.
    ///
    /// `chunk_data` is the payload after the extended header, possibly zero padded.
    pub fn process_chunk(&mut self, ext_header: ExtendedHeader, chunk_data: &[u8]) -> Result<ChunkResult, ParseError> {
        let chunk_number = ext_header.chunk_number();

        if ext_header.request_chunk() {
            return Ok(ChunkResult::ChunkRequested(chunk_number));
        }

        if chunk_number == 0 {
            if self.in_progress {
                return Err(ParseError::ParserReuse);
            }
            self.buffer.clear();
            self.expected_size = ext_header.data_size().min(MAX_EXTENDED_MSG_LEN as u16);
            self.in_progress = true;
        } else if !self.in_progress {
            return Err(ParseError::Other("Received non-zero chunk without chunk 0"));
        } else if chunk_number != self.next_chunk {
            return Err(ParseError::Other("Unexpected chunk number"));
        }

        if chunk_data.len() > MAX_EXTENDED_MSG_CHUNK_LEN {
            self.reset();
            return Err(ParseError::ChunkOverflow(chunk_data.len(), MAX_EXTENDED_MSG_CHUNK_LEN));
        }

        let remaining = usize::from(self.expected_size).saturating_sub(self.buffer.len());
        let take = chunk_data.len().min(remaining);
        if self.buffer.extend_from_slice(&chunk_data[..take]).is_err() {
            self.reset();
            return Err(ParseError::Other("Chunk buffer overflow"));
        }
        self.next_chunk = chunk_number + 1;

        if self.buffer.len() >= usize::from(self.expected_size) {
            self.in_progress = false;
            Ok(ChunkResult::Complete(core::mem::take(&mut self.buffer)))
        } else {
            Ok(ChunkResult::NeedMoreChunks(self.next_chunk))
        }
    }

    /// Build a chunk request extended header.
    pub fn build_chunk_request_header(chunk_number: u8) -> ExtendedHeader {
        ExtendedHeader::new(0)
            .with_chunked(true)
            .with_request_chunk(true)
            .with_chunk_number(chunk_number)
    }
}

/// Splits an extended message into chunks for sending.
///
/// The sender owns its data, so that chunks can be resent on request.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChunkedMessageSender {
    data: Vec<u8, MAX_EXTENDED_MSG_LEN>,
    current_chunk: u8,
}

impl ChunkedMessageSender {
    /// Create a new chunked message sender, truncating data beyond the maximum length.
    pub fn new(data: &[u8]) -> Self {
        let len = data.len().min(MAX_EXTENDED_MSG_LEN);
        Self {
            data: data[..len].iter().copied().collect(),
            current_chunk: 0,
        }
    }

    /// The number of the chunk to send next.
    pub fn current_chunk(&self) -> u8 {
        self.current_chunk
    }

    fn offset(&self) -> usize {
        usize::from(self.current_chunk) * MAX_EXTENDED_MSG_CHUNK_LEN
    }

    /// Check if all chunks have been sent.
    pub fn is_complete(&self) -> bool {
        self.offset() >= self.data.len() && !(self.data.is_empty() && self.current_chunk == 0)
    }

    /// The current chunk, with its extended header.
    pub fn chunk(&self) -> (ExtendedHeader, &[u8]) {
        let start = self.offset().min(self.data.len());
        let end = (start + MAX_EXTENDED_MSG_CHUNK_LEN).min(self.data.len());

        let ext_header = ExtendedHeader::new(self.data.len() as u16)
            .with_chunked(true)
            .with_chunk_number(self.current_chunk);

        (ext_header, &self.data[start..end])
    }

    /// The number of data objects that carry the current chunk, including the extended header.
    pub fn num_objects(&self) -> u8 {
        let (_, data) = self.chunk();
        (data.len() + 2).div_ceil(4) as u8
    }

    /// Move on to the next chunk after the current one was acknowledged.
    pub fn advance(&mut self) {
        self.current_chunk += 1;
    }

    /// Continue with a chunk that the receiver requested.
    ///
    /// Requests can rewind to an earlier chunk, but never skip ahead.
    pub fn request(&mut self, chunk_number: u8) {
        if chunk_number < self.current_chunk {
            self.current_chunk = chunk_number;
        }
    }
}
