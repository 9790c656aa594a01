//! Chunked extended messages.
//!
//! Extended messages that exceed a single packet are split into chunks of up to 26 bytes.
//! The receiver requests every chunk after the first one.
//!
//! See [6.12.2.1].
use heapless::Vec;

use super::ExtendedHeader;
use crate::protocol_layer::message::ParseError;

/// Maximum data bytes in a single extended message chunk.
pub const MAX_EXTENDED_MSG_CHUNK_LEN: usize = 26;

/// Maximum total extended message length (data only, excluding headers).
pub const MAX_EXTENDED_MSG_LEN: usize = 260;

/// Result of processing a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChunkResult<T> {
    /// Message is complete and fully assembled.
    Complete(T),
    /// More chunks are needed. Contains the chunk number to request next.
    NeedMoreChunks(u8),
    /// The port partner requested a chunk from us.
    ChunkRequested(u8),
}

/// Reassembles chunked extended messages.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChunkedMessageAssembler {
    buffer: Vec<u8, MAX_EXTENDED_MSG_LEN>,
    expected_size: u16,
    message_type_raw: Option<u8>,
    next_chunk: u8,
}

impl ChunkedMessageAssembler {
    /// Create an idle assembler.
    pub const fn new() -> Self {
        Self {
            buffer: Vec::new(),
            expected_size: 0,
            message_type_raw: None,
            next_chunk: 0,
        }
    }

    /// Drop a partially assembled message.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Whether a message is partially assembled.
    pub fn is_in_progress(&self) -> bool {
        self.message_type_raw.is_some()
    }

    /// Process a received chunk of an extended message with the given raw message type.
    pub fn process_chunk(
        &mut self,
        message_type_raw: u8,
        ext_header: ExtendedHeader,
        chunk_data: &[u8],
    ) -> Result<ChunkResult<Vec<u8, MAX_EXTENDED_MSG_LEN>>, ParseError> {
        let chunk_number = ext_header.chunk_number();

        if ext_header.request_chunk() {
            return Ok(ChunkResult::ChunkRequested(chunk_number));
        }

        if chunk_data.len() > MAX_EXTENDED_MSG_CHUNK_LEN {
            return Err(ParseError::ChunkOverflow(chunk_data.len(), MAX_EXTENDED_MSG_CHUNK_LEN));
        }

        if chunk_number == 0 {
            if self.is_in_progress() {
                self.reset();
                return Err(ParseError::ParserReuse);
            }
            self.expected_size = ext_header.data_size();
            self.message_type_raw = Some(message_type_raw);
        } else if self.message_type_raw != Some(message_type_raw) || chunk_number != self.next_chunk {
            let expected = self.next_chunk;
            self.reset();
            return Err(ParseError::ChunkSequence {
                expected,
                found: chunk_number,
            });
        }

        if self.buffer.extend_from_slice(chunk_data).is_err() {
            let found = self.buffer.len() + chunk_data.len();
            self.reset();
            return Err(ParseError::ChunkOverflow(found, MAX_EXTENDED_MSG_LEN));
        }
        self.next_chunk = chunk_number + 1;

        if self.buffer.len() >= usize::from(self.expected_size) {
            self.buffer.truncate(usize::from(self.expected_size));
            let data = core::mem::take(&mut self.buffer);
            self.reset();
            Ok(ChunkResult::Complete(data))
        } else {
            Ok(ChunkResult::NeedMoreChunks(self.next_chunk))
        }
    }

    /// The extended header of a request for the given chunk.
    pub fn chunk_request_header(chunk_number: u8) -> ExtendedHeader {
        ExtendedHeader::new(0)
            .with_chunked(true)
            .with_request_chunk(true)
            .with_chunk_number(chunk_number)
    }
}

/// Splits message data into chunks for sending.
pub struct ChunkedMessageSender<'a> {
    data: &'a [u8],
    total_chunks: u8,
}

impl<'a> ChunkedMessageSender<'a> {
    /// Create a sender for the complete message data.
    pub fn new(data: &'a [u8]) -> Self {
        let total_chunks = data.len().div_ceil(MAX_EXTENDED_MSG_CHUNK_LEN).max(1) as u8;
        Self { data, total_chunks }
    }

    /// The number of chunks.
    pub fn total_chunks(&self) -> u8 {
        self.total_chunks
    }

    /// Get a chunk by number, for answering a chunk request.
    pub fn get_chunk(&self, chunk_number: u8) -> Option<(ExtendedHeader, &'a [u8])> {
        if chunk_number >= self.total_chunks {
            return None;
        }

        let start = usize::from(chunk_number) * MAX_EXTENDED_MSG_CHUNK_LEN;
        let end = (start + MAX_EXTENDED_MSG_CHUNK_LEN).min(self.data.len());

        let ext_header = ExtendedHeader::new(self.data.len() as u16)
            .with_chunked(true)
            .with_chunk_number(chunk_number);

        Some((ext_header, &self.data[start..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TYPE: u8 = 0x0F;

    #[test]
    fn sender_splits_into_chunks() {
        let data = [0u8; 30];
        let sender = ChunkedMessageSender::new(&data);

        assert_eq!(sender.total_chunks(), 2);

        let (ext_header, chunk) = sender.get_chunk(0).unwrap();
        assert_eq!(chunk.len(), 26);
        assert_eq!(ext_header.data_size(), 30);
        assert!(ext_header.chunked());

        let (ext_header, chunk) = sender.get_chunk(1).unwrap();
        assert_eq!(chunk.len(), 4);
        assert_eq!(ext_header.chunk_number(), 1);

        assert!(sender.get_chunk(2).is_none());
    }

    #[test]
    fn assembler_reassembles_two_chunks() {
        let full: [u8; 30] = core::array::from_fn(|i| i as u8);
        let sender = ChunkedMessageSender::new(&full);
        let mut assembler = ChunkedMessageAssembler::new();

        let (ext_header, chunk) = sender.get_chunk(0).unwrap();
        assert_eq!(
            assembler.process_chunk(TYPE, ext_header, chunk),
            Ok(ChunkResult::NeedMoreChunks(1))
        );
        assert!(assembler.is_in_progress());

        let (ext_header, chunk) = sender.get_chunk(1).unwrap();
        match assembler.process_chunk(TYPE, ext_header, chunk) {
            Ok(ChunkResult::Complete(data)) => assert_eq!(&data[..], &full),
            other => panic!("expected a complete message, got {other:?}"),
        }
        assert!(!assembler.is_in_progress());
    }

    #[test]
    fn out_of_sequence_chunk_resets() {
        let mut assembler = ChunkedMessageAssembler::new();
        let first = ExtendedHeader::new(60).with_chunked(true);

        assembler.process_chunk(TYPE, first, &[0; 26]).unwrap();
        assert_eq!(
            assembler.process_chunk(TYPE, first.with_chunk_number(2), &[0; 26]),
            Err(ParseError::ChunkSequence { expected: 1, found: 2 })
        );
        assert!(!assembler.is_in_progress());
    }

    #[test]
    fn oversized_chunk_is_rejected() {
        let mut assembler = ChunkedMessageAssembler::new();
        let ext_header = ExtendedHeader::new(30).with_chunked(true);

        assert_eq!(
            assembler.process_chunk(TYPE, ext_header, &[0; 27]),
            Err(ParseError::ChunkOverflow(27, MAX_EXTENDED_MSG_CHUNK_LEN))
        );
    }

    #[test]
    fn chunk_requests_are_reported() {
        let mut assembler = ChunkedMessageAssembler::new();
        let request = ChunkedMessageAssembler::chunk_request_header(3);

        assert_eq!(
            assembler.process_chunk(TYPE, request, &[]),
            Ok(ChunkResult::ChunkRequested(3))
        );
    }
}
