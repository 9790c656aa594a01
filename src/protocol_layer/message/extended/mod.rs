//! Definitions and implementations of extended messages.
//!
//! See [6.5].
pub mod chunked;

use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;
use proc_bitfield::bitfield;

use self::chunked::{MAX_EXTENDED_MSG_CHUNK_LEN, MAX_EXTENDED_MSG_LEN};
use super::ParseError;

bitfield! {
    /// Extended message header.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ExtendedHeader(pub u16): Debug, FromStorage, IntoStorage {
        /// Size of the complete message payload in bytes.
        pub data_size: u16 @ 0..=8,
        /// Request chunk flag.
        pub request_chunk: bool @ 10,
        /// Chunk number of this extended message.
        pub chunk_number: u8 @ 11..=14,
        /// Whether the message is chunked.
        pub chunked: bool @ 15,
    }
}

impl ExtendedHeader {
    /// Create a new, unchunked extended header for a given payload size.
    pub fn new(data_size: u16) -> Self {
        Self(0).with_data_size(data_size)
    }
}

/// The payload of an extended message.
///
/// As received from the wire, this is a single chunk. After reassembly by the protocol layer,
/// `data` holds the complete message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Extended {
    /// The extended header.
    pub header: ExtendedHeader,
    /// Payload bytes.
    pub data: Vec<u8, MAX_EXTENDED_MSG_LEN>,
}

impl Extended {
    /// A complete, unchunked extended message.
    pub fn new(data: &[u8]) -> Result<Self, ParseError> {
        let data: Vec<u8, MAX_EXTENDED_MSG_LEN> = Vec::from_slice(data).map_err(|_| ParseError::InvalidLength {
            expected: MAX_EXTENDED_MSG_LEN,
            found: data.len(),
        })?;

        Ok(Self {
            header: ExtendedHeader::new(data.len() as u16),
            data,
        })
    }

    /// Parse a single chunk (or an unchunked message) from the bytes that follow the message header.
    ///
    /// Trailing padding is dropped.
    pub fn parse_chunk(payload: &[u8]) -> Result<Self, ParseError> {
        if payload.len() < 2 {
            return Err(ParseError::InvalidLength {
                expected: 2,
                found: payload.len(),
            });
        }

        let header = ExtendedHeader(LittleEndian::read_u16(payload));
        let payload = &payload[2..];

        let length = if header.request_chunk() {
            0
        } else if header.chunked() {
            let offset = usize::from(header.chunk_number()) * MAX_EXTENDED_MSG_CHUNK_LEN;
            let remaining = usize::from(header.data_size()).saturating_sub(offset);
            remaining.min(MAX_EXTENDED_MSG_CHUNK_LEN).min(payload.len())
        } else {
            let length = usize::from(header.data_size());
            if payload.len() < length {
                return Err(ParseError::InvalidLength {
                    expected: length,
                    found: payload.len(),
                });
            }
            length
        };

        let data = Vec::from_slice(&payload[..length]).map_err(|_| ParseError::InvalidLength {
            expected: MAX_EXTENDED_MSG_LEN,
            found: length,
        })?;

        Ok(Self { header, data })
    }

    /// The number of data objects this payload occupies on the wire, including padding.
    pub fn num_objects(&self) -> u8 {
        (2 + self.data.len()).div_ceil(4) as u8
    }

    /// Serialize the extended header and data, padded to a whole number of data objects.
    pub fn to_bytes(&self, buffer: &mut [u8]) -> usize {
        LittleEndian::write_u16(buffer, self.header.0);
        buffer[2..2 + self.data.len()].copy_from_slice(&self.data);

        let written = 2 + self.data.len();
        let padded = written.next_multiple_of(4);
        buffer[written..padded].fill(0);
        padded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_padding_is_dropped() {
        // Chunk 1 of a 30 byte message carries 4 data bytes and two bytes of padding.
        let header = ExtendedHeader::new(30).with_chunked(true).with_chunk_number(1);
        let mut payload = [0u8; 8];
        LittleEndian::write_u16(&mut payload, header.0);
        payload[2..6].copy_from_slice(&[1, 2, 3, 4]);

        let chunk = Extended::parse_chunk(&payload).unwrap();
        assert_eq!(&chunk.data[..], &[1, 2, 3, 4]);
        assert_eq!(chunk.num_objects(), 2);
    }

    #[test]
    fn short_unchunked_payload_is_rejected() {
        let header = ExtendedHeader::new(10);
        let mut payload = [0u8; 6];
        LittleEndian::write_u16(&mut payload, header.0);

        assert_eq!(
            Extended::parse_chunk(&payload),
            Err(ParseError::InvalidLength { expected: 10, found: 4 })
        );
    }
}
