//! Definitions of message content.
pub mod data;
pub mod extended;
pub mod header;

use header::{Header, MessageType};

/// Errors that can occur during message/header parsing.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// The input buffer has an invalid length.
    #[error("invalid input buffer length (expected {expected:?}, found {found:?})")]
    InvalidLength {
        /// The expected length.
        expected: usize,
        /// The actual length found.
        found: usize,
    },
    /// The specification revision field is not supported.
    #[error("unsupported specification revision `{0}`")]
    UnsupportedSpecificationRevision(u8),
    /// A chunk carried more data than a chunk can hold.
    #[error("chunk of {0} bytes exceeds the limit of {1} bytes")]
    ChunkOverflow(usize, usize),
    /// A chunk arrived out of sequence.
    #[error("chunk {found} received, expected {expected}")]
    ChunkSequence {
        /// The chunk number that was expected next.
        expected: u8,
        /// The chunk number that was received.
        found: u8,
    },
    /// A new chunked message started before the previous one was complete.
    #[error("chunked message assembler is already in use")]
    ParserReuse,
}

/// Payload of a USB PD message, if any.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Payload {
    /// Payload for a data message.
    Data(data::Data),
    /// Payload for an extended message.
    Extended(extended::Extended),
}

/// A USB PD message.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Message {
    /// The message header.
    pub header: Header,
    /// Optional payload for data and extended messages.
    pub payload: Option<Payload>,
}

impl Message {
    /// Create a new message from a message header.
    pub fn new(header: Header) -> Self {
        Self { header, payload: None }
    }

    /// Create a new message from a message header and payload data.
    pub fn new_with_data(header: Header, data: data::Data) -> Self {
        Self {
            header,
            payload: Some(Payload::Data(data)),
        }
    }

    /// Serialize a message to a slice, returning the number of written bytes.
    pub fn to_bytes(&self, buffer: &mut [u8]) -> usize {
        self.header.to_bytes(buffer)
            + match self.payload.as_ref() {
                Some(Payload::Data(data)) => data.to_bytes(&mut buffer[2..]),
                Some(Payload::Extended(extended)) => extended.to_bytes(&mut buffer[2..]),
                None => 0,
            }
    }

    /// Parse a message from a slice of bytes.
    ///
    /// Extended messages are returned chunk by chunk, reassembly is up to the protocol layer.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        let header = Header::from_bytes(data)?;
        let payload = &data[2..];

        let payload = match header.message_type() {
            MessageType::Control(_) => None,
            MessageType::Data(message_type) => Some(Payload::Data(data::Data::parse(
                message_type,
                header.num_objects(),
                payload,
            )?)),
            MessageType::Extended(_) => Some(Payload::Extended(extended::Extended::parse_chunk(payload)?)),
        };

        Ok(Self { header, payload })
    }

    /// The data payload, if this is a data message.
    pub fn data(&self) -> Option<&data::Data> {
        match &self.payload {
            Some(Payload::Data(data)) => Some(data),
            _ => None,
        }
    }
}
