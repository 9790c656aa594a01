//! Definitions and implementations of data messages.
//!
//! See [6.4].
pub mod pdo;
pub mod request;
pub mod vdm;

use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;

use super::ParseError;
use super::header::DataMessageType;

/// The maximum number of data objects in a non-extended message.
pub const MAX_DATA_OBJECTS: usize = 7;

/// Contents of data messages.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Data {
    /// Capabilities of a source.
    SourceCapabilities(pdo::Capabilities),
    /// Capabilities of a sink.
    SinkCapabilities(pdo::Capabilities),
    /// Request for a power level from the source.
    ///
    /// The request only becomes meaningful with the capabilities it refers to,
    /// see [`request::PowerSource::from_raw`].
    Request(request::RawRequest),
    /// Vendor defined message.
    VendorDefined(vdm::Vdm),
    /// A data message that is not interpreted further.
    Unknown(Vec<u32, MAX_DATA_OBJECTS>),
}

impl Data {
    /// Parse the payload of a data message.
    pub fn parse(message_type: DataMessageType, num_objects: usize, payload: &[u8]) -> Result<Self, ParseError> {
        let expected = num_objects * 4;
        if payload.len() < expected {
            return Err(ParseError::InvalidLength {
                expected,
                found: payload.len(),
            });
        }

        let objects: Vec<u32, MAX_DATA_OBJECTS> = payload[..expected]
            .chunks_exact(4)
            .take(MAX_DATA_OBJECTS)
            .map(LittleEndian::read_u32)
            .collect();

        Ok(match message_type {
            DataMessageType::SourceCapabilities => Data::SourceCapabilities(pdo::Capabilities::from_raw(&objects)),
            DataMessageType::SinkCapabilities => Data::SinkCapabilities(pdo::Capabilities::from_raw(&objects)),
            DataMessageType::Request if objects.len() == 1 => Data::Request(request::RawRequest(objects[0])),
            DataMessageType::VendorDefined => Data::VendorDefined(vdm::Vdm::from_raw(&objects)),
            _ => Data::Unknown(objects),
        })
    }

    /// The number of data objects this payload occupies.
    pub fn num_objects(&self) -> u8 {
        let count = match self {
            Self::SourceCapabilities(capabilities) | Self::SinkCapabilities(capabilities) => capabilities.pdos().len(),
            Self::Request(_) => 1,
            Self::VendorDefined(vdm) => 1 + vdm.objects.len(),
            Self::Unknown(objects) => objects.len(),
        };
        count as u8
    }

    /// Serialize message data to a slice, returning the number of written bytes.
    pub fn to_bytes(&self, payload: &mut [u8]) -> usize {
        let mut written = 0;
        let mut write = |raw: u32| {
            LittleEndian::write_u32(&mut payload[written..written + 4], raw);
            written += 4;
        };

        match self {
            Self::SourceCapabilities(capabilities) | Self::SinkCapabilities(capabilities) => {
                capabilities.pdos().iter().for_each(|pdo| write(pdo.to_raw()));
            }
            Self::Request(request) => write(request.0),
            Self::VendorDefined(vdm) => {
                write(vdm.header.to_raw());
                vdm.objects.iter().for_each(|object| write(*object));
            }
            Self::Unknown(objects) => objects.iter().for_each(|object| write(*object)),
        }

        written
    }
}
