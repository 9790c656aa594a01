//! Definitions for a USB PD message header.
//!
//! See [6.2.1.1].
use core::convert::TryFrom;

use byteorder::{ByteOrder, LittleEndian};
use proc_bitfield::bitfield;

use crate::counters::Counter;
use crate::protocol_layer::message::ParseError;
use crate::{DataRole, PowerRole};

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// The message header that starts every message.
    pub struct Header(pub u16): Debug, FromStorage, IntoStorage {
        /// Set for extended messages.
        pub extended: bool @ 15,
        /// The number of 32 bit data objects that follow the header.
        pub num_objects: u8 [get usize] @ 12..=14,
        /// A rolling counter, maintained by the originator of the message.
        pub message_id: u8 @ 9..=11,
        /// The port's present power role (0 -> sink, 1 -> source).
        ///
        /// On SOP' and SOP'' this bit is the cable plug flag instead, set by cable plugs and VPDs.
        pub port_power_role: bool [get PowerRole, set PowerRole] @ 8,
        /// The specification revision.
        pub spec_revision: u8 [try_get SpecificationRevision, set SpecificationRevision] @ 6..=7,
        /// The port's data role (0 -> UFP, 1 -> DFP).
        pub port_data_role: bool [get DataRole, set DataRole] @ 5,
        /// The raw message type, interpreted depending on `extended` and `num_objects`.
        pub message_type_raw: u8 @ 0..=4,
    }
}

impl Header {
    /// Create a header template with the given roles.
    pub fn new_template(
        port_data_role: DataRole,
        port_power_role: PowerRole,
        spec_revision: SpecificationRevision,
    ) -> Self {
        Self(0)
            .with_port_data_role(port_data_role)
            .with_port_power_role(port_power_role)
            .with_spec_revision(spec_revision)
    }

    fn new(template: Self, message_id: Counter, message_type_raw: u8, num_objects: u8, extended: bool) -> Self {
        template
            .with_message_id(message_id.value())
            .with_message_type_raw(message_type_raw)
            .with_num_objects(num_objects)
            .with_extended(extended)
    }

    /// Create a new control message header.
    pub fn new_control(template: Self, message_id: Counter, message_type: ControlMessageType) -> Self {
        Self::new(template, message_id, message_type as u8, 0, false)
    }

    /// Create a new data message header.
    pub fn new_data(template: Self, message_id: Counter, message_type: DataMessageType, num_objects: u8) -> Self {
        Self::new(template, message_id, message_type as u8, num_objects, false)
    }

    /// Create a new extended message header.
    pub fn new_extended(
        template: Self,
        message_id: Counter,
        message_type: ExtendedMessageType,
        num_objects: u8,
    ) -> Self {
        Self::new(template, message_id, message_type as u8, num_objects, true)
    }

    /// Parse a header from its binary representation.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < 2 {
            return Err(ParseError::InvalidLength {
                expected: 2,
                found: buf.len(),
            });
        }

        let header = Header(LittleEndian::read_u16(buf));
        header.spec_revision()?;
        Ok(header)
    }

    /// Serialize the header to its binary representation.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u16(buf, self.0);
        2
    }

    /// Extract the message type that the header encodes.
    pub fn message_type(&self) -> MessageType {
        if self.extended() {
            MessageType::Extended(self.message_type_raw().into())
        } else if self.num_objects() == 0 {
            MessageType::Control(self.message_type_raw().into())
        } else {
            MessageType::Data(self.message_type_raw().into())
        }
    }
}

/// Specification revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(non_camel_case_types)]
pub enum SpecificationRevision {
    /// Version 1.0.
    R1_0,
    /// Version 2.0.
    R2_0,
    /// Version 3.x.
    R3_X,
}

impl TryFrom<u8> for SpecificationRevision {
    type Error = ParseError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0b00 => Ok(Self::R1_0),
            0b01 => Ok(Self::R2_0),
            0b10 => Ok(Self::R3_X),
            _ => Err(ParseError::UnsupportedSpecificationRevision(value)),
        }
    }
}

impl From<SpecificationRevision> for u8 {
    fn from(value: SpecificationRevision) -> Self {
        match value {
            SpecificationRevision::R1_0 => 0b00,
            SpecificationRevision::R2_0 => 0b01,
            SpecificationRevision::R3_X => 0b10,
        }
    }
}

/// The type of message that a header encodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageType {
    /// A control message, as defined in [6.3].
    Control(ControlMessageType),
    /// A data message, as defined in [6.4].
    Data(DataMessageType),
    /// An extended message, as defined in [6.5].
    Extended(ExtendedMessageType),
}

/// Types of control messages.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlMessageType {
    GoodCRC = 0x01,
    GotoMin = 0x02,
    Accept = 0x03,
    Reject = 0x04,
    Ping = 0x05,
    PsRdy = 0x06,
    GetSourceCap = 0x07,
    GetSinkCap = 0x08,
    DrSwap = 0x09,
    PrSwap = 0x0A,
    VconnSwap = 0x0B,
    Wait = 0x0C,
    SoftReset = 0x0D,
    DataReset = 0x0E,
    DataResetComplete = 0x0F,
    NotSupported = 0x10,
    GetSourceCapExtended = 0x11,
    GetStatus = 0x12,
    FrSwap = 0x13,
    GetPpsStatus = 0x14,
    GetCountryCodes = 0x15,
    GetSinkCapExtended = 0x16,
    GetSourceInfo = 0x17,
    GetRevision = 0x18,
    Reserved,
}

impl From<u8> for ControlMessageType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::GoodCRC,
            0x02 => Self::GotoMin,
            0x03 => Self::Accept,
            0x04 => Self::Reject,
            0x05 => Self::Ping,
            0x06 => Self::PsRdy,
            0x07 => Self::GetSourceCap,
            0x08 => Self::GetSinkCap,
            0x09 => Self::DrSwap,
            0x0A => Self::PrSwap,
            0x0B => Self::VconnSwap,
            0x0C => Self::Wait,
            0x0D => Self::SoftReset,
            0x0E => Self::DataReset,
            0x0F => Self::DataResetComplete,
            0x10 => Self::NotSupported,
            0x11 => Self::GetSourceCapExtended,
            0x12 => Self::GetStatus,
            0x13 => Self::FrSwap,
            0x14 => Self::GetPpsStatus,
            0x15 => Self::GetCountryCodes,
            0x16 => Self::GetSinkCapExtended,
            0x17 => Self::GetSourceInfo,
            0x18 => Self::GetRevision,
            _ => Self::Reserved,
        }
    }
}

/// Types of data messages.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataMessageType {
    SourceCapabilities = 0x01,
    Request = 0x02,
    Bist = 0x03,
    SinkCapabilities = 0x04,
    BatteryStatus = 0x05,
    Alert = 0x06,
    GetCountryInfo = 0x07,
    EnterUsb = 0x08,
    VendorDefined = 0x0F,
    Reserved,
}

impl From<u8> for DataMessageType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::SourceCapabilities,
            0x02 => Self::Request,
            0x03 => Self::Bist,
            0x04 => Self::SinkCapabilities,
            0x05 => Self::BatteryStatus,
            0x06 => Self::Alert,
            0x07 => Self::GetCountryInfo,
            0x08 => Self::EnterUsb,
            0x0F => Self::VendorDefined,
            _ => Self::Reserved,
        }
    }
}

/// Types of extended messages.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ExtendedMessageType {
    SourceCapabilitiesExtended = 0x01,
    Status = 0x02,
    GetBatteryCap = 0x03,
    GetBatteryStatus = 0x04,
    BatteryCapabilities = 0x05,
    GetManufacturerInfo = 0x06,
    ManufacturerInfo = 0x07,
    SecurityRequest = 0x08,
    SecurityResponse = 0x09,
    FirmwareUpdateRequest = 0x0A,
    FirmwareUpdateResponse = 0x0B,
    PpsStatus = 0x0C,
    CountryInfo = 0x0D,
    CountryCodes = 0x0E,
    SinkCapabilitiesExtended = 0x0F,
    VendorDefinedExtended = 0x1E,
    Reserved,
}

impl From<u8> for ExtendedMessageType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::SourceCapabilitiesExtended,
            0x02 => Self::Status,
            0x03 => Self::GetBatteryCap,
            0x04 => Self::GetBatteryStatus,
            0x05 => Self::BatteryCapabilities,
            0x06 => Self::GetManufacturerInfo,
            0x07 => Self::ManufacturerInfo,
            0x08 => Self::SecurityRequest,
            0x09 => Self::SecurityResponse,
            0x0A => Self::FirmwareUpdateRequest,
            0x0B => Self::FirmwareUpdateResponse,
            0x0C => Self::PpsStatus,
            0x0D => Self::CountryInfo,
            0x0E => Self::CountryCodes,
            0x0F => Self::SinkCapabilitiesExtended,
            0x1E => Self::VendorDefinedExtended,
            _ => Self::Reserved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::CounterType;

    #[test]
    fn control_header_layout() {
        let template = Header::new_template(DataRole::Dfp, PowerRole::Source, SpecificationRevision::R3_X);
        let header = Header::new_control(
            template,
            Counter::new_from_value(CounterType::MessageId, 5),
            ControlMessageType::Accept,
        );

        // ID 5, source, revision 3, DFP, Accept.
        assert_eq!(header.0, 0x0BA3);
        assert_eq!(header.message_type(), MessageType::Control(ControlMessageType::Accept));
    }

    #[test]
    fn reserved_revision_is_rejected() {
        assert_eq!(
            Header::from_bytes(&[0xC1, 0x00]),
            Err(ParseError::UnsupportedSpecificationRevision(0b11))
        );
        assert!(matches!(Header::from_bytes(&[0x01]), Err(ParseError::InvalidLength { .. })));
    }
}
