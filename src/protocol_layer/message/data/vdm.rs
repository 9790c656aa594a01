//! Vendor defined messages, used for identity and alternate mode discovery.
//!
//! See [6.4.4].
use heapless::Vec;
use proc_bitfield::bitfield;

/// Standard ID used for discovery commands.
pub const PD_SID: u16 = 0xFF00;

/// Standard ID of the DisplayPort alternate mode.
pub const DISPLAYPORT_SID: u16 = 0xFF01;

/// The maximum number of objects that follow a VDM header.
pub const MAX_VDOS: usize = 6;

/// The kind of VDM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VdmType {
    /// Payload is opaque to the PD stack.
    Unstructured,
    /// Payload follows the structured VDM commands.
    Structured,
}

impl From<bool> for VdmType {
    fn from(value: bool) -> Self {
        if value { Self::Structured } else { Self::Unstructured }
    }
}

impl From<VdmType> for bool {
    fn from(value: VdmType) -> Self {
        matches!(value, VdmType::Structured)
    }
}

/// Command type of a structured VDM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CommandType {
    /// Request from the initiator.
    Request,
    /// Positive response.
    Ack,
    /// Negative response.
    Nak,
    /// The responder cannot answer right now.
    Busy,
}

impl From<u8> for CommandType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b00 => Self::Request,
            0b01 => Self::Ack,
            0b10 => Self::Nak,
            _ => Self::Busy,
        }
    }
}

impl From<CommandType> for u8 {
    fn from(value: CommandType) -> Self {
        match value {
            CommandType::Request => 0b00,
            CommandType::Ack => 0b01,
            CommandType::Nak => 0b10,
            CommandType::Busy => 0b11,
        }
    }
}

/// Structured VDM commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Command {
    DiscoverIdentity,
    DiscoverSvids,
    DiscoverModes,
    EnterMode,
    ExitMode,
    Attention,
    /// An SVID specific command (16..=31).
    SvidSpecific(u8),
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::DiscoverIdentity),
            2 => Ok(Self::DiscoverSvids),
            3 => Ok(Self::DiscoverModes),
            4 => Ok(Self::EnterMode),
            5 => Ok(Self::ExitMode),
            6 => Ok(Self::Attention),
            16..=31 => Ok(Self::SvidSpecific(value)),
            other => Err(other),
        }
    }
}

impl From<Command> for u8 {
    fn from(value: Command) -> Self {
        match value {
            Command::DiscoverIdentity => 1,
            Command::DiscoverSvids => 2,
            Command::DiscoverModes => 3,
            Command::EnterMode => 4,
            Command::ExitMode => 5,
            Command::Attention => 6,
            Command::SvidSpecific(command) => command & 0x1F,
        }
    }
}

bitfield! {
    /// Header of a structured VDM.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct StructuredHeader(pub u32): Debug, FromStorage, IntoStorage {
        /// Standard or vendor ID.
        pub svid: u16 @ 16..=31,
        /// VDM type, set for structured.
        pub vdm_type: bool [get VdmType, set VdmType] @ 15,
        /// Structured VDM major version.
        pub version_major: u8 @ 13..=14,
        /// Structured VDM minor version.
        pub version_minor: u8 @ 11..=12,
        /// Mode object position, for mode related commands.
        pub object_position: u8 @ 8..=10,
        /// Command type.
        pub command_type: u8 [get CommandType, set CommandType] @ 6..=7,
        /// Command.
        pub command: u8 [try_get Command, set Command] @ 0..=4,
    }
}

impl StructuredHeader {
    /// A request header, for structured VDM version 2.0.
    pub fn new_request(svid: u16, command: Command) -> Self {
        Self(0)
            .with_svid(svid)
            .with_vdm_type(VdmType::Structured)
            .with_version_major(1)
            .with_command_type(CommandType::Request)
            .with_command(command)
    }

    /// The response header to this request.
    pub fn response(self, command_type: CommandType) -> Self {
        self.with_command_type(command_type)
    }
}

bitfield! {
    /// Header of an unstructured VDM.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct UnstructuredHeader(pub u32): Debug, FromStorage, IntoStorage {
        /// Vendor ID.
        pub vid: u16 @ 16..=31,
        /// VDM type, cleared for unstructured.
        pub vdm_type: bool [get VdmType, set VdmType] @ 15,
        /// Vendor use.
        pub data: u16 @ 0..=14,
    }
}

/// A VDM header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VdmHeader {
    /// Structured.
    Structured(StructuredHeader),
    /// Unstructured.
    Unstructured(UnstructuredHeader),
}

impl VdmHeader {
    /// Interpret a raw header.
    pub fn from_raw(raw: u32) -> Self {
        let structured = StructuredHeader(raw);
        match structured.vdm_type() {
            VdmType::Structured => Self::Structured(structured),
            VdmType::Unstructured => Self::Unstructured(UnstructuredHeader(raw)),
        }
    }

    /// The raw header.
    pub fn to_raw(&self) -> u32 {
        match self {
            Self::Structured(header) => header.0,
            Self::Unstructured(header) => header.0,
        }
    }
}

/// A vendor defined message.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Vdm {
    /// The VDM header.
    pub header: VdmHeader,
    /// Objects that follow the header.
    pub objects: Vec<u32, MAX_VDOS>,
}

impl Vdm {
    /// Interpret raw data objects, of which the first is the header.
    ///
    /// An empty list yields an unstructured VDM with a zero header.
    pub fn from_raw(objects: &[u32]) -> Self {
        let (header, rest) = objects.split_first().map_or((0, &[][..]), |(header, rest)| (*header, rest));

        Self {
            header: VdmHeader::from_raw(header),
            objects: rest.iter().copied().take(MAX_VDOS).collect(),
        }
    }

    /// A structured VDM.
    pub fn structured(header: StructuredHeader, objects: &[u32]) -> Self {
        Self {
            header: VdmHeader::Structured(header),
            objects: objects.iter().copied().take(MAX_VDOS).collect(),
        }
    }

    /// The structured header, if this is a structured VDM.
    pub fn structured_header(&self) -> Option<StructuredHeader> {
        match self.header {
            VdmHeader::Structured(header) => Some(header),
            VdmHeader::Unstructured(_) => None,
        }
    }
}

/// Product types, as reported in the ID header.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProductType {
    Undefined,
    Hub,
    Peripheral,
    PassiveCable,
    ActiveCable,
    AlternateModeAdapter,
    VconnPoweredDevice,
    Reserved,
}

impl From<u8> for ProductType {
    fn from(value: u8) -> Self {
        match value & 0b111 {
            0b000 => Self::Undefined,
            0b001 => Self::Hub,
            0b010 => Self::Peripheral,
            0b011 => Self::PassiveCable,
            0b100 => Self::ActiveCable,
            0b101 => Self::AlternateModeAdapter,
            0b110 => Self::VconnPoweredDevice,
            _ => Self::Reserved,
        }
    }
}

impl From<ProductType> for u8 {
    fn from(value: ProductType) -> Self {
        match value {
            ProductType::Undefined => 0b000,
            ProductType::Hub => 0b001,
            ProductType::Peripheral => 0b010,
            ProductType::PassiveCable => 0b011,
            ProductType::ActiveCable => 0b100,
            ProductType::AlternateModeAdapter => 0b101,
            ProductType::VconnPoweredDevice => 0b110,
            ProductType::Reserved => 0b111,
        }
    }
}

bitfield! {
    /// The ID header VDO.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct IdHeader(pub u32): Debug, FromStorage, IntoStorage {
        pub usb_host: bool @ 31,
        pub usb_device: bool @ 30,
        pub product_type_ufp: u8 [get ProductType, set ProductType] @ 27..=29,
        pub modal_operation: bool @ 26,
        pub product_type_dfp: u8 [get ProductType, set ProductType] @ 23..=25,
        pub connector_type: u8 @ 21..=22,
        pub vid: u16 @ 0..=15,
    }
}

bitfield! {
    /// The product VDO.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ProductVdo(pub u32): Debug, FromStorage, IntoStorage {
        pub pid: u16 @ 16..=31,
        pub bcd_device: u16 @ 0..=15,
    }
}

bitfield! {
    /// The VCONN powered device VDO.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct VpdVdo(pub u32): Debug, FromStorage, IntoStorage {
        pub hw_version: u8 @ 28..=31,
        pub fw_version: u8 @ 24..=27,
        pub vdo_version: u8 @ 21..=23,
        /// 20 V, 30 V, 40 V or 50 V.
        pub max_vbus_voltage: u8 @ 15..=16,
        /// Charge through current, 3 A (cleared) or 5 A (set).
        pub charge_through_5a: bool @ 14,
        /// Charge through VBUS impedance, in 2 mOhm units.
        pub vbus_impedance: u8 @ 7..=12,
        /// Ground impedance, in 1 mOhm units.
        pub ground_impedance: u8 @ 1..=6,
        pub charge_through_support: bool @ 0,
    }
}

/// The identity a port partner reports on Discover Identity.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Identity {
    /// The ID header VDO.
    pub id_header: IdHeader,
    /// The cert stat VDO (XID).
    pub cert_stat: u32,
    /// The product VDO.
    pub product: ProductVdo,
    /// Product type specific VDOs.
    pub product_type_vdos: Vec<u32, 3>,
}

impl Identity {
    /// Interpret the objects of a Discover Identity ACK.
    ///
    /// Returns `None` if the mandatory ID header, cert stat and product VDOs are missing.
    pub fn from_vdos(objects: &[u32]) -> Option<Self> {
        let [id_header, cert_stat, product, rest @ ..] = objects else {
            return None;
        };

        Some(Self {
            id_header: IdHeader(*id_header),
            cert_stat: *cert_stat,
            product: ProductVdo(*product),
            product_type_vdos: rest.iter().copied().take(3).collect(),
        })
    }

    /// The objects of a Discover Identity ACK.
    pub fn to_vdos(&self) -> Vec<u32, MAX_VDOS> {
        let mut objects = Vec::new();
        for object in [self.id_header.0, self.cert_stat, self.product.0]
            .into_iter()
            .chain(self.product_type_vdos.iter().copied())
        {
            // Three mandatory objects and at most three product type VDOs always fit.
            let _ = objects.push(object);
        }
        objects
    }
}

/// SVIDs from a Discover SVIDs ACK, in order, up to the terminating zero.
pub fn svids_from_vdos(objects: &[u32]) -> impl Iterator<Item = u16> + '_ {
    objects
        .iter()
        .flat_map(|object| [(*object >> 16) as u16, *object as u16])
        .take_while(|svid| *svid != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_identity_request_layout() {
        let header = StructuredHeader::new_request(PD_SID, Command::DiscoverIdentity);

        assert_eq!(header.0, 0xFF00_A001);
        assert_eq!(header.command(), Ok(Command::DiscoverIdentity));
        assert_eq!(header.response(CommandType::Ack).command_type(), CommandType::Ack);
    }

    #[test]
    fn reserved_command_is_not_a_panic() {
        let header = StructuredHeader(0xFF00_8000 | 0x0F);
        assert_eq!(header.command(), Err(0x0F));
    }

    #[test]
    fn identity_requires_mandatory_objects() {
        assert!(Identity::from_vdos(&[0x1, 0x2]).is_none());

        let identity = Identity::from_vdos(&[0x6C00_18D1, 0, 0x5012_0001, 0x1234]).unwrap();
        assert_eq!(identity.id_header.vid(), 0x18D1);
        assert_eq!(identity.id_header.product_type_ufp(), ProductType::AlternateModeAdapter);
        assert_eq!(identity.product.pid(), 0x5012);
        assert_eq!(&identity.to_vdos()[..], &[0x6C00_18D1, 0, 0x5012_0001, 0x1234]);
    }

    #[test]
    fn svid_list_stops_at_zero() {
        let svids: heapless::Vec<u16, 12> = svids_from_vdos(&[0xFF01_18D1, 0x8087_0000, 0x1234_5678]).collect();
        assert_eq!(&svids[..], &[0xFF01, 0x18D1, 0x8087]);
    }
}
