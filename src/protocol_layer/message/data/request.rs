//! Request data objects, by which a sink selects one of the source's power data objects.
//!
//! See [6.4.2].
use proc_bitfield::bitfield;
use uom::si::electric_current::milliampere;
use uom::si::electric_potential::millivolt;
use uom::si::power::milliwatt;

use super::pdo::{Capabilities, PowerDataObject};
use crate::units::{ElectricCurrent, ElectricPotential, Power};

bitfield! {
    /// A request data object, before it is matched against the capabilities it refers to.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct RawRequest(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14
        pub object_position: u8 @ 28..=31,
    }
}

bitfield! {
    /// Request for a fixed or variable supply.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct FixedVariableSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14
        pub object_position: u8 @ 28..=31,
        pub giveback_flag: bool @ 27,
        pub capability_mismatch: bool @ 26,
        pub usb_communications_capable: bool @ 25,
        pub no_usb_suspend: bool @ 24,
        pub unchunked_extended_messages_supported: bool @ 23,
        pub epr_mode_capable: bool @ 22,
        /// Operating current in 10 mA units
        pub raw_operating_current: u16 @ 10..=19,
        /// Maximum operating current in 10 mA units
        pub raw_max_operating_current: u16 @ 0..=9,
    }
}

impl FixedVariableSupply {
    /// The current the sink will draw.
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<milliampere>(u32::from(self.raw_operating_current()) * 10)
    }

    /// The largest current the sink may draw.
    pub fn max_operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<milliampere>(u32::from(self.raw_max_operating_current()) * 10)
    }
}

bitfield! {
    /// Request for a battery supply.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Battery(pub u32): Debug, FromStorage, IntoStorage {
        /// Object position (0000b and 1110b…1111b are Reserved and Shall Not be used)
        pub object_position: u8 @ 28..=31,
        pub giveback_flag: bool @ 27,
        pub capability_mismatch: bool @ 26,
        pub usb_communications_capable: bool @ 25,
        pub no_usb_suspend: bool @ 24,
        /// Operating power in 250 mW units
        pub raw_operating_power: u16 @ 10..=19,
        /// Maximum operating power in 250 mW units
        pub raw_max_operating_power: u16 @ 0..=9,
    }
}

impl Battery {
    /// The power the sink will draw.
    pub fn operating_power(&self) -> Power {
        Power::new::<milliwatt>(u32::from(self.raw_operating_power()) * 250)
    }
}

bitfield! {
    /// Request for a programmable power supply.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Programmable(pub u32): Debug, FromStorage, IntoStorage {
        /// Object position (0000b and 1110b…1111b are Reserved and Shall Not be used)
        pub object_position: u8 @ 28..=31,
        pub capability_mismatch: bool @ 26,
        pub usb_communications_capable: bool @ 25,
        pub no_usb_suspend: bool @ 24,
        /// Output voltage in 20 mV units
        pub raw_output_voltage: u16 @ 9..=20,
        /// Operating current in 50 mA units
        pub raw_operating_current: u16 @ 0..=6,
    }
}

impl Programmable {
    /// The requested output voltage.
    pub fn output_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<millivolt>(u32::from(self.raw_output_voltage()) * 20)
    }

    /// The current the sink will draw.
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<milliampere>(u32::from(self.raw_operating_current()) * 50)
    }
}

/// A request, interpreted against the capabilities it refers to.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerSource {
    /// Fixed or variable supply.
    FixedVariableSupply(FixedVariableSupply),
    /// Battery supply.
    Battery(Battery),
    /// Programmable supply.
    Programmable(Programmable),
}

impl PowerSource {
    /// Interpret a raw request against the capabilities that were advertised.
    ///
    /// Returns `None` if the object position does not refer to an advertised object.
    pub fn from_raw(raw: RawRequest, capabilities: &Capabilities) -> Option<Self> {
        match capabilities.at_position(raw.object_position())? {
            PowerDataObject::FixedSupply(_) | PowerDataObject::VariableSupply(_) => {
                Some(Self::FixedVariableSupply(FixedVariableSupply(raw.0)))
            }
            PowerDataObject::Battery(_) => Some(Self::Battery(Battery(raw.0))),
            PowerDataObject::Programmable(_) => Some(Self::Programmable(Programmable(raw.0))),
            PowerDataObject::Unknown(_) => None,
        }
    }

    /// Request a fixed supply at a one-based object position.
    pub fn new_fixed(object_position: u8, operating_current: ElectricCurrent, max_current: ElectricCurrent) -> Self {
        let raw_current = |current: ElectricCurrent| (current.get::<milliampere>() / 10).min(0x3ff) as u16;

        Self::FixedVariableSupply(
            FixedVariableSupply(0)
                .with_object_position(object_position)
                .with_raw_operating_current(raw_current(operating_current))
                .with_raw_max_operating_current(raw_current(max_current))
                .with_no_usb_suspend(true)
                .with_usb_communications_capable(true),
        )
    }

    /// Flag that the offered capabilities do not cover the sink's needs.
    pub fn with_capability_mismatch(self, mismatch: bool) -> Self {
        match self {
            Self::FixedVariableSupply(request) => Self::FixedVariableSupply(request.with_capability_mismatch(mismatch)),
            Self::Battery(request) => Self::Battery(request.with_capability_mismatch(mismatch)),
            Self::Programmable(request) => Self::Programmable(request.with_capability_mismatch(mismatch)),
        }
    }

    /// The one-based position of the requested object.
    pub fn object_position(&self) -> u8 {
        match self {
            Self::FixedVariableSupply(request) => request.object_position(),
            Self::Battery(request) => request.object_position(),
            Self::Programmable(request) => request.object_position(),
        }
    }

    /// The raw request data object.
    pub fn to_raw(&self) -> RawRequest {
        RawRequest(match self {
            Self::FixedVariableSupply(request) => request.0,
            Self::Battery(request) => request.0,
            Self::Programmable(request) => request.0,
        })
    }

    /// The operating current, where the request specifies one.
    pub fn operating_current(&self) -> Option<ElectricCurrent> {
        match self {
            Self::FixedVariableSupply(request) => Some(request.operating_current()),
            Self::Programmable(request) => Some(request.operating_current()),
            Self::Battery(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_layer::message::data::pdo::FixedSupply;

    #[test]
    fn fixed_request_refers_to_position() {
        let capabilities = Capabilities::from_raw(&[FixedSupply::new(5_000, 3_000).0, FixedSupply::new(9_000, 2_000).0]);
        let request = PowerSource::new_fixed(
            2,
            ElectricCurrent::new::<milliampere>(2_000),
            ElectricCurrent::new::<milliampere>(2_000),
        );

        let parsed = PowerSource::from_raw(request.to_raw(), &capabilities);
        assert_eq!(parsed, Some(request));
        assert_eq!(request.operating_current().map(|c| c.get::<milliampere>()), Some(2_000));

        let out_of_range = RawRequest(0).with_object_position(3);
        assert_eq!(PowerSource::from_raw(out_of_range, &capabilities), None);
    }
}
