//! Power data objects, as advertised in source and sink capabilities.
//!
//! See [6.4.1].
use heapless::Vec;
use proc_bitfield::bitfield;
use uom::si::electric_current::milliampere;
use uom::si::electric_potential::millivolt;
use uom::si::power::milliwatt;

use super::MAX_DATA_OBJECTS;
use crate::units::{ElectricCurrent, ElectricPotential, Power};

bitfield! {
    /// A raw power data object, used to tell the kinds apart.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct RawPowerDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// The kind of power data object.
        pub kind: u8 @ 30..=31,
        /// The kind of augmented power data object.
        pub augmented_kind: u8 @ 28..=29,
    }
}

bitfield! {
    /// A fixed voltage supply PDO.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct FixedSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Fixed supply
        pub kind: u8 @ 30..=31,
        /// Dual-role power
        pub dual_role_power: bool @ 29,
        /// USB suspend supported (source), higher capability (sink)
        pub usb_suspend_supported: bool @ 28,
        /// Unconstrained power
        pub unconstrained_power: bool @ 27,
        /// USB communications capable
        pub usb_communications_capable: bool @ 26,
        /// Dual-role data
        pub dual_role_data: bool @ 25,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 24,
        /// Peak current
        pub peak_current: u8 @ 20..=21,
        /// Voltage in 50 mV units
        pub raw_voltage: u16 @ 10..=19,
        /// Maximum (source) or operational (sink) current in 10 mA units
        pub raw_max_current: u16 @ 0..=9,
    }
}

impl FixedSupply {
    /// A fixed supply at the given voltage and current, without any flags.
    pub fn new(voltage_mv: u32, current_ma: u32) -> Self {
        Self(0)
            .with_raw_voltage((voltage_mv / 50) as u16)
            .with_raw_max_current((current_ma / 10).min(0x3ff) as u16)
    }

    /// The supply voltage.
    pub fn voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<millivolt>(u32::from(self.raw_voltage()) * 50)
    }

    /// The maximum current.
    pub fn max_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<milliampere>(u32::from(self.raw_max_current()) * 10)
    }
}

bitfield! {
    /// A battery supply PDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Battery(pub u32): Debug, FromStorage, IntoStorage {
        /// Battery
        pub kind: u8 @ 30..=31,
        /// Maximum Voltage in 50 mV units
        pub raw_max_voltage: u16 @ 20..=29,
        /// Minimum Voltage in 50 mV units
        pub raw_min_voltage: u16 @ 10..=19,
        /// Maximum Allowable Power in 250 mW units
        pub raw_max_power: u16 @ 0..=9,
    }
}

impl Battery {
    /// The maximum voltage.
    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<millivolt>(u32::from(self.raw_max_voltage()) * 50)
    }

    /// The minimum voltage.
    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<millivolt>(u32::from(self.raw_min_voltage()) * 50)
    }

    /// The maximum power.
    pub fn max_power(&self) -> Power {
        Power::new::<milliwatt>(u32::from(self.raw_max_power()) * 250)
    }
}

bitfield! {
    /// A variable (non-battery) supply PDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct VariableSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Variable supply
        pub kind: u8 @ 30..=31,
        /// Maximum Voltage in 50 mV units
        pub raw_max_voltage: u16 @ 20..=29,
        /// Minimum Voltage in 50 mV units
        pub raw_min_voltage: u16 @ 10..=19,
        /// Maximum current in 10 mA units
        pub raw_max_current: u16 @ 0..=9,
    }
}

impl VariableSupply {
    /// The maximum voltage.
    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<millivolt>(u32::from(self.raw_max_voltage()) * 50)
    }

    /// The minimum voltage.
    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<millivolt>(u32::from(self.raw_min_voltage()) * 50)
    }

    /// The maximum current.
    pub fn max_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<milliampere>(u32::from(self.raw_max_current()) * 10)
    }
}

bitfield! {
    /// A programmable power supply APDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ProgrammableSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Augmented power data object
        pub kind: u8 @ 30..=31,
        /// SPR programmable power supply
        pub supply: u8 @ 28..=29,
        /// Power limited
        pub pps_power_limited: bool @ 27,
        /// Maximum voltage in 100 mV increments
        pub raw_max_voltage: u8 @ 17..=24,
        /// Minimum Voltage in 100 mV increments
        pub raw_min_voltage: u8 @ 8..=15,
        /// Maximum Current in 50 mA increments
        pub raw_max_current: u8 @ 0..=6,
    }
}

impl ProgrammableSupply {
    /// The maximum voltage.
    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<millivolt>(u32::from(self.raw_max_voltage()) * 100)
    }

    /// The minimum voltage.
    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<millivolt>(u32::from(self.raw_min_voltage()) * 100)
    }

    /// The maximum current.
    pub fn max_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<milliampere>(u32::from(self.raw_max_current()) * 50)
    }
}

/// A power data object holds information about one type of capability.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerDataObject {
    /// Fixed voltage supply.
    FixedSupply(FixedSupply),
    /// Battery supply.
    Battery(Battery),
    /// Variable voltage supply.
    VariableSupply(VariableSupply),
    /// SPR programmable power supply.
    Programmable(ProgrammableSupply),
    /// Any other augmented or reserved kind.
    Unknown(RawPowerDataObject),
}

impl PowerDataObject {
    /// Interpret a raw data object.
    pub fn from_raw(raw: u32) -> Self {
        let pdo = RawPowerDataObject(raw);
        match (pdo.kind(), pdo.augmented_kind()) {
            (0b00, _) => Self::FixedSupply(FixedSupply(raw)),
            (0b01, _) => Self::Battery(Battery(raw)),
            (0b10, _) => Self::VariableSupply(VariableSupply(raw)),
            (0b11, 0b00) => Self::Programmable(ProgrammableSupply(raw)),
            _ => Self::Unknown(pdo),
        }
    }

    /// The raw data object.
    pub fn to_raw(&self) -> u32 {
        match self {
            Self::FixedSupply(pdo) => pdo.0,
            Self::Battery(pdo) => pdo.0,
            Self::VariableSupply(pdo) => pdo.0,
            Self::Programmable(pdo) => pdo.0,
            Self::Unknown(pdo) => pdo.0,
        }
    }

    /// The maximum current of this object, where it advertises one.
    pub fn max_current(&self) -> Option<ElectricCurrent> {
        match self {
            Self::FixedSupply(pdo) => Some(pdo.max_current()),
            Self::VariableSupply(pdo) => Some(pdo.max_current()),
            Self::Programmable(pdo) => Some(pdo.max_current()),
            Self::Battery(_) | Self::Unknown(_) => None,
        }
    }
}

/// An ordered list of power data objects.
///
/// The first entry is always the vSafe5V fixed supply. Object positions, as used by requests,
/// start at one.
#[derive(Clone, Debug, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Capabilities(pub Vec<PowerDataObject, MAX_DATA_OBJECTS>);

impl Capabilities {
    /// Interpret a list of raw data objects.
    pub fn from_raw(objects: &[u32]) -> Self {
        Self(objects.iter().map(|raw| PowerDataObject::from_raw(*raw)).collect())
    }

    /// The vSafe5V supply, if the first object is one.
    pub fn vsafe_5v(&self) -> Option<&FixedSupply> {
        self.0.first().and_then(|supply| match supply {
            PowerDataObject::FixedSupply(supply) => Some(supply),
            _ => None,
        })
    }

    /// Whether the port partner is dual-role power capable.
    pub fn dual_role_power(&self) -> bool {
        self.vsafe_5v().map(FixedSupply::dual_role_power).unwrap_or_default()
    }

    /// Whether the port partner is dual-role data capable.
    pub fn dual_role_data(&self) -> bool {
        self.vsafe_5v().map(FixedSupply::dual_role_data).unwrap_or_default()
    }

    /// The object at a one-based object position.
    pub fn at_position(&self, object_position: u8) -> Option<&PowerDataObject> {
        usize::from(object_position)
            .checked_sub(1)
            .and_then(|index| self.0.get(index))
    }

    /// All power data objects.
    pub fn pdos(&self) -> &[PowerDataObject] {
        &self.0
    }

    /// Copy of these capabilities, where no object advertises more than `limit`.
    ///
    /// Used by sources whose share of a common rail was reduced.
    pub fn limited_to(&self, limit: ElectricCurrent) -> Self {
        let limit_ma = limit.get::<milliampere>();
        Self(
            self.0
                .iter()
                .map(|pdo| match pdo {
                    PowerDataObject::FixedSupply(supply) if supply.max_current() > limit => {
                        PowerDataObject::FixedSupply(supply.with_raw_max_current((limit_ma / 10) as u16))
                    }
                    PowerDataObject::VariableSupply(supply) if supply.max_current() > limit => {
                        PowerDataObject::VariableSupply(supply.with_raw_max_current((limit_ma / 10) as u16))
                    }
                    PowerDataObject::Programmable(supply) if supply.max_current() > limit => {
                        PowerDataObject::Programmable(supply.with_raw_max_current((limit_ma / 50) as u8))
                    }
                    other => *other,
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_supply_units() {
        let supply = FixedSupply::new(15_000, 3_000);

        assert_eq!(supply.raw_voltage(), 300);
        assert_eq!(supply.raw_max_current(), 300);
        assert_eq!(supply.voltage().get::<millivolt>(), 15_000);
        assert_eq!(supply.max_current().get::<milliampere>(), 3_000);
    }

    #[test]
    fn kinds_are_told_apart() {
        // Fixed 5 V at 3 A, PPS 3.3-11 V at 5 A.
        let capabilities = Capabilities::from_raw(&[0x0801_912C, 0xC8DC_2164]);

        assert!(matches!(capabilities.pdos()[0], PowerDataObject::FixedSupply(_)));
        let PowerDataObject::Programmable(pps) = capabilities.pdos()[1] else {
            panic!("expected a programmable supply");
        };
        assert_eq!(pps.max_voltage().get::<millivolt>(), 11_000);
        assert_eq!(pps.min_voltage().get::<millivolt>(), 3_300);
        assert_eq!(pps.max_current().get::<milliampere>(), 5_000);
        assert!(capabilities.at_position(0).is_none());
        assert!(capabilities.at_position(3).is_none());
    }

    #[test]
    fn limited_capabilities_cap_current() {
        let capabilities = Capabilities::from_raw(&[
            FixedSupply::new(5_000, 3_000).0,
            FixedSupply::new(9_000, 1_000).0,
        ]);

        let limited = capabilities.limited_to(ElectricCurrent::new::<milliampere>(1_500));

        assert_eq!(limited.pdos()[0].max_current().map(|c| c.get::<milliampere>()), Some(1_500));
        assert_eq!(limited.pdos()[1].max_current().map(|c| c.get::<milliampere>()), Some(1_000));
    }
}
