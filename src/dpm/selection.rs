//! Selection of the source capability that a sink requests.
use uom::si::electric_current::milliampere;
use uom::si::electric_potential::millivolt;

use crate::config::SinkCeiling;
use crate::protocol_layer::message::data::pdo::{Capabilities, PowerDataObject};
use crate::protocol_layer::message::data::request::PowerSource;
use crate::units::ElectricCurrent;

/// A capability that the sink may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    object_position: u8,
    voltage_mv: u32,
    current_ma: u32,
}

impl Candidate {
    fn power(&self) -> u64 {
        u64::from(self.voltage_mv) * u64::from(self.current_ma)
    }
}

/// Pick the capability with the highest power within the sink's ceiling.
///
/// Equal power is broken towards the lower voltage. Fixed and variable supplies are considered,
/// and the first (vSafe5V) object is the fallback, if nothing else fits.
pub fn select(capabilities: &Capabilities, ceiling: &SinkCeiling) -> Option<PowerSource> {
    let candidate = capabilities
        .pdos()
        .iter()
        .enumerate()
        .filter_map(|(index, pdo)| {
            let (voltage_mv, max_current_ma) = match pdo {
                PowerDataObject::FixedSupply(supply) => (
                    supply.voltage().get::<millivolt>(),
                    supply.max_current().get::<milliampere>(),
                ),
                PowerDataObject::VariableSupply(supply) if supply.max_voltage().get::<millivolt>() <= ceiling.max_voltage_mv => (
                    supply.min_voltage().get::<millivolt>(),
                    supply.max_current().get::<milliampere>(),
                ),
                _ => return None,
            };

            (voltage_mv <= ceiling.max_voltage_mv).then_some(Candidate {
                object_position: index as u8 + 1,
                voltage_mv,
                current_ma: max_current_ma.min(ceiling.max_current_ma),
            })
        })
        .max_by(|a, b| a.power().cmp(&b.power()).then(b.voltage_mv.cmp(&a.voltage_mv)));

    let candidate = match candidate {
        Some(candidate) => candidate,
        None => {
            let supply = capabilities.vsafe_5v()?;
            Candidate {
                object_position: 1,
                voltage_mv: supply.voltage().get::<millivolt>(),
                current_ma: supply.max_current().get::<milliampere>().min(ceiling.max_current_ma),
            }
        }
    };

    debug!(
        "Selected position {}: {} mV, {} mA",
        candidate.object_position,
        candidate.voltage_mv,
        candidate.current_ma
    );

    Some(
        PowerSource::new_fixed(
            candidate.object_position,
            ElectricCurrent::new::<milliampere>(ceiling.operating_current_ma.min(candidate.current_ma)),
            ElectricCurrent::new::<milliampere>(candidate.current_ma),
        )
        .with_capability_mismatch(ceiling.operating_current_ma > candidate.current_ma),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixed_capabilities;
    use crate::protocol_layer::message::data::request::FixedVariableSupply;

    fn ceiling(max_voltage_mv: u32, max_current_ma: u32) -> SinkCeiling {
        SinkCeiling {
            max_voltage_mv,
            max_current_ma,
            operating_current_ma: max_current_ma,
        }
    }

    fn fixed(request: PowerSource) -> FixedVariableSupply {
        match request {
            PowerSource::FixedVariableSupply(request) => request,
            _ => panic!("expected a fixed request"),
        }
    }

    #[test]
    fn highest_power_within_ceiling() {
        let capabilities = fixed_capabilities(&[(5_000, 500), (9_000, 2_000), (15_000, 3_000)]);

        let request = fixed(select(&capabilities, &ceiling(15_000, 3_000)).unwrap());
        assert_eq!(request.object_position(), 3);
        assert_eq!(request.operating_current().get::<milliampere>(), 3_000);
        assert!(!request.capability_mismatch());
    }

    #[test]
    fn voltage_ceiling_excludes_objects() {
        let capabilities = fixed_capabilities(&[(5_000, 500), (9_000, 2_000), (15_000, 3_000)]);

        let request = fixed(select(&capabilities, &ceiling(12_000, 3_000)).unwrap());
        assert_eq!(request.object_position(), 2);
        assert_eq!(request.max_operating_current().get::<milliampere>(), 2_000);
    }

    #[test]
    fn equal_power_prefers_lower_voltage() {
        // 15 W each.
        let capabilities = fixed_capabilities(&[(5_000, 3_000), (15_000, 1_000)]);

        let request = fixed(select(&capabilities, &ceiling(20_000, 3_000)).unwrap());
        assert_eq!(request.object_position(), 1);
    }

    #[test]
    fn falls_back_to_vsafe_5v() {
        let capabilities = fixed_capabilities(&[(5_000, 900)]);

        let request = fixed(select(&capabilities, &ceiling(3_300, 500)).unwrap());
        assert_eq!(request.object_position(), 1);
        assert_eq!(request.max_operating_current().get::<milliampere>(), 500);

        assert!(select(&Capabilities::default(), &ceiling(5_000, 500)).is_none());
    }

    #[test]
    fn operating_current_above_offer_is_a_mismatch() {
        let capabilities = fixed_capabilities(&[(5_000, 3_000), (9_000, 1_000)]);
        let ceiling = SinkCeiling {
            max_voltage_mv: 9_000,
            max_current_ma: 1_000,
            operating_current_ma: 2_000,
        };

        let request = fixed(select(&capabilities, &ceiling).unwrap());
        assert_eq!(request.object_position(), 2);
        assert!(request.capability_mismatch());
    }
}
