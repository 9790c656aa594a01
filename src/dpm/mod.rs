//! The device policy manager (DPM) allows a device to control the policy engine, and be informed about status changes.
//!
//! For example, through the DPM, a device can request certain source capabilities (voltage, current),
//! renegotiate the power contract, decide on swaps or choose an alternate mode.
pub mod selection;

use core::future::Future;

use crate::config::{SinkCeiling, SwapPolicy};
use crate::policy_engine::Contract;
use crate::policy_engine::swap::SwapKind;
use crate::protocol_layer::message::data::pdo::Capabilities;
use crate::protocol_layer::message::data::request::PowerSource;
use crate::protocol_layer::message::data::vdm::Identity;

/// Events that the device policy manager can send to the policy engine.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// Empty event.
    None,
    /// Request source capabilities (again), as a sink.
    RequestSourceCapabilities,
    /// Request a certain power level, as a sink.
    RequestPower(PowerSource),
    /// Advertise the source capabilities again, as a source.
    UpdateSourceCapabilities,
}

/// Trait for the device policy manager.
///
/// This entity commands the policy engine and enforces device policy.
pub trait DevicePolicyManager {
    /// Request a power source.
    ///
    /// Defaults to the highest power within the ceiling, see [`selection::select`].
    fn request(
        &mut self,
        source_capabilities: &Capabilities,
        ceiling: &SinkCeiling,
    ) -> impl Future<Output = Option<PowerSource>> {
        async move { selection::select(source_capabilities, ceiling) }
    }

    /// Notify the device that it shall transition to a new power level.
    ///
    /// As a sink, this is called once the source is ready. As a source, this is when the supply
    /// shall be adjusted, before PS_RDY is sent.
    fn transition_power(&mut self, _contract: &Contract) -> impl Future<Output = ()> {
        async {}
    }

    /// Notify the device of a hard reset. The contract is back to its default.
    fn hard_reset(&mut self) -> impl Future<Output = ()> {
        async {}
    }

    /// The policy engine gets and evaluates device policy events when ready.
    ///
    /// By default, this is a future that never resolves.
    fn get_event(&mut self) -> impl Future<Output = Event> {
        async { core::future::pending().await }
    }

    /// Decide on a swap that the port partner asked for.
    ///
    /// Defaults to the configured swap policy.
    fn evaluate_swap(&mut self, swap: SwapKind, policy: &SwapPolicy) -> impl Future<Output = bool> {
        let accept = policy.accepts(swap);
        async move { accept }
    }

    /// Inform the device about the identity of the port partner.
    fn identity_discovered(&mut self, _identity: &Identity) -> impl Future<Output = ()> {
        async {}
    }

    /// Choose one of the modes that the port partner offers for an SVID.
    ///
    /// Returns the one-based object position of the mode to enter, or `None` to enter no mode.
    /// Defaults to the first mode.
    fn choose_mode(&mut self, _svid: u16, modes: &[u32]) -> Option<u8> {
        (!modes.is_empty()).then_some(1)
    }

    /// Inform the device that an alternate mode was entered.
    fn mode_entered(&mut self, _svid: u16, _object_position: u8) -> impl Future<Output = ()> {
        async {}
    }
}
