//! Port controller traits for the typec-pd stack.
//!
//! A port controller (TCPC) driver implements [`Driver`] for the PD message path and [`TypeCPort`] for
//! the CC/VBUS/VCONN controls of one connector. A board implements [`AlertSource`] once, for the
//! shared alert line of all its port controllers.
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
use core::future::Future;
use core::ops::{BitOr, BitOrAssign};

/// Index of a physical USB-C connector.
///
/// Port identifiers are handed out by the port arena at initialization and are the only way
/// to address per-port state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortId(pub u8);

impl PortId {
    /// The port index as an arena position.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Receive Error.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverRxError {
    /// Received message discarded, e.g. due to CRC errors.
    Discarded,

    /// Hard Reset received before or during reception.
    HardReset,
}

/// Transmit Error.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverTxError {
    /// Concurrent receive in progress or excessive noise on the line.
    Discarded,

    /// Hard Reset received before or during transmission.
    HardReset,
}

/// Errors of the port controller register interface.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TcpcError {
    /// The bus transaction towards the port controller failed.
    #[error("port controller bus error")]
    Bus,
    /// The port controller does not support the requested operation.
    #[error("operation not supported by the port controller")]
    Unsupported,
}

/// Driver trait, through which the protocol layer talks to the PHY.
pub trait Driver {
    /// If this is `true`, the protocol layer will not send its own
    /// GoodCRC messages and will instead rely on the hardware.
    const HAS_AUTO_GOOD_CRC: bool = false;

    /// Wait for availability of VBus voltage.
    fn wait_for_vbus(&self) -> impl Future<Output = ()>;

    /// Receive a packet.
    fn receive(&mut self, buffer: &mut [u8]) -> impl Future<Output = Result<usize, DriverRxError>>;

    /// Transmit a packet.
    ///
    /// Resolves once the packet left the PHY, which is the "message sent" notification.
    fn transmit(&mut self, data: &[u8]) -> impl Future<Output = Result<(), DriverTxError>>;

    /// Transmit a hard reset signal.
    fn transmit_hard_reset(&mut self) -> impl Future<Output = Result<(), DriverTxError>>;
}

/// Termination as seen on one CC line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcLevel {
    /// Nothing attached.
    Open,
    /// Cable or VCONN-powered accessory pull-down.
    Ra,
    /// Sink pull-down.
    Rd,
    /// Source advertising default USB current.
    RpDefault,
    /// Source advertising 1.5 A.
    Rp1A5,
    /// Source advertising 3.0 A.
    Rp3A0,
}

impl CcLevel {
    /// Whether a source pull-up is present.
    pub fn is_rp(self) -> bool {
        matches!(self, Self::RpDefault | Self::Rp1A5 | Self::Rp3A0)
    }
}

/// Pull presented on both CC lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RoleControl {
    /// Sink pull-downs.
    Rd,
    /// Source pull-ups, at the given [`RpLevel`].
    Rp,
    /// Both lines open, as during error recovery.
    Open,
}

/// Current advertisement of a source pull-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RpLevel {
    /// Default USB power.
    Default,
    /// 1.5 A.
    Current1A5,
    /// 3.0 A.
    Current3A0,
}

/// Plug orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Polarity {
    /// Communication on CC1.
    Cc1,
    /// Communication on CC2.
    Cc2,
}

/// Type-C line controls of one port controller.
pub trait TypeCPort {
    /// Measure both CC lines.
    fn get_cc(&mut self) -> impl Future<Output = Result<(CcLevel, CcLevel), TcpcError>>;

    /// Select the pull presented on both CC lines.
    fn set_role_control(&mut self, role: RoleControl, rp: RpLevel) -> impl Future<Output = Result<(), TcpcError>>;

    /// Select the CC line used for communication.
    fn set_polarity(&mut self, polarity: Polarity) -> impl Future<Output = Result<(), TcpcError>>;

    /// Source VCONN on the unused CC line.
    fn set_vconn(&mut self, enable: bool) -> impl Future<Output = Result<(), TcpcError>>;

    /// Source VBUS.
    fn set_vbus_source(&mut self, enable: bool) -> impl Future<Output = Result<(), TcpcError>>;

    /// Sink from VBUS.
    fn set_vbus_sink(&mut self, enable: bool) -> impl Future<Output = Result<(), TcpcError>>;

    /// Whether VBUS is above vSafe5V (min).
    fn vbus_present(&mut self) -> impl Future<Output = Result<bool, TcpcError>>;
}

/// Contents of a port controller alert register.
///
/// Bit positions follow the TCPCI alert register. A value of zero means no events are pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Alert(pub u16);

impl Alert {
    /// No events pending.
    pub const NONE: Self = Self(0);
    /// CC line status changed.
    pub const CC_STATUS: Self = Self(1 << 0);
    /// Power status (VBUS present, VCONN present) changed.
    pub const POWER_STATUS: Self = Self(1 << 1);
    /// A message was received.
    pub const RX_STATUS: Self = Self(1 << 2);
    /// Hard reset signaling was received.
    pub const RX_HARD_RESET: Self = Self(1 << 3);
    /// Transmission failed, no GoodCRC.
    pub const TX_FAILED: Self = Self(1 << 4);
    /// Transmission discarded.
    pub const TX_DISCARDED: Self = Self(1 << 5);
    /// Transmission succeeded, GoodCRC received.
    pub const TX_SUCCESS: Self = Self(1 << 6);
    /// A fault was detected.
    pub const FAULT: Self = Self(1 << 9);
    /// The receive buffer overflowed.
    pub const RX_BUFFER_OVERFLOW: Self = Self(1 << 10);
    /// VBUS dropped below the sink disconnect threshold.
    pub const VBUS_SINK_DISCONNECT: Self = Self(1 << 11);

    /// Whether no events are pending.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether all events of `other` are pending.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any event of `other` is pending.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Alert {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Alert {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// The shared alert line of all port controllers.
pub trait AlertSource {
    /// Wait until any port controller asserts its alert.
    fn wait_for_alert(&mut self) -> impl Future<Output = ()>;

    /// Read the alert register of one port controller.
    fn read_alert_status(&mut self, port: PortId) -> impl Future<Output = Result<Alert, TcpcError>>;

    /// Acknowledge the given alert bits.
    fn clear_alert(&mut self, port: PortId, alert: Alert) -> impl Future<Output = Result<(), TcpcError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_bits_combine() {
        let mut alert = Alert::CC_STATUS;
        alert |= Alert::RX_STATUS;

        assert!(alert.contains(Alert::CC_STATUS));
        assert!(alert.intersects(Alert::RX_STATUS | Alert::FAULT));
        assert!(!alert.contains(Alert::FAULT));
        assert!(Alert::NONE.is_empty());
    }
}
