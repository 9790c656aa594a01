//! USB Type-C and USB Power Delivery port management for `[no_std]` embedded controllers.
//!
//! Every physical connector runs its own cooperative task: a [`type_c`] attach state machine,
//! a [`protocol_layer`] and a policy (either the full [`policy_engine`] or the reduced
//! [`ctvpd`] variant). Ports only interact through the shared [`arbiter`], which divides a
//! physically limited rail between them. A single [`alert`] task turns port controller alerts
//! into per-port work, damping alert storms.
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

// This must go first, so that the other modules see its macros.
mod fmt;

#[macro_use]
extern crate uom;

pub mod alert;
pub mod arbiter;
pub mod config;
pub mod counters;
pub mod ctvpd;
pub mod dpm;
pub mod policy_engine;
pub mod port;
pub mod protocol_layer;
pub mod timers;
pub mod type_c;
pub mod units;

#[cfg(test)]
mod dummy;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
pub use typec_pd_traits::PortId;

/// Raw mutex used for all state shared between port tasks.
pub type GlobalRawMutex = CriticalSectionRawMutex;

/// The power role of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerRole {
    /// Provides VBUS.
    Source,
    /// Consumes VBUS.
    Sink,
}

impl PowerRole {
    /// The role of the port partner.
    pub fn opposite(self) -> Self {
        match self {
            Self::Source => Self::Sink,
            Self::Sink => Self::Source,
        }
    }
}

impl From<bool> for PowerRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Sink,
            true => Self::Source,
        }
    }
}

impl From<PowerRole> for bool {
    fn from(role: PowerRole) -> bool {
        match role {
            PowerRole::Sink => false,
            PowerRole::Source => true,
        }
    }
}

/// The data role of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataRole {
    /// Upstream facing port (device).
    Ufp,
    /// Downstream facing port (host).
    Dfp,
}

impl DataRole {
    /// The role of the port partner.
    pub fn opposite(self) -> Self {
        match self {
            Self::Ufp => Self::Dfp,
            Self::Dfp => Self::Ufp,
        }
    }
}

impl From<bool> for DataRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Ufp,
            true => Self::Dfp,
        }
    }
}

impl From<DataRole> for bool {
    fn from(role: DataRole) -> bool {
        match role {
            DataRole::Ufp => false,
            DataRole::Dfp => true,
        }
    }
}
