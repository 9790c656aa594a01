//! Board configuration.
//!
//! Everything that differs between boards is data, handed to the port and arbiter constructors.
use heapless::Vec;
use typec_pd_traits::RpLevel;

use crate::PowerRole;
use crate::policy_engine::swap::SwapKind;
use crate::protocol_layer::message::data::pdo::{Capabilities, FixedSupply, PowerDataObject};
use crate::protocol_layer::message::data::vdm::{
    IdHeader, Identity, ProductType, ProductVdo, VpdVdo,
};

/// The largest number of ports that one arbiter manages.
pub const MAX_PORTS: usize = 8;

/// The largest number of discrete power levels per port.
pub const MAX_LEVELS: usize = 4;

/// The largest number of SVIDs a port may prefer.
pub const MAX_SVIDS: usize = 8;

/// The role a port takes on the Type-C level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TypeCRole {
    /// Sink only, always presents Rd.
    Sink,
    /// Source only, always presents Rp.
    Source,
    /// Toggles between Rd and Rp until a partner attaches.
    DualRole {
        /// The role to try for, when the partner is dual-role as well.
        try_role: Option<PowerRole>,
    },
}

impl TypeCRole {
    /// Whether the port may swap its power role.
    pub fn is_dual_role(&self) -> bool {
        matches!(self, Self::DualRole { .. })
    }
}

/// The most a sink accepts from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SinkCeiling {
    /// Highest acceptable voltage.
    pub max_voltage_mv: u32,
    /// Highest current the sink requests.
    pub max_current_ma: u32,
    /// Current the sink draws while operating.
    ///
    /// Larger than the offered current is reported as a capability mismatch.
    pub operating_current_ma: u32,
}

/// Which swaps a port accepts, when the port partner asks for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SwapPolicy {
    /// Power role swap.
    pub accept_pr_swap: bool,
    /// Data role swap.
    pub accept_dr_swap: bool,
    /// VCONN swap.
    pub accept_vconn_swap: bool,
}

impl SwapPolicy {
    /// Whether a swap of this kind is accepted.
    pub fn accepts(&self, swap: SwapKind) -> bool {
        match swap {
            SwapKind::PowerRole => self.accept_pr_swap,
            SwapKind::DataRole => self.accept_dr_swap,
            SwapKind::Vconn => self.accept_vconn_swap,
        }
    }
}

impl Default for SwapPolicy {
    fn default() -> Self {
        Self {
            accept_pr_swap: false,
            accept_dr_swap: true,
            accept_vconn_swap: true,
        }
    }
}

/// Configuration of one port.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortConfig {
    /// Type-C role.
    pub type_c_role: TypeCRole,
    /// Rp level that the port advertises as a source, before the arbiter limits it.
    pub rp_level: RpLevel,
    /// Capabilities that the port offers as a source.
    ///
    /// The first entry must be the vSafe5V fixed supply.
    pub source_capabilities: Capabilities,
    /// Capabilities that the port reports as a sink.
    pub sink_capabilities: Capabilities,
    /// Limits for the sink request.
    pub sink_ceiling: SinkCeiling,
    /// Identity that Discover Identity is answered with. Requests are NAKed without one.
    pub identity: Option<Identity>,
    /// SVIDs that the port supports, in order of preference.
    pub svids: Vec<u16, MAX_SVIDS>,
    /// Start discovery on entering a contract as DFP.
    pub auto_discovery: bool,
    /// Swap acceptance.
    pub swap_policy: SwapPolicy,
}

impl PortConfig {
    /// A 5 V sink, that accepts up to `max_voltage_mv` and `max_current_ma`.
    pub fn sink(max_voltage_mv: u32, max_current_ma: u32) -> Self {
        Self {
            type_c_role: TypeCRole::Sink,
            rp_level: RpLevel::Default,
            source_capabilities: Capabilities::default(),
            sink_capabilities: fixed_capabilities(&[(5_000, max_current_ma)]),
            sink_ceiling: SinkCeiling {
                max_voltage_mv,
                max_current_ma,
                operating_current_ma: max_current_ma,
            },
            identity: None,
            svids: Vec::new(),
            auto_discovery: false,
            swap_policy: SwapPolicy::default(),
        }
    }

    /// A source that offers the given fixed supplies, as (voltage, current) pairs.
    pub fn source(supplies: &[(u32, u32)]) -> Self {
        Self {
            type_c_role: TypeCRole::Source,
            rp_level: RpLevel::Current3A0,
            source_capabilities: fixed_capabilities(supplies),
            sink_capabilities: Capabilities::default(),
            sink_ceiling: SinkCeiling {
                max_voltage_mv: 5_000,
                max_current_ma: 0,
                operating_current_ma: 0,
            },
            identity: None,
            svids: Vec::new(),
            auto_discovery: true,
            swap_policy: SwapPolicy::default(),
        }
    }
}

/// Fixed supply capabilities from (voltage, current) pairs.
///
/// Entries beyond the seven that fit a message are ignored.
pub fn fixed_capabilities(supplies: &[(u32, u32)]) -> Capabilities {
    Capabilities(
        supplies
            .iter()
            .map(|(voltage_mv, current_ma)| PowerDataObject::FixedSupply(FixedSupply::new(*voltage_mv, *current_ma)))
            .take(crate::protocol_layer::message::data::MAX_DATA_OBJECTS)
            .collect(),
    )
}

/// How the arbiter steps ports down, when the rail is over-subscribed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Reduction {
    /// Step down one port at a time.
    #[default]
    OneAtATime,
    /// Step down all ports of the least important class together.
    Symmetric,
}

/// The share of the rail that one port may claim.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SlotConfig {
    /// Discrete power levels in mA, highest first. The last level is the floor.
    pub levels_ma: Vec<u32, MAX_LEVELS>,
    /// Higher is more important.
    pub priority: u8,
    /// Reservation while the port is disabled. Must not exceed the floor.
    pub default_ma: u32,
}

impl SlotConfig {
    /// A slot with the given levels, highest first.
    pub fn new(levels_ma: &[u32], priority: u8, default_ma: u32) -> Self {
        Self {
            levels_ma: levels_ma.iter().copied().take(MAX_LEVELS).collect(),
            priority,
            default_ma,
        }
    }

    /// The lowest level.
    pub fn floor_ma(&self) -> Option<u32> {
        self.levels_ma.last().copied()
    }
}

/// The shared rail.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BudgetConfig {
    /// Total capacity.
    pub capacity_ma: u32,
    /// Load that is always present.
    pub base_load_ma: u32,
    /// One slot per port, indexed by port ID.
    pub slots: Vec<SlotConfig, MAX_PORTS>,
    /// Reduction policy.
    pub reduction: Reduction,
}

/// Alert storm detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StormConfig {
    /// Alerts within one window, before the port is considered storming.
    pub max_count: u32,
    /// Length of the counting window.
    pub window_ms: u64,
    /// A pause this long ends a burst.
    pub idle_gap_ms: u64,
    /// Delay before a storming port is looked at again.
    pub resume_delay_ms: u64,
}

impl Default for StormConfig {
    fn default() -> Self {
        Self {
            max_count: 480,
            window_ms: 1000,
            idle_gap_ms: 10,
            resume_delay_ms: 1000,
        }
    }
}

/// Maximum VBUS voltage of a VCONN powered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MaxVbus {
    /// 20 V.
    #[default]
    V20,
    /// 30 V.
    V30,
    /// 40 V.
    V40,
    /// 50 V.
    V50,
}

/// Identity of a charge-through VCONN powered device.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VpdConfig {
    pub vid: u16,
    pub pid: u16,
    pub bcd_device: u16,
    /// XID, reported in the cert stat VDO.
    pub xid: u32,
    pub hw_version: u8,
    pub fw_version: u8,
    pub max_vbus: MaxVbus,
    /// Charge through current of 5 A instead of 3 A.
    pub charge_through_5a: bool,
    /// In 2 mOhm units.
    pub vbus_impedance: u8,
    /// In 1 mOhm units.
    pub ground_impedance: u8,
    pub charge_through_support: bool,
}

impl VpdConfig {
    /// The Discover Identity response.
    pub fn identity(&self) -> Identity {
        let vpd_vdo = VpdVdo(0)
            .with_hw_version(self.hw_version)
            .with_fw_version(self.fw_version)
            .with_vdo_version(1)
            .with_max_vbus_voltage(self.max_vbus as u8)
            .with_charge_through_5a(self.charge_through_5a)
            .with_vbus_impedance(self.vbus_impedance)
            .with_ground_impedance(self.ground_impedance)
            .with_charge_through_support(self.charge_through_support);

        let mut product_type_vdos = Vec::new();
        _ = product_type_vdos.push(vpd_vdo.0);

        Identity {
            id_header: IdHeader(0)
                .with_usb_device(true)
                .with_product_type_ufp(ProductType::VconnPoweredDevice)
                .with_vid(self.vid),
            cert_stat: self.xid,
            product: ProductVdo(0).with_pid(self.pid).with_bcd_device(self.bcd_device),
            product_type_vdos,
        }
    }
}
