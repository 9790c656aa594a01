//! Shared power budget arbitration.
//!
//! All ports draw from one physically limited rail. The arbiter keeps a ledger of every port's
//! reservation and re-balances it whenever a port changes state. Reservations are granted before
//! the electrical change happens, never after.
//!
//! Granting is two-phase. Besides its allocation, each port has a confirmed draw: the current that
//! its partner may actually take under the present contract or pull-up. A port that was reduced keeps
//! its confirmed draw until it renegotiated and the partner had time to adjust. A port only raises
//! its own draw into capacity that no other port still draws from.
//!
//! [`PowerArbiter`] is the pure ledger, [`SharedArbiter`] makes it accessible to all port tasks.
use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use heapless::Vec;

use crate::config::{BudgetConfig, MAX_PORTS, Reduction, SlotConfig};
use crate::{GlobalRawMutex, PortId};

/// Arbiter errors.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ArbiterError {
    /// No slot exists for this port.
    #[error("unknown port {0:?}")]
    UnknownPort(PortId),
    /// A slot has no levels, or its levels are not strictly descending, or its default exceeds its floor.
    #[error("invalid slot for port {0:?}")]
    InvalidSlot(PortId),
    /// The rail cannot hold the base load and every port at its floor.
    #[error("budget of {capacity_ma} mA cannot hold {required_ma} mA at the lowest levels")]
    InvalidBudget {
        /// Rail capacity.
        capacity_ma: u32,
        /// Base load plus every floor.
        required_ma: u32,
    },
    /// The ledger exceeds the rail capacity. This is a logic fault.
    #[error("ledger over-allocated by {0} mA")]
    OverAllocated(u32),
}

/// How busy a port is. Less busy ports are reduced first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Activity {
    /// Attached, but drawing little.
    Idle,
    /// Holding a contract.
    Active,
    /// In the middle of a negotiation.
    Negotiating,
}

/// The state of one port, as far as the ledger is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotState {
    /// Nothing attached. The slot keeps its default reservation.
    Disabled,
    /// Attached, asking for `demand_ma`.
    Enabled {
        /// Reduction class.
        activity: Activity,
        /// The current the port would like to have.
        demand_ma: u32,
    },
}

/// The outcome of a ledger update.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Grant {
    /// The allocation of the port that was updated.
    pub allocated_ma: u32,
    /// Other ports, whose allocation changed, with their new allocation.
    pub changes: Vec<(PortId, u32), MAX_PORTS>,
}

#[derive(Debug, Clone)]
struct Slot {
    config: SlotConfig,
    state: SlotState,
    level: usize,
    drawn_ma: u32,
}

impl Slot {
    fn allocation_at(&self, level: usize) -> u32 {
        match self.state {
            SlotState::Disabled => self.config.default_ma,
            SlotState::Enabled { demand_ma, .. } => self
                .config
                .levels_ma
                .get(level)
                .copied()
                .unwrap_or_default()
                .min(demand_ma),
        }
    }

    fn allocation(&self) -> u32 {
        self.allocation_at(self.level)
    }

    /// The next lower level that actually reduces the allocation.
    fn next_reduction(&self) -> Option<usize> {
        let SlotState::Enabled { .. } = self.state else {
            return None;
        };

        let current = self.allocation();
        (self.level + 1..self.config.levels_ma.len()).find(|level| self.allocation_at(*level) < current)
    }

    fn class(&self) -> Option<(Activity, u8)> {
        match self.state {
            SlotState::Disabled => None,
            SlotState::Enabled { activity, .. } => Some((activity, self.config.priority)),
        }
    }
}

/// The power budget ledger.
#[derive(Debug, Clone)]
pub struct PowerArbiter {
    capacity_ma: u32,
    base_load_ma: u32,
    reduction: Reduction,
    slots: Vec<Slot, MAX_PORTS>,
}

impl PowerArbiter {
    /// Create a ledger with all ports disabled.
    ///
    /// Fails if the budget could not hold every port at its floor, because then some
    /// combination of port states would have no safe allocation.
    pub fn new(config: &BudgetConfig) -> Result<Self, ArbiterError> {
        let mut required_ma = config.base_load_ma;

        for (index, slot) in config.slots.iter().enumerate() {
            let port = PortId(index as u8);
            let floor_ma = slot.floor_ma().ok_or(ArbiterError::InvalidSlot(port))?;

            if slot.levels_ma.windows(2).any(|pair| pair[0] <= pair[1]) || slot.default_ma > floor_ma {
                return Err(ArbiterError::InvalidSlot(port));
            }

            required_ma = required_ma.saturating_add(floor_ma);
        }

        if required_ma > config.capacity_ma {
            return Err(ArbiterError::InvalidBudget {
                capacity_ma: config.capacity_ma,
                required_ma,
            });
        }

        Ok(Self {
            capacity_ma: config.capacity_ma,
            base_load_ma: config.base_load_ma,
            reduction: config.reduction,
            slots: config
                .slots
                .iter()
                .map(|config| Slot {
                    config: config.clone(),
                    state: SlotState::Disabled,
                    level: 0,
                    drawn_ma: config.default_ma,
                })
                .collect(),
        })
    }

    /// The number of ports in the ledger.
    pub fn num_ports(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, port: PortId) -> Result<&Slot, ArbiterError> {
        self.slots.get(port.index()).ok_or(ArbiterError::UnknownPort(port))
    }

    /// The present allocation of a port.
    pub fn allocated_ma(&self, port: PortId) -> Result<u32, ArbiterError> {
        Ok(self.slot(port)?.allocation())
    }

    /// The present state of a port.
    pub fn state(&self, port: PortId) -> Result<SlotState, ArbiterError> {
        Ok(self.slot(port)?.state)
    }

    /// The confirmed draw of a port.
    pub fn drawn_ma(&self, port: PortId) -> Result<u32, ArbiterError> {
        Ok(self.slot(port)?.drawn_ma)
    }

    /// The most a port may draw right now.
    ///
    /// This is its allocation, unless ports that were reduced still draw more than theirs.
    pub fn drawable_ma(&self, port: PortId) -> Result<u32, ArbiterError> {
        let slot = self.slot(port)?;
        let others_ma: u64 = self
            .slots
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != port.index())
            .map(|(_, slot)| u64::from(slot.drawn_ma))
            .sum();
        let spare_ma = u64::from(self.capacity_ma).saturating_sub(u64::from(self.base_load_ma) + others_ma);

        Ok(slot.allocation().min(u32::try_from(spare_ma).unwrap_or(u32::MAX)))
    }

    /// Raise the confirmed draw of a port, before its partner may take more.
    ///
    /// Returns `false` if other ports still draw the capacity, the port must wait.
    pub fn raise_draw(&mut self, port: PortId, drawn_ma: u32) -> Result<bool, ArbiterError> {
        let current_ma = self.slot(port)?.drawn_ma;

        if drawn_ma <= current_ma {
            return Ok(true);
        }
        if drawn_ma > self.drawable_ma(port)? {
            debug!("Port {} waits for {} mA", port.0, drawn_ma);
            return Ok(false);
        }

        self.slots[port.index()].drawn_ma = drawn_ma;
        Ok(true)
    }

    /// Lower the confirmed draw of a port, after its partner adjusted to a lower contract.
    ///
    /// Returns the ports that wait for more than they draw, with their allocation.
    pub fn lower_draw(&mut self, port: PortId, drawn_ma: u32) -> Result<Vec<(PortId, u32), MAX_PORTS>, ArbiterError> {
        let slot = self.slots.get_mut(port.index()).ok_or(ArbiterError::UnknownPort(port))?;
        slot.drawn_ma = slot.drawn_ma.min(drawn_ma);

        let mut waiting = self.waiting();
        waiting.retain(|(other, _)| *other != port);
        Ok(waiting)
    }

    fn waiting(&self) -> Vec<(PortId, u32), MAX_PORTS> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.allocation() > slot.drawn_ma)
            .map(|(index, slot)| (PortId(index as u8), slot.allocation()))
            .collect()
    }

    fn reserved_ma(&self) -> u64 {
        u64::from(self.base_load_ma) + self.slots.iter().map(|slot| u64::from(slot.allocation())).sum::<u64>()
    }

    /// Spare capacity, negative if over-allocated.
    pub fn headroom_ma(&self) -> i64 {
        i64::from(self.capacity_ma) - self.reserved_ma() as i64
    }

    /// Change the state of a port and re-balance all allocations.
    pub fn update(&mut self, port: PortId, state: SlotState) -> Result<Grant, ArbiterError> {
        if port.index() >= self.slots.len() {
            return Err(ArbiterError::UnknownPort(port));
        }

        let before: Vec<u32, MAX_PORTS> = self.slots.iter().map(Slot::allocation).collect();
        let slot = &mut self.slots[port.index()];
        slot.state = state;
        if state == SlotState::Disabled {
            // The port turned its supply off.
            slot.drawn_ma = slot.drawn_ma.min(slot.config.default_ma);
        }
        self.rebalance();
        self.verify()?;

        let changes = self
            .slots
            .iter()
            .zip(before.iter())
            .enumerate()
            .filter(|(index, (slot, before))| *index != port.index() && slot.allocation() != **before)
            .map(|(index, (slot, _))| (PortId(index as u8), slot.allocation()))
            .collect();

        Ok(Grant {
            allocated_ma: self.slots[port.index()].allocation(),
            changes,
        })
    }

    /// Give up a port's reservation, down to its default.
    ///
    /// The port must have turned its supply off.
    pub fn release(&mut self, port: PortId) -> Result<Grant, ArbiterError> {
        self.update(port, SlotState::Disabled)
    }

    /// The allocation a port would get right now, if it asked for `demand_ma`.
    ///
    /// The ledger is not changed.
    pub fn available_ma(&self, port: PortId, activity: Activity, demand_ma: u32) -> Result<u32, ArbiterError> {
        let mut trial = self.clone();
        Ok(trial
            .update(port, SlotState::Enabled { activity, demand_ma })?
            .allocated_ma)
    }

    /// Check that the ledger fits the rail.
    pub fn verify(&self) -> Result<(), ArbiterError> {
        let headroom_ma = self.headroom_ma();

        if headroom_ma < 0 {
            error!("Power ledger over-allocated by {} mA", -headroom_ma);
            Err(ArbiterError::OverAllocated(headroom_ma.unsigned_abs() as u32))
        } else {
            Ok(())
        }
    }

    /// Start every port at its highest level, then step down until the ledger fits.
    ///
    /// Idle ports are reduced before active ones, active before negotiating ones. Within one
    /// activity, lower priority goes first, and among equal priorities the highest port index.
    fn rebalance(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.level = 0;
        }

        while self.headroom_ma() < 0 {
            let Some((class, index)) = self
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.next_reduction().is_some())
                .filter_map(|(index, slot)| slot.class().map(|class| (class, index)))
                .min_by_key(|(class, index)| (*class, core::cmp::Reverse(*index)))
            else {
                // Not reachable for a validated budget.
                break;
            };

            match self.reduction {
                Reduction::OneAtATime => self.step_down(index),
                Reduction::Symmetric => {
                    for index in 0..self.slots.len() {
                        if self.slots[index].class() == Some(class) {
                            self.step_down(index);
                        }
                    }
                }
            }
        }

        trace!("Power ledger headroom {} mA", self.headroom_ma());
    }

    fn step_down(&mut self, index: usize) {
        if let Some(level) = self.slots[index].next_reduction() {
            debug!("Port {} stepped down to level {}", index, level);
            self.slots[index].level = level;
        }
    }
}

/// The ledger, shared between all port tasks.
///
/// Ledger access happens inside a short critical section, so two ports that attach at the same
/// time can not both pass the budget check against a stale snapshot.
pub struct SharedArbiter {
    inner: Mutex<GlobalRawMutex, RefCell<PowerArbiter>>,
    budget_changed: [Signal<GlobalRawMutex, u32>; MAX_PORTS],
}

impl SharedArbiter {
    /// Share a ledger.
    pub fn new(arbiter: PowerArbiter) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(arbiter)),
            budget_changed: core::array::from_fn(|_| Signal::new()),
        }
    }

    /// Change the state of a port.
    ///
    /// Returns the port's allocation. Other ports whose allocation changed are notified.
    pub fn update(&self, port: PortId, state: SlotState) -> Result<u32, ArbiterError> {
        let grant = self.inner.lock(|arbiter| arbiter.borrow_mut().update(port, state))?;

        debug!("Port {} granted {} mA", port.0, grant.allocated_ma);
        for (other, allocated_ma) in grant.changes {
            debug!("Port {} re-balanced to {} mA", other.0, allocated_ma);
            self.budget_changed[other.index()].signal(allocated_ma);
        }

        Ok(grant.allocated_ma)
    }

    /// Give up a port's reservation, after its supply was turned off.
    pub fn release(&self, port: PortId) -> Result<u32, ArbiterError> {
        let allocated_ma = self.update(port, SlotState::Disabled)?;
        let waiting = self.inner.lock(|arbiter| arbiter.borrow().waiting());
        self.notify(&waiting);

        Ok(allocated_ma)
    }

    fn notify(&self, ports: &[(PortId, u32)]) {
        for (port, allocated_ma) in ports {
            if let Some(signal) = self.budget_changed.get(port.index()) {
                signal.signal(*allocated_ma);
            }
        }
    }

    /// Raise the confirmed draw of a port, see [`PowerArbiter::raise_draw`].
    pub fn raise_draw(&self, port: PortId, drawn_ma: u32) -> Result<bool, ArbiterError> {
        self.inner.lock(|arbiter| arbiter.borrow_mut().raise_draw(port, drawn_ma))
    }

    /// Lower the confirmed draw of a port, and wake the ports that waited for it.
    pub fn lower_draw(&self, port: PortId, drawn_ma: u32) -> Result<(), ArbiterError> {
        let waiting = self
            .inner
            .lock(|arbiter| arbiter.borrow_mut().lower_draw(port, drawn_ma))?;
        self.notify(&waiting);
        Ok(())
    }

    /// The confirmed draw of a port.
    pub fn drawn_ma(&self, port: PortId) -> Result<u32, ArbiterError> {
        self.inner.lock(|arbiter| arbiter.borrow().drawn_ma(port))
    }

    /// The most a port may draw right now.
    pub fn drawable_ma(&self, port: PortId) -> Result<u32, ArbiterError> {
        self.inner.lock(|arbiter| arbiter.borrow().drawable_ma(port))
    }

    /// The allocation a port would get, if it asked for `demand_ma` now.
    pub fn available_ma(&self, port: PortId, activity: Activity, demand_ma: u32) -> Result<u32, ArbiterError> {
        self.inner
            .lock(|arbiter| arbiter.borrow().available_ma(port, activity, demand_ma))
    }

    /// The present allocation of a port.
    pub fn allocated_ma(&self, port: PortId) -> Result<u32, ArbiterError> {
        self.inner.lock(|arbiter| arbiter.borrow().allocated_ma(port))
    }

    /// Spare rail capacity.
    pub fn headroom_ma(&self) -> i64 {
        self.inner.lock(|arbiter| arbiter.borrow().headroom_ma())
    }

    /// Wait until another port's change moved this port's allocation, or freed capacity that
    /// this port waited for.
    ///
    /// Resolves to the allocation.
    pub async fn budget_changed(&self, port: PortId) -> u32 {
        match self.budget_changed.get(port.index()) {
            Some(signal) => signal.wait().await,
            None => core::future::pending().await,
        }
    }
}
