//! Implements dummy drivers, timers and device policy managers for testing.
use std::cell::Cell;
use std::collections::VecDeque;
use std::future::pending;
use std::vec::Vec;

use typec_pd_traits::{
    Alert, AlertSource, CcLevel, Driver, DriverRxError, DriverTxError, Polarity, PortId, RoleControl, RpLevel,
    TcpcError, TypeCPort,
};

use crate::dpm::{DevicePolicyManager, Event};
use crate::policy_engine::Contract;
use crate::protocol_layer::MAX_MESSAGE_SIZE;
use crate::timers::Timer;

/// A timer that never expires.
pub struct DummyTimer {}

impl Timer for DummyTimer {
    async fn after_millis(_milliseconds: u64) {
        // Never time out
        pending().await
    }

    fn now_millis() -> u64 {
        0
    }
}

/// A timer that expires immediately.
pub struct ExpiringTimer {}

impl Timer for ExpiringTimer {
    async fn after_millis(_milliseconds: u64) {}

    fn now_millis() -> u64 {
        0
    }
}

std::thread_local! {
    static NOW: Cell<u64> = const { Cell::new(0) };
}

/// A timer whose clock only moves when it is waited for. Every test thread has its own clock.
pub struct ClockTimer {}

impl ClockTimer {
    /// Move the clock forward.
    pub fn advance(milliseconds: u64) {
        NOW.with(|now| now.set(now.get() + milliseconds));
    }
}

impl Timer for ClockTimer {
    async fn after_millis(milliseconds: u64) {
        Self::advance(milliseconds);
    }

    fn now_millis() -> u64 {
        NOW.with(Cell::get)
    }
}

/// A device policy manager that replays scripted events and records what it was told.
#[derive(Default)]
pub struct DummyDevicePolicyManager {
    pub events: VecDeque<Event>,
    pub transitions: Vec<Contract>,
    pub hard_resets: usize,
    pub entered_modes: Vec<(u16, u8)>,
}

impl DevicePolicyManager for DummyDevicePolicyManager {
    async fn transition_power(&mut self, contract: &Contract) {
        self.transitions.push(*contract);
    }

    async fn hard_reset(&mut self) {
        self.hard_resets += 1;
    }

    async fn get_event(&mut self) -> Event {
        match self.events.pop_front() {
            Some(event) => event,
            None => pending().await,
        }
    }

    async fn mode_entered(&mut self, svid: u16, object_position: u8) {
        self.entered_modes.push((svid, object_position));
    }
}

type Frame = heapless::Vec<u8, MAX_MESSAGE_SIZE>;

/// A dummy port controller.
///
/// With `AUTO_GOOD_CRC`, the hardware acknowledges messages, so tests need not inject GoodCRC.
pub struct DummyDriver<const AUTO_GOOD_CRC: bool = true> {
    rx_vec: VecDeque<Frame>,
    tx_vec: VecDeque<Frame>,
    pub hard_resets: usize,
    pub cc: (CcLevel, CcLevel),
    pub vbus_present: bool,
    pub vbus_source: bool,
    pub vbus_sink: bool,
    pub vconn: bool,
    pub polarity: Option<Polarity>,
    pub role_control: Vec<(RoleControl, RpLevel)>,
    pub vbus_source_log: Vec<bool>,
    /// The number of CC reads that fail.
    pub cc_failures: usize,
}

impl<const AUTO_GOOD_CRC: bool> DummyDriver<AUTO_GOOD_CRC> {
    /// Create a new dummy driver.
    pub fn new() -> Self {
        Self {
            rx_vec: VecDeque::new(),
            tx_vec: VecDeque::new(),
            hard_resets: 0,
            cc: (CcLevel::Open, CcLevel::Open),
            vbus_present: false,
            vbus_source: false,
            vbus_sink: false,
            vconn: false,
            polarity: None,
            role_control: Vec::new(),
            vbus_source_log: Vec::new(),
            cc_failures: 0,
        }
    }

    /// Inject received data that can be retrieved later.
    pub fn inject_received_data(&mut self, data: &[u8]) {
        self.rx_vec.push_back(Frame::from_slice(data).unwrap());
    }

    /// Take the oldest frame that was transmitted by the stack.
    pub fn take_transmitted_data(&mut self) -> Frame {
        self.tx_vec.pop_front().unwrap()
    }

    /// Whether untaken transmitted data is left.
    pub fn has_transmitted_data(&self) -> bool {
        !self.tx_vec.is_empty()
    }

    /// The number of transmitted, not yet taken frames.
    pub fn transmitted_count(&self) -> usize {
        self.tx_vec.len()
    }

    /// Drop all transmitted frames.
    pub fn clear_transmitted_data(&mut self) {
        self.tx_vec.clear();
    }

    /// The pull that was presented last.
    pub fn last_role_control(&self) -> Option<(RoleControl, RpLevel)> {
        self.role_control.last().copied()
    }
}

impl<const AUTO_GOOD_CRC: bool> Driver for DummyDriver<AUTO_GOOD_CRC> {
    const HAS_AUTO_GOOD_CRC: bool = AUTO_GOOD_CRC;

    async fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, DriverRxError> {
        let Some(frame) = self.rx_vec.pop_front() else {
            return pending().await;
        };

        buffer[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }

    async fn transmit(&mut self, data: &[u8]) -> Result<(), DriverTxError> {
        self.tx_vec.push_back(Frame::from_slice(data).unwrap());
        Ok(())
    }

    async fn transmit_hard_reset(&mut self) -> Result<(), DriverTxError> {
        self.hard_resets += 1;
        Ok(())
    }

    async fn wait_for_vbus(&self) {
        // Do nothing.
    }
}

impl<const AUTO_GOOD_CRC: bool> TypeCPort for DummyDriver<AUTO_GOOD_CRC> {
    async fn get_cc(&mut self) -> Result<(CcLevel, CcLevel), TcpcError> {
        if self.cc_failures > 0 {
            self.cc_failures -= 1;
            return Err(TcpcError::Bus);
        }

        Ok(self.cc)
    }

    async fn set_role_control(&mut self, role: RoleControl, rp: RpLevel) -> Result<(), TcpcError> {
        self.role_control.push((role, rp));
        Ok(())
    }

    async fn set_polarity(&mut self, polarity: Polarity) -> Result<(), TcpcError> {
        self.polarity = Some(polarity);
        Ok(())
    }

    async fn set_vconn(&mut self, enable: bool) -> Result<(), TcpcError> {
        self.vconn = enable;
        Ok(())
    }

    async fn set_vbus_source(&mut self, enable: bool) -> Result<(), TcpcError> {
        self.vbus_source = enable;
        self.vbus_source_log.push(enable);
        Ok(())
    }

    async fn set_vbus_sink(&mut self, enable: bool) -> Result<(), TcpcError> {
        self.vbus_sink = enable;
        Ok(())
    }

    async fn vbus_present(&mut self) -> Result<bool, TcpcError> {
        Ok(self.vbus_present)
    }
}

/// A dummy alert line, with a scripted queue of alert register values per port.
#[derive(Default)]
pub struct DummyAlertSource {
    pending: Vec<VecDeque<Alert>>,
    pub cleared: Vec<(PortId, Alert)>,
    /// The next read of this port fails.
    pub fail_next_read: Option<PortId>,
}

impl DummyAlertSource {
    /// Create an alert source for a number of ports.
    pub fn new(num_ports: usize) -> Self {
        Self {
            pending: (0..num_ports).map(|_| VecDeque::new()).collect(),
            cleared: Vec::new(),
            fail_next_read: None,
        }
    }

    /// Queue an alert register value for a port.
    pub fn inject(&mut self, port: PortId, alert: Alert) {
        self.pending[port.index()].push_back(alert);
    }
}

impl AlertSource for DummyAlertSource {
    async fn wait_for_alert(&mut self) {
        if self.pending.iter().all(VecDeque::is_empty) {
            pending::<()>().await
        }
    }

    async fn read_alert_status(&mut self, port: PortId) -> Result<Alert, TcpcError> {
        if self.fail_next_read == Some(port) {
            self.fail_next_read = None;
            return Err(TcpcError::Bus);
        }

        let queue = self.pending.get_mut(port.index()).ok_or(TcpcError::Bus)?;
        Ok(queue.pop_front().unwrap_or(Alert::NONE))
    }

    async fn clear_alert(&mut self, port: PortId, alert: Alert) -> Result<(), TcpcError> {
        self.cleared.push((port, alert));
        Ok(())
    }
}
