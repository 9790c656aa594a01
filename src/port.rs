//! Ports and the context that owns their shared state.
//!
//! Each port runs as its own task in [`Port::run`]. The task owns the port's Type-C state machine and
//! its policy. Everything that other tasks may touch lives in a [`PortShared`], inside the [`Context`]:
//! host requests, alerts from the dispatcher, the published status and the event log.
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::marker::PhantomData;

use embassy_futures::select::select;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::{Channel, TrySendError};
use embassy_sync::signal::Signal;
use heapless::Vec;
use typec_pd_traits::{Alert, TypeCPort};

use crate::arbiter::{PowerArbiter, SharedArbiter};
use crate::config::{BudgetConfig, MAX_PORTS, PortConfig};
use crate::policy_engine::event_log::{EVENT_LOG_LEN, EventLog, PeEvent};
use crate::policy_engine::swap::SwapKind;
use crate::policy_engine::{AltModeStatus, Contract, Error};
use crate::timers::Timer;
use crate::type_c::{Attach, TcEvent, TypeC, TypeCError};
use crate::{DataRole, GlobalRawMutex, PortId, PowerRole};

/// Host requests that may wait for a port.
pub const REQUEST_QUEUE_LEN: usize = 4;

/// Alerts that may wait for a port. The dispatcher holds back the rest.
pub const ALERT_QUEUE_LEN: usize = 8;

/// Delay before a port retries, after its controller failed.
const TCPC_RETRY_MS: u64 = 10;

/// Errors of the port API.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortError {
    /// No such port.
    #[error("unknown port {0:?}")]
    UnknownPort(PortId),
    /// The port did not take the previous requests yet.
    #[error("request queue full")]
    QueueFull,
    /// The port is suspended.
    #[error("port suspended")]
    Suspended,
}

/// A snapshot of a port, for telemetry and host commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortStatus {
    /// Whether a partner is attached.
    pub attached: bool,
    /// The power role, while attached.
    pub power_role: Option<PowerRole>,
    /// The data role, while attached.
    pub data_role: Option<DataRole>,
    /// The current contract.
    pub contract: Contract,
    /// Whether this port supplies VCONN.
    pub vconn_source: bool,
    /// Progress of alternate mode discovery.
    pub alt_mode: AltModeStatus,
}

impl PortStatus {
    /// The status of a port without partner.
    pub const fn detached() -> Self {
        Self {
            attached: false,
            power_role: None,
            data_role: None,
            contract: Contract::implicit(),
            vconn_source: false,
            alt_mode: AltModeStatus::NotStarted,
        }
    }
}

impl Default for PortStatus {
    fn default() -> Self {
        Self::detached()
    }
}

/// Requests of the host to a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortRequest {
    /// Initiate a swap.
    Swap(SwapKind),
    /// (Re-)run alternate mode discovery.
    Discovery,
    /// Initiate a hard reset.
    HardReset,
}

/// What became of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestOutcome {
    /// The port started it.
    Accepted,
    /// The port is in the middle of an exchange. Try again later.
    Busy,
    /// Not possible in the present role or state.
    Rejected,
}

/// Port state that other tasks may access.
pub struct PortShared {
    requests: Channel<GlobalRawMutex, PortRequest, REQUEST_QUEUE_LEN>,
    outcome: Signal<GlobalRawMutex, RequestOutcome>,
    alerts: Channel<GlobalRawMutex, Alert, ALERT_QUEUE_LEN>,
    /// Wakes the port task out of any wait that is not a protocol exchange.
    pub wake: Signal<GlobalRawMutex, ()>,
    status: Mutex<GlobalRawMutex, Cell<PortStatus>>,
    suspended: Mutex<GlobalRawMutex, Cell<bool>>,
    event_log: Mutex<GlobalRawMutex, RefCell<EventLog>>,
}

impl Default for PortShared {
    fn default() -> Self {
        Self::new()
    }
}

impl PortShared {
    /// Shared state of a detached, running port.
    pub const fn new() -> Self {
        Self {
            requests: Channel::new(),
            outcome: Signal::new(),
            alerts: Channel::new(),
            wake: Signal::new(),
            status: Mutex::new(Cell::new(PortStatus::detached())),
            suspended: Mutex::new(Cell::new(false)),
            event_log: Mutex::new(RefCell::new(EventLog::new())),
        }
    }

    /// The last published status.
    pub fn status(&self) -> PortStatus {
        self.status.lock(Cell::get)
    }

    pub(crate) fn set_status(&self, status: PortStatus) {
        self.status.lock(|cell| cell.set(status));
    }

    pub(crate) fn record(&self, event: PeEvent) {
        self.event_log.lock(|log| log.borrow_mut().push(event));
    }

    /// The recorded events, oldest first.
    pub fn event_log(&self) -> Vec<PeEvent, EVENT_LOG_LEN> {
        self.event_log.lock(|log| log.borrow().snapshot())
    }

    /// Whether the host suspended the port.
    pub fn is_suspended(&self) -> bool {
        self.suspended.lock(Cell::get)
    }

    fn set_suspended(&self, suspended: bool) {
        self.suspended.lock(|cell| cell.set(suspended));
        self.wake.signal(());
    }

    /// Hand an alert to the port task.
    ///
    /// Gives the alert back if the port's queue is full.
    pub fn post_alert(&self, alert: Alert) -> Result<(), Alert> {
        match self.alerts.try_send(alert) {
            Ok(()) => {
                self.wake.signal(());
                Ok(())
            }
            Err(TrySendError::Full(alert)) => Err(alert),
        }
    }

    /// The oldest alert that the port did not handle yet.
    pub fn take_alert(&self) -> Option<Alert> {
        self.alerts.try_receive().ok()
    }

    fn submit(&self, request: PortRequest) -> Result<(), PortError> {
        if self.is_suspended() {
            return Err(PortError::Suspended);
        }

        self.requests.try_send(request).map_err(|_| PortError::QueueFull)?;
        self.wake.signal(());
        Ok(())
    }
}

/// What a port task needs from the context.
#[derive(Clone, Copy)]
pub struct PortHandle<'a> {
    /// The port.
    pub id: PortId,
    /// The port's shared state.
    pub shared: &'a PortShared,
    /// The arbiter of all ports.
    pub arbiter: &'a SharedArbiter,
}

/// All ports of the controller, and the arbiter between them.
///
/// Ports are indexed by [`PortId`], in the order of the budget's slots.
pub struct Context {
    ports: Vec<PortShared, MAX_PORTS>,
    arbiter: SharedArbiter,
}

impl Context {
    /// Create the context, with one port per budget slot.
    pub fn new(budget: &BudgetConfig) -> Result<Self, crate::arbiter::ArbiterError> {
        let arbiter = PowerArbiter::new(budget)?;

        Ok(Self {
            ports: (0..arbiter.num_ports()).map(|_| PortShared::new()).collect(),
            arbiter: SharedArbiter::new(arbiter),
        })
    }

    /// The number of ports.
    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    /// The arbiter of all ports.
    pub fn arbiter(&self) -> &SharedArbiter {
        &self.arbiter
    }

    /// The shared state of a port.
    pub fn shared(&self, port: PortId) -> Result<&PortShared, PortError> {
        self.ports.get(port.index()).ok_or(PortError::UnknownPort(port))
    }

    /// The handle for a port's task.
    pub fn handle(&self, port: PortId) -> Result<PortHandle<'_>, PortError> {
        Ok(PortHandle {
            id: port,
            shared: self.shared(port)?,
            arbiter: &self.arbiter,
        })
    }

    /// Role, contract and alternate mode of a port.
    pub fn pd_get_state(&self, port: PortId) -> Result<PortStatus, PortError> {
        Ok(self.shared(port)?.status())
    }

    /// Ask a port to initiate a swap.
    ///
    /// The port takes the request when ready, see [`Self::request_outcome`].
    pub fn pd_request_swap(&self, port: PortId, swap: SwapKind) -> Result<(), PortError> {
        self.shared(port)?.submit(PortRequest::Swap(swap))
    }

    /// Ask a port to run alternate mode discovery.
    pub fn pd_request_discovery(&self, port: PortId) -> Result<(), PortError> {
        self.shared(port)?.submit(PortRequest::Discovery)
    }

    /// Ask a port for a hard reset.
    pub fn pd_hard_reset(&self, port: PortId) -> Result<(), PortError> {
        self.shared(port)?.submit(PortRequest::HardReset)
    }

    /// Wait for the outcome of the next request that the port takes.
    pub async fn request_outcome(&self, port: PortId) -> Result<RequestOutcome, PortError> {
        Ok(self.shared(port)?.outcome.wait().await)
    }

    /// Suspend or resume a port's task.
    ///
    /// Learned partner state survives the suspension.
    pub fn pd_set_suspend(&self, port: PortId, suspend: bool) -> Result<(), PortError> {
        info!("Port {}: suspend {}", port.0, suspend);
        self.shared(port)?.set_suspended(suspend);
        Ok(())
    }

    /// The recent policy events of a port, oldest first.
    pub fn event_log(&self, port: PortId) -> Result<Vec<PeEvent, EVENT_LOG_LEN>, PortError> {
        Ok(self.shared(port)?.event_log())
    }
}

/// The policy that runs on an attached port.
///
/// Implemented by the full [`crate::policy_engine::PolicyEngine`] and by the reduced
/// [`crate::ctvpd::CtvpdPolicy`]. The choice is made once, when the port is created.
pub trait PortPolicy {
    /// The port controller.
    type Driver: TypeCPort;

    /// Whether a suspended port stops entirely, or keeps running so that the policy can pause itself.
    const PARK_ON_SUSPEND: bool;

    /// The port controller, for the Type-C state machine.
    fn driver(&mut self) -> &mut Self::Driver;

    /// A partner attached.
    fn on_attach(&mut self, attach: Attach);

    /// The partner left, or the port went through error recovery.
    fn on_detach(&mut self);

    /// The host suspended or resumed the port.
    fn on_suspend(&mut self, _suspended: bool) {}

    /// Take a host request.
    fn handle_request(&mut self, request: PortRequest) -> RequestOutcome;

    /// Run one step, while attached.
    ///
    /// An error is fatal for the attachment, the port goes through error recovery.
    fn run_step(&mut self) -> impl Future<Output = Result<(), Error>>;

    /// The power role that the policy holds, while attached.
    ///
    /// After a power role swap, this differs from the attached role of the Type-C state machine.
    fn power_role(&self) -> Option<PowerRole>;

    /// Whether a loss of VBUS is expected, and is no detach.
    fn vbus_detach_suppressed(&self) -> bool {
        false
    }
}

/// The task of one port.
pub struct Port<'a, POLICY: PortPolicy, TIMER: Timer> {
    handle: PortHandle<'a>,
    type_c: TypeC,
    policy: POLICY,
    suspended: bool,
    _timer: PhantomData<TIMER>,
}

impl<'a, POLICY: PortPolicy, TIMER: Timer> Port<'a, POLICY, TIMER> {
    /// Create a port task.
    pub fn new(handle: PortHandle<'a>, config: &PortConfig, policy: POLICY) -> Self {
        Self {
            handle,
            type_c: TypeC::new(handle.id, config),
            policy,
            suspended: false,
            _timer: PhantomData,
        }
    }

    /// The port's policy.
    pub fn policy(&mut self) -> &mut POLICY {
        &mut self.policy
    }

    /// The port's Type-C state machine.
    pub fn type_c(&self) -> &TypeC {
        &self.type_c
    }

    fn apply(&mut self, event: Option<TcEvent>) {
        match event {
            Some(TcEvent::Attached(attach)) => self.policy.on_attach(attach),
            Some(TcEvent::Detached) => self.policy.on_detach(),
            None => (),
        }
    }

    /// Run the port forever.
    ///
    /// A failed port controller access is logged and the step retried after a delay.
    pub async fn run(&mut self) {
        loop {
            if let Err(error) = self.run_step().await {
                warn!("Port {}: {:?}, retrying", self.handle.id.0, error);
                TIMER::after_millis(TCPC_RETRY_MS).await;
            }
        }
    }

    /// Run a single step of the port.
    pub async fn run_step(&mut self) -> Result<(), TypeCError> {
        let shared = self.handle.shared;
        let arbiter = self.handle.arbiter;

        let suspended = shared.is_suspended();
        if suspended != self.suspended {
            self.suspended = suspended;
            self.policy.on_suspend(suspended);
        }

        if suspended && POLICY::PARK_ON_SUSPEND {
            shared.wake.wait().await;
            return Ok(());
        }

        let now = TIMER::now_millis();
        let previous = self.type_c.state();

        // Other alerts only wake the task. CC and VBUS changes are read by the Type-C step below,
        // received messages and transmit results reach the protocol layer through the driver.
        while let Some(alert) = shared.take_alert() {
            trace!("Port {}: alert {:?}", self.handle.id.0, alert);

            if alert.contains(Alert::FAULT) {
                let event = self.type_c.error_recovery(self.policy.driver(), arbiter, now).await?;
                self.apply(event);
            }
        }

        // A power role swap keeps the partner attached.
        if let (Some(attached), Some(current)) = (self.type_c.attached_role(), self.policy.power_role())
            && attached != current
        {
            self.type_c.power_role_swapped(current);
        }

        let suppressed = self.policy.vbus_detach_suppressed();
        let event = self.type_c.step(self.policy.driver(), arbiter, now, suppressed).await?;
        self.apply(event);

        while let Ok(request) = shared.requests.try_receive() {
            let outcome = self.policy.handle_request(request);
            debug!("Port {}: {:?} {:?}", self.handle.id.0, request, outcome);
            shared.outcome.signal(outcome);
        }

        if self.type_c.is_settled() {
            if let Err(error) = self.policy.run_step().await {
                error!("Port {}: {:?}", self.handle.id.0, error);
                let event = self
                    .type_c
                    .error_recovery(self.policy.driver(), arbiter, TIMER::now_millis())
                    .await?;
                self.apply(event);
            }
            return Ok(());
        }

        if self.type_c.state() != previous {
            return Ok(());
        }

        let deadline = self.type_c.next_deadline(now);
        let timeout = async {
            match deadline {
                Some(deadline) => TIMER::after_millis(deadline.saturating_sub(now)).await,
                None => core::future::pending().await,
            }
        };
        select(timeout, shared.wake.wait()).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use typec_pd_traits::{CcLevel, RoleControl};

    use super::*;
    use crate::config::{Reduction, SlotConfig};
    use crate::dummy::{ClockTimer, DummyDevicePolicyManager, DummyDriver};
    use crate::policy_engine::PolicyEngine;
    use crate::type_c::{CC_DEBOUNCE_MS, TypeCState, VBUS_POLL_MS};

    type TestPolicy<'a> = PolicyEngine<'a, DummyDriver, ClockTimer, DummyDevicePolicyManager>;

    fn budget() -> BudgetConfig {
        BudgetConfig {
            capacity_ma: 4_000,
            base_load_ma: 500,
            slots: [
                SlotConfig::new(&[3_000, 1_500], 1, 500),
                SlotConfig::new(&[3_000, 1_500], 1, 500),
            ]
            .into_iter()
            .collect(),
            reduction: Reduction::OneAtATime,
        }
    }

    fn sink_port<'a>(context: &'a Context, config: &'a PortConfig) -> Port<'a, TestPolicy<'a>, ClockTimer> {
        let handle = context.handle(PortId(0)).unwrap();
        let mut driver = DummyDriver::new();
        driver.cc = (CcLevel::RpDefault, CcLevel::Open);
        driver.vbus_present = true;

        Port::new(
            handle,
            config,
            PolicyEngine::new(handle, config, driver, DummyDevicePolicyManager::default()),
        )
    }

    /// Step until the Type-C state machine attached.
    async fn attach(port: &mut Port<'_, TestPolicy<'_>, ClockTimer>) {
        for _ in 0..4 {
            port.run_step().await.unwrap();
        }
        assert_eq!(port.type_c().attached_role(), Some(PowerRole::Sink));
    }

    #[test]
    fn unknown_port() {
        let context = Context::new(&budget()).unwrap();

        assert_eq!(context.num_ports(), 2);
        assert_eq!(
            context.pd_get_state(PortId(2)),
            Err(PortError::UnknownPort(PortId(2)))
        );
        assert!(context.pd_request_swap(PortId(5), SwapKind::DataRole).is_err());
    }

    #[test]
    fn request_queue_is_bounded() {
        let context = Context::new(&budget()).unwrap();

        for _ in 0..REQUEST_QUEUE_LEN {
            context.pd_request_discovery(PortId(1)).unwrap();
        }
        assert_eq!(context.pd_hard_reset(PortId(1)), Err(PortError::QueueFull));
    }

    #[test]
    fn suspended_port_refuses_requests() {
        let context = Context::new(&budget()).unwrap();

        context.pd_set_suspend(PortId(0), true).unwrap();
        assert_eq!(
            context.pd_request_swap(PortId(0), SwapKind::Vconn),
            Err(PortError::Suspended)
        );

        context.pd_set_suspend(PortId(0), false).unwrap();
        assert!(context.pd_request_swap(PortId(0), SwapKind::Vconn).is_ok());
    }

    #[tokio::test]
    async fn sink_attach_is_published() {
        let context = Context::new(&budget()).unwrap();
        let config = PortConfig::sink(15_000, 3_000);
        let mut port = sink_port(&context, &config);

        attach(&mut port).await;

        let status = context.pd_get_state(PortId(0)).unwrap();
        assert!(status.attached);
        assert_eq!(status.power_role, Some(PowerRole::Sink));
        assert_eq!(status.data_role, Some(DataRole::Ufp));
        assert_eq!(status.contract, Contract::implicit());
        assert_eq!(context.event_log(PortId(0)).unwrap()[0], PeEvent::Attached(PowerRole::Sink));

        // The other port is untouched.
        assert_eq!(context.pd_get_state(PortId(1)).unwrap(), PortStatus::detached());
    }

    #[tokio::test]
    async fn busy_port_answers_requests() {
        let context = Context::new(&budget()).unwrap();
        let config = PortConfig::sink(15_000, 3_000);
        let mut port = sink_port(&context, &config);

        attach(&mut port).await;

        // Still waiting for capabilities, so the swap must wait.
        context.pd_request_swap(PortId(0), SwapKind::DataRole).unwrap();
        port.run_step().await.unwrap();
        assert_eq!(context.request_outcome(PortId(0)).await, Ok(RequestOutcome::Busy));
    }

    #[tokio::test]
    async fn suspended_port_parks() {
        let context = Context::new(&budget()).unwrap();
        let config = PortConfig::sink(15_000, 3_000);
        let mut port = sink_port(&context, &config);

        context.pd_set_suspend(PortId(0), true).unwrap();
        port.run_step().await.unwrap();
        assert!(port.policy().driver().role_control.is_empty());

        context.pd_set_suspend(PortId(0), false).unwrap();
        port.run_step().await.unwrap();
        assert_eq!(
            port.policy().driver().last_role_control().map(|(role, _)| role),
            Some(RoleControl::Rd)
        );
    }

    #[tokio::test]
    async fn fault_alert_forces_error_recovery() {
        let context = Context::new(&budget()).unwrap();
        let config = PortConfig::sink(15_000, 3_000);
        let mut port = sink_port(&context, &config);

        attach(&mut port).await;

        context.shared(PortId(0)).unwrap().post_alert(Alert::FAULT).unwrap();
        port.run_step().await.unwrap();

        assert!(!context.pd_get_state(PortId(0)).unwrap().attached);
        assert_eq!(
            port.policy().driver().last_role_control().map(|(role, _)| role),
            Some(RoleControl::Open)
        );
        assert_eq!(context.event_log(PortId(0)).unwrap().last(), Some(&PeEvent::Detached));
    }

    #[tokio::test]
    async fn waiting_for_vbus_lets_time_pass() {
        let context = Context::new(&budget()).unwrap();
        let config = PortConfig::sink(15_000, 3_000);
        let mut port = sink_port(&context, &config);
        port.policy().driver().vbus_present = false;

        let start = ClockTimer::now_millis();
        for _ in 0..20 {
            port.run_step().await.unwrap();
        }

        assert!(matches!(port.type_c().state(), TypeCState::AttachWaitSink { .. }));
        assert!(ClockTimer::now_millis() >= start + CC_DEBOUNCE_MS + 10 * VBUS_POLL_MS);

        port.policy().driver().vbus_present = true;
        port.run_step().await.unwrap();
        assert_eq!(port.type_c().attached_role(), Some(PowerRole::Sink));
    }

    #[tokio::test]
    async fn port_continues_after_controller_error() {
        let context = Context::new(&budget()).unwrap();
        let config = PortConfig::sink(15_000, 3_000);
        let mut port = sink_port(&context, &config);
        port.policy().driver().cc_failures = 1;

        // Present Rd, then fail to read CC.
        port.run_step().await.unwrap();
        assert_eq!(
            port.run_step().await,
            Err(TypeCError::Tcpc(typec_pd_traits::TcpcError::Bus))
        );

        attach(&mut port).await;
    }
}
