//! Policy engine of a USB PD port, in either power role.
//!
//! The engine advances by one state per [`PolicyEngine::run_step`]. Source states are implemented in
//! `source`, sink states in `sink`, role swaps in [`swap`] and structured VDM discovery in `vdm`.
//! Each port owns one engine, which only reaches other ports through the shared arbiter.
pub mod event_log;
mod sink;
mod source;
pub mod swap;
mod vdm;


use heapless::Vec;
use typec_pd_traits::{Driver, PortId, TcpcError, TypeCPort};

use crate::arbiter::ArbiterError;
use crate::config::PortConfig;
use crate::counters::{Counter, CounterType};
use crate::dpm::DevicePolicyManager;
use crate::port::{PortHandle, PortPolicy, PortRequest, PortStatus, RequestOutcome};
use crate::protocol_layer::message::Message;
use crate::protocol_layer::message::data::Data;
use crate::protocol_layer::message::data::pdo::Capabilities;
use crate::protocol_layer::message::data::vdm::{Identity, Vdm};
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::{ProtocolError, ProtocolLayer, RxError, TxError};
use crate::timers::{Timer, TimerType};
use crate::type_c::Attach;
use crate::{DataRole, PowerRole};
use event_log::PeEvent;
use sink::SinkState;
use source::SourceState;
use swap::{Swap, SwapKind};
use vdm::DiscoveryState;

/// Voltage of the implicit contract.
pub const DEFAULT_VOLTAGE_MV: u32 = 5_000;

/// Current of the implicit contract.
pub const DEFAULT_CURRENT_MA: u32 = 500;

/// The number of partner SVIDs that are remembered.
pub const MAX_PARTNER_SVIDS: usize = 24;

/// The power contract between the port and its partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Contract {
    /// Negotiated voltage.
    pub voltage_mv: u32,
    /// Negotiated operating current.
    pub current_ma: u32,
    /// Whether the contract was negotiated, rather than implied by attachment.
    pub explicit: bool,
    /// Position of the negotiated object in the source capabilities, zero when implicit.
    pub object_position: u8,
}

impl Contract {
    /// The vSafe5V contract that holds before negotiation and after every reset.
    pub const fn implicit() -> Self {
        Self {
            voltage_mv: DEFAULT_VOLTAGE_MV,
            current_ma: DEFAULT_CURRENT_MA,
            explicit: false,
            object_position: 0,
        }
    }
}

impl Default for Contract {
    fn default() -> Self {
        Self::implicit()
    }
}

/// Progress of alternate mode discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AltModeStatus {
    /// Discovery did not run since the last reset.
    #[default]
    NotStarted,
    /// Discovery is running.
    InProgress,
    /// The partner has no mode that this port supports.
    NoMode,
    /// A mode was entered.
    Entered {
        /// The SVID of the mode.
        svid: u16,
        /// The object position of the mode.
        object_position: u8,
    },
    /// The partner refused, or did not answer.
    Failed,
}

/// Errors that end the policy engine's operation on the current attachment.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The port partner is unresponsive.
    #[error("port partner unresponsive")]
    PortPartnerUnresponsive,
    /// A protocol error has occured.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The port controller failed.
    #[error("port controller error: {0}")]
    Tcpc(#[from] TcpcError),
    /// The power arbiter refused.
    #[error("arbiter error: {0}")]
    Arbiter(#[from] ArbiterError),
}

/// Top level states.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum State {
    /// Nothing attached.
    Disabled,
    Source(SourceState),
    Sink(SinkState),
    Swap(Swap),
    Discovery(DiscoveryState),
    /// Answer a VDM of the partner.
    RespondVdm(Vdm),
}

#[derive(Debug)]
struct Counters {
    caps: Counter,
    hard_reset: Counter,
    busy: Counter,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            caps: Counter::new(CounterType::Caps),
            hard_reset: Counter::new(CounterType::HardReset),
            busy: Counter::new(CounterType::Busy),
        }
    }
}

/// What is known about the partner's identity and modes.
#[derive(Debug, Default)]
struct Discovery {
    status: AltModeStatus,
    identity: Option<Identity>,
    svids: Vec<u16, MAX_PARTNER_SVIDS>,
}

/// The policy engine of one USB PD port.
///
/// See [8.3.3.2] for the source and [8.3.3.3] for the sink.
pub struct PolicyEngine<'a, DRIVER: Driver + TypeCPort, TIMER: Timer, DPM: DevicePolicyManager> {
    port: PortHandle<'a>,
    config: &'a PortConfig,
    protocol_layer: ProtocolLayer<DRIVER, TIMER>,
    dpm: DPM,
    state: State,
    attached: bool,
    power_role: PowerRole,
    data_role: DataRole,
    vconn_source: bool,
    /// Whether VCONN was supplied on attach, and shall be restored after a hard reset.
    vconn_on_attach: bool,
    contract: Contract,
    counters: Counters,
    /// Capabilities of the partner, as a sink.
    source_capabilities: Option<Capabilities>,
    /// Capabilities that were last advertised, as a source.
    advertised: Capabilities,
    discovery: Discovery,
    hard_reset_in_progress: bool,
}

impl<'a, DRIVER: Driver + TypeCPort, TIMER: Timer, DPM: DevicePolicyManager> PolicyEngine<'a, DRIVER, TIMER, DPM> {
    /// Create a policy engine for a port, which stays disabled until attached.
    pub fn new(port: PortHandle<'a>, config: &'a PortConfig, driver: DRIVER, dpm: DPM) -> Self {
        let header = Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R3_X);

        Self {
            port,
            config,
            protocol_layer: ProtocolLayer::new(driver, header),
            dpm,
            state: State::Disabled,
            attached: false,
            power_role: PowerRole::Sink,
            data_role: DataRole::Ufp,
            vconn_source: false,
            vconn_on_attach: false,
            contract: Contract::implicit(),
            counters: Counters::default(),
            source_capabilities: None,
            advertised: Capabilities::default(),
            discovery: Discovery::default(),
            hard_reset_in_progress: false,
        }
    }

    /// The port that this engine runs.
    pub fn port_id(&self) -> PortId {
        self.port.id
    }

    /// The current contract.
    pub fn contract(&self) -> Contract {
        self.contract
    }

    /// The device policy manager.
    pub fn dpm(&mut self) -> &mut DPM {
        &mut self.dpm
    }

    /// A snapshot of the port's state.
    pub fn status(&self) -> PortStatus {
        PortStatus {
            attached: self.attached,
            power_role: self.attached.then_some(self.power_role),
            data_role: self.attached.then_some(self.data_role),
            contract: self.contract,
            vconn_source: self.vconn_source,
            alt_mode: self.discovery.status,
        }
    }

    fn publish_status(&self) {
        self.port.shared.set_status(self.status());
    }

    fn record(&self, event: PeEvent) {
        self.port.shared.record(event);
    }

    /// Start the engine for a new partner.
    pub fn attach(&mut self, attach: Attach) {
        info!("Attached as {:?}", attach.power_role);

        self.attached = true;
        self.power_role = attach.power_role;
        self.data_role = match attach.power_role {
            PowerRole::Source => DataRole::Dfp,
            PowerRole::Sink => DataRole::Ufp,
        };
        self.vconn_source = attach.vconn_source;
        self.vconn_on_attach = attach.vconn_source;
        self.protocol_layer.set_power_role(self.power_role);
        self.protocol_layer.set_data_role(self.data_role);

        self.reset_protocol_state();
        self.counters = Counters::default();
        self.source_capabilities = None;
        self.hard_reset_in_progress = false;
        self.state = self.role_state(SourceState::Startup, SinkState::Startup);

        self.record(PeEvent::Attached(attach.power_role));
        self.publish_status();
    }

    /// Stop the engine, after the partner left.
    pub fn detach(&mut self) {
        info!("Detached");

        self.attached = false;
        self.vconn_source = false;
        self.hard_reset_in_progress = false;
        self.reset_protocol_state();
        self.state = State::Disabled;

        self.record(PeEvent::Detached);
        self.publish_status();
    }

    /// Take over a request of the host.
    ///
    /// Requests are only taken in a ready state, so that they never interleave with an ongoing exchange.
    pub fn request(&mut self, request: PortRequest) -> RequestOutcome {
        if !self.attached || matches!(self.state, State::Disabled | State::Source(SourceState::Disabled)) {
            return RequestOutcome::Rejected;
        }

        if request == PortRequest::HardReset {
            self.state = self.role_state(SourceState::HardReset, SinkState::HardReset);
            return RequestOutcome::Accepted;
        }

        if !self.is_ready() {
            return RequestOutcome::Busy;
        }

        match request {
            PortRequest::Swap(kind) if self.swap_supported(kind) => {
                self.state = State::Swap(Swap::Initiate(kind));
                RequestOutcome::Accepted
            }
            PortRequest::Discovery if self.data_role == DataRole::Dfp => {
                self.discovery = Discovery {
                    status: AltModeStatus::InProgress,
                    ..Default::default()
                };
                self.state = State::Discovery(DiscoveryState::Identity);
                RequestOutcome::Accepted
            }
            _ => RequestOutcome::Rejected,
        }
    }

    /// Run a single step in the policy engine state machine.
    pub async fn run_step(&mut self) -> Result<(), Error> {
        let new_state = match self.update_state().await {
            Ok(state) => state,
            Err(Error::Protocol(error)) => self.recover(error),
            Err(error) => {
                if let Error::Arbiter(ArbiterError::OverAllocated(excess_ma)) = error {
                    error!("Budget over-allocated by {} mA, VBUS off", excess_ma);
                    _ = self.protocol_layer.driver().set_vbus_source(false).await;
                }
                self.publish_status();
                return Err(error);
            }
        };

        trace!("Transition {:?} -> {:?}", self.state, new_state);
        self.state = new_state;
        self.publish_status();

        Ok(())
    }

    async fn update_state(&mut self) -> Result<State, Error> {
        match self.state.clone() {
            State::Disabled => {
                self.port.shared.wake.wait().await;
                Ok(State::Disabled)
            }
            State::Source(state) => self.update_source_state(state).await,
            State::Sink(state) => self.update_sink_state(state).await,
            State::Swap(swap) => self.run_swap(swap).await,
            State::Discovery(state) => self.update_discovery_state(state).await,
            State::RespondVdm(vdm) => {
                self.respond_vdm(vdm).await?;
                Ok(self.ready_state())
            }
        }
    }

    /// Map a protocol error to the state that recovers from it.
    fn recover(&mut self, error: ProtocolError) -> State {
        debug!("Recovering from {:?} in {:?}", error, self.state);

        match (&self.state, error) {
            (_, ProtocolError::RxError(RxError::HardReset) | ProtocolError::TxError(TxError::HardReset)) => {
                self.record(PeEvent::HardReset);
                self.role_state(SourceState::TransitionToDefault, SinkState::TransitionToDefault)
            }
            (_, ProtocolError::RxError(RxError::SoftReset)) => self.role_state(SourceState::SoftReset, SinkState::SoftReset),
            // A soft reset that fails escalates.
            (State::Source(SourceState::SendSoftReset) | State::Sink(SinkState::SendSoftReset), _) => self.hard_reset_state(),
            // Failures during power transitions and swaps leave the supply in an unknown state.
            (
                State::Sink(SinkState::WaitForCapabilities | SinkState::SelectCapability(_) | SinkState::TransitionSink(_))
                | State::Source(SourceState::TransitionSupply(_))
                | State::Swap(_),
                _,
            ) => self.hard_reset_state(),
            (State::RespondVdm(_), _) => self.ready_state(),
            (State::Discovery(_), _) => self.finish_discovery(AltModeStatus::Failed),
            (_, ProtocolError::RxError(RxError::UnsupportedMessage)) => self.not_supported_state(),
            (_, _) => self.role_state(SourceState::SendSoftReset, SinkState::SendSoftReset),
        }
    }

    /// Pick the source or the sink variant of a state, by the current power role.
    fn role_state(&self, source: SourceState, sink: SinkState) -> State {
        match self.power_role {
            PowerRole::Source => State::Source(source),
            PowerRole::Sink => State::Sink(sink),
        }
    }

    fn ready_state(&self) -> State {
        self.role_state(SourceState::Ready, SinkState::Ready(None))
    }

    fn hard_reset_state(&self) -> State {
        self.role_state(SourceState::HardReset, SinkState::HardReset)
    }

    fn not_supported_state(&self) -> State {
        self.role_state(SourceState::SendNotSupported, SinkState::SendNotSupported)
    }

    fn is_ready(&self) -> bool {
        matches!(self.state, State::Source(SourceState::Ready) | State::Sink(SinkState::Ready(_)))
    }

    /// Reset everything that a soft reset, a hard reset or a detach returns to its default.
    fn reset_protocol_state(&mut self) {
        self.protocol_layer.reset();
        self.contract = Contract::implicit();
        self.discovery = Discovery::default();
        self.counters.busy.reset();
    }

    /// Handle messages that are treated alike in the ready states of both roles.
    fn handle_common_message(&mut self, message: &Message) -> State {
        match (message.header.message_type(), message.data()) {
            (MessageType::Control(ControlMessageType::PrSwap), _) => State::Swap(Swap::Respond(SwapKind::PowerRole)),
            (MessageType::Control(ControlMessageType::DrSwap), _) => State::Swap(Swap::Respond(SwapKind::DataRole)),
            (MessageType::Control(ControlMessageType::VconnSwap), _) => State::Swap(Swap::Respond(SwapKind::Vconn)),
            (MessageType::Control(ControlMessageType::Ping), _) => self.ready_state(),
            (MessageType::Data(DataMessageType::VendorDefined), Some(Data::VendorDefined(vdm))) => {
                State::RespondVdm(vdm.clone())
            }
            (message_type, _) => {
                debug!("Not supported in ready state: {:?}", message_type);
                self.not_supported_state()
            }
        }
    }

    async fn transmit_control(&mut self, message_type: ControlMessageType) -> Result<(), ProtocolError> {
        self.protocol_layer.transmit_control_message(message_type).await?;
        self.record(PeEvent::MessageSent(MessageType::Control(message_type)));
        Ok(())
    }

    async fn transmit_data(&mut self, message_type: DataMessageType, data: Data) -> Result<(), ProtocolError> {
        self.protocol_layer.transmit_data(message_type, data).await?;
        self.record(PeEvent::MessageSent(MessageType::Data(message_type)));
        Ok(())
    }

    async fn transmit_vdm(&mut self, vdm: Vdm) -> Result<(), ProtocolError> {
        self.protocol_layer.transmit_vdm(vdm).await?;
        self.record(PeEvent::MessageSent(MessageType::Data(DataMessageType::VendorDefined)));
        Ok(())
    }

    async fn receive_message_type(
        &mut self,
        message_types: &[MessageType],
        timer_type: TimerType,
    ) -> Result<Message, ProtocolError> {
        let message = self
            .protocol_layer
            .receive_message_type(message_types, timer_type)
            .await?;
        self.record(PeEvent::MessageReceived(message.header.message_type()));
        Ok(message)
    }

    /// Send a soft reset and wait for it to be accepted. See [8.3.3.4.1].
    async fn send_soft_reset(&mut self) -> Result<(), ProtocolError> {
        self.reset_protocol_state();
        self.record(PeEvent::SoftReset);
        self.transmit_control(ControlMessageType::SoftReset).await?;
        self.receive_message_type(
            &[MessageType::Control(ControlMessageType::Accept)],
            TimerType::SenderResponse,
        )
        .await?;
        Ok(())
    }

    /// Accept a soft reset of the partner.
    async fn accept_soft_reset(&mut self) -> Result<(), ProtocolError> {
        self.reset_protocol_state();
        self.record(PeEvent::SoftReset);
        self.transmit_control(ControlMessageType::Accept).await
    }

    /// Send a hard reset, unless the partner did not respond to enough of them already.
    async fn send_hard_reset(&mut self) -> Result<(), Error> {
        if self.counters.hard_reset.increment().is_err() {
            warn!("Hard reset limit reached");
            return Err(Error::PortPartnerUnresponsive);
        }

        self.record(PeEvent::HardReset);
        self.protocol_layer.hard_reset().await?;
        Ok(())
    }
}

impl<'a, DRIVER: Driver + TypeCPort, TIMER: Timer, DPM: DevicePolicyManager> PortPolicy
    for PolicyEngine<'a, DRIVER, TIMER, DPM>
{
    type Driver = DRIVER;

    const PARK_ON_SUSPEND: bool = true;

    fn driver(&mut self) -> &mut DRIVER {
        self.protocol_layer.driver()
    }

    fn on_attach(&mut self, attach: Attach) {
        self.attach(attach);
    }

    fn on_detach(&mut self) {
        self.detach();
    }

    fn handle_request(&mut self, request: PortRequest) -> RequestOutcome {
        let outcome = self.request(request);
        self.publish_status();
        outcome
    }

    async fn run_step(&mut self) -> Result<(), Error> {
        PolicyEngine::run_step(self).await
    }

    fn power_role(&self) -> Option<PowerRole> {
        self.attached.then_some(self.power_role)
    }

    fn vbus_detach_suppressed(&self) -> bool {
        self.hard_reset_in_progress
    }
}
