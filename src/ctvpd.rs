//! The policy of a charge-through VCONN powered device (CTVPD).
//!
//! Such a device is powered from VCONN and sits between a host and a charger. It holds no contract of
//! its own: it answers Discover Identity with its VPD identity and relays all other traffic towards
//! the charge-through port.
use core::future::Future;

use embassy_futures::select::{Either, select};
use typec_pd_traits::{Driver, TypeCPort};

use crate::config::VpdConfig;
use crate::policy_engine::Error;
use crate::policy_engine::event_log::PeEvent;
use crate::port::{PortHandle, PortPolicy, PortRequest, PortStatus, RequestOutcome};
use crate::protocol_layer::message::Message;
use crate::protocol_layer::message::data::Data;
use crate::protocol_layer::message::data::vdm::{Command, CommandType, Identity, PD_SID, StructuredHeader, Vdm};
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::{ProtocolError, ProtocolLayer, RxError, TxError};
use crate::timers::Timer;
use crate::type_c::Attach;
use crate::{DataRole, PowerRole};

/// Where relayed messages go.
pub trait ChargeThroughRelay {
    /// Pass a message of the host on to the charge-through port.
    fn relay(&mut self, message: &Message) -> impl Future<Output = ()>;
}

/// States of the CTVPD policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CtvpdState {
    /// Reset the protocol layer.
    Init,
    /// Answer identity requests and relay the rest.
    Run,
    /// The host disabled the port. Identity requests are kept until it is enabled again.
    Paused,
}

/// The reduced policy for a CTVPD.
pub struct CtvpdPolicy<'a, DRIVER: Driver + TypeCPort, TIMER: Timer, RELAY: ChargeThroughRelay> {
    port: PortHandle<'a>,
    protocol_layer: ProtocolLayer<DRIVER, TIMER>,
    relay: RELAY,
    identity: Identity,
    state: CtvpdState,
    attached: bool,
    /// A Discover Identity that arrived while paused.
    pending_identity: Option<StructuredHeader>,
}

impl<'a, DRIVER: Driver + TypeCPort, TIMER: Timer, RELAY: ChargeThroughRelay> CtvpdPolicy<'a, DRIVER, TIMER, RELAY> {
    /// Create the policy. The device is always a VCONN powered UFP.
    pub fn new(port: PortHandle<'a>, config: &VpdConfig, driver: DRIVER, relay: RELAY) -> Self {
        let header = Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R3_X);

        Self {
            port,
            protocol_layer: ProtocolLayer::new(driver, header),
            relay,
            identity: config.identity(),
            state: CtvpdState::Init,
            attached: false,
            pending_identity: None,
        }
    }

    /// The current state.
    pub fn state(&self) -> CtvpdState {
        self.state
    }

    /// The relay.
    pub fn relay(&mut self) -> &mut RELAY {
        &mut self.relay
    }

    fn publish_status(&self) {
        self.port.shared.set_status(PortStatus {
            attached: self.attached,
            power_role: self.attached.then_some(PowerRole::Sink),
            data_role: self.attached.then_some(DataRole::Ufp),
            ..PortStatus::detached()
        });
    }

    /// Whether a message is a Discover Identity request to the PD SID.
    fn identity_request(message: &Message) -> Option<StructuredHeader> {
        let Some(Data::VendorDefined(vdm)) = message.data() else {
            return None;
        };
        let header = vdm.structured_header()?;

        (header.svid() == PD_SID
            && header.command_type() == CommandType::Request
            && header.command() == Ok(Command::DiscoverIdentity))
        .then_some(header)
    }

    async fn answer_identity(&mut self, request: StructuredHeader) -> Result<(), ProtocolError> {
        debug!("Answering Discover Identity");
        let response = Vdm::structured(request.response(CommandType::Ack), &self.identity.to_vdos());
        self.protocol_layer.transmit_vdm(response).await?;
        self.port
            .shared
            .record(PeEvent::MessageSent(MessageType::Data(DataMessageType::VendorDefined)));
        Ok(())
    }

    async fn update_state(&mut self) -> Result<CtvpdState, ProtocolError> {
        match self.state {
            CtvpdState::Init => {
                self.protocol_layer.reset();
                Ok(CtvpdState::Run)
            }
            CtvpdState::Run => {
                if let Some(request) = self.pending_identity.take() {
                    self.answer_identity(request).await?;
                    return Ok(CtvpdState::Run);
                }

                let port = self.port;
                let message = match select(self.protocol_layer.receive_message(), port.shared.wake.wait()).await {
                    Either::First(message) => message?,
                    Either::Second(()) => return Ok(CtvpdState::Run),
                };
                self.port
                    .shared
                    .record(PeEvent::MessageReceived(message.header.message_type()));

                match Self::identity_request(&message) {
                    Some(request) => self.answer_identity(request).await?,
                    None => self.relay.relay(&message).await,
                }

                Ok(CtvpdState::Run)
            }
            CtvpdState::Paused => {
                let port = self.port;
                match select(self.protocol_layer.receive_message(), port.shared.wake.wait()).await {
                    Either::First(message) => {
                        let message = message?;
                        if let Some(request) = Self::identity_request(&message) {
                            self.pending_identity = Some(request);
                        } else {
                            debug!("Paused, dropping {:?}", message.header.message_type());
                        }
                    }
                    Either::Second(()) => (),
                }

                Ok(CtvpdState::Paused)
            }
        }
    }
}

impl<'a, DRIVER: Driver + TypeCPort, TIMER: Timer, RELAY: ChargeThroughRelay> PortPolicy
    for CtvpdPolicy<'a, DRIVER, TIMER, RELAY>
{
    type Driver = DRIVER;

    const PARK_ON_SUSPEND: bool = false;

    fn driver(&mut self) -> &mut DRIVER {
        self.protocol_layer.driver()
    }

    fn on_attach(&mut self, _attach: Attach) {
        info!("CTVPD attached");
        self.attached = true;
        if self.state != CtvpdState::Paused {
            self.state = CtvpdState::Init;
        }
        self.port.shared.record(PeEvent::Attached(PowerRole::Sink));
        self.publish_status();
    }

    fn on_detach(&mut self) {
        self.attached = false;
        self.pending_identity = None;
        if self.state != CtvpdState::Paused {
            self.state = CtvpdState::Init;
        }
        self.port.shared.record(PeEvent::Detached);
        self.publish_status();
    }

    fn on_suspend(&mut self, suspended: bool) {
        self.state = match (suspended, self.state) {
            (true, _) => CtvpdState::Paused,
            (false, CtvpdState::Paused) if self.attached => CtvpdState::Run,
            (false, CtvpdState::Paused) => CtvpdState::Init,
            (false, state) => state,
        };
        info!("CTVPD {:?}", self.state);
    }

    fn handle_request(&mut self, _request: PortRequest) -> RequestOutcome {
        RequestOutcome::Rejected
    }

    async fn run_step(&mut self) -> Result<(), Error> {
        let new_state = match self.update_state().await {
            Ok(state) => state,
            Err(ProtocolError::RxError(RxError::SoftReset)) => {
                self.port.shared.record(PeEvent::SoftReset);
                self.protocol_layer.reset();
                self.protocol_layer
                    .transmit_control_message(ControlMessageType::Accept)
                    .await?;
                self.state
            }
            Err(ProtocolError::RxError(RxError::HardReset) | ProtocolError::TxError(TxError::HardReset)) => {
                self.port.shared.record(PeEvent::HardReset);
                self.pending_identity = None;
                CtvpdState::Init
            }
            Err(error) => {
                // The host retries.
                warn!("CTVPD: {:?}", error);
                self.state
            }
        };

        if new_state != self.state {
            trace!("CTVPD {:?} -> {:?}", self.state, new_state);
        }
        self.state = new_state;

        Ok(())
    }

    fn power_role(&self) -> Option<PowerRole> {
        self.attached.then_some(PowerRole::Sink)
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::config::{BudgetConfig, MaxVbus, Reduction, SlotConfig};
    use crate::counters::{Counter, CounterType};
    use crate::dummy::{DummyDriver, DummyTimer};
    use crate::port::Context;
    use crate::protocol_layer::MAX_MESSAGE_SIZE;
    use crate::PortId;
    use typec_pd_traits::Polarity;

    #[derive(Default)]
    struct RecordingRelay {
        relayed: Vec<MessageType>,
    }

    impl ChargeThroughRelay for RecordingRelay {
        async fn relay(&mut self, message: &Message) {
            self.relayed.push(message.header.message_type());
        }
    }

    type TestPolicy<'a> = CtvpdPolicy<'a, DummyDriver, DummyTimer, RecordingRelay>;

    fn context() -> Context {
        Context::new(&BudgetConfig {
            capacity_ma: 1_000,
            base_load_ma: 0,
            slots: [SlotConfig::new(&[500], 1, 0)].into_iter().collect(),
            reduction: Reduction::OneAtATime,
        })
        .unwrap()
    }

    fn vpd() -> VpdConfig {
        VpdConfig {
            vid: 0x18d1,
            pid: 0x5039,
            bcd_device: 0x0001,
            xid: 0,
            hw_version: 1,
            fw_version: 2,
            max_vbus: MaxVbus::V20,
            charge_through_5a: false,
            vbus_impedance: 10,
            ground_impedance: 20,
            charge_through_support: true,
        }
    }

    fn host() -> Header {
        Header::new_template(DataRole::Dfp, PowerRole::Source, SpecificationRevision::R3_X)
    }

    fn inject(policy: &mut TestPolicy<'_>, message: Message) {
        let mut buffer = [0u8; MAX_MESSAGE_SIZE];
        let size = message.to_bytes(&mut buffer);
        policy.driver().inject_received_data(&buffer[..size]);
    }

    fn discover_identity(message_id: u8) -> Message {
        let vdm = Vdm::structured(StructuredHeader::new_request(PD_SID, Command::DiscoverIdentity), &[]);
        let header = Header::new_data(
            host(),
            Counter::new_from_value(CounterType::MessageId, message_id),
            DataMessageType::VendorDefined,
            1,
        );
        Message::new_with_data(header, Data::VendorDefined(vdm))
    }

    fn control(message_type: ControlMessageType, message_id: u8) -> Message {
        Message::new(Header::new_control(
            host(),
            Counter::new_from_value(CounterType::MessageId, message_id),
            message_type,
        ))
    }

    fn attached<'a>(context: &'a Context) -> TestPolicy<'a> {
        let mut policy = CtvpdPolicy::new(
            context.handle(PortId(0)).unwrap(),
            &vpd(),
            DummyDriver::new(),
            RecordingRelay::default(),
        );
        policy.on_attach(Attach {
            power_role: PowerRole::Sink,
            polarity: Polarity::Cc1,
            vconn_source: false,
        });
        policy
    }

    fn sent_identity(policy: &mut TestPolicy<'_>) -> Identity {
        let message = Message::from_bytes(&policy.driver().take_transmitted_data()).unwrap();
        let Some(Data::VendorDefined(vdm)) = message.data() else {
            panic!("Expected a VDM, got {:?}", message);
        };
        assert_eq!(vdm.structured_header().unwrap().command_type(), CommandType::Ack);
        Identity::from_vdos(&vdm.objects).unwrap()
    }

    #[tokio::test]
    async fn answers_discover_identity() {
        let context = context();
        let mut policy = attached(&context);

        policy.run_step().await.unwrap();
        assert_eq!(policy.state(), CtvpdState::Run);

        inject(&mut policy, discover_identity(0));
        policy.run_step().await.unwrap();

        assert_eq!(sent_identity(&mut policy), vpd().identity());
        assert!(policy.relay().relayed.is_empty());
    }

    #[tokio::test]
    async fn relays_everything_else() {
        let context = context();
        let mut policy = attached(&context);
        policy.run_step().await.unwrap();

        inject(&mut policy, control(ControlMessageType::GetSinkCap, 0));
        policy.run_step().await.unwrap();

        assert_eq!(
            policy.relay().relayed,
            [MessageType::Control(ControlMessageType::GetSinkCap)]
        );
        assert!(!policy.driver().has_transmitted_data());
    }

    #[tokio::test]
    async fn pause_keeps_identity_request() {
        let context = context();
        let mut policy = attached(&context);
        policy.run_step().await.unwrap();

        policy.on_suspend(true);
        assert_eq!(policy.state(), CtvpdState::Paused);

        inject(&mut policy, discover_identity(0));
        policy.run_step().await.unwrap();
        assert!(!policy.driver().has_transmitted_data());

        policy.on_suspend(false);
        assert_eq!(policy.state(), CtvpdState::Run);
        policy.run_step().await.unwrap();

        assert_eq!(sent_identity(&mut policy), vpd().identity());
    }

    #[tokio::test]
    async fn soft_reset_is_accepted() {
        let context = context();
        let mut policy = attached(&context);
        policy.run_step().await.unwrap();

        inject(&mut policy, control(ControlMessageType::SoftReset, 3));
        policy.run_step().await.unwrap();

        let message = Message::from_bytes(&policy.driver().take_transmitted_data()).unwrap();
        assert_eq!(
            message.header.message_type(),
            MessageType::Control(ControlMessageType::Accept)
        );
        assert_eq!(message.header.message_id(), 0);
        assert_eq!(policy.state(), CtvpdState::Run);
    }

    #[tokio::test]
    async fn requests_are_rejected() {
        let context = context();
        let mut policy = attached(&context);

        assert_eq!(
            policy.handle_request(PortRequest::Swap(crate::policy_engine::swap::SwapKind::PowerRole)),
            RequestOutcome::Rejected
        );
        assert!(context.pd_get_state(PortId(0)).unwrap().attached);
    }
}
