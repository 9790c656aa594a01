//! Sink states of the policy engine. See [8.3.3.3].
use embassy_futures::select::{Either4, select4};
use typec_pd_traits::{Driver, TypeCPort};
use uom::si::electric_current::milliampere;
use uom::si::electric_potential::millivolt;

use super::event_log::PeEvent;
use super::{Contract, Error, PolicyEngine, State};
use crate::DataRole;
use crate::dpm::{DevicePolicyManager, Event};
use crate::protocol_layer::message::{Message, Payload};
use crate::protocol_layer::message::data::Data;
use crate::protocol_layer::message::data::pdo::{Capabilities, PowerDataObject};
use crate::protocol_layer::message::data::request::PowerSource;
use crate::protocol_layer::message::header::{ControlMessageType, DataMessageType, MessageType};
use crate::protocol_layer::{ProtocolError, RxError};
use crate::timers::{Timer, TimerType};

/// Sink states.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(super) enum SinkState {
    /// Default state at startup.
    Startup,
    Discovery,
    WaitForCapabilities,
    EvaluateCapabilities(Capabilities),
    SelectCapability(PowerSource),
    TransitionSink(PowerSource),
    /// Ready state. A request that the source answered with Wait is repeated after the SinkRequestTimer.
    Ready(Option<PowerSource>),
    GiveSinkCap,
    GetSourceCap,
    SendNotSupported,
    SendSoftReset,
    SoftReset,
    HardReset,
    TransitionToDefault,
}

impl<DRIVER: Driver + TypeCPort, TIMER: Timer, DPM: DevicePolicyManager> PolicyEngine<'_, DRIVER, TIMER, DPM> {
    pub(super) async fn update_sink_state(&mut self, state: SinkState) -> Result<State, Error> {
        let new_state = match state {
            SinkState::Startup => {
                self.contract = Contract::implicit();
                self.protocol_layer.reset();
                SinkState::Discovery
            }
            SinkState::Discovery => {
                self.protocol_layer.wait_for_vbus().await;
                self.source_capabilities = None;
                self.hard_reset_in_progress = false;
                SinkState::WaitForCapabilities
            }
            SinkState::WaitForCapabilities => {
                let message = self
                    .receive_message_type(
                        &[MessageType::Data(DataMessageType::SourceCapabilities)],
                        TimerType::SinkWaitCap,
                    )
                    .await?;

                match message.payload {
                    Some(Payload::Data(Data::SourceCapabilities(capabilities))) => {
                        SinkState::EvaluateCapabilities(capabilities)
                    }
                    _ => return Err(ProtocolError::UnexpectedMessage.into()),
                }
            }
            SinkState::EvaluateCapabilities(capabilities) => {
                // The source is PD capable.
                self.counters.hard_reset.reset();

                let request = self.dpm.request(&capabilities, &self.config.sink_ceiling).await;
                self.source_capabilities = Some(capabilities);

                match request {
                    Some(request) => SinkState::SelectCapability(request),
                    None => {
                        warn!("No usable source capability");
                        SinkState::HardReset
                    }
                }
            }
            SinkState::SelectCapability(request) => {
                self.transmit_data(DataMessageType::Request, Data::Request(request.to_raw()))
                    .await?;

                let message_type = self
                    .receive_message_type(
                        &[
                            MessageType::Control(ControlMessageType::Accept),
                            MessageType::Control(ControlMessageType::Wait),
                            MessageType::Control(ControlMessageType::Reject),
                        ],
                        TimerType::SenderResponse,
                    )
                    .await?
                    .header
                    .message_type();

                match (self.contract.explicit, message_type) {
                    (_, MessageType::Control(ControlMessageType::Accept)) => SinkState::TransitionSink(request),
                    (false, _) => SinkState::WaitForCapabilities,
                    (true, MessageType::Control(ControlMessageType::Wait)) => SinkState::Ready(Some(request)),
                    (true, _) => SinkState::Ready(None),
                }
            }
            SinkState::TransitionSink(request) => {
                self.receive_message_type(
                    &[MessageType::Control(ControlMessageType::PsRdy)],
                    TimerType::PSTransition,
                )
                .await?;

                if !self.protocol_layer.driver().vbus_present().await? {
                    warn!("VBUS missing after PS_RDY");
                    return Ok(State::Sink(SinkState::HardReset));
                }

                let Some(contract) = self.contract_from(&request) else {
                    return Ok(State::Sink(SinkState::HardReset));
                };

                self.dpm.transition_power(&contract).await;
                self.contract = contract;
                self.record(PeEvent::ContractChanged {
                    voltage_mv: contract.voltage_mv,
                    current_ma: contract.current_ma,
                });
                info!("Contract: {} mV, {} mA", contract.voltage_mv, contract.current_ma);

                SinkState::Ready(None)
            }
            SinkState::Ready(pending_request) => return self.sink_ready(pending_request).await,
            SinkState::GiveSinkCap => {
                self.transmit_data(
                    DataMessageType::SinkCapabilities,
                    Data::SinkCapabilities(self.config.sink_capabilities.clone()),
                )
                .await?;
                SinkState::Ready(None)
            }
            SinkState::GetSourceCap => {
                self.transmit_control(ControlMessageType::GetSourceCap).await?;

                match self
                    .receive_message_type(
                        &[MessageType::Data(DataMessageType::SourceCapabilities)],
                        TimerType::SenderResponse,
                    )
                    .await
                {
                    Ok(Message {
                        payload: Some(Payload::Data(Data::SourceCapabilities(capabilities))),
                        ..
                    }) => SinkState::EvaluateCapabilities(capabilities),
                    Ok(_) => return Err(ProtocolError::UnexpectedMessage.into()),
                    Err(ProtocolError::RxError(RxError::ReceiveTimeout)) => SinkState::Ready(None),
                    Err(error) => return Err(error.into()),
                }
            }
            SinkState::SendNotSupported => {
                self.transmit_control(ControlMessageType::NotSupported).await?;
                SinkState::Ready(None)
            }
            SinkState::SendSoftReset => {
                self.send_soft_reset().await?;
                SinkState::WaitForCapabilities
            }
            SinkState::SoftReset => {
                self.accept_soft_reset().await?;
                SinkState::WaitForCapabilities
            }
            SinkState::HardReset => {
                self.send_hard_reset().await?;
                SinkState::TransitionToDefault
            }
            SinkState::TransitionToDefault => {
                // VBUS drops during the reset, which is no detach.
                self.hard_reset_in_progress = true;

                if self.vconn_source {
                    self.protocol_layer.driver().set_vconn(false).await?;
                    self.vconn_source = false;
                }

                self.dpm.hard_reset().await;
                self.reset_protocol_state();
                self.data_role = DataRole::Ufp;
                self.protocol_layer.set_data_role(self.data_role);

                SinkState::Startup
            }
        };

        Ok(State::Sink(new_state))
    }

    /// The contract that an accepted request establishes.
    fn contract_from(&self, request: &PowerSource) -> Option<Contract> {
        let voltage_mv = match self
            .source_capabilities
            .as_ref()?
            .at_position(request.object_position())?
        {
            PowerDataObject::FixedSupply(supply) => supply.voltage().get::<millivolt>(),
            PowerDataObject::VariableSupply(supply) => supply.min_voltage().get::<millivolt>(),
            PowerDataObject::Programmable(supply) => supply.min_voltage().get::<millivolt>(),
            _ => return None,
        };

        Some(Contract {
            voltage_mv,
            current_ma: request.operating_current()?.get::<milliampere>(),
            explicit: true,
            object_position: request.object_position(),
        })
    }

    async fn sink_ready(&mut self, pending_request: Option<PowerSource>) -> Result<State, Error> {
        if let Some(state) = self.discovery_due() {
            return Ok(state);
        }

        let port = self.port;
        let sink_request_fut = async {
            match pending_request {
                Some(_) => TimerType::get_timer::<TIMER>(TimerType::SinkRequest).await,
                None => core::future::pending().await,
            }
        };

        let result = select4(
            self.protocol_layer.receive_message(),
            self.dpm.get_event(),
            port.shared.wake.wait(),
            sink_request_fut,
        )
        .await;

        let state = match result {
            Either4::First(message) => {
                let message = message?;
                self.record(PeEvent::MessageReceived(message.header.message_type()));

                match message.header.message_type() {
                    MessageType::Data(DataMessageType::SourceCapabilities) => match message.payload {
                        Some(Payload::Data(Data::SourceCapabilities(capabilities))) => {
                            State::Sink(SinkState::EvaluateCapabilities(capabilities))
                        }
                        _ => return Err(ProtocolError::UnexpectedMessage.into()),
                    },
                    MessageType::Control(ControlMessageType::GetSinkCap) => State::Sink(SinkState::GiveSinkCap),
                    _ => self.handle_common_message(&message),
                }
            }
            Either4::Second(event) => match event {
                Event::RequestSourceCapabilities => State::Sink(SinkState::GetSourceCap),
                Event::RequestPower(request) => State::Sink(SinkState::SelectCapability(request)),
                Event::UpdateSourceCapabilities | Event::None => State::Sink(SinkState::Ready(pending_request)),
            },
            Either4::Third(()) => State::Sink(SinkState::Ready(pending_request)),
            Either4::Fourth(()) => match pending_request {
                Some(request) => State::Sink(SinkState::SelectCapability(request)),
                None => State::Sink(SinkState::Ready(None)),
            },
        };

        Ok(state)
    }
}
