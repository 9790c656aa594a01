//! Source states of the policy engine. See [8.3.3.2].
use embassy_futures::select::{Either, Either4, select, select4};
use typec_pd_traits::{Driver, RoleControl, TypeCPort};
use uom::si::electric_current::milliampere;
use uom::si::electric_potential::millivolt;

use super::event_log::PeEvent;
use super::{Contract, Error, PolicyEngine, State};
use crate::DataRole;
use crate::arbiter::{Activity, SlotState};
use crate::dpm::{DevicePolicyManager, Event};
use crate::protocol_layer::message::data::Data;
use crate::protocol_layer::message::data::pdo::PowerDataObject;
use crate::protocol_layer::message::data::request::{PowerSource, RawRequest};
use crate::protocol_layer::message::header::{ControlMessageType, DataMessageType, MessageType};
use crate::protocol_layer::{ProtocolError, RxError};
use crate::timers::{Timer, TimerType};
use crate::type_c::{claim_rp_level, rp_current_ma, rp_level_for};
use crate::units::ElectricCurrent;

/// Source states.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(super) enum SourceState {
    Startup,
    SendCapabilities,
    /// Waiting for a partner that has not answered capabilities yet.
    Discovery,
    NegotiateCapability(RawRequest),
    TransitionSupply(Contract),
    Ready,
    GiveSinkCap,
    SendNotSupported,
    SendSoftReset,
    SoftReset,
    HardReset,
    TransitionToDefault,
    /// The partner does not speak PD.
    Disabled,
}

impl<DRIVER: Driver + TypeCPort, TIMER: Timer, DPM: DevicePolicyManager> PolicyEngine<'_, DRIVER, TIMER, DPM> {
    pub(super) async fn update_source_state(&mut self, state: SourceState) -> Result<State, Error> {
        let new_state = match state {
            SourceState::Startup => {
                self.counters.caps.reset();
                self.protocol_layer.reset();
                SourceState::SendCapabilities
            }
            SourceState::SendCapabilities => return self.send_capabilities().await,
            SourceState::Discovery => {
                TimerType::get_timer::<TIMER>(TimerType::SourceCapability).await;
                SourceState::SendCapabilities
            }
            SourceState::NegotiateCapability(raw) => self.negotiate_capability(raw).await?,
            SourceState::TransitionSupply(contract) => {
                TimerType::get_timer::<TIMER>(TimerType::SrcTransition).await;
                self.dpm.transition_power(&contract).await;
                self.transmit_control(ControlMessageType::PsRdy).await?;

                self.port.arbiter.update(
                    self.port.id,
                    SlotState::Enabled {
                        activity: Activity::Active,
                        demand_ma: contract.current_ma,
                    },
                )?;

                // Other ports may only take the difference once the partner adjusted.
                if contract.current_ma < self.port.arbiter.drawn_ma(self.port.id)? {
                    TimerType::get_timer::<TIMER>(TimerType::SinkAdjust).await;
                    self.port.arbiter.lower_draw(self.port.id, contract.current_ma)?;
                }

                self.contract = contract;
                self.counters.hard_reset.reset();
                self.record(PeEvent::ContractChanged {
                    voltage_mv: contract.voltage_mv,
                    current_ma: contract.current_ma,
                });
                info!("Contract: {} mV, {} mA", contract.voltage_mv, contract.current_ma);

                SourceState::Ready
            }
            SourceState::Ready => return self.source_ready().await,
            SourceState::GiveSinkCap => {
                self.transmit_data(
                    DataMessageType::SinkCapabilities,
                    Data::SinkCapabilities(self.config.sink_capabilities.clone()),
                )
                .await?;
                SourceState::Ready
            }
            SourceState::SendNotSupported => {
                self.transmit_control(ControlMessageType::NotSupported).await?;
                SourceState::Ready
            }
            SourceState::SendSoftReset => {
                self.send_soft_reset().await?;
                SourceState::SendCapabilities
            }
            SourceState::SoftReset => {
                self.accept_soft_reset().await?;
                SourceState::SendCapabilities
            }
            SourceState::HardReset => {
                self.send_hard_reset().await?;
                SourceState::TransitionToDefault
            }
            SourceState::TransitionToDefault => {
                self.source_transition_to_default().await?;
                SourceState::Startup
            }
            SourceState::Disabled => {
                let port = self.port;
                if let Either::Second(allocated_ma) =
                    select(port.shared.wake.wait(), port.arbiter.budget_changed(port.id)).await
                {
                    self.follow_budget_with_rp(allocated_ma).await?;
                }
                SourceState::Disabled
            }
        };

        Ok(State::Source(new_state))
    }

    /// The highest current that any configured capability offers.
    fn max_offered_ma(&self) -> u32 {
        self.config
            .source_capabilities
            .pdos()
            .iter()
            .filter_map(PowerDataObject::max_current)
            .map(|current| current.get::<milliampere>())
            .max()
            .unwrap_or_default()
    }

    /// Advertise what the budget allows, then wait for a request.
    async fn send_capabilities(&mut self) -> Result<State, Error> {
        // A port that holds a contract re-advertises within its current class.
        let activity = if self.contract.explicit {
            Activity::Active
        } else {
            Activity::Negotiating
        };
        let available_ma = self
            .port
            .arbiter
            .available_ma(self.port.id, activity, self.max_offered_ma())?;
        self.advertised = self
            .config
            .source_capabilities
            .limited_to(ElectricCurrent::new::<milliampere>(available_ma));

        match self
            .transmit_data(
                DataMessageType::SourceCapabilities,
                Data::SourceCapabilities(self.advertised.clone()),
            )
            .await
        {
            Ok(()) => (),
            Err(ProtocolError::TransmitRetriesExceeded) => {
                return Ok(State::Source(if self.counters.caps.increment().is_err() {
                    info!("Partner does not respond to capabilities");
                    SourceState::Disabled
                } else {
                    SourceState::Discovery
                }));
            }
            Err(error) => return Err(error.into()),
        }

        self.counters.caps.reset();

        match self
            .receive_message_type(
                &[MessageType::Data(DataMessageType::Request)],
                TimerType::SenderResponse,
            )
            .await
        {
            Ok(message) => match message.data() {
                Some(Data::Request(raw)) => Ok(State::Source(SourceState::NegotiateCapability(*raw))),
                _ => Err(ProtocolError::UnexpectedMessage.into()),
            },
            Err(ProtocolError::RxError(RxError::ReceiveTimeout)) => Ok(State::Source(SourceState::HardReset)),
            Err(error) => Err(error.into()),
        }
    }

    /// Evaluate a request against the advertised capabilities and the budget. See [8.3.3.2.5].
    async fn negotiate_capability(&mut self, raw: RawRequest) -> Result<SourceState, Error> {
        let Some(contract) = self.contract_for(raw) else {
            info!("Invalid request for position {}", raw.object_position());
            return self.reject_request().await;
        };

        let allocated_ma = self.port.arbiter.update(
            self.port.id,
            SlotState::Enabled {
                activity: Activity::Negotiating,
                demand_ma: contract.current_ma,
            },
        )?;

        if allocated_ma < contract.current_ma {
            info!(
                "Budget allows {} mA, {} mA requested",
                allocated_ma,
                contract.current_ma
            );
            self.port.arbiter.update(
                self.port.id,
                SlotState::Enabled {
                    activity: Activity::Active,
                    demand_ma: self.contract.current_ma,
                },
            )?;
            return self.reject_request().await;
        }

        // The allocation is kept, so that the reduced ports stay reduced until the partner asks again.
        if !self.port.arbiter.raise_draw(self.port.id, contract.current_ma)? {
            info!("Waiting for reduced ports to release {} mA", contract.current_ma);
            self.transmit_control(ControlMessageType::Wait).await?;

            // Without a contract, the sink waits for capabilities instead of asking again.
            return Ok(if self.contract.explicit {
                SourceState::Ready
            } else {
                SourceState::Discovery
            });
        }

        self.transmit_control(ControlMessageType::Accept).await?;
        Ok(SourceState::TransitionSupply(contract))
    }

    /// The contract that a request would establish, if it is valid.
    fn contract_for(&self, raw: RawRequest) -> Option<Contract> {
        let request = PowerSource::from_raw(raw, &self.advertised)?;
        let voltage_mv = match self.advertised.at_position(request.object_position())? {
            PowerDataObject::FixedSupply(supply) => supply.voltage().get::<millivolt>(),
            _ => return None,
        };
        let offered_ma = self
            .advertised
            .at_position(request.object_position())?
            .max_current()?
            .get::<milliampere>();
        let requested_ma = request.operating_current()?.get::<milliampere>();

        (requested_ma <= offered_ma).then_some(Contract {
            voltage_mv,
            current_ma: requested_ma,
            explicit: true,
            object_position: request.object_position(),
        })
    }

    async fn reject_request(&mut self) -> Result<SourceState, Error> {
        self.transmit_control(ControlMessageType::Reject).await?;
        Ok(SourceState::Ready)
    }

    async fn source_ready(&mut self) -> Result<State, Error> {
        if let Some(state) = self.discovery_due() {
            return Ok(state);
        }

        let port = self.port;
        let result = select4(
            self.protocol_layer.receive_message(),
            self.dpm.get_event(),
            port.shared.wake.wait(),
            port.arbiter.budget_changed(port.id),
        )
        .await;

        let state = match result {
            Either4::First(message) => {
                let message = message?;
                self.record(PeEvent::MessageReceived(message.header.message_type()));

                match (message.header.message_type(), message.data()) {
                    (MessageType::Data(DataMessageType::Request), Some(Data::Request(raw))) => {
                        State::Source(SourceState::NegotiateCapability(*raw))
                    }
                    (MessageType::Control(ControlMessageType::GetSourceCap), _) => {
                        State::Source(SourceState::SendCapabilities)
                    }
                    (MessageType::Control(ControlMessageType::GetSinkCap), _) => {
                        if self.config.type_c_role.is_dual_role() {
                            State::Source(SourceState::GiveSinkCap)
                        } else {
                            State::Source(SourceState::SendNotSupported)
                        }
                    }
                    _ => self.handle_common_message(&message),
                }
            }
            Either4::Second(Event::UpdateSourceCapabilities) => State::Source(SourceState::SendCapabilities),
            Either4::Second(event) => {
                debug!("Ignoring {:?} as a source", event);
                State::Source(SourceState::Ready)
            }
            Either4::Third(()) => State::Source(SourceState::Ready),
            Either4::Fourth(allocated_ma) => {
                if allocated_ma < self.contract.current_ma {
                    info!("Budget reduced to {} mA, re-advertising", allocated_ma);
                    State::Source(SourceState::SendCapabilities)
                } else {
                    State::Source(SourceState::Ready)
                }
            }
        };

        Ok(state)
    }

    /// Move the pull-up of a partner without PD to a new allocation.
    async fn follow_budget_with_rp(&mut self, allocated_ma: u32) -> Result<(), Error> {
        let id = self.port.id;
        let level = rp_level_for(allocated_ma, self.config.rp_level);

        if rp_current_ma(level) < self.port.arbiter.drawn_ma(id)? {
            info!("Budget reduced to {} mA, {:?}", allocated_ma, level);
            self.protocol_layer
                .driver()
                .set_role_control(RoleControl::Rp, level)
                .await?;
            TimerType::get_timer::<TIMER>(TimerType::SinkAdjust).await;
            self.port.arbiter.lower_draw(id, rp_current_ma(level))?;
        } else {
            let level = claim_rp_level(self.port.arbiter, id, level)?;
            self.protocol_layer
                .driver()
                .set_role_control(RoleControl::Rp, level)
                .await?;
        }

        Ok(())
    }

    /// Turn the supply off and back on, after a hard reset. See [7.1.5].
    async fn source_transition_to_default(&mut self) -> Result<(), Error> {
        self.hard_reset_in_progress = true;
        TimerType::get_timer::<TIMER>(TimerType::PSHardReset).await;

        let driver = self.protocol_layer.driver();
        driver.set_vbus_source(false).await?;
        driver.set_vconn(false).await?;
        self.vconn_source = false;
        self.port.arbiter.release(self.port.id)?;

        self.dpm.hard_reset().await;
        self.reset_protocol_state();
        self.data_role = DataRole::Dfp;
        self.protocol_layer.set_data_role(self.data_role);

        TimerType::get_timer::<TIMER>(TimerType::SourceRecover).await;

        let allocated_ma = self.port.arbiter.update(
            self.port.id,
            SlotState::Enabled {
                activity: Activity::Negotiating,
                demand_ma: rp_current_ma(self.config.rp_level),
            },
        )?;
        let level = claim_rp_level(
            self.port.arbiter,
            self.port.id,
            rp_level_for(allocated_ma, self.config.rp_level),
        )?;

        let driver = self.protocol_layer.driver();
        driver.set_role_control(RoleControl::Rp, level).await?;
        driver.set_vbus_source(true).await?;
        if self.vconn_on_attach {
            driver.set_vconn(true).await?;
            self.vconn_source = true;
        }

        self.hard_reset_in_progress = false;
        Ok(())
    }
}
