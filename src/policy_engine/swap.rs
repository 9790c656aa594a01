//! Power role, data role and VCONN swaps.
//!
//! A swap runs as one uninterruptible sequence within a single step of the policy engine, so no
//! other message exchange can interleave with it. See [8.3.3.19], [8.3.3.18] and [8.3.3.20].
use typec_pd_traits::{Driver, RoleControl, TypeCPort};

use super::event_log::PeEvent;
use super::sink::SinkState;
use super::source::SourceState;
use super::{AltModeStatus, Contract, Error, PolicyEngine, State};
use crate::PowerRole;
use crate::arbiter::{Activity, SlotState};
use crate::dpm::DevicePolicyManager;
use crate::protocol_layer::message::header::{ControlMessageType, MessageType};
use crate::protocol_layer::{ProtocolError, RxError};
use crate::timers::{Timer, TimerType};
use crate::type_c::{claim_rp_level, rp_current_ma, rp_level_for};

/// The kinds of swaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SwapKind {
    /// Exchange source and sink.
    PowerRole,
    /// Exchange DFP and UFP.
    DataRole,
    /// Exchange the VCONN source.
    Vconn,
}

impl SwapKind {
    /// The control message that asks for this swap.
    pub fn message_type(self) -> ControlMessageType {
        match self {
            Self::PowerRole => ControlMessageType::PrSwap,
            Self::DataRole => ControlMessageType::DrSwap,
            Self::Vconn => ControlMessageType::VconnSwap,
        }
    }
}

/// A swap, either asked for by the local policy or by the port partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(super) enum Swap {
    Initiate(SwapKind),
    Respond(SwapKind),
}

impl<DRIVER: Driver + TypeCPort, TIMER: Timer, DPM: DevicePolicyManager> PolicyEngine<'_, DRIVER, TIMER, DPM> {
    /// Whether this port can do a swap of the given kind at all.
    pub(super) fn swap_supported(&self, kind: SwapKind) -> bool {
        match kind {
            SwapKind::PowerRole => self.config.type_c_role.is_dual_role(),
            // Modes must be exited before the data role changes.
            SwapKind::DataRole => !matches!(self.discovery.status, AltModeStatus::Entered { .. }),
            SwapKind::Vconn => true,
        }
    }

    pub(super) async fn run_swap(&mut self, swap: Swap) -> Result<State, Error> {
        let kind = match swap {
            Swap::Initiate(kind) | Swap::Respond(kind) => kind,
        };
        self.record(PeEvent::SwapBegin(kind));

        let accepted = match swap {
            Swap::Initiate(kind) => self.initiate_swap(kind).await,
            Swap::Respond(kind) => self.respond_swap(kind).await,
        };

        let result = match accepted {
            Ok(true) => self.execute_swap(kind).await,
            Ok(false) => Ok(self.ready_state()),
            Err(error) => Err(error),
        };

        self.record(PeEvent::SwapEnd {
            kind,
            accepted: matches!(accepted, Ok(true)) && result.is_ok(),
        });
        result
    }

    async fn initiate_swap(&mut self, kind: SwapKind) -> Result<bool, Error> {
        self.transmit_control(kind.message_type()).await?;

        match self
            .receive_message_type(
                &[
                    MessageType::Control(ControlMessageType::Accept),
                    MessageType::Control(ControlMessageType::Reject),
                    MessageType::Control(ControlMessageType::Wait),
                    MessageType::Control(ControlMessageType::NotSupported),
                ],
                TimerType::SenderResponse,
            )
            .await
        {
            Ok(message) => {
                let accepted = message.header.message_type() == MessageType::Control(ControlMessageType::Accept);
                if !accepted {
                    info!("{:?} swap refused with {:?}", kind, message.header.message_type());
                }
                Ok(accepted)
            }
            Err(ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                info!("{:?} swap not answered", kind);
                Ok(false)
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn respond_swap(&mut self, kind: SwapKind) -> Result<bool, Error> {
        let accept = self.swap_supported(kind) && self.dpm.evaluate_swap(kind, &self.config.swap_policy).await;

        self.transmit_control(if accept {
            ControlMessageType::Accept
        } else {
            ControlMessageType::Reject
        })
        .await?;

        Ok(accept)
    }

    async fn execute_swap(&mut self, kind: SwapKind) -> Result<State, Error> {
        match kind {
            SwapKind::DataRole => {
                self.data_role = self.data_role.opposite();
                self.protocol_layer.set_data_role(self.data_role);
                self.discovery = Default::default();
                info!("Data role is now {:?}", self.data_role);
                Ok(self.ready_state())
            }
            SwapKind::Vconn => {
                if self.vconn_source {
                    // The partner turns its VCONN on first.
                    self.receive_message_type(
                        &[MessageType::Control(ControlMessageType::PsRdy)],
                        TimerType::VCONNSourceOn,
                    )
                    .await?;
                    self.protocol_layer.driver().set_vconn(false).await?;
                    self.vconn_source = false;
                } else {
                    self.protocol_layer.driver().set_vconn(true).await?;
                    TimerType::get_timer::<TIMER>(TimerType::VCONNSourceOn).await;
                    self.vconn_source = true;
                    self.transmit_control(ControlMessageType::PsRdy).await?;
                }
                info!("VCONN source: {}", self.vconn_source);
                Ok(self.ready_state())
            }
            SwapKind::PowerRole => match self.power_role {
                PowerRole::Source => self.swap_to_sink().await,
                PowerRole::Sink => self.swap_to_source().await,
            },
        }
    }

    async fn swap_to_sink(&mut self) -> Result<State, Error> {
        TimerType::get_timer::<TIMER>(TimerType::SrcTransition).await;

        let driver = self.protocol_layer.driver();
        driver.set_vbus_source(false).await?;
        self.port.arbiter.release(self.port.id)?;
        driver.set_role_control(RoleControl::Rd, self.config.rp_level).await?;

        self.power_role = PowerRole::Sink;
        self.protocol_layer.set_power_role(PowerRole::Sink);
        self.contract = Contract::implicit();
        self.transmit_control(ControlMessageType::PsRdy).await?;

        match self
            .receive_message_type(
                &[MessageType::Control(ControlMessageType::PsRdy)],
                TimerType::PSSourceOn,
            )
            .await
        {
            Ok(_) => (),
            Err(ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                warn!("New source did not turn on");
                return Err(Error::PortPartnerUnresponsive);
            }
            Err(error) => return Err(error.into()),
        }

        self.protocol_layer.driver().set_vbus_sink(true).await?;
        info!("Swapped to sink");
        Ok(State::Sink(SinkState::Startup))
    }

    async fn swap_to_source(&mut self) -> Result<State, Error> {
        self.protocol_layer.driver().set_vbus_sink(false).await?;
        self.contract = Contract::implicit();

        match self
            .receive_message_type(
                &[MessageType::Control(ControlMessageType::PsRdy)],
                TimerType::PSSourceOff,
            )
            .await
        {
            Ok(_) => (),
            Err(ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                warn!("Old source did not turn off");
                return Err(Error::PortPartnerUnresponsive);
            }
            Err(error) => return Err(error.into()),
        }

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

        self.power_role = PowerRole::Source;
        self.protocol_layer.set_power_role(PowerRole::Source);
        TimerType::get_timer::<TIMER>(TimerType::SwapSourceStart).await;
        self.transmit_control(ControlMessageType::PsRdy).await?;

        info!("Swapped to source");
        Ok(State::Source(SourceState::Startup))
    }
}
