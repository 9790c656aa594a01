//! Discovery of the partner's identity and alternate modes, with structured VDMs. See [6.4.4].
use typec_pd_traits::{Driver, TypeCPort};

use super::event_log::PeEvent;
use super::{AltModeStatus, Discovery, Error, PolicyEngine, State};
use crate::DataRole;
use crate::dpm::DevicePolicyManager;
use crate::protocol_layer::message::data::Data;
use crate::protocol_layer::message::data::vdm::{
    Command, CommandType, Identity, MAX_VDOS, PD_SID, StructuredHeader, Vdm, svids_from_vdos,
};
use crate::protocol_layer::message::header::{ControlMessageType, DataMessageType, MessageType};
use crate::protocol_layer::{ProtocolError, RxError};
use crate::timers::{Timer, TimerType};

/// Number of SVIDs in a Discover SVIDs ACK that is followed by more.
const SVIDS_PER_MESSAGE: usize = 2 * MAX_VDOS;

/// Discovery states, as the DFP.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(super) enum DiscoveryState {
    Identity,
    Svids,
    Modes {
        svid: u16,
    },
    EnterMode {
        svid: u16,
        object_position: u8,
    },
}

/// The outcome of a structured VDM request.
#[derive(Debug)]
enum Response {
    Ack(heapless::Vec<u32, MAX_VDOS>),
    Nak,
    Busy,
    /// The partner answered with something else, or did not answer in time.
    Invalid,
}

impl<DRIVER: Driver + TypeCPort, TIMER: Timer, DPM: DevicePolicyManager> PolicyEngine<'_, DRIVER, TIMER, DPM> {
    /// Start discovery, if it is configured to run on its own and did not run yet.
    ///
    /// Only a DFP with an explicit contract discovers.
    pub(super) fn discovery_due(&mut self) -> Option<State> {
        if !self.config.auto_discovery
            || self.data_role != DataRole::Dfp
            || !self.contract.explicit
            || self.discovery.status != AltModeStatus::NotStarted
        {
            return None;
        }

        self.discovery = Discovery {
            status: AltModeStatus::InProgress,
            ..Default::default()
        };
        Some(State::Discovery(DiscoveryState::Identity))
    }

    pub(super) fn finish_discovery(&mut self, status: AltModeStatus) -> State {
        info!("Discovery finished: {:?}", status);
        self.discovery.status = status;
        self.counters.busy.reset();
        self.record(PeEvent::DiscoveryFinished(status));
        self.ready_state()
    }

    pub(super) async fn update_discovery_state(&mut self, state: DiscoveryState) -> Result<State, Error> {
        let request = match state {
            DiscoveryState::Identity => StructuredHeader::new_request(PD_SID, Command::DiscoverIdentity),
            DiscoveryState::Svids => StructuredHeader::new_request(PD_SID, Command::DiscoverSvids),
            DiscoveryState::Modes { svid } => StructuredHeader::new_request(svid, Command::DiscoverModes),
            DiscoveryState::EnterMode { svid, object_position } => {
                StructuredHeader::new_request(svid, Command::EnterMode).with_object_position(object_position)
            }
        };

        let timer_type = match state {
            DiscoveryState::EnterMode { .. } => TimerType::VDMModeEntry,
            _ => TimerType::VDMResponse,
        };

        let objects = match self.exchange_vdm(request, timer_type).await? {
            Response::Ack(objects) => {
                self.counters.busy.reset();
                objects
            }
            Response::Busy => {
                if self.counters.busy.increment().is_err() {
                    return Ok(self.finish_discovery(AltModeStatus::Failed));
                }
                TimerType::get_timer::<TIMER>(TimerType::VDMBusy).await;
                return Ok(State::Discovery(state));
            }
            Response::Nak | Response::Invalid => return Ok(self.finish_discovery(AltModeStatus::Failed)),
        };

        let next = match state {
            DiscoveryState::Identity => {
                let Some(identity) = Identity::from_vdos(&objects) else {
                    return Ok(self.finish_discovery(AltModeStatus::Failed));
                };
                debug!("Partner identity: {:?}", identity);
                self.dpm.identity_discovered(&identity).await;
                self.discovery.identity = Some(identity);
                DiscoveryState::Svids
            }
            DiscoveryState::Svids => {
                let mut count = 0;
                for svid in svids_from_vdos(&objects) {
                    count += 1;
                    if self.discovery.svids.push(svid).is_err() {
                        warn!("Dropping SVID {}", svid);
                    }
                }

                if count == SVIDS_PER_MESSAGE && !self.discovery.svids.is_full() {
                    // The partner has more.
                    DiscoveryState::Svids
                } else {
                    match self
                        .config
                        .svids
                        .iter()
                        .find(|svid| self.discovery.svids.contains(*svid))
                    {
                        Some(svid) => DiscoveryState::Modes { svid: *svid },
                        None => return Ok(self.finish_discovery(AltModeStatus::NoMode)),
                    }
                }
            }
            DiscoveryState::Modes { svid } => match self.dpm.choose_mode(svid, &objects) {
                Some(object_position) if object_position >= 1 && usize::from(object_position) <= objects.len() => {
                    DiscoveryState::EnterMode { svid, object_position }
                }
                _ => return Ok(self.finish_discovery(AltModeStatus::NoMode)),
            },
            DiscoveryState::EnterMode { svid, object_position } => {
                self.dpm.mode_entered(svid, object_position).await;
                return Ok(self.finish_discovery(AltModeStatus::Entered { svid, object_position }));
            }
        };

        Ok(State::Discovery(next))
    }

    /// Send a request and wait for the matching response.
    async fn exchange_vdm(&mut self, request: StructuredHeader, timer_type: TimerType) -> Result<Response, Error> {
        self.transmit_vdm(Vdm::structured(request, &[])).await?;

        let message = match self
            .receive_message_type(&[MessageType::Data(DataMessageType::VendorDefined)], timer_type)
            .await
        {
            Ok(message) => message,
            Err(ProtocolError::RxError(RxError::ReceiveTimeout) | ProtocolError::UnexpectedMessage) => {
                return Ok(Response::Invalid);
            }
            Err(error) => return Err(error.into()),
        };

        let Some(Data::VendorDefined(vdm)) = message.data() else {
            return Ok(Response::Invalid);
        };
        let Some(header) = vdm.structured_header() else {
            return Ok(Response::Invalid);
        };
        if header.svid() != request.svid() || header.command() != request.command() {
            return Ok(Response::Invalid);
        }

        Ok(match header.command_type() {
            CommandType::Ack => Response::Ack(vdm.objects.clone()),
            CommandType::Nak => Response::Nak,
            CommandType::Busy => Response::Busy,
            CommandType::Request => Response::Invalid,
        })
    }

    /// Answer a VDM of the partner.
    pub(super) async fn respond_vdm(&mut self, vdm: Vdm) -> Result<(), ProtocolError> {
        let Some(header) = vdm.structured_header() else {
            return self.transmit_control(ControlMessageType::NotSupported).await;
        };

        if header.command_type() != CommandType::Request {
            debug!("Ignoring stray VDM response");
            return Ok(());
        }

        let response = match header.command() {
            Ok(Command::Attention) => return Ok(()),
            Ok(Command::DiscoverIdentity) if header.svid() == PD_SID => match &self.config.identity {
                Some(identity) => Vdm::structured(header.response(CommandType::Ack), &identity.to_vdos()),
                None => Vdm::structured(header.response(CommandType::Nak), &[]),
            },
            _ => Vdm::structured(header.response(CommandType::Nak), &[]),
        };

        self.transmit_vdm(response).await
    }
}
