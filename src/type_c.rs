//! The Type-C attach state machine.
//!
//! Detects a partner from the CC line terminations, debounces it and resolves the power role.
//! Only attachment is handled here, the PD conversation is up to the port's policy.
//! See the USB Type-C specification, [4.5.2].
use typec_pd_traits::{CcLevel, Polarity, PortId, RoleControl, RpLevel, TcpcError, TypeCPort};

use crate::PowerRole;
use crate::arbiter::{Activity, ArbiterError, SharedArbiter, SlotState};
use crate::config::{PortConfig, TypeCRole};

/// tCCDebounce
pub const CC_DEBOUNCE_MS: u64 = 100;
/// tPDDebounce
pub const PD_DEBOUNCE_MS: u64 = 10;
/// tTryCCDebounce
pub const TRY_CC_DEBOUNCE_MS: u64 = 10;
/// tDRPTry
pub const DRP_TRY_MS: u64 = 100;
/// tDRPToggle, half of the DRP period.
pub const DRP_TOGGLE_MS: u64 = 50;
/// tErrorRecovery
pub const ERROR_RECOVERY_MS: u64 = 25;
/// How often VBUS is checked while a debounced partner waits for it.
pub const VBUS_POLL_MS: u64 = 10;

/// Errors of the attach state machine.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TypeCError {
    /// The port controller failed.
    #[error("port controller error: {0}")]
    Tcpc(#[from] TcpcError),
    /// The arbiter refused the attachment.
    #[error("arbiter error: {0}")]
    Arbiter(#[from] ArbiterError),
}

/// The current that a source pull-up advertises.
pub fn rp_current_ma(level: RpLevel) -> u32 {
    match level {
        RpLevel::Default => 500,
        RpLevel::Current1A5 => 1_500,
        RpLevel::Current3A0 => 3_000,
    }
}

/// The highest pull-up that an allocation covers, but never above `max`.
pub fn rp_level_for(allocated_ma: u32, max: RpLevel) -> RpLevel {
    let level = if allocated_ma >= 3_000 {
        RpLevel::Current3A0
    } else if allocated_ma >= 1_500 {
        RpLevel::Current1A5
    } else {
        RpLevel::Default
    };

    level.min(max)
}

/// Present the highest pull-up, up to `max`, whose current the arbiter lets the partner draw now.
///
/// Ports that were reduced may still draw more than their allocation, then a lower pull-up is
/// presented until they adjusted.
pub fn claim_rp_level(arbiter: &SharedArbiter, port: PortId, max: RpLevel) -> Result<RpLevel, ArbiterError> {
    for level in [RpLevel::Current3A0, RpLevel::Current1A5] {
        if level <= max && arbiter.raise_draw(port, rp_current_ma(level))? {
            return Ok(level);
        }
    }

    if !arbiter.raise_draw(port, rp_current_ma(RpLevel::Default))? {
        warn!("Port {}: default current exceeds the rail", port.0);
    }
    Ok(RpLevel::Default)
}

/// A completed attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Attach {
    /// The power role that this port took.
    pub power_role: PowerRole,
    /// The CC line that carries communication.
    pub polarity: Polarity,
    /// Whether this port supplies VCONN.
    pub vconn_source: bool,
}

/// Attachment changes, for the port's policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TcEvent {
    /// A partner was attached.
    Attached(Attach),
    /// The partner left.
    Detached,
}

/// Type-C states. All times are in milliseconds, as given by [`crate::timers::Timer::now_millis`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TypeCState {
    /// Not started yet, no termination is presented.
    Init,
    /// Nothing attached. A dual-role port toggles the presented role.
    Disconnected {
        /// The role that the terminations currently present.
        presenting: PowerRole,
        since: u64,
    },
    AttachWaitSink {
        polarity: Polarity,
        since: u64,
    },
    AttachWaitSource {
        polarity: Polarity,
        since: u64,
    },
    AttachedSink {
        polarity: Polarity,
    },
    AttachedSource {
        polarity: Polarity,
        /// When Rd was lost.
        detach_since: Option<u64>,
    },
    TrySource {
        since: u64,
    },
    TryWaitSink {
        since: u64,
    },
    TrySink {
        since: u64,
    },
    TryWaitSource {
        since: u64,
    },
    /// All terminations removed, to force the partner to detach.
    ErrorRecovery {
        since: u64,
    },
}

/// The attach state machine of one port.
#[derive(Debug)]
pub struct TypeC {
    port: PortId,
    role: TypeCRole,
    rp_level: RpLevel,
    state: TypeCState,
}

fn rp_polarity((cc1, cc2): (CcLevel, CcLevel)) -> Option<Polarity> {
    if cc1.is_rp() {
        Some(Polarity::Cc1)
    } else if cc2.is_rp() {
        Some(Polarity::Cc2)
    } else {
        None
    }
}

fn rd_polarity((cc1, cc2): (CcLevel, CcLevel)) -> Option<Polarity> {
    match (cc1, cc2) {
        (CcLevel::Rd, _) => Some(Polarity::Cc1),
        (_, CcLevel::Rd) => Some(Polarity::Cc2),
        _ => None,
    }
}

/// Whether the line opposite to the communication line has a cable or accessory that wants VCONN.
fn wants_vconn((cc1, cc2): (CcLevel, CcLevel), polarity: Polarity) -> bool {
    match polarity {
        Polarity::Cc1 => cc2 == CcLevel::Ra,
        Polarity::Cc2 => cc1 == CcLevel::Ra,
    }
}

impl TypeC {
    /// Create the state machine for a port.
    pub fn new(port: PortId, config: &PortConfig) -> Self {
        Self {
            port,
            role: config.type_c_role,
            rp_level: config.rp_level,
            state: TypeCState::Init,
        }
    }

    /// The current state.
    pub fn state(&self) -> TypeCState {
        self.state
    }

    /// The power role of an attached partner's counterpart, if attached.
    pub fn attached_role(&self) -> Option<PowerRole> {
        match self.state {
            TypeCState::AttachedSink { .. } => Some(PowerRole::Sink),
            TypeCState::AttachedSource { .. } => Some(PowerRole::Source),
            _ => None,
        }
    }

    /// Whether a partner is attached, and not about to detach.
    pub fn is_settled(&self) -> bool {
        matches!(
            self.state,
            TypeCState::AttachedSink { .. }
                | TypeCState::AttachedSource {
                    detach_since: None,
                    ..
                }
        )
    }

    /// The time after `now` at which the state machine must be stepped again, even without an alert.
    ///
    /// Once a debounce time passed, states that still wait for VBUS are polled.
    pub fn next_deadline(&self, now: u64) -> Option<u64> {
        let or_poll = |deadline: u64| {
            if deadline > now {
                deadline
            } else {
                now + VBUS_POLL_MS
            }
        };

        match self.state {
            TypeCState::Init => Some(now),
            TypeCState::Disconnected { since, .. } if self.role.is_dual_role() => Some(since + DRP_TOGGLE_MS),
            TypeCState::Disconnected { .. } | TypeCState::AttachedSink { .. } => None,
            TypeCState::AttachWaitSink { since, .. } | TypeCState::TryWaitSink { since } => {
                Some(or_poll(since + CC_DEBOUNCE_MS))
            }
            TypeCState::AttachWaitSource { since, .. } | TypeCState::TryWaitSource { since } => {
                Some(since + CC_DEBOUNCE_MS)
            }
            TypeCState::AttachedSource { detach_since, .. } => detach_since.map(|since| since + PD_DEBOUNCE_MS),
            TypeCState::TrySource { since } if now < since + TRY_CC_DEBOUNCE_MS => Some(since + TRY_CC_DEBOUNCE_MS),
            TypeCState::TrySource { since } => Some(since + DRP_TRY_MS),
            TypeCState::TrySink { since } if now < since + TRY_CC_DEBOUNCE_MS => Some(since + TRY_CC_DEBOUNCE_MS),
            TypeCState::TrySink { since } => Some((now + VBUS_POLL_MS).min(since + DRP_TRY_MS)),
            TypeCState::ErrorRecovery { since } => Some(since + ERROR_RECOVERY_MS),
        }
    }

    /// Follow a power role swap of the policy, which keeps the partner attached.
    pub fn power_role_swapped(&mut self, power_role: PowerRole) {
        self.state = match (self.state, power_role) {
            (TypeCState::AttachedSource { polarity, .. }, PowerRole::Sink) => TypeCState::AttachedSink { polarity },
            (TypeCState::AttachedSink { polarity }, PowerRole::Source) => TypeCState::AttachedSource {
                polarity,
                detach_since: None,
            },
            (state, _) => state,
        };
    }

    /// Remove all terminations and power, forcing the partner to detach.
    pub async fn error_recovery<DRIVER: TypeCPort>(
        &mut self,
        driver: &mut DRIVER,
        arbiter: &SharedArbiter,
        now: u64,
    ) -> Result<Option<TcEvent>, TypeCError> {
        warn!("Port {}: error recovery", self.port.0);
        let was_attached = self.attached_role().is_some();

        self.state = TypeCState::ErrorRecovery { since: now };
        driver.set_vbus_source(false).await?;
        driver.set_vbus_sink(false).await?;
        driver.set_vconn(false).await?;
        driver.set_role_control(RoleControl::Open, self.rp_level).await?;
        arbiter.release(self.port)?;

        Ok(was_attached.then_some(TcEvent::Detached))
    }

    /// Advance the state machine, with the CC lines as they are now.
    ///
    /// `vbus_detach_suppressed` is set by the policy while VBUS is expected to drop, as in a hard reset.
    pub async fn step<DRIVER: TypeCPort>(
        &mut self,
        driver: &mut DRIVER,
        arbiter: &SharedArbiter,
        now: u64,
        vbus_detach_suppressed: bool,
    ) -> Result<Option<TcEvent>, TypeCError> {
        let previous = self.state;
        let event = self.update_state(driver, arbiter, now, vbus_detach_suppressed).await?;

        if previous != self.state {
            trace!("Port {}: {:?} -> {:?}", self.port.0, previous, self.state);
        }

        Ok(event)
    }

    async fn update_state<DRIVER: TypeCPort>(
        &mut self,
        driver: &mut DRIVER,
        arbiter: &SharedArbiter,
        now: u64,
        vbus_detach_suppressed: bool,
    ) -> Result<Option<TcEvent>, TypeCError> {
        match self.state {
            TypeCState::Init => self.present(driver, self.initial_role(), now).await?,
            TypeCState::Disconnected { presenting, since } => {
                let cc = driver.get_cc().await?;

                match presenting {
                    PowerRole::Sink => {
                        if let Some(polarity) = rp_polarity(cc) {
                            self.state = TypeCState::AttachWaitSink { polarity, since: now };
                        }
                    }
                    PowerRole::Source => {
                        if let Some(polarity) = rd_polarity(cc) {
                            self.state = TypeCState::AttachWaitSource { polarity, since: now };
                        }
                    }
                }

                if matches!(self.state, TypeCState::Disconnected { .. })
                    && self.role.is_dual_role()
                    && now >= since + DRP_TOGGLE_MS
                {
                    self.present(driver, presenting.opposite(), now).await?;
                }
            }
            TypeCState::AttachWaitSink { since, .. } => {
                let cc = driver.get_cc().await?;

                match rp_polarity(cc) {
                    None => self.present(driver, PowerRole::Sink, now).await?,
                    Some(polarity) => {
                        if now >= since + CC_DEBOUNCE_MS && driver.vbus_present().await? {
                            if let TypeCRole::DualRole {
                                try_role: Some(PowerRole::Source),
                            } = self.role
                            {
                                self.state = TypeCState::TrySource { since: now };
                                driver.set_role_control(RoleControl::Rp, self.rp_level).await?;
                            } else {
                                return Ok(Some(self.attach_sink(driver, polarity).await?));
                            }
                        } else {
                            self.state = TypeCState::AttachWaitSink { polarity, since };
                        }
                    }
                }
            }
            TypeCState::AttachWaitSource { since, .. } => {
                let cc = driver.get_cc().await?;

                match rd_polarity(cc) {
                    None => self.present(driver, PowerRole::Source, now).await?,
                    Some(polarity) => {
                        if now >= since + CC_DEBOUNCE_MS {
                            if let TypeCRole::DualRole {
                                try_role: Some(PowerRole::Sink),
                            } = self.role
                            {
                                self.state = TypeCState::TrySink { since: now };
                                driver.set_role_control(RoleControl::Rd, self.rp_level).await?;
                            } else {
                                return Ok(Some(self.attach_source(driver, arbiter, cc, polarity).await?));
                            }
                        } else {
                            self.state = TypeCState::AttachWaitSource { polarity, since };
                        }
                    }
                }
            }
            TypeCState::AttachedSink { .. } => {
                if !vbus_detach_suppressed && !driver.vbus_present().await? {
                    info!("Port {}: VBUS lost", self.port.0);
                    driver.set_vbus_sink(false).await?;
                    driver.set_vconn(false).await?;
                    self.present(driver, PowerRole::Sink, now).await?;
                    return Ok(Some(TcEvent::Detached));
                }
            }
            TypeCState::AttachedSource { polarity, detach_since } => {
                let cc = driver.get_cc().await?;
                let rd_present = match polarity {
                    Polarity::Cc1 => cc.0 == CcLevel::Rd,
                    Polarity::Cc2 => cc.1 == CcLevel::Rd,
                };

                match (rd_present, detach_since) {
                    (true, _) => {
                        self.state = TypeCState::AttachedSource {
                            polarity,
                            detach_since: None,
                        }
                    }
                    (false, None) => {
                        self.state = TypeCState::AttachedSource {
                            polarity,
                            detach_since: Some(now),
                        }
                    }
                    (false, Some(since)) if now >= since + PD_DEBOUNCE_MS => {
                        info!("Port {}: sink left", self.port.0);
                        driver.set_vbus_source(false).await?;
                        driver.set_vconn(false).await?;
                        arbiter.release(self.port)?;
                        self.present(driver, PowerRole::Source, now).await?;
                        return Ok(Some(TcEvent::Detached));
                    }
                    (false, Some(_)) => (),
                }
            }
            TypeCState::TrySource { since } => {
                let cc = driver.get_cc().await?;

                if let Some(polarity) = rd_polarity(cc)
                    && now >= since + TRY_CC_DEBOUNCE_MS
                {
                    return Ok(Some(self.attach_source(driver, arbiter, cc, polarity).await?));
                }

                if now >= since + DRP_TRY_MS {
                    self.state = TypeCState::TryWaitSink { since: now };
                    driver.set_role_control(RoleControl::Rd, self.rp_level).await?;
                }
            }
            TypeCState::TryWaitSink { since } => {
                let cc = driver.get_cc().await?;

                match rp_polarity(cc) {
                    Some(polarity) if driver.vbus_present().await? => {
                        return Ok(Some(self.attach_sink(driver, polarity).await?));
                    }
                    None if now >= since + CC_DEBOUNCE_MS => self.present(driver, PowerRole::Sink, now).await?,
                    _ => (),
                }
            }
            TypeCState::TrySink { since } => {
                let cc = driver.get_cc().await?;

                if let Some(polarity) = rp_polarity(cc)
                    && now >= since + TRY_CC_DEBOUNCE_MS
                    && driver.vbus_present().await?
                {
                    return Ok(Some(self.attach_sink(driver, polarity).await?));
                }

                if now >= since + DRP_TRY_MS {
                    self.state = TypeCState::TryWaitSource { since: now };
                    driver.set_role_control(RoleControl::Rp, self.rp_level).await?;
                }
            }
            TypeCState::TryWaitSource { since } => {
                let cc = driver.get_cc().await?;

                match rd_polarity(cc) {
                    Some(polarity) => return Ok(Some(self.attach_source(driver, arbiter, cc, polarity).await?)),
                    None if now >= since + CC_DEBOUNCE_MS => self.present(driver, PowerRole::Source, now).await?,
                    None => (),
                }
            }
            TypeCState::ErrorRecovery { since } => {
                if now >= since + ERROR_RECOVERY_MS {
                    self.present(driver, self.initial_role(), now).await?;
                }
            }
        }

        Ok(None)
    }

    /// The role that is presented first. A dual-role port starts as a sink.
    fn initial_role(&self) -> PowerRole {
        match self.role {
            TypeCRole::Source => PowerRole::Source,
            TypeCRole::Sink | TypeCRole::DualRole { .. } => PowerRole::Sink,
        }
    }

    /// Present the terminations of a role, while nothing is attached.
    async fn present<DRIVER: TypeCPort>(
        &mut self,
        driver: &mut DRIVER,
        presenting: PowerRole,
        now: u64,
    ) -> Result<(), TypeCError> {
        let role_control = match presenting {
            PowerRole::Source => RoleControl::Rp,
            PowerRole::Sink => RoleControl::Rd,
        };
        driver.set_role_control(role_control, self.rp_level).await?;
        self.state = TypeCState::Disconnected { presenting, since: now };
        Ok(())
    }

    async fn attach_sink<DRIVER: TypeCPort>(
        &mut self,
        driver: &mut DRIVER,
        polarity: Polarity,
    ) -> Result<TcEvent, TypeCError> {
        driver.set_polarity(polarity).await?;
        driver.set_vbus_sink(true).await?;
        self.state = TypeCState::AttachedSink { polarity };
        info!("Port {}: attached as sink on {:?}", self.port.0, polarity);

        Ok(TcEvent::Attached(Attach {
            power_role: PowerRole::Sink,
            polarity,
            vconn_source: false,
        }))
    }

    /// Attach as a source, after the arbiter granted the current that the pull-up advertises.
    async fn attach_source<DRIVER: TypeCPort>(
        &mut self,
        driver: &mut DRIVER,
        arbiter: &SharedArbiter,
        cc: (CcLevel, CcLevel),
        polarity: Polarity,
    ) -> Result<TcEvent, TypeCError> {
        let allocated_ma = arbiter.update(
            self.port,
            SlotState::Enabled {
                activity: Activity::Negotiating,
                demand_ma: rp_current_ma(self.rp_level),
            },
        )?;
        let rp_level = claim_rp_level(arbiter, self.port, rp_level_for(allocated_ma, self.rp_level))?;
        debug!("Port {}: {} mA granted, {:?}", self.port.0, allocated_ma, rp_level);

        driver.set_role_control(RoleControl::Rp, rp_level).await?;
        driver.set_polarity(polarity).await?;
        driver.set_vbus_source(true).await?;

        let vconn_source = wants_vconn(cc, polarity);
        if vconn_source {
            driver.set_vconn(true).await?;
        }

        self.state = TypeCState::AttachedSource {
            polarity,
            detach_since: None,
        };
        info!("Port {}: attached as source on {:?}", self.port.0, polarity);

        Ok(TcEvent::Attached(Attach {
            power_role: PowerRole::Source,
            polarity,
            vconn_source,
        }))
    }
}
