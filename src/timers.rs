//! Timers that are used by the protocol layer, the policy engines and the alert dispatcher.
use core::future::Future;

/// The timer trait to implement by the user application.
pub trait Timer {
    /// Expire after the specified number of milliseconds.
    fn after_millis(milliseconds: u64) -> impl Future<Output = ()>;

    /// Milliseconds since an arbitrary, fixed point in time.
    fn now_millis() -> u64;
}

/// Types of timers that are used for timeouts.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerType {
    ChunkSenderRequest,
    ChunkSenderResponse,
    CRCReceive,
    NoResponse,
    PSHardReset,
    PSSourceOff,
    PSSourceOn,
    PSTransition,
    SenderResponse,
    SinkAdjust,
    SinkRequest,
    SinkWaitCap,
    SourceCapability,
    SourceRecover,
    SrcTransition,
    SwapSourceStart,
    VCONNSourceOn,
    VDMBusy,
    VDMModeEntry,
    VDMResponse,
}

impl TimerType {
    /// Duration of the timer, as given by the USB PD specification.
    pub const fn millis(self) -> u64 {
        match self {
            TimerType::ChunkSenderRequest => 27,
            TimerType::ChunkSenderResponse => 27,
            TimerType::CRCReceive => 1,
            TimerType::NoResponse => 5000,
            TimerType::PSHardReset => 30,
            TimerType::PSSourceOff => 835,
            TimerType::PSSourceOn => 435,
            TimerType::PSTransition => 500,
            TimerType::SenderResponse => 30,
            TimerType::SinkAdjust => 55,
            TimerType::SinkRequest => 100,
            TimerType::SinkWaitCap => 465,
            TimerType::SourceCapability => 150,
            TimerType::SourceRecover => 800,
            TimerType::SrcTransition => 30,
            TimerType::SwapSourceStart => 20,
            TimerType::VCONNSourceOn => 50,
            TimerType::VDMBusy => 50,
            TimerType::VDMModeEntry => 45,
            TimerType::VDMResponse => 27,
        }
    }

    /// Create a new timer for a given type.
    pub fn get_timer<TIMER: Timer>(timer_type: TimerType) -> impl Future<Output = ()> {
        TIMER::after_millis(timer_type.millis())
    }
}
