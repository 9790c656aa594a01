//! A bounded record of what the policy engine did, for diagnostics.
use heapless::{Deque, Vec};

use super::AltModeStatus;
use super::swap::SwapKind;
use crate::PowerRole;
use crate::protocol_layer::message::header::MessageType;

/// The number of events that are kept per port.
pub const EVENT_LOG_LEN: usize = 32;

/// Events of the policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PeEvent {
    /// A partner was attached, in the given role.
    Attached(PowerRole),
    /// The partner left.
    Detached,
    /// A message was sent (and acknowledged).
    MessageSent(MessageType),
    /// A message was received.
    MessageReceived(MessageType),
    /// A swap sequence started.
    SwapBegin(SwapKind),
    /// A swap sequence ended.
    SwapEnd {
        /// The kind of swap.
        kind: SwapKind,
        /// Whether the swap was accepted and carried out.
        accepted: bool,
    },
    /// A soft reset was sent or received.
    SoftReset,
    /// A hard reset was sent or received.
    HardReset,
    /// A new explicit contract is in place.
    ContractChanged {
        /// Contract voltage.
        voltage_mv: u32,
        /// Contract current.
        current_ma: u32,
    },
    /// Discovery ended.
    DiscoveryFinished(AltModeStatus),
}

/// Ring of the latest policy engine events. The oldest event is dropped when full.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Deque<PeEvent, EVENT_LOG_LEN>,
}

impl EventLog {
    /// An empty log.
    pub const fn new() -> Self {
        Self { entries: Deque::new() }
    }

    /// Append an event.
    pub fn push(&mut self, event: PeEvent) {
        if self.entries.is_full() {
            self.entries.pop_front();
        }
        // Cannot fail, there is room now.
        _ = self.entries.push_back(event);
    }

    /// The number of recorded events.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A copy of all events, oldest first.
    pub fn snapshot(&self) -> Vec<PeEvent, EVENT_LOG_LEN> {
        self.entries.iter().copied().collect()
    }

    /// Forget all events.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_events_are_dropped() {
        let mut log = EventLog::new();
        log.push(PeEvent::Attached(PowerRole::Sink));
        for _ in 0..EVENT_LOG_LEN {
            log.push(PeEvent::SoftReset);
        }

        assert_eq!(log.len(), EVENT_LOG_LEN);
        assert!(log.snapshot().iter().all(|event| *event == PeEvent::SoftReset));

        log.clear();
        assert!(log.is_empty());
    }
}
