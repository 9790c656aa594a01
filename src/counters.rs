//! Counters for retry attempts, capability advertisements and message IDs.

/// Counter errors.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The counter went past its maximum value and wrapped around to zero.
    Exceeded,
}

/// A counter with a fixed maximum value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Counter {
    value: u8,
    max_value: u8,
}

/// The counters that USB PD defines.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CounterType {
    /// Consecutive BUSY responses to a VDM.
    Busy,
    /// Unanswered Source_Capabilities messages.
    Caps,
    /// Unanswered cable Discover Identity requests.
    DiscoverIdentity,
    /// Hard resets without a successful negotiation in between.
    HardReset,
    /// The rolling message ID.
    MessageId,
    /// Retransmissions of one message.
    Retry,
}

impl Counter {
    /// Create a counter at zero.
    pub fn new(counter_type: CounterType) -> Self {
        // See [Table 6.70]
        let max_value = match counter_type {
            CounterType::Busy => 5,
            CounterType::Caps => 50,
            CounterType::DiscoverIdentity => 20,
            CounterType::HardReset => 2,
            CounterType::MessageId => 7,
            CounterType::Retry => 2,
        };

        Self { value: 0, max_value }
    }

    /// Create a counter that starts at `value`, wrapped into its range.
    pub fn new_from_value(counter_type: CounterType, value: u8) -> Self {
        let mut counter = Self::new(counter_type);
        counter.set(value);
        counter
    }

    /// Set the counter, wrapping into its range.
    pub fn set(&mut self, value: u8) {
        self.value = value % (self.max_value + 1);
    }

    /// The current value.
    pub fn value(&self) -> u8 {
        self.value
    }

    /// Increment, returning an error when the counter wraps around.
    pub fn increment(&mut self) -> Result<(), Error> {
        self.set(self.value.wrapping_add(1));

        if self.value == 0 {
            Err(Error::Exceeded)
        } else {
            Ok(())
        }
    }

    /// Set the counter to zero.
    pub fn reset(&mut self) {
        self.value = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_wraps_modulo_eight() {
        let mut counter = Counter::new(CounterType::MessageId);
        let mut ids = heapless::Vec::<u8, 16>::new();

        for _ in 0..10 {
            ids.push(counter.value()).unwrap();
            _ = counter.increment();
        }

        assert_eq!(&ids[..], &[0, 1, 2, 3, 4, 5, 6, 7, 0, 1]);
    }

    #[test]
    fn retry_counter_allows_two_retries() {
        let mut counter = Counter::new(CounterType::Retry);

        assert!(counter.increment().is_ok());
        assert!(counter.increment().is_ok());
        assert_eq!(counter.increment(), Err(Error::Exceeded));
    }
}
