//! Definition of counters, used for retry attempts, and message IDs.

/// Counter errors.
#[non_exhaustive]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A wrapping counter rolled over to zero.
    #[error("counter overrun")]
    Overrun,
    /// A saturating counter went past its maximum value.
    #[error("counter exceeded its maximum value")]
    Exceeded,
}

/// Kinds of counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CounterType {
    /// Source capability advertisements without response (nCapsCount).
    Caps,
    /// Transmission collisions (nRetryCount).
    Collision,
    /// Hard resets issued without a successful negotiation (nHardResetCount).
    HardReset,
    /// Message ID, wrapping.
    MessageId,
}

/// A counter with a per-type maximum.
///
/// Message IDs wrap. All other counters saturate one past their maximum, so that
/// [`Counter::exceeded`] stays true until the counter is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Counter {
    value: u8,
    counter_type: CounterType,
}

impl Counter {
    /// Create a new counter at zero.
    pub const fn new(counter_type: CounterType) -> Self {
        Self { value: 0, counter_type }
    }

    /// The maximum value before the counter is considered exceeded (or wraps).
    pub const fn max_value(&self) -> u8 {
        // See USB PD spec, [Table 6.70]
        match self.counter_type {
            CounterType::Caps => 50,
            CounterType::Collision => 3,
            CounterType::HardReset => 2,
            CounterType::MessageId => 7,
        }
    }

    /// Set the value, wrapping message IDs and clamping everything else.
    pub fn set(&mut self, value: u8) {
        self.value = match self.counter_type {
            CounterType::MessageId => value & self.max_value(),
            _ => value.min(self.max_value() + 1),
        };
    }

    /// The current value.
    pub fn value(&self) -> u8 {
        self.value
    }

    /// Increment the counter, reporting an overrun or an exceeded maximum.
    pub fn increment(&mut self) -> Result<(), Error> {
        self.advance();

        match self.counter_type {
            CounterType::MessageId if self.value == 0 => Err(Error::Overrun),
            CounterType::MessageId => Ok(()),
            _ if self.exceeded() => Err(Error::Exceeded),
            _ => Ok(()),
        }
    }

    /// Increment the counter without a report.
    ///
    /// Message IDs wrap. Other counters stay exceeded, see [`Counter::exceeded`].
    pub fn advance(&mut self) {
        self.set(self.value.saturating_add(1));
    }

    /// Whether the counter went past its maximum.
    pub fn exceeded(&self) -> bool {
        self.counter_type != CounterType::MessageId && self.value > self.max_value()
    }

    /// Mark the counter as exceeded.
    pub fn saturate(&mut self) {
        self.set(self.max_value() + 1);
    }

    /// Reset the counter to zero.
    pub fn reset(&mut self) {
        self.value = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_wraps() {
        let mut counter = Counter::new(CounterType::MessageId);
        for _ in 0..7 {
            assert!(counter.increment().is_ok());
        }
        assert_eq!(counter.value(), 7);
        assert_eq!(counter.increment(), Err(Error::Overrun));
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn hard_reset_counter_saturates() {
        let mut counter = Counter::new(CounterType::HardReset);
        assert!(counter.increment().is_ok());
        assert!(counter.increment().is_ok());
        assert!(!counter.exceeded());
        assert_eq!(counter.increment(), Err(Error::Exceeded));
        assert!(counter.exceeded());

        // Stays exceeded.
        assert_eq!(counter.increment(), Err(Error::Exceeded));
        assert_eq!(counter.value(), 3);

        counter.reset();
        assert!(!counter.exceeded());
    }

    #[test]
    fn advance_wraps_and_saturates() {
        let mut message_id = Counter::new(CounterType::MessageId);
        message_id.set(7);
        message_id.advance();
        assert_eq!(message_id.value(), 0);

        let mut caps = Counter::new(CounterType::Caps);
        for _ in 0..60 {
            caps.advance();
        }
        assert_eq!(caps.value(), 51);
        assert!(caps.exceeded());
    }

    #[test]
    fn saturate_marks_exceeded() {
        let mut counter = Counter::new(CounterType::Caps);
        counter.saturate();
        assert!(counter.exceeded());
        assert_eq!(counter.value(), 51);
    }
}
