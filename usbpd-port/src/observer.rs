//! Notification of port events to registered observers.
//!
//! The registry is owned by each port instance, there is no global observer list.
use heapless::Vec;
use proc_bitfield::bitfield;

/// The maximum number of observers per port.
pub const MAX_OBSERVERS: usize = 10;

/// Events that a port reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// An explicit contract was established.
    NewContract,
    /// The contract was lost.
    NoContract,
    /// The port partner sent an alert.
    AlertEvent,
    /// A BIST mode was requested.
    BistEnabled,
    /// BIST modes were left.
    BistDisabled,
    /// The policy engine changed its state.
    PdStateChanged,
}

impl Event {
    const fn bit(self) -> u8 {
        match self {
            Event::NewContract => 1 << 0,
            Event::NoContract => 1 << 1,
            Event::AlertEvent => 1 << 2,
            Event::BistEnabled => 1 << 3,
            Event::BistDisabled => 1 << 4,
            Event::PdStateChanged => 1 << 5,
        }
    }
}

bitfield! {
    /// The set of events that an observer is interested in.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct EventMask(pub u8): Debug, FromStorage, IntoStorage {
        pub new_contract: bool @ 0,
        pub no_contract: bool @ 1,
        pub alert: bool @ 2,
        pub bist_enabled: bool @ 3,
        pub bist_disabled: bool @ 4,
        pub pd_state_changed: bool @ 5,
    }
}

impl EventMask {
    /// All events.
    pub const ALL: Self = Self(0x3f);

    /// Whether the mask contains an event.
    pub fn contains(self, event: Event) -> bool {
        self.0 & event.bit() != 0
    }
}

impl From<Event> for EventMask {
    fn from(event: Event) -> Self {
        Self(event.bit())
    }
}

/// Data that accompanies an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventPayload {
    /// No data.
    None,
    /// The raw request data object of the contract.
    Contract(u32),
    /// The raw alert data object.
    Alert(u32),
}

/// A notification, as delivered to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Notification {
    /// The event.
    pub event: Event,
    /// The port that raised the event.
    pub port_id: u8,
    /// Event data.
    pub payload: EventPayload,
}

/// Receives notifications.
pub trait EventHandler {
    /// Handle a notification.
    fn handle(&mut self, notification: &Notification);
}

/// Something that notifications can be sent to.
pub trait EventSink {
    /// Deliver a notification.
    fn notify(&mut self, notification: Notification);
}

impl EventSink for () {
    fn notify(&mut self, _notification: Notification) {}
}

/// Identifies a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ObserverId(u8);

/// Registry errors.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// No free observer slot.
    #[error("observer registry is full")]
    Full,
    /// The observer is not registered.
    #[error("observer is not registered")]
    NotRegistered,
}

struct Entry<H> {
    id: ObserverId,
    mask: EventMask,
    handler: H,
}

/// A fixed-capacity observer registry.
pub struct Observers<H: EventHandler, const N: usize = MAX_OBSERVERS> {
    entries: Vec<Entry<H>, N>,
    next_id: u8,
}

impl<H: EventHandler, const N: usize> Default for Observers<H, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: EventHandler, const N: usize> Observers<H, N> {
    /// Create an empty registry.
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }

    /// Register a handler for the events in `mask`.
    pub fn register(&mut self, mask: EventMask, handler: H) -> Result<ObserverId, Error> {
        let id = ObserverId(self.next_id);
        self.entries
            .push(Entry { id, mask, handler })
            .map_err(|_| Error::Full)?;
        self.next_id = self.next_id.wrapping_add(1);
        Ok(id)
    }

    /// Remove a handler, returning it.
    pub fn remove(&mut self, id: ObserverId) -> Result<H, Error> {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.id == id)
            .ok_or(Error::NotRegistered)?;
        Ok(self.entries.remove(position).handler)
    }

    /// Access a registered handler.
    pub fn get_mut(&mut self, id: ObserverId) -> Option<&mut H> {
        self.entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .map(|entry| &mut entry.handler)
    }

    /// The number of registered handlers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<H: EventHandler, const N: usize> EventSink for Observers<H, N> {
    fn notify(&mut self, notification: Notification) {
        for entry in self.entries.iter_mut().filter(|entry| entry.mask.contains(notification.event)) {
            entry.handler.handle(&notification);
        }
    }
}
