//! USB PD port engine for FIFO-based PHYs.
//!
//! Implements the protocol layer and policy engine of a single USB Type-C port, in both
//! source and sink roles. The engine never blocks: the application calls [`Port::run`]
//! whenever the transceiver raises an interrupt, or when [`Port::next_timeout`] elapses.
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

#[macro_use]
extern crate uom;

pub mod config;
pub mod counters;
pub mod debug_log;
pub mod dpm;
pub mod observer;
pub mod policy_engine;
pub mod port;
pub mod protocol_layer;
pub mod timers;

#[cfg(test)]
mod dummy;

pub use port::{Error, Port};
pub use usbpd_port_traits::{Status, Transceiver, TransceiverError};

/// The unit system of the engine.
///
/// Lengths in millimeters and currents in milliamperes yield voltages in millivolts and
/// power in microwatts, which covers the full USB PD range with `u32` storage.
#[allow(missing_docs)]
pub mod units {
    ISQ!(
        uom::si,
        u32,
        (millimeter, kilogram, second, milliampere, kelvin, mole, candela)
    );
}

/// Voltage in 20 mV steps, as used by PPS requests.
#[allow(missing_docs)]
pub mod _20millivolts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_potential;

        @_20millivolts: 0.02; "_20mV", "_20millivolts", "_20millivolts";
    }
}

/// Voltage in 50 mV steps, as used by fixed and variable supplies.
#[allow(missing_docs)]
pub mod _50millivolts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_potential;

        @_50millivolts: 0.05; "_50mV", "_50millivolts", "_50millivolts";
    }
}

/// Current in 50 mA steps, as used by augmented supplies.
#[allow(missing_docs)]
pub mod _50milliamperes_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_current;

        @_50milliamperes: 0.05; "_50mA", "_50milliamperes", "_50milliamperes";
    }
}

/// Power in 250 mW steps, as used by battery supplies.
#[allow(missing_docs)]
pub mod _250milliwatts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::power;

        @_250milliwatts: 0.25; "_250mW", "_250milliwatts", "_250milliwatts";
    }
}

/// The power role of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerRole {
    /// Provides VBUS.
    Source,
    /// Consumes VBUS.
    Sink,
}

impl From<bool> for PowerRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Sink,
            true => Self::Source,
        }
    }
}

impl From<PowerRole> for bool {
    fn from(role: PowerRole) -> bool {
        match role {
            PowerRole::Sink => false,
            PowerRole::Source => true,
        }
    }
}

/// The data role of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataRole {
    /// Upstream facing port.
    Ufp,
    /// Downstream facing port.
    Dfp,
}

impl From<bool> for DataRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Ufp,
            true => Self::Dfp,
        }
    }
}

impl From<DataRole> for bool {
    fn from(role: DataRole) -> bool {
        match role {
            DataRole::Ufp => false,
            DataRole::Dfp => true,
        }
    }
}
