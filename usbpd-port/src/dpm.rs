//! The device policy manager (DPM) and VDM engine interfaces.
//!
//! The DPM owns the capability tables of the device and switches its power supply.
//! All hooks except the capability getters have defaults, so a device only implements
//! what it supports.
use heapless::Vec;

use crate::PowerRole;
use crate::protocol_layer::Sop;
use crate::protocol_layer::message::data::MAX_DATA_OBJECTS;
use crate::protocol_layer::message::data::sink_capabilities::SinkCapabilities;
use crate::protocol_layer::message::data::source_capabilities::SourceCapabilities;
use crate::units::ElectricPotential;

/// Trait for the device policy manager.
pub trait DevicePolicyManager {
    /// The capabilities that the port advertises as source.
    fn source_capabilities(&self) -> SourceCapabilities;

    /// The capabilities that the port reports as sink.
    fn sink_capabilities(&self) -> SinkCapabilities;

    /// Switch the supply to the source capability at `index` (zero-based).
    fn transition_source(&mut self, _index: usize) {}

    /// Whether the supply has settled at the source capability at `index`.
    fn is_source_cap_enabled(&mut self, _index: usize) -> bool {
        true
    }

    /// Switch VBUS.
    fn set_vbus(&mut self, _enable: bool) {}

    /// Switch the VBUS discharge path.
    fn set_vbus_discharge(&mut self, _enable: bool) {}

    /// The present output voltage of a programmable supply, if any.
    fn pps_voltage(&self) -> Option<ElectricPotential> {
        None
    }

    /// Country codes for which country information is available.
    fn country_codes(&self) -> &[u16] {
        &[]
    }

    /// Called when the engine enters error recovery.
    ///
    /// The Type-C layer is expected to detach and re-attach the port.
    fn error_recovery(&mut self) {}

    /// Called when a power role swap changed the power role.
    fn role_swapped(&mut self, _role: PowerRole) {}
}

/// Vendor defined message objects, including the VDM header.
pub type VdmObjects = Vec<u32, MAX_DATA_OBJECTS>;

/// A vendor defined message (VDM) engine.
///
/// The engine handles discovery and alternate modes. The port only dispatches messages
/// to it and transmits its responses.
pub trait VdmEngine {
    /// Process a received VDM, returning an optional response on the same SOP.
    fn process(&mut self, sop: Sop, objects: &[u32]) -> Option<VdmObjects>;

    /// Poll for a VDM to send on its own, e.g. discovery as DFP.
    fn poll(&mut self, _is_dfp: bool) -> Option<(Sop, VdmObjects)> {
        None
    }

    /// Whether an alternate mode is active.
    ///
    /// A data role swap during an active mode requires a hard reset.
    fn mode_entered(&self) -> bool {
        false
    }

    /// Drop all discovery and mode state.
    fn reset(&mut self) {}
}

/// A VDM engine that ignores all VDMs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVdm;

impl VdmEngine for NoVdm {
    fn process(&mut self, _sop: Sop, _objects: &[u32]) -> Option<VdmObjects> {
        None
    }
}
