//! Runtime configuration of a port.
use uom::si::power::watt;

use crate::protocol_layer::message::header::SpecificationRevision;
use crate::units::Power;

/// The Type-C port type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PortType {
    /// Source only.
    Source,
    /// Sink only.
    Sink,
    /// Dual-role power.
    Drp,
}

/// How a sink requests power from a source.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SinkRequestPolicy {
    /// The maximum power the sink may draw.
    pub max_power: Power,
    /// The power the sink operates at.
    pub operating_power: Power,
    /// The sink can reduce its consumption on a GotoMin message.
    pub goto_min_compatible: bool,
    /// The sink shall not be suspended during USB suspend.
    pub no_usb_suspend: bool,
    /// The sink has USB data lines.
    pub usb_comm_capable: bool,
}

impl Default for SinkRequestPolicy {
    fn default() -> Self {
        Self {
            max_power: Power::new::<watt>(15),
            operating_power: Power::new::<watt>(15),
            goto_min_compatible: false,
            no_usb_suspend: false,
            usb_comm_capable: false,
        }
    }
}

/// Port configuration.
///
/// All fields are evaluated at runtime, so one build can serve source, sink and
/// dual-role ports.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortConfig {
    /// Identifies the port in notifications.
    pub port_id: u8,
    /// The Type-C port type.
    pub port_type: PortType,
    /// The highest supported specification revision.
    pub spec_revision: SpecificationRevision,

    /// Accept a power role swap while being the source.
    pub accepts_pr_swap_as_source: bool,
    /// Accept a power role swap while being the sink.
    pub accepts_pr_swap_as_sink: bool,
    /// Request a power role swap once a contract as source exists.
    pub requests_pr_swap_as_source: bool,
    /// Request a power role swap once a contract as sink exists.
    pub requests_pr_swap_as_sink: bool,

    /// Accept a data role swap that makes this port the DFP.
    pub dr_swap_to_dfp: bool,
    /// Accept a data role swap that makes this port the UFP.
    pub dr_swap_to_ufp: bool,
    /// Accept a VCONN swap that makes this port the VCONN source.
    pub vconn_swap_to_on: bool,
    /// Accept a VCONN swap that stops this port from sourcing VCONN.
    pub vconn_swap_to_off: bool,
    /// The port switches VCONN itself when it becomes the VCONN source.
    pub sources_vconn: bool,

    /// Communication with SOP' is supported.
    pub sop_prime_capable: bool,
    /// Communication with SOP'' is supported.
    pub sop_double_prime_capable: bool,

    /// Retries are performed by the engine instead of the PHY.
    pub manual_retries: bool,
    /// Use the CRC check indication instead of GoodCRC-sent, for PHYs that report
    /// GoodCRC-sent too late.
    pub good_crc_workaround: bool,
    /// The port has an external power supply.
    pub externally_powered: bool,
    /// Perform VDM discovery as DFP.
    pub vdm_enabled: bool,
    /// Extended messages are supported.
    pub extended_messages: bool,

    /// Sink request policy.
    pub sink: SinkRequestPolicy,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            port_id: 0,
            port_type: PortType::Sink,
            spec_revision: SpecificationRevision::R3_X,
            accepts_pr_swap_as_source: true,
            accepts_pr_swap_as_sink: true,
            requests_pr_swap_as_source: false,
            requests_pr_swap_as_sink: false,
            dr_swap_to_dfp: true,
            dr_swap_to_ufp: true,
            vconn_swap_to_on: true,
            vconn_swap_to_off: true,
            sources_vconn: true,
            sop_prime_capable: false,
            sop_double_prime_capable: false,
            manual_retries: false,
            good_crc_workaround: false,
            externally_powered: false,
            vdm_enabled: false,
            extended_messages: true,
            sink: SinkRequestPolicy::default(),
        }
    }
}

impl PortConfig {
    /// Whether the port can take both power roles.
    pub fn is_drp(&self) -> bool {
        self.port_type == PortType::Drp
    }

    /// The number of hardware retries, depending on the negotiated revision.
    pub fn hardware_retries(&self, revision: SpecificationRevision) -> u8 {
        if self.manual_retries {
            0
        } else if revision == SpecificationRevision::R2_0 {
            3
        } else {
            2
        }
    }
}
