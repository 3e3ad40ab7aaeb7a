//! The policy engine, for both power roles.
//!
//! Every call advances the engine by one step. Multi-step states carry their progress
//! in a step enum, so that a state is never re-entered from its start by accident.
//! The engine reads received messages from the protocol layer and leaves a message
//! pending, unless the present state consumes it.
use heapless::Vec;

use crate::_20millivolts_mod::_20millivolts;
use crate::dpm::{DevicePolicyManager, VdmEngine};
use crate::observer::{Event, EventPayload, EventSink};
use crate::port::{Error, Port, TxOwner};
use crate::protocol_layer::message::data::Data;
use crate::protocol_layer::message::data::alert::AlertDataObject;
use crate::protocol_layer::message::data::bist::{BistDataObject, BistMode};
use crate::protocol_layer::message::data::source_capabilities::PowerDataObject;
use crate::protocol_layer::message::extended::{CountryInfo, Extended, MAX_COUNTRY_CODES, PpsStatus};
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, ExtendedMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::message::{Message, Payload};
use crate::protocol_layer::{Received, Sop, TxStatus};
use crate::timers::{Clock, TimerType};
use crate::{DataRole, PowerRole, Transceiver};

/// vSafe5V in 50 mV units.
const VSAFE5V_RAW: u16 = 100;

mod sink;
mod source;
mod swap;

#[cfg(test)]
mod tests;

/// Progress of a request and response exchange.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Exchange {
    /// Send the request.
    #[default]
    Send,
    /// Wait for the response.
    AwaitResponse,
}

/// Progress of the source startup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StartupStep {
    /// Reset roles, counters and the protocol layer.
    #[default]
    Init,
    /// Wait for VBUS at vSafe5V.
    WaitVbus,
    /// Let VBUS settle.
    SwitchDelay,
}

/// Progress of the source discovery.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiscoveryStep {
    /// Start the capability timer.
    #[default]
    Start,
    /// Wait for it.
    Wait,
}

/// Progress of the source return to default after a hard reset.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SourceDefaultStep {
    /// Wait for the hard reset signaling to finish.
    #[default]
    WaitHardReset,
    /// Remove VBUS and VCONN.
    PowerOff,
    /// Wait for VBUS at vSafe0V.
    WaitVsafe0v,
    /// Wait for the recovery time.
    WaitRecover,
    /// Restore VBUS and VCONN.
    PowerOn,
}

/// Progress of the sink return to default after a hard reset.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SinkDefaultStep {
    /// Drop the contract and return to default roles.
    #[default]
    Start,
    /// Wait for the source to remove VBUS.
    WaitVbusOff,
    /// Wait for the source to restore VBUS.
    WaitVbusOn,
    /// Restart.
    Done,
}

/// Progress of a source supply transition.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransitionSupplyStep {
    /// Accept the request.
    #[default]
    Accept,
    /// Adopt the request as the contract.
    Prepare,
    /// Let the sink prepare for the transition.
    WaitTransition,
    /// Switch the supply.
    Switch,
    /// Wait for the supply to settle.
    WaitSupply,
    /// Tell the sink that the supply is ready.
    PsRdy,
}

/// Progress of a GotoMin sequence.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GotoMinStep {
    /// Send GotoMin.
    #[default]
    Send,
    /// Let the sink reduce its consumption.
    WaitTransition,
    /// Tell the sink that the supply is ready.
    PsRdy,
}

/// Progress of a VCONN swap, in either direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VconnSwapStep {
    /// Send the request, or the response.
    #[default]
    Message,
    /// Wait for the response to the request.
    AwaitResponse,
    /// Turn VCONN on, or prepare to turn it off.
    Switch,
    /// Wait for the new VCONN source.
    AwaitPsRdy,
    /// Let VCONN settle.
    Settle,
    /// Tell the partner that VCONN is on.
    SendPsRdy,
}

/// Progress of a power role swap from source to sink.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SourcePrSwapStep {
    /// Send the request, or the response.
    #[default]
    Message,
    /// Wait for the response to the request.
    AwaitAccept,
    /// Remove VBUS.
    PowerOff,
    /// Wait for VBUS at vSafe0V.
    WaitVsafe0v,
    /// Let VBUS settle at vSafe0V.
    WaitTransition,
    /// Tell the partner that VBUS is off.
    SendPsRdy,
    /// Wait for the new source.
    AwaitPsRdy,
    /// Restart as sink.
    Finish,
}

/// Progress of a power role swap from sink to source.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SinkPrSwapStep {
    /// Send the request, or the response.
    #[default]
    Message,
    /// Wait for the response to the request.
    AwaitAccept,
    /// Wait for the old source to remove VBUS.
    AwaitPsRdy,
    /// Wait for VBUS at vSafe5V.
    WaitVsafe5v,
    /// Let VBUS settle.
    SwitchDelay,
    /// Tell the partner that VBUS is on.
    SendPsRdy,
}

/// Progress of BIST carrier mode 2.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BistStep {
    /// Start the carrier.
    #[default]
    Start,
    /// Transmit for the BIST period.
    Transmit,
    /// Let the line settle.
    Settle,
}

/// Policy engine states.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PolicyState {
    /// The port is detached.
    Disabled,
    ErrorRecovery,
    /// Respond with Reject or Not_Supported.
    NotSupported,
    InvalidState,
    /// Send a VDM on behalf of the VDM engine.
    GiveVdm,
    GiveCountryCodes,
    GetCountryCodes,
    GiveCountryInfo(u16),
    GivePpsStatus,
    GetPpsStatus(Exchange),
    BistCarrierMode2(BistStep),
    /// Receive test data until a hard reset.
    BistTestData,

    SourceSendHardReset,
    SourceSendSoftReset(Exchange),
    SourceSoftReset,
    SourceStartup(StartupStep),
    SourceDiscovery(DiscoveryStep),
    SourceSendCaps(Exchange),
    SourceDisabled,
    SourceTransitionDefault(SourceDefaultStep),
    SourceNegotiateCap,
    SourceCapabilityResponse,
    SourceWaitNewCapabilities,
    SourceTransitionSupply(TransitionSupplyStep),
    SourceReady,
    SourceGiveSourceCaps,
    SourceGetSinkCaps(Exchange),
    SourceSendPing,
    SourceGotoMin(GotoMinStep),
    SourceGiveSinkCaps,
    SourceGetSourceCaps,
    SourceSendDrSwap(Exchange),
    SourceEvaluateDrSwap,
    SourceSendVconnSwap(VconnSwapStep),
    SourceEvaluateVconnSwap(VconnSwapStep),
    SourceSendPrSwap(SourcePrSwapStep),
    SourceEvaluatePrSwap(SourcePrSwapStep),
    SourceAlertReceived(AlertDataObject),

    SinkStartup,
    SinkSendHardReset,
    SinkSoftReset,
    SinkSendSoftReset(Exchange),
    SinkTransitionDefault(SinkDefaultStep),
    SinkDiscovery,
    SinkWaitCaps,
    SinkEvaluateCaps,
    SinkSelectCapability(Exchange),
    SinkTransitionSink,
    SinkReady,
    SinkGiveSinkCap,
    SinkGetSourceCap,
    SinkGetSinkCap,
    SinkGiveSourceCap,
    SinkSendDrSwap(Exchange),
    SinkEvaluateDrSwap,
    SinkSendVconnSwap(VconnSwapStep),
    SinkEvaluateVconnSwap(VconnSwapStep),
    SinkSendPrSwap(SinkPrSwapStep),
    SinkEvaluatePrSwap(SinkPrSwapStep),
    SinkAlertReceived(AlertDataObject),
}

impl PolicyState {
    /// The identifier of the state, as written to the state log.
    ///
    /// Steps within a state share its identifier.
    pub fn id(&self) -> u8 {
        match self {
            Self::Disabled => 0,
            Self::ErrorRecovery => 1,
            Self::NotSupported => 2,
            Self::InvalidState => 3,
            Self::GiveVdm => 4,
            Self::GiveCountryCodes => 5,
            Self::GetCountryCodes => 6,
            Self::GiveCountryInfo(_) => 7,
            Self::GivePpsStatus => 8,
            Self::GetPpsStatus(_) => 9,
            Self::BistCarrierMode2(_) => 10,
            Self::BistTestData => 11,

            Self::SourceSendHardReset => 20,
            Self::SourceSendSoftReset(_) => 21,
            Self::SourceSoftReset => 22,
            Self::SourceStartup(_) => 23,
            Self::SourceDiscovery(_) => 24,
            Self::SourceSendCaps(_) => 25,
            Self::SourceDisabled => 26,
            Self::SourceTransitionDefault(_) => 27,
            Self::SourceNegotiateCap => 28,
            Self::SourceCapabilityResponse => 29,
            Self::SourceWaitNewCapabilities => 30,
            Self::SourceTransitionSupply(_) => 31,
            Self::SourceReady => 32,
            Self::SourceGiveSourceCaps => 33,
            Self::SourceGetSinkCaps(_) => 34,
            Self::SourceSendPing => 35,
            Self::SourceGotoMin(_) => 36,
            Self::SourceGiveSinkCaps => 37,
            Self::SourceGetSourceCaps => 38,
            Self::SourceSendDrSwap(_) => 39,
            Self::SourceEvaluateDrSwap => 40,
            Self::SourceSendVconnSwap(_) => 41,
            Self::SourceEvaluateVconnSwap(_) => 42,
            Self::SourceSendPrSwap(_) => 43,
            Self::SourceEvaluatePrSwap(_) => 44,
            Self::SourceAlertReceived(_) => 45,

            Self::SinkStartup => 60,
            Self::SinkSendHardReset => 61,
            Self::SinkSoftReset => 62,
            Self::SinkSendSoftReset(_) => 63,
            Self::SinkTransitionDefault(_) => 64,
            Self::SinkDiscovery => 65,
            Self::SinkWaitCaps => 66,
            Self::SinkEvaluateCaps => 67,
            Self::SinkSelectCapability(_) => 68,
            Self::SinkTransitionSink => 69,
            Self::SinkReady => 70,
            Self::SinkGiveSinkCap => 71,
            Self::SinkGetSourceCap => 72,
            Self::SinkGetSinkCap => 73,
            Self::SinkGiveSourceCap => 74,
            Self::SinkSendDrSwap(_) => 75,
            Self::SinkEvaluateDrSwap => 76,
            Self::SinkSendVconnSwap(_) => 77,
            Self::SinkEvaluateVconnSwap(_) => 78,
            Self::SinkSendPrSwap(_) => 79,
            Self::SinkEvaluatePrSwap(_) => 80,
            Self::SinkAlertReceived(_) => 81,
        }
    }
}

/// The outcome of a send helper call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendStatus {
    /// The message is on its way.
    Busy,
    /// The message was acknowledged, the engine moved to the next state.
    Success,
    /// The message failed, the engine moved to a reset state.
    Error,
}

impl<DRIVER, CLOCK, DPM, EVENTS, VDM> Port<DRIVER, CLOCK, DPM, EVENTS, VDM>
where
    DRIVER: Transceiver,
    CLOCK: Clock,
    DPM: DevicePolicyManager,
    EVENTS: EventSink,
    VDM: VdmEngine,
{
    /// Run the handler of the present state.
    pub(crate) fn run_policy(&mut self) -> Result<(), Error> {
        match self.state {
            PolicyState::Disabled => Ok(()),
            PolicyState::ErrorRecovery => self.error_recovery(),
            PolicyState::NotSupported => self.not_supported(),
            PolicyState::InvalidState => {
                let state = self.hard_reset_state();
                self.set_state(state);
                Ok(())
            }
            PolicyState::GiveVdm => self.give_vdm(),
            PolicyState::GiveCountryCodes => self.give_country_codes(),
            PolicyState::GetCountryCodes => {
                let ready = self.ready_state();
                self.send_control(Sop::Sop, ControlMessageType::GetCountryCodes, ready)?;
                Ok(())
            }
            PolicyState::GiveCountryInfo(code) => self.give_country_info(code),
            PolicyState::GivePpsStatus => self.give_pps_status(),
            PolicyState::GetPpsStatus(step) => self.get_pps_status(step),
            PolicyState::BistCarrierMode2(step) => self.bist_carrier_mode(step),
            PolicyState::BistTestData => Ok(()),

            PolicyState::SourceSendHardReset | PolicyState::SinkSendHardReset => self.send_hard_reset(),
            PolicyState::SourceSendSoftReset(step) => self.source_send_soft_reset(step),
            PolicyState::SourceSoftReset => self.source_soft_reset(),
            PolicyState::SourceStartup(step) => self.source_startup(step),
            PolicyState::SourceDiscovery(step) => self.source_discovery(step),
            PolicyState::SourceSendCaps(step) => self.source_send_caps(step),
            PolicyState::SourceDisabled => Ok(()),
            PolicyState::SourceTransitionDefault(step) => self.source_transition_default(step),
            PolicyState::SourceNegotiateCap => self.source_negotiate_cap(),
            PolicyState::SourceCapabilityResponse => self.source_capability_response(),
            PolicyState::SourceWaitNewCapabilities => {
                if core::mem::take(&mut self.caps_changed) {
                    self.set_state(PolicyState::SourceSendCaps(Exchange::Send));
                }
                Ok(())
            }
            PolicyState::SourceTransitionSupply(step) => self.source_transition_supply(step),
            PolicyState::SourceReady => self.source_ready(),
            PolicyState::SourceGiveSourceCaps => {
                self.send_data(Sop::Sop, PolicyState::SourceReady, |port| {
                    Data::SourceCapabilities(port.dpm.source_capabilities())
                })?;
                Ok(())
            }
            PolicyState::SourceGetSinkCaps(step) => self.source_get_sink_caps(step),
            PolicyState::SourceSendPing => {
                self.send_control(Sop::Sop, ControlMessageType::Ping, PolicyState::SourceReady)?;
                Ok(())
            }
            PolicyState::SourceGotoMin(step) => self.source_goto_min(step),
            PolicyState::SourceGiveSinkCaps | PolicyState::SinkGiveSinkCap => self.give_sink_caps(),
            PolicyState::SourceGetSourceCaps | PolicyState::SinkGetSourceCap => {
                let ready = self.ready_state();
                self.send_control(Sop::Sop, ControlMessageType::GetSourceCap, ready)?;
                Ok(())
            }
            PolicyState::SourceSendDrSwap(step) | PolicyState::SinkSendDrSwap(step) => self.send_dr_swap(step),
            PolicyState::SourceEvaluateDrSwap | PolicyState::SinkEvaluateDrSwap => self.evaluate_dr_swap(),
            PolicyState::SourceSendVconnSwap(step) | PolicyState::SinkSendVconnSwap(step) => {
                self.send_vconn_swap(step)
            }
            PolicyState::SourceEvaluateVconnSwap(step) | PolicyState::SinkEvaluateVconnSwap(step) => {
                self.evaluate_vconn_swap(step)
            }
            PolicyState::SourceSendPrSwap(step) => self.source_send_pr_swap(step),
            PolicyState::SourceEvaluatePrSwap(step) => self.source_evaluate_pr_swap(step),
            PolicyState::SourceAlertReceived(ado) | PolicyState::SinkAlertReceived(ado) => {
                self.alert_received(ado);
                Ok(())
            }

            PolicyState::SinkStartup => self.sink_startup(),
            PolicyState::SinkSoftReset => self.sink_soft_reset(),
            PolicyState::SinkSendSoftReset(step) => self.sink_send_soft_reset(step),
            PolicyState::SinkTransitionDefault(step) => self.sink_transition_default(step),
            PolicyState::SinkDiscovery => {
                self.start_timer(TimerType::TypeCSinkWaitCap);
                self.set_state(PolicyState::SinkWaitCaps);
                Ok(())
            }
            PolicyState::SinkWaitCaps => self.sink_wait_caps(),
            PolicyState::SinkEvaluateCaps => self.sink_evaluate_caps(),
            PolicyState::SinkSelectCapability(step) => self.sink_select_capability(step),
            PolicyState::SinkTransitionSink => self.sink_transition_sink(),
            PolicyState::SinkReady => self.sink_ready(),
            PolicyState::SinkGetSinkCap => {
                self.send_control(Sop::Sop, ControlMessageType::GetSinkCap, PolicyState::SinkReady)?;
                Ok(())
            }
            PolicyState::SinkGiveSourceCap => self.give_source_caps(),
            PolicyState::SinkSendPrSwap(step) => self.sink_send_pr_swap(step),
            PolicyState::SinkEvaluatePrSwap(step) => self.sink_evaluate_pr_swap(step),
        }
    }

    pub(crate) fn start_timer(&mut self, timer_type: TimerType) {
        let now = self.clock.now();
        self.policy_timer.start_type(now, timer_type);
    }

    pub(crate) fn start_timer_ms(&mut self, period: u32) {
        let now = self.clock.now();
        self.policy_timer.start(now, period);
    }

    pub(crate) fn timer_expired(&mut self) -> bool {
        let now = self.clock.now();
        self.policy_timer.expired(now)
    }

    /// Wait for a response, optionally with a hard reset when none arrives.
    pub(crate) fn await_response(&mut self, hard_reset_on_timeout: bool) {
        self.start_timer(TimerType::SenderResponse);
        self.protocol.set_waiting_on_hard_reset(hard_reset_on_timeout);
    }

    /// Take the pending message, and remember its SOP for responses.
    pub(crate) fn take_message(&mut self) -> Option<Received> {
        let received = self.protocol.take_received()?;
        self.rx_sop = received.sop;
        Some(received)
    }

    pub(crate) fn ready_state(&self) -> PolicyState {
        if self.is_source {
            PolicyState::SourceReady
        } else {
            PolicyState::SinkReady
        }
    }

    pub(crate) fn hard_reset_state(&self) -> PolicyState {
        if self.is_source {
            PolicyState::SourceSendHardReset
        } else {
            PolicyState::SinkSendHardReset
        }
    }

    pub(crate) fn send_soft_reset_state(&self) -> PolicyState {
        if self.is_source {
            PolicyState::SourceSendSoftReset(Exchange::Send)
        } else {
            PolicyState::SinkSendSoftReset(Exchange::Send)
        }
    }

    pub(crate) fn soft_reset_state(&self) -> PolicyState {
        if self.is_source {
            PolicyState::SourceSoftReset
        } else {
            PolicyState::SinkSoftReset
        }
    }

    /// The header template for a transmission on `sop`.
    ///
    /// Messages to a cable plug carry zero role bits.
    fn tx_template(&self, sop: Sop) -> Header {
        let template = self.protocol.template();
        match sop {
            Sop::Sop => template,
            _ => template
                .with_port_power_role(PowerRole::Sink)
                .with_port_data_role(DataRole::Ufp),
        }
    }

    /// Drive the transmission of a message, and move on according to its result.
    ///
    /// The message is built and queued while the transmit path is idle. Once it is
    /// acknowledged, the engine moves to `next`. A failed message starts a soft reset,
    /// or a hard reset where a soft reset already failed. Too many collisions end in a
    /// hard reset.
    pub(crate) fn send(
        &mut self,
        sop: Sop,
        next: PolicyState,
        build: impl FnOnce(&Self, Header) -> Message,
    ) -> Result<SendStatus, Error> {
        match self.protocol.tx_status() {
            TxStatus::Idle => {
                let message = build(self, self.tx_template(sop));
                if let PolicyState::SourceSendCaps(_) = self.state {
                    self.caps_counter.advance();
                }
                let now = self.clock.now();
                self.protocol.transmit(now, sop, message)?;
                Ok(SendStatus::Busy)
            }
            TxStatus::Send | TxStatus::Busy | TxStatus::Wait => Ok(SendStatus::Busy),
            TxStatus::Success => {
                self.collision_counter.reset();
                self.set_state(next);
                Ok(SendStatus::Success)
            }
            TxStatus::Error => {
                let state = match self.state {
                    PolicyState::SourceSendSoftReset(_) | PolicyState::SinkSendSoftReset(_) => {
                        self.hard_reset_state()
                    }
                    PolicyState::SourceSendCaps(_) if !self.has_contract => {
                        PolicyState::SourceDiscovery(DiscoveryStep::Start)
                    }
                    _ => self.send_soft_reset_state(),
                };
                self.set_state(state);
                Ok(SendStatus::Error)
            }
            TxStatus::Collision => {
                if self.collision_counter.increment().is_err() {
                    warn!("Too many collisions");
                    self.hard_reset_by_protocol();
                    Ok(SendStatus::Error)
                } else {
                    self.protocol.set_tx_status(TxStatus::Idle);
                    Ok(SendStatus::Busy)
                }
            }
            TxStatus::Reset => {
                self.hard_reset_by_protocol();
                Ok(SendStatus::Error)
            }
        }
    }

    /// Have the protocol layer signal a hard reset on its next run.
    fn hard_reset_by_protocol(&mut self) {
        let state = self.hard_reset_state();
        self.set_state(state);
        if !self.is_hard_reset {
            self.is_hard_reset = true;
            self.hard_reset_counter.advance();
        }
        self.protocol.set_tx_status(TxStatus::Reset);
    }

    pub(crate) fn send_control(
        &mut self,
        sop: Sop,
        message_type: ControlMessageType,
        next: PolicyState,
    ) -> Result<SendStatus, Error> {
        self.send(sop, next, |_, template| {
            Message::new(Header::new_control(template, message_type))
        })
    }

    pub(crate) fn send_data(
        &mut self,
        sop: Sop,
        next: PolicyState,
        data: impl FnOnce(&Self) -> Data,
    ) -> Result<SendStatus, Error> {
        self.send(sop, next, |port, template| {
            let data = data(port);
            let message_type = data.message_type().unwrap_or(DataMessageType::Reserved);
            Message::new_with_data(Header::new_data(template, message_type, 0), data)
        })
    }

    pub(crate) fn send_extended(
        &mut self,
        sop: Sop,
        next: PolicyState,
        extended: impl FnOnce(&Self) -> Extended,
    ) -> Result<SendStatus, Error> {
        self.send(sop, next, |port, template| {
            let extended = extended(port);
            let message_type = extended.message_type().unwrap_or(ExtendedMessageType::Reserved);
            Message::new_with_extended(Header::new_extended(template, message_type), extended)
        })
    }

    fn error_recovery(&mut self) -> Result<(), Error> {
        warn!("Error recovery");
        self.dpm.error_recovery();
        self.disable()
    }

    fn not_supported(&mut self) -> Result<(), Error> {
        let response = if self.revision == SpecificationRevision::R2_0 {
            ControlMessageType::Reject
        } else {
            ControlMessageType::NotSupported
        };
        let ready = self.ready_state();
        self.send_control(self.rx_sop, response, ready)?;
        Ok(())
    }

    fn give_vdm(&mut self) -> Result<(), Error> {
        let ready = self.ready_state();
        let Some((sop, objects)) = self.vdm_tx.clone() else {
            self.set_state(ready);
            return Ok(());
        };

        match self.send_data(sop, ready, |_| Data::VendorDefined(objects))? {
            SendStatus::Busy => (),
            SendStatus::Success => self.vdm_tx = None,
            SendStatus::Error => {
                // A failed VDM is not worth a reset.
                self.vdm_tx = None;
                self.set_state(ready);
            }
        }
        Ok(())
    }

    fn give_country_codes(&mut self) -> Result<(), Error> {
        let ready = self.ready_state();
        self.send_extended(self.rx_sop, ready, |port| {
            let codes: Vec<u16, MAX_COUNTRY_CODES> =
                port.dpm.country_codes().iter().copied().take(MAX_COUNTRY_CODES).collect();
            Extended::CountryCodes(codes)
        })?;
        Ok(())
    }

    fn give_country_info(&mut self, country_code: u16) -> Result<(), Error> {
        let ready = self.ready_state();
        self.send_extended(self.rx_sop, ready, |_| {
            Extended::CountryInfo(CountryInfo {
                country_code,
                info: Vec::new(),
            })
        })?;
        Ok(())
    }

    fn give_pps_status(&mut self) -> Result<(), Error> {
        let ready = self.ready_state();
        self.send_extended(self.rx_sop, ready, |port| {
            let voltage = port
                .dpm
                .pps_voltage()
                .map_or(0xffff, |voltage| voltage.get::<_20millivolts>() as u16);
            Extended::PpsStatus(
                PpsStatus::default()
                    .with_raw_output_voltage(voltage)
                    .with_raw_output_current(0xff),
            )
        })?;
        Ok(())
    }

    fn get_pps_status(&mut self, step: Exchange) -> Result<(), Error> {
        match step {
            Exchange::Send => {
                let next = PolicyState::GetPpsStatus(Exchange::AwaitResponse);
                if self.send_control(Sop::Sop, ControlMessageType::GetPpsStatus, next)? == SendStatus::Success {
                    self.await_response(false);
                }
            }
            Exchange::AwaitResponse => {
                if let Some(received) = self.take_message() {
                    let state = match received.message.extended() {
                        Some(Extended::PpsStatus(status)) => {
                            debug!("PPS status {:?}", status);
                            self.ready_state()
                        }
                        _ => self.hard_reset_state(),
                    };
                    self.set_state(state);
                } else if self.timer_expired() {
                    let ready = self.ready_state();
                    self.set_state(ready);
                }
            }
        }
        Ok(())
    }

    fn give_sink_caps(&mut self) -> Result<(), Error> {
        let ready = self.ready_state();
        if self.config.is_drp() || !self.is_source {
            self.send_data(self.rx_sop, ready, |port| Data::SinkCapabilities(port.dpm.sink_capabilities()))?;
        } else {
            self.send_control(self.rx_sop, ControlMessageType::Reject, ready)?;
        }
        Ok(())
    }

    fn give_source_caps(&mut self) -> Result<(), Error> {
        let ready = self.ready_state();
        if self.config.is_drp() || self.is_source {
            self.send_data(self.rx_sop, ready, |port| {
                Data::SourceCapabilities(port.dpm.source_capabilities())
            })?;
        } else {
            self.send_control(self.rx_sop, ControlMessageType::Reject, ready)?;
        }
        Ok(())
    }

    fn alert_received(&mut self, ado: AlertDataObject) {
        if ado.is_relevant(self.is_source) {
            self.notify(Event::AlertEvent, EventPayload::Alert(ado.0));
        }
        let ready = self.ready_state();
        self.set_state(ready);
    }

    /// Whether the contract is at vSafe5V, the precondition for BIST.
    fn contract_at_vsafe5v(&self) -> bool {
        if !self.has_contract {
            return false;
        }

        let position = self.contract.object_position();
        let pdo = if self.is_source {
            self.dpm.source_capabilities().at_position(position).copied()
        } else {
            self.partner_source_caps.at_position(position).copied()
        };
        matches!(pdo, Some(PowerDataObject::FixedSupply(supply)) if supply.raw_voltage() == VSAFE5V_RAW)
    }

    fn process_bist(&mut self, bdo: BistDataObject) -> Result<(), Error> {
        if !self.contract_at_vsafe5v() {
            debug!("Ignoring BIST outside of a vSafe5V contract");
            let ready = self.ready_state();
            self.set_state(ready);
            return Ok(());
        }

        self.notify(Event::BistEnabled, EventPayload::None);
        match bdo.mode() {
            BistMode::CarrierMode2 => self.set_state(PolicyState::BistCarrierMode2(BistStep::Start)),
            _mode => {
                debug!("BIST {:?}, receiving test data", _mode);
                self.protocol.driver_mut().set_rx_auto_flush(true)?;
                self.protocol.disable();
                self.set_state(PolicyState::BistTestData);
            }
        }
        Ok(())
    }

    fn bist_carrier_mode(&mut self, step: BistStep) -> Result<(), Error> {
        match step {
            BistStep::Start => {
                let driver = self.protocol.driver_mut();
                driver.set_bist_carrier_mode(true)?;
                driver.start_transmit()?;
                self.start_timer(TimerType::BISTContMode);
                self.set_state(PolicyState::BistCarrierMode2(BistStep::Transmit));
            }
            BistStep::Transmit => {
                if self.timer_expired() {
                    self.protocol.driver_mut().set_bist_carrier_mode(false)?;
                    self.notify(Event::BistDisabled, EventPayload::None);
                    self.start_timer(TimerType::GoodCRCDelay);
                    self.set_state(PolicyState::BistCarrierMode2(BistStep::Settle));
                }
            }
            BistStep::Settle => {
                if self.timer_expired() {
                    self.protocol.driver_mut().flush_tx()?;
                    let state = self.hard_reset_state();
                    self.set_state(state);
                }
            }
        }
        Ok(())
    }

    /// The state that a request for `message_type` starts from the ready state.
    fn request_state(&self, message_type: ControlMessageType) -> Option<PolicyState> {
        use ControlMessageType::*;

        Some(match (self.is_source, message_type) {
            (true, GetSinkCap) => PolicyState::SourceGetSinkCaps(Exchange::Send),
            (true, GetSourceCap) => PolicyState::SourceGetSourceCaps,
            (true, Ping) => PolicyState::SourceSendPing,
            (true, GotoMin) => PolicyState::SourceGotoMin(GotoMinStep::Send),
            (true, PrSwap) => PolicyState::SourceSendPrSwap(SourcePrSwapStep::Message),
            (true, DrSwap) => PolicyState::SourceSendDrSwap(Exchange::Send),
            (true, VconnSwap) => PolicyState::SourceSendVconnSwap(VconnSwapStep::Message),
            (true, SoftReset) => PolicyState::SourceSendSoftReset(Exchange::Send),
            (false, GetSinkCap) => PolicyState::SinkGetSinkCap,
            (false, GetSourceCap) => PolicyState::SinkGetSourceCap,
            (false, PrSwap) => PolicyState::SinkSendPrSwap(SinkPrSwapStep::Message),
            (false, DrSwap) => PolicyState::SinkSendDrSwap(Exchange::Send),
            (false, VconnSwap) => PolicyState::SinkSendVconnSwap(VconnSwapStep::Message),
            (false, SoftReset) => PolicyState::SinkSendSoftReset(Exchange::Send),
            (false, GetPpsStatus) => PolicyState::GetPpsStatus(Exchange::Send),
            (_, GetCountryCodes) => PolicyState::GetCountryCodes,
            _ => return None,
        })
    }

    /// Serve the pending transmit request.
    ///
    /// Requests without a sequence of their own are sent as they are. Their slot is
    /// freed once the transmission finished. Returns `false` if there was no request.
    fn serve_request(&mut self) -> Result<bool, Error> {
        let Some(request) = self.tx_request else {
            return Ok(false);
        };

        if let Some(state) = self.request_state(request.message_type) {
            trace!("{:?} requested by {:?}", request.message_type, request.owner);
            self.tx_request = None;
            self.set_state(state);
        } else {
            let ready = self.ready_state();
            if self.send_control(Sop::Sop, request.message_type, ready)? != SendStatus::Busy {
                self.tx_request = None;
            }
        }
        Ok(true)
    }

    /// Request a power role swap once, if the configuration prefers the other role.
    fn request_preferred_role(&mut self) -> bool {
        let (preferred, partner_drp) = if self.is_source {
            (
                self.config.requests_pr_swap_as_source,
                self.partner_sink_caps.as_ref().is_some_and(|caps| caps.dual_role_power()),
            )
        } else {
            (
                self.config.requests_pr_swap_as_sink,
                self.partner_source_caps.dual_role_power(),
            )
        };

        if self.pr_swap_attempted || !preferred || !partner_drp || !self.has_contract || !self.config.is_drp() {
            return false;
        }

        self.pr_swap_attempted = true;
        self.post_request(TxOwner::PolicyEngine, ControlMessageType::PrSwap).is_ok()
    }

    /// Let the VDM engine start a message, as DFP.
    fn poll_vdm(&mut self) -> bool {
        if !self.is_dfp || !self.config.vdm_enabled || self.protocol.tx_status() != TxStatus::Idle {
            return false;
        }

        match self.vdm.poll(self.is_dfp) {
            Some(vdm) => {
                self.vdm_tx = Some(vdm);
                self.set_state(PolicyState::GiveVdm);
                true
            }
            None => false,
        }
    }

    /// Handle a message in the ready state, that both power roles treat alike.
    fn ready_message(&mut self, received: Received) -> Result<(), Error> {
        let sop = received.sop;
        let state = match (received.message.header.message_type(), received.message.payload) {
            (MessageType::Control(control), _) => match control {
                ControlMessageType::DrSwap => {
                    if self.is_source {
                        PolicyState::SourceEvaluateDrSwap
                    } else {
                        PolicyState::SinkEvaluateDrSwap
                    }
                }
                ControlMessageType::PrSwap => {
                    if self.is_source {
                        PolicyState::SourceEvaluatePrSwap(SourcePrSwapStep::Message)
                    } else {
                        PolicyState::SinkEvaluatePrSwap(SinkPrSwapStep::Message)
                    }
                }
                ControlMessageType::VconnSwap => {
                    if self.is_source {
                        PolicyState::SourceEvaluateVconnSwap(VconnSwapStep::Message)
                    } else {
                        PolicyState::SinkEvaluateVconnSwap(VconnSwapStep::Message)
                    }
                }
                ControlMessageType::SoftReset => self.soft_reset_state(),
                ControlMessageType::GetCountryCodes => PolicyState::GiveCountryCodes,
                ControlMessageType::Accept
                | ControlMessageType::Reject
                | ControlMessageType::Wait
                | ControlMessageType::PsRdy => {
                    warn!("Unexpected {:?}", control);
                    self.send_soft_reset_state()
                }
                ControlMessageType::NotSupported => {
                    debug!("Partner does not support the last message");
                    self.ready_state()
                }
                _ => PolicyState::NotSupported,
            },
            (MessageType::Data(_), Some(Payload::Data(data))) => match data {
                Data::Alert(ado) => {
                    if self.is_source {
                        PolicyState::SourceAlertReceived(ado)
                    } else {
                        PolicyState::SinkAlertReceived(ado)
                    }
                }
                Data::VendorDefined(objects) => match self.vdm.process(sop, &objects) {
                    Some(response) => {
                        self.vdm_tx = Some((sop, response));
                        PolicyState::GiveVdm
                    }
                    None => self.ready_state(),
                },
                Data::Bist(bdo) => return self.process_bist(bdo),
                Data::GetCountryInfo(code) => PolicyState::GiveCountryInfo(code),
                _ => PolicyState::NotSupported,
            },
            (MessageType::Extended(message_type), _) => match message_type {
                ExtendedMessageType::PpsStatus
                | ExtendedMessageType::CountryCodes
                | ExtendedMessageType::CountryInfo => {
                    debug!("Received {:?}", message_type);
                    self.ready_state()
                }
                _ => PolicyState::NotSupported,
            },
            (MessageType::Data(_), _) => PolicyState::NotSupported,
        };

        self.set_state(state);
        Ok(())
    }
}
