//! Sink states.
use uom::si::electric_potential::millivolt;
use uom::si::power::milliwatt;

use super::{Exchange, PolicyState, SendStatus, SinkDefaultStep};
use crate::_20millivolts_mod::_20millivolts;
use crate::_50millivolts_mod::_50millivolts;
use crate::config::SinkRequestPolicy;
use crate::dpm::{DevicePolicyManager, VdmEngine};
use crate::observer::{Event, EventPayload, EventSink};
use crate::port::{Error, Port, VSAFE5V_DISCONNECT_MV};
use crate::protocol_layer::message::data::Data;
use crate::protocol_layer::message::data::request::{self, RawDataObject};
use crate::protocol_layer::message::data::source_capabilities::{PowerDataObject, SourceCapabilities};
use crate::protocol_layer::message::header::{ControlMessageType, MessageType};
use crate::protocol_layer::{Received, Sop};
use crate::timers::{Clock, TimerType};
use crate::units::ElectricPotential;
use crate::Transceiver;

/// Largest value of a 10-bit current field.
const MAX_RAW_CURRENT: u32 = 0x3ff;

/// Build a request for the most powerful fixed supply up to `max_voltage`.
///
/// Among objects of equal power, the later one wins. Returns `None` if no fixed
/// supply qualifies.
pub(crate) fn select_capability(
    caps: &SourceCapabilities,
    max_voltage: ElectricPotential,
    policy: &SinkRequestPolicy,
    vsafe5v_current: u16,
) -> Option<RawDataObject> {
    let max_raw_voltage = max_voltage.get::<_50millivolts>();

    let mut best: Option<(u8, u16, u16)> = None;
    let mut best_power = 0u32;
    for (index, pdo) in caps.pdos().iter().enumerate() {
        let PowerDataObject::FixedSupply(supply) = pdo else {
            continue;
        };
        if supply.raw_voltage() == 0 || u32::from(supply.raw_voltage()) > max_raw_voltage {
            continue;
        }

        let power = u32::from(supply.raw_voltage()) * u32::from(supply.raw_max_current());
        if power >= best_power {
            best_power = power;
            best = Some((index as u8 + 1, supply.raw_voltage(), supply.raw_max_current()));
        }
    }
    let (position, raw_voltage, offered) = best?;

    // Currents in 10 mA units, from mW and mV.
    let voltage_mv = u32::from(raw_voltage) * 50;
    let to_current = |power: u32| (power * 100 / voltage_mv).min(MAX_RAW_CURRENT) as u16;
    let mut operating = to_current(policy.operating_power.get::<milliwatt>());
    let mut maximum = to_current(policy.max_power.get::<milliwatt>());

    let mismatch = offered < maximum;
    if mismatch {
        maximum = vsafe5v_current;
        operating = offered;
    } else {
        operating = operating.min(offered);
    }

    let rdo = request::FixedVariableSupply::default()
        .with_object_position(position)
        .with_giveback_flag(policy.goto_min_compatible)
        .with_capability_mismatch(mismatch)
        .with_usb_communications_capable(policy.usb_comm_capable)
        .with_no_usb_suspend(policy.no_usb_suspend)
        .with_raw_operating_current(operating)
        .with_raw_max_operating_current(maximum);
    Some(RawDataObject(rdo.0))
}

/// The voltage below which the sink considers the source detached, under a contract.
pub(crate) fn detach_threshold(caps: &SourceCapabilities, contract: RawDataObject) -> ElectricPotential {
    match caps.at_position(contract.object_position()) {
        Some(PowerDataObject::Pps(_)) => {
            ElectricPotential::new::<_20millivolts>(request::Pps(contract.0).raw_output_voltage().into())
        }
        Some(PowerDataObject::FixedSupply(supply)) if supply.raw_voltage() != super::VSAFE5V_RAW => {
            ElectricPotential::new::<_50millivolts>(supply.raw_voltage().into())
        }
        Some(PowerDataObject::VariableSupply(supply)) => {
            ElectricPotential::new::<_50millivolts>(supply.raw_min_voltage().into())
        }
        Some(PowerDataObject::Battery(supply)) => ElectricPotential::new::<_50millivolts>(supply.raw_min_voltage().into()),
        _ => ElectricPotential::new::<millivolt>(VSAFE5V_DISCONNECT_MV),
    }
}

impl<DRIVER, CLOCK, DPM, EVENTS, VDM> Port<DRIVER, CLOCK, DPM, EVENTS, VDM>
where
    DRIVER: Transceiver,
    CLOCK: Clock,
    DPM: DevicePolicyManager,
    EVENTS: EventSink,
    VDM: VdmEngine,
{
    pub(super) fn sink_startup(&mut self) -> Result<(), Error> {
        self.is_source = false;
        self.is_hard_reset = false;
        self.is_pr_swap = false;
        self.pps_enabled = false;
        self.apply_roles()?;
        self.reset_protocol_layer(false)?;

        let driver = self.protocol.driver_mut();
        driver.set_rx_auto_flush(false)?;
        driver.set_auto_good_crc(true)?;
        driver.enable_receiver(true)?;

        self.caps_counter.reset();
        self.collision_counter.reset();
        self.policy_timer.disable();
        self.pps_timer.disable();
        self.swap_source_start.disable();
        self.vdm.reset();
        self.set_state(PolicyState::SinkDiscovery);
        Ok(())
    }

    fn wait_for_caps(&mut self) {
        self.set_state(PolicyState::SinkWaitCaps);
        self.start_timer(TimerType::TypeCSinkWaitCap);
    }

    /// Take in new source capabilities and evaluate them.
    fn accept_source_caps(&mut self, received: &Received, caps: &SourceCapabilities) -> Result<(), Error> {
        self.partner_source_caps = caps.clone();
        self.align_revision(received.message.header)?;
        self.set_state(PolicyState::SinkEvaluateCaps);
        Ok(())
    }

    pub(super) fn sink_soft_reset(&mut self) -> Result<(), Error> {
        if self.send_control(Sop::Sop, ControlMessageType::Accept, PolicyState::SinkWaitCaps)? == SendStatus::Success {
            self.start_timer(TimerType::TypeCSinkWaitCap);
        }
        Ok(())
    }

    pub(super) fn sink_send_soft_reset(&mut self, step: Exchange) -> Result<(), Error> {
        match step {
            Exchange::Send => {
                let next = PolicyState::SinkSendSoftReset(Exchange::AwaitResponse);
                if self.send_control(Sop::Sop, ControlMessageType::SoftReset, next)? == SendStatus::Success {
                    self.await_response(true);
                }
            }
            Exchange::AwaitResponse => {
                if let Some(received) = self.take_message() {
                    if received.message.header.is_control(ControlMessageType::Accept) {
                        self.wait_for_caps();
                    } else {
                        self.set_state(PolicyState::SinkSendHardReset);
                    }
                } else if self.timer_expired() {
                    self.set_state(PolicyState::SinkSendHardReset);
                }
            }
        }
        Ok(())
    }

    pub(super) fn sink_transition_default(&mut self, step: SinkDefaultStep) -> Result<(), Error> {
        match step {
            SinkDefaultStep::Start => {
                self.protocol.driver_mut().enable_receiver(false)?;
                self.is_hard_reset = true;
                self.has_contract = false;
                self.pps_enabled = false;
                self.pps_timer.disable();
                self.revision = self.config.spec_revision;
                self.update_template();
                self.detach_threshold = ElectricPotential::new::<millivolt>(VSAFE5V_DISCONNECT_MV);
                self.notify(Event::BistDisabled, EventPayload::None);
                self.notify(Event::NoContract, EventPayload::None);

                if self.is_dfp {
                    self.is_dfp = false;
                    self.apply_roles()?;
                    self.protocol.driver_mut().enable_sop_prime(false, false)?;
                }
                if self.is_vconn_source {
                    self.is_vconn_source = false;
                    self.protocol.driver_mut().set_vconn(false)?;
                }
                let driver = self.protocol.driver_mut();
                driver.flush_tx()?;
                driver.flush_rx()?;
                self.reset_protocol_layer(true)?;

                self.set_state(PolicyState::SinkTransitionDefault(SinkDefaultStep::WaitVbusOff));
                self.start_timer_ms(TimerType::PSHardResetMax.duration_ms() + TimerType::Safe0V.duration_ms());
            }
            SinkDefaultStep::WaitVbusOff => {
                if self.protocol.status().vbus_vsafe0v {
                    self.set_state(PolicyState::SinkTransitionDefault(SinkDefaultStep::WaitVbusOn));
                    self.start_timer_ms(TimerType::SrcRecoverMax.duration_ms() + TimerType::SrcTurnOn.duration_ms());
                } else if self.timer_expired() {
                    self.hard_reset_timed_out();
                }
            }
            SinkDefaultStep::WaitVbusOn => {
                if self.protocol.status().vbus_vsafe5v {
                    self.set_state(PolicyState::SinkTransitionDefault(SinkDefaultStep::Done));
                } else if self.timer_expired() {
                    self.hard_reset_timed_out();
                }
            }
            SinkDefaultStep::Done => {
                self.policy_timer.disable();
                self.set_state(PolicyState::SinkStartup);
            }
        }
        Ok(())
    }

    /// The source did not cycle VBUS in time.
    fn hard_reset_timed_out(&mut self) {
        let state = if self.hard_reset_counter.exceeded() {
            PolicyState::ErrorRecovery
        } else {
            PolicyState::SinkStartup
        };
        self.set_state(state);
    }

    pub(super) fn sink_wait_caps(&mut self) -> Result<(), Error> {
        if let Some(received) = self.take_message() {
            if let Some(Data::SourceCapabilities(caps)) = received.message.data() {
                let caps = caps.clone();
                return self.accept_source_caps(&received, &caps);
            }
            if received.message.header.is_control(ControlMessageType::SoftReset) {
                self.set_state(PolicyState::SinkSoftReset);
            }
            return Ok(());
        }

        if self.has_contract && self.hard_reset_counter.exceeded() {
            self.set_state(PolicyState::ErrorRecovery);
        } else if self.timer_expired() && !self.hard_reset_counter.exceeded() {
            warn!("No source capabilities");
            self.set_state(PolicyState::SinkSendHardReset);
        }
        Ok(())
    }

    pub(super) fn sink_evaluate_caps(&mut self) -> Result<(), Error> {
        self.hard_reset_counter.reset();

        let sink_caps = self.dpm.sink_capabilities();
        let max_voltage = sink_caps
            .max_voltage()
            .unwrap_or_else(|| ElectricPotential::new::<_50millivolts>(super::VSAFE5V_RAW.into()));
        let vsafe5v_current = sink_caps.vsafe_5v().map_or(0, |pdo| pdo.raw_operational_current());

        match select_capability(&self.partner_source_caps, max_voltage, &self.config.sink, vsafe5v_current) {
            Some(rdo) => {
                debug!("Selected {:?}", rdo);
                self.sink_request = rdo;
                self.set_state(PolicyState::SinkSelectCapability(Exchange::Send));
            }
            None => {
                warn!("No suitable source capability");
                self.wait_for_caps();
            }
        }
        Ok(())
    }

    pub(super) fn sink_select_capability(&mut self, step: Exchange) -> Result<(), Error> {
        match step {
            Exchange::Send => {
                let next = PolicyState::SinkSelectCapability(Exchange::AwaitResponse);
                if self.send_data(Sop::Sop, next, |port| Data::Request(port.sink_request))? == SendStatus::Success {
                    self.await_response(true);
                }
            }
            Exchange::AwaitResponse => {
                let Some(received) = self.take_message() else {
                    if self.timer_expired() {
                        self.set_state(PolicyState::SinkSendHardReset);
                    }
                    return Ok(());
                };

                match received.message.header.message_type() {
                    MessageType::Control(ControlMessageType::Accept) => self.request_accepted(),
                    MessageType::Control(ControlMessageType::Wait | ControlMessageType::Reject) => {
                        if self.has_contract {
                            self.set_state(PolicyState::SinkReady);
                        } else {
                            self.hard_reset_counter.saturate();
                            self.wait_for_caps();
                        }
                    }
                    MessageType::Control(ControlMessageType::SoftReset) => self.set_state(PolicyState::SinkSoftReset),
                    _ => {
                        if let Some(Data::SourceCapabilities(caps)) = received.message.data() {
                            let caps = caps.clone();
                            return self.accept_source_caps(&received, &caps);
                        }
                        self.set_state(PolicyState::SinkSendSoftReset(Exchange::Send));
                    }
                }
            }
        }
        Ok(())
    }

    fn request_accepted(&mut self) {
        self.pps_enabled = matches!(
            self.partner_source_caps.at_position(self.sink_request.object_position()),
            Some(PowerDataObject::Pps(_))
        );
        self.has_contract = true;
        self.contract = self.sink_request;

        self.set_state(PolicyState::SinkTransitionSink);
        self.start_timer(TimerType::PSTransition);
        let now = self.clock.now();
        if self.pps_enabled {
            self.pps_timer.start_type(now, TimerType::PPSRequest);
        } else {
            self.pps_timer.disable();
        }
    }

    pub(super) fn sink_transition_sink(&mut self) -> Result<(), Error> {
        let Some(received) = self.take_message() else {
            if self.timer_expired() {
                warn!("No PS_RDY from the source");
                self.set_state(PolicyState::SinkSendHardReset);
            }
            return Ok(());
        };

        match received.message.header.message_type() {
            MessageType::Control(ControlMessageType::PsRdy) => {
                self.policy_timer.disable();
                self.detach_threshold = detach_threshold(&self.partner_source_caps, self.contract);
                self.set_state(PolicyState::SinkReady);
                info!("New contract {:?}", self.contract);
                self.notify(Event::NewContract, EventPayload::Contract(self.contract.0));
            }
            MessageType::Control(ControlMessageType::SoftReset) => self.set_state(PolicyState::SinkSoftReset),
            _ => {
                if let Some(Data::SourceCapabilities(caps)) = received.message.data() {
                    let caps = caps.clone();
                    return self.accept_source_caps(&received, &caps);
                }
                self.set_state(PolicyState::SinkSendHardReset);
            }
        }
        Ok(())
    }

    pub(super) fn sink_ready(&mut self) -> Result<(), Error> {
        if self.is_source {
            self.set_state(PolicyState::InvalidState);
            return Ok(());
        }

        if let Some(received) = self.take_message() {
            return self.sink_ready_message(received);
        }

        if self.serve_request()? || self.request_preferred_role() || self.poll_vdm() {
            return Ok(());
        }

        // A programmable supply expects a request at least every PPSRequest.
        let now = self.clock.now();
        if self.pps_enabled && self.pps_timer.expired(now) {
            self.set_state(PolicyState::SinkSelectCapability(Exchange::Send));
        }
        Ok(())
    }

    fn sink_ready_message(&mut self, received: Received) -> Result<(), Error> {
        let state = match received.message.header.message_type() {
            MessageType::Control(ControlMessageType::GotoMin) => {
                self.set_state(PolicyState::SinkTransitionSink);
                self.start_timer(TimerType::PSTransition);
                return Ok(());
            }
            MessageType::Control(ControlMessageType::GetSinkCap) => PolicyState::SinkGiveSinkCap,
            MessageType::Control(ControlMessageType::GetSourceCap) => PolicyState::SinkGiveSourceCap,
            MessageType::Control(ControlMessageType::Ping) => PolicyState::SinkReady,
            MessageType::Control(ControlMessageType::GetPpsStatus) => PolicyState::NotSupported,
            _ => {
                if let Some(Data::SourceCapabilities(caps)) = received.message.data() {
                    let caps = caps.clone();
                    return self.accept_source_caps(&received, &caps);
                }
                return self.ready_message(received);
            }
        };
        self.set_state(state);
        Ok(())
    }
}
