//! Source states.
use uom::si::electric_potential::millivolt;

use super::{
    DiscoveryStep, Exchange, GotoMinStep, PolicyState, SendStatus, SourceDefaultStep, StartupStep,
    TransitionSupplyStep,
};
use crate::dpm::{DevicePolicyManager, VdmEngine};
use crate::observer::{Event, EventPayload, EventSink};
use crate::port::{Error, Port, VSAFE5V_DISCONNECT_MV};
use crate::protocol_layer::message::data::Data;
use crate::protocol_layer::message::data::request::{PowerSource, RawDataObject};
use crate::protocol_layer::message::data::source_capabilities::{PowerDataObject, SourceCapabilities};
use crate::protocol_layer::message::header::{ControlMessageType, MessageType};
use crate::protocol_layer::{Received, Sop};
use crate::timers::{Clock, TimerType};
use crate::units::ElectricPotential;
use crate::Transceiver;

/// Whether a request can be served from the advertised capabilities.
pub(crate) fn request_is_valid(caps: &SourceCapabilities, rdo: RawDataObject) -> bool {
    let Some(pdo) = caps.at_position(rdo.object_position()) else {
        return false;
    };
    let Some(kind) = pdo.kind() else {
        return false;
    };

    match (pdo, PowerSource::new(rdo, kind)) {
        (PowerDataObject::Pps(pps), PowerSource::Pps(request)) => {
            // 100 mV capability units, 20 mV request units.
            let voltage = request.raw_output_voltage();
            request.raw_operating_current() <= u16::from(pps.raw_max_current())
                && voltage >= u16::from(pps.raw_min_voltage()) * 5
                && voltage <= u16::from(pps.raw_max_voltage()) * 5
        }
        (PowerDataObject::FixedSupply(fixed), PowerSource::FixedVariableSupply(request)) => {
            request.raw_operating_current() <= fixed.raw_max_current()
        }
        (PowerDataObject::VariableSupply(variable), PowerSource::FixedVariableSupply(request)) => {
            request.raw_operating_current() <= variable.raw_max_current()
        }
        (PowerDataObject::Battery(battery), PowerSource::Battery(request)) => {
            request.raw_operating_power() <= battery.raw_max_power()
        }
        _ => false,
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
    pub(super) fn source_soft_reset(&mut self) -> Result<(), Error> {
        self.send_control(
            Sop::Sop,
            ControlMessageType::Accept,
            PolicyState::SourceSendCaps(Exchange::Send),
        )?;
        Ok(())
    }

    pub(super) fn source_send_soft_reset(&mut self, step: Exchange) -> Result<(), Error> {
        match step {
            Exchange::Send => {
                let next = PolicyState::SourceSendSoftReset(Exchange::AwaitResponse);
                if self.send_control(Sop::Sop, ControlMessageType::SoftReset, next)? == SendStatus::Success {
                    self.await_response(true);
                }
            }
            Exchange::AwaitResponse => {
                if let Some(received) = self.take_message() {
                    if received.message.header.is_control(ControlMessageType::Accept) {
                        self.set_state(PolicyState::SourceSendCaps(Exchange::Send));
                    } else {
                        self.set_state(PolicyState::SourceSendHardReset);
                    }
                } else if self.timer_expired() {
                    self.set_state(PolicyState::SourceSendHardReset);
                }
            }
        }
        Ok(())
    }

    pub(super) fn source_startup(&mut self, step: StartupStep) -> Result<(), Error> {
        match step {
            StartupStep::Init => {
                self.is_source = true;
                self.is_hard_reset = false;
                self.is_pr_swap = false;
                self.pps_enabled = false;
                self.caps_changed = false;
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
                self.set_state(PolicyState::SourceStartup(StartupStep::WaitVbus));
            }
            StartupStep::WaitVbus => {
                let now = self.clock.now();
                let swap_settled = self.swap_source_start.disabled() || self.swap_source_start.expired(now);
                if self.protocol.status().vbus_vsafe5v && swap_settled {
                    self.swap_source_start.disable();
                    self.start_timer(TimerType::VBusSwitchDelay);
                    self.set_state(PolicyState::SourceStartup(StartupStep::SwitchDelay));
                }
            }
            StartupStep::SwitchDelay => {
                if self.timer_expired() {
                    self.policy_timer.disable();
                    self.vdm.reset();
                    self.set_state(PolicyState::SourceSendCaps(Exchange::Send));
                }
            }
        }
        Ok(())
    }

    pub(super) fn source_discovery(&mut self, step: DiscoveryStep) -> Result<(), Error> {
        match step {
            DiscoveryStep::Start => {
                self.start_timer(TimerType::TypeCSendSourceCap);
                self.set_state(PolicyState::SourceDiscovery(DiscoveryStep::Wait));
            }
            DiscoveryStep::Wait => {
                if self.hard_reset_counter.exceeded() {
                    let state = if self.has_contract {
                        PolicyState::ErrorRecovery
                    } else {
                        PolicyState::SourceDisabled
                    };
                    self.set_state(state);
                } else if self.timer_expired() {
                    let state = if self.caps_counter.exceeded() {
                        PolicyState::SourceDisabled
                    } else {
                        PolicyState::SourceSendCaps(Exchange::Send)
                    };
                    self.set_state(state);
                }
            }
        }
        Ok(())
    }

    pub(super) fn source_send_caps(&mut self, step: Exchange) -> Result<(), Error> {
        match step {
            Exchange::Send => {
                let next = PolicyState::SourceSendCaps(Exchange::AwaitResponse);
                let status = self.send_data(Sop::Sop, next, |port| {
                    Data::SourceCapabilities(port.dpm.source_capabilities())
                })?;
                if status == SendStatus::Success {
                    self.hard_reset_counter.reset();
                    self.caps_counter.reset();
                    self.await_response(true);
                }
            }
            Exchange::AwaitResponse => {
                if let Some(received) = self.take_message() {
                    match received.message.data() {
                        Some(Data::Request(rdo)) => {
                            self.request = *rdo;
                            self.align_revision(received.message.header)?;
                            self.set_state(PolicyState::SourceNegotiateCap);
                        }
                        _ => self.set_state(PolicyState::SourceSendSoftReset(Exchange::Send)),
                    }
                } else if self.timer_expired() {
                    self.set_state(PolicyState::SourceSendHardReset);
                }
            }
        }
        Ok(())
    }

    pub(super) fn source_transition_default(&mut self, step: SourceDefaultStep) -> Result<(), Error> {
        match step {
            SourceDefaultStep::WaitHardReset => {
                if self.timer_expired() {
                    self.protocol.driver_mut().enable_receiver(false)?;
                    self.has_contract = false;
                    self.pps_enabled = false;
                    self.pps_timer.disable();
                    self.revision = self.config.spec_revision;
                    self.update_template();
                    self.detach_threshold = ElectricPotential::new::<millivolt>(VSAFE5V_DISCONNECT_MV);
                    self.notify(Event::BistDisabled, EventPayload::None);
                    self.notify(Event::NoContract, EventPayload::None);
                    self.set_state(PolicyState::SourceTransitionDefault(SourceDefaultStep::PowerOff));
                }
            }
            SourceDefaultStep::PowerOff => {
                self.dpm.set_vbus(false);
                self.dpm.set_vbus_discharge(true);

                if !self.is_dfp {
                    self.is_dfp = true;
                    self.apply_roles()?;
                    let (prime, double_prime) = (self.config.sop_prime_capable, self.config.sop_double_prime_capable);
                    self.protocol.driver_mut().enable_sop_prime(prime, double_prime)?;
                }
                if self.is_vconn_source {
                    self.protocol.driver_mut().set_vconn(false)?;
                }
                let driver = self.protocol.driver_mut();
                driver.flush_tx()?;
                driver.flush_rx()?;
                self.reset_protocol_layer(true)?;

                self.start_timer_ms(
                    TimerType::PSHardResetMax.duration_ms()
                        + TimerType::Safe0V.duration_ms()
                        + TimerType::SrcRecover.duration_ms(),
                );
                self.set_state(PolicyState::SourceTransitionDefault(SourceDefaultStep::WaitVsafe0v));
            }
            SourceDefaultStep::WaitVsafe0v => {
                if self.protocol.status().vbus_vsafe0v {
                    self.dpm.set_vbus_discharge(false);
                    self.start_timer(TimerType::SrcRecover);
                    self.set_state(PolicyState::SourceTransitionDefault(SourceDefaultStep::WaitRecover));
                } else if self.timer_expired() {
                    self.dpm.set_vbus_discharge(false);
                    let state = if self.hard_reset_counter.exceeded() {
                        PolicyState::ErrorRecovery
                    } else {
                        PolicyState::SourceTransitionDefault(SourceDefaultStep::PowerOn)
                    };
                    self.set_state(state);
                }
            }
            SourceDefaultStep::WaitRecover => {
                if self.timer_expired() {
                    self.set_state(PolicyState::SourceTransitionDefault(SourceDefaultStep::PowerOn));
                }
            }
            SourceDefaultStep::PowerOn => {
                self.dpm.set_vbus(true);
                if self.config.sources_vconn {
                    self.protocol.driver_mut().set_vconn(true)?;
                }
                self.is_vconn_source = true;
                self.policy_timer.disable();
                self.swap_source_start.disable();
                self.set_state(PolicyState::SourceStartup(StartupStep::Init));
            }
        }
        Ok(())
    }

    pub(super) fn source_negotiate_cap(&mut self) -> Result<(), Error> {
        let caps = self.dpm.source_capabilities();
        let state = if request_is_valid(&caps, self.request) {
            PolicyState::SourceTransitionSupply(TransitionSupplyStep::Accept)
        } else {
            debug!("Rejecting request {:?}", self.request);
            PolicyState::SourceCapabilityResponse
        };
        self.set_state(state);
        Ok(())
    }

    pub(super) fn source_capability_response(&mut self) -> Result<(), Error> {
        let next = if !self.has_contract {
            PolicyState::SourceWaitNewCapabilities
        } else if request_is_valid(&self.dpm.source_capabilities(), self.contract) {
            PolicyState::SourceReady
        } else {
            // The present contract can no longer be served.
            PolicyState::SourceSendHardReset
        };
        self.send_control(Sop::Sop, ControlMessageType::Reject, next)?;
        Ok(())
    }

    pub(super) fn source_transition_supply(&mut self, step: TransitionSupplyStep) -> Result<(), Error> {
        match step {
            TransitionSupplyStep::Accept => {
                let next = PolicyState::SourceTransitionSupply(TransitionSupplyStep::Prepare);
                self.send_control(Sop::Sop, ControlMessageType::Accept, next)?;
            }
            TransitionSupplyStep::Prepare => {
                self.contract = self.request;
                let caps = self.dpm.source_capabilities();
                let to_pps = matches!(
                    caps.at_position(self.contract.object_position()),
                    Some(PowerDataObject::Pps(_))
                );

                // Within a programmable supply, the voltage steps without a transition time.
                let step = if to_pps && self.pps_enabled {
                    TransitionSupplyStep::Switch
                } else {
                    self.start_timer(TimerType::SrcTransition);
                    TransitionSupplyStep::WaitTransition
                };
                self.pps_enabled = to_pps;
                self.set_state(PolicyState::SourceTransitionSupply(step));
            }
            TransitionSupplyStep::WaitTransition => {
                if self.timer_expired() {
                    self.set_state(PolicyState::SourceTransitionSupply(TransitionSupplyStep::Switch));
                }
            }
            TransitionSupplyStep::Switch => {
                self.has_contract = true;
                let index = usize::from(self.contract.object_position().saturating_sub(1));
                self.dpm.transition_source(index);
                self.start_timer(TimerType::SourceRiseTimeout);

                let now = self.clock.now();
                if self.pps_enabled {
                    self.pps_timer.start_type(now, TimerType::PPSTimeout);
                } else {
                    self.pps_timer.disable();
                }
                self.set_state(PolicyState::SourceTransitionSupply(TransitionSupplyStep::WaitSupply));
            }
            TransitionSupplyStep::WaitSupply => {
                let index = usize::from(self.contract.object_position().saturating_sub(1));
                if self.timer_expired() || self.dpm.is_source_cap_enabled(index) {
                    self.set_state(PolicyState::SourceTransitionSupply(TransitionSupplyStep::PsRdy));
                }
            }
            TransitionSupplyStep::PsRdy => {
                if self.send_control(Sop::Sop, ControlMessageType::PsRdy, PolicyState::SourceReady)?
                    == SendStatus::Success
                {
                    info!("New contract {:?}", self.contract);
                    self.notify(Event::NewContract, EventPayload::Contract(self.contract.0));
                }
            }
        }
        Ok(())
    }

    pub(super) fn source_ready(&mut self) -> Result<(), Error> {
        if !self.is_source {
            self.set_state(PolicyState::InvalidState);
            return Ok(());
        }

        if let Some(received) = self.take_message() {
            return self.source_ready_message(received);
        }

        if core::mem::take(&mut self.caps_changed) {
            self.set_state(PolicyState::SourceGiveSourceCaps);
            return Ok(());
        }

        if self.serve_request()? {
            return Ok(());
        }

        let now = self.clock.now();
        if self.pps_enabled && self.pps_timer.expired(now) {
            warn!("PPS request timeout");
            self.set_state(PolicyState::SourceSendHardReset);
        } else if !self.request_preferred_role() {
            self.poll_vdm();
        }
        Ok(())
    }

    fn source_ready_message(&mut self, received: Received) -> Result<(), Error> {
        let state = match received.message.header.message_type() {
            MessageType::Control(ControlMessageType::GetSourceCap) => PolicyState::SourceSendCaps(Exchange::Send),
            MessageType::Control(ControlMessageType::GetSinkCap) => PolicyState::SourceGiveSinkCaps,
            MessageType::Control(ControlMessageType::GetPpsStatus) => PolicyState::GivePpsStatus,
            _ => {
                if let Some(Data::Request(rdo)) = received.message.data() {
                    self.request = *rdo;
                    PolicyState::SourceNegotiateCap
                } else {
                    return self.ready_message(received);
                }
            }
        };
        self.set_state(state);
        Ok(())
    }

    pub(super) fn source_get_sink_caps(&mut self, step: Exchange) -> Result<(), Error> {
        match step {
            Exchange::Send => {
                let next = PolicyState::SourceGetSinkCaps(Exchange::AwaitResponse);
                if self.send_control(Sop::Sop, ControlMessageType::GetSinkCap, next)? == SendStatus::Success {
                    self.await_response(false);
                }
            }
            Exchange::AwaitResponse => {
                if let Some(received) = self.take_message() {
                    if let Some(Data::SinkCapabilities(caps)) = received.message.data() {
                        self.partner_sink_caps = Some(caps.clone());
                        self.set_state(PolicyState::SourceReady);
                    } else {
                        self.set_state(PolicyState::SourceSendHardReset);
                    }
                } else if self.timer_expired() {
                    self.set_state(PolicyState::SourceReady);
                }
            }
        }
        Ok(())
    }

    pub(super) fn source_goto_min(&mut self, step: GotoMinStep) -> Result<(), Error> {
        if self
            .protocol
            .take_received()
            .is_some_and(|received| received.message.header.is_control(ControlMessageType::SoftReset))
        {
            self.set_state(PolicyState::SourceSoftReset);
            return Ok(());
        }

        match step {
            GotoMinStep::Send => {
                let next = PolicyState::SourceGotoMin(GotoMinStep::WaitTransition);
                if self.send_control(Sop::Sop, ControlMessageType::GotoMin, next)? == SendStatus::Success {
                    self.start_timer(TimerType::SrcTransition);
                }
            }
            GotoMinStep::WaitTransition => {
                if self.timer_expired() {
                    self.set_state(PolicyState::SourceGotoMin(GotoMinStep::PsRdy));
                }
            }
            GotoMinStep::PsRdy => {
                self.send_control(Sop::Sop, ControlMessageType::PsRdy, PolicyState::SourceReady)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_layer::message::data::request;
    use crate::protocol_layer::message::data::source_capabilities::{FixedSupply, SprProgrammablePowerSupply};

    fn caps() -> SourceCapabilities {
        let mut caps = SourceCapabilities::default();
        caps.0.push(PowerDataObject::FixedSupply(FixedSupply::new(100, 300))).unwrap();
        caps.0
            .push(PowerDataObject::Pps(
                SprProgrammablePowerSupply::default()
                    .with_raw_min_voltage(33)
                    .with_raw_max_voltage(110)
                    .with_raw_max_current(60),
            ))
            .unwrap();
        caps
    }

    fn fixed_request(position: u8, current: u16) -> RawDataObject {
        RawDataObject(
            request::FixedVariableSupply::default()
                .with_object_position(position)
                .with_raw_operating_current(current)
                .with_raw_max_operating_current(current)
                .0,
        )
    }

    fn pps_request(voltage: u16, current: u16) -> RawDataObject {
        RawDataObject(
            request::Pps::default()
                .with_object_position(2)
                .with_raw_output_voltage(voltage)
                .with_raw_operating_current(current)
                .0,
        )
    }

    #[test]
    fn fixed_request_within_limits() {
        assert!(request_is_valid(&caps(), fixed_request(1, 200)));
        assert!(request_is_valid(&caps(), fixed_request(1, 300)));
        assert!(!request_is_valid(&caps(), fixed_request(1, 301)));
    }

    #[test]
    fn request_for_missing_object() {
        assert!(!request_is_valid(&caps(), fixed_request(0, 100)));
        assert!(!request_is_valid(&caps(), fixed_request(3, 100)));
    }

    #[test]
    fn pps_request_range() {
        // 3.3 V to 11 V in 20 mV units.
        assert!(request_is_valid(&caps(), pps_request(165, 60)));
        assert!(request_is_valid(&caps(), pps_request(550, 40)));
        assert!(!request_is_valid(&caps(), pps_request(164, 40)));
        assert!(!request_is_valid(&caps(), pps_request(551, 40)));
        assert!(!request_is_valid(&caps(), pps_request(250, 61)));
    }
}
