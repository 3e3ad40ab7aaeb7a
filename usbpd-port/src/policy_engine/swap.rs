//! Data, power and VCONN role swaps.
//!
//! Each swap has a sending and an evaluating side. Once the request is accepted, both
//! sides walk the same steps, so the step handlers are shared and only the state that
//! wraps the step differs. An aborted DR or VCONN swap returns to the ready state, a
//! power role swap that fails after VBUS started to change ends in error recovery.
use super::{Exchange, PolicyState, SendStatus, SinkPrSwapStep, SourcePrSwapStep, VconnSwapStep};
use crate::dpm::{DevicePolicyManager, VdmEngine};
use crate::observer::EventSink;
use crate::port::{Error, Port};
use crate::protocol_layer::message::header::{ControlMessageType, MessageType, SpecificationRevision};
use crate::protocol_layer::{Sop, TxStatus};
use crate::timers::{Clock, TimerType};
use crate::{PowerRole, Transceiver};

/// The outcome of waiting for the answer to a swap request.
enum Answer {
    Accept,
    Refused,
    Pending,
}

impl<DRIVER, CLOCK, DPM, EVENTS, VDM> Port<DRIVER, CLOCK, DPM, EVENTS, VDM>
where
    DRIVER: Transceiver,
    CLOCK: Clock,
    DPM: DevicePolicyManager,
    EVENTS: EventSink,
    VDM: VdmEngine,
{
    /// Wait for Accept, Reject or Wait.
    ///
    /// Anything but Accept, and a missing answer, end the swap.
    fn swap_answer(&mut self) -> Answer {
        match self.take_message() {
            Some(received) => match received.message.header.message_type() {
                MessageType::Control(ControlMessageType::Accept) => Answer::Accept,
                _message_type => {
                    debug!("Swap refused with {:?}", _message_type);
                    Answer::Refused
                }
            },
            None if self.timer_expired() => Answer::Refused,
            None => Answer::Pending,
        }
    }

    /// Enable cable communication, for the VCONN source from revision 3 on, else for the DFP.
    fn update_cable_comms(&mut self) -> Result<(), Error> {
        let enabled = if self.revision >= SpecificationRevision::R3_X {
            self.is_vconn_source
        } else {
            self.is_dfp
        };
        let (prime, double_prime) = (self.config.sop_prime_capable, self.config.sop_double_prime_capable);
        self.protocol
            .driver_mut()
            .enable_sop_prime(enabled && prime, enabled && double_prime)?;
        Ok(())
    }

    fn swap_data_role(&mut self) -> Result<(), Error> {
        self.is_dfp = !self.is_dfp;
        info!("Data role now {:?}", crate::DataRole::from(self.is_dfp));
        self.apply_roles()?;
        self.update_cable_comms()
    }

    pub(super) fn send_dr_swap(&mut self, step: Exchange) -> Result<(), Error> {
        let ready = self.ready_state();
        match step {
            Exchange::Send => {
                let next = if self.is_source {
                    PolicyState::SourceSendDrSwap(Exchange::AwaitResponse)
                } else {
                    PolicyState::SinkSendDrSwap(Exchange::AwaitResponse)
                };
                if self.send_control(Sop::Sop, ControlMessageType::DrSwap, next)? == SendStatus::Success {
                    self.await_response(false);
                }
            }
            Exchange::AwaitResponse => match self.swap_answer() {
                Answer::Accept => {
                    self.swap_data_role()?;
                    self.set_state(ready);
                }
                Answer::Refused => self.set_state(ready),
                Answer::Pending => (),
            },
        }
        Ok(())
    }

    pub(super) fn evaluate_dr_swap(&mut self) -> Result<(), Error> {
        // A data role swap in alternate mode requires a hard reset.
        if self.vdm.mode_entered() {
            let state = self.hard_reset_state();
            self.set_state(state);
            return Ok(());
        }

        let accept = if self.is_dfp {
            self.config.dr_swap_to_ufp
        } else {
            self.config.dr_swap_to_dfp
        };
        let response = if accept {
            ControlMessageType::Accept
        } else {
            ControlMessageType::Reject
        };

        let ready = self.ready_state();
        if self.send_control(Sop::Sop, response, ready)? == SendStatus::Success && accept {
            self.swap_data_role()?;
        }
        Ok(())
    }

    /// The state for `step` of the VCONN swap under way.
    fn vconn_swap_state(&self, step: VconnSwapStep) -> PolicyState {
        match self.state {
            PolicyState::SourceSendVconnSwap(_) => PolicyState::SourceSendVconnSwap(step),
            PolicyState::SourceEvaluateVconnSwap(_) => PolicyState::SourceEvaluateVconnSwap(step),
            PolicyState::SinkSendVconnSwap(_) => PolicyState::SinkSendVconnSwap(step),
            _ => PolicyState::SinkEvaluateVconnSwap(step),
        }
    }

    pub(super) fn send_vconn_swap(&mut self, step: VconnSwapStep) -> Result<(), Error> {
        match step {
            VconnSwapStep::Message => {
                let next = self.vconn_swap_state(VconnSwapStep::AwaitResponse);
                if self.send_control(Sop::Sop, ControlMessageType::VconnSwap, next)? == SendStatus::Success {
                    self.await_response(false);
                }
            }
            VconnSwapStep::AwaitResponse => match self.swap_answer() {
                Answer::Accept => {
                    let next = self.vconn_swap_state(VconnSwapStep::Switch);
                    self.set_state(next);
                }
                Answer::Refused => {
                    let ready = self.ready_state();
                    self.set_state(ready);
                }
                Answer::Pending => (),
            },
            step => self.vconn_swap_step(step)?,
        }
        Ok(())
    }

    pub(super) fn evaluate_vconn_swap(&mut self, step: VconnSwapStep) -> Result<(), Error> {
        match step {
            VconnSwapStep::Message | VconnSwapStep::AwaitResponse => {
                let accept = if self.is_vconn_source {
                    self.config.vconn_swap_to_off
                } else {
                    self.config.vconn_swap_to_on
                };

                if accept {
                    let next = self.vconn_swap_state(VconnSwapStep::Switch);
                    self.send_control(self.rx_sop, ControlMessageType::Accept, next)?;
                } else {
                    let ready = self.ready_state();
                    self.send_control(self.rx_sop, ControlMessageType::Reject, ready)?;
                }
            }
            step => self.vconn_swap_step(step)?,
        }
        Ok(())
    }

    /// The steps after the swap was accepted.
    fn vconn_swap_step(&mut self, step: VconnSwapStep) -> Result<(), Error> {
        let ready = self.ready_state();
        match step {
            VconnSwapStep::Switch => {
                if self.is_vconn_source {
                    self.start_timer(TimerType::VCONNSourceOn);
                    let next = self.vconn_swap_state(VconnSwapStep::AwaitPsRdy);
                    self.set_state(next);
                } else {
                    self.protocol.driver_mut().set_vconn(true)?;
                    self.start_timer(TimerType::VCONNSourceOn);
                    let next = self.vconn_swap_state(VconnSwapStep::Settle);
                    self.set_state(next);
                }
            }
            VconnSwapStep::AwaitPsRdy => {
                if let Some(received) = self.take_message() {
                    if received.message.header.is_control(ControlMessageType::PsRdy) {
                        self.protocol.driver_mut().set_vconn(false)?;
                        self.is_vconn_source = false;
                        self.update_cable_comms()?;
                    }
                    self.set_state(ready);
                } else if self.timer_expired() {
                    warn!("No PS_RDY from the new VCONN source");
                    self.set_state(ready);
                }
            }
            VconnSwapStep::Settle => {
                if self.timer_expired() {
                    let next = self.vconn_swap_state(VconnSwapStep::SendPsRdy);
                    self.set_state(next);
                }
            }
            VconnSwapStep::SendPsRdy => {
                if self.send_control(Sop::Sop, ControlMessageType::PsRdy, ready)? == SendStatus::Success {
                    self.is_vconn_source = true;
                    self.update_cable_comms()?;
                }
            }
            VconnSwapStep::Message | VconnSwapStep::AwaitResponse => self.set_state(ready),
        }
        Ok(())
    }

    /// A failed transmission after VBUS started to change ends in error recovery.
    fn pr_swap_send_failed(&mut self, status: SendStatus) {
        // Leave escalation by the protocol layer untouched.
        if status == SendStatus::Error && self.protocol.tx_status() != TxStatus::Reset {
            self.set_state(PolicyState::ErrorRecovery);
        }
    }

    fn source_pr_swap_state(&self, step: SourcePrSwapStep) -> PolicyState {
        match self.state {
            PolicyState::SourceEvaluatePrSwap(_) => PolicyState::SourceEvaluatePrSwap(step),
            _ => PolicyState::SourceSendPrSwap(step),
        }
    }

    pub(super) fn source_send_pr_swap(&mut self, step: SourcePrSwapStep) -> Result<(), Error> {
        match step {
            SourcePrSwapStep::Message => {
                let next = PolicyState::SourceSendPrSwap(SourcePrSwapStep::AwaitAccept);
                if self.send_control(Sop::Sop, ControlMessageType::PrSwap, next)? == SendStatus::Success {
                    self.await_response(false);
                }
            }
            SourcePrSwapStep::AwaitAccept => match self.swap_answer() {
                Answer::Accept => self.source_pr_swap_accepted(),
                Answer::Refused => self.set_state(PolicyState::SourceReady),
                Answer::Pending => (),
            },
            step => self.source_pr_swap_step(step)?,
        }
        Ok(())
    }

    pub(super) fn source_evaluate_pr_swap(&mut self, step: SourcePrSwapStep) -> Result<(), Error> {
        match step {
            SourcePrSwapStep::Message | SourcePrSwapStep::AwaitAccept => {
                let own_drp = self.dpm.source_capabilities().dual_role_power();
                if !self.config.accepts_pr_swap_as_source || !self.config.is_drp() || !own_drp {
                    self.send_control(self.rx_sop, ControlMessageType::Reject, PolicyState::SourceReady)?;
                    return Ok(());
                }

                match self.partner_sink_caps.as_ref().map(|caps| caps.dual_role_power()) {
                    // Ask again once the sink capabilities are known.
                    None => {
                        let next = PolicyState::SourceGetSinkCaps(Exchange::Send);
                        self.send_control(self.rx_sop, ControlMessageType::Wait, next)?;
                    }
                    Some(false) => {
                        self.send_control(self.rx_sop, ControlMessageType::Reject, PolicyState::SourceReady)?;
                    }
                    Some(true) => {
                        let next = PolicyState::SourceEvaluatePrSwap(SourcePrSwapStep::WaitTransition);
                        if self.send_control(self.rx_sop, ControlMessageType::Accept, next)? == SendStatus::Success {
                            self.is_pr_swap = true;
                            self.start_timer(TimerType::SrcTransition);
                        }
                    }
                }
            }
            step => self.source_pr_swap_step(step)?,
        }
        Ok(())
    }

    fn source_pr_swap_accepted(&mut self) {
        self.is_pr_swap = true;
        let next = self.source_pr_swap_state(SourcePrSwapStep::WaitTransition);
        self.set_state(next);
        self.start_timer(TimerType::SrcTransition);
    }

    /// The steps of the source after the swap was accepted.
    fn source_pr_swap_step(&mut self, step: SourcePrSwapStep) -> Result<(), Error> {
        match step {
            SourcePrSwapStep::WaitTransition => {
                if self.timer_expired() {
                    let next = self.source_pr_swap_state(SourcePrSwapStep::PowerOff);
                    self.set_state(next);
                }
            }
            SourcePrSwapStep::PowerOff => {
                self.dpm.set_vbus(false);
                self.dpm.set_vbus_discharge(true);
                self.start_timer(TimerType::PSSourceOff);
                let next = self.source_pr_swap_state(SourcePrSwapStep::WaitVsafe0v);
                self.set_state(next);
            }
            SourcePrSwapStep::WaitVsafe0v => {
                if self.protocol.status().vbus_vsafe0v {
                    self.dpm.set_vbus_discharge(false);
                    self.is_source = false;
                    self.apply_roles()?;
                    self.dpm.role_swapped(PowerRole::Sink);
                    let next = self.source_pr_swap_state(SourcePrSwapStep::SendPsRdy);
                    self.set_state(next);
                } else if self.timer_expired() {
                    self.dpm.set_vbus_discharge(false);
                    self.set_state(PolicyState::ErrorRecovery);
                }
            }
            SourcePrSwapStep::SendPsRdy => {
                let next = self.source_pr_swap_state(SourcePrSwapStep::AwaitPsRdy);
                match self.send_control(Sop::Sop, ControlMessageType::PsRdy, next)? {
                    SendStatus::Success => self.start_timer(TimerType::PSSourceOn),
                    status => self.pr_swap_send_failed(status),
                }
            }
            SourcePrSwapStep::AwaitPsRdy => {
                if let Some(received) = self.take_message() {
                    if received.message.header.is_control(ControlMessageType::PsRdy) {
                        let next = self.source_pr_swap_state(SourcePrSwapStep::Finish);
                        self.set_state(next);
                    }
                } else if self.timer_expired() {
                    warn!("New source did not turn on");
                    self.set_state(PolicyState::ErrorRecovery);
                }
            }
            SourcePrSwapStep::Finish => {
                info!("Power role now sink");
                self.set_state(PolicyState::SinkStartup);
            }
            SourcePrSwapStep::Message | SourcePrSwapStep::AwaitAccept => self.set_state(PolicyState::SourceReady),
        }
        Ok(())
    }

    fn sink_pr_swap_state(&self, step: SinkPrSwapStep) -> PolicyState {
        match self.state {
            PolicyState::SinkEvaluatePrSwap(_) => PolicyState::SinkEvaluatePrSwap(step),
            _ => PolicyState::SinkSendPrSwap(step),
        }
    }

    pub(super) fn sink_send_pr_swap(&mut self, step: SinkPrSwapStep) -> Result<(), Error> {
        match step {
            SinkPrSwapStep::Message => {
                let next = PolicyState::SinkSendPrSwap(SinkPrSwapStep::AwaitAccept);
                if self.send_control(Sop::Sop, ControlMessageType::PrSwap, next)? == SendStatus::Success {
                    self.await_response(false);
                }
            }
            SinkPrSwapStep::AwaitAccept => match self.swap_answer() {
                Answer::Accept => {
                    self.is_pr_swap = true;
                    self.set_state(PolicyState::SinkSendPrSwap(SinkPrSwapStep::AwaitPsRdy));
                    self.start_timer(TimerType::PSSourceOff);
                }
                Answer::Refused => self.set_state(PolicyState::SinkReady),
                Answer::Pending => (),
            },
            step => self.sink_pr_swap_step(step)?,
        }
        Ok(())
    }

    pub(super) fn sink_evaluate_pr_swap(&mut self, step: SinkPrSwapStep) -> Result<(), Error> {
        match step {
            SinkPrSwapStep::Message | SinkPrSwapStep::AwaitAccept => {
                let accept = self.config.accepts_pr_swap_as_sink
                    && self.config.is_drp()
                    && self.partner_source_caps.dual_role_power();
                if !accept {
                    self.send_control(self.rx_sop, ControlMessageType::Reject, PolicyState::SinkReady)?;
                    return Ok(());
                }

                let next = PolicyState::SinkEvaluatePrSwap(SinkPrSwapStep::AwaitPsRdy);
                if self.send_control(self.rx_sop, ControlMessageType::Accept, next)? == SendStatus::Success {
                    self.is_pr_swap = true;
                    self.start_timer(TimerType::PSSourceOff);
                }
            }
            step => self.sink_pr_swap_step(step)?,
        }
        Ok(())
    }

    /// The steps of the sink after the swap was accepted.
    fn sink_pr_swap_step(&mut self, step: SinkPrSwapStep) -> Result<(), Error> {
        match step {
            SinkPrSwapStep::AwaitPsRdy => {
                if let Some(received) = self.take_message() {
                    if received.message.header.is_control(ControlMessageType::PsRdy) {
                        self.dpm.role_swapped(PowerRole::Source);
                        self.dpm.set_vbus(true);
                        self.is_source = true;
                        self.apply_roles()?;
                        self.start_timer(TimerType::PSSourceOn);
                        let next = self.sink_pr_swap_state(SinkPrSwapStep::WaitVsafe5v);
                        self.set_state(next);
                    }
                } else if self.timer_expired() {
                    warn!("Old source did not turn off");
                    self.set_state(PolicyState::ErrorRecovery);
                }
            }
            SinkPrSwapStep::WaitVsafe5v => {
                if self.protocol.status().vbus_vsafe5v {
                    self.start_timer(TimerType::VBusSwitchDelay);
                    let next = self.sink_pr_swap_state(SinkPrSwapStep::SwitchDelay);
                    self.set_state(next);
                } else if self.timer_expired() {
                    self.set_state(PolicyState::ErrorRecovery);
                }
            }
            SinkPrSwapStep::SwitchDelay => {
                if self.timer_expired() {
                    let next = self.sink_pr_swap_state(SinkPrSwapStep::SendPsRdy);
                    self.set_state(next);
                }
            }
            SinkPrSwapStep::SendPsRdy => {
                let next = PolicyState::SourceStartup(Default::default());
                match self.send_control(Sop::Sop, ControlMessageType::PsRdy, next)? {
                    SendStatus::Success => {
                        info!("Power role now source");
                        let now = self.clock.now();
                        self.swap_source_start.start_type(now, TimerType::SwapSourceStart);
                    }
                    status => self.pr_swap_send_failed(status),
                }
            }
            SinkPrSwapStep::Message | SinkPrSwapStep::AwaitAccept => self.set_state(PolicyState::SinkReady),
        }
        Ok(())
    }
}
