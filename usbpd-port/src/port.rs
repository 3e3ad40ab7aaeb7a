//! A USB PD port: the protocol layer, policy engine and their shared state.
//!
//! The Type-C layer attaches the port with [`Port::enable`] and detaches it with
//! [`Port::disable`]. In between, the application calls [`Port::run`] whenever the
//! transceiver raises an interrupt, or when [`Port::next_timeout`] elapses.
use uom::si::electric_potential::millivolt;
use usbpd_port_traits::{Transceiver, TransceiverError};

use crate::config::PortConfig;
use crate::counters::{Counter, CounterType};
use crate::debug_log::{MessageLog, StateLog, Token};
use crate::dpm::{DevicePolicyManager, NoVdm, VdmEngine, VdmObjects};
use crate::observer::{Event, EventPayload, EventSink, Notification};
use crate::policy_engine::PolicyState;
use crate::protocol_layer::message::data::request::RawDataObject;
use crate::protocol_layer::message::data::sink_capabilities::SinkCapabilities;
use crate::protocol_layer::message::data::source_capabilities::SourceCapabilities;
use crate::protocol_layer::message::header::{ControlMessageType, Header, SpecificationRevision};
use crate::protocol_layer::{HardResetEvent, ProtocolLayer, ProtocolState, Sop, TxStatus};
use crate::timers::{Clock, Timer, TimerType};
use crate::units::ElectricPotential;
use crate::{DataRole, PowerRole};

/// VBUS below this voltage means detach, while at vSafe5V.
pub const VSAFE5V_DISCONNECT_MV: u32 = 3670;

/// Port errors.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The transceiver could not be accessed.
    #[error("transceiver error: {0}")]
    Transceiver(#[from] TransceiverError),
    /// A transmit request is already pending.
    #[error("a transmit request is already pending")]
    TransmitSlotBusy,
    /// The port is not attached.
    #[error("the port is disabled")]
    PortDisabled,
}

/// Who placed a transmit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxOwner {
    /// The policy engine itself.
    PolicyEngine,
    /// The device policy manager.
    DevicePolicyManager,
}

/// A request to start a message sequence from the ready state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxRequest {
    /// The requester.
    pub owner: TxOwner,
    /// The control message that starts the sequence.
    pub message_type: ControlMessageType,
}

/// A USB PD port.
///
/// All per-port state lives here, so any number of ports can be run side by side.
pub struct Port<DRIVER, CLOCK, DPM, EVENTS = (), VDM = NoVdm>
where
    DRIVER: Transceiver,
    CLOCK: Clock,
    DPM: DevicePolicyManager,
    EVENTS: EventSink,
    VDM: VdmEngine,
{
    pub(crate) config: PortConfig,
    pub(crate) protocol: ProtocolLayer<DRIVER>,
    pub(crate) clock: CLOCK,
    pub(crate) dpm: DPM,
    pub(crate) events: EVENTS,
    pub(crate) vdm: VDM,

    pub(crate) state: PolicyState,
    pub(crate) state_log: StateLog,

    pub(crate) is_source: bool,
    pub(crate) is_dfp: bool,
    pub(crate) is_vconn_source: bool,
    pub(crate) has_contract: bool,
    pub(crate) is_hard_reset: bool,
    pub(crate) is_pr_swap: bool,
    pub(crate) pps_enabled: bool,
    pub(crate) pr_swap_attempted: bool,
    pub(crate) caps_changed: bool,

    pub(crate) revision: SpecificationRevision,
    pub(crate) contract: RawDataObject,
    pub(crate) request: RawDataObject,
    pub(crate) sink_request: RawDataObject,
    pub(crate) partner_source_caps: SourceCapabilities,
    pub(crate) partner_sink_caps: Option<SinkCapabilities>,
    pub(crate) detach_threshold: ElectricPotential,

    pub(crate) policy_timer: Timer,
    pub(crate) pps_timer: Timer,
    pub(crate) swap_source_start: Timer,

    pub(crate) caps_counter: Counter,
    pub(crate) collision_counter: Counter,
    pub(crate) hard_reset_counter: Counter,

    pub(crate) tx_request: Option<TxRequest>,
    pub(crate) rx_sop: Sop,
    pub(crate) vdm_tx: Option<(Sop, VdmObjects)>,
}

impl<DRIVER, CLOCK, DPM, EVENTS, VDM> Port<DRIVER, CLOCK, DPM, EVENTS, VDM>
where
    DRIVER: Transceiver,
    CLOCK: Clock,
    DPM: DevicePolicyManager,
    EVENTS: EventSink,
    VDM: VdmEngine,
{
    /// Create a new, detached port.
    pub fn new(config: PortConfig, driver: DRIVER, clock: CLOCK, dpm: DPM, events: EVENTS, vdm: VDM) -> Self {
        let template = Header::new_template(DataRole::Ufp, PowerRole::Sink, config.spec_revision);

        Self {
            config,
            protocol: ProtocolLayer::new(driver, template),
            clock,
            dpm,
            events,
            vdm,
            state: PolicyState::Disabled,
            state_log: StateLog::new(),
            is_source: false,
            is_dfp: false,
            is_vconn_source: false,
            has_contract: false,
            is_hard_reset: false,
            is_pr_swap: false,
            pps_enabled: false,
            pr_swap_attempted: false,
            caps_changed: false,
            revision: config.spec_revision,
            contract: RawDataObject(0),
            request: RawDataObject(0),
            sink_request: RawDataObject(0),
            partner_source_caps: SourceCapabilities::default(),
            partner_sink_caps: None,
            detach_threshold: ElectricPotential::new::<millivolt>(VSAFE5V_DISCONNECT_MV),
            policy_timer: Timer::new(),
            pps_timer: Timer::new(),
            swap_source_start: Timer::new(),
            caps_counter: Counter::new(CounterType::Caps),
            collision_counter: Counter::new(CounterType::Collision),
            hard_reset_counter: Counter::new(CounterType::HardReset),
            tx_request: None,
            rx_sop: Sop::Sop,
            vdm_tx: None,
        }
    }

    /// Attach the port in the given power role, and start the policy engine.
    pub fn enable(&mut self, role: PowerRole) -> Result<(), Error> {
        let source = role == PowerRole::Source;
        info!("Enable port {} as {:?}", self.config.port_id, role);

        self.is_hard_reset = false;
        self.is_pr_swap = false;
        self.pr_swap_attempted = false;
        self.caps_changed = false;
        self.hard_reset_counter.reset();
        self.revision = self.config.spec_revision;
        self.is_source = source;
        self.is_dfp = source;
        self.is_vconn_source = source;
        self.tx_request = None;

        self.protocol
            .configure(self.config.manual_retries, self.config.good_crc_workaround);
        self.update_template();

        let retries = self.config.hardware_retries(self.revision);
        let (sop_prime, sop_double_prime) = if source {
            (self.config.sop_prime_capable, self.config.sop_double_prime_capable)
        } else {
            (false, false)
        };
        let driver = self.protocol.driver_mut();
        driver.enable_receiver(false)?;
        driver.set_auto_good_crc(false)?;
        driver.set_auto_retries(retries)?;
        driver.set_roles(source, source)?;
        driver.enable_sop_prime(sop_prime, sop_double_prime)?;
        driver.flush_tx()?;
        driver.flush_rx()?;

        self.reset_protocol_layer(true)?;
        self.policy_timer.disable();
        self.pps_timer.disable();
        self.swap_source_start.disable();
        self.vdm.reset();
        self.protocol.log_token(true, Token::Attach);

        self.set_state(if source {
            PolicyState::SourceStartup(Default::default())
        } else {
            PolicyState::SinkStartup
        });
        Ok(())
    }

    /// Detach the port.
    ///
    /// Communication stops, and observers are told that the contract is gone.
    pub fn disable(&mut self) -> Result<(), Error> {
        let was_enabled = self.state != PolicyState::Disabled;
        info!("Disable port {}", self.config.port_id);

        let driver = self.protocol.driver_mut();
        driver.set_bist_carrier_mode(false)?;
        driver.set_auto_good_crc(false)?;
        driver.flush_rx()?;
        driver.flush_tx()?;

        self.is_hard_reset = false;
        self.is_pr_swap = false;
        self.is_source = false;
        self.has_contract = false;
        self.pps_enabled = false;
        self.contract = RawDataObject(0);
        self.revision = self.config.spec_revision;
        self.tx_request = None;
        self.vdm_tx = None;
        self.detach_threshold = ElectricPotential::new::<millivolt>(VSAFE5V_DISCONNECT_MV);
        self.policy_timer.disable();
        self.pps_timer.disable();
        self.swap_source_start.disable();

        self.protocol.disable();
        if was_enabled {
            self.protocol.log_token(false, Token::Detach);
        }
        self.set_state(PolicyState::Disabled);

        self.notify(Event::BistDisabled, EventPayload::None);
        self.notify(Event::NoContract, EventPayload::None);
        Ok(())
    }

    /// Advance the port by one step.
    ///
    /// Reads the transceiver status, handles hard resets, runs the protocol layer and
    /// then the policy engine.
    pub fn run(&mut self) -> Result<(), Error> {
        if self.state == PolicyState::Disabled {
            return Ok(());
        }

        self.protocol.update_status()?;
        let now = self.clock.now();

        if self.protocol.waiting_on_hard_reset() && self.policy_timer.expired(now) {
            debug!("No response, hard reset");
            self.protocol.set_waiting_on_hard_reset(false);
            self.send_hard_reset()?;
        }

        if let Some(event) = self.protocol.take_hard_reset() {
            self.handle_hard_reset(event)?;
        } else {
            self.protocol.run(now)?;
        }

        self.run_policy()
    }

    /// Milliseconds until the port needs to run again, zero if no timer runs.
    pub fn next_timeout(&self) -> u32 {
        let now = self.clock.now();

        [
            self.policy_timer.remaining(now),
            self.pps_timer.remaining(now),
            self.swap_source_start.remaining(now),
            self.protocol.next_timeout(now),
        ]
        .into_iter()
        .filter(|&remaining| remaining > 0)
        .min()
        .unwrap_or(0)
    }

    /// Ask the policy engine to start a message sequence from the ready state.
    ///
    /// Only one request can be pending.
    pub fn request_transmit(&mut self, message_type: ControlMessageType) -> Result<(), Error> {
        self.post_request(TxOwner::DevicePolicyManager, message_type)
    }

    pub(crate) fn post_request(&mut self, owner: TxOwner, message_type: ControlMessageType) -> Result<(), Error> {
        if self.state == PolicyState::Disabled {
            return Err(Error::PortDisabled);
        }
        if self.tx_request.is_some() {
            return Err(Error::TransmitSlotBusy);
        }

        self.tx_request = Some(TxRequest { owner, message_type });
        Ok(())
    }

    /// The pending transmit request, if any.
    pub fn pending_request(&self) -> Option<TxRequest> {
        self.tx_request
    }

    /// Tell the source that its capabilities changed.
    ///
    /// They are advertised again from the ready state, or when the engine waits for new
    /// capabilities.
    pub fn notify_source_capabilities_changed(&mut self) {
        self.caps_changed = true;
    }

    /// The state of the policy engine.
    pub fn state(&self) -> PolicyState {
        self.state
    }

    /// The state of the protocol layer.
    pub fn protocol_state(&self) -> ProtocolState {
        self.protocol.state()
    }

    /// Whether an explicit contract exists.
    pub fn has_contract(&self) -> bool {
        self.has_contract
    }

    /// The request data object of the contract.
    pub fn contract(&self) -> Option<RawDataObject> {
        self.has_contract.then_some(self.contract)
    }

    /// The present power role.
    pub fn power_role(&self) -> PowerRole {
        self.is_source.into()
    }

    /// The present data role.
    pub fn data_role(&self) -> DataRole {
        self.is_dfp.into()
    }

    /// Whether the port sources VCONN.
    pub fn is_vconn_source(&self) -> bool {
        self.is_vconn_source
    }

    /// The negotiated specification revision.
    pub fn spec_revision(&self) -> SpecificationRevision {
        self.revision
    }

    /// The VBUS voltage below which the Type-C layer detects a detach.
    pub fn detach_threshold(&self) -> ElectricPotential {
        self.detach_threshold
    }

    /// The source capabilities of the port partner, as last received.
    pub fn partner_source_capabilities(&self) -> &SourceCapabilities {
        &self.partner_source_caps
    }

    /// The sink capabilities of the port partner, if received.
    pub fn partner_sink_capabilities(&self) -> Option<&SinkCapabilities> {
        self.partner_sink_caps.as_ref()
    }

    /// The configuration.
    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    /// The log of entered policy states.
    pub fn state_log_mut(&mut self) -> &mut StateLog {
        &mut self.state_log
    }

    /// The log of sent and received messages.
    pub fn message_log_mut(&mut self) -> &mut MessageLog {
        self.protocol.log_mut()
    }

    /// The transceiver.
    pub fn driver(&self) -> &DRIVER {
        self.protocol.driver()
    }

    /// The transceiver, mutably.
    pub fn driver_mut(&mut self) -> &mut DRIVER {
        self.protocol.driver_mut()
    }

    /// The device policy manager.
    pub fn dpm(&self) -> &DPM {
        &self.dpm
    }

    /// The device policy manager, mutably.
    pub fn dpm_mut(&mut self) -> &mut DPM {
        &mut self.dpm
    }

    /// The event sink.
    pub fn events_mut(&mut self) -> &mut EVENTS {
        &mut self.events
    }

    /// The VDM engine.
    pub fn vdm_mut(&mut self) -> &mut VDM {
        &mut self.vdm
    }

    pub(crate) fn notify(&mut self, event: Event, payload: EventPayload) {
        self.events.notify(Notification {
            event,
            port_id: self.config.port_id,
            payload,
        });
    }

    /// Move the policy engine to a new state.
    ///
    /// Clears the transmit status, so that the next send starts fresh.
    pub(crate) fn set_state(&mut self, state: PolicyState) {
        let changed = state.id() != self.state.id();
        self.state = state;
        self.protocol.set_tx_status(TxStatus::Idle);
        self.protocol.set_waiting_on_hard_reset(false);

        if changed {
            debug!("Policy state {:?}", state);
            self.state_log.write(state.id(), self.clock.now());
            self.notify(Event::PdStateChanged, EventPayload::None);
        }
    }

    /// Rebuild the header template from the present roles and revision.
    pub(crate) fn update_template(&mut self) {
        let template = Header::new_template(self.is_dfp.into(), self.is_source.into(), self.revision);
        self.protocol.set_template(template);
    }

    /// Push the present roles to the transceiver and the header template.
    pub(crate) fn apply_roles(&mut self) -> Result<(), Error> {
        self.protocol.driver_mut().set_roles(self.is_source, self.is_dfp)?;
        self.update_template();
        Ok(())
    }

    /// Adopt the revision of the port partner, if it is lower than the present one.
    pub(crate) fn align_revision(&mut self, header: Header) -> Result<(), Error> {
        let Ok(theirs) = header.spec_revision() else {
            return Ok(());
        };

        if theirs < self.revision && theirs > SpecificationRevision::R1_0 {
            debug!("Revision {:?} negotiated", theirs);
            self.revision = theirs;
            self.update_template();
            let retries = self.config.hardware_retries(self.revision);
            self.protocol.driver_mut().set_auto_retries(retries)?;
        }
        Ok(())
    }

    /// Reset the protocol layer and forget the contract.
    pub(crate) fn reset_protocol_layer(&mut self, reset_logic: bool) -> Result<(), Error> {
        self.protocol.reset(reset_logic)?;
        self.has_contract = false;
        self.contract = RawDataObject(0);
        self.partner_source_caps = SourceCapabilities::default();
        self.partner_sink_caps = None;
        self.vdm_tx = None;
        Ok(())
    }

    /// Signal a hard reset, unless one is already under way.
    pub(crate) fn send_hard_reset(&mut self) -> Result<(), Error> {
        if self.is_hard_reset {
            return Ok(());
        }

        info!("Send hard reset");
        self.is_hard_reset = true;
        self.hard_reset_counter.advance();
        self.protocol.send_hard_reset()?;
        Ok(())
    }

    fn handle_hard_reset(&mut self, event: HardResetEvent) -> Result<(), Error> {
        info!("Hard reset {:?}", event);
        if event == HardResetEvent::Received {
            self.protocol.log_token(false, Token::HardReset);
        }

        self.reset_protocol_layer(true)?;
        self.detach_threshold = ElectricPotential::new::<millivolt>(VSAFE5V_DISCONNECT_MV);
        self.tx_request = None;

        if self.is_source {
            let now = self.clock.now();
            self.policy_timer.start_type(now, TimerType::PSHardReset);
            self.set_state(PolicyState::SourceTransitionDefault(Default::default()));
        } else {
            self.set_state(PolicyState::SinkTransitionDefault(Default::default()));
        }
        Ok(())
    }
}
