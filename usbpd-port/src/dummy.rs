//! Implements a dummy transceiver, clock and device for testing.
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

use usbpd_port_traits::{Status, Transceiver, TransceiverError};

use crate::dpm::DevicePolicyManager;
use crate::observer::{EventSink, Notification};
use crate::protocol_layer::framing::{self, MAX_PAYLOAD_LEN};
use crate::protocol_layer::message::Message;
use crate::protocol_layer::message::data::sink_capabilities::SinkCapabilities;
use crate::protocol_layer::message::data::source_capabilities::{
    FixedSupply, PowerDataObject, SourceCapabilities, SprProgrammablePowerSupply,
};
use crate::protocol_layer::message::header::{ControlMessageType, Header, SpecificationRevision};
use crate::protocol_layer::Sop;
use crate::timers::Clock;
use crate::{DataRole, PowerRole};

/// How the dummy partner reacts to a transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxBehaviour {
    /// Acknowledge with a GoodCRC.
    Ack,
    /// Report that all retries failed.
    RetryFail,
    /// Report a collision.
    Collision,
    /// Report nothing.
    Silent,
}

/// The receive FIFO token of a SOP.
fn sop_token(sop: Sop) -> u8 {
    match sop {
        Sop::Sop => 0xe0,
        Sop::SopPrime => 0xc0,
        Sop::SopDoublePrime => 0xa0,
        Sop::SopPrimeDebug => 0x80,
        Sop::SopDoublePrimeDebug => 0x60,
    }
}

/// A dummy transceiver, with a partner that is scripted by the test.
#[derive(Debug)]
pub struct DummyDriver {
    rx: VecDeque<u8>,
    tx_fifo: Vec<u8>,
    latched: Status,
    next_rx_id: u8,

    /// The reaction to the next transmissions.
    pub behaviour: TxBehaviour,
    /// Frames that were started, in order.
    pub transmitted: Vec<Vec<u8>>,
    /// The number of started transmissions.
    pub transmit_count: usize,
    /// The number of signaled hard resets.
    pub hard_resets: usize,

    pub vbus_vsafe5v: bool,
    pub vbus_vsafe0v: bool,
    pub vconn: bool,
    pub receiver_enabled: bool,
    pub auto_retries: u8,
    pub roles: (bool, bool),
    pub sop_prime: (bool, bool),
    pub bist_carrier: bool,
    pub rx_auto_flush: bool,
}

impl DummyDriver {
    /// Create a new dummy transceiver, with VBUS at vSafe5V.
    pub fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            tx_fifo: Vec::new(),
            latched: Status::default(),
            next_rx_id: 0,
            behaviour: TxBehaviour::Ack,
            transmitted: Vec::new(),
            transmit_count: 0,
            hard_resets: 0,
            vbus_vsafe5v: true,
            vbus_vsafe0v: false,
            vconn: false,
            receiver_enabled: false,
            auto_retries: 0,
            roles: (false, false),
            sop_prime: (false, false),
            bist_carrier: false,
            rx_auto_flush: false,
        }
    }

    /// A header template for partner messages, in the given power role.
    pub fn partner_template(role: PowerRole) -> Header {
        let data_role = match role {
            PowerRole::Source => DataRole::Dfp,
            PowerRole::Sink => DataRole::Ufp,
        };
        Header::new_template(data_role, role, SpecificationRevision::R3_X)
    }

    /// Inject a raw packet into the receive FIFO, as acknowledged by the transceiver.
    pub fn inject_raw(&mut self, sop: Sop, header: Header, payload: &[u8]) {
        let mut raw = [0u8; 2];
        header.to_bytes(&mut raw);

        self.rx.push_back(sop_token(sop));
        self.rx.extend(raw);
        self.rx.extend(payload.iter().copied());
        self.rx.extend([0u8; 4]);
        self.latched.good_crc_sent = true;
    }

    /// Inject a message from the partner, with a fresh message ID.
    pub fn inject(&mut self, message: Message) {
        let header = message.header.with_message_id(self.next_rx_id);
        self.next_rx_id = (self.next_rx_id + 1) % 8;

        let mut payload = [0u8; MAX_PAYLOAD_LEN];
        let len = message.data().map_or(0, |data| data.to_bytes(&mut payload));
        self.inject_raw(Sop::Sop, header, &payload[..len]);
    }

    /// Inject a control message from the partner.
    pub fn inject_control(&mut self, role: PowerRole, message_type: ControlMessageType) {
        self.inject(Message::new(Header::new_control(
            Self::partner_template(role),
            message_type,
        )));
    }

    /// Signal a hard reset from the partner.
    pub fn inject_hard_reset(&mut self) {
        self.latched.hard_reset_received = true;
    }

    /// The next message ID that the partner will use.
    pub fn next_rx_id(&mut self) -> u8 {
        let id = self.next_rx_id;
        self.next_rx_id = (self.next_rx_id + 1) % 8;
        id
    }

    /// Parse a transmitted frame.
    pub fn parse_frame(frame: &[u8]) -> Message {
        let len = usize::from(frame[4] & 0x1f);
        Message::from_bytes(&frame[5..5 + len]).unwrap()
    }

    /// The payload of a transmitted frame, after the header.
    pub fn frame_payload(frame: &[u8]) -> &[u8] {
        let len = usize::from(frame[4] & 0x1f);
        &frame[7..5 + len]
    }

    /// The last transmitted message.
    pub fn last_message(&self) -> Option<Message> {
        self.transmitted.last().map(|frame| Self::parse_frame(frame))
    }

    /// All transmitted messages.
    pub fn messages(&self) -> Vec<Message> {
        self.transmitted.iter().map(|frame| Self::parse_frame(frame)).collect()
    }

    fn frame_sop(frame: &[u8]) -> Sop {
        [Sop::SopPrime, Sop::SopDoublePrime]
            .into_iter()
            .find(|&sop| frame[..4] == framing::sop_tokens(sop))
            .unwrap_or(Sop::Sop)
    }
}

impl Transceiver for DummyDriver {
    fn read_status(&mut self) -> Result<Status, TransceiverError> {
        let status = Status {
            rx_empty: self.rx.is_empty(),
            activity: false,
            vbus_vsafe5v: self.vbus_vsafe5v,
            vbus_vsafe0v: self.vbus_vsafe0v,
            ..self.latched
        };
        self.latched = Status::default();
        Ok(status)
    }

    fn read_fifo(&mut self, buffer: &mut [u8]) -> Result<(), TransceiverError> {
        if self.rx.len() < buffer.len() {
            return Err(TransceiverError::FifoUnderflow);
        }
        for byte in buffer.iter_mut() {
            *byte = self.rx.pop_front().unwrap();
        }
        Ok(())
    }

    fn write_fifo(&mut self, data: &[u8]) -> Result<(), TransceiverError> {
        self.tx_fifo.extend_from_slice(data);
        Ok(())
    }

    fn start_transmit(&mut self) -> Result<(), TransceiverError> {
        self.transmit_count += 1;
        let frame = core::mem::take(&mut self.tx_fifo);
        if frame.len() < 7 {
            // BIST carrier mode.
            return Ok(());
        }

        self.react(&frame);
        self.transmitted.push(frame);
        Ok(())
    }

    fn send_hard_reset(&mut self) -> Result<(), TransceiverError> {
        self.hard_resets += 1;
        self.latched.hard_reset_sent = true;
        Ok(())
    }

    fn flush_rx(&mut self) -> Result<(), TransceiverError> {
        self.rx.clear();
        Ok(())
    }

    fn flush_tx(&mut self) -> Result<(), TransceiverError> {
        self.tx_fifo.clear();
        Ok(())
    }

    fn reset_pd_logic(&mut self) -> Result<(), TransceiverError> {
        self.rx.clear();
        self.tx_fifo.clear();
        Ok(())
    }

    fn set_auto_good_crc(&mut self, _enable: bool) -> Result<(), TransceiverError> {
        Ok(())
    }

    fn set_auto_retries(&mut self, retries: u8) -> Result<(), TransceiverError> {
        self.auto_retries = retries;
        Ok(())
    }

    fn set_roles(&mut self, source: bool, dfp: bool) -> Result<(), TransceiverError> {
        self.roles = (source, dfp);
        Ok(())
    }

    fn enable_sop_prime(&mut self, sop_prime: bool, sop_double_prime: bool) -> Result<(), TransceiverError> {
        self.sop_prime = (sop_prime, sop_double_prime);
        Ok(())
    }

    fn enable_receiver(&mut self, enable: bool) -> Result<(), TransceiverError> {
        self.receiver_enabled = enable;
        Ok(())
    }

    fn set_vconn(&mut self, enable: bool) -> Result<(), TransceiverError> {
        self.vconn = enable;
        Ok(())
    }

    fn set_bist_carrier_mode(&mut self, enable: bool) -> Result<(), TransceiverError> {
        self.bist_carrier = enable;
        Ok(())
    }

    fn set_rx_auto_flush(&mut self, enable: bool) -> Result<(), TransceiverError> {
        self.rx_auto_flush = enable;
        Ok(())
    }
}

impl DummyDriver {
    fn react(&mut self, frame: &[u8]) {
        match self.behaviour {
            TxBehaviour::Ack => {
                let sent = Self::parse_frame(frame).header;
                let good_crc = Header::new_control(Self::partner_template(PowerRole::Sink), ControlMessageType::GoodCRC)
                    .with_message_id(sent.message_id());
                let mut raw = [0u8; 2];
                good_crc.to_bytes(&mut raw);

                self.rx.push_back(sop_token(Self::frame_sop(frame)));
                self.rx.extend(raw);
                self.rx.extend([0u8; 4]);
                self.latched.tx_sent = true;
            }
            TxBehaviour::RetryFail => self.latched.retry_fail = true,
            TxBehaviour::Collision => self.latched.collision = true,
            TxBehaviour::Silent => (),
        }
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct DummyClock(Rc<Cell<u32>>);

impl DummyClock {
    /// Advance by `ms` milliseconds.
    pub fn advance(&self, ms: u32) {
        self.0.set(self.0.get().wrapping_add(ms));
    }
}

impl Clock for DummyClock {
    fn now(&self) -> u32 {
        self.0.get()
    }
}

/// A dual-role device with 5 V/3 A, 9 V/3 A and a 3.3-11 V/3 A programmable supply.
#[derive(Debug, Default)]
pub struct DummyDevice {
    pub vbus: bool,
    pub discharge: bool,
    pub transitions: Vec<usize>,
    pub swapped_to: Option<PowerRole>,
    pub error_recoveries: usize,
}

impl DevicePolicyManager for DummyDevice {
    fn source_capabilities(&self) -> SourceCapabilities {
        let mut caps = SourceCapabilities::default();
        let pdos = [
            PowerDataObject::FixedSupply(FixedSupply::new(100, 300).with_dual_role_power(true)),
            PowerDataObject::FixedSupply(FixedSupply::new(180, 300)),
            PowerDataObject::Pps(
                SprProgrammablePowerSupply::default()
                    .with_raw_min_voltage(33)
                    .with_raw_max_voltage(110)
                    .with_raw_max_current(60),
            ),
        ];
        for pdo in pdos {
            caps.0.push(pdo).unwrap();
        }
        caps
    }

    fn sink_capabilities(&self) -> SinkCapabilities {
        SinkCapabilities::new_vsafe5v_only(300)
    }

    fn transition_source(&mut self, index: usize) {
        self.transitions.push(index);
    }

    fn set_vbus(&mut self, enable: bool) {
        self.vbus = enable;
    }

    fn set_vbus_discharge(&mut self, enable: bool) {
        self.discharge = enable;
    }

    fn country_codes(&self) -> &[u16] {
        // 19 codes fill an extended message of 40 bytes.
        &[
            0x4445, 0x4652, 0x4742, 0x5553, 0x4a50, 0x434e, 0x4b52, 0x5457, 0x4954, 0x4553, 0x4e4c, 0x4245, 0x4348,
            0x4154, 0x5345, 0x4e4f, 0x444b, 0x4649, 0x504c,
        ]
    }

    fn error_recovery(&mut self) {
        self.error_recoveries += 1;
    }

    fn role_swapped(&mut self, role: PowerRole) {
        self.swapped_to = Some(role);
    }
}

/// Records all notifications.
#[derive(Debug, Clone, Default)]
pub struct EventLog(pub Rc<RefCell<Vec<Notification>>>);

impl EventLog {
    /// The events that were notified so far.
    pub fn events(&self) -> Vec<crate::observer::Event> {
        self.0.borrow().iter().map(|notification| notification.event).collect()
    }
}

impl EventSink for EventLog {
    fn notify(&mut self, notification: Notification) {
        self.0.borrow_mut().push(notification);
    }
}
