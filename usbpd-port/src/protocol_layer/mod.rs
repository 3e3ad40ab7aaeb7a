//! The protocol layer is controlled by the policy engine, and commands the transceiver.
//!
//! Handles
//! - framing of messages for the transceiver FIFOs,
//! - message IDs per SOP, and duplicate detection,
//! - verification of the GoodCRC acknowledgement,
//! - manual retries and collision reporting,
//! - chunking of extended messages.
//!
//! The layer is polled. Each call to [`ProtocolLayer::run`] advances the state machine
//! by at most one state, driven by the transceiver status.

pub mod framing;
pub mod message;

use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;
use message::data::MAX_DATA_OBJECTS;
use message::extended::chunked::{
    ChunkResult, ChunkedMessageAssembler, ChunkedMessageSender, MAX_EXTENDED_MSG_CHUNK_LEN, MAX_EXTENDED_MSG_LEN,
};
use message::extended::{Extended, ExtendedHeader};
use message::header::{ControlMessageType, Header, MessageType, SpecificationRevision};
use message::Message;
use usbpd_port_traits::{Status, Transceiver, TransceiverError};

use self::framing::{Frame, MAX_PAYLOAD_LEN};
use crate::counters::{Counter, CounterType};
use crate::debug_log::{MessageLog, Token};
use crate::timers::{Timer, TimerType};

/// The number of retransmissions when retries are performed by the engine.
pub const MANUAL_RETRIES: u8 = 3;

/// Start of packet types, which address the port partner or a cable plug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Sop {
    /// The port partner.
    Sop,
    /// The near cable plug.
    SopPrime,
    /// The far cable plug.
    SopDoublePrime,
    /// Debug SOP'.
    SopPrimeDebug,
    /// Debug SOP''.
    SopDoublePrimeDebug,
}

impl Sop {
    /// The number of SOP types.
    pub const COUNT: usize = 5;

    /// A dense index, for per-SOP tables.
    pub const fn index(self) -> usize {
        match self {
            Sop::Sop => 0,
            Sop::SopPrime => 1,
            Sop::SopDoublePrime => 2,
            Sop::SopPrimeDebug => 3,
            Sop::SopDoublePrimeDebug => 4,
        }
    }
}

/// States of the protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolState {
    /// Send a hard reset.
    Reset,
    /// Wait for the hard reset to go out.
    ResetWait,
    /// Wait for something to send or receive.
    Idle,
    /// Wait for the transceiver to report the transmission result.
    SendingMessage,
    /// Read and check the acknowledgement.
    VerifyGoodCrc,
    /// Transmission with retries by the engine.
    ManualRetries,
    /// Not communicating.
    Disabled,
}

/// Status of the transmit path, as seen by the policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxStatus {
    /// Nothing queued.
    Idle,
    /// A message is queued for transmission.
    Send,
    /// The message is on its way.
    Busy,
    /// Waiting for a hard reset to go out.
    Wait,
    /// The message was acknowledged.
    Success,
    /// The message was not acknowledged.
    Error,
    /// Transmission was prevented by activity on the line.
    Collision,
    /// A hard reset is requested.
    Reset,
}

/// A message for the policy engine.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Received {
    /// The SOP it was received on.
    pub sop: Sop,
    /// The message.
    pub message: Message,
}

/// A hard reset reported by the transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HardResetEvent {
    /// The port partner signaled a hard reset.
    Received,
    /// This port signaled a hard reset.
    Sent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxOrigin {
    Policy,
    ChunkRequest,
}

#[derive(Debug, Clone)]
enum ExtendedTransfer {
    Idle,
    Sending {
        sop: Sop,
        header: Header,
        sender: ChunkedMessageSender,
        waiting: bool,
    },
    Receiving {
        sop: Sop,
        header: Header,
        assembler: ChunkedMessageAssembler,
        next_chunk: u8,
        waiting: bool,
    },
}

impl ExtendedTransfer {
    fn pending(&self) -> bool {
        match self {
            ExtendedTransfer::Idle => false,
            ExtendedTransfer::Sending { waiting, .. } | ExtendedTransfer::Receiving { waiting, .. } => !waiting,
        }
    }
}

/// The USB PD protocol layer.
#[derive(Debug)]
pub struct ProtocolLayer<DRIVER: Transceiver> {
    driver: DRIVER,
    state: ProtocolState,
    tx_status: TxStatus,
    status: Status,

    message_ids: [Counter; Sop::COUNT],
    last_rx_ids: [Option<u8>; Sop::COUNT],

    template: Header,
    tx: Option<(Sop, Message)>,
    tx_origin: TxOrigin,
    frame: Frame,
    rx: Option<Received>,
    extended: ExtendedTransfer,

    retry_timer: Timer,
    chunk_timer: Timer,
    retries_left: u8,
    retry_needed: bool,
    tx_flush: bool,
    awaiting_ack: bool,

    manual_retries: bool,
    good_crc_workaround: bool,
    next_gsce: bool,
    waiting_on_hard_reset: bool,

    log: MessageLog,
}

impl<DRIVER: Transceiver> ProtocolLayer<DRIVER> {
    /// Create a new, disabled protocol layer.
    pub fn new(driver: DRIVER, template: Header) -> Self {
        Self {
            driver,
            state: ProtocolState::Disabled,
            tx_status: TxStatus::Idle,
            status: Status::default(),
            message_ids: [Counter::new(CounterType::MessageId); Sop::COUNT],
            last_rx_ids: [None; Sop::COUNT],
            template,
            tx: None,
            tx_origin: TxOrigin::Policy,
            frame: Frame::new(),
            rx: None,
            extended: ExtendedTransfer::Idle,
            retry_timer: Timer::new(),
            chunk_timer: Timer::new(),
            retries_left: 0,
            retry_needed: false,
            tx_flush: false,
            awaiting_ack: false,
            manual_retries: false,
            good_crc_workaround: false,
            next_gsce: false,
            waiting_on_hard_reset: false,
            log: MessageLog::new(),
        }
    }

    /// Select retries by the engine, and the GoodCRC timing workaround.
    pub fn configure(&mut self, manual_retries: bool, good_crc_workaround: bool) {
        self.manual_retries = manual_retries;
        self.good_crc_workaround = good_crc_workaround;
    }

    /// Set the header template, which carries the present roles and revision.
    pub fn set_template(&mut self, template: Header) {
        self.template = template;
    }

    /// The header template.
    pub fn template(&self) -> Header {
        self.template
    }

    /// The state of the protocol layer.
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// The transmit status.
    pub fn tx_status(&self) -> TxStatus {
        self.tx_status
    }

    /// Override the transmit status.
    pub fn set_tx_status(&mut self, tx_status: TxStatus) {
        self.tx_status = tx_status;
    }

    /// The pending transceiver status.
    pub fn status(&self) -> &Status {
        &self.status
    }

    /// The transceiver.
    pub fn driver(&self) -> &DRIVER {
        &self.driver
    }

    /// The transceiver, mutably.
    pub fn driver_mut(&mut self) -> &mut DRIVER {
        &mut self.driver
    }

    /// The message log.
    pub fn log_mut(&mut self) -> &mut MessageLog {
        &mut self.log
    }

    /// The expected message ID of the next transmission on `sop`.
    pub fn message_id(&self, sop: Sop) -> u8 {
        self.message_ids[sop.index()].value()
    }

    /// The milliseconds until the next protocol timer expires, zero if none runs.
    pub fn next_timeout(&self, now: u32) -> u32 {
        [self.retry_timer.remaining(now), self.chunk_timer.remaining(now)]
            .into_iter()
            .filter(|&remaining| remaining > 0)
            .min()
            .unwrap_or(0)
    }

    /// Whether a hard reset goes out early, should the policy timer expire.
    pub fn waiting_on_hard_reset(&self) -> bool {
        self.waiting_on_hard_reset
    }

    /// Arm or clear the early hard reset.
    pub fn set_waiting_on_hard_reset(&mut self, waiting: bool) {
        self.waiting_on_hard_reset = waiting;
    }

    /// Read the transceiver status and merge it into the pending status.
    pub fn update_status(&mut self) -> Result<(), TransceiverError> {
        let fresh = self.driver.read_status()?;
        self.status = self.status.merge(fresh);
        Ok(())
    }

    /// Take a pending hard reset indication.
    pub fn take_hard_reset(&mut self) -> Option<HardResetEvent> {
        let received = core::mem::take(&mut self.status.hard_reset_received);
        let sent = core::mem::take(&mut self.status.hard_reset_sent);

        if received {
            Some(HardResetEvent::Received)
        } else if sent {
            Some(HardResetEvent::Sent)
        } else {
            None
        }
    }

    /// Take the message that was received last.
    pub fn take_received(&mut self) -> Option<Received> {
        self.rx.take()
    }

    /// Whether a received message waits for the policy engine.
    pub fn has_received(&self) -> bool {
        self.rx.is_some()
    }

    /// Drop a message that was received, but not yet handled.
    pub fn discard_received(&mut self) {
        self.rx = None;
    }

    /// Log a token.
    pub fn log_token(&mut self, transmit: bool, token: Token) {
        self.log.write_token(transmit, token);
    }

    /// Signal a hard reset right away.
    pub fn send_hard_reset(&mut self) -> Result<(), TransceiverError> {
        self.driver.send_hard_reset()?;
        self.log.write_token(true, Token::HardReset);
        self.tx_status = TxStatus::Wait;
        self.state = ProtocolState::ResetWait;
        Ok(())
    }

    /// Reset the layer to idle, dropping all messages and transfers.
    ///
    /// With `reset_logic`, the PD logic of the transceiver is reset as well.
    pub fn reset(&mut self, reset_logic: bool) -> Result<(), TransceiverError> {
        if reset_logic {
            self.driver.reset_pd_logic()?;
        }

        self.state = ProtocolState::Idle;
        self.tx_status = TxStatus::Idle;
        self.waiting_on_hard_reset = false;
        self.next_gsce = false;
        for counter in &mut self.message_ids {
            counter.reset();
        }
        self.last_rx_ids = [None; Sop::COUNT];
        self.tx = None;
        self.rx = None;
        self.frame.clear();
        self.abort_extended();
        self.retry_timer.disable();
        Ok(())
    }

    /// Stop communication.
    pub fn disable(&mut self) {
        self.state = ProtocolState::Disabled;
        self.tx_status = TxStatus::Idle;
        self.tx = None;
        self.rx = None;
        self.abort_extended();
        self.retry_timer.disable();
    }

    /// Queue a message, and start transmission if the layer is idle.
    ///
    /// Extended messages are sent in chunks. The transmit status stays busy until
    /// the last chunk was acknowledged.
    pub fn transmit(&mut self, now: u32, sop: Sop, message: Message) -> Result<(), TransceiverError> {
        if let Some(extended) = message.extended() {
            let mut data = [0u8; MAX_EXTENDED_MSG_LEN];
            let len = extended.to_bytes(&mut data);
            self.extended = ExtendedTransfer::Sending {
                sop,
                header: message.header,
                sender: ChunkedMessageSender::new(&data[..len]),
                waiting: false,
            };
            self.tx = None;
        } else {
            self.tx = Some((sop, message));
        }

        self.tx_status = TxStatus::Send;
        if self.state == ProtocolState::Idle {
            self.idle(now)?;
        }
        Ok(())
    }

    /// Advance the state machine.
    pub fn run(&mut self, now: u32) -> Result<(), TransceiverError> {
        if self.chunk_timer.expired(now) {
            warn!("Extended message transfer timed out");
            if let ExtendedTransfer::Sending { .. } = self.extended {
                self.tx_status = TxStatus::Error;
            }
            self.abort_extended();
        }

        match self.state {
            ProtocolState::Reset => {
                if self.waiting_on_hard_reset {
                    self.waiting_on_hard_reset = false;
                } else {
                    self.driver.send_hard_reset()?;
                }
                self.log.write_token(true, Token::HardReset);
                self.tx_status = TxStatus::Wait;
                self.state = ProtocolState::ResetWait;
            }
            ProtocolState::ResetWait => {
                if core::mem::take(&mut self.status.hard_reset_sent) {
                    self.state = ProtocolState::Idle;
                    self.tx_status = TxStatus::Success;
                }
            }
            ProtocolState::Idle => self.idle(now)?,
            ProtocolState::SendingMessage => self.sending(now)?,
            ProtocolState::VerifyGoodCrc => self.verify(now)?,
            ProtocolState::ManualRetries => self.manual_retry(now)?,
            ProtocolState::Disabled => (),
        }
        Ok(())
    }

    fn idle(&mut self, now: u32) -> Result<(), TransceiverError> {
        if self.tx_status == TxStatus::Reset {
            self.state = ProtocolState::Reset;
            return Ok(());
        }

        let received = if self.good_crc_workaround {
            core::mem::take(&mut self.status.crc_check)
        } else {
            core::mem::take(&mut self.status.good_crc_sent)
        };

        if received {
            if core::mem::take(&mut self.tx_flush) {
                self.driver.flush_tx()?;
            }
            self.receive(now)?;
            if !matches!(self.extended, ExtendedTransfer::Sending { .. }) {
                self.tx_status = TxStatus::Idle;
            }
        } else if self.tx_status == TxStatus::Send {
            self.send_frame(now, TxOrigin::Policy)?;
        } else if self.extended.pending() {
            let origin = match self.extended {
                ExtendedTransfer::Receiving { .. } => TxOrigin::ChunkRequest,
                _ => TxOrigin::Policy,
            };
            self.send_frame(now, origin)?;
        } else if !self.good_crc_workaround && !self.status.activity && !self.status.rx_empty {
            // A second message can arrive without a new indication.
            self.receive(now)?;
        }
        Ok(())
    }

    fn sending(&mut self, now: u32) -> Result<(), TransceiverError> {
        if core::mem::take(&mut self.status.tx_sent) {
            self.verify(now)?;
        } else if core::mem::take(&mut self.status.collision) {
            self.finish(TxStatus::Collision);
        } else if core::mem::take(&mut self.status.retry_fail) {
            self.finish(TxStatus::Error);
        } else if core::mem::take(&mut self.status.good_crc_sent) {
            self.interrupted(now)?;
        } else if core::mem::take(&mut self.status.crc_check) {
            self.verify(now)?;
        }
        Ok(())
    }

    /// A received message interrupted the transmission.
    ///
    /// The acknowledgement may still be queued before the message.
    fn interrupted(&mut self, now: u32) -> Result<(), TransceiverError> {
        self.receive(now)?;
        if self.awaiting_ack {
            self.finish(TxStatus::Error);
        }
        Ok(())
    }

    fn manual_retry(&mut self, now: u32) -> Result<(), TransceiverError> {
        if core::mem::take(&mut self.status.collision) {
            self.tx_flush = true;
        }
        if core::mem::take(&mut self.status.retry_fail) {
            self.retry_needed = true;
        }
        if core::mem::take(&mut self.status.tx_sent) {
            self.verify(now)?;
        }
        if core::mem::take(&mut self.status.good_crc_sent) {
            self.interrupted(now)?;
        }

        if !core::mem::take(&mut self.retry_needed) || self.state != ProtocolState::ManualRetries {
            return Ok(());
        }

        if !self.status.rx_empty {
            self.driver.flush_rx()?;
        }

        if self.retries_left == 0 {
            warn!("Transmission failed after {} retries", MANUAL_RETRIES);
            self.finish(TxStatus::Error);
            return Ok(());
        }

        self.retries_left -= 1;
        trace!("Retransmit, {} retries left", self.retries_left);
        if !self.tx_flush {
            self.driver.write_fifo(&self.frame)?;
        }
        self.driver.start_transmit()?;
        self.retry_timer.start_type(now, TimerType::Retry);
        Ok(())
    }

    /// Report the result of a transmission, and go back to idle.
    fn finish(&mut self, result: TxStatus) {
        self.state = ProtocolState::Idle;
        self.awaiting_ack = false;
        self.retry_timer.disable();

        match self.tx_origin {
            TxOrigin::Policy => {
                if result != TxStatus::Success && matches!(self.extended, ExtendedTransfer::Sending { .. }) {
                    self.abort_extended();
                }
                self.tx_status = result;
            }
            TxOrigin::ChunkRequest => {
                if result != TxStatus::Success {
                    warn!("Chunk request failed with {:?}", result);
                    self.abort_extended();
                }
            }
        }
    }

    fn abort_extended(&mut self) {
        self.extended = ExtendedTransfer::Idle;
        self.chunk_timer.disable();
    }

    fn send_frame(&mut self, now: u32, origin: TxOrigin) -> Result<(), TransceiverError> {
        self.retries_left = MANUAL_RETRIES;
        self.retry_needed = false;
        self.tx_flush = false;
        self.tx_origin = origin;

        let mut payload = [0u8; MAX_PAYLOAD_LEN];
        let (sop, mut header, len) = match (&mut self.extended, origin) {
            (ExtendedTransfer::Receiving { sop, header, next_chunk, waiting, .. }, TxOrigin::ChunkRequest) => {
                *waiting = true;
                let request = ChunkedMessageAssembler::build_chunk_request_header(*next_chunk);
                request.to_bytes(&mut payload);
                let header = Header::new(self.template, header.message_type(), 1);
                (*sop, header, 4)
            }
            (ExtendedTransfer::Sending { sop, header, sender, .. }, TxOrigin::Policy) => {
                let (ext_header, chunk) = sender.chunk();
                ext_header.to_bytes(&mut payload);
                payload[2..2 + chunk.len()].copy_from_slice(chunk);
                let num_objects = sender.num_objects();
                (*sop, header.with_num_objects(num_objects), 4 * usize::from(num_objects))
            }
            _ => {
                let Some((sop, message)) = &self.tx else {
                    self.tx_status = TxStatus::Idle;
                    return Ok(());
                };
                let len = message.data().map_or(0, |data| data.to_bytes(&mut payload));
                (*sop, message.header, len)
            }
        };

        let index = sop.index();
        if header.is_control(ControlMessageType::SoftReset) {
            self.message_ids[index].reset();
            self.last_rx_ids[index] = None;
        }
        header = header.with_message_id(self.message_ids[index].value());

        self.frame = framing::encode(sop, header, &payload[..len]);
        if origin == TxOrigin::Policy {
            self.tx_status = TxStatus::Busy;
        }

        match self.driver.write_fifo(&self.frame) {
            Ok(()) => (),
            Err(TransceiverError::FifoOverflow) => {
                // The write collided with an automatic GoodCRC, discard it.
                self.tx_flush = true;
                self.finish(TxStatus::Error);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.driver.start_transmit()?;
        self.awaiting_ack = true;
        self.retry_timer.start_type(now, TimerType::Retry);
        self.state = if self.manual_retries {
            ProtocolState::ManualRetries
        } else {
            ProtocolState::SendingMessage
        };

        trace!("Transmit {:?} on {:?}", header.message_type(), sop);
        log_message(&mut self.log, true, sop, header, &payload[..len]);
        Ok(())
    }

    /// Read the acknowledgement of the transmitted message from the receive FIFO.
    fn verify(&mut self, now: u32) -> Result<(), TransceiverError> {
        let mut head = [0u8; 3];
        self.driver.read_fifo(&mut head)?;
        let sop = framing::decode_sop(head[0]);
        let header = Header(LittleEndian::read_u16(&head[1..]));

        if !header.is_control(ControlMessageType::GoodCRC) {
            // The next message preempted the acknowledgement.
            self.finish(TxStatus::Error);
            return self.process_packet(sop, header);
        }

        let mut crc = [0u8; 4];
        self.driver.read_fifo(&mut crc)?;
        self.acknowledged(now, sop, header);
        Ok(())
    }

    fn acknowledged(&mut self, now: u32, sop: Option<Sop>, header: Header) {
        let Some(sop) = sop else {
            warn!("GoodCRC on undecodable SOP");
            self.finish(TxStatus::Error);
            return;
        };
        log_message(&mut self.log, false, sop, header, &[]);

        let index = sop.index();
        if header.message_id() != self.message_ids[index].value() {
            warn!(
                "GoodCRC with ID {}, expected {}",
                header.message_id(),
                self.message_ids[index].value()
            );
            self.log.write_token(false, Token::BadMessageId);
            self.finish(TxStatus::Error);
            return;
        }

        self.message_ids[index].advance();

        if self.tx_origin == TxOrigin::Policy {
            if let ExtendedTransfer::Sending { sender, waiting, .. } = &mut self.extended {
                sender.advance();
                if sender.is_complete() {
                    self.abort_extended();
                } else {
                    // The receiver requests the next chunk.
                    *waiting = true;
                    self.state = ProtocolState::Idle;
                    self.awaiting_ack = false;
                    self.retry_timer.disable();
                    self.chunk_timer.start_type(now, TimerType::ChunkSenderResponse);
                    return;
                }
            }
        } else {
            self.chunk_timer.start_type(now, TimerType::ChunkSenderResponse);
        }

        self.finish(TxStatus::Success);
    }

    /// Read received packets from the FIFO.
    ///
    /// Reading continues after a GoodCRC, which completes a pending transmission.
    fn receive(&mut self, now: u32) -> Result<(), TransceiverError> {
        loop {
            if self.status.rx_empty {
                return Ok(());
            }

            let mut head = [0u8; 3];
            self.driver.read_fifo(&mut head)?;
            let sop = framing::decode_sop(head[0]);
            let header = Header(LittleEndian::read_u16(&head[1..]));

            if header.is_control(ControlMessageType::GoodCRC) {
                let mut crc = [0u8; 4];
                self.driver.read_fifo(&mut crc)?;
                if self.awaiting_ack {
                    self.acknowledged(now, sop, header);
                }
                self.update_status()?;
                continue;
            }

            self.process_packet(sop, header)?;
            return self.update_status();
        }
    }

    /// Process a received packet, of which the token and header were read.
    fn process_packet(&mut self, sop: Option<Sop>, header: Header) -> Result<(), TransceiverError> {
        let Some(sop) = sop else {
            warn!("Dropping packet with undecodable SOP");
            return Ok(());
        };

        if self.good_crc_workaround
            && header.is_control(ControlMessageType::GetSourceCapExtended)
            && !core::mem::take(&mut self.next_gsce)
        {
            // The first request is acknowledged by hand, and delivered on its retry.
            self.next_gsce = true;
            return self.send_good_crc(header);
        }

        let mut payload = [0u8; MAX_PAYLOAD_LEN + 4];
        let len = 4 * header.num_objects();
        self.driver.read_fifo(&mut payload[..len + 4])?;
        let payload = &payload[..len];

        let index = sop.index();
        let fresh = if header.is_control(ControlMessageType::SoftReset) {
            self.message_ids[index].reset();
            self.last_rx_ids[index] = None;
            true
        } else if self.last_rx_ids[index] != Some(header.message_id()) {
            self.last_rx_ids[index] = Some(header.message_id());
            true
        } else {
            false
        };

        log_message(&mut self.log, false, sop, header, payload);

        if !fresh {
            debug!("Dropping duplicate message ID {}", header.message_id());
            return Ok(());
        }

        trace!("Received {:?} on {:?}", header.message_type(), sop);
        if header.extended() {
            self.receive_chunk(sop, header, payload);
            return Ok(());
        }

        let mut raw = [0u8; 2 + MAX_PAYLOAD_LEN];
        header.to_bytes(&mut raw);
        raw[2..2 + len].copy_from_slice(payload);
        match Message::from_bytes(&raw[..2 + len]) {
            Ok(message) => self.rx = Some(Received { sop, message }),
            Err(_e) => warn!("Dropping malformed message: {:?}", _e),
        }
        Ok(())
    }

    fn receive_chunk(&mut self, sop: Sop, header: Header, payload: &[u8]) {
        let Some(ext_header) = ExtendedHeader::from_bytes(payload) else {
            warn!("Extended message without extended header");
            return;
        };

        if ext_header.request_chunk() {
            if let ExtendedTransfer::Sending { sender, waiting, .. } = &mut self.extended {
                sender.request(ext_header.chunk_number());
                *waiting = false;
                self.chunk_timer.disable();
            }
            return;
        }

        if ext_header.chunk_number() == 0 {
            self.extended = ExtendedTransfer::Receiving {
                sop,
                header,
                assembler: ChunkedMessageAssembler::new(),
                next_chunk: 0,
                waiting: true,
            };
        }

        let ExtendedTransfer::Receiving {
            assembler, next_chunk, waiting, ..
        } = &mut self.extended
        else {
            warn!("Dropping chunk {} without a transfer", ext_header.chunk_number());
            return;
        };

        let end = payload.len().min(2 + MAX_EXTENDED_MSG_CHUNK_LEN);
        match assembler.process_chunk(ext_header, &payload[2..end]) {
            Ok(ChunkResult::Complete(data)) => {
                self.abort_extended();
                let message_type = match header.message_type() {
                    MessageType::Extended(message_type) => message_type,
                    _ => return,
                };
                self.rx = Some(Received {
                    sop,
                    message: Message::new_with_extended(header, Extended::parse(message_type, &data)),
                });
            }
            Ok(ChunkResult::NeedMoreChunks(chunk)) => {
                *next_chunk = chunk;
                *waiting = false;
                self.chunk_timer.disable();
            }
            Ok(ChunkResult::ChunkRequested(_)) => (),
            Err(_e) => {
                warn!("Dropping extended message: {:?}", _e);
                self.abort_extended();
            }
        }
    }

    /// Acknowledge a packet by hand, for transceivers that are late to do so.
    fn send_good_crc(&mut self, received: Header) -> Result<(), TransceiverError> {
        let mut crc = [0u8; 4];
        self.driver.read_fifo(&mut crc)?;

        let header = Header::new_control(self.template, ControlMessageType::GoodCRC)
            .with_spec_revision(SpecificationRevision::R2_0)
            .with_message_id(received.message_id());
        let frame = framing::encode_immediate(Sop::Sop, header, &[]);
        self.driver.write_fifo(&frame)
    }
}

fn log_message(log: &mut MessageLog, transmit: bool, sop: Sop, header: Header, payload: &[u8]) {
    let objects: Vec<u32, MAX_DATA_OBJECTS> = payload.chunks_exact(4).map(LittleEndian::read_u32).collect();
    log.write_message(transmit, sop.index() as u8, header.0, &objects);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{DummyDriver, TxBehaviour};
    use crate::PowerRole;

    fn layer() -> ProtocolLayer<DummyDriver> {
        let template = DummyDriver::partner_template(PowerRole::Sink);
        let mut layer = ProtocolLayer::new(DummyDriver::new(), template);
        layer.reset(false).unwrap();
        layer
    }

    fn ping(layer: &ProtocolLayer<DummyDriver>) -> Message {
        Message::new(Header::new_control(layer.template(), ControlMessageType::Ping))
    }

    fn step(layer: &mut ProtocolLayer<DummyDriver>) {
        layer.update_status().unwrap();
        layer.run(0).unwrap();
    }

    #[test]
    fn acknowledged_transmission_advances_message_id() {
        let mut layer = layer();
        let message = ping(&layer);
        layer.transmit(0, Sop::Sop, message).unwrap();
        assert_eq!(layer.state(), ProtocolState::SendingMessage);
        assert_eq!(layer.tx_status(), TxStatus::Busy);

        step(&mut layer);

        assert_eq!(layer.state(), ProtocolState::Idle);
        assert_eq!(layer.tx_status(), TxStatus::Success);
        assert_eq!(layer.message_id(Sop::Sop), 1);
        assert_eq!(layer.message_id(Sop::SopPrime), 0);
    }

    #[test]
    fn manual_retries_give_up() {
        let mut layer = layer();
        layer.configure(true, false);
        layer.driver_mut().behaviour = TxBehaviour::RetryFail;

        let message = ping(&layer);
        layer.transmit(0, Sop::Sop, message).unwrap();
        assert_eq!(layer.state(), ProtocolState::ManualRetries);

        for _ in 0..8 {
            step(&mut layer);
        }

        assert_eq!(layer.driver().transmit_count, 1 + usize::from(MANUAL_RETRIES));
        assert_eq!(layer.tx_status(), TxStatus::Error);
        assert_eq!(layer.state(), ProtocolState::Idle);
        assert_eq!(layer.message_id(Sop::Sop), 0);
    }

    #[test]
    fn collision_is_reported() {
        let mut layer = layer();
        layer.driver_mut().behaviour = TxBehaviour::Collision;

        let message = ping(&layer);
        layer.transmit(0, Sop::Sop, message).unwrap();
        step(&mut layer);

        assert_eq!(layer.tx_status(), TxStatus::Collision);
        assert_eq!(layer.state(), ProtocolState::Idle);
    }

    #[test]
    fn duplicate_message_id_is_dropped() {
        let mut layer = layer();
        let header = Header::new_control(
            DummyDriver::partner_template(PowerRole::Source),
            ControlMessageType::Accept,
        )
        .with_message_id(5);
        layer.driver_mut().inject_raw(Sop::Sop, header, &[]);
        layer.driver_mut().inject_raw(Sop::Sop, header, &[]);

        step(&mut layer);
        let received = layer.take_received().expect("first message");
        assert_eq!(received.sop, Sop::Sop);
        assert!(received.message.header.is_control(ControlMessageType::Accept));

        step(&mut layer);
        assert!(layer.take_received().is_none());
    }

    #[test]
    fn soft_reset_clears_duplicate_detection() {
        let mut layer = layer();
        let template = DummyDriver::partner_template(PowerRole::Source);
        let soft_reset = Header::new_control(template, ControlMessageType::SoftReset).with_message_id(0);
        layer.driver_mut().inject_raw(Sop::Sop, soft_reset, &[]);
        step(&mut layer);
        assert!(layer.take_received().is_some());

        layer.driver_mut().inject_raw(Sop::Sop, soft_reset, &[]);
        step(&mut layer);
        assert!(layer.take_received().is_some());
    }

    /// Chunk `number` of a 40 byte Country_Codes message from the partner.
    fn inject_country_codes_chunk(layer: &mut ProtocolLayer<DummyDriver>, number: u8) {
        let mut data = [0u8; 40];
        data[0] = 19;
        for (i, byte) in data[2..].iter_mut().enumerate() {
            *byte = 0x41 + i as u8;
        }

        let start = usize::from(number) * MAX_EXTENDED_MSG_CHUNK_LEN;
        let end = (start + MAX_EXTENDED_MSG_CHUNK_LEN).min(data.len());
        let mut payload = [0u8; MAX_PAYLOAD_LEN];
        ExtendedHeader::new(40)
            .with_chunked(true)
            .with_chunk_number(number)
            .to_bytes(&mut payload);
        payload[2..2 + end - start].copy_from_slice(&data[start..end]);
        let num_objects = (2 + end - start).div_ceil(4);

        let header = Header::new_extended(
            DummyDriver::partner_template(PowerRole::Source),
            message::header::ExtendedMessageType::CountryCodes,
        )
        .with_num_objects(num_objects as u8)
        .with_message_id(number);
        layer.driver_mut().inject_raw(Sop::Sop, header, &payload[..4 * num_objects]);
    }

    /// Receive the first chunk, and let the chunk request go out and be acknowledged.
    fn request_second_chunk(layer: &mut ProtocolLayer<DummyDriver>) {
        inject_country_codes_chunk(layer, 0);
        step(layer);
        assert!(layer.take_received().is_none());
        assert!(layer.driver().transmitted.is_empty());

        step(layer);
        assert_eq!(layer.state(), ProtocolState::SendingMessage);
        step(layer);
        assert_eq!(layer.state(), ProtocolState::Idle);
    }

    #[test]
    fn chunked_message_is_requested_and_assembled() {
        let mut layer = layer();
        request_second_chunk(&mut layer);

        let frame = &layer.driver().transmitted[0];
        let request = DummyDriver::parse_frame(frame).header;
        assert!(request.extended());
        assert_eq!(request.num_objects(), 1);
        let ext_header = ExtendedHeader::from_bytes(DummyDriver::frame_payload(frame)).unwrap();
        assert!(ext_header.request_chunk());
        assert_eq!(ext_header.chunk_number(), 1);
        // The policy engine does not see the chunk request.
        assert_eq!(layer.tx_status(), TxStatus::Idle);

        inject_country_codes_chunk(&mut layer, 1);
        step(&mut layer);

        let received = layer.take_received().expect("assembled message");
        let Some(Extended::CountryCodes(codes)) = received.message.extended() else {
            panic!("expected country codes");
        };
        assert_eq!(codes.len(), 19);
        assert_eq!(codes[0], 0x4241);
        assert_eq!(codes[18], 0x6665);
        assert_eq!(layer.next_timeout(0), 0);
    }

    #[test]
    fn chunk_transfer_times_out() {
        let mut layer = layer();
        request_second_chunk(&mut layer);
        let timeout = TimerType::ChunkSenderResponse.duration_ms();
        assert_eq!(layer.next_timeout(0), timeout);

        layer.update_status().unwrap();
        layer.run(timeout).unwrap();
        assert_eq!(layer.next_timeout(timeout), 0);

        // The late chunk has no transfer to join.
        inject_country_codes_chunk(&mut layer, 1);
        step(&mut layer);
        assert!(layer.take_received().is_none());
        assert_eq!(layer.driver().transmitted.len(), 1);
    }

    #[test]
    fn reset_request_signals_hard_reset() {
        let mut layer = layer();
        layer.set_tx_status(TxStatus::Reset);

        layer.run(0).unwrap();
        assert_eq!(layer.state(), ProtocolState::Reset);
        layer.run(0).unwrap();
        assert_eq!(layer.state(), ProtocolState::ResetWait);
        assert_eq!(layer.driver().hard_resets, 1);

        step(&mut layer);
        assert_eq!(layer.state(), ProtocolState::Idle);
        assert_eq!(layer.tx_status(), TxStatus::Success);
    }
}
