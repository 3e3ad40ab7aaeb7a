//! USB PD port engine traits.
//!
//! Provides the transceiver trait through which the protocol layer and policy engine
//! talk to a FIFO-based USB PD PHY (for example, the FUSB302 family).
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

/// Transceiver access error.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransceiverError {
    /// The register transport (e.g. I2C) failed.
    #[error("transceiver bus access failed")]
    Bus,

    /// The transmit FIFO could not take the frame.
    #[error("transmit FIFO overflow")]
    FifoOverflow,

    /// The receive FIFO held fewer bytes than requested.
    #[error("receive FIFO underflow")]
    FifoUnderflow,
}

/// A snapshot of the transceiver status.
///
/// The first group holds latched interrupt indications. The engine merges them across
/// calls and clears each one when it has been consumed, so a driver may report an
/// indication exactly once. The second group holds level indications, reported as
/// they are at the time of the read.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status {
    /// A hard reset ordered set was received.
    pub hard_reset_received: bool,
    /// A hard reset ordered set was sent.
    pub hard_reset_sent: bool,
    /// A GoodCRC was sent in response to a received message.
    pub good_crc_sent: bool,
    /// A transmitted message was acknowledged by a GoodCRC.
    pub tx_sent: bool,
    /// A transmission was aborted due to activity on the line.
    pub collision: bool,
    /// All hardware retries failed without a GoodCRC.
    pub retry_fail: bool,
    /// A received frame passed its CRC check.
    pub crc_check: bool,

    /// The receive FIFO is empty.
    pub rx_empty: bool,
    /// The BMC receiver sees activity on the CC line.
    pub activity: bool,
    /// VBUS is above the vSafe5V threshold.
    pub vbus_vsafe5v: bool,
    /// VBUS is below the vSafe0V threshold.
    pub vbus_vsafe0v: bool,
}

impl Status {
    /// Merge a freshly read status into a pending one.
    ///
    /// Latched indications accumulate, level indications are replaced.
    pub fn merge(self, fresh: Status) -> Status {
        Status {
            hard_reset_received: self.hard_reset_received || fresh.hard_reset_received,
            hard_reset_sent: self.hard_reset_sent || fresh.hard_reset_sent,
            good_crc_sent: self.good_crc_sent || fresh.good_crc_sent,
            tx_sent: self.tx_sent || fresh.tx_sent,
            collision: self.collision || fresh.collision,
            retry_fail: self.retry_fail || fresh.retry_fail,
            crc_check: self.crc_check || fresh.crc_check,
            rx_empty: fresh.rx_empty,
            activity: fresh.activity,
            vbus_vsafe5v: fresh.vbus_vsafe5v,
            vbus_vsafe0v: fresh.vbus_vsafe0v,
        }
    }
}

/// Transceiver trait, through which the engine talks to the PHY.
///
/// Every method is a short, non-blocking register access.
pub trait Transceiver {
    /// Read the interrupt and status registers.
    fn read_status(&mut self) -> Result<Status, TransceiverError>;

    /// Read exactly `buffer.len()` bytes from the receive FIFO.
    fn read_fifo(&mut self, buffer: &mut [u8]) -> Result<(), TransceiverError>;

    /// Write tokens and data to the transmit FIFO.
    fn write_fifo(&mut self, data: &[u8]) -> Result<(), TransceiverError>;

    /// Start transmission of the transmit FIFO content.
    fn start_transmit(&mut self) -> Result<(), TransceiverError>;

    /// Send a hard reset ordered set.
    fn send_hard_reset(&mut self) -> Result<(), TransceiverError>;

    /// Flush the receive FIFO.
    fn flush_rx(&mut self) -> Result<(), TransceiverError>;

    /// Flush the transmit FIFO.
    fn flush_tx(&mut self) -> Result<(), TransceiverError>;

    /// Reset the PD logic of the PHY (FIFOs and message ID tracking).
    fn reset_pd_logic(&mut self) -> Result<(), TransceiverError>;

    /// Enable or disable the automatic GoodCRC response.
    fn set_auto_good_crc(&mut self, enable: bool) -> Result<(), TransceiverError>;

    /// Set the number of automatic hardware retries.
    ///
    /// Zero is used when the engine performs retries itself.
    fn set_auto_retries(&mut self, retries: u8) -> Result<(), TransceiverError>;

    /// Set the role bits used in automatically generated GoodCRC headers.
    ///
    /// `source` is the power role, `dfp` the data role.
    fn set_roles(&mut self, source: bool, dfp: bool) -> Result<(), TransceiverError>;

    /// Enable reception of SOP' and SOP'' packets.
    fn enable_sop_prime(&mut self, sop_prime: bool, sop_double_prime: bool) -> Result<(), TransceiverError>;

    /// Enable or disable the BMC receiver.
    fn enable_receiver(&mut self, enable: bool) -> Result<(), TransceiverError>;

    /// Switch VCONN on the inactive CC line.
    fn set_vconn(&mut self, enable: bool) -> Result<(), TransceiverError>;

    /// Enable or disable BIST carrier mode 2.
    fn set_bist_carrier_mode(&mut self, enable: bool) -> Result<(), TransceiverError>;

    /// Enable or disable automatic flushing of received BIST test data.
    fn set_rx_auto_flush(&mut self, enable: bool) -> Result<(), TransceiverError>;
}
