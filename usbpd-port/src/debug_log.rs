//! Fixed-capacity logs of policy states and message traffic.
//!
//! Both logs are read out by a host, for example over a debug interface.
use byteorder::{ByteOrder, LittleEndian};
use heapless::Deque;

/// The number of entries in the state log.
pub const STATE_LOG_SIZE: usize = 64;

/// The size of the message log in bytes.
pub const MESSAGE_LOG_SIZE: usize = 128;

/// The size of one exported state log entry.
pub const STATE_LOG_RECORD_SIZE: usize = 5;

/// One state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StateLogEntry {
    /// The identifier of the entered state.
    pub state: u8,
    /// Milliseconds within the second.
    pub ms: u16,
    /// Seconds.
    pub s: u16,
}

/// A queue of state transitions.
///
/// Writes fail once the log is full, so that the start of a sequence is kept.
#[derive(Debug, Default)]
pub struct StateLog {
    entries: Deque<StateLogEntry, STATE_LOG_SIZE>,
}

impl StateLog {
    /// Create an empty log.
    pub const fn new() -> Self {
        Self { entries: Deque::new() }
    }

    /// Log the entry into a state at time `now` (ms).
    ///
    /// Returns `false` if the log is full.
    pub fn write(&mut self, state: u8, now: u32) -> bool {
        let entry = StateLogEntry {
            state,
            ms: (now % 1000) as u16,
            s: (now / 1000) as u16,
        };
        self.entries.push_back(entry).is_ok()
    }

    /// Take the oldest entry.
    pub fn read(&mut self) -> Option<StateLogEntry> {
        self.entries.pop_front()
    }

    /// Move as many entries as fit into `buf`, five bytes each, returning the number of
    /// written bytes.
    ///
    /// Each record is the state, followed by milliseconds and seconds in little-endian.
    pub fn export(&mut self, buf: &mut [u8]) -> usize {
        let mut written = 0;
        for record in buf.chunks_exact_mut(STATE_LOG_RECORD_SIZE) {
            let Some(entry) = self.read() else {
                break;
            };
            record[0] = entry.state;
            LittleEndian::write_u16(&mut record[1..3], entry.ms);
            LittleEndian::write_u16(&mut record[3..5], entry.s);
            written += STATE_LOG_RECORD_SIZE;
        }
        written
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the log is full.
    pub fn is_full(&self) -> bool {
        self.entries.is_full()
    }
}

/// Events that are logged without a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Token {
    /// The port was attached.
    Attach = 1,
    /// The port was detached.
    Detach = 2,
    /// A hard reset was sent or received.
    HardReset = 3,
    /// An acknowledgement carried an unexpected message ID.
    BadMessageId = 4,
}

const ENTRY_MESSAGE: u8 = 0x80;
const ENTRY_TRANSMIT: u8 = 0x40;
const ENTRY_LENGTH_MASK: u8 = 0x1f;

/// A byte ring of tokens and messages.
///
/// Every entry starts with a descriptor byte: bit 7 marks a message, bit 6 a
/// transmission, and bits 0..=4 hold the entry length minus one. A token entry is
/// followed by the token. A message entry is followed by the SOP index, the header,
/// and the data objects.
///
/// When space runs out, whole entries are dropped from the front and the overflow flag
/// is raised.
#[derive(Debug, Default)]
pub struct MessageLog {
    buffer: Deque<u8, MESSAGE_LOG_SIZE>,
    overflow: bool,
}

impl MessageLog {
    /// Create an empty log.
    pub const fn new() -> Self {
        Self {
            buffer: Deque::new(),
            overflow: false,
        }
    }

    fn next_entry_len(&self) -> usize {
        self.buffer
            .front()
            .map_or(0, |descriptor| usize::from(descriptor & ENTRY_LENGTH_MASK) + 1)
    }

    fn claim(&mut self, len: usize) -> bool {
        if len >= MESSAGE_LOG_SIZE {
            return false;
        }

        while MESSAGE_LOG_SIZE - self.buffer.len() < len {
            let drop = self.next_entry_len();
            if drop == 0 {
                return false;
            }
            self.overflow = true;
            for _ in 0..drop {
                self.buffer.pop_front();
            }
        }
        true
    }

    fn descriptor(transmit: bool, kind: u8, len: usize) -> u8 {
        let direction = if transmit { ENTRY_TRANSMIT } else { 0 };
        kind | direction | ((len - 1) as u8 & ENTRY_LENGTH_MASK)
    }

    fn push(&mut self, bytes: impl IntoIterator<Item = u8>) {
        for byte in bytes {
            // Space was claimed before.
            let _ = self.buffer.push_back(byte);
        }
    }

    /// Log a token.
    pub fn write_token(&mut self, transmit: bool, token: Token) -> bool {
        if !self.claim(2) {
            return false;
        }

        self.push([Self::descriptor(transmit, 0, 2), token as u8 & 0x0f]);
        true
    }

    /// Log a message header with its data objects.
    pub fn write_message(&mut self, transmit: bool, sop: u8, header: u16, objects: &[u32]) -> bool {
        let len = 4 + 4 * objects.len();
        if !self.claim(len) {
            return false;
        }

        self.push([Self::descriptor(transmit, ENTRY_MESSAGE, len), sop]);
        self.push(header.to_le_bytes());
        for object in objects {
            self.push(object.to_le_bytes());
        }
        true
    }

    /// Move whole entries into `buf`, as long as they fit, returning the number of
    /// written bytes.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut written = 0;
        loop {
            let len = self.next_entry_len();
            if len == 0 || written + len > buf.len() {
                break;
            }
            for byte in &mut buf[written..written + len] {
                *byte = self.buffer.pop_front().unwrap_or_default();
            }
            written += len;
        }
        written
    }

    /// The number of logged bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether entries were dropped, clearing the flag.
    pub fn take_overflow(&mut self) -> bool {
        core::mem::take(&mut self.overflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_log_rejects_writes_when_full() {
        let mut log = StateLog::new();
        for i in 0..STATE_LOG_SIZE {
            assert!(log.write(i as u8, 1234));
        }
        assert!(log.is_full());
        assert!(!log.write(0xff, 1234));

        let first = log.read().unwrap();
        assert_eq!(first, StateLogEntry { state: 0, ms: 234, s: 1 });
        assert!(log.write(0xff, 1234));
    }

    #[test]
    fn state_log_export_records() {
        let mut log = StateLog::new();
        log.write(7, 65_432);
        log.write(8, 65_433);

        let mut buf = [0u8; 8];
        assert_eq!(log.export(&mut buf), 5);
        assert_eq!(&buf[..5], &[7, 0xb0, 0x01, 65, 0]);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn message_log_entries() {
        let mut log = MessageLog::new();
        assert!(log.write_token(true, Token::Attach));
        assert!(log.write_message(false, 0, 0x1042, &[0x1304_b0c8]));

        let mut buf = [0u8; 16];
        assert_eq!(log.read(&mut buf), 10);
        assert_eq!(&buf[..2], &[0x41, 0x01]);
        assert_eq!(&buf[2..10], &[0x87, 0x00, 0x42, 0x10, 0xc8, 0xb0, 0x04, 0x13]);
        assert!(log.is_empty());
    }

    #[test]
    fn message_log_drops_whole_entries() {
        let mut log = MessageLog::new();
        // 32 bytes each, four fit exactly.
        for _ in 0..4 {
            assert!(log.write_message(true, 0, 0x7161, &[0; 7]));
        }
        assert!(!log.take_overflow());

        assert!(log.write_token(false, Token::HardReset));
        assert!(log.take_overflow());
        assert_eq!(log.len(), 3 * 32 + 2);

        // Only whole entries are read.
        let mut buf = [0u8; 40];
        assert_eq!(log.read(&mut buf), 32);
        assert_eq!(buf[0], 0x80 | 0x40 | 31);
    }
}
