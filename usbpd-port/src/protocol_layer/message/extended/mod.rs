//! Definitions and implementations of extended messages.
//!
//! See [6.5].
pub mod chunked;

use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;
use proc_bitfield::bitfield;

use self::chunked::MAX_EXTENDED_MSG_LEN;
use crate::protocol_layer::message::header::ExtendedMessageType;

/// The maximum number of country codes that fit into one message.
pub const MAX_COUNTRY_CODES: usize = (MAX_EXTENDED_MSG_LEN - 2) / 2;

/// Types of extended messages.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Extended {
    /// Status of a programmable power supply.
    PpsStatus(PpsStatus),
    /// Country codes for which country information is available.
    CountryCodes(Vec<u16, MAX_COUNTRY_CODES>),
    /// Country information for a country code.
    CountryInfo(CountryInfo),
    /// Any other extended message, data kept as is.
    Unknown(Vec<u8, MAX_EXTENDED_MSG_LEN>),
}

impl Extended {
    /// Parse the assembled data of an extended message.
    pub fn parse(message_type: ExtendedMessageType, data: &[u8]) -> Self {
        match message_type {
            ExtendedMessageType::PpsStatus if data.len() >= 4 => {
                Self::PpsStatus(PpsStatus(LittleEndian::read_u32(data)))
            }
            ExtendedMessageType::CountryCodes if data.len() >= 2 => {
                let count = usize::from(LittleEndian::read_u16(data));
                Self::CountryCodes(
                    data[2..]
                        .chunks_exact(2)
                        .take(count)
                        .map(LittleEndian::read_u16)
                        .collect(),
                )
            }
            ExtendedMessageType::CountryInfo if data.len() >= 4 => Self::CountryInfo(CountryInfo {
                country_code: LittleEndian::read_u16(data),
                info: data[4..].iter().copied().collect(),
            }),
            _ => Self::Unknown(data.iter().copied().collect()),
        }
    }

    /// The message type that carries this payload, `None` for unknown payloads.
    pub fn message_type(&self) -> Option<ExtendedMessageType> {
        match self {
            Self::PpsStatus(_) => Some(ExtendedMessageType::PpsStatus),
            Self::CountryCodes(_) => Some(ExtendedMessageType::CountryCodes),
            Self::CountryInfo(_) => Some(ExtendedMessageType::CountryInfo),
            Self::Unknown(_) => None,
        }
    }

    /// Size of the extended payload in bytes.
    pub fn data_size(&self) -> usize {
        match self {
            Self::PpsStatus(_) => 4,
            Self::CountryCodes(codes) => 2 + 2 * codes.len(),
            Self::CountryInfo(info) => 4 + info.info.len(),
            Self::Unknown(data) => data.len(),
        }
    }

    /// Serialize message data to a slice, returning the number of written bytes.
    pub fn to_bytes(&self, payload: &mut [u8]) -> usize {
        match self {
            Self::PpsStatus(status) => LittleEndian::write_u32(payload, status.0),
            Self::CountryCodes(codes) => {
                LittleEndian::write_u16(payload, codes.len() as u16);
                for (code, chunk) in codes.iter().zip(payload[2..].chunks_exact_mut(2)) {
                    LittleEndian::write_u16(chunk, *code);
                }
            }
            Self::CountryInfo(info) => {
                LittleEndian::write_u16(payload, info.country_code);
                payload[2..4].fill(0);
                payload[4..4 + info.info.len()].copy_from_slice(&info.info);
            }
            Self::Unknown(data) => payload[..data.len()].copy_from_slice(data),
        }
        self.data_size()
    }
}

bitfield! {
    /// PPS status data block, see [6.5.10].
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct PpsStatus(pub u32): Debug, FromStorage, IntoStorage {
        /// Output voltage in 20 mV units, 0xffff if not supported.
        pub raw_output_voltage: u16 @ 0..=15,
        /// Output current in 50 mA units, 0xff if not supported.
        pub raw_output_current: u8 @ 16..=23,
        /// Real time flags.
        pub real_time_flags: u8 @ 24..=31,
    }
}

/// Country information, see [6.5.12].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CountryInfo {
    /// The country code, as requested.
    pub country_code: u16,
    /// Country specific information.
    pub info: Vec<u8, { MAX_EXTENDED_MSG_LEN - 4 }>,
}

bitfield! {
    /// Extended message header.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ExtendedHeader(pub u16): Debug, FromStorage, IntoStorage {
        /// Payload size in bytes.
        pub data_size: u16 @ 0..=8,
        /// Request chunk flag.
        pub request_chunk: bool @ 10,
        /// Chunk number of this extended message.
        pub chunk_number: u8 @ 11..=14,
        /// Whether the message is chunked.
        pub chunked: bool @ 15,
    }
}

impl ExtendedHeader {
    /// Create a new, unchunked extended header for a given payload size.
    pub fn new(data_size: u16) -> Self {
        Self(0).with_data_size(data_size)
    }

    /// Serialize the extended header into the buffer, returning bytes written.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u16(buf, self.0);
        2
    }

    /// Parse an extended header from bytes.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        (buf.len() >= 2).then(|| Self(LittleEndian::read_u16(buf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn country_codes_layout() {
        let codes = Extended::CountryCodes(Vec::from_slice(&[0x5355, 0x4544]).unwrap());
        let mut buf = [0u8; 8];
        assert_eq!(codes.to_bytes(&mut buf), 6);
        assert_eq!(&buf[..6], &[2, 0, 0x55, 0x53, 0x44, 0x45]);
        assert_eq!(Extended::parse(ExtendedMessageType::CountryCodes, &buf[..6]), codes);
    }

    #[test]
    fn pps_status_layout() {
        let status = PpsStatus::default()
            .with_raw_output_voltage(250)
            .with_raw_output_current(0xff);
        let mut buf = [0u8; 4];
        Extended::PpsStatus(status).to_bytes(&mut buf);
        assert_eq!(buf, [0xfa, 0x00, 0xff, 0x00]);
    }

    #[test]
    fn extended_header_fields() {
        let header = ExtendedHeader::from_bytes(&[0x28, 0x88]).unwrap();
        assert!(header.chunked());
        assert_eq!(header.chunk_number(), 1);
        assert!(!header.request_chunk());
        assert_eq!(header.data_size(), 40);
        assert!(ExtendedHeader::from_bytes(&[0x28]).is_none());
    }
}
