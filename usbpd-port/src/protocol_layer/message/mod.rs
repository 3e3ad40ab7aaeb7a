//! Definitions of message content.
pub mod data;
pub mod extended;
#[allow(missing_docs)]
pub mod header;

use header::{Header, MessageType};

/// Errors that can occur during message/header parsing.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// The input buffer has an invalid length.
    #[error("invalid input buffer length (expected {expected:?}, found {found:?})")]
    InvalidLength {
        /// The expected length.
        expected: usize,
        /// The actual length found.
        found: usize,
    },
    /// The specification revision field is not supported.
    #[error("unsupported specification revision `{0}`")]
    UnsupportedSpecificationRevision(u8),
    /// A first chunk arrived while another extended message was being assembled.
    #[error("chunk assembler is already in use")]
    ParserReuse,
    /// A chunk carried more data than allowed.
    #[error("chunk of {0} bytes exceeds the maximum of {1} bytes")]
    ChunkOverflow(usize, usize),
    /// Other parsing error with a message.
    #[error("other parse error: {0}")]
    Other(&'static str),
}

/// Payload of a USB PD message, if any.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Payload {
    /// Payload for a data message.
    Data(data::Data),
    /// Payload for an extended message.
    Extended(extended::Extended),
}

/// A USB PD message.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Message {
    /// The message header.
    pub header: Header,
    /// Optional payload for data and extended messages.
    pub payload: Option<Payload>,
}

impl Message {
    /// Create a new message from a message header.
    pub fn new(header: Header) -> Self {
        Self { header, payload: None }
    }

    /// Create a new message from a message header and payload data.
    ///
    /// The object count of the header follows the data.
    pub fn new_with_data(header: Header, data: data::Data) -> Self {
        Self {
            header: header.with_num_objects(data.num_objects()),
            payload: Some(Payload::Data(data)),
        }
    }

    /// Create a new extended message.
    pub fn new_with_extended(header: Header, extended: extended::Extended) -> Self {
        Self {
            header,
            payload: Some(Payload::Extended(extended)),
        }
    }

    /// The data payload, if any.
    pub fn data(&self) -> Option<&data::Data> {
        match &self.payload {
            Some(Payload::Data(data)) => Some(data),
            _ => None,
        }
    }

    /// The extended payload, if any.
    pub fn extended(&self) -> Option<&extended::Extended> {
        match &self.payload {
            Some(Payload::Extended(extended)) => Some(extended),
            _ => None,
        }
    }

    /// Parse a control or data message from a header and its payload.
    ///
    /// Extended messages are assembled by the protocol layer, so only their header is
    /// parsed here.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        let header = Header::from_bytes(data)?;
        let mut message = Self::new(header);
        let payload = &data[2..];

        if let MessageType::Data(message_type) = header.message_type() {
            let expected = 4 * header.num_objects();
            if payload.len() < expected {
                return Err(ParseError::InvalidLength {
                    expected: expected + 2,
                    found: data.len(),
                });
            }
            message.payload = Some(Payload::Data(data::Data::parse(
                message_type,
                payload,
                header.num_objects(),
            )));
        }

        Ok(message)
    }
}
