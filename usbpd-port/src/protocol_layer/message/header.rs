//! The 16-bit message header, present in every message.
//!
//! See [6.2.1.1].
use core::convert::TryFrom;

use byteorder::{ByteOrder, LittleEndian};
use proc_bitfield::bitfield;

use crate::protocol_layer::message::ParseError;
use crate::{DataRole, PowerRole};

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// Definition of the message header. Every message shall start with it.
    pub struct Header(pub u16): Debug, FromStorage, IntoStorage {
        /// Shall be set to zero to indicate a Control Message or Data Message
        /// and set to one to indicate an Extended Message.
        pub extended: bool @ 15,
        /// The number of 32 bit data objects that follow the header.
        pub num_objects: u8 [get usize] @ 12..=14,
        /// A rolling counter, maintained by the originator of the message.
        pub message_id: u8 @ 9..=11,
        /// Indicate the port's present power role (0 -> sink, 1 -> source).
        pub port_power_role: bool [get PowerRole, set PowerRole] @ 8,
        /// The specification revision.
        ///
        /// 00b - Revision 1.0 (deprecated)
        /// 01b - Revision 2.0
        /// 10b - Revision 3.x
        /// 11b - Reserved, shall not be used
        pub spec_revision: u8 [try_get SpecificationRevision, set SpecificationRevision] @ 6..=7,
        /// The port's data role (0 -> UFP, 1 -> DFP).
        pub port_data_role: bool [get DataRole, set DataRole] @ 5,
        /// The type of message being sent. See [6.2.1.1.8] for details
        pub message_type_raw: u8 @ 0..=4,
    }
}

impl Header {
    /// Create a header template with the given attributes.
    pub fn new_template(
        port_data_role: DataRole,
        port_power_role: PowerRole,
        spec_revision: SpecificationRevision,
    ) -> Self {
        Self(0)
            .with_port_data_role(port_data_role)
            .with_port_power_role(port_power_role)
            .with_spec_revision(spec_revision)
    }

    /// Create a new header that follows a template.
    ///
    /// The message ID is left at zero, the protocol layer assigns it on transmission.
    pub fn new(template: Self, message_type: MessageType, num_objects: u8) -> Self {
        let (raw, extended) = match message_type {
            MessageType::Control(x) => (x as u8, false),
            MessageType::Data(x) => (x as u8, false),
            MessageType::Extended(x) => (x as u8, true),
        };

        template
            .with_message_id(0)
            .with_message_type_raw(raw)
            .with_num_objects(num_objects)
            .with_extended(extended)
    }

    /// Create a new control message header.
    pub fn new_control(template: Self, message_type: ControlMessageType) -> Self {
        Self::new(template, MessageType::Control(message_type), 0)
    }

    /// Create a new data message header.
    pub fn new_data(template: Self, message_type: DataMessageType, num_objects: u8) -> Self {
        Self::new(template, MessageType::Data(message_type), num_objects)
    }

    /// Create a new extended message header.
    ///
    /// The object count is filled in per chunk.
    pub fn new_extended(template: Self, message_type: ExtendedMessageType) -> Self {
        Self::new(template, MessageType::Extended(message_type), 0)
    }

    /// Parse a header from its binary representation.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < 2 {
            return Err(ParseError::InvalidLength {
                expected: 2,
                found: buf.len(),
            });
        }

        let header = Header(LittleEndian::read_u16(buf));
        header.spec_revision()?;
        Ok(header)
    }

    /// Serialize the header to its binary representation.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u16(buf, self.0);
        2
    }

    /// Extract the message type that the header encodes.
    pub fn message_type(&self) -> MessageType {
        if self.extended() {
            MessageType::Extended(self.message_type_raw().into())
        } else if self.num_objects() == 0 {
            MessageType::Control(self.message_type_raw().into())
        } else {
            MessageType::Data(self.message_type_raw().into())
        }
    }

    /// Whether the header is a control message of the given type.
    pub fn is_control(&self, message_type: ControlMessageType) -> bool {
        self.message_type() == MessageType::Control(message_type)
    }

    /// Whether the header is a data message of the given type.
    pub fn is_data(&self, message_type: DataMessageType) -> bool {
        self.message_type() == MessageType::Data(message_type)
    }
}

/// Specification revisions.
///
/// Ordered, so that the lower of two revisions can be selected during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[allow(non_camel_case_types)]
pub enum SpecificationRevision {
    /// Version 1.0.
    R1_0,
    /// Version 2.0.
    R2_0,
    /// Version 3.x.
    R3_X,
}

impl TryFrom<u8> for SpecificationRevision {
    type Error = ParseError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0b00 => Ok(Self::R1_0),
            0b01 => Ok(Self::R2_0),
            0b10 => Ok(Self::R3_X),
            _ => Err(ParseError::UnsupportedSpecificationRevision(value)),
        }
    }
}

impl From<SpecificationRevision> for u8 {
    fn from(value: SpecificationRevision) -> Self {
        match value {
            SpecificationRevision::R1_0 => 0b00,
            SpecificationRevision::R2_0 => 0b01,
            SpecificationRevision::R3_X => 0b10,
        }
    }
}

/// The type of message that a header encodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageType {
    /// A control message, as defined in [6.3].
    Control(ControlMessageType),
    /// A data message, as defined in [6.4].
    Data(DataMessageType),
    /// An extended message, as defined in [6.5].
    Extended(ExtendedMessageType),
}

/// Declares a message type enum with its 5-bit codes, and the decoding from them.
///
/// Unknown codes decode to `Reserved`.
macro_rules! message_types {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal),* $(,)? }) => {
        $(#[$meta])*
        #[allow(missing_docs)]
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        #[cfg_attr(feature = "defmt", derive(defmt::Format))]
        pub enum $name {
            $($variant = $code,)*
            Reserved,
        }

        impl From<u8> for $name {
            fn from(code: u8) -> Self {
                match code {
                    $($code => Self::$variant,)*
                    _ => Self::Reserved,
                }
            }
        }
    };
}

message_types! {
    /// Types of control messages.
    ControlMessageType {
        GoodCRC = 0x01,
        GotoMin = 0x02,
        Accept = 0x03,
        Reject = 0x04,
        Ping = 0x05,
        PsRdy = 0x06,
        GetSourceCap = 0x07,
        GetSinkCap = 0x08,
        DrSwap = 0x09,
        PrSwap = 0x0a,
        VconnSwap = 0x0b,
        Wait = 0x0c,
        SoftReset = 0x0d,
        DataReset = 0x0e,
        DataResetComplete = 0x0f,
        NotSupported = 0x10,
        GetSourceCapExtended = 0x11,
        GetStatus = 0x12,
        FrSwap = 0x13,
        GetPpsStatus = 0x14,
        GetCountryCodes = 0x15,
        GetSinkCapExtended = 0x16,
        GetSourceInfo = 0x17,
        GetRevision = 0x18,
    }
}

message_types! {
    /// Types of data messages.
    DataMessageType {
        SourceCapabilities = 0x01,
        Request = 0x02,
        Bist = 0x03,
        SinkCapabilities = 0x04,
        BatteryStatus = 0x05,
        Alert = 0x06,
        GetCountryInfo = 0x07,
        EnterUsb = 0x08,
        SourceInfo = 0x0b,
        Revision = 0x0c,
        VendorDefined = 0x0f,
    }
}

message_types! {
    /// Types of extended messages.
    ExtendedMessageType {
        SourceCapabilitiesExtended = 0x01,
        Status = 0x02,
        GetBatteryCap = 0x03,
        GetBatteryStatus = 0x04,
        BatteryCapabilities = 0x05,
        GetManufacturerInfo = 0x06,
        ManufacturerInfo = 0x07,
        SecurityRequest = 0x08,
        SecurityResponse = 0x09,
        FirmwareUpdateRequest = 0x0a,
        FirmwareUpdateResponse = 0x0b,
        PpsStatus = 0x0c,
        CountryInfo = 0x0d,
        CountryCodes = 0x0e,
        SinkCapabilitiesExtended = 0x0f,
        VendorDefinedExtended = 0x1e,
    }
}
