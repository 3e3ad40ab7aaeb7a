//! Definitions and implementations of data messages.
//!
//! See [6.4].
use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;

use crate::protocol_layer::message::header::DataMessageType;

pub mod alert;
pub mod bist;
#[allow(missing_docs)]
pub mod request;
#[allow(missing_docs)]
pub mod sink_capabilities;
#[allow(missing_docs)]
pub mod source_capabilities;

/// The maximum number of data objects in a message.
pub const MAX_DATA_OBJECTS: usize = 7;

/// Types of data messages.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Data {
    /// Source capabilities.
    SourceCapabilities(source_capabilities::SourceCapabilities),
    /// Sink capabilities.
    SinkCapabilities(sink_capabilities::SinkCapabilities),
    /// Request for a power level from the source.
    Request(request::RawDataObject),
    /// Built-in self test request.
    Bist(bist::BistDataObject),
    /// Alert from the port partner.
    Alert(alert::AlertDataObject),
    /// Request for the country information of a country code.
    GetCountryInfo(u16),
    /// Vendor defined objects, handled by the VDM engine.
    VendorDefined(Vec<u32, MAX_DATA_OBJECTS>),
    /// Any other data message, objects kept as is.
    Unknown(Vec<u32, MAX_DATA_OBJECTS>),
}

impl Data {
    /// Parse the payload of a data message.
    pub fn parse(message_type: DataMessageType, payload: &[u8], num_objects: usize) -> Self {
        let objects: Vec<u32, MAX_DATA_OBJECTS> = payload
            .chunks_exact(4)
            .take(num_objects)
            .map(LittleEndian::read_u32)
            .collect();
        let first = objects.first().copied().unwrap_or_default();

        match message_type {
            DataMessageType::SourceCapabilities => Data::SourceCapabilities(
                source_capabilities::SourceCapabilities::from_bytes(payload, num_objects),
            ),
            DataMessageType::SinkCapabilities => {
                Data::SinkCapabilities(sink_capabilities::SinkCapabilities::from_bytes(payload, num_objects))
            }
            DataMessageType::Request => Data::Request(request::RawDataObject(first)),
            DataMessageType::Bist => Data::Bist(bist::BistDataObject(first)),
            DataMessageType::Alert => Data::Alert(alert::AlertDataObject(first)),
            DataMessageType::GetCountryInfo => Data::GetCountryInfo((first >> 16) as u16),
            DataMessageType::VendorDefined => Data::VendorDefined(objects),
            _ => {
                trace!("Unhandled data message type {:?}", message_type);
                Data::Unknown(objects)
            }
        }
    }

    /// The number of data objects.
    pub fn num_objects(&self) -> u8 {
        match self {
            Self::SourceCapabilities(caps) => caps.num_objects(),
            Self::SinkCapabilities(caps) => caps.num_objects(),
            Self::Request(_) | Self::Bist(_) | Self::Alert(_) | Self::GetCountryInfo(_) => 1,
            Self::VendorDefined(objects) | Self::Unknown(objects) => objects.len() as u8,
        }
    }

    /// Serialize message data to a slice, returning the number of written bytes.
    pub fn to_bytes(&self, payload: &mut [u8]) -> usize {
        let single = |payload: &mut [u8], object: u32| {
            LittleEndian::write_u32(payload, object);
            4
        };

        match self {
            Self::SourceCapabilities(caps) => caps.to_bytes(payload),
            Self::SinkCapabilities(caps) => caps.to_bytes(payload),
            Self::Request(rdo) => single(payload, rdo.0),
            Self::Bist(bdo) => single(payload, bdo.0),
            Self::Alert(ado) => single(payload, ado.0),
            Self::GetCountryInfo(code) => single(payload, u32::from(*code) << 16),
            Self::VendorDefined(objects) | Self::Unknown(objects) => {
                for (object, chunk) in objects.iter().zip(payload.chunks_exact_mut(4)) {
                    LittleEndian::write_u32(chunk, *object);
                }
                objects.len() * 4
            }
        }
    }

    /// The message type that carries this data.
    ///
    /// Unknown data has no type of its own, and reports `None`.
    pub fn message_type(&self) -> Option<DataMessageType> {
        Some(match self {
            Self::SourceCapabilities(_) => DataMessageType::SourceCapabilities,
            Self::SinkCapabilities(_) => DataMessageType::SinkCapabilities,
            Self::Request(_) => DataMessageType::Request,
            Self::Bist(_) => DataMessageType::Bist,
            Self::Alert(_) => DataMessageType::Alert,
            Self::GetCountryInfo(_) => DataMessageType::GetCountryInfo,
            Self::VendorDefined(_) => DataMessageType::VendorDefined,
            Self::Unknown(_) => return None,
        })
    }
}
