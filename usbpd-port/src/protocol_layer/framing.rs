//! Token framing of the transceiver FIFOs.
//!
//! The transmit FIFO takes ordered sets and packet data as tokens. The receive FIFO
//! prefixes every packet with a token byte that encodes its SOP.
use heapless::Vec;

use super::Sop;
use super::message::header::Header;

/// Start of packet symbols.
pub const SYNC1: u8 = 0x12;
#[allow(missing_docs)]
pub const SYNC2: u8 = 0x13;
#[allow(missing_docs)]
pub const SYNC3: u8 = 0x1b;

/// Packed data follows. The low bits carry the number of bytes.
pub const PACKSYM: u8 = 0x80;
/// The transceiver inserts the CRC.
pub const JAM_CRC: u8 = 0xff;
/// End of packet.
pub const EOP: u8 = 0x14;
/// Turn the transmitter off after the packet.
pub const TXOFF: u8 = 0xfe;
/// Start transmission of the FIFO content.
pub const TXON: u8 = 0xa1;

/// The maximum packet payload, excluding the header.
pub const MAX_PAYLOAD_LEN: usize = 28;

/// The maximum length of a frame in the transmit FIFO.
pub const MAX_FRAME_LEN: usize = 4 + 1 + 2 + MAX_PAYLOAD_LEN + 4;

/// The FIFO image of one packet.
pub type Frame = Vec<u8, MAX_FRAME_LEN>;

/// The ordered set that starts a packet of the given SOP.
///
/// Debug SOPs are only ever received. They are sent as SOP.
pub const fn sop_tokens(sop: Sop) -> [u8; 4] {
    match sop {
        Sop::SopPrime => [SYNC1, SYNC1, SYNC3, SYNC3],
        Sop::SopDoublePrime => [SYNC1, SYNC3, SYNC1, SYNC3],
        Sop::Sop | Sop::SopPrimeDebug | Sop::SopDoublePrimeDebug => [SYNC1, SYNC1, SYNC1, SYNC2],
    }
}

/// Decode the SOP from the token byte that precedes a received packet.
pub fn decode_sop(token: u8) -> Option<Sop> {
    match token & 0xe0 {
        0xe0 => Some(Sop::Sop),
        0xc0 => Some(Sop::SopPrime),
        0xa0 => Some(Sop::SopDoublePrime),
        0x80 => Some(Sop::SopPrimeDebug),
        0x60 => Some(Sop::SopDoublePrimeDebug),
        _ => None,
    }
}

/// Encode a packet for the transmit FIFO.
///
/// `payload` must already be a whole number of data objects. The frame ends with the
/// transmitter switched off, transmission is started separately.
pub fn encode(sop: Sop, header: Header, payload: &[u8]) -> Frame {
    let mut frame = Frame::new();
    let mut push = |bytes: &[u8]| {
        // Capacity covers the largest packet.
        let _ = frame.extend_from_slice(bytes);
    };

    let mut raw_header = [0u8; 2];
    header.to_bytes(&mut raw_header);
    let payload = &payload[..payload.len().min(MAX_PAYLOAD_LEN)];

    push(&sop_tokens(sop));
    push(&[PACKSYM | (2 + payload.len()) as u8]);
    push(&raw_header);
    push(payload);
    push(&[JAM_CRC, EOP, TXOFF]);
    frame
}

/// Encode a packet that starts transmitting as soon as it was written.
pub fn encode_immediate(sop: Sop, header: Header, payload: &[u8]) -> Frame {
    let mut frame = encode(sop, header, payload);
    let _ = frame.push(TXON);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_layer::message::header::{ControlMessageType, SpecificationRevision};
    use crate::{DataRole, PowerRole};

    #[test]
    fn sop_token_decoding() {
        assert_eq!(decode_sop(0xe0), Some(Sop::Sop));
        assert_eq!(decode_sop(0xc3), Some(Sop::SopPrime));
        assert_eq!(decode_sop(0xa0), Some(Sop::SopDoublePrime));
        assert_eq!(decode_sop(0x80), Some(Sop::SopPrimeDebug));
        assert_eq!(decode_sop(0x60), Some(Sop::SopDoublePrimeDebug));
        assert_eq!(decode_sop(0x40), None);
        assert_eq!(decode_sop(0x00), None);
    }

    #[test]
    fn control_frame_layout() {
        let template = Header::new_template(DataRole::Dfp, PowerRole::Source, SpecificationRevision::R3_X);
        let header = Header::new_control(template, ControlMessageType::PsRdy).with_message_id(2);

        let frame = encode(Sop::Sop, header, &[]);
        assert_eq!(
            &frame[..],
            &[SYNC1, SYNC1, SYNC1, SYNC2, 0x82, 0xa6, 0x05, JAM_CRC, EOP, TXOFF]
        );

        let frame = encode_immediate(Sop::SopDoublePrime, header, &[]);
        assert_eq!(&frame[..4], &[SYNC1, SYNC3, SYNC1, SYNC3]);
        assert_eq!(frame.last(), Some(&TXON));
    }

    #[test]
    fn data_frame_length() {
        let template = Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R2_0);
        let header = Header::new(
            template,
            crate::protocol_layer::message::header::MessageType::Data(
                crate::protocol_layer::message::header::DataMessageType::Request,
            ),
            1,
        );
        let frame = encode(Sop::SopPrime, header, &[0xc8, 0xb0, 0x04, 0x13]);
        assert_eq!(frame[4], PACKSYM | 6);
        assert_eq!(&frame[7..11], &[0xc8, 0xb0, 0x04, 0x13]);
        assert_eq!(frame.len(), 14);
    }
}
