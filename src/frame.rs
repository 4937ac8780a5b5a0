//! Wire framing: control characters, select/poll request frames, and
//! DLE-stuffed data frames with a CRC-16 trailer.

use arrayvec::ArrayVec;

use crate::crc::Crc16;
use crate::types::Address;

pub(crate) const EOT: u8 = 0x04;
pub(crate) const ENQ: u8 = 0x05;
pub(crate) const NAK: u8 = 0x15;
pub(crate) const DLE: u8 = 0x10;
pub(crate) const STX: u8 = 0x02;
pub(crate) const ETX: u8 = 0x03;
pub(crate) const ETB: u8 = 0x17;
pub(crate) const ACK0: u8 = 0x30;
pub(crate) const ACK1: u8 = 0x31;
pub(crate) const PAD: u8 = 0xFF;

/// Fixed 3-byte command sequences. The trailing PAD bytes accommodate the
/// half-duplex line turnaround.
pub(crate) const ACK0_SEQ: [u8; 3] = [DLE, ACK0, PAD];
pub(crate) const ACK1_SEQ: [u8; 3] = [DLE, ACK1, PAD];
pub(crate) const NAK_SEQ: [u8; 3] = [NAK, PAD, PAD];
#[allow(dead_code)]
pub(crate) const ENQ_SEQ: [u8; 3] = [ENQ, PAD, PAD];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Select,
    Poll,
}

pub(crate) type RequestFrame = ArrayVec<u8, 4>;

/// Build a 4-byte select or poll request. The header byte carries the
/// station address in its low nibble and is doubled for error resilience.
pub(crate) fn request_frame(kind: RequestKind, address: Address) -> RequestFrame {
    let header = match kind {
        RequestKind::Select => address.select_header(),
        RequestKind::Poll => address.poll_header(),
    };
    let mut frame = RequestFrame::new();
    frame.push(EOT);
    frame.push(header);
    frame.push(header);
    frame.push(ENQ);
    frame
}

/// Frame a payload as `DLE STX <stuffed payload> DLE ETX CRC-hi CRC-lo PAD`.
/// The CRC covers the raw payload followed by the terminator, not the
/// stuffed bytes.
pub(crate) fn data_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() * 2 + 7);
    frame.push(DLE);
    frame.push(STX);
    for byte in payload {
        if *byte == DLE {
            frame.push(DLE);
        }
        frame.push(*byte);
    }
    frame.push(DLE);
    frame.push(ETX);

    let mut crc = Crc16::new();
    crc.init();
    crc.update_slice(payload);
    crc.update(ETX);
    let sum = crc.end();

    frame.push((sum >> 8) as u8);
    frame.push((sum & 0xFF) as u8);
    frame.push(PAD);
    frame
}
