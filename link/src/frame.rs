//! Application-level framing of messages over HID reports.
//!
//! Every report starts with the HID report id, followed by a little-endian
//! 16-bit packet index, a one byte payload length and the payload, zero
//! padded to the report length:
//!
//! ```text
//! | report id | index (LE16) | length | data[length] | padding |
//! ```
//!
//! Messages sent under the data report id may span several packets numbered
//! from 1. A packet carrying less than [FrameFormat::max_packet_size] bytes
//! ends the message. Any other report id is a single packet with index 0.

use crate::error::FrameError;

pub const DATA_REPORT_ID: u8 = 0x02;
pub const DEFAULT_REPORT_LEN: usize = 64;
pub(crate) const HEADER_LEN: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameFormat {
    /// Report size in bytes, excluding the report id.
    pub report_len: usize,
    pub data_report_id: u8,
}

impl Default for FrameFormat {
    fn default() -> Self {
        FrameFormat {
            report_len: DEFAULT_REPORT_LEN,
            data_report_id: DATA_REPORT_ID,
        }
    }
}

impl FrameFormat {
    /// Largest payload a single packet carries.
    pub fn max_packet_size(&self) -> usize {
        self.report_len
            .saturating_sub(HEADER_LEN)
            .min(u8::MAX as usize)
    }

    pub fn is_data_report(&self, report_id: u8) -> bool {
        report_id == self.data_report_id
    }
}

/// A complete application message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub report_id: u8,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(report_id: u8, data: impl Into<Vec<u8>>) -> Self {
        Message {
            report_id,
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One report worth of a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub report_id: u8,
    pub index: u16,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw report including the leading report id. `data` must fit
    /// [FrameFormat::max_packet_size], as [packetize] guarantees.
    pub(crate) fn encode(&self, format: &FrameFormat) -> Vec<u8> {
        let mut report = vec![0u8; 1 + format.report_len];
        report[0] = self.report_id;
        report[1..3].copy_from_slice(&self.index.to_le_bytes());
        report[3] = self.data.len() as u8;
        report[1 + HEADER_LEN..1 + HEADER_LEN + self.data.len()]
            .copy_from_slice(&self.data);
        report
    }

    pub fn decode(
        raw: &[u8],
        format: &FrameFormat,
    ) -> Result<Self, FrameError> {
        if raw.len() < 1 + HEADER_LEN {
            return Err(FrameError::Truncated { len: raw.len() });
        }
        let length = raw[3] as usize;
        let max = format.max_packet_size();
        if length > max {
            return Err(FrameError::BadLength { length, max });
        }
        if raw.len() < 1 + HEADER_LEN + length {
            return Err(FrameError::Truncated { len: raw.len() });
        }
        Ok(Packet {
            report_id: raw[0],
            index: u16::from_le_bytes([raw[1], raw[2]]),
            data: raw[1 + HEADER_LEN..1 + HEADER_LEN + length].to_vec(),
        })
    }
}

/// Split a message into the packets sent for it, in order.
///
/// A data report whose length is a multiple of the packet size gets an
/// empty trailing packet so the receiver sees the short-packet terminator.
pub fn packetize(
    message: &Message,
    format: &FrameFormat,
) -> Result<Vec<Packet>, FrameError> {
    let max = format.max_packet_size();
    if max == 0 {
        return Err(FrameError::BadLength { length: 0, max });
    }

    if !format.is_data_report(message.report_id) {
        if message.len() > max {
            return Err(FrameError::TooLarge {
                len: message.len(),
            });
        }
        return Ok(vec![Packet {
            report_id: message.report_id,
            index: 0,
            data: message.data.clone(),
        }]);
    }

    let count = message.len() / max + 1;
    if count > u16::MAX as usize {
        return Err(FrameError::TooLarge {
            len: message.len(),
        });
    }
    let mut packets: Vec<Packet> = message
        .data
        .chunks(max)
        .enumerate()
        .map(|(i, chunk)| Packet {
            report_id: message.report_id,
            index: i as u16 + 1,
            data: chunk.to_vec(),
        })
        .collect();
    if message.len() % max == 0 {
        packets.push(Packet {
            report_id: message.report_id,
            index: packets.len() as u16 + 1,
            data: Vec::new(),
        });
    }
    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let format = FrameFormat::default();
        let report = Packet {
            report_id: DATA_REPORT_ID,
            index: 0x0102,
            data: vec![0xde, 0xad],
        }
        .encode(&format);
        assert_eq!(report.len(), 65);
        assert_eq!(&report[..6], &[0x02, 0x02, 0x01, 2, 0xde, 0xad]);
        assert!(report[6..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_decode_rejects_bad_reports() {
        let format = FrameFormat::default();
        assert!(matches!(
            Packet::decode(&[0x02, 1], &format),
            Err(FrameError::Truncated { len: 2 })
        ));
        assert!(matches!(
            Packet::decode(&[0x02, 1, 0, 62], &format),
            Err(FrameError::BadLength { length: 62, max: 61 })
        ));
        assert!(matches!(
            Packet::decode(&[0x02, 1, 0, 4, 0xaa], &format),
            Err(FrameError::Truncated { len: 5 })
        ));
    }

    #[test]
    fn test_packetize_data_report() {
        let format = FrameFormat::default();
        let message = Message::new(DATA_REPORT_ID, vec![7u8; 150]);
        let packets = packetize(&message, &format).unwrap();
        let sizes: Vec<(u16, usize)> =
            packets.iter().map(|p| (p.index, p.len())).collect();
        assert_eq!(sizes, vec![(1, 61), (2, 61), (3, 28)]);
    }

    #[test]
    fn test_packetize_exact_multiple_adds_terminator() {
        let format = FrameFormat::default();
        let message = Message::new(DATA_REPORT_ID, vec![1u8; 122]);
        let packets = packetize(&message, &format).unwrap();
        let sizes: Vec<(u16, usize)> =
            packets.iter().map(|p| (p.index, p.len())).collect();
        assert_eq!(sizes, vec![(1, 61), (2, 61), (3, 0)]);

        let empty = Message::new(DATA_REPORT_ID, Vec::new());
        let packets = packetize(&empty, &format).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].index, 1);
    }

    #[test]
    fn test_packetize_single_report() {
        let format = FrameFormat::default();
        let packets =
            packetize(&Message::new(0x05, vec![1, 2, 3]), &format).unwrap();
        assert_eq!(
            packets,
            vec![Packet {
                report_id: 0x05,
                index: 0,
                data: vec![1, 2, 3]
            }]
        );
        assert!(matches!(
            packetize(&Message::new(0x05, vec![0u8; 62]), &format),
            Err(FrameError::TooLarge { len: 62 })
        ));
    }
}
