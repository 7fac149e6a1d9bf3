use crate::frame::{Message, Packet};

/// Rebuilds one multi-packet data report at a time.
///
/// Packets must arrive with indices 1, 2, 3, ...; the first one shorter
/// than the maximum packet size completes the message.
pub struct Reassembler {
    max_packet_size: usize,
    pending: Option<Pending>,
}

struct Pending {
    report_id: u8,
    last_index: u16,
    data: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Reassembly {
    Complete(Message),
    Incomplete,
    /// Out-of-sequence packet; it and any partial message were dropped.
    Dropped { expected: u16, got: u16 },
}

impl Reassembler {
    pub fn new(max_packet_size: usize) -> Self {
        Reassembler {
            max_packet_size,
            pending: None,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.pending.is_some()
    }

    pub fn reset(&mut self) {
        self.pending = None;
    }

    pub fn push(&mut self, packet: Packet) -> Reassembly {
        let expected = self
            .pending
            .as_ref()
            .map_or(1, |p| p.last_index.wrapping_add(1));
        if packet.index != expected {
            self.pending = None;
            return Reassembly::Dropped {
                expected,
                got: packet.index,
            };
        }

        let last = packet.len() < self.max_packet_size;
        let pending = self.pending.get_or_insert_with(|| Pending {
            report_id: packet.report_id,
            last_index: 0,
            data: Vec::new(),
        });
        pending.last_index = packet.index;
        pending.data.extend_from_slice(&packet.data);

        if !last {
            return Reassembly::Incomplete;
        }
        match self.pending.take() {
            Some(done) => Reassembly::Complete(Message {
                report_id: done.report_id,
                data: done.data,
            }),
            None => Reassembly::Incomplete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 4;

    fn packet(index: u16, data: &[u8]) -> Packet {
        Packet {
            report_id: 0x02,
            index,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_three_packets() {
        let mut r = Reassembler::new(MAX);
        assert_eq!(r.push(packet(1, &[1, 2, 3, 4])), Reassembly::Incomplete);
        assert_eq!(r.push(packet(2, &[5, 6, 7, 8])), Reassembly::Incomplete);
        assert!(r.in_progress());
        match r.push(packet(3, &[9, 10])) {
            Reassembly::Complete(message) => {
                assert_eq!(message.report_id, 0x02);
                assert_eq!(message.data, (1..=10).collect::<Vec<u8>>());
                assert_eq!(message.len(), 4 + 4 + 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!r.in_progress());
    }

    #[test]
    fn test_gap_discards_buffer() {
        let mut r = Reassembler::new(MAX);
        assert_eq!(r.push(packet(1, &[1, 2, 3, 4])), Reassembly::Incomplete);
        assert_eq!(
            r.push(packet(3, &[9])),
            Reassembly::Dropped {
                expected: 2,
                got: 3
            }
        );
        assert!(!r.in_progress());

        // the next message starts cleanly
        assert_eq!(
            r.push(packet(1, &[7])),
            Reassembly::Complete(Message::new(0x02, vec![7]))
        );
    }

    #[test]
    fn test_must_start_at_one() {
        let mut r = Reassembler::new(MAX);
        assert_eq!(
            r.push(packet(2, &[1])),
            Reassembly::Dropped {
                expected: 1,
                got: 2
            }
        );
        assert_eq!(
            r.push(packet(0, &[1])),
            Reassembly::Dropped {
                expected: 1,
                got: 0
            }
        );
    }

    #[test]
    fn test_restart_mid_message_is_a_gap() {
        let mut r = Reassembler::new(MAX);
        r.push(packet(1, &[1, 2, 3, 4]));
        assert_eq!(
            r.push(packet(1, &[1, 2, 3, 4])),
            Reassembly::Dropped {
                expected: 2,
                got: 1
            }
        );
    }

    #[test]
    fn test_empty_terminator() {
        let mut r = Reassembler::new(MAX);
        r.push(packet(1, &[1, 2, 3, 4]));
        assert_eq!(
            r.push(packet(2, &[])),
            Reassembly::Complete(Message::new(0x02, vec![1, 2, 3, 4]))
        );
    }
}
