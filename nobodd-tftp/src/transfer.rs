//! The per-transfer state machine: NEW -> NEGOTIATE -> SENDING -> DONE.
//!
//! Modeled as a single `step` function returning an explicit result variant
//! rather than exceptions -- see the source's `TransferDone` /
//! `AlreadyAcknowledged` / `BadOptions` control-flow exceptions, reworked
//! here as `StepResult::{Next,Duplicate,Done,Fatal}`.

use std::io::Read;
use std::time::{Duration, Instant};

use log::debug;

use crate::options::Options;
use crate::packet::{self, Packet};

const NEGOTIATE_MAX_RETRIES: u32 = 5;
const SENDING_MAX_RETRIES: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Negotiate,
    Sending,
    Done,
}

/// The outcome of feeding an event (an inbound ACK, a retransmit deadline)
/// into a transfer.
#[derive(Debug, PartialEq, Eq)]
pub enum StepResult {
    /// Send this packet on the transfer's ephemeral socket.
    Next(Vec<u8>),
    /// No action: a duplicate or out-of-sequence ACK.
    Duplicate,
    /// The transfer completed successfully; tear down the ephemeral socket.
    Done,
    /// Send this ERROR packet, then tear down the ephemeral socket.
    Fatal(Vec<u8>),
}

/// A single in-progress TFTP read transfer.
pub struct Transfer {
    reader: Box<dyn Read + Send>,
    options: Options,
    phase: Phase,
    /// Monotonically increasing block index (never wraps); 0 before the
    /// first DATA is sent.
    block_index: u64,
    /// The 16-bit wire block number of the last-sent DATA (meaningless
    /// during `Negotiate`).
    wire_block: u16,
    prev_wire_block: Option<u16>,
    last_packet: Vec<u8>,
    terminal_sent: bool,
    retry: u32,
    base_timeout: Duration,
    pub deadline: Instant,
}

impl Transfer {
    /// Start a transfer over `reader` (exactly `size` bytes, already
    /// netascii-transformed if applicable), negotiating `requested` options.
    /// Returns the transfer and the first packet to send: an OACK if any
    /// option was recognized, otherwise DATA(1) directly.
    pub fn start(
        reader: Box<dyn Read + Send>,
        size: u64,
        requested: &[(String, String)],
    ) -> (Transfer, Vec<u8>) {
        let (options, oack_pairs) = Options::negotiate(requested, size);
        let base_timeout = options.timeout;
        let mut transfer = Transfer {
            reader,
            options,
            phase: Phase::Negotiate,
            block_index: 0,
            wire_block: 0,
            prev_wire_block: None,
            last_packet: Vec::new(),
            terminal_sent: false,
            retry: 0,
            base_timeout,
            deadline: Instant::now() + base_timeout,
        };

        if oack_pairs.is_empty() {
            transfer.phase = Phase::Sending;
            let packet = transfer.advance();
            (transfer, packet)
        } else {
            let packet = Packet::Oack {
                options: oack_pairs,
            }
            .encode();
            transfer.last_packet = packet.clone();
            (transfer, packet)
        }
    }

    /// Read the next block and encode it as DATA, updating block-counter
    /// and retransmit state. Also used to (re)send the very first DATA.
    fn advance(&mut self) -> Vec<u8> {
        if self.block_index > 0 {
            self.prev_wire_block = Some(self.wire_block);
        }
        self.block_index += 1;
        self.wire_block = (self.block_index % 65536) as u16;

        let blksize = self.options.blksize as usize;
        let mut buf = vec![0u8; blksize];
        let mut filled = 0;
        while filled < blksize {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(_) => break,
            }
        }
        buf.truncate(filled);
        self.terminal_sent = filled < blksize;

        let packet = Packet::Data {
            block: self.wire_block,
            payload: buf,
        }
        .encode();
        self.last_packet = packet.clone();
        self.retry = 0;
        self.deadline = Instant::now() + self.base_timeout;
        packet
    }

    /// Feed an inbound ACK(block) to the state machine.
    pub fn on_ack(&mut self, block: u16) -> StepResult {
        match self.phase {
            Phase::Negotiate => {
                if block == 0 {
                    self.phase = Phase::Sending;
                    StepResult::Next(self.advance())
                } else {
                    StepResult::Duplicate
                }
            }
            Phase::Sending => {
                if block == self.wire_block {
                    if self.terminal_sent {
                        self.phase = Phase::Done;
                        StepResult::Done
                    } else {
                        StepResult::Next(self.advance())
                    }
                } else if Some(block) == self.prev_wire_block {
                    debug!("duplicate ACK({block}) for already-acknowledged block, ignoring");
                    StepResult::Duplicate
                } else {
                    debug!(
                        "stray ACK({block}) while awaiting ACK({}), ignoring",
                        self.wire_block
                    );
                    StepResult::Duplicate
                }
            }
            Phase::Done => StepResult::Done,
        }
    }

    /// The retransmission deadline elapsed with no ACK. Resends the last
    /// packet with a doubled timeout, up to a phase-specific retry budget;
    /// beyond that, abandons the transfer with `ERROR(0, "timeout")`.
    pub fn on_timeout(&mut self) -> StepResult {
        if matches!(self.phase, Phase::Done) {
            return StepResult::Done;
        }
        let max_retries = match self.phase {
            Phase::Negotiate => NEGOTIATE_MAX_RETRIES,
            Phase::Sending => SENDING_MAX_RETRIES,
            Phase::Done => unreachable!(),
        };
        self.retry += 1;
        if self.retry > max_retries {
            self.phase = Phase::Done;
            let packet = Packet::Error {
                code: packet::ERR_UNDEFINED,
                message: "timeout".to_string(),
            }
            .encode();
            return StepResult::Fatal(packet);
        }
        let multiplier = 1u32 << self.retry.min(8);
        self.deadline = Instant::now() + self.base_timeout * multiplier.min(256);
        StepResult::Next(self.last_packet.clone())
    }

    /// An ERROR packet arrived from the peer, or the server is shutting
    /// down: destroy the transfer with no reply.
    pub fn abort(&mut self) {
        self.phase = Phase::Done;
    }

    pub fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::io::Cursor;

    #[test]
    fn no_options_sends_data_one_directly() {
        let (transfer, first) = Transfer::start(Box::new(Cursor::new(b"hi\n".to_vec())), 3, &[]);
        let decoded = Packet::decode(&first).unwrap();
        assert_eq!(
            decoded,
            Packet::Data {
                block: 1,
                payload: b"hi\n".to_vec()
            }
        );
        assert_eq!(transfer.options().blksize, 512);
    }

    #[test]
    fn completes_minimal_transfer() {
        let (mut transfer, _first) = Transfer::start(Box::new(Cursor::new(b"hi\n".to_vec())), 3, &[]);
        let result = transfer.on_ack(1);
        assert_eq!(result, StepResult::Done);
    }

    #[test]
    fn blksize_negotiation_splits_into_two_blocks() {
        let data = vec![b'x'; 1500];
        let (mut transfer, first) = Transfer::start(
            Box::new(Cursor::new(data.clone())),
            1500,
            &[("blksize".to_string(), "1024".to_string())],
        );
        assert!(matches!(Packet::decode(&first).unwrap(), Packet::Oack { .. }));

        let StepResult::Next(data1) = transfer.on_ack(0) else {
            panic!("expected DATA(1)")
        };
        let Packet::Data { block, payload } = Packet::decode(&data1).unwrap() else {
            panic!("expected DATA")
        };
        assert_eq!(block, 1);
        assert_eq!(payload.len(), 1024);

        let StepResult::Next(data2) = transfer.on_ack(1) else {
            panic!("expected DATA(2)")
        };
        let Packet::Data { block, payload } = Packet::decode(&data2).unwrap() else {
            panic!("expected DATA")
        };
        assert_eq!(block, 2);
        assert_eq!(payload.len(), 476);

        assert_eq!(transfer.on_ack(2), StepResult::Done);
    }

    #[test]
    fn duplicate_ack_does_not_resend() {
        let (mut transfer, _first) =
            Transfer::start(Box::new(Cursor::new(vec![b'a'; 512])), 512, &[]);
        let StepResult::Next(_data2) = transfer.on_ack(1) else {
            panic!("expected DATA(2)")
        };
        // Re-ACK block 1 (the previous block): must be a no-op, not a
        // resend of DATA(2) or DATA(1).
        assert_eq!(transfer.on_ack(1), StepResult::Duplicate);
    }

    #[test]
    fn retransmit_then_final_timeout() {
        let (mut transfer, _first) = Transfer::start(Box::new(Cursor::new(b"hi".to_vec())), 2, &[]);
        for _ in 0..SENDING_MAX_RETRIES {
            assert!(matches!(transfer.on_timeout(), StepResult::Next(_)));
        }
        assert!(matches!(transfer.on_timeout(), StepResult::Fatal(_)));
        assert!(transfer.is_done());
    }

    #[test]
    fn block_counter_wraps_from_65535_to_zero_not_one() {
        let size: u64 = 65540 * 512;
        let data = vec![0u8; size as usize];
        let expected_hash = {
            let mut h = Sha256::new();
            h.update(&data);
            h.finalize()
        };

        let (mut transfer, first) = Transfer::start(Box::new(Cursor::new(data.clone())), size, &[]);
        let mut received = Vec::new();
        let Packet::Data { block, payload } = Packet::decode(&first).unwrap() else {
            panic!("expected DATA")
        };
        assert_eq!(block, 1);
        received.extend_from_slice(&payload);
        let mut last_block = block;

        loop {
            match transfer.on_ack(last_block) {
                StepResult::Next(raw) => {
                    let Packet::Data { block, payload } = Packet::decode(&raw).unwrap() else {
                        panic!("expected DATA")
                    };
                    if last_block == 65535 {
                        assert_eq!(block, 0, "must wrap to 0, never back to 1");
                    }
                    received.extend_from_slice(&payload);
                    last_block = block;
                }
                StepResult::Done => break,
                other => panic!("unexpected {other:?}"),
            }
        }

        let mut h = Sha256::new();
        h.update(&received);
        assert_eq!(h.finalize(), expected_hash);
    }
}
