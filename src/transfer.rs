// Per-transfer state machine for read requests.
//
// A transfer walks NEW -> NEGOTIATE -> SENDING -> DONE. Exactly one DATA
// packet is outstanding at any instant; the 16-bit wire counter is the low
// half of a monotonically increasing block index, so it wraps from 65535 to
// 0 (never back to 1) and files may exceed 65535 blocks.
//
// The machine itself owns no socket and never waits: each entry point
// returns a `Step` telling the driving loop what to do next. Packet loss is
// the driver's business only insofar as it must call `on_timeout` when the
// deadline passes.

use std::io::Read;
use std::time::Duration;

use crate::tftp::{
    self, ErrorCode, Mode, Packet, BLKSIZE_OPTION, TIMEOUT_OPTION, TSIZE_OPTION, UTIMEOUT_OPTION,
};

/// Retransmissions of an OACK before the transfer is abandoned.
const OACK_RETRY_LIMIT: u32 = 5;
/// Retransmissions of a DATA packet before the transfer is abandoned. The
/// timeout doubles with each one, capped at 2^8 times the negotiated base.
const DATA_RETRY_LIMIT: u32 = 8;

/// What the driving loop should do after feeding the machine.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Send this packet and wait for the next event.
    Send(Packet),
    /// A re-ACK of the previous block (the Pi bootloader's early-terminate
    /// quirk); do nothing, in particular do not retransmit.
    Duplicate,
    /// Not a packet this transfer cares about; keep waiting.
    Ignore,
    /// The final block was acknowledged; tear the transfer down.
    Done,
    /// Send this packet, then tear the transfer down.
    Fatal(Packet),
    /// The peer aborted (ERROR packet); tear down without replying.
    Terminated,
}

/// Option negotiation failed; the client gets ERROR(8).
#[derive(Debug)]
pub struct BadOptions(pub String);

impl std::fmt::Display for BadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "bad options: {}", self.0)
    }
}

impl std::error::Error for BadOptions {}

pub struct Transfer {
    source: Box<dyn Read + Send>,
    block_size: u16,
    base_timeout: Duration,
    timeout: Duration,
    retries: u32,
    /// Options to echo in the OACK; empty means no negotiation happened.
    reply_options: Vec<(String, String)>,
    negotiating: bool,
    sent_oack: bool,
    /// Monotonic index of the last DATA block handed to the driver; the
    /// wire counter is this value modulo 2^16.
    block: u64,
    last_payload: Vec<u8>,
    terminal: bool,
    acked_bytes: u64,
}

fn wire_counter(block: u64) -> u16 {
    (block & 0xFFFF) as u16
}

impl Transfer {
    /// Builds a transfer for *source* of *size* bytes (after any netascii
    /// transformation), negotiating *options* from the client's RRQ.
    pub fn new(
        source: Box<dyn Read + Send>,
        size: u64,
        options: &[(String, String)],
    ) -> Result<Transfer, BadOptions> {
        let mut block_size = tftp::DEF_BLKSIZE;
        let mut timeout = tftp::DEF_TIMEOUT;
        let mut saw_utimeout = false;
        let mut reply = Vec::new();

        for (name, value) in options {
            match name.as_str() {
                BLKSIZE_OPTION => {
                    let requested: u32 = value
                        .parse()
                        .map_err(|_| BadOptions(format!("unparseable blksize {value:?}")))?;
                    // Out-of-range requests are clamped and the clamped
                    // value echoed, rather than rejected.
                    block_size = requested
                        .clamp(u32::from(tftp::MIN_BLKSIZE), u32::from(tftp::MAX_BLKSIZE))
                        as u16;
                    reply.push((name.clone(), block_size.to_string()));
                }
                TSIZE_OPTION => {
                    reply.push((name.clone(), size.to_string()));
                }
                TIMEOUT_OPTION => {
                    let secs: u64 = value
                        .parse()
                        .map_err(|_| BadOptions(format!("unparseable timeout {value:?}")))?;
                    if !saw_utimeout {
                        timeout = Duration::from_secs(secs);
                    }
                    reply.push((name.clone(), value.clone()));
                }
                UTIMEOUT_OPTION => {
                    let micros: u64 = value
                        .parse()
                        .map_err(|_| BadOptions(format!("unparseable utimeout {value:?}")))?;
                    timeout = Duration::from_micros(micros);
                    saw_utimeout = true;
                    reply.push((name.clone(), value.clone()));
                }
                // Unknown options are silently dropped from the OACK.
                _ => (),
            }
        }
        if saw_utimeout {
            // utimeout supersedes timeout; acknowledging both would leave
            // the client unsure which one applies.
            reply.retain(|(name, _)| name != TIMEOUT_OPTION);
        }
        if timeout < tftp::MIN_TIMEOUT || timeout > tftp::MAX_TIMEOUT {
            return Err(BadOptions(format!("silly timeout {timeout:?}")));
        }

        Ok(Transfer {
            source,
            block_size,
            base_timeout: timeout,
            timeout,
            retries: 0,
            negotiating: false,
            sent_oack: false,
            reply_options: reply,
            block: 0,
            last_payload: Vec::new(),
            terminal: false,
            acked_bytes: 0,
        })
    }

    /// The current retransmission deadline interval.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    /// Bytes sent and acknowledged so far.
    pub fn transferred(&self) -> u64 {
        self.acked_bytes
    }

    /// Produces the first packet: an OACK if options were negotiated,
    /// otherwise DATA(1) directly.
    pub fn start(&mut self) -> Step {
        if self.reply_options.is_empty() {
            self.next_data()
        } else {
            self.negotiating = true;
            self.sent_oack = true;
            Step::Send(Packet::OptionsAck {
                options: self.reply_options.clone(),
            })
        }
    }

    pub fn on_packet(&mut self, packet: &Packet) -> Step {
        match packet {
            Packet::Ack { block } => self.on_ack(*block),
            Packet::Error { code, message } => {
                log::debug!("peer aborted transfer: {code:?} {message:?}");
                Step::Terminated
            }
            // A network-duplicated copy of the request that started this
            // transfer; the retransmission timer already covers the reply.
            Packet::ReadReq { .. } | Packet::WriteReq { .. } => Step::Ignore,
            _ => Step::Fatal(Packet::error(ErrorCode::IllegalOperation)),
        }
    }

    fn on_ack(&mut self, block: u16) -> Step {
        if self.negotiating {
            // Option negotiation is only complete on ACK(0); anything else
            // is a stray packet.
            if block == 0 {
                self.negotiating = false;
                self.reset_timer();
                self.next_data()
            } else {
                Step::Ignore
            }
        } else if self.block > 0 && block == wire_counter(self.block) {
            self.reset_timer();
            self.acked_bytes += self.last_payload.len() as u64;
            if self.terminal {
                Step::Done
            } else {
                self.next_data()
            }
        } else if self.is_duplicate_ack(block) {
            Step::Duplicate
        } else {
            Step::Ignore
        }
    }

    // A re-ACK of the block before the outstanding one. The Pi bootloader
    // fires these when it decides it has enough of a file; answering them
    // with a retransmit would stall both ends.
    fn is_duplicate_ack(&self, block: u16) -> bool {
        match self.block {
            0 => false,
            1 => self.sent_oack && block == 0,
            n => block == wire_counter(n - 1),
        }
    }

    pub fn on_timeout(&mut self) -> Step {
        self.retries += 1;
        if self.negotiating {
            if self.retries > OACK_RETRY_LIMIT {
                return Step::Fatal(Packet::error_with(ErrorCode::Undefined, "timeout"));
            }
            Step::Send(Packet::OptionsAck {
                options: self.reply_options.clone(),
            })
        } else {
            if self.retries > DATA_RETRY_LIMIT {
                return Step::Fatal(Packet::error_with(ErrorCode::Undefined, "timeout"));
            }
            self.timeout = (self.timeout * 2).min(self.base_timeout * 256);
            Step::Send(Packet::Data {
                block: wire_counter(self.block),
                data: self.last_payload.clone(),
            })
        }
    }

    fn reset_timer(&mut self) {
        self.retries = 0;
        self.timeout = self.base_timeout;
    }

    // Reads the next block and hands it to the driver. A block of exactly
    // block_size is never terminal: an exact-multiple file ends with an
    // empty DATA.
    fn next_data(&mut self) -> Step {
        let mut data = vec![0u8; usize::from(self.block_size)];
        let mut filled = 0;
        while filled < data.len() {
            match self.source.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    return Step::Fatal(Packet::error_with(
                        ErrorCode::Undefined,
                        format!("read failed: {e}"),
                    ))
                }
            }
        }
        data.truncate(filled);
        self.block += 1;
        self.terminal = filled < usize::from(self.block_size);
        self.last_payload = data.clone();
        Step::Send(Packet::Data {
            block: wire_counter(self.block),
            data,
        })
    }
}

/// Wraps *source* according to the transfer mode, returning the stream to
/// serve and its advertised length.
pub fn encode_source(
    source: Box<dyn Read + Send>,
    size: u64,
    mode: Mode,
    encoded_size: Option<u64>,
) -> (Box<dyn Read + Send>, u64) {
    match mode {
        Mode::Octet => (source, size),
        Mode::Netascii => (
            Box::new(crate::netascii::Encoder::new(source)),
            encoded_size.unwrap_or(size),
        ),
    }
}
