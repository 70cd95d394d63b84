// TFTP wire format per RFC 1350 with the option extension of RFC 2347.
//
// Packet layouts (all integers big-endian):
//
// RRQ/WRQ: opcode(2) filename\0 mode\0 (optname\0 optvalue\0)*
// DATA:    opcode(2) block(2) payload
// ACK:     opcode(2) block(2)
// ERROR:   opcode(2) code(2) message\0
// OACK:    opcode(2) (optname\0 optvalue\0)*
//
// Filenames are nominally ASCII; since ASCII is a strict subset of UTF-8 and
// UTF-8 contains no NULs, we decode UTF-8 where valid and fall back to
// latin-1. Mode and option names are compared case-insensitively.

use std::error;
use std::fmt;
use std::time::Duration;

pub const BLKSIZE_OPTION: &str = "blksize";
pub const TSIZE_OPTION: &str = "tsize";
pub const TIMEOUT_OPTION: &str = "timeout";
pub const UTIMEOUT_OPTION: &str = "utimeout";

pub const MIN_BLKSIZE: u16 = 8;
pub const DEF_BLKSIZE: u16 = 512;
pub const MAX_BLKSIZE: u16 = 65464;

pub const MIN_TIMEOUT: Duration = Duration::from_millis(10);
pub const DEF_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(255);

/// Largest datagram the server will ever see or send: a full-size DATA
/// packet at the maximum negotiable block size.
pub const MAX_PACKET: usize = 4 + MAX_BLKSIZE as usize;

#[derive(Debug)]
pub enum PacketError {
    TooShort,
    BadOpcode(u16),
    UnsupportedMode(String),
    Malformed(&'static str),
}

impl error::Error for PacketError {}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketError::TooShort => write!(f, "packet too short"),
            PacketError::BadOpcode(op) => write!(f, "invalid packet opcode {op}"),
            PacketError::UnsupportedMode(m) => write!(f, "unsupported transfer mode {m:?}"),
            PacketError::Malformed(what) => write!(f, "malformed packet: {what}"),
        }
    }
}

/// TFTP error codes as carried in ERROR packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTid,
    FileExists,
    NoSuchUser,
    /// RFC 2347: the client should terminate because option negotiation
    /// failed.
    OptionNegotiation,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::OptionNegotiation => 8,
        }
    }

    pub fn from_u16(code: u16) -> ErrorCode {
        match code {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::OptionNegotiation,
            _ => ErrorCode::Undefined,
        }
    }
}

/// Transfer mode requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Octet,
    Netascii,
}

/// A decoded TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReadReq {
        filename: String,
        mode: Mode,
        options: Vec<(String, String)>,
    },
    WriteReq {
        filename: String,
        mode: Mode,
        options: Vec<(String, String)>,
    },
    Data {
        block: u16,
        data: Vec<u8>,
    },
    Ack {
        block: u16,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    OptionsAck {
        options: Vec<(String, String)>,
    },
}

fn u16_from(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Extracts a NUL-terminated byte string, returning it and the remainder
/// past the terminator.
fn cstr(buf: &[u8]) -> Result<(&[u8], &[u8]), PacketError> {
    match buf.iter().position(|&b| b == 0) {
        Some(i) => Ok((&buf[..i], &buf[i + 1..])),
        None => Err(PacketError::Malformed("unterminated string")),
    }
}

fn decode_text(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => raw.iter().map(|&b| char::from(b)).collect(),
    }
}

fn parse_options(mut rest: &[u8]) -> Vec<(String, String)> {
    let mut options = Vec::new();
    // Anything after the last complete name/value pair is ignored.
    while let Ok((name, after)) = cstr(rest) {
        if name.is_empty() {
            break;
        }
        let Ok((value, after)) = cstr(after) else {
            break;
        };
        options.push((
            decode_text(name).to_lowercase(),
            decode_text(value).to_lowercase(),
        ));
        rest = after;
    }
    options
}

fn parse_request(body: &[u8]) -> Result<(String, Mode, Vec<(String, String)>), PacketError> {
    let (filename, rest) = cstr(body)?;
    if filename.is_empty() {
        return Err(PacketError::Malformed("empty filename"));
    }
    let (mode, rest) = cstr(rest)?;
    let mode = match decode_text(mode).to_lowercase().as_str() {
        "octet" => Mode::Octet,
        "netascii" => Mode::Netascii,
        other => return Err(PacketError::UnsupportedMode(other.to_string())),
    };
    Ok((decode_text(filename), mode, parse_options(rest)))
}

impl Packet {
    pub fn parse(buf: &[u8]) -> Result<Packet, PacketError> {
        if buf.len() < 4 {
            return Err(PacketError::TooShort);
        }
        let body = &buf[2..];
        match u16_from(buf) {
            1 => {
                let (filename, mode, options) = parse_request(body)?;
                Ok(Packet::ReadReq {
                    filename,
                    mode,
                    options,
                })
            }
            2 => {
                let (filename, mode, options) = parse_request(body)?;
                Ok(Packet::WriteReq {
                    filename,
                    mode,
                    options,
                })
            }
            3 => Ok(Packet::Data {
                block: u16_from(body),
                data: body[2..].to_vec(),
            }),
            4 => Ok(Packet::Ack {
                block: u16_from(body),
            }),
            5 => {
                let raw = &body[2..];
                let message = match raw.iter().position(|&b| b == 0) {
                    Some(i) => decode_text(&raw[..i]),
                    None => decode_text(raw),
                };
                Ok(Packet::Error {
                    code: ErrorCode::from_u16(u16_from(body)),
                    message,
                })
            }
            6 => Ok(Packet::OptionsAck {
                options: parse_options(body),
            }),
            op => Err(PacketError::BadOpcode(op)),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        fn push_options(out: &mut Vec<u8>, options: &[(String, String)]) {
            for (name, value) in options {
                out.extend_from_slice(name.as_bytes());
                out.push(0);
                out.extend_from_slice(value.as_bytes());
                out.push(0);
            }
        }

        let mut out = Vec::new();
        match self {
            Packet::ReadReq {
                filename,
                mode,
                options,
            }
            | Packet::WriteReq {
                filename,
                mode,
                options,
            } => {
                let opcode: u16 = if matches!(self, Packet::ReadReq { .. }) {
                    1
                } else {
                    2
                };
                out.extend_from_slice(&opcode.to_be_bytes());
                out.extend_from_slice(filename.as_bytes());
                out.push(0);
                out.extend_from_slice(match mode {
                    Mode::Octet => b"octet".as_slice(),
                    Mode::Netascii => b"netascii".as_slice(),
                });
                out.push(0);
                push_options(&mut out, options);
            }
            Packet::Data { block, data } => {
                out.extend_from_slice(&3u16.to_be_bytes());
                out.extend_from_slice(&block.to_be_bytes());
                out.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                out.extend_from_slice(&4u16.to_be_bytes());
                out.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                out.extend_from_slice(&5u16.to_be_bytes());
                out.extend_from_slice(&code.as_u16().to_be_bytes());
                out.extend_from_slice(message.as_bytes());
                out.push(0);
            }
            Packet::OptionsAck { options } => {
                out.extend_from_slice(&6u16.to_be_bytes());
                push_options(&mut out, options);
            }
        }
        out
    }

    /// Convenience constructor for ERROR packets with the conventional
    /// message for *code*.
    pub fn error(code: ErrorCode) -> Packet {
        let message = match code {
            ErrorCode::Undefined => "Undefined error",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTid => "Unknown transfer ID",
            ErrorCode::FileExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
            ErrorCode::OptionNegotiation => "Option negotiation failed",
        };
        Packet::Error {
            code,
            message: message.to_string(),
        }
    }

    pub fn error_with(code: ErrorCode, message: impl Into<String>) -> Packet {
        Packet::Error {
            code,
            message: message.into(),
        }
    }
}
