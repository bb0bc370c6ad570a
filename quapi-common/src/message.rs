// Copyright 2022-Present the QuAPI developers.
// SPDX-License-Identifier: MIT

//! Wire format between driver and preloaded runtime.
//!
//! Every message is a fixed 5-byte record: a 4-byte payload in little-endian
//! host order followed by a 1-byte type tag. The pipes are private to the
//! local machine, so the encoding is host-bound and not promised across
//! architectures. A HEADER record is followed on the wire by a trailing
//! block: three zero pad bytes, the formula dimensions, and the six file
//! descriptors of the three auxiliary pipe pairs.

use crate::error::{Error, Result};
use std::io::{Read, Write};
use std::os::unix::io::RawFd;

/// Length of the inner record.
pub const MSG_LEN: usize = 5;

/// Pad bytes between a HEADER record and its trailing block.
const HEADER_PAD: usize = 3;

/// Length of the HEADER trailing block (pad + 3 counts + 6 descriptors).
pub const HEADER_TRAILER_LEN: usize = HEADER_PAD + 3 * 4 + 6 * 4;

const TYPE_UNDEFINED: u8 = 0;
const TYPE_HEADER: u8 = 1;
const TYPE_QUANTIFIER: u8 = 2;
const TYPE_LITERAL: u8 = 3;
const TYPE_FORK: u8 = 4;
const TYPE_FORK_REPORT: u8 = 5;
const TYPE_STARTED: u8 = 6;
const TYPE_SOLVE: u8 = 7;
const TYPE_EXIT_CODE: u8 = 8;
const TYPE_DESTRUCTED: u8 = 9;

/// A typed message. HEADER is accompanied by a [`HeaderData`] block that is
/// sent adjacently on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Header { api_version: i32 },
    Quantifier { lit: i32 },
    Literal { lit: i32 },
    Fork { wait_for_exit_code_and_report: bool },
    ForkReport { solver_child_pid: i32 },
    Started { api_version: i32 },
    Solve,
    ExitCode { exit_code: i32 },
    Destructed,
}

impl Message {
    pub fn type_str(&self) -> &'static str {
        match self {
            Message::Header { .. } => "HEADER",
            Message::Quantifier { .. } => "QUANTIFIER",
            Message::Literal { .. } => "LITERAL",
            Message::Fork { .. } => "FORK",
            Message::ForkReport { .. } => "FORK REPORT",
            Message::Started { .. } => "STARTED",
            Message::Solve => "SOLVE",
            Message::ExitCode { .. } => "EXIT CODE",
            Message::Destructed => "DESTRUCTED",
        }
    }

    /// Messages that must be observed promptly by the peer force a flush of
    /// the buffered transport.
    pub fn requires_flush(&self) -> bool {
        matches!(
            self,
            Message::Header { .. } | Message::Fork { .. } | Message::Solve | Message::Started { .. }
        )
    }

    pub fn encode(&self) -> [u8; MSG_LEN] {
        let (payload, tag): (i32, u8) = match *self {
            Message::Header { api_version } => (api_version, TYPE_HEADER),
            Message::Quantifier { lit } => (lit, TYPE_QUANTIFIER),
            Message::Literal { lit } => (lit, TYPE_LITERAL),
            Message::Fork {
                wait_for_exit_code_and_report,
            } => (wait_for_exit_code_and_report as i32, TYPE_FORK),
            Message::ForkReport { solver_child_pid } => (solver_child_pid, TYPE_FORK_REPORT),
            Message::Started { api_version } => (api_version, TYPE_STARTED),
            Message::Solve => (0, TYPE_SOLVE),
            Message::ExitCode { exit_code } => (exit_code, TYPE_EXIT_CODE),
            Message::Destructed => (0, TYPE_DESTRUCTED),
        };
        let mut buf = [0u8; MSG_LEN];
        buf[..4].copy_from_slice(&payload.to_le_bytes());
        buf[4] = tag;
        buf
    }

    /// Decodes one record. An UNDEFINED or unknown tag is a protocol desync
    /// and must be treated as fatal by the receiving process.
    pub fn decode(buf: &[u8; MSG_LEN]) -> Result<Message> {
        let payload = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        match buf[4] {
            TYPE_HEADER => Ok(Message::Header {
                api_version: payload,
            }),
            TYPE_QUANTIFIER => Ok(Message::Quantifier { lit: payload }),
            TYPE_LITERAL => Ok(Message::Literal { lit: payload }),
            TYPE_FORK => Ok(Message::Fork {
                wait_for_exit_code_and_report: payload & 1 != 0,
            }),
            TYPE_FORK_REPORT => Ok(Message::ForkReport {
                solver_child_pid: payload,
            }),
            TYPE_STARTED => Ok(Message::Started {
                api_version: payload,
            }),
            TYPE_SOLVE => Ok(Message::Solve),
            TYPE_EXIT_CODE => Ok(Message::ExitCode { exit_code: payload }),
            TYPE_DESTRUCTED => Ok(Message::Destructed),
            tag @ TYPE_UNDEFINED => Err(Error::other(format!(
                "undefined message type {tag} on the wire"
            ))),
            tag => Err(Error::other(format!(
                "unknown message type {tag} on the wire"
            ))),
        }
    }
}

/// Formula dimensions and the descriptors of the three auxiliary pipes,
/// transmitted once after the HEADER record. `clauses` already includes the
/// `prefixdepth` reserved unit-clause slots for assumptions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderData {
    pub literals: i32,
    pub clauses: i32,
    pub prefixdepth: i32,
    /// Driver -> solver-child stdin.
    pub forked_child_read_pipe: [RawFd; 2],
    /// Solver-child stdout -> driver.
    pub forked_child_write_pipe: [RawFd; 2],
    /// Seed / solver child -> driver.
    pub message_to_parent_pipe: [RawFd; 2],
}

impl HeaderData {
    fn encode_trailer(&self) -> [u8; HEADER_TRAILER_LEN] {
        let mut buf = [0u8; HEADER_TRAILER_LEN];
        let fields = [
            self.literals,
            self.clauses,
            self.prefixdepth,
            self.forked_child_read_pipe[0],
            self.forked_child_read_pipe[1],
            self.forked_child_write_pipe[0],
            self.forked_child_write_pipe[1],
            self.message_to_parent_pipe[0],
            self.message_to_parent_pipe[1],
        ];
        let mut at = HEADER_PAD;
        for field in fields {
            buf[at..at + 4].copy_from_slice(&field.to_le_bytes());
            at += 4;
        }
        buf
    }

    fn decode_trailer(buf: &[u8; HEADER_TRAILER_LEN]) -> HeaderData {
        let mut at = HEADER_PAD;
        let mut next = || {
            let v = i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
            at += 4;
            v
        };
        HeaderData {
            literals: next(),
            clauses: next(),
            prefixdepth: next(),
            forked_child_read_pipe: [next(), next()],
            forked_child_write_pipe: [next(), next()],
            message_to_parent_pipe: [next(), next()],
        }
    }
}

/// Serializes `msg` into `sink`, appending the trailing block iff the
/// message is a HEADER. Flushes the sink for messages that must be observed
/// promptly (HEADER, FORK, SOLVE, STARTED).
pub fn write_msg<W: Write>(sink: &mut W, msg: &Message, header: Option<&HeaderData>) -> Result<()> {
    let mut buf = [0u8; MSG_LEN + HEADER_TRAILER_LEN];
    buf[..MSG_LEN].copy_from_slice(&msg.encode());
    let len = if let Message::Header { .. } = msg {
        let header = header.ok_or_else(|| {
            Error::Parameter("HEADER messages require the trailing header block".into())
        })?;
        buf[MSG_LEN..].copy_from_slice(&header.encode_trailer());
        buf.len()
    } else {
        MSG_LEN
    };

    log::trace!("write message of type {} with len {}", msg.type_str(), len);

    sink.write_all(&buf[..len]).map_err(Error::Write)?;
    if msg.requires_flush() {
        sink.flush().map_err(Error::Write)?;
    }
    Ok(())
}

/// Reads until `buf` is full or the stream ends. Returns the bytes read.
fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut at = 0;
    while at < buf.len() {
        match source.read(&mut buf[at..]) {
            Ok(0) => break,
            Ok(n) => at += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::other(format!("read failed: {e}"))),
        }
    }
    Ok(at)
}

/// Reads one message. Returns `None` on a clean end of stream; a stream that
/// ends in the middle of a record is an error. For HEADER messages the
/// trailing block is consumed and returned alongside.
pub fn read_msg<R: Read>(source: &mut R) -> Result<Option<(Message, Option<HeaderData>)>> {
    let mut record = [0u8; MSG_LEN];
    match read_full(source, &mut record)? {
        0 => return Ok(None),
        n if n < MSG_LEN => {
            return Err(Error::other(format!(
                "short read: got {n} of {MSG_LEN} message bytes"
            )))
        }
        _ => {}
    }
    let msg = Message::decode(&record)?;

    log::trace!("read message of type {}", msg.type_str());

    if let Message::Header { .. } = msg {
        let mut trailer = [0u8; HEADER_TRAILER_LEN];
        let n = read_full(source, &mut trailer)?;
        if n < HEADER_TRAILER_LEN {
            return Err(Error::other(format!(
                "short read: got {n} of {HEADER_TRAILER_LEN} header block bytes"
            )));
        }
        let header = HeaderData::decode_trailer(&trailer);
        log::trace!(
            "read header block: literals={}, clauses={}, prefixdepth={}",
            header.literals,
            header.clauses,
            header.prefixdepth
        );
        return Ok(Some((msg, Some(header))));
    }
    Ok(Some((msg, None)))
}
