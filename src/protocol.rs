// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire codec for the replication protocol.
//!
//! Everything on the wire is a length-prefixed frame: a `u32` big-endian
//! payload length followed by the payload. Control requests are UTF-8
//! command text in a single frame; control responses and stream messages are
//! discriminated by their leading byte. All 64-bit integers are big-endian,
//! high word first.
//!
//! # Control responses
//!
//! | Tag | Meaning |
//! |-----|---------|
//! | `T` | Tuple set: `u16` row count, `u16` field count, then `u16` length + text per field |
//! | `W` | Duplex-stream acknowledgment: the connection switches to stream mode |
//! | `E` | Error: `u16` length + code, `u16` length + message |
//!
//! # Stream messages (after `W`)
//!
//! | Tag | Meaning |
//! |-----|---------|
//! | `w` | Change data: 24-byte header (start, end, send time) + opaque payload |
//! | `k` | Keepalive, ignored |
//! | `c` | End of stream, clean termination |
//!
//! The change payload's first byte is itself an action tag consumed by
//! [`crate::apply::Change::parse`]. Client-to-server traffic in stream mode
//! is the fixed-length feedback frame (tag `r` + three positions + send
//! time + reply-requested flag, [`FEEDBACK_FRAME_LEN`] bytes).
//!
//! This module is pure: no I/O, no connection state. [`crate::link`] moves
//! the bytes.

use crate::error::{ApplyError, Result};
use bytes::{Buf, BufMut, BytesMut};

/// A point in the remote log; the unit of replication progress.
pub type StreamPosition = u64;

/// Position value meaning "nothing received/acknowledged yet".
pub const INVALID_POSITION: StreamPosition = 0;

/// Stream message tag: change data.
pub const MSG_CHANGE: u8 = b'w';
/// Stream message tag: keepalive (ignored by design).
pub const MSG_KEEPALIVE: u8 = b'k';
/// Stream message tag: clean end of stream.
pub const MSG_STREAM_END: u8 = b'c';
/// Client-to-server tag: feedback (progress acknowledgment).
pub const MSG_FEEDBACK: u8 = b'r';

/// Control response tag: tuple set.
pub const RESP_TUPLES: u8 = b'T';
/// Control response tag: duplex-stream acknowledgment.
pub const RESP_STREAM_ACK: u8 = b'W';
/// Control response tag: remote error.
pub const RESP_ERROR: u8 = b'E';

/// Identification request command text.
pub const IDENTIFY_SYSTEM: &str = "IDENTIFY_SYSTEM";

/// Change-data header length: start + end + send time, 8 bytes each.
pub const CHANGE_HEADER_LEN: usize = 24;

/// Feedback frame length: tag + 3 positions + send time + flag.
pub const FEEDBACK_FRAME_LEN: usize = 1 + 8 + 8 + 8 + 8 + 1;

/// Upper bound on a single frame payload. Anything larger is treated as a
/// corrupt length prefix rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Append one length-prefixed frame to `buf`.
pub fn write_frame(buf: &mut BytesMut, payload: &[u8]) {
    buf.reserve(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

/// Pop the next complete frame payload off `buf`, if one is buffered.
///
/// Returns `Ok(None)` when the buffer holds only a partial frame. A length
/// prefix above [`MAX_FRAME_LEN`] is a protocol error.
pub fn take_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ApplyError::Protocol(format!(
            "frame length {} exceeds maximum {}",
            len, MAX_FRAME_LEN
        )));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    let payload = buf.split_to(len).to_vec();
    Ok(Some(payload))
}

/// Header preceding every change-data payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeHeader {
    /// Position where this change starts in the remote log.
    pub start: StreamPosition,
    /// Position of the end of the described log range.
    pub end: StreamPosition,
    /// Remote send time, microseconds since the Unix epoch.
    pub send_time_micros: i64,
}

impl ChangeHeader {
    /// Parse a header from the first [`CHANGE_HEADER_LEN`] bytes of `buf`.
    pub fn parse(buf: &[u8]) -> Result<ChangeHeader> {
        if buf.len() < CHANGE_HEADER_LEN {
            return Err(ApplyError::Protocol(format!(
                "change header truncated: got {} bytes, need {}",
                buf.len(),
                CHANGE_HEADER_LEN
            )));
        }
        Ok(ChangeHeader {
            start: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            end: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            send_time_micros: i64::from_be_bytes(buf[16..24].try_into().unwrap()),
        })
    }

    /// Encode the header into its 24-byte wire form.
    pub fn encode(&self) -> [u8; CHANGE_HEADER_LEN] {
        let mut out = [0u8; CHANGE_HEADER_LEN];
        out[0..8].copy_from_slice(&self.start.to_be_bytes());
        out[8..16].copy_from_slice(&self.end.to_be_bytes());
        out[16..24].copy_from_slice(&self.send_time_micros.to_be_bytes());
        out
    }
}

/// One decoded message off the duplex stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage<'a> {
    /// Change data: parsed header plus the opaque change payload.
    Change {
        header: ChangeHeader,
        payload: &'a [u8],
    },
    /// Any other message tag; ignored by design, never an error.
    Other(u8),
}

impl<'a> StreamMessage<'a> {
    /// Parse one stream frame payload.
    ///
    /// Only the change-data tag is interpreted; every other tag comes back
    /// as [`StreamMessage::Other`] so the run loop can skip it.
    pub fn parse(frame: &'a [u8]) -> Result<StreamMessage<'a>> {
        let (&tag, rest) = frame
            .split_first()
            .ok_or_else(|| ApplyError::Protocol("empty stream message".to_string()))?;
        if tag != MSG_CHANGE {
            return Ok(StreamMessage::Other(tag));
        }
        let header = ChangeHeader::parse(rest)?;
        Ok(StreamMessage::Change {
            header,
            payload: &rest[CHANGE_HEADER_LEN..],
        })
    }
}

/// Progress acknowledgment sent back upstream.
///
/// The wire frame carries three positions (write, flush, apply) that are all
/// set to the same value; no separate durability granularity is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackFrame {
    /// Highest position received, reported as write, flush and apply alike.
    pub position: StreamPosition,
    /// Send time, microseconds since the Unix epoch.
    pub send_time_micros: i64,
    /// Whether the remote should answer with a keepalive.
    pub reply_requested: bool,
}

impl FeedbackFrame {
    /// Encode into the fixed 27-byte wire form.
    pub fn encode(&self) -> [u8; FEEDBACK_FRAME_LEN] {
        let mut out = [0u8; FEEDBACK_FRAME_LEN];
        out[0] = MSG_FEEDBACK;
        out[1..9].copy_from_slice(&self.position.to_be_bytes()); // write
        out[9..17].copy_from_slice(&self.position.to_be_bytes()); // flush
        out[17..25].copy_from_slice(&self.position.to_be_bytes()); // apply
        out[25..33].copy_from_slice(&self.send_time_micros.to_be_bytes());
        out[33] = self.reply_requested as u8;
        out
    }

    /// Decode a feedback frame, verifying shape and tag.
    pub fn decode(frame: &[u8]) -> Result<FeedbackFrame> {
        if frame.len() != FEEDBACK_FRAME_LEN {
            return Err(ApplyError::Protocol(format!(
                "feedback frame has {} bytes, expected {}",
                frame.len(),
                FEEDBACK_FRAME_LEN
            )));
        }
        if frame[0] != MSG_FEEDBACK {
            return Err(ApplyError::Protocol(format!(
                "feedback frame has tag {:#04x}, expected {:#04x}",
                frame[0], MSG_FEEDBACK
            )));
        }
        let write = u64::from_be_bytes(frame[1..9].try_into().unwrap());
        let flush = u64::from_be_bytes(frame[9..17].try_into().unwrap());
        let apply = u64::from_be_bytes(frame[17..25].try_into().unwrap());
        if write != flush || flush != apply {
            return Err(ApplyError::Protocol(
                "feedback frame positions diverge".to_string(),
            ));
        }
        Ok(FeedbackFrame {
            position: write,
            send_time_micros: i64::from_be_bytes(frame[25..33].try_into().unwrap()),
            reply_requested: frame[33] != 0,
        })
    }
}

/// A decoded control response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    /// A tuple set: rows of textual fields.
    Tuples(Vec<Vec<String>>),
    /// Duplex-stream acknowledgment; stream mode begins.
    StreamAck,
    /// Remote error with its error code and message.
    Error { code: String, message: String },
}

impl ControlResponse {
    /// Decode a control response frame payload.
    pub fn decode(frame: &[u8]) -> Result<ControlResponse> {
        let (&tag, mut rest) = frame
            .split_first()
            .ok_or_else(|| ApplyError::Protocol("empty control response".to_string()))?;
        match tag {
            RESP_STREAM_ACK => Ok(ControlResponse::StreamAck),
            RESP_TUPLES => {
                let nrows = get_u16(&mut rest)? as usize;
                let nfields = get_u16(&mut rest)? as usize;
                let mut rows = Vec::with_capacity(nrows);
                for _ in 0..nrows {
                    let mut row = Vec::with_capacity(nfields);
                    for _ in 0..nfields {
                        row.push(get_text(&mut rest)?);
                    }
                    rows.push(row);
                }
                Ok(ControlResponse::Tuples(rows))
            }
            RESP_ERROR => {
                let code = get_text(&mut rest)?;
                let message = get_text(&mut rest)?;
                Ok(ControlResponse::Error { code, message })
            }
            other => Err(ApplyError::Protocol(format!(
                "unknown control response tag {:#04x}",
                other
            ))),
        }
    }

    /// Encode into a frame payload. The inverse of [`decode`](Self::decode).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            ControlResponse::StreamAck => out.push(RESP_STREAM_ACK),
            ControlResponse::Tuples(rows) => {
                out.push(RESP_TUPLES);
                out.extend_from_slice(&(rows.len() as u16).to_be_bytes());
                let nfields = rows.first().map_or(0, |r| r.len());
                out.extend_from_slice(&(nfields as u16).to_be_bytes());
                for row in rows {
                    for field in row {
                        put_text(&mut out, field);
                    }
                }
            }
            ControlResponse::Error { code, message } => {
                out.push(RESP_ERROR);
                put_text(&mut out, code);
                put_text(&mut out, message);
            }
        }
        out
    }
}

fn get_u16(buf: &mut &[u8]) -> Result<u16> {
    if buf.len() < 2 {
        return Err(ApplyError::Protocol(
            "truncated control response".to_string(),
        ));
    }
    let v = u16::from_be_bytes([buf[0], buf[1]]);
    *buf = &buf[2..];
    Ok(v)
}

fn get_text(buf: &mut &[u8]) -> Result<String> {
    let len = get_u16(buf)? as usize;
    if buf.len() < len {
        return Err(ApplyError::Protocol(
            "truncated control response".to_string(),
        ));
    }
    let (text, rest) = buf.split_at(len);
    *buf = rest;
    String::from_utf8(text.to_vec())
        .map_err(|e| ApplyError::Protocol(format!("control response field is not UTF-8: {}", e)))
}

fn put_text(out: &mut Vec<u8>, text: &str) {
    out.extend_from_slice(&(text.len() as u16).to_be_bytes());
    out.extend_from_slice(text.as_bytes());
}
