//! Incremental parser for frames received from secondary stations.
//!
//! Incoming bytes accumulate in a [`Buffer`]; after every chunk the
//! dispatcher re-runs [`parse_reply`], which either yields a complete
//! [`ReplyToken`] or `NeedData`. Streaming combinators report
//! `Err::Incomplete` on a partial frame, which maps to `NeedData`; bytes
//! that cannot start a frame are skipped one at a time, mirroring the
//! idle-state resynchronization of the receive state machine.

use nom::branch::alt;
use nom::combinator::map;
use nom::error::{Error as NomError, ErrorKind};
use nom::number::streaming::be_u16;
use nom::Err::{self, Incomplete};
use nom::{IResult, Needed};

use crate::frame::{ACK0, ACK1, DLE, EOT, ETB, ETX, NAK, STX};

/// One complete frame from the wire, or a request for more input.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) enum ReplyToken {
    /// A command frame; the payload is the single significant byte
    /// (ACK0, ACK1, NAK or EOT).
    Command(u8),
    /// A data frame. `payload` is unstuffed; `terminator` (ETX or ETB) is
    /// kept because it joins the payload under the checksum.
    Data {
        payload: Vec<u8>,
        terminator: u8,
        crc: u16,
    },
    NeedData,
}

/// Try to parse one reply from `input`. Returns the number of consumed
/// bytes and the token. `NeedData` consumes any skipped junk but never
/// bytes of a partially received frame.
pub(crate) fn parse_reply(input: &[u8]) -> (usize, ReplyToken) {
    let mut buf = input;
    loop {
        match reply(buf) {
            Ok((rest, token)) => return (input.len() - rest.len(), token),
            Err(Incomplete(_)) => return (input.len() - buf.len(), ReplyToken::NeedData),
            Err(_) => {
                // Not a frame start; resynchronize one byte at a time.
                buf = &buf[1..];
                if buf.is_empty() {
                    return (input.len(), ReplyToken::NeedData);
                }
            }
        }
    }
}

fn reply(buf: &[u8]) -> IResult<&[u8], ReplyToken> {
    alt((bare_command, dle_frame))(buf)
}

/// NAK and EOT arrive without a DLE prefix.
fn bare_command(buf: &[u8]) -> IResult<&[u8], ReplyToken> {
    map(one_of_bytes(&[NAK, EOT]), ReplyToken::Command)(buf)
}

fn dle_frame(buf: &[u8]) -> IResult<&[u8], ReplyToken> {
    let (buf, _) = byte(DLE)(buf)?;
    alt((
        map(one_of_bytes(&[ACK0, ACK1]), ReplyToken::Command),
        data_body,
    ))(buf)
}

fn data_body(buf: &[u8]) -> IResult<&[u8], ReplyToken> {
    let (buf, _) = byte(STX)(buf)?;
    unstuff(buf)
}

/// Collect the payload, undoing DLE stuffing, until `DLE ETX`/`DLE ETB`,
/// then take the two raw checksum bytes.
fn unstuff(mut buf: &[u8]) -> IResult<&[u8], ReplyToken> {
    let mut payload = Vec::new();
    loop {
        match buf.split_first() {
            None => return Err(Incomplete(Needed::new(1))),
            Some((&DLE, rest)) => match rest.split_first() {
                None => return Err(Incomplete(Needed::new(1))),
                Some((&DLE, tail)) => {
                    payload.push(DLE);
                    buf = tail;
                }
                Some((&terminator, tail)) if terminator == ETX || terminator == ETB => {
                    let (tail, crc) = be_u16(tail)?;
                    return Ok((
                        tail,
                        ReplyToken::Data {
                            payload,
                            terminator,
                            crc,
                        },
                    ));
                }
                // DLE followed by anything else carries no data.
                Some((_, tail)) => buf = tail,
            },
            Some((&b, rest)) => {
                payload.push(b);
                buf = rest;
            }
        }
    }
}

fn byte(expected: u8) -> impl Fn(&[u8]) -> IResult<&[u8], u8> {
    move |buf: &[u8]| match buf.split_first() {
        None => Err(Incomplete(Needed::new(1))),
        Some((&b, rest)) if b == expected => Ok((rest, b)),
        Some(_) => Err(Err::Error(NomError::new(buf, ErrorKind::Char))),
    }
}

fn one_of_bytes(set: &'static [u8]) -> impl Fn(&[u8]) -> IResult<&[u8], u8> {
    move |buf: &[u8]| match buf.split_first() {
        None => Err(Incomplete(Needed::new(1))),
        Some((&b, rest)) if set.contains(&b) => Ok((rest, b)),
        Some(_) => Err(Err::Error(NomError::new(buf, ErrorKind::OneOf))),
    }
}

/// Receive-side accumulator: bytes are appended as they arrive from the
/// transport and consumed as frames complete.
#[derive(Debug)]
pub(crate) struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer {
            data: Vec::with_capacity(128),
            read_pos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.read_pos
    }

    pub fn consume(&mut self, len: usize) {
        debug_assert!(len <= self.len());
        self.read_pos += len;
    }

    pub fn write(&mut self, bytes: &[u8]) {
        if self.read_pos == self.data.len() {
            self.clear();
        }
        self.data.extend_from_slice(bytes);
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data[self.read_pos..]
    }
}
