//! Byte framing and decoding for the file-control port.
//!
//! A request is written one byte at a time:
//!
//! ```text
//! <opcode>#<field1>#...#<fieldN>##
//! ```
//!
//! The last field of every request is the guest tag (for example `guest1/`),
//! which prefixes the guest's private file paths. Replies travel the other
//! way as 32-bit words, see [`Reply`].

use super::handle::FileHandle;
use crate::error::Error;
use std::collections::VecDeque;
use std::fmt;

pub const SEPARATOR: u8 = b'#';

/// Longest request the assembler buffers before giving up on the frame.
pub const MAX_FRAME_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Open,
    Close,
    Read,
    Write,
}

impl Opcode {
    pub fn from_field(field: &str) -> Option<Self> {
        match field {
            "0" => Some(Opcode::Open),
            "1" => Some(Opcode::Close),
            "2" => Some(Opcode::Read),
            "3" => Some(Opcode::Write),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Opcode::Open => '0',
            Opcode::Close => '1',
            Opcode::Read => '2',
            Opcode::Write => '3',
        }
    }
}

/// A complete request split on the separator, opcode not yet interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub fields: Vec<String>,
}

impl RawFrame {
    /// Serialize `fields` the way the guest library does. Fields must be
    /// non-empty and must not contain the separator.
    pub fn encode<S: AsRef<str>>(fields: &[S]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, f) in fields.iter().enumerate() {
            if i > 0 {
                out.push(SEPARATOR);
            }
            out.extend_from_slice(f.as_ref().as_bytes());
        }
        out.extend_from_slice(&[SEPARATOR, SEPARATOR]);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let body = bytes
            .strip_suffix(&[SEPARATOR, SEPARATOR])
            .ok_or_else(|| Error::Protocol("frame is not terminated".into()))?;
        let text = std::str::from_utf8(body)
            .map_err(|_| Error::Protocol("frame is not valid UTF-8".into()))?;
        Ok(RawFrame { fields: text.split(SEPARATOR as char).map(str::to_owned).collect() })
    }
}

/// Accumulates port writes until a request's `##` terminator arrives.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte. Returns `Some` once a frame is complete (or is
    /// discarded for exceeding [`MAX_FRAME_LEN`]); the buffer is reset either way.
    pub fn push(&mut self, byte: u8) -> Option<Result<RawFrame, Error>> {
        self.buf.push(byte);
        if self.buf.ends_with(&[SEPARATOR, SEPARATOR]) {
            let frame = RawFrame::from_bytes(&self.buf);
            self.buf.clear();
            return Some(frame);
        }
        if self.buf.len() >= MAX_FRAME_LEN {
            self.buf.clear();
            return Some(Err(Error::Protocol(format!(
                "frame exceeds {} bytes without terminator",
                MAX_FRAME_LEN
            ))));
        }
        None
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// A decoded file-port request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Open { name: String, mode: String, tag: String },
    Close { handle: FileHandle, tag: Option<String> },
    Read { addr: u64, elem_size: u32, count: u32, handle: FileHandle, tag: String },
    Write { addr: u64, elem_size: u32, count: u32, handle: FileHandle, tag: String },
}

/// A frame that could not be turned into an [`Operation`]. Keeps whatever was
/// recognised so the port can still answer in the shape the guest waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Malformed {
    pub opcode: Option<Opcode>,
    pub handle: Option<FileHandle>,
    pub reason: String,
}

impl fmt::Display for Malformed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode {
            Some(op) => write!(f, "opcode {}: {}", op.as_char(), self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

impl From<Malformed> for Error {
    fn from(m: Malformed) -> Self {
        Error::Protocol(m.to_string())
    }
}

impl Operation {
    pub fn opcode(&self) -> Opcode {
        match self {
            Operation::Open { .. } => Opcode::Open,
            Operation::Close { .. } => Opcode::Close,
            Operation::Read { .. } => Opcode::Read,
            Operation::Write { .. } => Opcode::Write,
        }
    }

    pub fn decode(frame: &RawFrame) -> Result<Self, Malformed> {
        let fields = &frame.fields;
        let opcode = fields.first().and_then(|f| Opcode::from_field(f));
        let Some(opcode) = opcode else {
            return Err(Malformed {
                opcode: None,
                handle: None,
                reason: format!("unknown opcode {:?}", fields.first().map(String::as_str).unwrap_or("")),
            });
        };
        let bad = |handle: Option<FileHandle>, reason: &str| Malformed {
            opcode: Some(opcode),
            handle,
            reason: reason.to_string(),
        };

        match opcode {
            Opcode::Open => match &fields[1..] {
                [name, mode, tag, ..] => Ok(Operation::Open {
                    name: name.clone(),
                    mode: mode.clone(),
                    tag: tag.clone(),
                }),
                _ => Err(bad(None, "open needs name, mode and guest tag")),
            },
            Opcode::Close => {
                let handle = fields
                    .get(1)
                    .and_then(|f| FileHandle::parse_hex(f))
                    .ok_or_else(|| bad(None, "close needs a hex handle"))?;
                Ok(Operation::Close { handle, tag: fields.get(2).cloned() })
            }
            Opcode::Read | Opcode::Write => {
                let handle = fields.get(4).and_then(|f| FileHandle::parse_hex(f));
                let (addr, elem_size, count, handle, tag) = match (
                    fields.get(1).and_then(|f| parse_pointer(f)),
                    fields.get(2).and_then(|f| parse_decimal(f)),
                    fields.get(3).and_then(|f| parse_decimal(f)),
                    handle,
                    fields.get(5),
                ) {
                    (Some(a), Some(s), Some(n), Some(h), Some(t)) => (a, s, n, h, t.clone()),
                    _ => {
                        return Err(bad(
                            handle,
                            "transfer needs pointer, size, count, handle and guest tag",
                        ))
                    }
                };
                Ok(if opcode == Opcode::Read {
                    Operation::Read { addr, elem_size, count, handle, tag }
                } else {
                    Operation::Write { addr, elem_size, count, handle, tag }
                })
            }
        }
    }

    /// Wire bytes exactly as the guest-side library emits them.
    pub fn encode(&self) -> Vec<u8> {
        let op = self.opcode().as_char().to_string();
        match self {
            Operation::Open { name, mode, tag } => RawFrame::encode(&[&op, name, mode, tag]),
            Operation::Close { handle, tag } => {
                let hex = handle.to_hex();
                match tag {
                    Some(tag) => RawFrame::encode(&[op.as_str(), hex.as_str(), tag.as_str()]),
                    None => RawFrame::encode(&[op.as_str(), hex.as_str()]),
                }
            }
            Operation::Read { addr, elem_size, count, handle, tag }
            | Operation::Write { addr, elem_size, count, handle, tag } => RawFrame::encode(&[
                op,
                format!("{:016X}", addr),
                elem_size.to_string(),
                count.to_string(),
                handle.to_hex(),
                tag.clone(),
            ]),
        }
    }
}

fn parse_decimal(field: &str) -> Option<u32> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

fn parse_pointer(field: &str) -> Option<u64> {
    FileHandle::parse_hex(field).map(FileHandle::raw)
}

/// Status reported by `fclose` on failure (C `EOF`).
pub const CLOSE_FAILED: i32 = -1;

/// What the host answers to one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// open: handle high word, handle low word.
    Handle(FileHandle),
    /// close: native status.
    Status(i32),
    /// read/write: element count, then the (possibly new) handle.
    Transfer { count: u32, handle: FileHandle },
}

impl Reply {
    /// Failure-shaped answer for a request that could not be decoded.
    pub fn failure(opcode: Opcode, handle: Option<FileHandle>) -> Self {
        match opcode {
            Opcode::Open => Reply::Handle(FileHandle::NULL),
            Opcode::Close => Reply::Status(CLOSE_FAILED),
            Opcode::Read | Opcode::Write => {
                Reply::Transfer { count: 0, handle: handle.unwrap_or(FileHandle::NULL) }
            }
        }
    }

    pub fn words(&self) -> Vec<u64> {
        match *self {
            Reply::Handle(h) => h.split().iter().map(|&w| u64::from(w)).collect(),
            Reply::Status(status) => vec![u64::from(status as u32)],
            Reply::Transfer { count, handle } => {
                let [hi, lo] = handle.split();
                vec![u64::from(count), u64::from(hi), u64::from(lo)]
            }
        }
    }
}

/// Words waiting to be read back by one guest, oldest first.
#[derive(Debug, Default)]
pub struct ReplyQueue {
    words: VecDeque<u64>,
}

impl ReplyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, reply: &Reply) {
        self.words.extend(reply.words());
    }

    pub fn pop(&mut self) -> Option<u64> {
        self.words.pop_front()
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Drop undelivered words. Returns how many were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.words.len();
        self.words.clear();
        n
    }

    /// Pop the next word into an `in` access buffer, little-endian and
    /// truncated to the access width. An empty queue reads as zero.
    pub fn fill(&mut self, data: &mut [u8]) -> bool {
        let word = self.pop();
        let bytes = word.unwrap_or(0).to_le_bytes();
        for (dst, src) in data.iter_mut().zip(bytes.iter().chain(std::iter::repeat(&0))) {
            *dst = *src;
        }
        word.is_some()
    }
}
