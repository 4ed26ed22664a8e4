//! Demultiplexing of the engine's combined log stream.
//!
//! A container started without a TTY reports stdout and stderr as one stream of
//! frames. Each frame is an 8 byte header followed by its payload:
//!
//! ```text
//! [channel, 0, 0, 0, len_be[0], len_be[1], len_be[2], len_be[3]] payload...
//! ```
//!
//! Channel `1` is stdout and `2` is stderr. Channel `0` carries echoed stdin,
//! which the engine documents as being written to stdout.

use thiserror::Error;

pub const HEADER_LEN: usize = 8;

/// The logical stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdout,
    Stderr,
}

impl Channel {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 | 1 => Some(Channel::Stdout),
            2 => Some(Channel::Stderr),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogStreamError {
    #[error("log stream ends inside a frame header at byte {offset}")]
    TruncatedHeader { offset: usize },

    #[error("frame at byte {offset} declares {declared} payload bytes but only {available} remain")]
    TruncatedPayload {
        offset: usize,
        declared: usize,
        available: usize,
    },

    #[error("frame at byte {offset} names unknown channel {channel}")]
    UnknownChannel { offset: usize, channel: u8 },
}

/// Iterator over the `(channel, payload)` frames of a raw log buffer.
///
/// Yields an error once and then stops if the framing is broken.
pub struct Frames<'a> {
    raw: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Frames<'a> {
    pub fn new(raw: &'a [u8]) -> Self {
        Self {
            raw,
            offset: 0,
            failed: false,
        }
    }

    fn next_frame(&mut self) -> Result<(Channel, &'a [u8]), LogStreamError> {
        let raw = self.raw;
        let start = self.offset;
        let rest = &raw[start..];
        if rest.len() < HEADER_LEN {
            return Err(LogStreamError::TruncatedHeader { offset: start });
        }

        let channel = Channel::from_byte(rest[0]).ok_or(LogStreamError::UnknownChannel {
            offset: start,
            channel: rest[0],
        })?;
        let declared = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;

        let body = &rest[HEADER_LEN..];
        if body.len() < declared {
            return Err(LogStreamError::TruncatedPayload {
                offset: start,
                declared,
                available: body.len(),
            });
        }

        self.offset = start + HEADER_LEN + declared;
        Ok((channel, &body[..declared]))
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = Result<(Channel, &'a [u8]), LogStreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.raw.len() {
            return None;
        }

        let frame = self.next_frame();
        if frame.is_err() {
            self.failed = true;
        }
        Some(frame)
    }
}

/// Splits a raw combined log stream into `(stdout, stderr)`.
///
/// Byte order within each channel is preserved.
pub fn demultiplex(raw: &[u8]) -> Result<(Vec<u8>, Vec<u8>), LogStreamError> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    for frame in Frames::new(raw) {
        match frame? {
            (Channel::Stdout, payload) => stdout.extend_from_slice(payload),
            (Channel::Stderr, payload) => stderr.extend_from_slice(payload),
        }
    }

    Ok((stdout, stderr))
}

/// Encodes a single frame. Used by tests and fake engines.
pub fn encode_frame(channel: Channel, payload: &[u8]) -> Vec<u8> {
    let tag = match channel {
        Channel::Stdout => 1,
        Channel::Stderr => 2,
    };
    let len = (payload.len() as u32).to_be_bytes();

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&[tag, 0, 0, 0]);
    frame.extend_from_slice(&len);
    frame.extend_from_slice(payload);
    frame
}
