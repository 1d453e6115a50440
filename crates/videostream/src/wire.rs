// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! On-wire message format: a one-byte kind tag followed by little-endian,
//! tightly packed, kind-specific fields. Each message is exactly one
//! `SOCK_SEQPACKET` datagram; there is no length prefix and no version
//! field. A host and client built from the same crate version interoperate;
//! nothing here is forward compatible.

use crate::Error;
use byteorder::{ByteOrder, LittleEndian};

const KIND_FRAME_ANNOUNCE: u8 = 0;
const KIND_LOCK_REQUEST: u8 = 1;
const KIND_LOCK_GRANT: u8 = 2;
const KIND_LOCK_DENY: u8 = 3;
const KIND_UNLOCK_REQUEST: u8 = 4;

/// Geometry and timing fields carried by a `FrameAnnounce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAnnounce {
    pub serial: i64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub fourcc: u32,
    pub size: u64,
    pub timestamp: i64,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub expires: i64,
}

/// Geometry/size echo carried by a `LockGrant`; the descriptor itself
/// travels as ancillary data alongside this message, not in the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockGrant {
    pub serial: i64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub size: u64,
}

/// Why the host refused a `LockRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NotFound,
    LimitExceeded,
}

impl DenyReason {
    fn to_byte(self) -> u8 {
        match self {
            DenyReason::NotFound => 0,
            DenyReason::LimitExceeded => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, Error> {
        match byte {
            0 => Ok(DenyReason::NotFound),
            1 => Ok(DenyReason::LimitExceeded),
            other => Err(Error::InvalidArgument(format!(
                "unknown deny reason byte {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    FrameAnnounce(FrameAnnounce),
    LockRequest { serial: i64 },
    LockGrant(LockGrant),
    LockDeny { serial: i64, reason: DenyReason },
    UnlockRequest { serial: i64 },
}

impl Message {
    /// Encodes this message into its canonical fixed-size byte layout.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::FrameAnnounce(a) => {
                let mut buf = vec![0u8; 73];
                buf[0] = KIND_FRAME_ANNOUNCE;
                LittleEndian::write_i64(&mut buf[1..9], a.serial);
                LittleEndian::write_u32(&mut buf[9..13], a.width);
                LittleEndian::write_u32(&mut buf[13..17], a.height);
                LittleEndian::write_u32(&mut buf[17..21], a.stride);
                LittleEndian::write_u32(&mut buf[21..25], a.fourcc);
                LittleEndian::write_u64(&mut buf[25..33], a.size);
                LittleEndian::write_i64(&mut buf[33..41], a.timestamp);
                LittleEndian::write_i64(&mut buf[41..49], a.pts);
                LittleEndian::write_i64(&mut buf[49..57], a.dts);
                LittleEndian::write_i64(&mut buf[57..65], a.duration);
                LittleEndian::write_i64(&mut buf[65..73], a.expires);
                buf
            }
            Message::LockRequest { serial } => {
                let mut buf = vec![0u8; 9];
                buf[0] = KIND_LOCK_REQUEST;
                LittleEndian::write_i64(&mut buf[1..9], *serial);
                buf
            }
            Message::LockGrant(g) => {
                let mut buf = vec![0u8; 29];
                buf[0] = KIND_LOCK_GRANT;
                LittleEndian::write_i64(&mut buf[1..9], g.serial);
                LittleEndian::write_u32(&mut buf[9..13], g.width);
                LittleEndian::write_u32(&mut buf[13..17], g.height);
                LittleEndian::write_u32(&mut buf[17..21], g.stride);
                LittleEndian::write_u64(&mut buf[21..29], g.size);
                buf
            }
            Message::LockDeny { serial, reason } => {
                let mut buf = vec![0u8; 10];
                buf[0] = KIND_LOCK_DENY;
                LittleEndian::write_i64(&mut buf[1..9], *serial);
                buf[9] = reason.to_byte();
                buf
            }
            Message::UnlockRequest { serial } => {
                let mut buf = vec![0u8; 9];
                buf[0] = KIND_UNLOCK_REQUEST;
                LittleEndian::write_i64(&mut buf[1..9], *serial);
                buf
            }
        }
    }

    /// Decodes a datagram received whole off the wire. A short or malformed
    /// buffer is a protocol violation, not something to be reassembled.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let kind = *buf
            .first()
            .ok_or_else(|| Error::InvalidArgument("empty message".into()))?;
        match kind {
            KIND_FRAME_ANNOUNCE => {
                expect_len(buf, 73)?;
                Ok(Message::FrameAnnounce(FrameAnnounce {
                    serial: LittleEndian::read_i64(&buf[1..9]),
                    width: LittleEndian::read_u32(&buf[9..13]),
                    height: LittleEndian::read_u32(&buf[13..17]),
                    stride: LittleEndian::read_u32(&buf[17..21]),
                    fourcc: LittleEndian::read_u32(&buf[21..25]),
                    size: LittleEndian::read_u64(&buf[25..33]),
                    timestamp: LittleEndian::read_i64(&buf[33..41]),
                    pts: LittleEndian::read_i64(&buf[41..49]),
                    dts: LittleEndian::read_i64(&buf[49..57]),
                    duration: LittleEndian::read_i64(&buf[57..65]),
                    expires: LittleEndian::read_i64(&buf[65..73]),
                }))
            }
            KIND_LOCK_REQUEST => {
                expect_len(buf, 9)?;
                Ok(Message::LockRequest {
                    serial: LittleEndian::read_i64(&buf[1..9]),
                })
            }
            KIND_LOCK_GRANT => {
                expect_len(buf, 29)?;
                Ok(Message::LockGrant(LockGrant {
                    serial: LittleEndian::read_i64(&buf[1..9]),
                    width: LittleEndian::read_u32(&buf[9..13]),
                    height: LittleEndian::read_u32(&buf[13..17]),
                    stride: LittleEndian::read_u32(&buf[17..21]),
                    size: LittleEndian::read_u64(&buf[21..29]),
                }))
            }
            KIND_LOCK_DENY => {
                expect_len(buf, 10)?;
                Ok(Message::LockDeny {
                    serial: LittleEndian::read_i64(&buf[1..9]),
                    reason: DenyReason::from_byte(buf[9])?,
                })
            }
            KIND_UNLOCK_REQUEST => {
                expect_len(buf, 9)?;
                Ok(Message::UnlockRequest {
                    serial: LittleEndian::read_i64(&buf[1..9]),
                })
            }
            other => Err(Error::InvalidArgument(format!(
                "unknown message kind byte {other}"
            ))),
        }
    }
}

fn expect_len(buf: &[u8], expected: usize) -> Result<(), Error> {
    if buf.len() != expected {
        return Err(Error::InvalidArgument(format!(
            "expected a {expected}-byte message, got {}",
            buf.len()
        )));
    }
    Ok(())
}
