//! Framing codec for the drone link protocol.
//!
//! Every datagram carries one frame:
//!
//! ```text
//! +-------+--------+---------------------+----------------+---------+
//! | magic | opcode | session id (u32 BE) | length (u16 BE)| payload |
//! +-------+--------+---------------------+----------------+---------+
//!    1        1              4                   2           0..n
//! ```
//!
//! The magic byte doubles as the protocol version; session id 0 means
//! "unassigned" and is only valid in a client's initial connect frame.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAGIC: u8 = 0xD1;
pub const HEADER_LEN: usize = 8;
pub const MAX_PAYLOAD: usize = 16 * 1024;

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("bad magic byte: {0:#04x}")]
    BadMagic(u8),
    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),
    #[error("payload length mismatch: header says {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("payload exceeds {MAX_PAYLOAD} bytes")]
    Oversized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// JSON connect/heartbeat exchange.
    Status = 0x01,
    /// Raw MAVLink bytes bound to the frame's session.
    MavlinkBin = 0x02,
    /// JSON SSH-proxy endpoint announcement.
    Terminal = 0x03,
}

impl Opcode {
    fn from_byte(b: u8) -> Result<Self, CodecError> {
        match b {
            0x01 => Ok(Opcode::Status),
            0x02 => Ok(Opcode::MavlinkBin),
            0x03 => Ok(Opcode::Terminal),
            other => Err(CodecError::UnknownOpcode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub op: Opcode,
    pub session: u32,
    pub payload: Vec<u8>,
}

pub fn encode(op: Opcode, session: u32, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(CodecError::Oversized);
    }
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(MAGIC);
    buf.push(op as u8);
    buf.extend_from_slice(&session.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::TooShort(bytes.len()));
    }
    if bytes[0] != MAGIC {
        return Err(CodecError::BadMagic(bytes[0]));
    }
    let op = Opcode::from_byte(bytes[1])?;
    let session = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    let declared = u16::from_be_bytes([bytes[6], bytes[7]]) as usize;
    let actual = bytes.len() - HEADER_LEN;
    if declared != actual {
        return Err(CodecError::LengthMismatch { declared, actual });
    }
    Ok(Frame {
        op,
        session,
        payload: bytes[HEADER_LEN..].to_vec(),
    })
}

/// STATUS payload sent by the drone. `op` selects connect vs heartbeat.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusMsg {
    pub op: String,
    #[serde(default, rename = "serialId")]
    pub serial_id: String,
    #[serde(default, rename = "simId")]
    pub sim_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

/// TERMINAL payload: a transient SSH proxy the drone opened for this session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminalInfo {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_opcodes() {
        for op in [Opcode::Status, Opcode::MavlinkBin, Opcode::Terminal] {
            for sid in [0u32, 1, 77, u32::MAX] {
                let payload = b"{\"op\":\"status\"}".to_vec();
                let bytes = encode(op, sid, &payload).unwrap();
                let frame = decode(&bytes).unwrap();
                assert_eq!(frame.op, op);
                assert_eq!(frame.session, sid);
                assert_eq!(frame.payload, payload);
            }
        }
    }

    #[test]
    fn round_trip_empty_payload() {
        let bytes = encode(Opcode::Status, 9, &[]).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        let frame = decode(&bytes).unwrap();
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn short_frames_rejected() {
        for n in 0..HEADER_LEN {
            let bytes = vec![MAGIC; n];
            assert_eq!(decode(&bytes), Err(CodecError::TooShort(n)));
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = encode(Opcode::Status, 1, b"x").unwrap();
        bytes[0] = 0x00;
        assert_eq!(decode(&bytes), Err(CodecError::BadMagic(0x00)));
    }

    #[test]
    fn unknown_opcode_rejected() {
        let mut bytes = encode(Opcode::Status, 1, &[]).unwrap();
        bytes[1] = 0x7f;
        assert_eq!(decode(&bytes), Err(CodecError::UnknownOpcode(0x7f)));
    }

    #[test]
    fn length_mismatch_rejected() {
        let mut bytes = encode(Opcode::MavlinkBin, 1, &[1, 2, 3]).unwrap();
        bytes.truncate(bytes.len() - 1);
        assert_eq!(
            decode(&bytes),
            Err(CodecError::LengthMismatch {
                declared: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn session_id_is_big_endian() {
        let bytes = encode(Opcode::Status, 0x01020304, &[]).unwrap();
        assert_eq!(&bytes[2..6], &[1, 2, 3, 4]);
    }
}
