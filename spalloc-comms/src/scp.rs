/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! SDP/SCP packet framing.
//!
//! Every UDP datagram exchanged with a BMP has the layout:
//!
//! ```text
//! ┌─────┬──────────────────────────────┬────────┬─────┬──────┬──────┬──────┬──────┐
//! │ pad │ SDP header (8 bytes)         │ cmd/rc │ seq │ arg1 │ arg2 │ arg3 │ data │
//! │ 2 B │ flags tag dst src dy dx sy sx│ u16    │ u16 │ u32  │ u32  │ u32  │ ...  │
//! └─────┴──────────────────────────────┴────────┴─────┴──────┴──────┴──────┴──────┘
//! ```
//!
//! Multi-byte fields are little-endian.  Responses reuse the layout with the
//! command field carrying a [`ResultCode`] and the argument words folded
//! into the payload.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::CommsError;

// ── Constants ─────────────────────────────────────────────────────────────────

/// UDP port on which BMPs (and SC&MP) listen for SCP.
pub const SCP_SCAMP_PORT: u16 = 17893;

/// SDP payload capacity in 32-bit words.
pub const SDP_PAYLOAD_WORDS: usize = 68;

/// SDP payload capacity in bytes.
pub const SDP_PAYLOAD_BYTES: usize = SDP_PAYLOAD_WORDS * WORD_SIZE;

/// Largest data block carried by one SCP request.
pub const SCP_MAX_DATA: usize = 256;

pub const WORD_SIZE: usize = 4;

const PAD_BYTES: usize = 2;
const SDP_HEADER_BYTES: usize = 8;
const SCP_HEADER_BYTES: usize = 4;
const ARG_BYTES: usize = 3 * WORD_SIZE;

/// SDP flag: the sender expects a reply.
const FLAG_REPLY_EXPECTED: u8 = 0x87;

/// IP tag value used for host-originated packets.
const DEFAULT_TAG: u8 = 0xFF;

/// Source port/cpu byte meaning "the host".
const HOST_PORT_CPU: u8 = 0xFF;

// ── Commands ──────────────────────────────────────────────────────────────────

/// SCP command codes understood by BMPs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScpCommand {
    Version,
    Read,
    Write,
    FpgaRead,
    FpgaWrite,
    BmpInfo,
    SerialFlash,
    Power,
}

impl ScpCommand {
    pub fn code(self) -> u16 {
        match self {
            ScpCommand::Version => 0,
            ScpCommand::Read => 2,
            ScpCommand::Write => 3,
            ScpCommand::FpgaRead => 17,
            ScpCommand::FpgaWrite => 18,
            ScpCommand::BmpInfo => 48,
            ScpCommand::SerialFlash => 53,
            ScpCommand::Power => 57,
        }
    }
}

// ── Result codes ──────────────────────────────────────────────────────────────

/// The `rc` field of an SCP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(pub u16);

impl ResultCode {
    pub const OK: ResultCode = ResultCode(0x80);
    pub const LEN: ResultCode = ResultCode(0x81);
    pub const SUM: ResultCode = ResultCode(0x82);
    pub const CMD: ResultCode = ResultCode(0x83);
    pub const ARG: ResultCode = ResultCode(0x84);
    pub const PORT: ResultCode = ResultCode(0x85);
    pub const TIMEOUT: ResultCode = ResultCode(0x86);
    pub const ROUTE: ResultCode = ResultCode(0x87);
    pub const CPU: ResultCode = ResultCode(0x88);
    pub const DEAD: ResultCode = ResultCode(0x89);
    pub const BUF: ResultCode = ResultCode(0x8a);
    pub const P2P_NOREPLY: ResultCode = ResultCode(0x8b);
    pub const P2P_REJECT: ResultCode = ResultCode(0x8c);
    pub const P2P_BUSY: ResultCode = ResultCode(0x8d);
    pub const P2P_TIMEOUT: ResultCode = ResultCode(0x8e);
    pub const PKT_TX: ResultCode = ResultCode(0x8f);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    /// Codes that report a transient condition worth retrying.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::TIMEOUT | Self::P2P_TIMEOUT | Self::P2P_NOREPLY | Self::P2P_BUSY
        )
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::OK => "RC_OK",
            Self::LEN => "RC_LEN",
            Self::SUM => "RC_SUM",
            Self::CMD => "RC_CMD",
            Self::ARG => "RC_ARG",
            Self::PORT => "RC_PORT",
            Self::TIMEOUT => "RC_TIMEOUT",
            Self::ROUTE => "RC_ROUTE",
            Self::CPU => "RC_CPU",
            Self::DEAD => "RC_DEAD",
            Self::BUF => "RC_BUF",
            Self::P2P_NOREPLY => "RC_P2P_NOREPLY",
            Self::P2P_REJECT => "RC_P2P_REJECT",
            Self::P2P_BUSY => "RC_P2P_BUSY",
            Self::P2P_TIMEOUT => "RC_P2P_TIMEOUT",
            Self::PKT_TX => "RC_PKT_TX",
            _ => return None,
        })
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({:#04x})", self.0),
            None => write!(f, "unknown ({:#04x})", self.0),
        }
    }
}

// ── SDP header ────────────────────────────────────────────────────────────────

/// The 8-byte SDP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdpHeader {
    pub flags: u8,
    pub tag: u8,
    pub dest_port_cpu: u8,
    pub src_port_cpu: u8,
    pub dest_y: u8,
    pub dest_x: u8,
    pub src_y: u8,
    pub src_x: u8,
}

impl SdpHeader {
    /// Header addressing SCP port 0 of the BMP handling `board`.
    pub fn to_bmp(board: u32) -> Self {
        Self {
            flags: FLAG_REPLY_EXPECTED,
            tag: DEFAULT_TAG,
            dest_port_cpu: (board & 0x1F) as u8,
            src_port_cpu: HOST_PORT_CPU,
            dest_y: 0,
            dest_x: 0,
            src_y: 0,
            src_x: 0,
        }
    }

    fn write(&self, buf: &mut [u8]) {
        buf[0] = self.flags;
        buf[1] = self.tag;
        buf[2] = self.dest_port_cpu;
        buf[3] = self.src_port_cpu;
        buf[4] = self.dest_y;
        buf[5] = self.dest_x;
        buf[6] = self.src_y;
        buf[7] = self.src_x;
    }

    fn read(buf: &[u8]) -> Self {
        Self {
            flags: buf[0],
            tag: buf[1],
            dest_port_cpu: buf[2],
            src_port_cpu: buf[3],
            dest_y: buf[4],
            dest_x: buf[5],
            src_y: buf[6],
            src_x: buf[7],
        }
    }
}

// ── Request ───────────────────────────────────────────────────────────────────

/// One SCP request, ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpRequest {
    pub header: SdpHeader,
    pub command: ScpCommand,
    pub seq: u16,
    pub args: [u32; 3],
    pub data: Vec<u8>,
}

impl ScpRequest {
    pub fn new(board: u32, command: ScpCommand, args: [u32; 3]) -> Self {
        Self {
            header: SdpHeader::to_bmp(board),
            command,
            seq: 0,
            args,
            data: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Frame as a UDP datagram.
    pub fn encode(&self) -> Vec<u8> {
        let body = PAD_BYTES + SDP_HEADER_BYTES;
        let mut buf = vec![0u8; body + SCP_HEADER_BYTES + ARG_BYTES + self.data.len()];
        self.header.write(&mut buf[PAD_BYTES..body]);
        LittleEndian::write_u16(&mut buf[body..], self.command.code());
        LittleEndian::write_u16(&mut buf[body + 2..], self.seq);
        let args_at = body + SCP_HEADER_BYTES;
        for (i, arg) in self.args.iter().enumerate() {
            LittleEndian::write_u32(&mut buf[args_at + i * WORD_SIZE..], *arg);
        }
        buf[args_at + ARG_BYTES..].copy_from_slice(&self.data);
        buf
    }

    /// Inverse of [`encode`](Self::encode); used by test doubles that play
    /// the BMP side.
    pub fn decode(packet: &[u8]) -> Result<(SdpHeader, u16, u16, [u32; 3], Vec<u8>), CommsError> {
        let body = PAD_BYTES + SDP_HEADER_BYTES;
        let args_at = body + SCP_HEADER_BYTES;
        if packet.len() < args_at + ARG_BYTES {
            return Err(CommsError::MalformedResponse(format!(
                "SCP request of {} bytes is shorter than its header",
                packet.len()
            )));
        }
        let header = SdpHeader::read(&packet[PAD_BYTES..body]);
        let cmd = LittleEndian::read_u16(&packet[body..]);
        let seq = LittleEndian::read_u16(&packet[body + 2..]);
        let mut args = [0u32; 3];
        for (i, arg) in args.iter_mut().enumerate() {
            *arg = LittleEndian::read_u32(&packet[args_at + i * WORD_SIZE..]);
        }
        Ok((header, cmd, seq, args, packet[args_at + ARG_BYTES..].to_vec()))
    }
}

// ── Response ──────────────────────────────────────────────────────────────────

/// A decoded SCP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpResponse {
    pub header: SdpHeader,
    pub result: ResultCode,
    pub seq: u16,
    /// Everything after `seq`: argument words followed by any data.
    pub payload: Vec<u8>,
}

impl ScpResponse {
    /// Parse a received datagram.
    pub fn decode(packet: &[u8]) -> Result<Self, CommsError> {
        let body = PAD_BYTES + SDP_HEADER_BYTES;
        if packet.len() < body + SCP_HEADER_BYTES {
            return Err(CommsError::MalformedResponse(format!(
                "SCP response of {} bytes is shorter than its header",
                packet.len()
            )));
        }
        Ok(Self {
            header: SdpHeader::read(&packet[PAD_BYTES..body]),
            result: ResultCode(LittleEndian::read_u16(&packet[body..])),
            seq: LittleEndian::read_u16(&packet[body + 2..]),
            payload: packet[body + SCP_HEADER_BYTES..].to_vec(),
        })
    }

    /// Frame a response (the BMP side); used by test doubles.
    pub fn encode(&self) -> Vec<u8> {
        let body = PAD_BYTES + SDP_HEADER_BYTES;
        let mut buf = vec![0u8; body + SCP_HEADER_BYTES + self.payload.len()];
        self.header.write(&mut buf[PAD_BYTES..body]);
        LittleEndian::write_u16(&mut buf[body..], self.result.0);
        LittleEndian::write_u16(&mut buf[body + 2..], self.seq);
        buf[body + SCP_HEADER_BYTES..].copy_from_slice(&self.payload);
        buf
    }

    /// The `index`th little-endian word of the payload.
    pub fn word(&self, index: usize) -> Result<u32, CommsError> {
        let at = index * WORD_SIZE;
        self.payload
            .get(at..at + WORD_SIZE)
            .map(LittleEndian::read_u32)
            .ok_or_else(|| {
                CommsError::MalformedResponse(format!(
                    "response payload of {} bytes has no word {index}",
                    self.payload.len()
                ))
            })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_request_layout() {
        let mut req = ScpRequest::new(3, ScpCommand::Power, [(1 << 16) | 1, 0b1010, 0]);
        req.seq = 0x1234;
        let bytes = req.encode();
        assert_eq!(bytes.len(), 2 + 8 + 4 + 12);
        assert_eq!(&bytes[0..2], &[0, 0]);
        assert_eq!(bytes[2], 0x87);
        assert_eq!(bytes[4], 3); // dest port 0, cpu = board
        assert_eq!(LittleEndian::read_u16(&bytes[10..]), 57);
        assert_eq!(LittleEndian::read_u16(&bytes[12..]), 0x1234);
        assert_eq!(LittleEndian::read_u32(&bytes[14..]), 0x0001_0001);
        assert_eq!(LittleEndian::read_u32(&bytes[18..]), 0b1010);
    }

    #[test]
    fn request_decode_inverts_encode() {
        let req = ScpRequest::new(1, ScpCommand::FpgaWrite, [0x5C, 4, 2]).with_data(vec![1, 0, 0, 0]);
        let (header, cmd, seq, args, data) = ScpRequest::decode(&req.encode()).unwrap();
        assert_eq!(header, req.header);
        assert_eq!(cmd, ScpCommand::FpgaWrite.code());
        assert_eq!(seq, 0);
        assert_eq!(args, [0x5C, 4, 2]);
        assert_eq!(data, vec![1, 0, 0, 0]);
    }

    #[test]
    fn response_words_and_result_code() {
        let resp = ScpResponse {
            header: SdpHeader::to_bmp(0),
            result: ResultCode::OK,
            seq: 7,
            payload: vec![0x02, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF],
        };
        let parsed = ScpResponse::decode(&resp.encode()).unwrap();
        assert!(parsed.result.is_ok());
        assert_eq!(parsed.seq, 7);
        assert_eq!(parsed.word(0).unwrap(), 2);
        assert_eq!(parsed.word(1).unwrap(), u32::MAX);
        assert!(matches!(parsed.word(2), Err(CommsError::MalformedResponse(_))));
    }

    #[test]
    fn short_response_is_malformed() {
        assert!(matches!(
            ScpResponse::decode(&[0u8; 11]),
            Err(CommsError::MalformedResponse(_))
        ));
    }

    #[test]
    fn result_code_classification() {
        assert!(ResultCode::P2P_TIMEOUT.is_transient());
        assert!(!ResultCode::ARG.is_transient());
        assert_eq!(ResultCode::ARG.to_string(), "RC_ARG (0x84)");
        assert_eq!(ResultCode(0x99).to_string(), "unknown (0x99)");
    }
}
