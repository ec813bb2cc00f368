//! Oximeter wire protocol.
//!
//! Every command is a fixed 3-byte opcode, optionally followed by a
//! big-endian 16-bit report number. Every reply echoes the opcode (except
//! the handshake, whose echo is not checked) and ends with `55 AA 01 00`.
//!
//! | Command              | Sent                | Reply prefix | Max frame |
//! |----------------------|---------------------|--------------|-----------|
//! | Handshake            | `55 AA 01`          | none         | 10-20     |
//! | GetReportCount       | `55 AA 02`          | `55 AA 02`   | 10        |
//! | GetReportHeader(n)   | `55 AA 03 nn nn`    | `55 AA 03`   | 20        |
//! | GetReportData(n)     | `55 AA 04 nn nn`    | `55 AA 04`   | 4096      |

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Result, SerialError};
use crate::report::HEADER_LEN;

pub const RESPONSE_SUFFIX: [u8; 4] = [0x55, 0xAA, 0x01, 0x00];
pub const ECHO_LEN: usize = 3;

const OPCODE_HANDSHAKE: [u8; 3] = [0x55, 0xAA, 0x01];
const OPCODE_REPORT_COUNT: [u8; 3] = [0x55, 0xAA, 0x02];
const OPCODE_REPORT_HEADER: [u8; 3] = [0x55, 0xAA, 0x03];
const OPCODE_REPORT_DATA: [u8; 3] = [0x55, 0xAA, 0x04];

const MAX_FRAME_REPORT_COUNT: usize = 10;
const MAX_FRAME_REPORT_HEADER: usize = 20;
const MAX_FRAME_REPORT_DATA: usize = 4096;
pub const DEFAULT_HANDSHAKE_MAX_FRAME: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    Handshake,
    GetReportCount,
    GetReportHeader(u16),
    GetReportData(u16),
}

impl CommandKind {
    pub fn opcode(&self) -> [u8; 3] {
        match self {
            CommandKind::Handshake => OPCODE_HANDSHAKE,
            CommandKind::GetReportCount => OPCODE_REPORT_COUNT,
            CommandKind::GetReportHeader(_) => OPCODE_REPORT_HEADER,
            CommandKind::GetReportData(_) => OPCODE_REPORT_DATA,
        }
    }

    pub fn report_number(&self) -> Option<u16> {
        match self {
            CommandKind::GetReportHeader(n) | CommandKind::GetReportData(n) => Some(*n),
            _ => None,
        }
    }

    /// Bytes written to the device for this command.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = self.opcode().to_vec();
        if let Some(number) = self.report_number() {
            bytes.extend_from_slice(&number.to_be_bytes());
        }
        bytes
    }

    /// How the reply to this command is recognized.
    pub fn descriptor(&self, handshake_max_frame: usize) -> ResponseDescriptor {
        let suffix = RESPONSE_SUFFIX.to_vec();
        match self {
            CommandKind::Handshake => ResponseDescriptor {
                prefix: None,
                suffix,
                max_length: handshake_max_frame,
            },
            CommandKind::GetReportCount => ResponseDescriptor {
                prefix: Some(OPCODE_REPORT_COUNT.to_vec()),
                suffix,
                max_length: MAX_FRAME_REPORT_COUNT,
            },
            CommandKind::GetReportHeader(_) => ResponseDescriptor {
                prefix: Some(OPCODE_REPORT_HEADER.to_vec()),
                suffix,
                max_length: MAX_FRAME_REPORT_HEADER,
            },
            CommandKind::GetReportData(_) => ResponseDescriptor {
                prefix: Some(OPCODE_REPORT_DATA.to_vec()),
                suffix,
                max_length: MAX_FRAME_REPORT_DATA,
            },
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Handshake => write!(f, "handshake"),
            CommandKind::GetReportCount => write!(f, "report count"),
            CommandKind::GetReportHeader(n) => write!(f, "report {} header", n),
            CommandKind::GetReportData(n) => write!(f, "report {} data", n),
        }
    }
}

/// Prefix/suffix/max-length rule for one reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseDescriptor {
    pub prefix: Option<Vec<u8>>,
    pub suffix: Vec<u8>,
    pub max_length: usize,
}

/// Per-phase timeouts. Each pending request gets exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub open: Duration,
    pub handshake: Duration,
    pub command: Duration,
    pub data: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            open: Duration::from_millis(1000),
            handshake: Duration::from_millis(1000),
            command: Duration::from_millis(500),
            data: Duration::from_millis(2000),
        }
    }
}

impl Timeouts {
    pub fn for_kind(&self, kind: CommandKind) -> Duration {
        match kind {
            CommandKind::Handshake => self.handshake,
            CommandKind::GetReportCount | CommandKind::GetReportHeader(_) => self.command,
            CommandKind::GetReportData(_) => self.data,
        }
    }
}

/// A decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Handshake,
    ReportCount(u16),
    ReportHeader { number: u16, header: [u8; HEADER_LEN] },
    ReportData { number: u16, samples: Vec<u8> },
}

/// Bytes between the 3-byte echo and the suffix.
fn payload(frame: &[u8]) -> Result<&[u8]> {
    let end = frame.len().saturating_sub(RESPONSE_SUFFIX.len());
    if end < ECHO_LEN || !frame.ends_with(&RESPONSE_SUFFIX) {
        return Err(SerialError::FramingError(format!(
            "frame too short: {}",
            hex::encode(frame)
        )));
    }
    Ok(&frame[ECHO_LEN..end])
}

/// Decode a complete frame received in reply to `kind`.
pub fn decode_response(kind: CommandKind, frame: &[u8]) -> Result<Response> {
    match kind {
        CommandKind::Handshake => Ok(Response::Handshake),
        CommandKind::GetReportCount => {
            let body = payload(frame)?;
            if body.len() < 2 {
                return Err(SerialError::FramingError(format!(
                    "report count reply missing count: {}",
                    hex::encode(frame)
                )));
            }
            Ok(Response::ReportCount(u16::from_be_bytes([body[0], body[1]])))
        }
        CommandKind::GetReportHeader(number) => {
            let body = payload(frame)?;
            let header: [u8; HEADER_LEN] = body
                .get(..HEADER_LEN)
                .and_then(|h| h.try_into().ok())
                .ok_or_else(|| {
                    SerialError::FramingError(format!(
                        "report header needs {} bytes, got {}",
                        HEADER_LEN,
                        body.len()
                    ))
                })?;
            Ok(Response::ReportHeader { number, header })
        }
        CommandKind::GetReportData(number) => {
            let body = payload(frame)?;
            Ok(Response::ReportData {
                number,
                samples: body.to_vec(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encoding() {
        assert_eq!(CommandKind::Handshake.encode(), vec![0x55, 0xAA, 0x01]);
        assert_eq!(CommandKind::GetReportCount.encode(), vec![0x55, 0xAA, 0x02]);
        assert_eq!(
            CommandKind::GetReportHeader(1).encode(),
            vec![0x55, 0xAA, 0x03, 0x00, 0x01]
        );
        assert_eq!(
            CommandKind::GetReportData(256).encode(),
            vec![0x55, 0xAA, 0x04, 0x01, 0x00]
        );
    }

    #[test]
    fn test_descriptors() {
        let hs = CommandKind::Handshake.descriptor(DEFAULT_HANDSHAKE_MAX_FRAME);
        assert_eq!(hs.prefix, None);
        assert_eq!(hs.suffix, RESPONSE_SUFFIX.to_vec());
        assert_eq!(hs.max_length, 20);

        let data = CommandKind::GetReportData(3).descriptor(DEFAULT_HANDSHAKE_MAX_FRAME);
        assert_eq!(data.prefix, Some(vec![0x55, 0xAA, 0x04]));
        assert_eq!(data.max_length, 4096);
    }

    #[test]
    fn test_decode_report_count() {
        let frame = [0x55, 0xAA, 0x02, 0x00, 0x05, 0x55, 0xAA, 0x01, 0x00];
        let response = decode_response(CommandKind::GetReportCount, &frame).unwrap();
        assert_eq!(response, Response::ReportCount(5));
    }

    #[test]
    fn test_decode_report_header_strips_echo() {
        let frame = hex::decode("55aa031406011299300522001255aa0100").unwrap();
        match decode_response(CommandKind::GetReportHeader(2), &frame).unwrap() {
            Response::ReportHeader { number, header } => {
                assert_eq!(number, 2);
                assert_eq!(hex::encode(header), "14060112993005220012");
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_header_reply_feeds_decoder() {
        // Trailing bytes past the header are not part of it.
        let frame = hex::decode("55aa0314060112993005220012ffff55aa0100").unwrap();
        match decode_response(CommandKind::GetReportHeader(1), &frame).unwrap() {
            Response::ReportHeader { header, .. } => {
                assert_eq!(header.len(), HEADER_LEN);
                let info = crate::report::decode_header(&header).unwrap();
                assert_eq!(info.delta, 18);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_decode_report_data_strips_suffix() {
        let frame = hex::decode("55aa045e00325e003755aa0100").unwrap();
        match decode_response(CommandKind::GetReportData(1), &frame).unwrap() {
            Response::ReportData { samples, .. } => {
                assert_eq!(hex::encode(samples), "5e00325e0037");
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_short_frames_are_framing_errors() {
        let frame = [0x55, 0xAA, 0x02, 0x55, 0xAA, 0x01, 0x00];
        assert!(matches!(
            decode_response(CommandKind::GetReportCount, &frame),
            Err(SerialError::FramingError(_))
        ));

        let frame = hex::decode("55aa03140601129955aa0100").unwrap();
        assert!(matches!(
            decode_response(CommandKind::GetReportHeader(1), &frame),
            Err(SerialError::FramingError(_))
        ));
    }

    #[test]
    fn test_timeouts_by_kind() {
        let t = Timeouts::default();
        assert_eq!(t.for_kind(CommandKind::GetReportHeader(1)), t.command);
        assert_eq!(t.for_kind(CommandKind::GetReportData(1)), t.data);
        assert_eq!(t.for_kind(CommandKind::Handshake), t.handshake);
    }
}
