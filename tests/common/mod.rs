#![allow(dead_code)]

use oxilink_lib::serial::{CommandKind, MockTransport, PortCandidate, SessionBuilder, SessionHandle};

pub const PORT_A: &str = "/dev/ttyUSB0";
pub const PORT_B: &str = "/dev/ttyUSB1";

pub const SUFFIX: [u8; 4] = [0x55, 0xAA, 0x01, 0x00];

/// Header of 2014-06-01 12:30:05, 5 s interval, adult, delta 18.
pub const HEADER_1: &str = "14060112993005220012";
/// Header of 2014-06-02 08:15:04, 4 s interval, pediatric, delta 9.
pub const HEADER_2: &str = "14060208991504420009";
pub const SAMPLES_1: &str = "5e00325e0037";
pub const SAMPLES_2: &str = "6000486100496200";

pub fn frame(echo: &[u8], body: &[u8]) -> Vec<u8> {
    let mut bytes = echo.to_vec();
    bytes.extend_from_slice(body);
    bytes.extend_from_slice(&SUFFIX);
    bytes
}

pub fn handshake_reply() -> Vec<u8> {
    frame(&[0x55, 0xAA, 0x01], &[0x07])
}

pub fn count_reply(count: u16) -> Vec<u8> {
    frame(&[0x55, 0xAA, 0x02], &count.to_be_bytes())
}

pub fn header_reply(header_hex: &str) -> Vec<u8> {
    frame(&[0x55, 0xAA, 0x03], &hex::decode(header_hex).unwrap())
}

pub fn data_reply(samples_hex: &str) -> Vec<u8> {
    frame(&[0x55, 0xAA, 0x04], &hex::decode(samples_hex).unwrap())
}

pub fn candidate(name: &str) -> PortCandidate {
    PortCandidate::new(name)
}

pub fn session(mock: &MockTransport) -> SessionHandle {
    SessionBuilder::new(mock.clone()).build()
}

pub fn expect_handshake(mock: &MockTransport, port: &str) {
    mock.expect(port, &CommandKind::Handshake.encode(), &handshake_reply());
}

/// Script a device on `port` that answers the handshake and holds `reports`
/// as `(header_hex, samples_hex)` pairs.
pub fn script_device(mock: &MockTransport, port: &str, reports: &[(&str, &str)]) {
    expect_handshake(mock, port);
    mock.expect(
        port,
        &CommandKind::GetReportCount.encode(),
        &count_reply(reports.len() as u16),
    );
    for (i, (header, samples)) in reports.iter().enumerate() {
        let number = i as u16 + 1;
        mock.expect(port, &CommandKind::GetReportHeader(number).encode(), &header_reply(header));
        mock.expect(port, &CommandKind::GetReportData(number).encode(), &data_reply(samples));
    }
}
