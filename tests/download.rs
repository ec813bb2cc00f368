mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use oxilink_lib::device::{ConnectionState, DeviceError, DeviceManager, DownloadEvent, DownloadOutcome, ScanOutcome};
use oxilink_lib::serial::{CommandKind, MockTransport, TransportEvent};
use oxilink_lib::Settings;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

async fn connected_manager(mock: &MockTransport) -> DeviceManager {
    let manager = DeviceManager::new(session(mock), Settings::default());
    let outcome = manager
        .scan_for_device(Some(vec![candidate(PORT_A)]), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, ScanOutcome::DeviceFound(candidate(PORT_A)));
    manager
}

fn drain(rx: &mut mpsc::UnboundedReceiver<DownloadEvent>) -> Vec<DownloadEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_download_all_reports() {
    let mock = MockTransport::new();
    script_device(&mock, PORT_A, &[(HEADER_1, SAMPLES_1), (HEADER_2, SAMPLES_2)]);
    let manager = connected_manager(&mock).await;
    assert_eq!(manager.connection_state().await, ConnectionState::Connected);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let summary = manager
        .download_reports(&CancellationToken::new(), Some(tx))
        .await
        .unwrap();

    assert_eq!(summary.outcome, DownloadOutcome::Completed);
    assert!(summary.is_complete());
    assert_eq!((summary.available, summary.attempted, summary.completed), (2, 2, 2));
    assert_eq!(summary.reports[0].header, HEADER_1);
    assert_eq!(summary.reports[1].data, SAMPLES_2);
    assert_eq!(summary.reports[1].sp02().unwrap(), vec![0x60, 0x61]);

    let events = drain(&mut rx);
    let order: Vec<String> = events
        .iter()
        .map(|e| match e {
            DownloadEvent::ReportCount(n) => format!("count {}", n),
            DownloadEvent::HeaderReceived { number } => format!("header {}", number),
            DownloadEvent::ReportDownloaded(r) => format!("report {}", r.number),
            DownloadEvent::Failed { number, .. } => format!("failed {}", number),
        })
        .collect();
    assert_eq!(
        order,
        vec!["count 2", "header 1", "report 1", "header 2", "report 2"]
    );

    // Strictly one request at a time, header before data.
    let kinds: Vec<Vec<u8>> = mock.sent_to(PORT_A);
    assert_eq!(
        kinds,
        vec![
            CommandKind::Handshake.encode(),
            CommandKind::GetReportCount.encode(),
            CommandKind::GetReportHeader(1).encode(),
            CommandKind::GetReportData(1).encode(),
            CommandKind::GetReportHeader(2).encode(),
            CommandKind::GetReportData(2).encode(),
        ]
    );
    assert_eq!(
        manager.connected_device().await.unwrap().report_count,
        Some(2)
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_report_is_skipped() {
    let mock = MockTransport::new();
    expect_handshake(&mock, PORT_A);
    mock.expect(PORT_A, &CommandKind::GetReportCount.encode(), &count_reply(3));
    mock.expect(PORT_A, &CommandKind::GetReportHeader(1).encode(), &header_reply(HEADER_1));
    mock.expect(PORT_A, &CommandKind::GetReportData(1).encode(), &data_reply(SAMPLES_1));
    // Report 2 never answers its header.
    let manager = connected_manager(&mock).await;

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let download = manager.download_reports(&cancel, Some(tx));
    let scripted = async {
        // Header 2 times out, then the device answers report 3.
        tokio::time::sleep(Duration::from_millis(100)).await;
        mock.expect(PORT_A, &CommandKind::GetReportHeader(3).encode(), &header_reply(HEADER_2));
        mock.expect(PORT_A, &CommandKind::GetReportData(3).encode(), &data_reply(SAMPLES_2));
    };
    let (summary, _) = tokio::join!(download, scripted);
    let summary = summary.unwrap();

    assert_eq!(summary.outcome, DownloadOutcome::Completed);
    assert!(!summary.is_complete());
    assert_eq!((summary.attempted, summary.completed), (3, 2));
    let numbers: Vec<u16> = summary.reports.iter().map(|r| r.number).collect();
    assert_eq!(numbers, vec![1, 3]);

    let failures: Vec<u16> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            DownloadEvent::Failed { number, .. } => Some(number),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![2]);
}

#[tokio::test(start_paused = true)]
async fn test_data_failure_keeps_header() {
    let mock = MockTransport::new();
    expect_handshake(&mock, PORT_A);
    mock.expect(PORT_A, &CommandKind::GetReportCount.encode(), &count_reply(1));
    mock.expect(PORT_A, &CommandKind::GetReportHeader(1).encode(), &header_reply(HEADER_1));
    let manager = connected_manager(&mock).await;

    let summary = manager
        .download_reports(&CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(summary.completed, 0);
    assert_eq!(summary.reports.len(), 1);
    assert!(!summary.reports[0].has_data());
    assert_eq!(summary.reports[0].summary().unwrap().sample_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unplugged_mid_download() {
    let mock = MockTransport::new();
    expect_handshake(&mock, PORT_A);
    mock.expect(PORT_A, &CommandKind::GetReportCount.encode(), &count_reply(2));
    mock.expect(PORT_A, &CommandKind::GetReportHeader(1).encode(), &header_reply(HEADER_1));
    mock.expect(PORT_A, &CommandKind::GetReportData(1).encode(), &data_reply(SAMPLES_1));
    mock.expect_events(
        PORT_A,
        &CommandKind::GetReportHeader(2).encode(),
        vec![TransportEvent::Data(vec![0x55, 0xAA]), TransportEvent::Removed],
    );
    let manager = connected_manager(&mock).await;

    let summary = manager
        .download_reports(&CancellationToken::new(), None)
        .await
        .unwrap();

    assert!(matches!(summary.outcome, DownloadOutcome::Interrupted(_)));
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.reports.len(), 1);
    assert_eq!(manager.connected_port().await, None);
    assert!(!manager.is_connected().await);
    assert!(matches!(
        manager.connection_state().await,
        ConnectionState::Error(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_download_and_events() {
    let mock = MockTransport::new();
    expect_handshake(&mock, PORT_A);
    mock.expect(PORT_A, &CommandKind::GetReportCount.encode(), &count_reply(3));
    mock.expect(PORT_A, &CommandKind::GetReportHeader(1).encode(), &header_reply(HEADER_1));
    mock.expect(PORT_A, &CommandKind::GetReportData(1).encode(), &data_reply(SAMPLES_1));
    mock.expect(PORT_A, &CommandKind::GetReportHeader(2).encode(), &header_reply(HEADER_2));
    // Report 2 data stays unanswered until the cancel.
    let manager = Arc::new(connected_manager(&mock).await);
    let cancel = CancellationToken::new();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let download = tokio::spawn({
        let manager = manager.clone();
        let cancel = cancel.clone();
        async move { manager.download_reports(&cancel, Some(tx)).await }
    });

    loop {
        match rx.recv().await {
            Some(DownloadEvent::HeaderReceived { number: 2 }) => break,
            Some(_) => {}
            None => panic!("download ended early"),
        }
    }
    cancel.cancel();

    let summary = download.await.unwrap().unwrap();
    assert_eq!(summary.outcome, DownloadOutcome::Canceled);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.reports.len(), 2);
    assert!(!summary.reports[1].has_data());

    // No completion or failure is reported after the cancel.
    assert!(drain(&mut rx).is_empty());
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(mock.open_port(), None);
    assert_eq!(manager.connected_port().await, None);
    assert!(!mock
        .sent_to(PORT_A)
        .contains(&CommandKind::GetReportHeader(3).encode()));
}

#[tokio::test(start_paused = true)]
async fn test_download_requires_connection() {
    let mock = MockTransport::new();
    let manager = DeviceManager::new(session(&mock), Settings::default());

    let err = manager
        .download_reports(&CancellationToken::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn test_connect_to_known_port_and_disconnect() {
    let mock = MockTransport::new();
    expect_handshake(&mock, PORT_B);
    let manager = DeviceManager::new(session(&mock), Settings::default());

    manager.connect(&candidate(PORT_B)).await.unwrap();
    assert_eq!(manager.connected_port().await, Some(candidate(PORT_B)));
    assert!(manager.is_connected().await);

    manager.disconnect().await.unwrap();
    assert_eq!(manager.connected_port().await, None);
    assert_eq!(manager.connection_state().await, ConnectionState::Disconnected);
    assert_eq!(mock.open_port(), None);
}
