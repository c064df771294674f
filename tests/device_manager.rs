mod common;

use common::{serial_settings, ScriptBook};
use evap_link_lib::device::{ConnectionState, DeviceError, DeviceKind, DeviceManager};
use evap_link_lib::serial::stm100::build_frame;
use evap_link_lib::serial::SerialError;

fn manager(book: &ScriptBook) -> DeviceManager {
    DeviceManager::with_opener(serial_settings("STM"), serial_settings("ACS"), book.opener())
}

#[tokio::test]
async fn test_partial_connect_reports_only_failures() {
    let book = ScriptBook::new();
    book.script("STM", vec![build_frame("A-0000100").unwrap()]);
    let devices = manager(&book);

    let failures = devices.connect_all().await;
    assert_eq!(failures.len(), 1);
    assert!(failures[&DeviceKind::Acs2000].contains("ACS"));

    let status = devices.status().await;
    assert_eq!(status[0].kind, DeviceKind::Stm100);
    assert!(status[0].is_connected());
    assert!(matches!(status[1].connection_state, ConnectionState::Error(_)));
    assert!(status[1].last_error.is_some());

    // the connected instrument keeps working
    assert_eq!(devices.thickness().await.unwrap(), -100.0);
    assert!(matches!(
        devices.pressure(1).await,
        Err(DeviceError::SerialError(SerialError::NotConnected))
    ));
}

#[tokio::test]
async fn test_failed_exchange_is_recorded() {
    let book = ScriptBook::new();
    book.script("STM", vec![build_frame("F").unwrap(), build_frame("A 3.5").unwrap()]);
    book.script("ACS", vec![]);
    let devices = manager(&book);
    assert!(devices.connect_all().await.is_empty());

    assert!(devices.rate().await.is_err());
    let stm = devices.status().await.remove(0);
    assert!(stm.is_connected(), "a rejected command leaves the port open");
    assert!(stm.last_error.unwrap().contains("Command failed"));

    assert_eq!(devices.rate().await.unwrap(), 3.5);
    let stm = devices.status().await.remove(0);
    assert_eq!(stm.last_error, None);
}

#[tokio::test]
async fn test_close_and_reconnect() {
    let book = ScriptBook::new();
    book.script("STM", vec![]);
    book.script("ACS", vec![]);
    let devices = manager(&book);
    assert!(devices.connect_all().await.is_empty());

    devices.close_all().await;
    assert!(devices
        .status()
        .await
        .iter()
        .all(|s| s.connection_state == ConnectionState::Disconnected));
    assert!(!devices.stm100().await.is_connected());

    // scripts are consumed on open, so only the STM-100 can come back
    book.script("STM", vec![]);
    let failures = devices.reconnect_all().await;
    assert_eq!(failures.keys().copied().collect::<Vec<_>>(), vec![DeviceKind::Acs2000]);
    assert!(devices.stm100().await.is_connected());
}

#[tokio::test]
async fn test_reload_swaps_ports() {
    let book = ScriptBook::new();
    book.script("STM", vec![]);
    book.script("ACS", vec![]);
    let devices = manager(&book);
    assert!(devices.connect_all().await.is_empty());
    let old_stm = devices.stm100().await;

    book.script("STM2", vec![build_frame("AV2").unwrap()]);
    book.script("ACS2", vec![b"$OK,2,4.2E-5\r".to_vec()]);
    let failures = devices
        .reload_from_config(serial_settings("STM2"), serial_settings("ACS2"), true)
        .await;
    assert!(failures.is_empty(), "{:?}", failures);

    assert!(!old_stm.is_connected());
    assert_eq!(devices.stm100().await.port_name(), "STM2");
    let ports: Vec<_> = devices.status().await.into_iter().map(|s| s.port).collect();
    assert_eq!(ports, vec!["STM2", "ACS2"]);

    assert_eq!(devices.stm_version().await.unwrap(), "V2");
    assert_eq!(devices.pressure(2).await.unwrap(), 4.2e-5);
    assert_eq!(book.written("ACS2"), vec![b"$PRD,2\r".to_vec()]);
}

#[tokio::test]
async fn test_stop_stream_marks_disconnected() {
    let book = ScriptBook::new();
    book.script("STM", vec![]);
    book.script("ACS", vec![b"OK\r\n$2,1.5E-6\r\n".to_vec()]);
    let devices = manager(&book);
    assert!(devices.connect_all().await.is_empty());

    assert_eq!(devices.start_pressure_stream(2).await.unwrap(), "OK");
    let line = devices
        .read_stream_line(std::time::Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(line, "$2,1.5E-6");

    devices.stop_stream().await.unwrap();
    assert!(!devices.acs2000().await.is_connected());
    assert_eq!(
        devices.status().await[1].connection_state,
        ConnectionState::Disconnected
    );
}

#[test]
fn test_from_config_rejects_bad_ports() {
    let json = r#"{
        "stm100": { "port": "COM3" },
        "acs2000": { "port": "COM4" }
    }"#;
    let mut config: evap_link_lib::StationConfig = serde_json::from_str(json).unwrap();
    assert!(DeviceManager::from_config(&config).is_ok());

    config.acs2000.port = "  ".into();
    assert!(matches!(
        DeviceManager::from_config(&config),
        Err(DeviceError::InvalidConfiguration(_))
    ));
}
