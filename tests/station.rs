mod common;

use common::{fast_plc_settings, serial_settings, Call, MockTransport, ScriptBook};
use evap_link_lib::config::{PlcEndpoint, StationConfig};
use evap_link_lib::device::DeviceManager;
use evap_link_lib::plc::{Plc, Switch};
use evap_link_lib::serial::stm100::build_frame;
use evap_link_lib::Station;

fn station(book: &ScriptBook) -> (Station, std::sync::Arc<std::sync::Mutex<common::MockState>>) {
    let (transport, state) = MockTransport::new();
    let plc = Plc::with_transport(fast_plc_settings(), Box::new(transport));
    let devices =
        DeviceManager::with_opener(serial_settings("STM"), serial_settings("ACS"), book.opener());
    (Station::from_parts(plc, devices), state)
}

#[tokio::test(start_paused = true)]
async fn test_last_error_is_sticky_until_success() {
    let book = ScriptBook::new();
    let (station, state) = station(&book);
    station.connect_plc().await.unwrap();
    assert_eq!(station.last_error(), None);

    let err = station.write_switch("DAC1", true, false, None).await.unwrap_err();
    assert!(err.starts_with("Failed to write DAC1"), "{}", err);
    assert_eq!(station.last_error(), Some(err));

    // the next success clears it
    station.write_switch("RP", true, false, None).await.unwrap();
    assert_eq!(station.last_error(), None);
    assert_eq!(state.lock().unwrap().ops(), vec![Call::WriteCoil(0, true)]);

    station.switch(Switch::Water, true).await.unwrap();
    assert_eq!(station.read_bit("WATER").await, Ok(true));
    station.close_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_all_keys_failures_by_device() {
    let book = ScriptBook::new();
    book.script("STM", vec![build_frame("A+0000020").unwrap()]);
    let (station, _state) = station(&book);

    let failures = station.connect_all().await;
    assert_eq!(failures.keys().collect::<Vec<_>>(), vec!["acs2000"]);
    let last = station.last_error().unwrap();
    assert!(last.starts_with("Failed to connect acs2000"), "{}", last);

    assert_eq!(station.thickness().await, Ok(20.0));
    assert_eq!(station.last_error(), None);

    let status = station.status().await;
    assert!(status.plc_connected);
    assert_eq!(status.plc_endpoint, "mock");
    assert_eq!(status.devices.len(), 2);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["devices"][0]["kind"], "stm100");
    assert_eq!(json["plc_connected"], true);
    station.close_all().await;
    assert!(!station.status().await.plc_connected);
}

#[tokio::test(start_paused = true)]
async fn test_read_status_and_dac() {
    let book = ScriptBook::new();
    let (station, state) = station(&book);
    station.connect_plc().await.unwrap();
    state.lock().unwrap().coils.insert(33, true);

    let status = station.read_status().await.unwrap();
    assert_eq!(status.get("WATER_SW"), Some(&true));
    assert_eq!(status.get("DOOR_SW"), Some(&false));

    assert_eq!(station.set_dac_code(1, 5000).await, Ok(4000));
    assert_eq!(station.read_register("DAC_POWER_1").await, Ok(4000));
    let err = station.set_dac_voltage(3, 1.0).await.unwrap_err();
    assert!(err.contains("channel must be 1 or 2"), "{}", err);
    station.close_all().await;
}

#[tokio::test]
async fn test_apply_config_rejects_invalid_settings() {
    let book = ScriptBook::new();
    let (station, _state) = station(&book);

    let mut config = StationConfig {
        plc: fast_plc_settings(),
        stm100: serial_settings("STM"),
        acs2000: serial_settings("ACS"),
    };
    config.stm100.baud_rate = 0;

    let err = station.apply_config(config).await.unwrap_err();
    assert!(err.starts_with("Failed to apply configuration"), "{}", err);
    assert_eq!(station.last_error(), Some(err));
    assert_eq!(station.status().await.plc_endpoint, "mock");
}

#[tokio::test]
async fn test_apply_config_rebuilds_everything() {
    let book = ScriptBook::new();
    let (station, state) = station(&book);
    station.connect_plc().await.unwrap();

    book.script("STM", vec![]);
    book.script("ACS", vec![]);
    let mut plc = fast_plc_settings();
    plc.endpoint = PlcEndpoint::Tcp {
        host: "127.0.0.1".into(),
        port: 1,
    };
    plc.timeout_s = 0.5;
    let config = StationConfig {
        plc,
        stm100: serial_settings("STM"),
        acs2000: serial_settings("ACS"),
    };

    let failures = station.apply_config(config).await.unwrap();
    assert_eq!(failures.keys().collect::<Vec<_>>(), vec!["plc"]);
    assert_eq!(state.lock().unwrap().disconnects, 1, "old PLC link closed");

    let status = station.status().await;
    assert!(!status.plc_connected);
    assert!(status.plc_endpoint.starts_with("tcp:127.0.0.1:1"));
    assert!(status.devices.iter().all(|d| d.is_connected()));
    assert!(station.last_error().unwrap().contains("plc"));
    station.close_all().await;
}
