use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use evap_link_lib::config::{PlcEndpoint, PlcSettings};
use evap_link_lib::plc::{Plc, PlcError};

/// Minimal Modbus TCP slave answering read-coils requests.
///
/// Coils read OFF, except on the first connection when `slow_first` is set:
/// that one answers ON, too late for the client timeout. Address 99 is
/// answered with an illegal-data-address exception.
async fn spawn_slave(slow_first: bool) -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let late = slow_first && n == 0;
            tokio::spawn(async move {
                let mut req = [0u8; 12];
                while socket.read_exact(&mut req).await.is_ok() {
                    let addr = u16::from_be_bytes([req[8], req[9]]);
                    let reply = if addr == 99 {
                        vec![req[0], req[1], 0, 0, 0, 3, req[6], 0x81, 0x02]
                    } else {
                        if late {
                            tokio::time::sleep(Duration::from_millis(400)).await;
                        }
                        vec![req[0], req[1], 0, 0, 0, 4, req[6], 0x01, 0x01, late as u8]
                    };
                    if socket.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (port, accepted)
}

fn tcp_settings(port: u16) -> PlcSettings {
    PlcSettings {
        endpoint: PlcEndpoint::Tcp {
            host: "127.0.0.1".into(),
            port,
        },
        timeout_s: 0.15,
        inter_cmd_gap_s: 0.0,
        ..PlcSettings::default()
    }
}

#[tokio::test]
async fn test_late_reply_is_not_read_by_next_request() {
    let (port, accepted) = spawn_slave(true).await;
    let plc = Plc::new(tcp_settings(port));
    plc.connect().await.unwrap();

    let err = plc.read_coil(0).await.unwrap_err();
    assert!(matches!(err, PlcError::Timeout { .. }), "unexpected {:?}", err);
    assert!(!plc.is_connected());

    // the ON reply to the timed-out request arrives on the old socket only
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(plc.read_coil(5).await.unwrap(), false);
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    assert!(plc.is_connected());
    plc.close().await;
}

#[tokio::test]
async fn test_exception_keeps_the_link() {
    let (port, accepted) = spawn_slave(false).await;
    let plc = Plc::new(tcp_settings(port));
    plc.connect().await.unwrap();

    match plc.read_coil(99).await {
        Err(PlcError::Exception { op, code }) => {
            assert_eq!(op, "read_coils");
            assert_eq!(code, "IllegalDataAddress");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(plc.is_connected());

    assert_eq!(plc.read_coil(1).await.unwrap(), false);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    plc.close().await;
}
