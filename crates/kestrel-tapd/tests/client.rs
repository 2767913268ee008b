//! The orchestrator's tap client against a live helper.

use kestrel_core::tapnet::TapClient;
use kestrel_core::CoreError;
use kestrel_tapd::{serve, AppState, MemoryDevices};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

struct Helper {
    addr: SocketAddr,
    devices: Arc<MemoryDevices>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for Helper {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn spawn_helper(bridge: &str) -> Helper {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let devices = Arc::new(MemoryDevices::with_bridge(bridge));
    let state = AppState::new(devices.clone(), "kestrel0");
    let (tx, rx) = oneshot::channel();
    tokio::spawn(serve(state, addr, async move {
        let _ = rx.await;
    }));

    for _ in 0..50 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    Helper {
        addr,
        devices,
        shutdown: Some(tx),
    }
}

#[tokio::test]
async fn test_create_and_delete() {
    let helper = spawn_helper("kestrel0").await;
    let client = TapClient::new(helper.addr);

    let devices = client.create("vm1", 2).await.unwrap();
    assert_eq!(devices, vec!["vm1-0", "vm1-1"]);
    assert_eq!(helper.devices.devices(), devices);

    client.delete(&devices).await.unwrap();
    assert!(helper.devices.devices().is_empty());

    // Deleting again succeeds.
    client.delete(&devices).await.unwrap();
}

#[tokio::test]
async fn test_missing_bridge_surfaces_helper_error() {
    let helper = spawn_helper("br0").await;
    let client = TapClient::new(helper.addr);

    match client.create("vm1", 1).await {
        Err(CoreError::Helper { status, message }) => {
            assert_eq!(status, 400);
            assert!(message.contains("kestrel0"));
        }
        other => panic!("expected helper error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stopped_helper_is_unavailable() {
    let helper = spawn_helper("kestrel0").await;
    let addr = helper.addr;
    drop(helper);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = TapClient::new(addr).create("vm1", 1).await.unwrap_err();
    assert!(matches!(err, CoreError::HelperUnavailable { .. }));
    assert!(err.to_string().contains("kestrel-tapd"));
}
