//! Drives a real `hwio-server::EventLoop` against a real `hwio-client`
//! connector over a loopback socket: spin the server on a background
//! thread, connect from the test thread, assert on what comes back.

use std::{
    net::TcpListener as StdListenerProbe,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use hwio_bus::MockBus;
use hwio_client::HwioClient;
use hwio_server::{EventLoop, ServerConfig};

/// Picks a free port by binding once and dropping it immediately — racy
/// under heavy parallel test load, but good enough for a local test suite
/// with a handful of tests.
fn free_addr() -> String {
    let probe = StdListenerProbe::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().to_string()
}

fn spawn_server(addr: String, bus: MockBus) -> (thread::JoinHandle<()>, std::sync::Arc<AtomicBool>) {
    let run = std::sync::Arc::new(AtomicBool::new(true));
    let run_clone = run.clone();
    let mut config = ServerConfig::default();
    config.addr = addr;
    config.poll_timeout_ms = 50;
    let handle = thread::spawn(move || {
        let mut server = EventLoop::bind(config, bus).expect("bind");
        server.run(&run_clone).expect("event loop");
    });
    (handle, run)
}

#[test]
fn ping_handshake_succeeds() {
    let addr = free_addr();
    let (handle, run) = spawn_server(addr.clone(), MockBus::new());
    thread::sleep(Duration::from_millis(30));

    let mut client = HwioClient::connect(&addr).expect("connect performs the initial ping");
    client.ping().expect("explicit ping after handshake");
    client.close().expect("bye");

    run.store(false, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn query_then_read_round_trip() {
    let addr = free_addr();
    let bus = MockBus::new();
    let dev = bus.add_device("gpio0", 16);
    let (handle, run) = spawn_server(addr.clone(), bus);
    thread::sleep(Duration::from_millis(30));

    let mut client = HwioClient::connect(&addr).unwrap();
    let handles = client.query(&["gpio0"]).unwrap();
    assert_eq!(handles, vec![dev.0]);

    client.write(handles[0], 0, &[1, 2, 3, 4]).unwrap();
    let data = client.read(handles[0], 0, 4).unwrap();
    assert_eq!(data, vec![1, 2, 3, 4]);

    run.store(false, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn read_without_ownership_is_access_denied() {
    let addr = free_addr();
    let bus = MockBus::new();
    let dev = bus.add_device("gpio0", 16);
    let (handle, run) = spawn_server(addr.clone(), bus);
    thread::sleep(Duration::from_millis(30));

    let mut owner = HwioClient::connect(&addr).unwrap();
    owner.query(&["gpio0"]).unwrap();

    let mut other = HwioClient::connect(&addr).unwrap();
    let err = other.read(dev.0, 0, 4).unwrap_err();
    assert!(matches!(err, hwio_client::RequestError::Server { code, .. } if code == hwio_proto::ErrorCode::AccessDenied.code()));

    run.store(false, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn abrupt_disconnect_releases_devices() {
    let addr = free_addr();
    let bus = MockBus::new();
    let dev = bus.add_device("gpio0", 16);
    let (handle, run) = spawn_server(addr.clone(), bus);
    thread::sleep(Duration::from_millis(30));

    {
        let mut client = HwioClient::connect(&addr).unwrap();
        client.query(&["gpio0"]).unwrap();
        // Simulates a crashed client: the socket closes without BYE.
        // The server must notice on its own.
        client.forget();
    }
    thread::sleep(Duration::from_millis(100));

    let mut other = HwioClient::connect(&addr).unwrap();
    let handles = other.query(&["gpio0"]).unwrap();
    assert_eq!(handles, vec![dev.0], "device must be free again after the owner vanished");

    run.store(false, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn bye_ends_session_cleanly() {
    let addr = free_addr();
    let (handle, run) = spawn_server(addr.clone(), MockBus::new());
    thread::sleep(Duration::from_millis(30));

    let client = HwioClient::connect(&addr).unwrap();
    client.close().expect("bye is one-way, no reply expected");

    run.store(false, Ordering::Relaxed);
    handle.join().unwrap();
}
