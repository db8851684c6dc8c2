mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use common::{config, start, wait_status, MockConnector, MockProvider};
use tether_link::Permission;
use tether_session::{SessionState, SessionStatus};

fn message_is(expected: &'static str) -> impl Fn(&SessionStatus) -> bool {
    move |s: &SessionStatus| s.message.as_deref() == Some(expected)
}

#[tokio::test]
async fn missing_device_stays_idle_then_later_connect_is_ready() {
    let provider = Arc::new(MockProvider::default());
    let connector = Arc::new(MockConnector::default());
    let session = start(&provider, &connector, config(38710));

    session.connect();
    let status = wait_status(&session, message_is("device not found")).await;
    assert_eq!(status.state, SessionState::Idle);
    assert!(!session.is_ready());
    assert_eq!(connector.connects(), 0);

    provider.attach(Permission::Granted);
    session.connect();
    let status = wait_status(&session, |s| s.state == SessionState::Ready).await;
    assert_eq!(status.port, Some(38710));
    assert_eq!(status.device.as_deref(), Some("/dev/ttyMOCK0"));
    assert_eq!(connector.addresses.lock().unwrap().as_slice(), ["tcp://:38710"]);

    let live = session.live().expect("live session");
    assert_eq!(live.port, 38710);
    session.shutdown().await;
}

#[tokio::test]
async fn connect_while_ready_keeps_the_existing_session() {
    let provider = MockProvider::with_device(Permission::Granted);
    let connector = Arc::new(MockConnector::default());
    let session = start(&provider, &connector, config(38720));

    session.connect();
    wait_status(&session, |s| s.state == SessionState::Ready).await;
    let first = session.live().unwrap().session;

    session.connect();
    let status = wait_status(&session, message_is("connection already exists")).await;
    assert_eq!(status.state, SessionState::Ready);
    assert_eq!(session.live().unwrap().session, first);
    assert_eq!(connector.connects(), 1);
    session.shutdown().await;
}

#[tokio::test]
async fn bridge_relays_between_serial_and_endpoint() {
    let provider = MockProvider::with_device(Permission::Granted);
    let connector = Arc::new(MockConnector::default());
    let session = start(&provider, &connector, config(38730));

    session.connect();
    wait_status(&session, |s| s.state == SessionState::Ready).await;
    let mut serial = provider.take_serial();
    let mut tcp = connector.take_stream();

    serial.write_all(b"\xfd\x09heartbeat").await.unwrap();
    let mut up = [0u8; 11];
    tcp.read_exact(&mut up).await.unwrap();
    assert_eq!(&up, b"\xfd\x09heartbeat");

    tcp.write_all(b"command_long").await.unwrap();
    let mut down = [0u8; 12];
    serial.read_exact(&mut down).await.unwrap();
    assert_eq!(&down, b"command_long");
    session.shutdown().await;
}

#[tokio::test]
async fn permission_grant_proceeds_to_ready() {
    let provider = MockProvider::with_device(Permission::Denied);
    let connector = Arc::new(MockConnector::default());
    let session = start(&provider, &connector, config(38740));

    session.connect();
    wait_status(&session, |s| s.state == SessionState::PermissionPending).await;
    assert_eq!(provider.permission_requests.load(Ordering::SeqCst), 1);

    session.connect();
    let status = wait_status(&session, message_is("connection attempt in progress")).await;
    assert_eq!(status.state, SessionState::PermissionPending);

    session.grant();
    wait_status(&session, |s| s.state == SessionState::Ready).await;
    session.shutdown().await;
}

#[tokio::test]
async fn permission_denied_returns_to_idle() {
    let provider = MockProvider::with_device(Permission::Unknown);
    let connector = Arc::new(MockConnector::default());
    let session = start(&provider, &connector, config(38750));

    session.connect();
    wait_status(&session, |s| s.state == SessionState::PermissionPending).await;
    session.deny();
    let status = wait_status(&session, message_is("permission denied")).await;
    assert_eq!(status.state, SessionState::Idle);
    assert_eq!(connector.connects(), 0);

    session.grant();
    wait_status(&session, message_is("no pending permission request")).await;
    assert_eq!(session.status().state, SessionState::Idle);
    session.shutdown().await;
}

#[tokio::test]
async fn unanswered_permission_request_times_out() {
    let provider = MockProvider::with_device(Permission::Denied);
    let connector = Arc::new(MockConnector::default());
    let mut cfg = config(38760);
    cfg.bridge.permission_timeout_ms = Some(100);
    let session = start(&provider, &connector, cfg);

    session.connect();
    let status = wait_status(&session, message_is("permission request timed out")).await;
    assert_eq!(status.state, SessionState::Idle);
    session.shutdown().await;
}

#[tokio::test]
async fn serial_failure_tears_down_everything() {
    let provider = MockProvider::with_device(Permission::Granted);
    let connector = Arc::new(MockConnector::default());
    let session = start(&provider, &connector, config(38770));

    session.connect();
    wait_status(&session, |s| s.state == SessionState::Ready).await;
    let live = session.live().unwrap();
    live.telemetry.get(tether_proto::TelemetryChannel::Position);
    let remote = connector.remote();
    let mut tcp = connector.take_stream();

    // device unplugged
    drop(provider.take_serial());

    let status = wait_status(&session, |s| s.state == SessionState::Idle).await;
    assert!(status.message.unwrap().starts_with("serial link error"));
    assert_eq!(status.next_port, 38771);
    assert!(session.live().is_none());
    assert!(remote.closed.load(Ordering::SeqCst));
    assert!(live.telemetry.is_empty());

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), tcp.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    session.shutdown().await;
}

#[tokio::test]
async fn network_failure_tears_down_and_next_session_uses_next_port() {
    let provider = MockProvider::with_device(Permission::Granted);
    let connector = Arc::new(MockConnector::default());
    let session = start(&provider, &connector, config(38780));

    session.connect();
    wait_status(&session, |s| s.state == SessionState::Ready).await;
    let mut serial = provider.take_serial();

    drop(connector.take_stream());

    let status = wait_status(&session, |s| s.state == SessionState::Idle).await;
    assert!(status.message.unwrap().starts_with("tcp link error"));
    let mut buf = [0u8; 1];
    assert_eq!(serial.read(&mut buf).await.unwrap(), 0);

    session.connect();
    let status = wait_status(&session, |s| s.state == SessionState::Ready).await;
    assert_eq!(status.port, Some(38781));
    assert_eq!(
        connector.addresses.lock().unwrap().as_slice(),
        ["tcp://:38780", "tcp://:38781"]
    );
    session.shutdown().await;
}

#[tokio::test]
async fn disconnect_releases_the_session() {
    let provider = MockProvider::with_device(Permission::Granted);
    let connector = Arc::new(MockConnector::default());
    let session = start(&provider, &connector, config(38790));

    session.disconnect();
    wait_status(&session, message_is("no active connection")).await;

    session.connect();
    wait_status(&session, |s| s.state == SessionState::Ready).await;
    session.disconnect();
    let status = wait_status(&session, message_is("disconnected")).await;
    assert_eq!(status.state, SessionState::Idle);
    assert_eq!(status.port, None);
    assert_eq!(status.next_port, 38791);
    assert!(connector.remote().closed.load(Ordering::SeqCst));
    session.shutdown().await;
}

#[tokio::test]
async fn open_failure_reports_and_stays_idle() {
    let provider = MockProvider::with_device(Permission::Granted);
    provider.fail_open.store(true, Ordering::SeqCst);
    let connector = Arc::new(MockConnector::default());
    let session = start(&provider, &connector, config(38800));

    session.connect();
    let status = wait_status(&session, |s| s.state == SessionState::Idle && s.message.is_some()).await;
    assert_eq!(status.message.as_deref(), Some("permission denied for /dev/ttyMOCK0"));
    // nothing was bound
    assert_eq!(status.next_port, 38800);
    session.shutdown().await;
}

#[tokio::test]
async fn endpoint_failure_skips_the_bound_port() {
    let provider = MockProvider::with_device(Permission::Granted);
    let connector = Arc::new(MockConnector::default());
    connector.fail.store(true, Ordering::SeqCst);
    let session = start(&provider, &connector, config(38810));

    session.connect();
    let status = wait_status(&session, |s| s.state == SessionState::Idle && s.message.is_some()).await;
    assert_eq!(status.message.as_deref(), Some("endpoint: CONNECTION_ERROR"));
    assert_eq!(status.next_port, 38811);

    connector.fail.store(false, Ordering::SeqCst);
    session.connect();
    let status = wait_status(&session, |s| s.state == SessionState::Ready).await;
    assert_eq!(status.port, Some(38811));
    session.shutdown().await;
}

#[tokio::test]
async fn shutdown_tears_down_a_live_session() {
    let provider = MockProvider::with_device(Permission::Granted);
    let connector = Arc::new(MockConnector::default());
    let session = start(&provider, &connector, config(38820));

    session.connect();
    wait_status(&session, |s| s.state == SessionState::Ready).await;
    session.shutdown().await;

    assert!(session.live().is_none());
    assert!(connector.remote().closed.load(Ordering::SeqCst));
    assert_eq!(session.status().state, SessionState::Idle);
}
