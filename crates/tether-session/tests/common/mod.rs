#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Notify};

use tether_fc::{Connector, RemoteError, RemoteErrorCode, RemoteSystem};
use tether_link::{DeviceHandle, DeviceProvider, LinkConfig, LinkError, LinkIo, Permission};
use tether_proto::{Feed, GeoPoint, MissionItem, TelemetryValue};
use tether_session::{BridgeConfig, SessionConfig, SessionHandle, SessionStatus, TelemetryConfig};

#[derive(Default)]
pub struct MockProvider {
    pub devices: Mutex<Vec<DeviceHandle>>,
    pub permission_requests: AtomicUsize,
    pub fail_open: AtomicBool,
    /// Far ends of the serial ports handed out, newest last.
    pub serial: Mutex<Vec<DuplexStream>>,
}

impl MockProvider {
    pub fn with_device(permission: Permission) -> Arc<Self> {
        let provider = Self::default();
        provider.attach(permission);
        Arc::new(provider)
    }

    pub fn attach(&self, permission: Permission) {
        self.devices.lock().unwrap().push(DeviceHandle::new("/dev/ttyMOCK0", permission));
    }

    pub fn take_serial(&self) -> DuplexStream {
        self.serial.lock().unwrap().pop().expect("no serial port opened")
    }
}

impl DeviceProvider for MockProvider {
    fn scan(&self) -> anyhow::Result<Vec<DeviceHandle>> {
        Ok(self.devices.lock().unwrap().clone())
    }

    fn request_permission(&self, _device: &DeviceHandle) {
        self.permission_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn open(&self, device: &DeviceHandle) -> Result<Box<dyn LinkIo>, LinkError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(LinkError::PermissionDenied(device.id.clone()));
        }
        let (near, far) = duplex(4096);
        self.serial.lock().unwrap().push(far);
        Ok(Box::new(near))
    }
}

/// Vehicle stand-in: records calls, answers with a configurable result.
pub struct MockRemote {
    pub calls: Mutex<Vec<String>>,
    pub subscribes: Mutex<HashMap<Feed, usize>>,
    pub fail_with: Mutex<Option<RemoteErrorCode>>,
    pub closed: AtomicBool,
    pub mission: Mutex<Vec<MissionItem>>,
    pub fence: Mutex<Vec<GeoPoint>>,
    /// While set, `land` waits for `release` before answering.
    pub hold: AtomicBool,
    release: Notify,
    feeds: HashMap<Feed, broadcast::Sender<TelemetryValue>>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::default(),
            subscribes: Mutex::default(),
            fail_with: Mutex::default(),
            closed: AtomicBool::new(false),
            mission: Mutex::default(),
            fence: Mutex::default(),
            hold: AtomicBool::new(false),
            release: Notify::new(),
            feeds: Feed::ALL.iter().map(|&f| (f, broadcast::channel(64).0)).collect(),
        })
    }

    pub fn push(&self, value: TelemetryValue) {
        let _ = self.feeds[&value.feed().unwrap()].send(value);
    }

    pub fn subscribe_count(&self, feed: Feed) -> usize {
        self.subscribes.lock().unwrap().get(&feed).copied().unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_with(&self, code: RemoteErrorCode) {
        *self.fail_with.lock().unwrap() = Some(code);
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    fn answer(&self, call: impl Into<String>) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(call.into());
        match *self.fail_with.lock().unwrap() {
            Some(code) => Err(code.into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteSystem for MockRemote {
    async fn arm(&self) -> Result<(), RemoteError> {
        self.answer("arm")
    }

    async fn takeoff(&self, alt_m: f32) -> Result<(), RemoteError> {
        self.answer(format!("takeoff {}", alt_m))
    }

    async fn kill(&self) -> Result<(), RemoteError> {
        self.answer("kill")
    }

    async fn land(&self) -> Result<(), RemoteError> {
        if self.hold.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        self.answer("land")
    }

    async fn return_to_launch(&self) -> Result<(), RemoteError> {
        self.answer("rtl")
    }

    async fn upload_mission(&self, items: Vec<MissionItem>) -> Result<(), RemoteError> {
        *self.mission.lock().unwrap() = items;
        self.answer("upload_mission")
    }

    async fn start_mission(&self) -> Result<(), RemoteError> {
        self.answer("start_mission")
    }

    async fn pause_mission(&self) -> Result<(), RemoteError> {
        self.answer("pause_mission")
    }

    async fn clear_mission(&self) -> Result<(), RemoteError> {
        self.answer("clear_mission")
    }

    async fn take_photo(&self) -> Result<(), RemoteError> {
        self.answer("take_photo")
    }

    async fn upload_geofence(&self, polygon: Vec<GeoPoint>) -> Result<(), RemoteError> {
        *self.fence.lock().unwrap() = polygon;
        self.answer("upload_geofence")
    }

    fn subscribe(&self, feed: Feed) -> broadcast::Receiver<TelemetryValue> {
        *self.subscribes.lock().unwrap().entry(feed).or_insert(0) += 1;
        self.feeds[&feed].subscribe()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Attaches to the bridge's TCP side like a real endpoint would.
#[derive(Default)]
pub struct MockConnector {
    pub fail: AtomicBool,
    pub addresses: Mutex<Vec<String>>,
    pub remotes: Mutex<Vec<Arc<MockRemote>>>,
    /// Our end of each accepted TCP connection, newest last.
    pub streams: Mutex<Vec<TcpStream>>,
}

impl MockConnector {
    pub fn remote(&self) -> Arc<MockRemote> {
        self.remotes.lock().unwrap().last().cloned().expect("no endpoint connected")
    }

    pub fn take_stream(&self) -> TcpStream {
        self.streams.lock().unwrap().pop().expect("no endpoint connected")
    }

    pub fn connects(&self) -> usize {
        self.addresses.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn RemoteSystem>, RemoteError> {
        self.addresses.lock().unwrap().push(address.to_string());
        if self.fail.load(Ordering::SeqCst) {
            return Err(RemoteErrorCode::ConnectionError.into());
        }
        let port: u16 = address
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or(RemoteError::new(RemoteErrorCode::InvalidArgument))?;
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|_| RemoteError::new(RemoteErrorCode::ConnectionError))?;
        self.streams.lock().unwrap().push(stream);
        let remote = MockRemote::new();
        self.remotes.lock().unwrap().push(remote.clone());
        Ok(remote as Arc<dyn RemoteSystem>)
    }
}

pub fn config(initial_port: u16) -> SessionConfig {
    SessionConfig {
        bridge: BridgeConfig {
            initial_port: Some(initial_port),
            startup_timeout_ms: Some(2_000),
            permission_timeout_ms: Some(30_000),
        },
        link: LinkConfig {
            read_buffer_size: 256,
            write_buffer_size: 256,
            read_timeout: Duration::from_millis(20),
            write_timeout: Duration::from_millis(500),
        },
        telemetry: TelemetryConfig { sample_interval_ms: Some(20) },
    }
}

pub fn start(
    provider: &Arc<MockProvider>,
    connector: &Arc<MockConnector>,
    cfg: SessionConfig,
) -> SessionHandle {
    tether_session::spawn(provider.clone(), connector.clone(), cfg)
}

/// Wait until the status satisfies `pred`, failing the test after 5 s.
pub async fn wait_status(
    handle: &SessionHandle,
    pred: impl Fn(&SessionStatus) -> bool,
) -> SessionStatus {
    let mut rx = handle.watch_status();
    let wait = async {
        loop {
            {
                let status = rx.borrow_and_update();
                if pred(&status) {
                    return status.clone();
                }
            }
            rx.changed().await.expect("session actor stopped");
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for session status")
}

/// Poll `check` until it holds, failing the test after 5 s.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
