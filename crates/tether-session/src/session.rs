//! Session lifecycle actor.
//!
//! The actor task is the only writer of session state. Operators talk to it
//! through `SessionHandle`; bridge workers report run errors on a channel the
//! actor drains, so a failing link is torn down exactly once.

use serde::Deserialize;
use std::fmt;
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use tether_fc::{Connector, RemoteError, RemoteSystem};
use tether_link::{
    Bridge, DeviceHandle, DeviceProvider, LinkConfig, LinkError, NetworkEndpoint, Permission, RunError,
};
use tether_proto::TelemetryChannel;

use crate::telemetry::{TelemetryCache, TelemetryConfig, TelemetryStream};

pub const DEFAULT_INITIAL_PORT: u16 = 8888;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    /// First local TCP port; every teardown moves to the next one.
    pub initial_port: Option<u16>,

    /// Wait for the endpoint to attach to the local port.
    pub startup_timeout_ms: Option<u64>,

    /// Wait for an operator grant/deny after a permission request.
    pub permission_timeout_ms: Option<u64>,
}

impl BridgeConfig {
    pub fn initial_port(&self) -> u16 {
        self.initial_port.unwrap_or(DEFAULT_INITIAL_PORT)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms.unwrap_or(10_000))
    }

    pub fn permission_timeout(&self) -> Duration {
        Duration::from_millis(self.permission_timeout_ms.unwrap_or(60_000))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub bridge: BridgeConfig,
    pub link: LinkConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Scanning,
    PermissionPending,
    Opening,
    Bridging,
    EndpointStarting,
    Ready,
    Disconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Scanning => "scanning",
            SessionState::PermissionPending => "permission pending",
            SessionState::Opening => "opening",
            SessionState::Bridging => "bridging",
            SessionState::EndpointStarting => "endpoint starting",
            SessionState::Ready => "ready",
            SessionState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Local port of the live session.
    pub port: Option<u16>,
    /// Port the next connection attempt will bind.
    pub next_port: u16,
    pub device: Option<String>,
    /// Last short user-facing message.
    pub message: Option<String>,
}

/// Everything that belongs to a `Ready` session and is shared with callers.
#[derive(Clone)]
pub struct LiveLink {
    pub session: u64,
    pub port: u16,
    pub device: DeviceHandle,
    pub remote: Arc<dyn RemoteSystem>,
    pub telemetry: Arc<TelemetryCache>,
}

impl fmt::Debug for LiveLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveLink")
            .field("session", &self.session)
            .field("port", &self.port)
            .field("device", &self.device.id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum Request {
    Connect,
    Disconnect,
    Grant,
    Deny,
    Shutdown(oneshot::Sender<()>),
}

/// Cheap, cloneable front of the session actor.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Request>,
    status: watch::Receiver<SessionStatus>,
    live: watch::Receiver<Option<LiveLink>>,
}

impl SessionHandle {
    pub fn connect(&self) {
        self.request(Request::Connect);
    }

    pub fn disconnect(&self) {
        self.request(Request::Disconnect);
    }

    pub fn grant(&self) {
        self.request(Request::Grant);
    }

    pub fn deny(&self) {
        self.request(Request::Deny);
    }

    /// Tear down any live session and stop the actor.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Request::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    fn request(&self, req: Request) {
        if self.tx.send(req).is_err() {
            warn!("session: actor is gone");
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// The live session, present only while `Ready`.
    pub fn live(&self) -> Option<LiveLink> {
        self.live.borrow().clone()
    }

    pub fn watch_live(&self) -> watch::Receiver<Option<LiveLink>> {
        self.live.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.live.borrow().is_some()
    }

    /// Shared telemetry pipeline of the live session.
    pub fn telemetry(&self, channel: TelemetryChannel) -> Option<Arc<TelemetryStream>> {
        self.live().map(|live| live.telemetry.get(channel))
    }
}

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("endpoint: {0}")]
    Remote(#[from] RemoteError),
    #[error("endpoint did not attach within {0:?}")]
    Timeout(Duration),
}

struct PendingPermission {
    device: DeviceHandle,
    deadline: Instant,
}

struct Live {
    link: LiveLink,
    bridge: Bridge,
}

struct Actor {
    provider: Arc<dyn DeviceProvider>,
    connector: Arc<dyn Connector>,
    cfg: SessionConfig,
    requests: mpsc::UnboundedReceiver<Request>,
    errors_tx: mpsc::UnboundedSender<RunError>,
    errors: mpsc::UnboundedReceiver<RunError>,
    status: watch::Sender<SessionStatus>,
    live_tx: watch::Sender<Option<LiveLink>>,
    next_port: u16,
    next_session: u64,
    pending: Option<PendingPermission>,
    live: Option<Live>,
}

/// Start the session actor on the current runtime.
pub fn spawn(
    provider: Arc<dyn DeviceProvider>,
    connector: Arc<dyn Connector>,
    cfg: SessionConfig,
) -> SessionHandle {
    let next_port = cfg.bridge.initial_port();
    let (tx, requests) = mpsc::unbounded_channel();
    let (errors_tx, errors) = mpsc::unbounded_channel();
    let (status, status_rx) = watch::channel(SessionStatus {
        state: SessionState::Idle,
        port: None,
        next_port,
        device: None,
        message: None,
    });
    let (live_tx, live_rx) = watch::channel(None);

    let actor = Actor {
        provider,
        connector,
        cfg,
        requests,
        errors_tx,
        errors,
        status,
        live_tx,
        next_port,
        next_session: 1,
        pending: None,
        live: None,
    };
    tokio::spawn(actor.run());

    SessionHandle { tx, status: status_rx, live: live_rx }
}

impl Actor {
    async fn run(mut self) {
        loop {
            let deadline = self.pending.as_ref().map(|p| p.deadline);
            let permission_expired = async move {
                match deadline {
                    Some(d) => sleep_until(d).await,
                    None => future::pending().await,
                }
            };

            tokio::select! {
                req = self.requests.recv() => match req {
                    Some(Request::Shutdown(done)) => {
                        self.teardown("shut down").await;
                        let _ = done.send(());
                        break;
                    }
                    Some(req) => self.handle(req).await,
                    None => {
                        self.teardown("shut down").await;
                        break;
                    }
                },
                Some(err) = self.errors.recv() => self.on_run_error(err).await,
                _ = permission_expired => {
                    if let Some(p) = self.pending.take() {
                        warn!("session: permission request for {} timed out", p.device.id);
                        self.set(SessionState::Idle, "permission request timed out");
                    }
                }
            }
        }
        debug!("session: actor stopped");
    }

    fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    fn set(&self, state: SessionState, message: impl Into<String>) {
        let message = message.into();
        info!("session: {} ({})", state, message);
        self.status.send_modify(|s| {
            s.state = state;
            s.message = Some(message);
            s.next_port = self.next_port;
            if state == SessionState::Idle {
                s.port = None;
                s.device = None;
            }
        });
    }

    fn enter(&self, state: SessionState) {
        debug!("session: -> {}", state);
        self.status.send_modify(|s| s.state = state);
    }

    /// Report without changing state.
    fn say(&self, message: &str) {
        info!("session: {}", message);
        self.status.send_modify(|s| s.message = Some(message.to_string()));
    }

    async fn handle(&mut self, req: Request) {
        match req {
            Request::Connect => match self.state() {
                SessionState::Idle => self.connect().await,
                SessionState::Ready => self.say("connection already exists"),
                _ => self.say("connection attempt in progress"),
            },
            Request::Disconnect => {
                if self.live.is_some() {
                    self.teardown("disconnected").await;
                } else if self.pending.take().is_some() {
                    self.set(SessionState::Idle, "permission request cancelled");
                } else {
                    self.say("no active connection");
                }
            }
            Request::Grant => match self.pending.take() {
                Some(p) => {
                    let mut device = p.device;
                    device.permission = Permission::Granted;
                    self.open(device).await;
                }
                None => self.say("no pending permission request"),
            },
            Request::Deny => match self.pending.take() {
                Some(p) => {
                    warn!("session: permission for {} denied", p.device.id);
                    self.set(SessionState::Idle, "permission denied");
                }
                None => self.say("no pending permission request"),
            },
            Request::Shutdown(_) => {}
        }
    }

    async fn connect(&mut self) {
        self.enter(SessionState::Scanning);
        let provider = self.provider.clone();
        let scanned = tokio::task::spawn_blocking(move || provider.scan()).await;
        let devices = match scanned {
            Ok(Ok(devices)) => devices,
            Ok(Err(e)) => {
                warn!("session: device scan failed: {:#}", e);
                return self.set(SessionState::Idle, format!("device scan failed: {:#}", e));
            }
            Err(e) => {
                warn!("session: device scan aborted: {}", e);
                return self.set(SessionState::Idle, "device scan failed");
            }
        };

        let Some(device) = devices.into_iter().next() else {
            return self.set(SessionState::Idle, "device not found");
        };
        self.status.send_modify(|s| s.device = Some(device.id.clone()));

        if device.permission == Permission::Granted {
            return self.open(device).await;
        }

        self.provider.request_permission(&device);
        let message = format!("permission requested for {}", device.id);
        self.pending = Some(PendingPermission {
            device,
            deadline: Instant::now() + self.cfg.bridge.permission_timeout(),
        });
        self.set(SessionState::PermissionPending, message);
    }

    async fn open(&mut self, device: DeviceHandle) {
        self.enter(SessionState::Opening);
        let serial = match self.provider.open(&device) {
            Ok(serial) => serial,
            Err(e) => {
                warn!("session: {}", e);
                return self.set(SessionState::Idle, e.to_string());
            }
        };

        self.enter(SessionState::Bridging);
        let port = self.next_port;
        let endpoint = match NetworkEndpoint::bind(port).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!("session: {}", e);
                self.advance_port(port);
                return self.set(SessionState::Idle, e.to_string());
            }
        };

        self.enter(SessionState::EndpointStarting);
        self.status.send_modify(|s| s.port = Some(port));
        let address = endpoint.address();
        let startup = self.cfg.bridge.startup_timeout();
        let connector = self.connector.clone();
        let attach = async {
            tokio::try_join!(
                async { endpoint.accept().await.map_err(StartupError::from) },
                async { connector.connect(&address).await.map_err(StartupError::from) },
            )
        };
        let started = match timeout(startup, attach).await {
            Ok(r) => r,
            Err(_) => Err(StartupError::Timeout(startup)),
        };

        // the listener was bound: whatever happens next, do not reuse this port
        self.advance_port(port);

        let (stream, remote) = match started {
            Ok(pair) => pair,
            Err(e) => {
                warn!("session: startup on port {} failed: {}", port, e);
                return self.set(SessionState::Idle, e.to_string());
            }
        };

        let session = self.next_session;
        self.next_session += 1;
        let bridge = Bridge::start(session, serial, stream, self.cfg.link, self.errors_tx.clone());
        let telemetry = Arc::new(TelemetryCache::new(remote.clone(), self.cfg.telemetry.clone()));
        // mission origin comes from the latest position, so it is cached from the start
        telemetry.get(TelemetryChannel::Position);
        let link = LiveLink { session, port, device, remote, telemetry };

        self.live_tx.send_replace(Some(link.clone()));
        self.live = Some(Live { link, bridge });
        self.set(SessionState::Ready, format!("connected on {}", address));
    }

    fn advance_port(&mut self, used: u16) {
        self.next_port = used.checked_add(1).unwrap_or_else(|| self.cfg.bridge.initial_port());
        let next_port = self.next_port;
        self.status.send_modify(|s| s.next_port = next_port);
    }

    async fn on_run_error(&mut self, err: RunError) {
        let current = self.live.as_ref().map(|l| l.link.session);
        if current != Some(err.session) {
            debug!("session: ignoring run error from stale session {}", err.session);
            return;
        }
        warn!("session: {} link failed: {}", err.side, err.error);
        self.teardown(format!("{} link error: {}", err.side, err.error)).await;
    }

    async fn teardown(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Some(pending) = self.pending.take() {
            debug!("session: dropping permission request for {}", pending.device.id);
        }
        if let Some(live) = self.live.take() {
            self.enter(SessionState::Disconnecting);
            self.live_tx.send_replace(None);
            live.link.telemetry.invalidate();
            live.bridge.stop().await;
            live.link.remote.close().await;
            info!("session: {} released port {}", live.link.session, live.link.port);
        }
        self.set(SessionState::Idle, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_config_defaults() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.initial_port(), 8888);
        assert_eq!(cfg.startup_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.permission_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn states_render_for_status_lines() {
        assert_eq!(SessionState::PermissionPending.to_string(), "permission pending");
        assert_eq!(SessionState::Ready.to_string(), "ready");
    }
}
