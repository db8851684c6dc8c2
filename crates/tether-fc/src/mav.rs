use anyhow::{Context, Result};
use async_trait::async_trait;
use mavlink::{
    common::{
        MavAutopilot, MavCmd, MavFrame, MavMessage, MavMissionResult, MavMissionType, MavModeFlag,
        MavResult, MavState, MavType, COMMAND_LONG_DATA, HEARTBEAT_DATA, MISSION_CLEAR_ALL_DATA,
        MISSION_COUNT_DATA, MISSION_ITEM_INT_DATA,
    },
    error::MessageReadError,
    MavConnection, MavHeader, MavlinkVersion,
};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use tether_proto::{Command, Feed, Frame, GeoPoint, MissionItem, MissionType, TelemetryValue};

use crate::decode::VehicleState;
use crate::{Connector, FcConfig, FcSettings, RemoteError, RemoteErrorCode, RemoteSystem};

type Conn = Box<dyn MavConnection<MavMessage> + Send + Sync>;

const FEED_CAPACITY: usize = 64;
const INBOX_CAPACITY: usize = 256;

/// Forced disarm magic for MAV_CMD_COMPONENT_ARM_DISARM param2.
const FORCE_DISARM: f32 = 21196.0;

/// Map `tcp://host:port` (host may be empty) to the mavlink crate's client URL.
pub fn tcpout_url(address: &str) -> Option<String> {
    let rest = address.strip_prefix("tcp://")?;
    let (host, port) = rest.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let host = if host.is_empty() { "127.0.0.1" } else { host };
    Some(format!("tcpout:{}:{}", host, port))
}

struct Inner {
    conn: Conn,
    settings: FcSettings,
    sequence: AtomicU8,
    target_sys: AtomicU8,
    closed: AtomicBool,
    state: Mutex<VehicleState>,
    inbox: broadcast::Sender<MavMessage>,
    feeds: HashMap<Feed, broadcast::Sender<TelemetryValue>>,
    // one command or mission transaction on the wire at a time
    exchange: tokio::sync::Mutex<()>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, VehicleState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn target(&self) -> (u8, u8) {
        (self.target_sys.load(Ordering::Relaxed), self.settings.target_comp)
    }

    fn send(&self, msg: &MavMessage) -> Result<(), RemoteError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(RemoteErrorCode::ConnectionError.into());
        }
        let hdr = MavHeader {
            system_id: self.settings.sys_id,
            component_id: self.settings.comp_id,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        self.conn.send(&hdr, msg).map(|_| ()).map_err(|e| {
            warn!("mav: send failed: {}", e);
            RemoteErrorCode::ConnectionError.into()
        })
    }

    fn publish(&self, value: TelemetryValue) {
        if let Some(tx) = value.feed().and_then(|feed| self.feeds.get(&feed)) {
            // no subscribers is fine
            let _ = tx.send(value);
        }
    }

    fn dispatch(&self, hdr: &MavHeader, msg: MavMessage) {
        let values = {
            let mut st = self.state();
            let values = st.update(hdr, &msg);
            if let Some(id) = st.system_id {
                self.target_sys.store(id, Ordering::Relaxed);
            }
            values
        };
        for v in values {
            self.publish(v);
        }
        let _ = self.inbox.send(msg);
    }

    fn read_loop(&self) {
        while !self.closed.load(Ordering::Relaxed) {
            match self.conn.recv() {
                Ok((hdr, msg)) => self.dispatch(&hdr, msg),
                Err(MessageReadError::Io(e))
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) => {}
                Err(MessageReadError::Io(e)) => {
                    info!("mav: link closed: {}", e);
                    break;
                }
                Err(e) => debug!("mav: dropped frame: {}", e),
            }
        }
        self.closed.store(true, Ordering::Relaxed);
        let was_connected = std::mem::replace(&mut self.state().connected, false);
        if was_connected {
            self.publish(TelemetryValue::ConnectionState(false));
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.settings.heartbeat_interval);
        loop {
            tick.tick().await;
            if self.closed.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = self.send(&gcs_heartbeat()) {
                debug!("mav: heartbeat not sent: {}", e);
            }
            let lost = self.state().check_timeout(self.settings.heartbeat_timeout);
            if let Some(v) = lost {
                warn!("mav: vehicle heartbeat lost");
                self.publish(v);
            }
        }
    }

    async fn recv(&self, inbox: &mut broadcast::Receiver<MavMessage>) -> Result<MavMessage, RemoteError> {
        loop {
            match inbox.recv().await {
                Ok(msg) => return Ok(msg),
                Err(RecvError::Lagged(n)) => debug!("mav: inbox lagged by {}", n),
                Err(RecvError::Closed) => return Err(RemoteErrorCode::ConnectionError.into()),
            }
        }
    }
}

fn gcs_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_GCS,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

fn command_result(result: MavResult) -> Result<(), RemoteError> {
    let code = match result {
        MavResult::MAV_RESULT_ACCEPTED => return Ok(()),
        MavResult::MAV_RESULT_TEMPORARILY_REJECTED => RemoteErrorCode::TemporarilyRejected,
        MavResult::MAV_RESULT_DENIED => RemoteErrorCode::Denied,
        MavResult::MAV_RESULT_UNSUPPORTED => RemoteErrorCode::Unsupported,
        MavResult::MAV_RESULT_FAILED => RemoteErrorCode::Failed,
        MavResult::MAV_RESULT_CANCELLED => RemoteErrorCode::Cancelled,
        _ => RemoteErrorCode::Unknown,
    };
    Err(code.into())
}

fn mission_result(result: MavMissionResult) -> Result<(), RemoteError> {
    let code = match result {
        MavMissionResult::MAV_MISSION_ACCEPTED => return Ok(()),
        MavMissionResult::MAV_MISSION_DENIED => RemoteErrorCode::Denied,
        MavMissionResult::MAV_MISSION_NO_SPACE => RemoteErrorCode::TooManyItems,
        MavMissionResult::MAV_MISSION_INVALID_SEQUENCE => RemoteErrorCode::InvalidSequence,
        MavMissionResult::MAV_MISSION_UNSUPPORTED
        | MavMissionResult::MAV_MISSION_UNSUPPORTED_FRAME => RemoteErrorCode::Unsupported,
        MavMissionResult::MAV_MISSION_OPERATION_CANCELLED => RemoteErrorCode::Cancelled,
        _ => RemoteErrorCode::Failed,
    };
    Err(code.into())
}

fn mav_frame(frame: Frame) -> MavFrame {
    match frame {
        Frame::Global => MavFrame::MAV_FRAME_GLOBAL,
        Frame::Mission => MavFrame::MAV_FRAME_MISSION,
        Frame::GlobalRelativeAlt => MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT,
    }
}

fn mav_cmd(command: Command) -> MavCmd {
    match command {
        Command::NavWaypoint => MavCmd::MAV_CMD_NAV_WAYPOINT,
        Command::NavReturnToLaunch => MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH,
        Command::NavTakeoff => MavCmd::MAV_CMD_NAV_TAKEOFF,
        Command::DoChangeSpeed => MavCmd::MAV_CMD_DO_CHANGE_SPEED,
        Command::NavFencePolygonVertexInclusion => MavCmd::MAV_CMD_NAV_FENCE_POLYGON_VERTEX_INCLUSION,
    }
}

fn mav_mission_type(kind: MissionType) -> MavMissionType {
    match kind {
        MissionType::Mission => MavMissionType::MAV_MISSION_TYPE_MISSION,
        MissionType::Fence => MavMissionType::MAV_MISSION_TYPE_FENCE,
    }
}

fn item_int(item: &MissionItem, target: (u8, u8)) -> MISSION_ITEM_INT_DATA {
    MISSION_ITEM_INT_DATA {
        param1: item.param1,
        param2: item.param2,
        param3: item.param3,
        param4: item.param4,
        x: item.x,
        y: item.y,
        z: item.z,
        seq: item.seq,
        command: mav_cmd(item.command),
        target_system: target.0,
        target_component: target.1,
        frame: mav_frame(item.frame),
        current: item.current as u8,
        autocontinue: item.autocontinue as u8,
        mission_type: mav_mission_type(item.mission_type),
    }
}

/// Vehicle endpoint speaking MAVLink over the bridge's local TCP side.
pub struct MavlinkSystem {
    inner: Arc<Inner>,
    heartbeat: JoinHandle<()>,
}

impl MavlinkSystem {
    /// Blocking connect to a `tcpout:` URL.
    pub fn dial(url: &str) -> Result<Conn> {
        let mut conn = mavlink::connect::<MavMessage>(url)
            .with_context(|| format!("mavlink connect {}", url))?;
        conn.set_protocol_version(MavlinkVersion::V2);
        Ok(conn)
    }

    /// Start the reader and heartbeat tasks over an established connection.
    pub fn start(conn: Conn, settings: FcSettings) -> Self {
        let (inbox, _) = broadcast::channel(INBOX_CAPACITY);
        let feeds = Feed::ALL
            .iter()
            .map(|&feed| (feed, broadcast::channel(FEED_CAPACITY).0))
            .collect();

        let inner = Arc::new(Inner {
            conn,
            settings,
            sequence: AtomicU8::new(0),
            target_sys: AtomicU8::new(settings.target_sys),
            closed: AtomicBool::new(false),
            state: Mutex::new(VehicleState::default()),
            inbox,
            feeds,
            exchange: tokio::sync::Mutex::new(()),
        });

        let reader = inner.clone();
        tokio::task::spawn_blocking(move || reader.read_loop());
        let heartbeat = tokio::spawn(inner.clone().heartbeat_loop());

        info!(
            "mav: endpoint up as {}/{} (target {}/{})",
            settings.sys_id, settings.comp_id, settings.target_sys, settings.target_comp
        );
        Self { inner, heartbeat }
    }

    pub fn state(&self) -> VehicleState {
        self.inner.state().clone()
    }

    async fn command(&self, target_comp: u8, cmd: MavCmd, params: [f32; 7]) -> Result<(), RemoteError> {
        let inner = &self.inner;
        let _exchange = inner.exchange.lock().await;
        let mut inbox = inner.inbox.subscribe();
        let s = inner.settings;

        for attempt in 0..s.retries {
            let msg = MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
                target_system: inner.target().0,
                target_component: target_comp,
                command: cmd,
                confirmation: attempt.min(u8::MAX as u32) as u8,
                param1: params[0],
                param2: params[1],
                param3: params[2],
                param4: params[3],
                param5: params[4],
                param6: params[5],
                param7: params[6],
            });
            debug!("mav: {:?} attempt {}", cmd, attempt + 1);
            inner.send(&msg)?;

            let mut deadline = Instant::now() + s.ack_timeout;
            loop {
                let msg = match timeout_at(deadline, inner.recv(&mut inbox)).await {
                    Err(_) => break,
                    Ok(msg) => msg?,
                };
                let MavMessage::COMMAND_ACK(ack) = msg else { continue };
                if ack.command != cmd {
                    continue;
                }
                if ack.result == MavResult::MAV_RESULT_IN_PROGRESS {
                    deadline = Instant::now() + s.ack_timeout;
                    continue;
                }
                return command_result(ack.result);
            }
        }
        warn!("mav: {:?} not acknowledged after {} attempt(s)", cmd, s.retries);
        Err(RemoteErrorCode::Timeout.into())
    }

    /// Mission protocol upload: COUNT, then one ITEM_INT per request, until ACK.
    async fn transfer(&self, items: Vec<MissionItem>, kind: MissionType) -> Result<(), RemoteError> {
        if items.is_empty() {
            return Err(RemoteErrorCode::InvalidArgument.into());
        }
        let count = u16::try_from(items.len()).map_err(|_| RemoteError::new(RemoteErrorCode::TooManyItems))?;

        let inner = &self.inner;
        let _exchange = inner.exchange.lock().await;
        let mut inbox = inner.inbox.subscribe();
        let s = inner.settings;
        let target = inner.target();

        let mut last_sent = MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
            count,
            target_system: target.0,
            target_component: target.1,
            mission_type: mav_mission_type(kind),
            ..Default::default()
        });
        inner.send(&last_sent)?;
        let mut retries_left = s.retries - 1;

        loop {
            let msg = match timeout(s.ack_timeout, inner.recv(&mut inbox)).await {
                Err(_) if retries_left == 0 => {
                    warn!("mav: {:?} upload stalled", kind);
                    return Err(RemoteErrorCode::Timeout.into());
                }
                Err(_) => {
                    retries_left -= 1;
                    inner.send(&last_sent)?;
                    continue;
                }
                Ok(msg) => msg?,
            };
            let seq = match msg {
                MavMessage::MISSION_REQUEST_INT(r) => r.seq,
                MavMessage::MISSION_REQUEST(r) => r.seq,
                MavMessage::MISSION_ACK(ack) => {
                    let result = mission_result(ack.mavtype);
                    if result.is_ok() {
                        info!("mav: {:?} upload accepted ({} items)", kind, count);
                        if kind == MissionType::Mission {
                            inner.state().mission_total = count as i32;
                        }
                    }
                    return result;
                }
                _ => continue,
            };
            let item = items
                .get(seq as usize)
                .ok_or(RemoteError::new(RemoteErrorCode::InvalidSequence))?;
            last_sent = MavMessage::MISSION_ITEM_INT(item_int(item, target));
            inner.send(&last_sent)?;
            retries_left = s.retries - 1;
        }
    }

    async fn clear(&self, kind: MissionType) -> Result<(), RemoteError> {
        let inner = &self.inner;
        let _exchange = inner.exchange.lock().await;
        let mut inbox = inner.inbox.subscribe();
        let s = inner.settings;
        let target = inner.target();
        let msg = MavMessage::MISSION_CLEAR_ALL(MISSION_CLEAR_ALL_DATA {
            target_system: target.0,
            target_component: target.1,
            mission_type: mav_mission_type(kind),
            ..Default::default()
        });

        for _ in 0..s.retries {
            inner.send(&msg)?;
            let deadline = Instant::now() + s.ack_timeout;
            loop {
                match timeout_at(deadline, inner.recv(&mut inbox)).await {
                    Err(_) => break,
                    Ok(msg) => {
                        if let MavMessage::MISSION_ACK(ack) = msg? {
                            let result = mission_result(ack.mavtype);
                            if result.is_ok() && kind == MissionType::Mission {
                                inner.state().mission_total = 0;
                            }
                            return result;
                        }
                    }
                }
            }
        }
        Err(RemoteErrorCode::Timeout.into())
    }
}

impl Drop for MavlinkSystem {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        self.heartbeat.abort();
    }
}

#[async_trait]
impl RemoteSystem for MavlinkSystem {
    async fn arm(&self) -> Result<(), RemoteError> {
        let comp = self.inner.settings.target_comp;
        self.command(comp, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
            .await
    }

    async fn takeoff(&self, alt_m: f32) -> Result<(), RemoteError> {
        // param7 is AMSL; derive it from the home altitude implied by the last fix
        let amsl = self
            .inner
            .state()
            .position
            .map(|p| p.abs_alt_m - p.rel_alt_m + alt_m)
            .unwrap_or(f32::NAN);
        let comp = self.inner.settings.target_comp;
        self.command(
            comp,
            MavCmd::MAV_CMD_NAV_TAKEOFF,
            [f32::NAN, 0.0, 0.0, f32::NAN, f32::NAN, f32::NAN, amsl],
        )
        .await
    }

    async fn kill(&self) -> Result<(), RemoteError> {
        let comp = self.inner.settings.target_comp;
        self.command(
            comp,
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            [0.0, FORCE_DISARM, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
        .await
    }

    async fn land(&self) -> Result<(), RemoteError> {
        let comp = self.inner.settings.target_comp;
        self.command(
            comp,
            MavCmd::MAV_CMD_NAV_LAND,
            [0.0, 0.0, 0.0, f32::NAN, f32::NAN, f32::NAN, f32::NAN],
        )
        .await
    }

    async fn return_to_launch(&self) -> Result<(), RemoteError> {
        let comp = self.inner.settings.target_comp;
        self.command(comp, MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH, [0.0; 7]).await
    }

    async fn upload_mission(&self, items: Vec<MissionItem>) -> Result<(), RemoteError> {
        self.transfer(items, MissionType::Mission).await
    }

    async fn start_mission(&self) -> Result<(), RemoteError> {
        let comp = self.inner.settings.target_comp;
        self.command(comp, MavCmd::MAV_CMD_MISSION_START, [0.0; 7]).await
    }

    async fn pause_mission(&self) -> Result<(), RemoteError> {
        let comp = self.inner.settings.target_comp;
        // param1 = 0: pause (hold position)
        self.command(comp, MavCmd::MAV_CMD_DO_PAUSE_CONTINUE, [0.0; 7]).await
    }

    async fn clear_mission(&self) -> Result<(), RemoteError> {
        self.clear(MissionType::Mission).await
    }

    async fn take_photo(&self) -> Result<(), RemoteError> {
        let comp = self.inner.settings.camera_comp;
        // all cameras, single image
        self.command(comp, MavCmd::MAV_CMD_IMAGE_START_CAPTURE, [0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0])
            .await
    }

    async fn upload_geofence(&self, polygon: Vec<GeoPoint>) -> Result<(), RemoteError> {
        let items = tether_mission::fence_items(&polygon)
            .map_err(|_| RemoteError::new(RemoteErrorCode::InvalidArgument))?;
        self.transfer(items, MissionType::Fence).await
    }

    async fn clear_geofence(&self) -> Result<(), RemoteError> {
        self.clear(MissionType::Fence).await
    }

    fn subscribe(&self, feed: Feed) -> broadcast::Receiver<TelemetryValue> {
        match self.inner.feeds.get(&feed) {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        self.heartbeat.abort();
        info!("mav: endpoint closed");
    }
}

/// Connects a `MavlinkSystem` to the bridge's local address.
pub struct MavlinkConnector {
    settings: FcSettings,
}

impl MavlinkConnector {
    pub fn new(cfg: &FcConfig) -> Self {
        Self { settings: cfg.settings() }
    }
}

#[async_trait]
impl Connector for MavlinkConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn RemoteSystem>, RemoteError> {
        let url = tcpout_url(address).ok_or(RemoteError::new(RemoteErrorCode::InvalidArgument))?;
        let dial_url = url.clone();
        let conn = tokio::task::spawn_blocking(move || MavlinkSystem::dial(&dial_url))
            .await
            .map_err(|_| RemoteError::new(RemoteErrorCode::ConnectionError))?
            .map_err(|e| {
                warn!("mav: {:#}", e);
                RemoteError::new(RemoteErrorCode::ConnectionError)
            })?;
        info!("mav: connected to {}", url);
        Ok(Arc::new(MavlinkSystem::start(conn, self.settings)))
    }
}
