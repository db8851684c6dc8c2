//! Line-oriented operator console over a session and its command gateway.

use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{info, warn};

use tether_fc::MavlinkConnector;
use tether_link::SystemDevices;
use tether_proto::{GeoPoint, TelemetryChannel, TelemetryValue};
use tether_session::{CommandGateway, GatewayError, SessionConfig, SessionHandle, SessionStatus};

use crate::Config;

const HELP: &str = "\
session:   connect | disconnect | grant | deny | status
vehicle:   arm | takeoff [alt] | kill | land | rtl | photo
points:    wp <lat,lon> | wps | wpclear
mission:   upload | start | pause | clear
geofence:  fence | unfence
other:     outcome | watch <channel> | unwatch <channel> | help | quit";

#[derive(Debug, Clone, PartialEq)]
enum Input {
    Connect,
    Disconnect,
    Grant,
    Deny,
    Status,
    Arm,
    Takeoff(Option<f32>),
    Kill,
    Land,
    Rtl,
    AddPoint(GeoPoint),
    ListPoints,
    ClearPoints,
    Upload,
    Start,
    Pause,
    ClearMission,
    Photo,
    Fence,
    Unfence,
    Outcome,
    Watch(TelemetryChannel),
    Unwatch(TelemetryChannel),
    Help,
    Quit,
}

fn parse(line: &str) -> Result<Option<Input>> {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return Ok(None);
    };
    let arg = words.next();
    let input = match (cmd, arg) {
        ("connect", None) => Input::Connect,
        ("disconnect", None) => Input::Disconnect,
        ("grant", None) => Input::Grant,
        ("deny", None) => Input::Deny,
        ("status", None) => Input::Status,
        ("arm", None) => Input::Arm,
        ("takeoff", alt) => Input::Takeoff(alt.map(str::parse::<f32>).transpose()?),
        ("kill", None) => Input::Kill,
        ("land", None) => Input::Land,
        ("rtl", None) => Input::Rtl,
        ("wp", Some(p)) => Input::AddPoint(p.parse()?),
        ("wps", None) => Input::ListPoints,
        ("wpclear", None) => Input::ClearPoints,
        ("upload", None) => Input::Upload,
        ("start", None) => Input::Start,
        ("pause", None) => Input::Pause,
        ("clear", None) => Input::ClearMission,
        ("photo", None) => Input::Photo,
        ("fence", None) => Input::Fence,
        ("unfence", None) => Input::Unfence,
        ("outcome", None) => Input::Outcome,
        ("watch", Some(ch)) => Input::Watch(ch.parse()?),
        ("unwatch", Some(ch)) => Input::Unwatch(ch.parse()?),
        ("help", _) => Input::Help,
        ("quit" | "exit", None) => Input::Quit,
        _ => anyhow::bail!("unrecognized input `{}` (try `help`)", line.trim()),
    };
    anyhow::ensure!(words.next().is_none(), "too many arguments for `{}`", cmd);
    Ok(Some(input))
}

fn stamp() -> String {
    OffsetDateTime::now_utc()
        .format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_default()
}

fn show_status(s: &SessionStatus) {
    let port = s.port.map(|p| format!(" tcp://:{}", p)).unwrap_or_default();
    let device = s.device.as_deref().map(|d| format!(" {}", d)).unwrap_or_default();
    match &s.message {
        Some(m) => println!("[{}] {}{}{}: {}", stamp(), s.state, device, port, m),
        None => println!("[{}] {}{}{}", stamp(), s.state, device, port),
    }
}

type Feeds = StreamMap<TelemetryChannel, WatchStream<Option<TelemetryValue>>>;

struct Console {
    session: SessionHandle,
    gateway: CommandGateway,
    takeoff_alt_m: f32,
    points: Vec<GeoPoint>,
    watching: BTreeSet<TelemetryChannel>,
    feeds: Feeds,
}

impl Console {
    /// Attach a watched channel to the live session's cache, if there is one.
    fn attach(&mut self, channel: TelemetryChannel) {
        if let Some(stream) = self.session.telemetry(channel) {
            self.feeds.insert(channel, WatchStream::new(stream.subscribe()));
        }
    }

    fn reattach(&mut self) {
        self.feeds.clear();
        for channel in self.watching.clone() {
            self.attach(channel);
        }
    }

    fn submitted(&self, result: Result<(), GatewayError>) {
        match result {
            Ok(()) => println!("sent"),
            Err(e) => println!("error: {}", e),
        }
    }

    /// Returns false when the operator asked to quit.
    fn handle(&mut self, input: Input) -> bool {
        match input {
            Input::Connect => self.session.connect(),
            Input::Disconnect => self.session.disconnect(),
            Input::Grant => self.session.grant(),
            Input::Deny => self.session.deny(),
            Input::Status => show_status(&self.session.status()),
            Input::Arm => self.submitted(self.gateway.arm()),
            Input::Takeoff(alt) => {
                self.submitted(self.gateway.takeoff(alt.unwrap_or(self.takeoff_alt_m)))
            }
            Input::Kill => self.submitted(self.gateway.kill()),
            Input::Land => self.submitted(self.gateway.land()),
            Input::Rtl => self.submitted(self.gateway.return_to_launch()),
            Input::AddPoint(p) => {
                self.points.push(p);
                println!("{} points", self.points.len());
            }
            Input::ListPoints => {
                if self.points.is_empty() {
                    println!("no points");
                }
                for (i, p) in self.points.iter().enumerate() {
                    println!("{:>3}: {:.7},{:.7}", i, p.lat, p.lon);
                }
            }
            Input::ClearPoints => self.points.clear(),
            Input::Upload => {
                let mut plan = Vec::with_capacity(self.points.len() + 1);
                if !self.points.is_empty() {
                    match self.session.telemetry(TelemetryChannel::Position).and_then(|s| s.latest()) {
                        Some(TelemetryValue::Position(p)) => plan.push(GeoPoint::new(p.lat_deg, p.lon_deg)),
                        _ => warn!("console: no vehicle position yet, first point is the takeoff point"),
                    }
                }
                plan.extend_from_slice(&self.points);
                self.submitted(self.gateway.upload_mission(&plan));
            }
            Input::Start => self.submitted(self.gateway.start_mission()),
            Input::Pause => self.submitted(self.gateway.pause_mission()),
            Input::ClearMission => self.submitted(self.gateway.clear_mission()),
            Input::Photo => self.submitted(self.gateway.capture_photo()),
            Input::Fence => self.submitted(self.gateway.upload_geofence(&self.points)),
            Input::Unfence => self.submitted(self.gateway.clear_geofence()),
            Input::Outcome => match self.gateway.take_outcome() {
                Some(o) => println!("{}", o),
                None => println!("no outcome yet"),
            },
            Input::Watch(channel) => {
                self.watching.insert(channel);
                self.attach(channel);
                if !self.feeds.contains_key(&channel) {
                    println!("watching {} once connected", channel);
                }
            }
            Input::Unwatch(channel) => {
                self.watching.remove(&channel);
                self.feeds.remove(&channel);
            }
            Input::Help => println!("{}", HELP),
            Input::Quit => return false,
        }
        true
    }
}

pub async fn run(cfg: &Config) -> Result<()> {
    let session = tether_session::spawn(
        Arc::new(SystemDevices::new(cfg.serial.clone())),
        Arc::new(MavlinkConnector::new(&cfg.fc)),
        SessionConfig {
            bridge: cfg.bridge.clone(),
            link: cfg.serial.link(),
            telemetry: cfg.telemetry.clone(),
        },
    );
    let gateway = CommandGateway::new(&session, cfg.mission.plan());
    let mut status = session.watch_status();
    let mut live = session.watch_live();

    let mut console = Console {
        session: session.clone(),
        gateway,
        takeoff_alt_m: cfg.mission.takeoff_alt_m(),
        points: Vec::new(),
        watching: BTreeSet::new(),
        feeds: StreamMap::new(),
    };

    info!("console: ready");
    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse(&line) {
                    Ok(Some(input)) => {
                        if !console.handle(input) {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("error: {}", e),
                }
            }
            Some((channel, value)) = console.feeds.next() => {
                if let Some(value) = value {
                    println!("[{}] {}: {}", stamp(), channel, value);
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                show_status(&status.borrow_and_update());
            }
            changed = live.changed() => {
                if changed.is_err() {
                    break;
                }
                live.borrow_and_update();
                console.reattach();
            }
            _ = tokio::signal::ctrl_c() => {
                info!("console: interrupted");
                break;
            }
        }
    }

    session.shutdown().await;
    Ok(())
}
