mod console;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use tether_fc::FcConfig;
use tether_link::{DeviceProvider, SerialConfig, SystemDevices};
use tether_mission::{encode_plan, MissionConfig};
use tether_proto::GeoPoint;
use tether_session::{BridgeConfig, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(name = "tether", version, about = "tether - serial-to-TCP vehicle link and operator console")]
struct Cli {
    /// TOML config; every section and field is optional.
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration.
    Doctor,
    /// List eligible serial devices and their access status.
    Ports,
    /// Print the mission items for a list of `lat,lon` points as JSON.
    Plan {
        #[arg(required = true, allow_hyphen_values = true)]
        points: Vec<GeoPoint>,
    },
    /// Interactive operator console on stdin.
    Console,
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub mission: MissionConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub fc: FcConfig,
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Ports => ports(&cfg).await?,
        Command::Plan { points } => plan(&cfg, &points)?,
        Command::Console => console::run(&cfg).await?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    let link = cfg.serial.link();
    anyhow::ensure!(cfg.serial.baud() > 0, "serial.baud invalid");
    anyhow::ensure!(link.read_buffer_size > 0, "serial.buffer_size invalid");
    anyhow::ensure!(!link.read_timeout.is_zero(), "serial.read_timeout_ms must be > 0");
    anyhow::ensure!(!link.write_timeout.is_zero(), "serial.write_timeout_ms must be > 0");
    if let Some(dev) = &cfg.serial.device {
        anyhow::ensure!(!dev.is_empty(), "serial.device is empty");
        if !std::path::Path::new(dev).exists() {
            warn!("doctor: serial.device {} does not exist (yet)", dev);
        }
    }

    anyhow::ensure!(cfg.bridge.initial_port() > 0, "bridge.initial_port must be > 0");
    anyhow::ensure!(!cfg.bridge.startup_timeout().is_zero(), "bridge.startup_timeout_ms must be > 0");
    anyhow::ensure!(!cfg.bridge.permission_timeout().is_zero(), "bridge.permission_timeout_ms must be > 0");

    let plan = cfg.mission.plan();
    anyhow::ensure!(plan.height_m.is_finite() && plan.height_m > 0.0, "mission.height_m must be > 0");
    anyhow::ensure!(plan.speed_m_s.is_finite() && plan.speed_m_s > 0.0, "mission.speed_m_s must be > 0");
    anyhow::ensure!(cfg.mission.takeoff_alt_m() > 0.0, "mission.takeoff_alt_m must be > 0");

    if let Some(hz) = cfg.fc.send_heartbeat_hz {
        anyhow::ensure!(hz > 0.0, "fc.send_heartbeat_hz must be > 0");
    }
    let fc = cfg.fc.settings();
    anyhow::ensure!(fc.sys_id != fc.target_sys, "fc.sys_id collides with fc.target_sys");
    anyhow::ensure!(!fc.ack_timeout.is_zero(), "fc.ack_timeout_ms must be > 0");

    info!("doctor: OK");
    println!("config OK");
    Ok(())
}

async fn ports(cfg: &Config) -> Result<()> {
    let devices = SystemDevices::new(cfg.serial.clone());
    let found = tokio::task::spawn_blocking(move || devices.scan())
        .await
        .context("serial scan task")??;
    if found.is_empty() {
        println!("no eligible serial device");
    }
    for d in found {
        println!(
            "{} permission={:?} {}",
            d.id,
            d.permission,
            d.description.unwrap_or_default()
        );
    }
    Ok(())
}

fn plan(cfg: &Config, points: &[GeoPoint]) -> Result<()> {
    let items = encode_plan(points, &cfg.mission.plan()).context("encode plan")?;
    println!("{}", serde_json::to_string_pretty(&items)?);
    Ok(())
}
