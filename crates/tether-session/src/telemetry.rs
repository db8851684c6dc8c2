//! Per-channel shared telemetry pipelines over the live endpoint.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use tether_fc::RemoteSystem;
use tether_proto::{TelemetryChannel, TelemetryValue};

pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    /// Period of sampled channels (position, battery, attitude, ...).
    pub sample_interval_ms: Option<u64>,
}

impl TelemetryConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.unwrap_or(DEFAULT_SAMPLE_INTERVAL_MS).max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shaping {
    /// Publish only when the value differs from the last published one.
    Distinct,
    /// Publish the most recent value at most once per period.
    Sample(Duration),
}

impl Shaping {
    pub fn for_channel(channel: TelemetryChannel, cfg: &TelemetryConfig) -> Self {
        match channel {
            TelemetryChannel::FlightMode | TelemetryChannel::ConnectionState => Shaping::Distinct,
            _ => Shaping::Sample(cfg.sample_interval()),
        }
    }
}

/// One shared pipeline. Cloning the `Arc` shares the same subscription.
#[derive(Debug)]
pub struct TelemetryStream {
    channel: TelemetryChannel,
    rx: watch::Receiver<Option<TelemetryValue>>,
    task: JoinHandle<()>,
}

impl TelemetryStream {
    fn spawn(
        channel: TelemetryChannel,
        feed: broadcast::Receiver<TelemetryValue>,
        shaping: Shaping,
    ) -> Self {
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(run(channel, feed, shaping, tx));
        Self { channel, rx, task }
    }

    pub fn channel(&self) -> TelemetryChannel {
        self.channel
    }

    /// Observer handle. `changed()` errors once the pipeline is invalidated.
    pub fn subscribe(&self) -> watch::Receiver<Option<TelemetryValue>> {
        self.rx.clone()
    }

    pub fn latest(&self) -> Option<TelemetryValue> {
        *self.rx.borrow()
    }

    fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for TelemetryStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Map a raw feed sample onto the channel's value.
fn project(channel: TelemetryChannel, value: TelemetryValue) -> TelemetryValue {
    match (channel, value) {
        (TelemetryChannel::Speed, TelemetryValue::VelocityNed(v)) => TelemetryValue::Speed(v.into()),
        _ => value,
    }
}

async fn run(
    channel: TelemetryChannel,
    mut feed: broadcast::Receiver<TelemetryValue>,
    shaping: Shaping,
    tx: watch::Sender<Option<TelemetryValue>>,
) {
    match shaping {
        Shaping::Distinct => loop {
            match feed.recv().await {
                Ok(v) => {
                    let v = Some(project(channel, v));
                    tx.send_if_modified(|cur| {
                        if *cur == v {
                            return false;
                        }
                        *cur = v;
                        true
                    });
                }
                Err(broadcast::error::RecvError::Lagged(n)) => debug!("telemetry[{}]: lagged {}", channel, n),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        },
        Shaping::Sample(period) => {
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut pending: Option<TelemetryValue> = None;
            loop {
                tokio::select! {
                    biased;

                    r = feed.recv() => match r {
                        Ok(v) => pending = Some(project(channel, v)),
                        Err(broadcast::error::RecvError::Lagged(n)) => debug!("telemetry[{}]: lagged {}", channel, n),
                        Err(broadcast::error::RecvError::Closed) => break,
                    },

                    _ = tick.tick() => {
                        if let Some(v) = pending.take() {
                            tx.send_replace(Some(v));
                        }
                    }
                }
            }
            if let Some(v) = pending {
                tx.send_replace(Some(v));
            }
        }
    }
    debug!("telemetry[{}]: feed closed", channel);
}

/// Lazily created pipelines, at most one per channel.
pub struct TelemetryCache {
    remote: Arc<dyn RemoteSystem>,
    cfg: TelemetryConfig,
    streams: Mutex<HashMap<TelemetryChannel, Arc<TelemetryStream>>>,
}

impl TelemetryCache {
    pub fn new(remote: Arc<dyn RemoteSystem>, cfg: TelemetryConfig) -> Self {
        Self { remote, cfg, streams: Mutex::new(HashMap::new()) }
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<TelemetryChannel, Arc<TelemetryStream>>> {
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Shared pipeline for `channel`; the first call subscribes to the feed.
    pub fn get(&self, channel: TelemetryChannel) -> Arc<TelemetryStream> {
        // check and create under the same lock
        let mut streams = self.streams();
        if let Some(stream) = streams.get(&channel) {
            return stream.clone();
        }
        let shaping = Shaping::for_channel(channel, &self.cfg);
        let stream = Arc::new(TelemetryStream::spawn(channel, self.remote.subscribe(channel.feed()), shaping));
        debug!("telemetry[{}]: pipeline created ({:?})", channel, shaping);
        streams.insert(channel, stream.clone());
        stream
    }

    pub fn len(&self) -> usize {
        self.streams().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every pipeline; existing observers see their channel close.
    pub fn invalidate(&self) {
        let drained: Vec<_> = self.streams().drain().map(|(_, s)| s).collect();
        for stream in &drained {
            stream.stop();
        }
        if !drained.is_empty() {
            debug!("telemetry: {} pipeline(s) invalidated", drained.len());
        }
    }
}
