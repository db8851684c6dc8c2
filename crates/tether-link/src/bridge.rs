//! Byte relay between the serial endpoint and the local TCP endpoint.
//!
//! Each endpoint is owned by one worker task. A worker splits its endpoint:
//! the read half is polled with a bounded wait and every non-empty read goes
//! to the other worker's write queue, while the write half drains this
//! worker's own queue. The two halves run concurrently, so the
//! serial->network direction never waits behind network->serial writes.
//! Bytes are written in the order they were read; no framing.

use bytes::Bytes;
use std::fmt;
use std::future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{LinkConfig, LinkIo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Serial,
    Network,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Serial => f.write_str("serial"),
            Side::Network => f.write_str("tcp"),
        }
    }
}

/// Structural failure of one endpoint. The worker has already stopped.
#[derive(Debug)]
pub struct RunError {
    pub session: u64,
    pub side: Side,
    pub error: io::Error,
}

#[derive(Debug, Default)]
pub struct BridgeStats {
    pub serial_to_network: AtomicU64,
    pub network_to_serial: AtomicU64,
}

impl BridgeStats {
    fn count(&self, read_side: Side, n: usize) {
        let counter = match read_side {
            Side::Serial => &self.serial_to_network,
            Side::Network => &self.network_to_serial,
        };
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

pub struct Bridge {
    session: u64,
    stop_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<BridgeStats>,
}

impl Bridge {
    /// Launch both workers. Errors are reported on `errors` tagged with `session`.
    pub fn start<S, N>(
        session: u64,
        serial: S,
        network: N,
        cfg: LinkConfig,
        errors: mpsc::UnboundedSender<RunError>,
    ) -> Self
    where
        S: LinkIo + 'static,
        N: LinkIo + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (to_serial_tx, to_serial_rx) = mpsc::unbounded_channel();
        let (to_network_tx, to_network_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(BridgeStats::default());

        let serial_worker = Worker {
            session,
            side: Side::Serial,
            io: serial,
            cfg,
            outbound: to_serial_rx,
            forward: to_network_tx,
            stop: stop_rx.clone(),
            errors: errors.clone(),
            stats: stats.clone(),
        };
        let network_worker = Worker {
            session,
            side: Side::Network,
            io: network,
            cfg,
            outbound: to_network_rx,
            forward: to_serial_tx,
            stop: stop_rx,
            errors,
            stats: stats.clone(),
        };

        let workers = vec![
            tokio::spawn(serial_worker.run()),
            tokio::spawn(network_worker.run()),
        ];
        info!("bridge[{}]: relaying serial <-> tcp", session);

        Self { session, stop_tx, workers, stats }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        self.stats.clone()
    }

    /// Stop both workers and wait until their endpoints are closed.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        for handle in self.workers.drain(..) {
            let _ = handle.await;
        }
        info!(
            "bridge[{}]: stopped ({} bytes serial->tcp, {} bytes tcp->serial)",
            self.session,
            self.stats.serial_to_network.load(Ordering::Relaxed),
            self.stats.network_to_serial.load(Ordering::Relaxed),
        );
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        // dropped without stop(): workers still see the signal and close
        let _ = self.stop_tx.send(true);
    }
}

struct Worker<T> {
    session: u64,
    side: Side,
    io: T,
    cfg: LinkConfig,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    forward: mpsc::UnboundedSender<Bytes>,
    stop: watch::Receiver<bool>,
    errors: mpsc::UnboundedSender<RunError>,
    stats: Arc<BridgeStats>,
}

impl<T: LinkIo> Worker<T> {
    async fn run(self) {
        let Worker { session, side, io, cfg, mut outbound, forward, mut stop, errors, stats } = self;
        let (mut reader, mut writer) = split(io);

        let result: io::Result<()> = tokio::select! {
            r = relay(&mut reader, side, &cfg, &forward, &stats) => r,
            r = drain(&mut writer, &cfg, &mut outbound) => r,
            _ = stop.wait_for(|stopped| *stopped) => Ok(()),
        };

        let mut io = reader.unsplit(writer);
        let _ = timeout(cfg.write_timeout, io.shutdown()).await;
        drop(io);

        match result {
            Ok(()) => debug!("bridge[{}]: {} worker stopped", session, side),
            Err(error) => {
                warn!("bridge[{}]: {} run error: {}", session, side, error);
                let _ = errors.send(RunError { session, side, error });
            }
        }
    }
}

/// Read the endpoint and hand every chunk to the other side's write queue.
async fn relay<R: AsyncRead + Unpin>(
    reader: &mut R,
    side: Side,
    cfg: &LinkConfig,
    forward: &mpsc::UnboundedSender<Bytes>,
    stats: &BridgeStats,
) -> io::Result<()> {
    let mut buf = vec![0u8; cfg.read_buffer_size];
    loop {
        match timeout(cfg.read_timeout, reader.read(&mut buf)).await {
            // bounded wait elapsed, nothing to relay
            Err(_) => continue,
            Ok(Ok(0)) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "end of stream")),
            Ok(Ok(n)) => {
                stats.count(side, n);
                let _ = forward.send(Bytes::copy_from_slice(&buf[..n]));
            }
            Ok(Err(e)) => return Err(e),
        }
    }
}

/// Write queued chunks in arrival order, each bounded by the write timeout.
async fn drain<W: AsyncWrite + Unpin>(
    writer: &mut W,
    cfg: &LinkConfig,
    outbound: &mut mpsc::UnboundedReceiver<Bytes>,
) -> io::Result<()> {
    while let Some(data) = outbound.recv().await {
        let write = async {
            for part in data.chunks(cfg.write_buffer_size) {
                writer.write_all(part).await?;
            }
            writer.flush().await
        };
        match timeout(cfg.write_timeout, write).await {
            Ok(r) => r?,
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
        }
    }
    // the other worker is gone; keep reading until stopped
    future::pending().await
}
