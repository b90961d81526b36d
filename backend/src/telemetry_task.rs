use crate::telemetry_decode::decode_frame;
use crate::telemetry_store::TelemetryStore;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Listener counters, readable from any task.
#[derive(Debug, Default)]
pub struct ListenerStats {
    datagrams: AtomicU64,
    frames: AtomicU64,
    decode_errors: AtomicU64,
}

impl ListenerStats {
    pub fn datagrams(&self) -> u64 {
        self.datagrams.load(Ordering::Relaxed)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }
}

pub struct TelemetryListener {
    socket: UdpSocket,
    store: Arc<TelemetryStore>,
    stats: Arc<ListenerStats>,
    max_datagram: usize,
}

impl TelemetryListener {
    pub async fn bind(
        addr: &str,
        store: Arc<TelemetryStore>,
        stats: Arc<ListenerStats>,
        max_datagram: usize,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            store,
            stats,
            max_datagram,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        // one spare byte so oversized datagrams show up as trailing bytes
        let mut buf = vec![0u8; self.max_datagram + 1];
        info!(addr = ?self.local_addr().ok(), "telemetry listener started");

        loop {
            tokio::select! {
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, from)) => {
                            debug!(len, %from, "telemetry datagram");
                            ingest_datagram(
                                &self.store,
                                &self.stats,
                                &buf[..len],
                                get_current_timestamp_ms(),
                            );
                        }
                        Err(err) => warn!(%err, "telemetry receive failed"),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        info!("telemetry listener stopped");
    }
}

/// Decodes one datagram into the store. A zero pod timestamp is replaced by
/// the local receive time. Returns whether a frame was accepted.
pub fn ingest_datagram(
    store: &TelemetryStore,
    stats: &ListenerStats,
    bytes: &[u8],
    now_ms: u64,
) -> bool {
    stats.datagrams.fetch_add(1, Ordering::Relaxed);
    match decode_frame(bytes) {
        Ok(mut frame) => {
            if frame.timestamp_ms() == 0 {
                frame.set_timestamp_ms(now_ms);
            }
            debug!(kind = frame.kind().as_str(), ts = frame.timestamp_ms(), "telemetry frame");
            stats.frames.fetch_add(1, Ordering::Relaxed);
            store.record(frame, now_ms);
            true
        }
        Err(err) => {
            let errors = stats.decode_errors.fetch_add(1, Ordering::Relaxed) + 1;
            if errors == 1 || errors % 100 == 0 {
                warn!(%err, errors, "dropping malformed telemetry datagram");
            } else {
                debug!(%err, "dropping malformed telemetry datagram");
            }
            false
        }
    }
}

pub fn get_current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
