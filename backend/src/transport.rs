use crate::command_queue::CommandQueue;
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::pod_commands::{Command, RECORD_LEN};
use basestation_shared::LinkStatus;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

// ======================================================================
//  Pod link
// ======================================================================
pub trait PodLink: Send {
    /// Writes one command record. Either the whole record is handed to the
    /// link or an error is returned.
    fn send_record(
        &mut self,
        record: &[u8; RECORD_LEN],
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Resolves once the pod has closed or reset the link.
    fn closed(&mut self) -> impl Future<Output = io::Error> + Send;

    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

pub trait Connector: Send + Sync {
    type Link: PodLink;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Link>> + Send;
}

impl PodLink for TcpStream {
    async fn send_record(&mut self, record: &[u8; RECORD_LEN]) -> io::Result<()> {
        self.write_all(record).await?;
        self.flush().await
    }

    async fn closed(&mut self) -> io::Error {
        // the pod never talks back on this socket; anything it sends is dropped
        let mut scratch = [0u8; 64];
        loop {
            if let Err(err) = self.readable().await {
                return err;
            }
            match self.try_read(&mut scratch) {
                Ok(0) => {
                    return io::Error::new(io::ErrorKind::UnexpectedEof, "pod closed the link");
                }
                Ok(n) => debug!(n, "ignoring bytes from pod"),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return err,
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

/// Connects to the pod's command server over TCP.
pub struct TcpConnector {
    addr: String,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

impl Connector for TcpConnector {
    type Link = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(self.timeout, open_with_keepalive(&self.addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", self.addr),
                )
            })??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

async fn open_with_keepalive(addr: &str) -> io::Result<TcpStream> {
    let mut last_err = None;
    for target in lookup_host(addr).await? {
        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        match socket.connect(target).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{addr} did not resolve"),
        )
    }))
}

// ======================================================================
//  Reconnect backoff
// ======================================================================
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt; doubles up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Sends `batch` in order. On a write error the failed record and everything
/// after it go back to the head of the queue. With a `deadline`, records not
/// yet started when it passes are requeued as well; a record whose write has
/// begun is always finished.
///
/// Returns how many records were written.
pub async fn deliver_batch<L: PodLink>(
    link: &mut L,
    queue: &CommandQueue,
    batch: Vec<Command>,
    deadline: Option<Instant>,
) -> Result<usize, TransportError> {
    for (idx, cmd) in batch.iter().enumerate() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            queue.requeue_front(batch[idx..].to_vec());
            return Ok(idx);
        }
        if let Err(source) = link.send_record(&cmd.encode()).await {
            queue.requeue_front(batch[idx..].to_vec());
            return Err(TransportError::Disconnected {
                delivered: idx,
                source,
            });
        }
        debug!(opcode = %cmd.opcode, value = cmd.value, "command sent");
    }
    Ok(batch.len())
}

// ======================================================================
//  Transport task
// ======================================================================
pub struct CommandTransport<C: Connector> {
    connector: C,
    queue: Arc<CommandQueue>,
    config: TransportConfig,
    status_tx: watch::Sender<LinkStatus>,
}

impl<C: Connector> CommandTransport<C> {
    pub fn new(
        connector: C,
        queue: Arc<CommandQueue>,
        config: TransportConfig,
    ) -> (Self, watch::Receiver<LinkStatus>) {
        let (status_tx, status_rx) = watch::channel(LinkStatus::Connecting);
        (
            Self {
                connector,
                queue,
                config,
                status_tx,
            },
            status_rx,
        )
    }

    fn set_status(&self, status: LinkStatus) {
        self.status_tx.send_replace(status);
    }

    /// Owns the pod connection until shutdown: connect, pump the queue,
    /// reconnect with backoff on failure.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut backoff = Backoff::new(self.config.backoff_initial(), self.config.backoff_max());

        loop {
            self.set_status(LinkStatus::Connecting);
            let attempt = tokio::select! {
                res = self.connector.connect() => res,
                _ = shutdown_rx.recv() => break,
            };

            match attempt {
                Ok(mut link) => {
                    backoff.reset();
                    self.set_status(LinkStatus::Connected);
                    info!("connected to pod");

                    match self.pump(&mut link, &mut shutdown_rx).await {
                        Ok(()) => {
                            self.flush(&mut link).await;
                            if let Err(err) = link.close().await {
                                debug!(%err, "closing pod link");
                            }
                            break;
                        }
                        Err(err) => {
                            warn!(%err, "pod link lost");
                            if let Err(err) = link.close().await {
                                debug!(%err, "closing pod link");
                            }
                        }
                    }
                }
                Err(err) => warn!(%err, "cannot connect to pod"),
            }

            self.set_status(LinkStatus::Disconnected);
            let delay = backoff.next_delay();
            debug!(?delay, "reconnecting to pod");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        self.set_status(LinkStatus::Disconnected);
        if !self.queue.is_empty() {
            warn!(
                left = self.queue.len(),
                "transport stopped with undelivered commands"
            );
        }
        info!("command transport stopped");
    }

    /// Drains the queue every tick, or right away when a priority command
    /// arrives. Returns `Ok` when shutdown is requested and an error as soon
    /// as the pod closes the link, even while idle.
    async fn pump(
        &self,
        link: &mut C::Link,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<(), TransportError> {
        let mut tick = interval(self.config.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return Ok(()),
                source = link.closed() => {
                    return Err(TransportError::Disconnected { delivered: 0, source });
                }
                _ = self.queue.priority_ready() => {}
                _ = tick.tick() => {}
            }

            // sending happens outside select! so a write is never cancelled
            let batch = self.queue.drain_all();
            if !batch.is_empty() {
                deliver_batch(link, &self.queue, batch, None).await?;
            }
        }
    }

    async fn flush(&self, link: &mut C::Link) {
        let deadline = Instant::now() + self.config.shutdown_flush();
        loop {
            let batch = self.queue.drain_all();
            if batch.is_empty() {
                return;
            }
            match deliver_batch(link, &self.queue, batch, Some(deadline)).await {
                Ok(sent) => {
                    debug!(sent, "flushed commands on shutdown");
                    if Instant::now() >= deadline {
                        return;
                    }
                }
                Err(err) => {
                    warn!(%err, "flush on shutdown interrupted");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_queue::OverflowPolicy;
    use basestation_shared::Opcode;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    type SentLog = Arc<Mutex<Vec<Command>>>;

    struct ScriptedLink {
        log: SentLog,
        sent: usize,
        fail_after: Option<usize>,
    }

    impl ScriptedLink {
        fn new(log: &SentLog, fail_after: Option<usize>) -> Self {
            Self {
                log: Arc::clone(log),
                sent: 0,
                fail_after,
            }
        }
    }

    impl PodLink for ScriptedLink {
        async fn send_record(&mut self, record: &[u8; RECORD_LEN]) -> io::Result<()> {
            if self.fail_after == Some(self.sent) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pod went away"));
            }
            let cmd = Command::decode(record)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.log.lock().unwrap().push(cmd);
            self.sent += 1;
            Ok(())
        }

        async fn closed(&mut self) -> io::Error {
            std::future::pending().await
        }

        async fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct ScriptedConnector {
        links: Mutex<VecDeque<ScriptedLink>>,
    }

    impl Connector for ScriptedConnector {
        type Link = ScriptedLink;

        async fn connect(&self) -> io::Result<ScriptedLink> {
            self.links
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no pod"))
        }
    }

    fn speed(v: i32) -> Command {
        Command::new(Opcode::SetMotorSpeed, v)
    }

    fn fast_config(tick_ms: u64) -> TransportConfig {
        TransportConfig {
            tick_ms,
            connect_timeout_ms: 100,
            backoff_initial_ms: 1,
            backoff_max_ms: 4,
            shutdown_flush_ms: 500,
        }
    }

    async fn wait_for_sent(log: &SentLog, n: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while log.lock().unwrap().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("commands were not delivered in time");
    }

    #[test]
    fn backoff_doubles_up_to_max_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_millis(1_000));
        let delays: Vec<u64> = (0..5)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![250, 500, 1_000, 1_000, 1_000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn failed_batch_is_resent_before_newer_commands() {
        let queue = CommandQueue::new(16, OverflowPolicy::Reject);
        let log = SentLog::default();
        for v in [1, 2, 3] {
            queue.push(speed(v)).unwrap();
        }

        let batch = queue.drain_all();
        // arrives while the batch is in flight
        queue.push(Command::new(Opcode::EnableMotor, 0)).unwrap();

        let mut first = ScriptedLink::new(&log, Some(1));
        let err = deliver_batch(&mut first, &queue, batch, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Disconnected { delivered: 1, .. }));

        let mut second = ScriptedLink::new(&log, None);
        let batch = queue.drain_all();
        assert_eq!(deliver_batch(&mut second, &queue, batch, None).await.unwrap(), 3);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                speed(1),
                speed(2),
                speed(3),
                Command::new(Opcode::EnableMotor, 0)
            ]
        );
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn passed_deadline_requeues_everything() {
        let queue = CommandQueue::new(16, OverflowPolicy::Reject);
        let log = SentLog::default();
        let mut link = ScriptedLink::new(&log, None);
        let batch = vec![speed(1), speed(2)];

        let sent = deliver_batch(&mut link, &queue, batch, Some(Instant::now()))
            .await
            .unwrap();
        assert_eq!(sent, 0);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(queue.drain_all(), vec![speed(1), speed(2)]);
    }

    #[tokio::test]
    async fn tcp_link_writes_one_record_per_command() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = TcpConnector::new(addr.to_string(), Duration::from_secs(1));

        let (link, accepted) = tokio::join!(connector.connect(), listener.accept());
        let mut link = link.unwrap();
        let (mut server, _) = accepted.unwrap();

        let queue = CommandQueue::new(4, OverflowPolicy::Reject);
        let batch = vec![speed(-40), Command::new(Opcode::SetHvRelayHvPole, 1)];
        deliver_batch(&mut link, &queue, batch, None).await.unwrap();

        let mut buf = [0u8; 2 * RECORD_LEN];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(Command::decode(&buf[..RECORD_LEN]).unwrap(), speed(-40));
        assert_eq!(
            Command::decode(&buf[RECORD_LEN..]).unwrap(),
            Command::new(Opcode::SetHvRelayHvPole, 1)
        );
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let connector = TcpConnector::new(addr.to_string(), Duration::from_millis(500));
        assert!(connector.connect().await.is_err());
    }

    #[tokio::test]
    async fn pod_closing_an_idle_link_loses_nothing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = TcpConnector::new(addr.to_string(), Duration::from_secs(1));
        let queue = Arc::new(CommandQueue::new(16, OverflowPolicy::Reject));
        let (transport, _status_rx) =
            CommandTransport::new(connector, Arc::clone(&queue), fast_config(5));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(transport.run(shutdown_rx));

        // pod restarts while nothing is queued
        let (first, _) = listener.accept().await.unwrap();
        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;

        for v in [1, 2, 3] {
            queue.push(speed(v)).unwrap();
        }
        let (mut second, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("transport did not reconnect")
            .unwrap();
        let mut buf = [0u8; 3 * RECORD_LEN];
        tokio::time::timeout(Duration::from_secs(2), second.read_exact(&mut buf))
            .await
            .expect("commands were not delivered in time")
            .unwrap();
        let values: Vec<i32> = buf
            .chunks(RECORD_LEN)
            .map(|record| Command::decode(record).unwrap().value)
            .collect();
        assert_eq!(values, vec![1, 2, 3]);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("transport did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn run_reconnects_and_redelivers_in_order() {
        let log = SentLog::default();
        let connector = ScriptedConnector {
            links: Mutex::new(VecDeque::from([
                ScriptedLink::new(&log, Some(1)),
                ScriptedLink::new(&log, None),
            ])),
        };
        let queue = Arc::new(CommandQueue::new(16, OverflowPolicy::Reject));
        for v in [1, 2, 3] {
            queue.push(speed(v)).unwrap();
        }

        let (transport, status_rx) =
            CommandTransport::new(connector, Arc::clone(&queue), fast_config(5));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(transport.run(shutdown_rx));

        wait_for_sent(&log, 3).await;
        assert_eq!(*log.lock().unwrap(), vec![speed(1), speed(2), speed(3)]);
        assert_eq!(*status_rx.borrow(), LinkStatus::Connected);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("transport did not stop")
            .unwrap();
        assert_eq!(*status_rx.borrow(), LinkStatus::Disconnected);
    }

    #[tokio::test]
    async fn priority_command_skips_the_tick() {
        let log = SentLog::default();
        let connector = ScriptedConnector {
            links: Mutex::new(VecDeque::from([ScriptedLink::new(&log, None)])),
        };
        let queue = Arc::new(CommandQueue::new(16, OverflowPolicy::Reject));
        let (transport, mut status_rx) =
            CommandTransport::new(connector, Arc::clone(&queue), fast_config(60_000));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(transport.run(shutdown_rx));

        status_rx
            .wait_for(|s| *s == LinkStatus::Connected)
            .await
            .unwrap();
        // let the immediate first tick go by
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.enqueue(5, None).unwrap();
        wait_for_sent(&log, 1).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec![Command::new(Opcode::EmergencyBrake, 0)]
        );

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_flushes_queued_commands() {
        let log = SentLog::default();
        let connector = ScriptedConnector {
            links: Mutex::new(VecDeque::from([ScriptedLink::new(&log, None)])),
        };
        let queue = Arc::new(CommandQueue::new(16, OverflowPolicy::Reject));
        let (transport, mut status_rx) =
            CommandTransport::new(connector, Arc::clone(&queue), fast_config(60_000));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(transport.run(shutdown_rx));

        status_rx
            .wait_for(|s| *s == LinkStatus::Connected)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.push(speed(7)).unwrap();
        queue.push(Command::new(Opcode::DisableMotor, 0)).unwrap();
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("transport did not stop")
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![speed(7), Command::new(Opcode::DisableMotor, 0)]
        );
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn shutdown_while_unreachable_keeps_commands_queued() {
        let connector = ScriptedConnector {
            links: Mutex::new(VecDeque::new()),
        };
        let queue = Arc::new(CommandQueue::new(16, OverflowPolicy::Reject));
        queue.push(speed(1)).unwrap();
        let (transport, status_rx) =
            CommandTransport::new(connector, Arc::clone(&queue), fast_config(5));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(transport.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(*status_rx.borrow(), LinkStatus::Disconnected);
        assert_eq!(queue.len(), 1);
    }
}
