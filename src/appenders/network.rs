//! Log shipping between processes
//!
//! A [`ShippingClient`] mirrors entries to a remote aggregator over one
//! persistent TCP connection; a [`ShippingServer`] accepts any number of
//! clients and hands every received entry to a [`RemoteSink`].
//!
//! Each frame is a 4-byte big-endian length followed by the JSON encoding of
//! a [`LogEntry`]. The server never replies.

use super::console;
use crate::core::error::{LoggerError, Result};
use crate::core::LogEntry;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use rand::Rng;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Largest frame body accepted from the wire
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Serialize one entry into a length-prefixed frame
pub fn encode_frame(entry: &LogEntry) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(entry)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(LoggerError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// What a read attempt on a connection produced
#[derive(Debug)]
pub enum Frame {
    Entry(LogEntry),
    /// No complete frame yet; the read timed out
    Idle,
    /// Peer closed the connection
    Closed,
}

/// Incremental frame decoder over a byte stream
///
/// Partial frames survive read timeouts, so the underlying reader may use a
/// short read timeout for shutdown polling.
pub struct FrameReader<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
        }
    }

    pub fn next_frame(&mut self) -> Result<Frame> {
        let mut chunk = [0u8; 8192];
        loop {
            if let Some(entry) = self.try_decode()? {
                return Ok(Frame::Entry(entry));
            }
            match self.reader.read(&mut chunk) {
                Ok(0) => return Ok(Frame::Closed),
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(Frame::Idle)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn try_decode(&mut self) -> Result<Option<LogEntry>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.buffer[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(LoggerError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        if self.buffer.len() < 4 + len {
            return Ok(None);
        }
        let entry = serde_json::from_slice(&self.buffer[4..4 + len])?;
        self.buffer.drain(..4 + len);
        Ok(Some(entry))
    }
}

/// Shipping client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Entries held while disconnected; the oldest is dropped beyond this
    pub capacity: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }
}

/// Counters of one shipping client
#[derive(Debug, Default)]
pub struct ShippingMetrics {
    shipped: AtomicU64,
    dropped: AtomicU64,
    connection_failures: AtomicU64,
    reconnects: AtomicU64,
}

impl ShippingMetrics {
    pub fn shipped(&self) -> u64 {
        self.shipped.load(Ordering::Relaxed)
    }

    /// Entries discarded by the bounded-drop policy or at stop
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn connection_failures(&self) -> u64 {
        self.connection_failures.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }
}

/// Exponential backoff with +-20% jitter
#[derive(Debug)]
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

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        base.mul_f64(rand::thread_rng().gen_range(0.8..1.2))
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

struct ClientRuntime {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Forwards entries to a remote [`ShippingServer`]
///
/// # Example
///
/// ```no_run
/// use logpipe::appenders::{ClientConfig, ShippingClient};
/// use logpipe::prelude::*;
///
/// let client = ShippingClient::new("127.0.0.1:5140", ClientConfig::default());
/// client.start().unwrap();
/// client.log(LogEntry::new("api", LogLevel::Info, "request served"));
/// client.stop();
/// ```
pub struct ShippingClient {
    peer: String,
    config: ClientConfig,
    sender: Sender<LogEntry>,
    // Kept so `log` can discard the oldest entry when the channel is full
    receiver: Receiver<LogEntry>,
    metrics: Arc<ShippingMetrics>,
    runtime: Mutex<Option<ClientRuntime>>,
}

impl ShippingClient {
    pub fn new(peer: impl Into<String>, config: ClientConfig) -> Self {
        let (sender, receiver) = bounded(config.capacity.max(1));
        Self {
            peer: peer.into(),
            config,
            sender,
            receiver,
            metrics: Arc::new(ShippingMetrics::default()),
            runtime: Mutex::new(None),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn metrics(&self) -> &ShippingMetrics {
        &self.metrics
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Spawn the connection thread; calling it again is a no-op
    pub fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Ok(());
        }

        let running = Arc::new(AtomicBool::new(true));
        let worker = ClientWorker {
            peer: self.peer.clone(),
            config: self.config.clone(),
            receiver: self.receiver.clone(),
            running: Arc::clone(&running),
            metrics: Arc::clone(&self.metrics),
        };
        let handle = thread::Builder::new()
            .name("logpipe-ship".to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                LoggerError::io_operation("spawn shipping thread", self.peer.clone(), e)
            })?;

        *runtime = Some(ClientRuntime { running, handle });
        Ok(())
    }

    /// Queue an entry for shipping, dropping the oldest one when full
    pub fn log(&self, entry: LogEntry) {
        let mut entry = entry;
        loop {
            match self.sender.try_send(entry) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    if self.receiver.try_recv().is_ok() {
                        self.metrics.record_dropped(1);
                    }
                    entry = returned;
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.metrics.record_dropped(1);
                    return;
                }
            }
        }
    }

    /// Send what is queued if connected, then close the connection
    pub fn stop(&self) {
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.running.store(false, Ordering::SeqCst);
            if runtime.handle.join().is_err() {
                console::print_error(&format!("shipping thread for '{}' panicked", self.peer), false);
            }
        }
    }
}

impl Drop for ShippingClient {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ClientWorker {
    peer: String,
    config: ClientConfig,
    receiver: Receiver<LogEntry>,
    running: Arc<AtomicBool>,
    metrics: Arc<ShippingMetrics>,
}

impl ClientWorker {
    fn run(self) {
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        let mut stream: Option<TcpStream> = None;
        let mut pending: Option<LogEntry> = None;
        let mut outage = false;

        loop {
            let entry = match pending.take() {
                Some(entry) => entry,
                None => match self.receiver.recv_timeout(POLL_INTERVAL) {
                    Ok(entry) => entry,
                    Err(RecvTimeoutError::Timeout) => {
                        if !self.running.load(Ordering::SeqCst) {
                            break;
                        }
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
            };

            let conn = match stream {
                Some(ref mut conn) => conn,
                None => match self.connect() {
                    Ok(conn) => {
                        if outage {
                            self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                            outage = false;
                        }
                        backoff.reset();
                        stream.insert(conn)
                    }
                    Err(e) => {
                        self.metrics.connection_failures.fetch_add(1, Ordering::Relaxed);
                        if !outage {
                            console::print_error(&e.to_string(), false);
                            outage = true;
                        }
                        if !self.running.load(Ordering::SeqCst) {
                            self.metrics.record_dropped(1 + self.receiver.len() as u64);
                            break;
                        }
                        pending = Some(entry);
                        self.sleep_while_running(backoff.next_delay());
                        continue;
                    }
                },
            };

            match encode_frame(&entry) {
                Ok(frame) => match conn.write_all(&frame) {
                    Ok(()) => {
                        self.metrics.shipped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        // Connection lost: keep the entry and reconnect
                        stream = None;
                        outage = true;
                        pending = Some(entry);
                    }
                },
                Err(e) => {
                    self.metrics.record_dropped(1);
                    console::print_error(&e.to_string(), false);
                }
            }
        }
    }

    fn connect(&self) -> Result<TcpStream> {
        let addrs = self
            .peer
            .to_socket_addrs()
            .map_err(|e| LoggerError::shipping(&self.peer, e.to_string()))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => {
                    stream
                        .set_write_timeout(Some(self.config.write_timeout))
                        .and_then(|_| stream.set_nodelay(true))
                        .map_err(|e| LoggerError::shipping(&self.peer, e.to_string()))?;
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(LoggerError::shipping(
            &self.peer,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "address did not resolve".to_string()),
        ))
    }

    fn sleep_while_running(&self, delay: Duration) {
        let step = Duration::from_millis(50);
        let mut remaining = delay;
        while !remaining.is_zero() && self.running.load(Ordering::SeqCst) {
            let nap = remaining.min(step);
            thread::sleep(nap);
            remaining = remaining.saturating_sub(nap);
        }
    }
}

/// Receiver of entries decoded by a [`ShippingServer`]
pub trait RemoteSink: Send + Sync {
    fn deliver(&self, entry: LogEntry);
}

impl<F> RemoteSink for F
where
    F: Fn(LogEntry) + Send + Sync,
{
    fn deliver(&self, entry: LogEntry) {
        self(entry)
    }
}

struct ServerRuntime {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Accepts shipping clients and feeds their entries into a [`RemoteSink`]
pub struct ShippingServer {
    bind: String,
    sink: Arc<dyn RemoteSink>,
    runtime: Mutex<Option<ServerRuntime>>,
}

impl ShippingServer {
    pub fn new(bind: impl Into<String>, sink: Arc<dyn RemoteSink>) -> Self {
        Self {
            bind: bind.into(),
            sink,
            runtime: Mutex::new(None),
        }
    }

    /// Bind and spawn the accept loop
    ///
    /// Returns the bound address, which resolves port 0. Calling it on a
    /// running server returns the existing address.
    pub fn start(&self) -> Result<SocketAddr> {
        let mut runtime = self.runtime.lock();
        if let Some(ref rt) = *runtime {
            return Ok(rt.addr);
        }

        let listener = TcpListener::bind(&self.bind)
            .map_err(|e| LoggerError::io_operation("bind shipping server", self.bind.clone(), e))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let loop_running = Arc::clone(&running);
        let sink = Arc::clone(&self.sink);
        let handle = thread::Builder::new()
            .name("logpipe-accept".to_string())
            .spawn(move || accept_loop(listener, sink, loop_running))
            .map_err(|e| LoggerError::io_operation("spawn accept thread", addr.to_string(), e))?;

        *runtime = Some(ServerRuntime {
            addr,
            running,
            handle,
        });
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().as_ref().map(|rt| rt.addr)
    }

    /// Close the listener and all client connections
    pub fn stop(&self) {
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.running.store(false, Ordering::SeqCst);
            if runtime.handle.join().is_err() {
                console::print_error(
                    &format!("accept thread for '{}' panicked", runtime.addr),
                    false,
                );
            }
        }
    }
}

impl Drop for ShippingServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, sink: Arc<dyn RemoteSink>, running: Arc<AtomicBool>) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();

    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let sink = Arc::clone(&sink);
                let running = Arc::clone(&running);
                let spawned = thread::Builder::new()
                    .name(format!("logpipe-conn-{}", peer))
                    .spawn(move || serve_connection(stream, peer, sink, running));
                match spawned {
                    Ok(handle) => connections.push(handle),
                    Err(e) => console::print_error(
                        &format!("cannot serve shipping client {}: {}", peer, e),
                        false,
                    ),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(e) => {
                console::print_error(&format!("accept failed: {}", e), false);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
        connections.retain(|handle| !handle.is_finished());
    }

    drop(listener);
    for handle in connections {
        let _ = handle.join();
    }
}

fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    sink: Arc<dyn RemoteSink>,
    running: Arc<AtomicBool>,
) {
    let configured = stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_read_timeout(Some(POLL_INTERVAL)));
    if let Err(e) = configured {
        console::print_error(&format!("shipping client {}: {}", peer, e), false);
        return;
    }

    let mut reader = FrameReader::new(stream);
    while running.load(Ordering::SeqCst) {
        match reader.next_frame() {
            Ok(Frame::Entry(entry)) => sink.deliver(entry),
            Ok(Frame::Idle) => continue,
            Ok(Frame::Closed) => break,
            Err(e) => {
                console::print_error(&format!("shipping client {}: {}", peer, e), false);
                break;
            }
        }
    }
}
