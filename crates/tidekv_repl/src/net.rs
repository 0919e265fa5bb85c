//! Network contract of the replication core.
//!
//! The real transport lives outside this crate; replication only needs a
//! blocking line-oriented client, a way to cancel a session by id, and a
//! shared token bucket gating bulk transfer. [`ChannelNetwork`] is an
//! in-process loopback implementation used by tests and tooling.

use crate::error::{ReplError, ReplResult};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sentinel meaning "no incremental-sync session".
pub const SESSION_NONE: u64 = u64::MAX;

/// A blocking, line-oriented transport client.
pub trait BlockingClient: Send {
    /// Connects to `host:port`.
    fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> ReplResult<()>;

    /// Writes one line (without the terminator).
    fn write_line(&mut self, line: &str, timeout: Duration) -> ReplResult<()>;

    /// Reads one line, blocking up to `timeout`.
    fn read_line(&mut self, timeout: Duration) -> ReplResult<String>;

    /// Human-readable remote endpoint, for status output.
    fn remote_repr(&self) -> String;

    /// Transport session id, usable with [`NetworkService::cancel_session`].
    fn session_id(&self) -> u64;
}

/// Client factory plus session cancellation.
pub trait NetworkService: Send + Sync {
    /// Creates an unconnected blocking client with the given buffer budget.
    fn create_blocking_client(&self, buf_bytes: usize) -> Box<dyn BlockingClient>;

    /// Cancels a session by id; readers and writers on it observe a
    /// transport error.
    fn cancel_session(&self, session_id: u64) -> ReplResult<()>;
}

struct Pipe {
    lines: Mutex<VecDeque<String>>,
    cv: Condvar,
}

impl Pipe {
    fn new() -> Self {
        Self {
            lines: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        }
    }

    fn push(&self, line: String) {
        self.lines.lock().push_back(line);
        self.cv.notify_one();
    }

    fn pop(&self, timeout: Duration, closed: &AtomicBool) -> ReplResult<String> {
        let deadline = Instant::now() + timeout;
        let mut lines = self.lines.lock();
        loop {
            if let Some(line) = lines.pop_front() {
                return Ok(line);
            }
            if closed.load(Ordering::SeqCst) {
                return Err(ReplError::net("session closed"));
            }
            if Instant::now() >= deadline {
                return Err(ReplError::timeout("read_line timed out"));
            }
            self.cv.wait_until(&mut lines, deadline);
        }
    }

    fn wake_all(&self) {
        self.cv.notify_all();
    }
}

struct ConnShared {
    to_server: Pipe,
    to_client: Pipe,
    closed: AtomicBool,
}

impl ConnShared {
    fn new() -> Self {
        Self {
            to_server: Pipe::new(),
            to_client: Pipe::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.to_server.wake_all();
        self.to_client.wake_all();
    }

    fn check_open(&self) -> ReplResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ReplError::net("session closed"))
        } else {
            Ok(())
        }
    }
}

struct NetInner {
    listeners: Mutex<HashMap<String, Sender<ChannelServerConn>>>,
    sessions: Mutex<HashMap<u64, Arc<ConnShared>>>,
    next_session_id: AtomicU64,
}

/// In-process loopback network.
///
/// Endpoints registered with [`ChannelNetwork::listen`] receive one
/// [`ChannelServerConn`] per client connect; clients and server conns talk
/// through paired line queues with timeouts.
#[derive(Clone)]
pub struct ChannelNetwork {
    inner: Arc<NetInner>,
}

impl ChannelNetwork {
    /// Creates an empty loopback network.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetInner {
                listeners: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers a listener on `host:port`; accepted connections arrive on
    /// the returned receiver.
    pub fn listen(&self, host: &str, port: u16) -> Receiver<ChannelServerConn> {
        let (sender, receiver) = channel();
        self.inner
            .listeners
            .lock()
            .insert(format!("{host}:{port}"), sender);
        receiver
    }
}

impl Default for ChannelNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkService for ChannelNetwork {
    fn create_blocking_client(&self, _buf_bytes: usize) -> Box<dyn BlockingClient> {
        Box::new(ChannelClient {
            inner: Arc::clone(&self.inner),
            shared: None,
            session_id: SESSION_NONE,
            remote: String::new(),
        })
    }

    fn cancel_session(&self, session_id: u64) -> ReplResult<()> {
        let shared = self.inner.sessions.lock().remove(&session_id);
        match shared {
            Some(shared) => {
                shared.close();
                Ok(())
            }
            None => Err(ReplError::net(format!("no such session {session_id}"))),
        }
    }
}

/// Client half of a loopback connection.
pub struct ChannelClient {
    inner: Arc<NetInner>,
    shared: Option<Arc<ConnShared>>,
    session_id: u64,
    remote: String,
}

impl ChannelClient {
    fn shared(&self) -> ReplResult<&Arc<ConnShared>> {
        self.shared
            .as_ref()
            .ok_or_else(|| ReplError::net("not connected"))
    }
}

impl BlockingClient for ChannelClient {
    fn connect(&mut self, host: &str, port: u16, _timeout: Duration) -> ReplResult<()> {
        let addr = format!("{host}:{port}");
        let shared = Arc::new(ConnShared::new());
        let session_id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst);

        let listeners = self.inner.listeners.lock();
        let listener = listeners
            .get(&addr)
            .ok_or_else(|| ReplError::net(format!("connection refused: {addr}")))?;
        listener
            .send(ChannelServerConn {
                shared: Arc::clone(&shared),
                peer: format!("client-{session_id}"),
            })
            .map_err(|_| ReplError::net(format!("connection refused: {addr}")))?;
        drop(listeners);

        self.inner
            .sessions
            .lock()
            .insert(session_id, Arc::clone(&shared));
        self.shared = Some(shared);
        self.session_id = session_id;
        self.remote = addr;
        Ok(())
    }

    fn write_line(&mut self, line: &str, _timeout: Duration) -> ReplResult<()> {
        let shared = self.shared()?;
        shared.check_open()?;
        shared.to_server.push(line.to_string());
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> ReplResult<String> {
        let shared = self.shared()?;
        shared.to_client.pop(timeout, &shared.closed)
    }

    fn remote_repr(&self) -> String {
        if self.remote.is_empty() {
            "???".to_string()
        } else {
            self.remote.clone()
        }
    }

    fn session_id(&self) -> u64 {
        self.session_id
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            shared.close();
        }
        if self.session_id != SESSION_NONE {
            self.inner.sessions.lock().remove(&self.session_id);
        }
    }
}

/// Server half of a loopback connection.
pub struct ChannelServerConn {
    shared: Arc<ConnShared>,
    peer: String,
}

impl ChannelServerConn {
    /// Reads one line from the client.
    pub fn read_line(&self, timeout: Duration) -> ReplResult<String> {
        self.shared.to_server.pop(timeout, &self.shared.closed)
    }

    /// Writes one line to the client.
    pub fn write_line(&self, line: &str) -> ReplResult<()> {
        self.shared.check_open()?;
        self.shared.to_client.push(line.to_string());
        Ok(())
    }

    /// Human-readable peer name.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Closes the connection; the client observes a transport error.
    pub fn close(&self) {
        self.shared.close();
    }
}

struct Bucket {
    available: f64,
    last_refill: Instant,
}

/// A shared token bucket gating bulk data transfer.
///
/// The bucket holds at most one second of budget; callers asking for more
/// than the burst are clamped to it.
pub struct RateLimiter {
    bytes_per_sec: u64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Creates a limiter with the given rate; `0` disables limiting.
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            bucket: Mutex::new(Bucket {
                available: bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// The configured rate.
    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Blocks until `bytes` of budget are available, then consumes them.
    pub fn consume(&self, bytes: u64) {
        if self.bytes_per_sec == 0 {
            return;
        }
        let rate = self.bytes_per_sec as f64;
        let want = (bytes as f64).min(rate);
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.available = (bucket.available + elapsed * rate).min(rate);
                bucket.last_refill = now;
                if bucket.available >= want {
                    bucket.available -= want;
                    return;
                }
                Duration::from_secs_f64((want - bucket.available) / rate)
            };
            std::thread::sleep(wait.min(Duration::from_millis(50)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[test]
    fn connect_refused_without_listener() {
        let net = ChannelNetwork::new();
        let mut client = net.create_blocking_client(1024);
        assert!(client.connect("nowhere", 1, TIMEOUT).is_err());
    }

    #[test]
    fn lines_flow_both_ways() {
        let net = ChannelNetwork::new();
        let accepted = net.listen("master", 7000);
        let mut client = net.create_blocking_client(1024);
        client.connect("master", 7000, TIMEOUT).unwrap();
        let conn = accepted.recv().unwrap();

        client.write_line("PING", TIMEOUT).unwrap();
        assert_eq!(conn.read_line(TIMEOUT).unwrap(), "PING");
        conn.write_line("+PONG").unwrap();
        assert_eq!(client.read_line(TIMEOUT).unwrap(), "+PONG");
        assert_eq!(client.remote_repr(), "master:7000");
    }

    #[test]
    fn read_times_out_when_idle() {
        let net = ChannelNetwork::new();
        let _accepted = net.listen("master", 7000);
        let mut client = net.create_blocking_client(1024);
        client.connect("master", 7000, TIMEOUT).unwrap();
        assert!(client
            .read_line(Duration::from_millis(20))
            .unwrap_err()
            .is_timeout());
    }

    #[test]
    fn cancel_session_closes_both_ends() {
        let net = ChannelNetwork::new();
        let accepted = net.listen("master", 7000);
        let mut client = net.create_blocking_client(1024);
        client.connect("master", 7000, TIMEOUT).unwrap();
        let conn = accepted.recv().unwrap();

        net.cancel_session(client.session_id()).unwrap();
        assert!(client.read_line(TIMEOUT).is_err());
        assert!(conn.read_line(TIMEOUT).is_err());
        assert!(client.write_line("late", TIMEOUT).is_err());
    }

    #[test]
    fn cancel_unknown_session_errors() {
        let net = ChannelNetwork::new();
        assert!(net.cancel_session(42).is_err());
    }

    #[test]
    fn rate_limiter_blocks_past_burst() {
        let limiter = RateLimiter::new(1000);
        limiter.consume(1000); // burst drains instantly
        let start = Instant::now();
        limiter.consume(100);
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn rate_limiter_zero_is_unlimited() {
        let limiter = RateLimiter::new(0);
        let start = Instant::now();
        limiter.consume(u64::MAX);
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
