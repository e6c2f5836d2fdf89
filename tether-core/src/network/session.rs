//! One point-to-point TCP link carrying newline-delimited JSON.
//!
//! A [`LinkSession`] is single-use: `Idle → Connecting → Connected`,
//! then `Closed` or `Failed`. Inbound frames are read by a background
//! receive task and either handed to a [`FrameHandler`] or queued on
//! the [`LinkEvents`] stream. The terminal `Disconnected` event is
//! delivered exactly once, after the last frame.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{Frame, JsonLineCodec, MAX_FRAME_LENGTH};
use crate::error::{EncodeError, FrameError, LinkError};
use crate::state::LinkState;

/// Floor for [`LinkOptions::read_timeout`]; a zero timeout would spin
/// the receive loop.
pub const MIN_READ_TIMEOUT: Duration = Duration::from_millis(10);

// ── Endpoint / Options ───────────────────────────────────────────

/// Remote `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Tunables for a [`LinkSession`].
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Deadline for the TCP connect.
    pub connect_timeout: Duration,
    /// Upper bound on one read; the receive loop re-checks its stop
    /// flag at least this often. Raised to [`MIN_READ_TIMEOUT`].
    pub read_timeout: Duration,
    /// Capacity of the frame queue behind [`LinkEvents`].
    pub event_capacity: usize,
    /// Longest accepted inbound line.
    pub max_frame_length: usize,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(1),
            event_capacity: 256,
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }
}

// ── Events ───────────────────────────────────────────────────────

/// Why a connected session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed its end (zero-length read).
    RemoteClosed,
    /// A read failed mid-stream.
    Reset(String),
    /// A write failed mid-stream.
    WriteFailed(String),
    /// `close()` was called.
    Local,
}

impl DisconnectReason {
    /// Whether the session ends in `Failed` rather than `Closed`.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Reset(_) | Self::WriteFailed(_))
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteClosed => write!(f, "remote closed the connection"),
            Self::Reset(e) => write!(f, "connection reset: {e}"),
            Self::WriteFailed(e) => write!(f, "write failed: {e}"),
            Self::Local => write!(f, "closed locally"),
        }
    }
}

/// Something the receive side has to report.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// One inbound JSON object (only when no handler is installed).
    Frame(Value),
    /// One inbound line was skipped.
    ParseError(FrameError),
    /// The session ended. Always the last event.
    Disconnected { reason: DisconnectReason },
}

/// Synchronous consumer of inbound frames, run on the receive task.
///
/// Implementations must not block for long: the socket is not read
/// while a handler runs.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, frame: Value);

    fn on_parse_error(&self, _error: &FrameError) {}
}

/// Receiving half of a session's events.
#[derive(Debug)]
pub struct LinkEvents {
    queue: mpsc::Receiver<LinkEvent>,
    terminal: Option<oneshot::Receiver<DisconnectReason>>,
}

impl LinkEvents {
    /// Next event, or `None` once the session is over and drained.
    ///
    /// Frames come first; `Disconnected` is yielded once the receive
    /// task has finished, so it is never followed by another frame.
    pub async fn recv(&mut self) -> Option<LinkEvent> {
        if let Some(event) = self.queue.recv().await {
            return Some(event);
        }
        let terminal = self.terminal.take()?;
        terminal
            .await
            .ok()
            .map(|reason| LinkEvent::Disconnected { reason })
    }
}

/// Counters, snapshot form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub parse_errors: u64,
}

// ── LinkSession ──────────────────────────────────────────────────

/// Handle to one TCP session. Cheap to clone; all clones share it.
#[derive(Clone)]
pub struct LinkSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    endpoint: Endpoint,
    options: LinkOptions,
    handler: Option<Arc<dyn FrameHandler>>,

    shared: Mutex<Shared>,
    writer: tokio::sync::Mutex<Option<FramedWrite<OwnedWriteHalf, JsonLineCodec>>>,
    /// Serialises `close()` callers; holds the receive task until joined.
    receiver: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,

    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    parse_errors: AtomicU64,
}

struct Shared {
    state: LinkState,
    /// Frame queue sender, parked here until the receive task takes it.
    queue: Option<mpsc::Sender<LinkEvent>>,
    /// Taken by whoever first moves the session to a terminal state.
    terminal: Option<oneshot::Sender<DisconnectReason>>,
}

impl fmt::Debug for LinkSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkSession")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl LinkSession {
    /// A new `Idle` session whose frames are queued on the returned
    /// [`LinkEvents`].
    pub fn new(endpoint: Endpoint, options: LinkOptions) -> (Self, LinkEvents) {
        Self::build(endpoint, options, None)
    }

    /// A new `Idle` session whose frames go to `handler` instead of the
    /// queue. Parse errors and `Disconnected` still arrive on
    /// [`LinkEvents`].
    pub fn with_handler(
        endpoint: Endpoint,
        options: LinkOptions,
        handler: Arc<dyn FrameHandler>,
    ) -> (Self, LinkEvents) {
        Self::build(endpoint, options, Some(handler))
    }

    /// `new` followed by `open`.
    pub async fn connect(
        endpoint: Endpoint,
        options: LinkOptions,
    ) -> Result<(Self, LinkEvents), LinkError> {
        let (session, events) = Self::new(endpoint, options);
        session.open().await?;
        Ok((session, events))
    }

    fn build(
        endpoint: Endpoint,
        mut options: LinkOptions,
        handler: Option<Arc<dyn FrameHandler>>,
    ) -> (Self, LinkEvents) {
        options.read_timeout = options.read_timeout.max(MIN_READ_TIMEOUT);
        let (queue_tx, queue_rx) = mpsc::channel(options.event_capacity.max(1));
        let (terminal_tx, terminal_rx) = oneshot::channel();

        let inner = Arc::new(SessionInner {
            endpoint,
            options,
            handler,
            shared: Mutex::new(Shared {
                state: LinkState::Idle,
                queue: Some(queue_tx),
                terminal: Some(terminal_tx),
            }),
            writer: tokio::sync::Mutex::new(None),
            receiver: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
        });

        let events = LinkEvents {
            queue: queue_rx,
            terminal: Some(terminal_rx),
        };
        (Self { inner }, events)
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn state(&self) -> LinkState {
        self.inner.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            frames_received: self.inner.frames_received.load(Ordering::Relaxed),
            frames_sent: self.inner.frames_sent.load(Ordering::Relaxed),
            parse_errors: self.inner.parse_errors.load(Ordering::Relaxed),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Connect and start the receive task.
    ///
    /// On failure the session ends in `Failed` and no `Disconnected`
    /// event is emitted, since it was never connected.
    pub async fn open(&self) -> Result<(), LinkError> {
        self.inner.shared.lock().state.begin_connect()?;

        let inner = &self.inner;
        let addr = inner.endpoint.to_string();
        debug!(peer = %addr, "connecting");

        let connect = TcpStream::connect((inner.endpoint.host.as_str(), inner.endpoint.port));
        let attempt = tokio::select! {
            _ = inner.cancel.cancelled() => None,
            r = timeout(inner.options.connect_timeout, connect) => Some(r),
        };

        let stream = match attempt {
            None => {
                inner.abandon(false);
                return Err(LinkError::InvalidState("session closed while connecting"));
            }
            Some(Err(_elapsed)) => {
                inner.abandon(true);
                warn!(peer = %addr, timeout = ?inner.options.connect_timeout, "connect timed out");
                return Err(LinkError::ConnectTimeout {
                    addr,
                    timeout: inner.options.connect_timeout,
                });
            }
            Some(Ok(Err(source))) => {
                inner.abandon(true);
                warn!(peer = %addr, error = %source, "connect failed");
                return Err(LinkError::ConnectRefused { addr, source });
            }
            Some(Ok(Ok(stream))) => stream,
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %addr, error = %e, "TCP_NODELAY not set");
        }
        let (read_half, write_half) = stream.into_split();
        *inner.writer.lock().await = Some(FramedWrite::new(
            write_half,
            JsonLineCodec::with_max_length(inner.options.max_frame_length),
        ));

        let queue = {
            let mut shared = inner.shared.lock();
            if inner.cancel.is_cancelled() {
                None
            } else {
                shared.state.complete_connect()?;
                shared.queue.take()
            }
        };
        let Some(queue) = queue else {
            inner.writer.lock().await.take();
            inner.abandon(false);
            return Err(LinkError::InvalidState("session closed while connecting"));
        };

        let reader = FramedRead::new(
            read_half,
            JsonLineCodec::with_max_length(inner.options.max_frame_length),
        );
        let task = tokio::spawn(receive_loop(Arc::clone(inner), reader, queue));
        *inner.receiver.lock().await = Some(task);

        info!(peer = %addr, "link connected");
        Ok(())
    }

    /// Write one message as a frame.
    ///
    /// A socket failure returns `LinkBroken` and ends the session in
    /// `Failed`. An unserializable message returns `Encode` and leaves
    /// the session untouched.
    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), LinkError> {
        let value = serde_json::to_value(message).map_err(EncodeError::from)?;

        let mut guard = self.inner.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(LinkError::LinkBroken(format!(
                "session is {}",
                self.state()
            )));
        };

        let result = tokio::select! {
            _ = self.inner.cancel.cancelled() => {
                return Err(LinkError::LinkBroken("session closing".into()));
            }
            r = writer.send(value) => r,
        };

        match result {
            Ok(()) => {
                self.inner.frames_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                guard.take();
                drop(guard);
                warn!(peer = %self.inner.endpoint, error = %e, "write failed, closing link");
                self.inner.cancel.cancel();
                self.inner
                    .settle(DisconnectReason::WriteFailed(e.to_string()));
                Err(LinkError::LinkBroken(e.to_string()))
            }
        }
    }

    /// Tear the session down. Idempotent and safe to call concurrently;
    /// every caller returns once the receive task has stopped.
    pub async fn close(&self) {
        let was_connected = {
            let mut shared = self.inner.shared.lock();
            match shared.state {
                LinkState::Idle => {
                    shared.state.finish_close();
                    shared.queue.take();
                    shared.terminal.take();
                    return;
                }
                LinkState::Connected { .. } => shared.state.begin_close().is_ok(),
                _ => false,
            }
        };

        self.inner.cancel.cancel();

        let mut receiver = self.inner.receiver.lock().await;
        if let Some(writer) = self.inner.writer.lock().await.take() {
            let mut half = writer.into_inner();
            if let Err(e) = half.shutdown().await {
                trace!(error = %e, "shutdown on closing link");
            }
        }
        if let Some(task) = receiver.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "receive task ended abnormally");
            }
        }
        if was_connected && self.inner.settle(DisconnectReason::Local) {
            info!(peer = %self.inner.endpoint, "link closed");
        }
    }
}

impl SessionInner {
    /// Move to the terminal state for `reason` and emit `Disconnected`
    /// unless another path already did. Returns whether this call did.
    fn settle(&self, reason: DisconnectReason) -> bool {
        let mut shared = self.shared.lock();
        let uptime = shared.state.connected_duration();
        if reason.is_failure() {
            let _ = shared.state.fail();
        } else {
            shared.state.finish_close();
        }
        match shared.terminal.take() {
            Some(tx) => {
                debug!(peer = %self.endpoint, ?uptime, %reason, "session ended");
                let _ = tx.send(reason);
                true
            }
            None => false,
        }
    }

    /// End a session that never reached `Connected`, without an event.
    fn abandon(&self, failed: bool) {
        let mut shared = self.shared.lock();
        if failed {
            let _ = shared.state.fail();
        } else {
            shared.state.finish_close();
        }
        shared.queue.take();
        shared.terminal.take();
    }
}

// ── Receive loop ─────────────────────────────────────────────────

async fn receive_loop(
    inner: Arc<SessionInner>,
    mut reader: FramedRead<OwnedReadHalf, JsonLineCodec>,
    queue: mpsc::Sender<LinkEvent>,
) {
    let peer = inner.endpoint.to_string();

    let reason = loop {
        let next = tokio::select! {
            _ = inner.cancel.cancelled() => break None,
            r = timeout(inner.options.read_timeout, reader.next()) => r,
        };

        match next {
            Err(_elapsed) => continue,
            Ok(None) => break Some(DisconnectReason::RemoteClosed),
            Ok(Some(Err(e))) => break Some(DisconnectReason::Reset(e.to_string())),
            Ok(Some(Ok(Frame::Object(value)))) => {
                inner.frames_received.fetch_add(1, Ordering::Relaxed);
                if let Some(handler) = &inner.handler {
                    handler.on_frame(value);
                    continue;
                }
                tokio::select! {
                    _ = inner.cancel.cancelled() => break None,
                    r = queue.send(LinkEvent::Frame(value)) => {
                        if r.is_err() {
                            trace!(peer = %peer, "event receiver dropped, frame discarded");
                        }
                    }
                }
            }
            Ok(Some(Ok(Frame::Malformed(error)))) => {
                inner.parse_errors.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %peer, %error, "skipping malformed frame");
                if let Some(handler) = &inner.handler {
                    handler.on_parse_error(&error);
                }
                if queue.try_send(LinkEvent::ParseError(error)).is_err() {
                    trace!(peer = %peer, "event queue full, parse error not queued");
                }
            }
        }
    };

    // A local close settles the session itself after joining us.
    let Some(reason) = reason else {
        debug!(peer = %peer, "receive loop stopped");
        return;
    };

    if reason.is_failure() {
        warn!(peer = %peer, %reason, "link lost");
    } else {
        info!(peer = %peer, %reason, "link closed by peer");
    }
    inner.cancel.cancel();
    if let Ok(mut writer) = inner.writer.try_lock() {
        writer.take();
    }
    inner.settle(reason);
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, Endpoint::new("127.0.0.1", port))
    }

    #[test]
    fn endpoint_display() {
        assert_eq!(Endpoint::new("10.0.0.2", 5556).to_string(), "10.0.0.2:5556");
    }

    #[test]
    fn reason_classification() {
        assert!(!DisconnectReason::RemoteClosed.is_failure());
        assert!(!DisconnectReason::Local.is_failure());
        assert!(DisconnectReason::Reset("x".into()).is_failure());
        assert!(DisconnectReason::WriteFailed("x".into()).is_failure());
    }

    #[tokio::test]
    async fn frames_then_single_disconnect_on_remote_close() {
        let (listener, endpoint) = listener().await;
        let (session, mut events) = LinkSession::new(endpoint, LinkOptions::default());

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"{\"topic\":\"fc_data\"}\nnot json\n{\"topic\":\"gps\"}\n")
                .await
                .unwrap();
        });

        session.open().await.unwrap();
        assert!(session.is_connected());
        server.await.unwrap();

        let mut got = Vec::new();
        while let Some(ev) = events.recv().await {
            got.push(ev);
        }

        assert_eq!(got.len(), 4);
        assert_eq!(got[0], LinkEvent::Frame(json!({"topic": "fc_data"})));
        assert!(matches!(got[1], LinkEvent::ParseError(_)));
        assert_eq!(got[2], LinkEvent::Frame(json!({"topic": "gps"})));
        assert_eq!(
            got[3],
            LinkEvent::Disconnected {
                reason: DisconnectReason::RemoteClosed
            }
        );
        assert_eq!(session.state(), LinkState::Closed);
        assert_eq!(session.stats().frames_received, 2);
        assert_eq!(session.stats().parse_errors, 1);
    }

    #[tokio::test]
    async fn send_writes_one_line() {
        let (listener, endpoint) = listener().await;
        let (session, _events) = LinkSession::new(endpoint, LinkOptions::default());

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            sock.read_to_end(&mut buf).await.unwrap();
            buf
        });

        session.open().await.unwrap();
        session.send(&json!({"topic": "gps_nav_start"})).await.unwrap();
        session.close().await;

        let bytes = server.await.unwrap();
        assert_eq!(bytes, b"{\"topic\":\"gps_nav_start\"}\n");
        assert_eq!(session.stats().frames_sent, 1);
    }

    #[tokio::test]
    async fn local_close_emits_one_disconnect() {
        let (listener, endpoint) = listener().await;
        let (session, mut events) = LinkSession::new(endpoint, LinkOptions::default());
        let _server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(sock);
        });

        session.open().await.unwrap();
        session.close().await;
        session.close().await;

        assert_eq!(
            events.recv().await,
            Some(LinkEvent::Disconnected {
                reason: DisconnectReason::Local
            })
        );
        assert_eq!(events.recv().await, None);
        assert_eq!(session.state(), LinkState::Closed);
    }

    /// Collect events until the stream ends.
    async fn all_events(events: &mut LinkEvents) -> Vec<LinkEvent> {
        let mut got = Vec::new();
        while let Some(ev) = timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
            got.push(ev);
        }
        got
    }

    /// A peer that accepts and immediately resets the connection.
    fn resetting_peer(listener: TcpListener) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            sock.set_zero_linger().unwrap();
            drop(sock);
        })
    }

    #[tokio::test]
    async fn peer_reset_fails_session() {
        let (listener, endpoint) = listener().await;
        let (session, mut events) = LinkSession::new(endpoint, LinkOptions::default());
        let server = resetting_peer(listener);

        session.open().await.unwrap();
        server.await.unwrap();

        let got = all_events(&mut events).await;
        assert_eq!(got.len(), 1);
        assert!(
            matches!(&got[0], LinkEvent::Disconnected { reason: DisconnectReason::Reset(_) }),
            "{got:?}"
        );
        assert_eq!(session.state(), LinkState::Failed);

        let err = session.send(&json!({"topic": "late"})).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::LinkBroken);
        session.close().await;
        assert_eq!(session.state(), LinkState::Failed);
    }

    #[tokio::test]
    async fn close_racing_reset_emits_one_disconnect() {
        for _ in 0..20 {
            let (listener, endpoint) = listener().await;
            let (session, mut events) = LinkSession::new(endpoint, LinkOptions::default());
            let server = resetting_peer(listener);

            session.open().await.unwrap();
            server.await.unwrap();
            let other = session.clone();
            tokio::join!(session.close(), other.close());

            let got = all_events(&mut events).await;
            assert_eq!(got.len(), 1, "{got:?}");
            let LinkEvent::Disconnected { reason } = &got[0] else {
                panic!("unexpected {got:?}");
            };
            // Whichever path settled first decides the terminal state.
            let expected = if reason.is_failure() {
                LinkState::Failed
            } else {
                LinkState::Closed
            };
            assert_eq!(session.state(), expected, "{reason}");
        }
    }

    #[tokio::test]
    async fn write_failure_fails_session_once() {
        let (listener, endpoint) = listener().await;
        let (session, mut events) = LinkSession::new(endpoint, LinkOptions::default());
        let _server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(sock);
        });
        session.open().await.unwrap();

        // Shut our sending side so the next write hits EPIPE while the
        // connection itself stays up.
        if let Some(writer) = session.inner.writer.lock().await.as_mut() {
            writer.get_mut().shutdown().await.unwrap();
        }

        let err = session.send(&json!({"topic": "gps_nav_stop"})).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::LinkBroken);
        assert_eq!(session.state(), LinkState::Failed);

        session.close().await;
        let got = all_events(&mut events).await;
        assert_eq!(got.len(), 1, "{got:?}");
        assert!(
            matches!(&got[0], LinkEvent::Disconnected { reason: DisconnectReason::WriteFailed(_) }),
            "{got:?}"
        );
        assert_eq!(session.stats().frames_sent, 0);
        assert!(session.send(&json!({})).await.is_err());
    }

    #[tokio::test]
    async fn connect_refused_fails_without_event() {
        let (listener, endpoint) = listener().await;
        drop(listener);

        let (session, mut events) = LinkSession::new(endpoint, LinkOptions::default());
        let err = session.open().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConnectRefused);
        assert_eq!(session.state(), LinkState::Failed);
        assert_eq!(events.recv().await, None);

        // Single-use.
        assert!(matches!(session.open().await, Err(LinkError::InvalidState(_))));
    }

    #[tokio::test]
    async fn zero_read_timeout_is_raised() {
        let (listener, endpoint) = listener().await;
        let options = LinkOptions {
            read_timeout: Duration::ZERO,
            ..LinkOptions::default()
        };
        let (session, mut events) = LinkSession::new(endpoint, options);
        assert_eq!(session.inner.options.read_timeout, MIN_READ_TIMEOUT);

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            sock.write_all(b"{\"topic\":\"gps\"}\n").await.unwrap();
        });
        session.open().await.unwrap();
        server.await.unwrap();

        let got = all_events(&mut events).await;
        assert_eq!(got[0], LinkEvent::Frame(json!({"topic": "gps"})));
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn close_before_open() {
        let (session, mut events) =
            LinkSession::new(Endpoint::new("127.0.0.1", 1), LinkOptions::default());
        session.close().await;
        assert_eq!(session.state(), LinkState::Closed);
        assert_eq!(events.recv().await, None);
        assert!(session.send(&json!({})).await.is_err());
    }

    #[tokio::test]
    async fn handler_receives_frames() {
        struct Collect(Mutex<Vec<Value>>);
        impl FrameHandler for Collect {
            fn on_frame(&self, frame: Value) {
                self.0.lock().push(frame);
            }
        }

        let (listener, endpoint) = listener().await;
        let handler = Arc::new(Collect(Mutex::new(Vec::new())));
        let (session, mut events) =
            LinkSession::with_handler(endpoint, LinkOptions::default(), handler.clone());

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"{\"a\":1}\n{\"b\":2}\n").await.unwrap();
        });
        session.open().await.unwrap();
        server.await.unwrap();

        // Only the terminal event reaches the queue.
        assert!(matches!(
            events.recv().await,
            Some(LinkEvent::Disconnected { .. })
        ));
        assert_eq!(*handler.0.lock(), vec![json!({"a": 1}), json!({"b": 2})]);
    }

    #[tokio::test]
    async fn encode_error_leaves_session_connected() {
        let (listener, endpoint) = listener().await;
        let (session, _events) = LinkSession::new(endpoint, LinkOptions::default());
        let _server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(sock);
        });
        session.open().await.unwrap();

        let mut bad = std::collections::HashMap::new();
        bad.insert(vec![0u8], 1);
        let err = session.send(&bad).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::EncodeError);
        assert!(session.is_connected());
        session.close().await;
    }
}
