//! Exchange session: one endpoint of the protocol wrapping one socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::codec::{Codec, JsonCodec};
use crate::error::{ExchangeError, Result};
use crate::events::{Received, StateChange};
use crate::frame::{Frame, DEFAULT_MAX_FRAME_LEN, HEADER_LEN};
use crate::state::SessionState;

/// Connect deadline used by the convenience factories.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for an exchange session.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Exchange code frames must carry to be accepted. Must not be zero.
    pub exchange_code: i32,
    /// Maximum total frame length, either direction.
    pub max_frame_len: usize,
    /// Enable TCP_NODELAY on attached streams.
    pub nodelay: bool,
    /// How long `close` waits for the receive loop before aborting it.
    pub shutdown_grace: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            exchange_code: crate::frame::DEFAULT_EXCHANGE_CODE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            nodelay: true,
            shutdown_grace: Duration::from_millis(250),
        }
    }
}

impl ExchangeConfig {
    /// Set the exchange code.
    pub fn with_exchange_code(mut self, code: i32) -> Self {
        self.exchange_code = code;
        self
    }

    /// Set the maximum frame length.
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Enable or disable TCP_NODELAY.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Socket-based object exchanger.
///
/// Cloning a session clones a handle to the same underlying endpoint.
/// Events are delivered over broadcast channels obtained from
/// [`subscribe_state`](Self::subscribe_state) and
/// [`subscribe_objects`](Self::subscribe_objects).
#[derive(Debug)]
pub struct ExchangeSession<C: Codec = JsonCodec> {
    inner: Arc<Inner<C>>,
}

impl<C: Codec> Clone for ExchangeSession<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
struct Inner<C: Codec> {
    config: ExchangeConfig,
    codec: C,
    owner: bool,
    code: AtomicI32,
    disposed: AtomicBool,
    state: Mutex<SessionState>,
    listener: Mutex<Option<TcpListener>>,
    /// Coarse lock scoping "read one frame"; the loop and a standalone
    /// `receive_object` never interleave partial frames.
    reader: AsyncMutex<Option<OwnedReadHalf>>,
    /// Held for one whole frame, so sends are frame-atomic.
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    local_bind: Option<SocketAddr>,
    local_addr: Mutex<Option<SocketAddr>>,
    peer_addr: Mutex<Option<SocketAddr>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    state_tx: broadcast::Sender<StateChange>,
    object_tx: broadcast::Sender<Received>,
}

impl ExchangeSession<JsonCodec> {
    /// Create a server session bound to `local`, owning its listener.
    pub async fn create_server(local: SocketAddr) -> Result<Self> {
        Self::create_server_with(local, ExchangeConfig::default(), JsonCodec).await
    }

    /// Create a client session with no stream attached yet.
    pub fn create_client() -> Result<Self> {
        Self::build(true, None, None, ExchangeConfig::default(), JsonCodec)
    }

    /// Wrap a caller-supplied connected stream with default settings.
    ///
    /// `owner = false` models a borrowed socket: `close` will not drop it.
    pub fn from_stream(stream: TcpStream, owner: bool) -> Result<Self> {
        Self::from_stream_with(stream, owner, ExchangeConfig::default(), JsonCodec)
    }
}

impl<C: Codec + 'static> ExchangeSession<C> {
    /// Create a server session with explicit configuration and codec.
    pub async fn create_server_with(
        local: SocketAddr,
        config: ExchangeConfig,
        codec: C,
    ) -> Result<Self> {
        let listener = TcpListener::bind(local).await?;
        let session = Self::build(true, None, None, config, codec)?;

        *session.inner.local_addr.lock() = listener.local_addr().ok();
        *session.inner.listener.lock() = Some(listener);

        Ok(session)
    }

    /// Create a client session, optionally bound to a local address and
    /// optionally connected to `remote` right away.
    ///
    /// With a `remote`, a failed connect still returns the session — in
    /// the `TIMEOUT` state, exactly as a failed [`connect`](Self::connect)
    /// would leave it.
    pub async fn create_client_with(
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        timeout: Duration,
        config: ExchangeConfig,
        codec: C,
    ) -> Result<Self> {
        let session = Self::build(true, local, None, config, codec)?;

        if let Some(remote) = remote {
            session.connect(remote, timeout).await?;
        }

        Ok(session)
    }

    /// Wrap a caller-supplied connected stream.
    pub fn from_stream_with(
        stream: TcpStream,
        owner: bool,
        config: ExchangeConfig,
        codec: C,
    ) -> Result<Self> {
        Self::build(owner, None, Some(stream), config, codec)
    }

    fn build(
        owner: bool,
        local_bind: Option<SocketAddr>,
        stream: Option<TcpStream>,
        config: ExchangeConfig,
        codec: C,
    ) -> Result<Self> {
        if config.exchange_code == 0 {
            return Err(ExchangeError::ZeroExchangeCode);
        }

        let (shutdown, _) = watch::channel(false);
        let (state_tx, _) = broadcast::channel(64);
        let (object_tx, _) = broadcast::channel(256);

        let mut reader = None;
        let mut writer = None;
        let mut local_addr = None;
        let mut peer_addr = None;
        let mut state = SessionState::DISCONNECTED;

        if let Some(stream) = stream {
            if config.nodelay {
                stream.set_nodelay(true)?;
            }
            local_addr = stream.local_addr().ok();
            peer_addr = stream.peer_addr().ok();

            let (r, w) = stream.into_split();
            reader = Some(r);
            writer = Some(w);
            state = SessionState::CONNECTED;
        }

        Ok(Self {
            inner: Arc::new(Inner {
                code: AtomicI32::new(config.exchange_code),
                config,
                codec,
                owner,
                disposed: AtomicBool::new(false),
                state: Mutex::new(state),
                listener: Mutex::new(None),
                reader: AsyncMutex::new(reader),
                writer: AsyncMutex::new(writer),
                local_bind,
                local_addr: Mutex::new(local_addr),
                peer_addr: Mutex::new(peer_addr),
                worker: Mutex::new(None),
                shutdown,
                state_tx,
                object_tx,
            }),
        })
    }

    /// Connect to a remote endpoint with a deadline.
    ///
    /// Valid only from `DISCONNECTED` (otherwise returns `Ok(false)`).
    /// Success leaves the session `CONNECTED`; a miss of the deadline or
    /// a refusal leaves it in the `TIMEOUT` error state and returns
    /// `Ok(false)`.
    pub async fn connect(&self, remote: SocketAddr, timeout: Duration) -> Result<bool> {
        self.inner.ensure_open()?;

        if self.state() != SessionState::DISCONNECTED {
            return Ok(false);
        }

        let local_bind = self.inner.local_bind;
        let attempt = async {
            match local_bind {
                Some(local) => {
                    let socket = if local.is_ipv4() {
                        TcpSocket::new_v4()
                    } else {
                        TcpSocket::new_v6()
                    }?;
                    socket.bind(local)?;
                    socket.connect(remote).await
                }
                None => TcpStream::connect(remote).await,
            }
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(stream)) => {
                self.inner.attach_stream(stream).await?;
                self.inner.set_state(SessionState::CONNECTED);
                Ok(true)
            }
            Ok(Err(err)) => {
                tracing::debug!(%remote, error = %err, "connect failed");
                self.inner.set_state(SessionState::TIMEOUT);
                Ok(false)
            }
            Err(_) => {
                tracing::debug!(%remote, ?timeout, "connect deadline missed");
                self.inner.set_state(SessionState::TIMEOUT);
                Ok(false)
            }
        }
    }

    /// Start the background receive loop.
    ///
    /// No-op when the session is already listening or serving. With
    /// `auto_accept`, an owned listener waits for one peer and serves it
    /// (one listening session services exactly one peer at a time); the
    /// accepted stream is then closed when the loop ends. Without a
    /// stream or an accept path the loop refuses with
    /// `ERROR_DISCONNECTED`.
    pub fn start_listening(&self, auto_accept: bool) -> Result<()> {
        self.inner.ensure_open()?;

        let mut worker = self.inner.worker.lock();

        if self.state().is_listening() {
            return Ok(());
        }
        if let Some(handle) = worker.as_ref() {
            if !handle.is_finished() {
                return Ok(());
            }
        }

        let _ = self.inner.shutdown.send(false);
        let weak = Arc::downgrade(&self.inner);
        *worker = Some(tokio::spawn(receive_loop(weak, auto_accept)));

        Ok(())
    }

    /// Send one object, swallowing every failure into the return value.
    ///
    /// The frame is written whole under the writer lock; concurrent sends
    /// cannot interleave. No event is raised on failure.
    pub async fn send_object<T: Serialize>(&self, value: &T) -> bool {
        self.send_object_as(value, &self.inner.codec).await
    }

    /// [`send_object`](Self::send_object) with a one-off codec.
    pub async fn send_object_as<T: Serialize>(&self, value: &T, codec: &C) -> bool {
        match self.inner.try_send(value, codec).await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(error = %err, "send_object failed");
                false
            }
        }
    }

    /// Read one frame from the stream, outside the receive loop.
    ///
    /// `Ok(None)` when no stream is attached, or when `wait` is false and
    /// the stream runs dry partway through a frame — in that case the
    /// frame may be partially consumed and the stream left
    /// desynchronized; callers mixing `wait = false` with live traffic
    /// accept that hazard. A complete frame with a foreign exchange code
    /// comes back with [`Received::value`] empty.
    pub async fn receive_object(&self, wait: bool) -> Result<Option<Received>> {
        self.receive_object_as(wait, &self.inner.codec).await
    }

    /// [`receive_object`](Self::receive_object) with a one-off codec.
    pub async fn receive_object_as(&self, wait: bool, codec: &C) -> Result<Option<Received>> {
        self.inner.ensure_open()?;

        let mut guard = self.inner.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Ok(None);
        };
        self.inner.read_frame(reader, wait, codec).await
    }

    /// Close the session. Idempotent.
    ///
    /// Signals the receive loop, waits out the grace period (then aborts
    /// it), and — when this session owns the socket — drops the listener
    /// and stream. Later operations fail fast with
    /// [`ExchangeError::Disposed`].
    pub async fn close(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown.send(true);

        let worker = self.inner.worker.lock().take();
        if let Some(mut handle) = worker {
            let grace = self.inner.config.shutdown_grace;
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
                let _ = handle.await;
            }
        }

        if self.inner.owner {
            self.inner.listener.lock().take();
            self.inner.drop_stream().await;
        }

        self.inner.set_state(SessionState::CLOSED);
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// The exchange code frames must carry to be accepted.
    pub fn exchange_code(&self) -> i32 {
        self.inner.code.load(Ordering::Relaxed)
    }

    /// Replace the exchange code. Zero is rejected.
    pub fn set_exchange_code(&self, code: i32) -> Result<()> {
        if code == 0 {
            return Err(ExchangeError::ZeroExchangeCode);
        }
        self.inner.code.store(code, Ordering::Relaxed);
        Ok(())
    }

    /// True when this session owns (and will close) its socket.
    pub fn is_socket_owner(&self) -> bool {
        self.inner.owner
    }

    /// True once [`close`](Self::close) has run.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Local address of the listener or stream, when bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Peer address of the attached stream, when connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.inner.peer_addr.lock()
    }

    /// The session's codec.
    pub fn codec(&self) -> &C {
        &self.inner.codec
    }

    /// Subscribe to state-change notifications.
    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChange> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to received-object notifications from the receive loop.
    pub fn subscribe_objects(&self) -> broadcast::Receiver<Received> {
        self.inner.object_tx.subscribe()
    }
}

impl<C: Codec> Inner<C> {
    fn ensure_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ExchangeError::Disposed);
        }
        Ok(())
    }

    fn code(&self) -> i32 {
        self.code.load(Ordering::Relaxed)
    }

    fn set_state(&self, new: SessionState) {
        {
            let mut state = self.state.lock();
            if *state == new {
                return;
            }
            *state = new;
        }
        let _ = self.state_tx.send(StateChange::new(new));
    }

    fn set_state_with_error(&self, new: SessionState, error: Arc<ExchangeError>) {
        *self.state.lock() = new;
        let _ = self.state_tx.send(StateChange::with_error(new, error));
    }

    async fn attach_stream(&self, stream: TcpStream) -> Result<()> {
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        *self.local_addr.lock() = stream.local_addr().ok();
        *self.peer_addr.lock() = stream.peer_addr().ok();

        let (r, w) = stream.into_split();
        *self.reader.lock().await = Some(r);
        *self.writer.lock().await = Some(w);
        Ok(())
    }

    async fn drop_stream(&self) {
        *self.reader.lock().await = None;
        *self.writer.lock().await = None;
        *self.peer_addr.lock() = None;
    }

    async fn has_stream(&self) -> bool {
        self.reader.lock().await.is_some()
    }

    async fn try_send<T: Serialize>(&self, value: &T, codec: &C) -> Result<()> {
        self.ensure_open()?;

        let frame = Frame::for_object(value, self.code(), codec)?;
        let bytes = frame.encode(self.config.max_frame_len)?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ExchangeError::NotConnected)?;

        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// One loop iteration: peek for a header, then read one frame.
    ///
    /// `Ok(None)` means "no full header yet"; a zero-byte peek means the
    /// peer closed the stream.
    async fn poll_frame(&self) -> Result<Option<Received>> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(ExchangeError::NotConnected)?;

        let mut header = [0u8; 4];
        let n = reader.peek(&mut header).await?;
        if n == 0 {
            return Err(ExchangeError::PeerClosed);
        }
        if n < header.len() {
            return Ok(None);
        }

        self.read_frame(reader, true, &self.codec).await
    }

    async fn read_frame(
        &self,
        reader: &mut OwnedReadHalf,
        wait: bool,
        codec: &C,
    ) -> Result<Option<Received>> {
        let mut len_buf = [0u8; 4];
        if wait {
            reader.read_exact(&mut len_buf).await?;
        } else if !try_fill(reader, &mut len_buf)? {
            return Ok(None);
        }

        let total = u32::from_le_bytes(len_buf) as usize;
        if total < HEADER_LEN {
            return Err(ExchangeError::InvalidFrame(format!(
                "frame length {} below header size",
                total
            )));
        }
        if total > self.config.max_frame_len {
            return Err(ExchangeError::FrameTooLarge {
                size: total,
                max: self.config.max_frame_len,
            });
        }

        let mut buf = vec![0u8; total];
        buf[..4].copy_from_slice(&len_buf);
        if wait {
            reader.read_exact(&mut buf[4..]).await?;
        } else if !try_fill(reader, &mut buf[4..])? {
            // Frame abandoned mid-read; the stream is desynchronized
            // until the peer's next frame boundary happens to line up.
            return Ok(None);
        }

        let raw = Bytes::from(buf);
        let frame = Frame::decode(&raw)?;

        let value = if frame.exchange_code == self.code() {
            match std::str::from_utf8(&frame.payload) {
                Ok(text) => match codec.decode::<serde_json::Value>(text) {
                    Ok(value) => Some(value),
                    Err(err) => {
                        tracing::debug!(type_name = %frame.type_name, error = %err,
                            "payload did not decode");
                        None
                    }
                },
                Err(err) => {
                    tracing::debug!(type_name = %frame.type_name, error = %err,
                        "payload is not UTF-8");
                    None
                }
            }
        } else {
            tracing::warn!(
                got = frame.exchange_code,
                want = self.code(),
                type_name = %frame.type_name,
                "discarding frame with foreign exchange code"
            );
            None
        };

        Ok(Some(Received {
            value,
            type_name: frame.type_name,
            raw,
            timestamp: SystemTime::now(),
        }))
    }
}

/// Fill `buf` from whatever is immediately available.
///
/// `Ok(false)` when the stream runs dry before the buffer fills; bytes
/// already read stay consumed.
fn try_fill(reader: &OwnedReadHalf, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.try_read(&mut buf[filled..]) {
            Ok(0) => return Err(ExchangeError::PeerClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

enum LoopExit {
    /// The loop never got a stream to serve.
    Refused,
    /// Cancelled, or every session handle was dropped.
    Stopped,
}

/// Background receive loop, one task per session.
///
/// Holds only a weak reference between iterations so that dropping every
/// session handle lets the task unwind.
async fn receive_loop<C: Codec + 'static>(weak: Weak<Inner<C>>, auto_accept: bool) {
    let mut ephemeral = false;
    let result = pump(&weak, auto_accept, &mut ephemeral).await;

    let Some(inner) = weak.upgrade() else { return };

    match result {
        Ok(LoopExit::Refused) => {}
        Ok(LoopExit::Stopped) => {
            if ephemeral {
                inner.drop_stream().await;
                inner.set_state(SessionState::CLOSED);
            } else {
                inner.set_state(SessionState::CONNECTED);
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "receive loop failed");
            inner.set_state_with_error(SessionState::ERROR, Arc::new(err));
            if ephemeral {
                inner.drop_stream().await;
            }
        }
    }
}

async fn pump<C: Codec>(
    weak: &Weak<Inner<C>>,
    auto_accept: bool,
    ephemeral: &mut bool,
) -> Result<LoopExit> {
    let mut shutdown = {
        let Some(inner) = weak.upgrade() else {
            return Ok(LoopExit::Stopped);
        };
        let mut rx = inner.shutdown.subscribe();
        if *rx.borrow() {
            return Ok(LoopExit::Stopped);
        }

        if !inner.has_stream().await {
            let listener = inner.listener.lock().take();
            match listener {
                Some(listener) if auto_accept && inner.owner => {
                    // The listener is consumed: this session now serves
                    // the one accepted peer, and closes it on exit.
                    *ephemeral = true;
                    inner.set_state(SessionState::WAITING);

                    let stream = tokio::select! {
                        _ = rx.changed() => return Ok(LoopExit::Stopped),
                        accepted = listener.accept() => accepted?.0,
                    };
                    inner.attach_stream(stream).await?;
                }
                other => {
                    *inner.listener.lock() = other;
                    inner.set_state(SessionState::ERROR_DISCONNECTED);
                    return Ok(LoopExit::Refused);
                }
            }
        }

        let peer = *inner.peer_addr.lock();
        tracing::debug!(?peer, "receive loop serving");
        inner.set_state(SessionState::SERVING | SessionState::CONNECTED);
        rx
    };

    loop {
        let Some(inner) = weak.upgrade() else {
            return Ok(LoopExit::Stopped);
        };
        if *shutdown.borrow() {
            return Ok(LoopExit::Stopped);
        }

        let step = tokio::select! {
            _ = shutdown.changed() => return Ok(LoopExit::Stopped),
            step = inner.poll_frame() => step?,
        };

        match step {
            Some(received) => {
                let _ = inner.object_tx.send(received);
            }
            None => tokio::task::yield_now().await,
        }
    }
}
