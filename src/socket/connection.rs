//! Connection lifecycle for the collector socket.
//!
//! A [`Connection`] makes one connect attempt on a background task, builds a
//! [`Channel`] over the stream, announces it through [`LifecycleEvent`]s, and
//! runs the receive loop until it is stopped or the channel faults. Teardown
//! happens once and always releases, in order: channel, buffered stream,
//! socket, cancellation token.

use std::io;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::socket::channel::{lock, Channel, ChannelError, ChannelRef, StreamParts};
use crate::socket::proto::Message;

/// Default values used by [`ConnectionOptions::default`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectionDefaults;

impl ConnectionDefaults {
    /// Time allowed for the single connect attempt.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(90);
    /// Sets `TCP_NODELAY` on the connected socket.
    pub const NODELAY: bool = true;
    /// Largest frame, in bytes, in either direction.
    pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;
    /// Time each teardown flush may spend on a peer that stopped reading.
    pub const RELEASE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
}

/// Tunables for a [`Connection`].
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// Upper bound for the single connect attempt.
    pub connect_timeout: Duration,
    /// Sets `TCP_NODELAY` on the socket.
    pub nodelay: bool,
    /// Largest frame accepted or produced by the channel.
    pub max_frame_length: usize,
    /// Bound on each flush performed while releasing the stream.
    pub release_flush_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: ConnectionDefaults::CONNECT_TIMEOUT,
            nodelay: ConnectionDefaults::NODELAY,
            max_frame_length: ConnectionDefaults::MAX_FRAME_LENGTH,
            release_flush_timeout: ConnectionDefaults::RELEASE_FLUSH_TIMEOUT,
        }
    }
}

impl ConnectionOptions {
    /// Overrides [`ConnectionDefaults::CONNECT_TIMEOUT`].
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Overrides [`ConnectionDefaults::NODELAY`].
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Overrides [`ConnectionDefaults::MAX_FRAME_LENGTH`].
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// Overrides [`ConnectionDefaults::RELEASE_FLUSH_TIMEOUT`].
    pub fn with_release_flush_timeout(mut self, timeout: Duration) -> Self {
        self.release_flush_timeout = timeout;
        self
    }
}

/// Where a [`Connection`] is in its lifecycle. Moves forward only.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Stopped,
}

/// Lifecycle notification delivered to subscribers.
#[derive(Clone, Debug)]
pub enum LifecycleEvent {
    /// The socket is open and the channel is ready for traffic.
    Connected { channel: ChannelRef },
    /// The connection was torn down. `cause` is `None` for a requested stop.
    Disconnected { cause: Option<Arc<ConnectionError>> },
}

/// Resources released during teardown, in release order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReleaseStep {
    Channel,
    Stream,
    Transport,
    Cancellation,
}

/// Errors that end a connection or reject a lifecycle request.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connect attempt failed.
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// The connect attempt did not finish in time.
    #[error("connect to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    /// `start` was called on a connection that is not idle.
    #[error("connection was already started")]
    AlreadyStarted,

    /// The channel faulted after the connection was established.
    #[error("channel fault: {0}")]
    Channel(#[from] ChannelError),
}

impl ConnectionError {
    /// Returns whether this error ended the initial connect attempt.
    pub fn is_connect_fault(&self) -> bool {
        matches!(
            self,
            ConnectionError::Connect { .. } | ConnectionError::ConnectTimeout { .. }
        )
    }
}

/// Receiving side of a lifecycle subscription.
pub type LifecycleListener = mpsc::UnboundedReceiver<LifecycleEvent>;

/// Cloneable handle to one outbound collector connection.
#[derive(Clone, Debug)]
pub struct Connection {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    options: ConnectionOptions,
    shared: StdMutex<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: ConnectionState,
    endpoint: Option<String>,
    channel: Option<Arc<Channel>>,
    cancel: Option<CancellationToken>,
    listeners: Vec<mpsc::UnboundedSender<LifecycleEvent>>,
    emitted: Vec<LifecycleEvent>,
    inbound: Option<mpsc::UnboundedSender<Message>>,
    inbound_taken: bool,
    release_log: Vec<ReleaseStep>,
}

impl Shared {
    fn emit(&mut self, event: LifecycleEvent) {
        self.listeners
            .retain(|listener| listener.send(event.clone()).is_ok());
        self.emitted.push(event);
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new(ConnectionOptions::default())
    }
}

impl Connection {
    /// Creates an idle connection. Nothing is spawned until [`start`](Self::start).
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                shared: StdMutex::new(Shared {
                    state: ConnectionState::Idle,
                    endpoint: None,
                    channel: None,
                    cancel: Some(CancellationToken::new()),
                    listeners: Vec::new(),
                    emitted: Vec::new(),
                    inbound: None,
                    inbound_taken: false,
                    release_log: Vec::new(),
                }),
            }),
        }
    }

    /// Options this connection was built with.
    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared().state
    }

    /// Returns whether [`stop`](Self::stop) has run or the connection faulted.
    pub fn is_stopped(&self) -> bool {
        self.state() == ConnectionState::Stopped
    }

    /// Endpoint passed to [`start`](Self::start), if any.
    pub fn endpoint(&self) -> Option<String> {
        self.shared().endpoint.clone()
    }

    /// Resources released so far, in the order they were released.
    pub fn release_log(&self) -> Vec<ReleaseStep> {
        self.shared().release_log.clone()
    }

    /// Subscribes to lifecycle events.
    ///
    /// Events emitted before the call are replayed first, so a late subscriber
    /// still sees `Connected` and `Disconnected` in order.
    pub fn subscribe(&self) -> LifecycleListener {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = self.shared();
        for event in &shared.emitted {
            let _ = tx.send(event.clone());
        }
        shared.listeners.push(tx);
        rx
    }

    /// Takes the queue of inbound messages not consumed by a request.
    ///
    /// Messages are only queued from the first call on; until then, and once
    /// the returned receiver is dropped, they are discarded. Returns `None`
    /// after the first call.
    pub fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        let mut shared = self.shared();
        if shared.inbound_taken {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        shared.inbound = Some(tx);
        shared.inbound_taken = true;
        Some(rx)
    }

    /// Starts the connect attempt on a background task and returns at once.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, endpoint: impl Into<String>) -> Result<(), ConnectionError> {
        let endpoint = endpoint.into();
        let cancel = {
            let mut shared = self.shared();
            if shared.state != ConnectionState::Idle {
                return Err(ConnectionError::AlreadyStarted);
            }
            shared.state = ConnectionState::Connecting;
            shared.endpoint = Some(endpoint.clone());
            shared.cancel.clone().unwrap_or_default()
        };

        debug!(event = "connection_connecting", endpoint = %endpoint);
        let connection = self.clone();
        tokio::spawn(async move {
            connection.connect(endpoint, cancel).await;
        });
        Ok(())
    }

    /// Stops the connection.
    ///
    /// Only the first call tears down and emits `Disconnected`; later or
    /// concurrent calls return without effect.
    pub async fn stop(&self) {
        self.stop_with(None).await;
    }

    async fn stop_with(&self, cause: Option<ConnectionError>) {
        let (channel, cancel) = {
            let mut shared = self.shared();
            if shared.state == ConnectionState::Stopped {
                debug!(event = "connection_stop_ignored");
                return;
            }
            shared.state = ConnectionState::Stopped;
            (shared.channel.take(), shared.cancel.clone())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.release(channel).await;

        let cause = cause.map(Arc::new);
        match &cause {
            Some(err) => warn!(event = "connection_disconnected", error = %err),
            None => debug!(event = "connection_disconnected"),
        }
        self.shared()
            .emit(LifecycleEvent::Disconnected { cause });
    }

    async fn release(&self, channel: Option<Arc<Channel>>) {
        let flush_timeout = self.inner.options.release_flush_timeout;
        let parts = match &channel {
            Some(channel) => channel.dispose(flush_timeout).await,
            None => StreamParts::default(),
        };
        drop(channel);
        self.record(ReleaseStep::Channel, parts.buffered.is_some());

        let write_half = match parts.buffered {
            Some(mut buffered) => {
                match tokio::time::timeout(flush_timeout, buffered.flush()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => debug!(event = "stream_flush_failed", error = %err),
                    Err(_) => debug!(event = "stream_flush_timed_out", timeout = ?flush_timeout),
                }
                Some(buffered.into_inner())
            }
            None => None,
        };
        self.record(ReleaseStep::Stream, write_half.is_some());

        let had_transport = write_half.is_some() || parts.read_half.is_some();
        if let Some(mut write_half) = write_half {
            // Shutting down an already closed socket only reports NotConnected.
            if let Err(err) = write_half.shutdown().await {
                debug!(event = "transport_shutdown_failed", error = %err);
            }
        }
        drop(parts.read_half);
        self.record(ReleaseStep::Transport, had_transport);

        let cancel = self.shared().cancel.take();
        self.record(ReleaseStep::Cancellation, cancel.is_some());
        drop(cancel);
    }

    fn record(&self, step: ReleaseStep, present: bool) {
        debug!(event = "connection_release", step = ?step, present);
        self.shared().release_log.push(step);
    }

    async fn connect(self, endpoint: String, cancel: CancellationToken) {
        let timeout = self.inner.options.connect_timeout;
        let attempt = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(event = "connect_cancelled", endpoint = %endpoint);
                return;
            }
            attempt = tokio::time::timeout(timeout, TcpStream::connect(endpoint.as_str())) => attempt,
        };

        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                self.stop_with(Some(ConnectionError::Connect { endpoint, source }))
                    .await;
                return;
            }
            Err(_) => {
                self.stop_with(Some(ConnectionError::ConnectTimeout { endpoint, timeout }))
                    .await;
                return;
            }
        };

        if let Err(err) = stream.set_nodelay(self.inner.options.nodelay) {
            debug!(event = "set_nodelay_failed", error = %err);
        }
        let channel = Arc::new(Channel::new(
            stream,
            self.inner.options.max_frame_length,
            cancel.clone(),
        ));

        {
            let mut shared = self.shared();
            if shared.state != ConnectionState::Connecting {
                // Stopped while connecting; dropping the channel closes the socket.
                debug!(event = "connect_discarded", endpoint = %endpoint);
                return;
            }
            shared.state = ConnectionState::Connected;
            shared.channel = Some(Arc::clone(&channel));
            shared.emit(LifecycleEvent::Connected {
                channel: ChannelRef::new(&channel),
            });
        }

        debug!(event = "connection_established", endpoint = %endpoint);
        let connection = self.clone();
        tokio::spawn(async move {
            connection.receive_loop(channel, cancel).await;
        });
    }

    async fn receive_loop(self, channel: Arc<Channel>, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            match channel.receive(&cancel).await {
                Ok(message) => {
                    if let Some(message) = channel.route(message) {
                        self.deliver(message);
                    }
                }
                Err(ChannelError::Cancelled) => break,
                Err(err) => {
                    drop(channel);
                    self.stop_with(Some(ConnectionError::Channel(err))).await;
                    return;
                }
            }
        }
        debug!(event = "receive_loop_exited");
    }

    fn deliver(&self, message: Message) {
        let kind = message.kind();
        let mut shared = self.shared();
        let queued = match &shared.inbound {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        };
        if !queued {
            shared.inbound = None;
            debug!(event = "inbound_message_dropped", kind = kind.as_str());
        }
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        lock(&self.inner.shared)
    }
}
