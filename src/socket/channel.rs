//! Framed message channel over the collector socket.
//!
//! Frames are a 4-byte big-endian length followed by one JSON [`Message`].
//! The receive loop owned by [`Connection`](crate::socket::connection::Connection)
//! is the only reader; correlated calls wait for the loop to hand them the
//! next inbound message instead of reading the socket themselves.

use std::io;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::BufWriter;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::socket::proto::Message;

type FrameWriter = FramedWrite<BufWriter<OwnedWriteHalf>, LengthDelimitedCodec>;
type FrameReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;

/// Errors produced by channel reads and writes.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Socket read or write failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Frame did not hold a valid message envelope.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The owning connection released the channel.
    #[error("channel is closed")]
    Closed,

    /// A stop request cancelled the read or write.
    #[error("operation cancelled")]
    Cancelled,

    /// The collector closed its end of the socket.
    #[error("peer closed the connection")]
    PeerClosed,

    /// Outbound message exceeds the frame limit. Nothing was written.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
}

/// Stream layers handed back by [`Channel::dispose`], outermost first.
#[derive(Debug, Default)]
pub(crate) struct StreamParts {
    pub(crate) buffered: Option<BufWriter<OwnedWriteHalf>>,
    pub(crate) read_half: Option<OwnedReadHalf>,
}

/// Send/receive endpoint for framed messages.
pub struct Channel {
    max_frame_length: usize,
    cancel: CancellationToken,
    writer: Mutex<Option<FrameWriter>>,
    reader: Mutex<Option<FrameReader>>,
    in_flight: Mutex<()>,
    pending: StdMutex<Option<oneshot::Sender<Message>>>,
    fault: StdMutex<Option<ChannelError>>,
    faulted: Notify,
}

impl Channel {
    /// Wraps an open stream. `max_frame_length` bounds both directions.
    ///
    /// Writes in progress give up once `cancel` fires.
    pub fn new(stream: TcpStream, max_frame_length: usize, cancel: CancellationToken) -> Self {
        let (read_half, write_half) = stream.into_split();
        let codec = || {
            LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_length)
                .new_codec()
        };

        Self {
            max_frame_length,
            cancel,
            writer: Mutex::new(Some(FramedWrite::new(BufWriter::new(write_half), codec()))),
            reader: Mutex::new(Some(FramedRead::new(read_half, codec()))),
            in_flight: Mutex::new(()),
            pending: StdMutex::new(None),
            fault: StdMutex::new(None),
            faulted: Notify::new(),
        }
    }

    /// Frames and writes one message, flushing it to the socket.
    ///
    /// A write failure is also reported to the receive loop so the owning
    /// connection tears down. Oversized messages are rejected before any byte
    /// is written and leave the channel usable.
    pub async fn send(&self, message: &Message) -> Result<(), ChannelError> {
        let frame = Bytes::from(message.to_vec()?);
        if frame.len() > self.max_frame_length {
            return Err(ChannelError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_length,
            });
        }

        let mut guard = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ChannelError::Cancelled),
            guard = self.writer.lock() => guard,
        };
        let writer = guard.as_mut().ok_or(ChannelError::Closed)?;

        let written = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ChannelError::Cancelled),
            written = writer.send(frame) => written,
        };
        if let Err(err) = written {
            debug!(event = "channel_write_failed", kind = message.kind().as_str(), error = %err);
            self.record_fault(io::Error::new(err.kind(), err.to_string()));
            return Err(ChannelError::Io(err));
        }
        Ok(())
    }

    /// Reads the next message, racing the read against `cancel`.
    pub async fn receive(&self, cancel: &CancellationToken) -> Result<Message, ChannelError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(ChannelError::Closed)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChannelError::Cancelled),
            _ = self.faulted.notified() => Err(self.take_fault()),
            frame = reader.next() => match frame {
                Some(Ok(bytes)) => Ok(Message::from_slice(&bytes)?),
                Some(Err(err)) => Err(ChannelError::Io(err)),
                None => Err(ChannelError::PeerClosed),
            },
        }
    }

    /// Sends `message` and waits for the next inbound message.
    ///
    /// Only one request is outstanding at a time; later callers queue behind
    /// the in-flight one.
    pub async fn request(&self, message: &Message) -> Result<Message, ChannelError> {
        let _in_flight = self.in_flight.lock().await;

        let (tx, rx) = oneshot::channel();
        *lock(&self.pending) = Some(tx);

        if let Err(err) = self.send(message).await {
            lock(&self.pending).take();
            return Err(err);
        }

        rx.await.map_err(|_| ChannelError::Closed)
    }

    /// Hands `message` to a waiting request, or returns it if none is waiting.
    pub(crate) fn route(&self, message: Message) -> Option<Message> {
        let Some(waiter) = lock(&self.pending).take() else {
            return Some(message);
        };
        waiter.send(message).err()
    }

    /// Flushes pending frames and detaches the stream layers.
    ///
    /// The flush gives up after `flush_timeout` so a peer that stopped reading
    /// cannot hold teardown. Afterwards every send, receive, and request fails
    /// with [`ChannelError::Closed`]; a request already waiting is woken with
    /// the same error.
    pub(crate) async fn dispose(&self, flush_timeout: Duration) -> StreamParts {
        let mut parts = StreamParts::default();

        if let Some(mut writer) = self.writer.lock().await.take() {
            match tokio::time::timeout(flush_timeout, SinkExt::<Bytes>::flush(&mut writer)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(event = "channel_flush_failed", error = %err),
                Err(_) => debug!(event = "channel_flush_timed_out", timeout = ?flush_timeout),
            }
            parts.buffered = Some(writer.into_inner());
        }
        lock(&self.pending).take();

        if let Some(reader) = self.reader.lock().await.take() {
            parts.read_half = Some(reader.into_inner());
        }
        parts
    }

    fn record_fault(&self, err: io::Error) {
        lock(&self.fault).get_or_insert(ChannelError::Io(err));
        self.faulted.notify_one();
    }

    fn take_fault(&self) -> ChannelError {
        lock(&self.fault).take().unwrap_or(ChannelError::Closed)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

/// Non-owning handle to a connection's channel.
///
/// The connection keeps the channel alive; once it tears down, every call
/// through this handle fails with [`ChannelError::Closed`].
#[derive(Clone, Debug)]
pub struct ChannelRef {
    inner: Weak<Channel>,
}

impl ChannelRef {
    pub(crate) fn new(channel: &Arc<Channel>) -> Self {
        Self {
            inner: Arc::downgrade(channel),
        }
    }

    /// Returns whether the owning connection still holds the channel.
    pub fn is_open(&self) -> bool {
        self.inner.strong_count() > 0
    }

    pub async fn send(&self, message: &Message) -> Result<(), ChannelError> {
        self.upgrade()?.send(message).await
    }

    pub async fn request(&self, message: &Message) -> Result<Message, ChannelError> {
        self.upgrade()?.request(message).await
    }

    fn upgrade(&self) -> Result<Arc<Channel>, ChannelError> {
        self.inner.upgrade().ok_or(ChannelError::Closed)
    }
}

pub(crate) fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
