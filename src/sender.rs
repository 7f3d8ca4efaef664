//! Test case event sender.
//!
//! `TestCaseEventSender` turns test host notifications into channel traffic.
//! Start and session-end events are fire-and-forget; test-case end waits for
//! the collector to answer with the attachments it produced for that test.

use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::socket::channel::{ChannelError, ChannelRef};
use crate::socket::connection::{
    Connection, ConnectionError, ConnectionOptions, ConnectionState, LifecycleEvent,
};
use crate::socket::proto::{
    AttachmentSet, Message, MessageKind, SessionEndEvent, TestCaseEndEvent, TestCaseStartEvent,
};

/// Host the collector listens on.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Errors returned by [`TestCaseEventSender`] calls.
#[derive(Debug, Error)]
pub enum SenderError {
    /// No channel has been attached yet.
    #[error("not connected to the data collector")]
    NotConnected,

    /// The channel failed or was released.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Event payload could not be encoded or the response decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Sends test case lifecycle events to the data collector.
#[derive(Debug)]
pub struct TestCaseEventSender {
    connection: Connection,
    channel: RwLock<Option<ChannelRef>>,
}

impl TestCaseEventSender {
    /// Wraps `connection`. No channel is attached until it connects.
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            channel: RwLock::new(None),
        }
    }

    /// Builds a sender over a fresh idle [`Connection`].
    pub fn with_options(options: ConnectionOptions) -> Self {
        Self::new(Connection::new(options))
    }

    /// The connection this sender drives.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Starts connecting to the collector on the loopback `port`.
    pub fn initialize_communication(&self, port: u16) -> Result<(), ConnectionError> {
        self.connection.start(format!("{LOOPBACK_HOST}:{port}"))
    }

    /// Waits for the connection to come up and attaches its channel.
    ///
    /// Returns `false` when `timeout` elapses, the connection ends first, or
    /// it has already been stopped.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let mut listener = self.connection.subscribe();
        let connected = async {
            match listener.recv().await {
                Some(LifecycleEvent::Connected { channel }) => Some(channel),
                _ => None,
            }
        };

        match tokio::time::timeout(timeout, connected).await {
            Ok(Some(channel)) => {
                // A replayed `Connected` may describe a connection that has since stopped.
                if self.connection.state() != ConnectionState::Connected || !channel.is_open() {
                    debug!(event = "wait_for_connection_stale", state = ?self.connection.state());
                    return false;
                }
                self.attach(channel);
                true
            }
            Ok(None) => false,
            Err(_) => {
                debug!(event = "wait_for_connection_timed_out", timeout = ?timeout);
                false
            }
        }
    }

    /// Uses `channel` for all further calls.
    pub fn attach(&self, channel: ChannelRef) {
        let mut slot = self
            .channel
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(channel);
    }

    /// Sends a test-case start event without waiting for a reply.
    pub async fn send_test_case_start(&self, event: &TestCaseStartEvent) -> Result<(), SenderError> {
        let message = Message::with_payload(MessageKind::TestStart, event)?;
        self.channel()?.send(&message).await?;
        Ok(())
    }

    /// Sends the end event and returns the collector's attachments for it.
    ///
    /// A reply of any kind other than `TestEndResult` yields an empty list.
    pub async fn send_test_case_end(
        &self,
        event: &TestCaseEndEvent,
    ) -> Result<Vec<AttachmentSet>, SenderError> {
        let request = Message::with_payload(MessageKind::TestEnd, event)?;
        let response = self.channel()?.request(&request).await?;

        if response.kind() != MessageKind::TestEndResult {
            debug!(
                event = "unexpected_test_end_response",
                test_case_id = %event.test_case_id,
                kind = response.kind().as_str()
            );
            return Ok(Vec::new());
        }
        if response.payload().is_null() {
            return Ok(Vec::new());
        }
        Ok(response.payload_as()?)
    }

    /// Sends the session end event without waiting for a reply.
    pub async fn send_test_session_end(&self, event: &SessionEndEvent) -> Result<(), SenderError> {
        let message = Message::with_payload(MessageKind::SessionEnd, event)?;
        self.channel()?.send(&message).await?;
        Ok(())
    }

    /// Stops the underlying connection. Safe to call repeatedly.
    pub async fn close(&self) {
        self.connection.stop().await;
    }

    fn channel(&self) -> Result<ChannelRef, SenderError> {
        self.channel
            .read()
            .map(|slot| slot.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
            .ok_or(SenderError::NotConnected)
    }
}

/// Lazily built, process-wide [`TestCaseEventSender`].
///
/// The cell is an ordinary value: the host creates one and hands it to the
/// code that needs the sender. Concurrent first calls to
/// [`get_or_create`](Self::get_or_create) construct exactly one instance.
#[derive(Debug, Default)]
pub struct TestCaseEventSenderCell {
    options: ConnectionOptions,
    instance: OnceLock<Arc<TestCaseEventSender>>,
}

impl TestCaseEventSenderCell {
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            options,
            instance: OnceLock::new(),
        }
    }

    pub fn get_or_create(&self) -> Arc<TestCaseEventSender> {
        let sender = self
            .instance
            .get_or_init(|| Arc::new(TestCaseEventSender::with_options(self.options.clone())));
        Arc::clone(sender)
    }

    /// Returns the instance if it was already created.
    pub fn get(&self) -> Option<Arc<TestCaseEventSender>> {
        self.instance.get().cloned()
    }
}
