//! Wire messages exchanged with the data collector.
//!
//! Every frame carries one [`Message`] envelope serialized as JSON. The
//! envelope names its [`MessageKind`] and carries an arbitrary JSON payload
//! that is decoded on demand into one of the typed event structs below.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageKind {
    #[serde(rename = "DataCollection.TestStart")]
    TestStart,
    #[serde(rename = "DataCollection.TestEnd")]
    TestEnd,
    #[serde(rename = "DataCollection.TestEndResult")]
    TestEndResult,
    #[serde(rename = "DataCollection.SessionEnd")]
    SessionEnd,
    /// Any kind this client does not act on. Receive-only.
    #[serde(other)]
    Unknown,
}

impl MessageKind {
    /// Wire name of the kind, as it appears in the envelope.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::TestStart => "DataCollection.TestStart",
            MessageKind::TestEnd => "DataCollection.TestEnd",
            MessageKind::TestEndResult => "DataCollection.TestEndResult",
            MessageKind::SessionEnd => "DataCollection.SessionEnd",
            MessageKind::Unknown => "Unknown",
        }
    }
}

/// Immutable message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(rename = "MessageType")]
    kind: MessageKind,
    #[serde(rename = "Payload", default, skip_serializing_if = "Value::is_null")]
    payload: Value,
}

impl Message {
    /// Builds a message without payload.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            payload: Value::Null,
        }
    }

    /// Builds a message whose payload is the JSON form of `payload`.
    pub fn with_payload<T>(kind: MessageKind, payload: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize,
    {
        Ok(Self {
            kind,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Decodes the payload into a typed value.
    pub fn payload_as<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        T::deserialize(&self.payload)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub(crate) fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub(crate) fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TestOutcome {
    None,
    Passed,
    Failed,
    Skipped,
    NotFound,
}

/// Raised by the host when a test case starts executing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct TestCaseStartEvent {
    pub test_case_id: String,
    pub test_case_name: String,
    #[serde(default)]
    pub is_child_test_case: bool,
}

/// Raised by the host when a test case finishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct TestCaseEndEvent {
    pub test_case_id: String,
    pub test_case_name: String,
    #[serde(default)]
    pub is_child_test_case: bool,
    pub test_outcome: TestOutcome,
}

/// Raised once when the test session is over.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SessionEndEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Single file or resource produced by a collector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct UriDataAttachment {
    pub uri: String,
    #[serde(default)]
    pub description: String,
}

/// Attachments grouped under the collector that produced them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct AttachmentSet {
    pub uri: String,
    pub display_name: String,
    #[serde(default)]
    pub attachments: Vec<UriDataAttachment>,
}

impl AttachmentSet {
    pub fn new(uri: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            display_name: display_name.into(),
            attachments: Vec::new(),
        }
    }
}
