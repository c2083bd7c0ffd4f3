//! TDSweb gateway protocol: JSON envelopes over a WebSocket
//!
//! Every frame carries exactly one JSON object with a `type` string field plus
//! type-specific fields. Client requests are parsed leniently (missing fields
//! surface as `None` so the session can report them as validation errors);
//! server messages are strongly typed and serialized with an internal `type` tag.
//!
//! # Usage
//!
//! ```ignore
//! use tdsweb_protocol::{ClientMessage, ServerMessage, PongMessage};
//!
//! let msg = ClientMessage::parse(r#"{"type":"ping"}"#)?;
//! let json = serde_json::to_string(&ServerMessage::Pong(PongMessage {}))?;
//! ```

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MIME type attached to spreadsheet exports.
pub const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// `export` value that selects spreadsheet output for a query.
pub const EXPORT_EXCEL: &str = "excel";

// =============================================================================
// Client → Server Messages
// =============================================================================

/// Messages sent from the browser client to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Login(LoginRequest),
    Logout(LogoutRequest),
    Query(QueryRequest),
    Cancel(CancelRequest),
    ChangeDatabase(ChangeDatabaseRequest),
    Ping(PingRequest),
}

impl ClientMessage {
    /// Parse one inbound envelope.
    ///
    /// The `type` field is checked before the body, so an unknown type is
    /// reported as such even when the rest of the object is garbage.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(ProtocolError::MissingType),
        };

        match kind.as_str() {
            "login" => body(value).map(ClientMessage::Login),
            "logout" => body(value).map(ClientMessage::Logout),
            "query" => body(value).map(ClientMessage::Query),
            "cancel" => body(value).map(ClientMessage::Cancel),
            "change_database" => body(value).map(ClientMessage::ChangeDatabase),
            "ping" => body(value).map(ClientMessage::Ping),
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }

    /// The literal `type` tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Login(_) => "login",
            ClientMessage::Logout(_) => "logout",
            ClientMessage::Query(_) => "query",
            ClientMessage::Cancel(_) => "cancel",
            ClientMessage::ChangeDatabase(_) => "change_database",
            ClientMessage::Ping(_) => "ping",
        }
    }
}

fn body<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Authenticate against the configured database server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Drop the current database handle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogoutRequest {}

/// Run ad-hoc SQL. The text is passed to the server verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub query: Option<String>,
    /// `"excel"` collects the results into a spreadsheet attachment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<String>,
}

impl QueryRequest {
    /// True if the results should be delivered as a single spreadsheet.
    pub fn wants_spreadsheet(&self) -> bool {
        self.export.as_deref() == Some(EXPORT_EXCEL)
    }
}

/// Ask the running query to stop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {}

/// Switch the session's current database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeDatabaseRequest {
    #[serde(default)]
    pub database: Option<String>,
}

/// Keepalive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingRequest {}

/// Envelope-level failures, raised before any session operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not JSON, not an object, or a field of the wrong shape.
    Malformed(String),
    /// No string `type` field.
    MissingType,
    /// A `type` we do not dispatch.
    UnknownType(String),
    /// Binary frames are not part of the protocol.
    BinaryFrame,
    /// Frame exceeded the configured size limit.
    MessageTooLarge,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Malformed(detail) => write!(f, "Malformed message: {}.", detail),
            ProtocolError::MissingType => write!(f, "No message type given."),
            ProtocolError::UnknownType(kind) => write!(f, "Unrecognized message type \"{}\".", kind),
            ProtocolError::BinaryFrame => write!(f, "Binary messages are not supported."),
            ProtocolError::MessageTooLarge => write!(f, "Message too large."),
        }
    }
}

impl std::error::Error for ProtocolError {}

// =============================================================================
// Server → Client Messages
// =============================================================================

/// Messages sent from the gateway to the browser client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Login(LoginMessage),
    Logout(LogoutMessage),
    Table(TableMessage),
    Row(RowMessage),
    RowCount(RowCountMessage),
    Message(InfoMessage),
    QueryFinished(QueryFinishedMessage),
    Pong(PongMessage),
    Error(ErrorMessage),
}

impl ServerMessage {
    /// Shorthand for an `error` event.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorMessage { message: message.into() })
    }

    /// Serialize to the text frame sent over the socket.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Successful login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginMessage {
    pub success: bool,
    pub server: String,
    pub username: String,
    /// Current database right after login.
    pub database: String,
    /// All database names, sorted.
    pub databases: Vec<String>,
}

/// Successful logout (explicit or implicit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogoutMessage {
    pub success: bool,
}

/// Start of a result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMessage {
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Server type name, e.g. `int` or `nvarchar`.
    #[serde(rename = "type")]
    pub kind: String,
}

/// One row of the current result set, in column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowMessage {
    pub columns: Vec<Option<FieldValue>>,
}

/// A non-null field as it appears on the wire.
///
/// Dates and times travel as ISO 8601 strings with whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Text(String),
}

/// Rows affected by a statement that returned no result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowCountMessage {
    pub count: u64,
}

/// Informational or diagnostic message raised by the database server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfoMessage {
    pub server: String,
    pub message: String,
    pub proc_name: String,
    pub sql_state: String,
    pub msgno: i32,
    pub line_number: i32,
    pub state: i16,
    pub priv_msg_type: u8,
    pub severity: u8,
    pub oserr: i32,
}

/// End of a query. Carries the spreadsheet when the query was an export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFinishedMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Base64 (standard alphabet) of the attachment bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl QueryFinishedMessage {
    /// True if this message carries an attachment.
    pub fn has_attachment(&self) -> bool {
        self.data.is_some()
    }
}

/// Response to ping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PongMessage {}

/// Any failed request. The connection stays open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
}
