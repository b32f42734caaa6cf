//! Line-delimited JSON protocol between the host and an isolate.
//!
//! ```text
//!   host ──► isolate   {"type":"program","sourceCode":...,"testCode":...}
//!   isolate ──► host   {"type":"write","id":1,"path":"out.txt","content":"..."}
//!   host ──► isolate   {"type":"result","id":1,"ok":true,"value":"5"}
//!   isolate ──► host   {"type":"report","passed":true,"details":"..."}
//! ```
//!
//! The isolate sends exactly one terminal message, `report` or `error`.
//! Everything before it is a capability call the host answers by id.

use serde::{Deserialize, Serialize};

/// Upper bound on a single protocol line from the isolate.
pub const MAX_MESSAGE_BYTES: u64 = 2 * 1024 * 1024;

/// Messages sent from the host to the isolate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// The code under test, sent once right after start.
    #[serde(rename_all = "camelCase")]
    Program {
        source_code: String,
        test_code: String,
    },
    /// Answer to a capability call.
    Result {
        id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl HostMessage {
    pub fn success(id: u64, value: impl Into<String>) -> Self {
        HostMessage::Result {
            id,
            ok: true,
            value: Some(value.into()),
            error: None,
        }
    }

    pub fn failure(id: u64, error: impl Into<String>) -> Self {
        HostMessage::Result {
            id,
            ok: false,
            value: None,
            error: Some(error.into()),
        }
    }

    /// Serializes the message as one protocol line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Messages sent from the isolate to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IsolateMessage {
    /// Scoped write capability.
    Write {
        id: u64,
        path: String,
        content: String,
    },
    /// Scoped read capability.
    Read { id: u64, path: String },
    /// Terminal: the tests ran to completion.
    Report {
        passed: bool,
        #[serde(default)]
        details: String,
    },
    /// Terminal: the tests raised an error that was not an assertion.
    Error { message: String },
}

impl IsolateMessage {
    /// Parses one protocol line.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}
