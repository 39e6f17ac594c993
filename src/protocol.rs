//! Wire types shared by the server and the client.
//!
//! Management requests are JSON bodies POSTed to `/terminal/<op>`. The
//! WebSocket transport carries a login message first (see
//! [`crate::auth::Credential`]), then binary process bytes, with text frames
//! reserved for [`ControlMessage`]s.

use serde::{Deserialize, Serialize};

use crate::target::{ContainerTerminalMode, InitTerminal, Target, TerminalRecreateMode};

/// Sent by the server as a text frame after a successful login.
pub const LOGGED_IN: &str = "LOGGED_IN";

/// Client-to-server control frames, sent as text after login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum ControlMessage {
    Resize { rows: u16, cols: u16 },
}

/// Listing entry for one terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalSummary {
    pub name: String,
    pub target: Target,
    pub command: String,
    pub stored_size_kb: f64,
    /// Unix timestamp in milliseconds.
    pub created_at: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTerminal {
    pub name: String,
    pub target: Target,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ContainerTerminalMode>,
    #[serde(default)]
    pub recreate: TerminalRecreateMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteTerminal {
    pub target: Target,
    pub terminal: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteTerminalResponse {
    pub deleted: bool,
}

/// Delete every terminal on one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteAllTerminals {
    pub server: String,
}

/// Delete terminals across servers, optionally only those carrying any of
/// `tags`. An empty `servers` list means every known server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchDeleteAllTerminals {
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteAllResponse {
    pub deleted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListTerminals {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
}

/// Body of `POST /terminal/execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteTerminal {
    pub target: Target,
    /// Run inside this persistent terminal instead of a one-shot process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<String>,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<InitTerminal>,
}

/// JSON body of every non-200 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub trace: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_control_frame_shape() {
        let json = serde_json::to_string(&ControlMessage::Resize { rows: 24, cols: 80 }).unwrap();
        assert_eq!(json, r#"{"type":"Resize","params":{"rows":24,"cols":80}}"#);
    }

    #[test]
    fn execute_body_accepts_minimal_form() {
        let req: ExecuteTerminal = serde_json::from_str(
            r#"{"target":{"type":"Server","params":{"server":"local"}},"command":"ls"}"#,
        )
        .unwrap();
        assert_eq!(req.target, Target::server("local"));
        assert!(req.terminal.is_none());
        assert!(req.init.is_none());
    }

    #[test]
    fn error_body_tolerates_missing_trace() {
        let body: ErrorBody = serde_json::from_str(r#"{"error":"boom"}"#).unwrap();
        assert_eq!(body.error, "boom");
        assert!(body.trace.is_empty());
    }
}
