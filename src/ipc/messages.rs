//! IPC message types for CLI ↔ daemon communication.
//!
//! Uses JSON Lines (newline-delimited JSON) over a Unix stream socket.
//! Message schema uses familiar field names (id, method, params, result, error)
//! but does NOT implement JSON-RPC 2.0 specification.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::domain::{Decision, LoopState};
use crate::error::LoopdError;

/// Request sent from a client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    /// Unique request ID for correlating responses.
    pub id: u64,
    /// Method name (e.g., "ping", "runner.start").
    pub method: String,
    /// Method parameters as JSON value.
    #[serde(default)]
    pub params: Value,
}

impl DaemonRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn no_params(id: u64, method: impl Into<String>) -> Self {
        Self::new(id, method, Value::Object(Default::default()))
    }
}

/// Response sent from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    /// Request ID this response corresponds to.
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DaemonError>,
}

impl DaemonResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, error: DaemonError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Build a response from a handler result.
    pub fn from_result(id: u64, result: crate::error::Result<Value>) -> Self {
        match result {
            Ok(value) => Self::success(id, value),
            Err(e) => Self::error(id, DaemonError::from(&e)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Unwrap the result value, converting an error back into a `LoopdError`.
    pub fn into_result(self) -> crate::error::Result<Value> {
        match self.error {
            Some(error) => Err(error.into_loopd_error()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Error details in a daemon response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl DaemonError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i32, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Parse error (-32700).
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PARSE_ERROR, message)
    }

    /// Method not found error (-32601).
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("Unknown method: {}", method.into()),
        )
    }

    /// Invalid params error (-32602).
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message)
    }

    /// Internal error (-32603).
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message)
    }

    fn subject(&self) -> String {
        self.data
            .as_ref()
            .and_then(|data| data["subject"].as_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.message.clone())
    }

    /// Rebuild the library error this response was produced from.
    pub fn into_loopd_error(self) -> LoopdError {
        let subject = self.subject();
        match self.code {
            ErrorCode::INVALID_PARAMS => LoopdError::InvalidArgument(subject),
            ErrorCode::LOOP_NOT_FOUND => LoopdError::LoopNotFound(subject),
            ErrorCode::INVALID_STATE => LoopdError::InvalidState(subject),
            ErrorCode::NOT_FOUND => LoopdError::NotFound(subject),
            ErrorCode::QUEUE_ITEM_NOT_FOUND => LoopdError::QueueItemNotFound(subject),
            ErrorCode::OWNERSHIP_CONFLICT => {
                let data = self.data.unwrap_or(Value::Null);
                LoopdError::OwnershipConflict {
                    loop_id: data["loop_id"].as_str().unwrap_or_default().to_string(),
                    owner: data["owner"].as_str().unwrap_or_default().to_string(),
                }
            }
            ErrorCode::LAUNCH_FAILED => LoopdError::LaunchFailed(subject),
            _ => LoopdError::Ipc(self.message),
        }
    }
}

impl From<&LoopdError> for DaemonError {
    fn from(err: &LoopdError) -> Self {
        let message = err.to_string();
        let (code, subject) = match err {
            LoopdError::InvalidArgument(s) => (ErrorCode::INVALID_PARAMS, s),
            LoopdError::LoopNotFound(s) => (ErrorCode::LOOP_NOT_FOUND, s),
            LoopdError::InvalidState(s) => (ErrorCode::INVALID_STATE, s),
            LoopdError::NotFound(s) => (ErrorCode::NOT_FOUND, s),
            LoopdError::QueueItemNotFound(s) => (ErrorCode::QUEUE_ITEM_NOT_FOUND, s),
            LoopdError::LaunchFailed(s) => (ErrorCode::LAUNCH_FAILED, s),
            LoopdError::OwnershipConflict { loop_id, owner } => {
                return Self::with_data(
                    ErrorCode::OWNERSHIP_CONFLICT,
                    message,
                    json!({"loop_id": loop_id, "owner": owner}),
                );
            }
            _ => return Self::internal_error(message),
        };
        Self::with_data(code, message, json!({"subject": subject}))
    }
}

/// Standard error codes.
pub struct ErrorCode;

impl ErrorCode {
    /// Invalid JSON.
    pub const PARSE_ERROR: i32 = -32700;
    /// Unknown method.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal daemon error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Loop ID doesn't exist.
    pub const LOOP_NOT_FOUND: i32 = 1001;
    /// Loop in wrong state for action.
    pub const INVALID_STATE: i32 = 1002;
    /// Loop is owned by someone else.
    pub const OWNERSHIP_CONFLICT: i32 = 1003;
    /// Agent or other resource doesn't exist.
    pub const NOT_FOUND: i32 = 1004;
    /// Queue item doesn't exist.
    pub const QUEUE_ITEM_NOT_FOUND: i32 = 1005;
    /// Command could not be started.
    pub const LAUNCH_FAILED: i32 = 1006;
}

/// Push event sent from the daemon to subscribed clients (no request ID).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonEvent {
    /// Event type (e.g., "loop.state", "loop.iteration").
    pub event: String,
    pub data: Value,
}

impl DaemonEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn loop_state(loop_id: &str, state: LoopState) -> Self {
        Self::new(Events::LOOP_STATE, json!({"id": loop_id, "state": state}))
    }

    pub fn loop_iteration(loop_id: &str, sequence: u32, exit_code: i32, decision: &Decision) -> Self {
        Self::new(
            Events::LOOP_ITERATION,
            json!({
                "id": loop_id,
                "sequence": sequence,
                "exit_code": exit_code,
                "decision": decision,
            }),
        )
    }

    pub fn agent_input(agent_id: &str, text: &str, special_keys: &[String]) -> Self {
        Self::new(
            Events::AGENT_INPUT,
            json!({
                "agent_id": agent_id,
                "text": text,
                "special_keys": special_keys,
            }),
        )
    }
}

/// Known method names as constants.
pub struct Methods;

impl Methods {
    pub const PING: &'static str = "ping";
    pub const SUBSCRIBE: &'static str = "subscribe";
    pub const STATUS_GET: &'static str = "status.get";

    // Agents
    pub const AGENT_SEND_INPUT: &'static str = "agent.send_input";
    pub const AGENT_LIST: &'static str = "agent.list";
    pub const AGENT_GET: &'static str = "agent.get";

    // Runners
    pub const RUNNER_START: &'static str = "runner.start";
    pub const RUNNER_STOP: &'static str = "runner.stop";
}

/// Known event names as constants.
pub struct Events;

impl Events {
    pub const LOOP_STATE: &'static str = "loop.state";
    pub const LOOP_ITERATION: &'static str = "loop.iteration";
    pub const AGENT_INPUT: &'static str = "agent.input";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StopReason;

    #[test]
    fn test_daemon_request_no_params() {
        let req = DaemonRequest::no_params(42, Methods::PING);
        assert_eq!(req.id, 42);
        assert_eq!(req.method, "ping");
        assert!(req.params.is_object());
    }

    #[test]
    fn test_request_params_default_when_missing() {
        let req: DaemonRequest = serde_json::from_str(r#"{"id":1,"method":"status.get"}"#).unwrap();
        assert_eq!(req.method, Methods::STATUS_GET);
        assert!(req.params.is_null());
    }

    #[test]
    fn test_response_error_skips_result() {
        let resp = DaemonResponse::error(3, DaemonError::method_not_found("nope"));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("result"));
        assert!(json.contains("-32601"));
        assert!(json.contains("Unknown method: nope"));
    }

    #[test]
    fn test_loopd_error_survives_the_wire() {
        let cases = vec![
            LoopdError::InvalidArgument("agent_id is required".into()),
            LoopdError::LoopNotFound("abc".into()),
            LoopdError::NotFound("agent-x".into()),
            LoopdError::InvalidState("busy".into()),
        ];
        for err in cases {
            let expected = err.to_string();
            let wire = serde_json::to_string(&DaemonError::from(&err)).unwrap();
            let parsed: DaemonError = serde_json::from_str(&wire).unwrap();
            assert_eq!(parsed.into_loopd_error().to_string(), expected);
        }
    }

    #[test]
    fn test_ownership_conflict_keeps_owner() {
        let err = LoopdError::OwnershipConflict {
            loop_id: "l1".into(),
            owner: "daemon:d-1".into(),
        };
        let daemon_error = DaemonError::from(&err);
        assert_eq!(daemon_error.code, ErrorCode::OWNERSHIP_CONFLICT);
        match daemon_error.into_loopd_error() {
            LoopdError::OwnershipConflict { loop_id, owner } => {
                assert_eq!(loop_id, "l1");
                assert_eq!(owner, "daemon:d-1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_storage_error_is_internal() {
        let err = DaemonError::from(&LoopdError::Storage("disk full".into()));
        assert_eq!(err.code, ErrorCode::INTERNAL_ERROR);
        assert!(matches!(err.into_loopd_error(), LoopdError::Ipc(_)));
    }

    #[test]
    fn test_into_result() {
        let ok = DaemonResponse::success(1, json!({"pong": true}));
        assert_eq!(ok.into_result().unwrap()["pong"], true);

        let err = DaemonResponse::error(1, DaemonError::invalid_params("bad"));
        assert!(matches!(err.into_result(), Err(LoopdError::InvalidArgument(_))));
    }

    #[test]
    fn test_loop_iteration_event() {
        let event = DaemonEvent::loop_iteration("l1", 2, 0, &Decision::stop("rule-1", StopReason::Matched));
        assert_eq!(event.event, Events::LOOP_ITERATION);
        assert_eq!(event.data["sequence"], 2);
        assert_eq!(event.data["decision"]["decision"], "stop");
        assert_eq!(event.data["decision"]["rule"], "rule-1");
    }

    #[test]
    fn test_loop_state_event() {
        let event = DaemonEvent::loop_state("l1", LoopState::Stopping);
        assert_eq!(event.data["state"], "stopping");
    }
}
