//! Queue item types
//!
//! Queue items are pending directives for one loop, consumed strictly in
//! position order. Each type carries its own validated payload.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LoopdError, Result};

/// Discriminant of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemType {
    Message,
    Pause,
    Conditional,
    Scale,
    Stop,
}

impl QueueItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueItemType::Message => "message",
            QueueItemType::Pause => "pause",
            QueueItemType::Conditional => "conditional",
            QueueItemType::Scale => "scale",
            QueueItemType::Stop => "stop",
        }
    }
}

impl fmt::Display for QueueItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueItemType {
    type Err = LoopdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "message" => Ok(QueueItemType::Message),
            "pause" => Ok(QueueItemType::Pause),
            "conditional" => Ok(QueueItemType::Conditional),
            "scale" => Ok(QueueItemType::Scale),
            "stop" => Ok(QueueItemType::Stop),
            other => Err(LoopdError::InvalidArgument(format!("unknown queue item type: {other}"))),
        }
    }
}

/// Lifecycle of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    Pending,
    Dispatched,
    Completed,
    Failed,
}

impl QueueItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueItemStatus::Pending => "pending",
            QueueItemStatus::Dispatched => "dispatched",
            QueueItemStatus::Completed => "completed",
            QueueItemStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueItemStatus::Completed | QueueItemStatus::Failed)
    }
}

impl fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueItemStatus {
    type Err = LoopdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(QueueItemStatus::Pending),
            "dispatched" => Ok(QueueItemStatus::Dispatched),
            "completed" => Ok(QueueItemStatus::Completed),
            "failed" => Ok(QueueItemStatus::Failed),
            other => Err(LoopdError::InvalidArgument(format!("unknown queue item status: {other}"))),
        }
    }
}

/// When a conditional item's predicate holds
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "when", rename_all = "snake_case", deny_unknown_fields)]
pub enum Condition {
    /// Satisfied once an operator resumes the loop
    #[default]
    Manual,
    /// Satisfied at or after a unix timestamp in milliseconds
    NotBefore { at_ms: i64 },
    /// Satisfied when the shell command exits 0
    Command { cmd: String },
}

/// Type-specific payload of a queue item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum QueuePayload {
    /// Text injected into the next command run
    Message { text: String },
    /// Suspend iteration; a duration resumes on its own
    Pause {
        #[serde(default)]
        duration_secs: Option<u64>,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Block until the predicate holds, then optionally inject a message
    Conditional {
        predicate: String,
        #[serde(default)]
        condition: Condition,
        #[serde(default)]
        message: Option<String>,
    },
    /// Change the loop's replica count
    Scale { replicas: u32 },
    /// Stop the loop once reached
    Stop {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl QueuePayload {
    /// Build a typed payload from a caller-supplied type and untyped fields.
    ///
    /// Unknown or missing fields fail with `InvalidArgument`.
    pub fn from_parts(item_type: QueueItemType, fields: &Value) -> Result<Self> {
        let mut object = match fields {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(LoopdError::InvalidArgument(format!(
                    "{item_type} payload must be an object, got {other}"
                )));
            }
        };
        object.insert("type".to_string(), Value::String(item_type.as_str().to_string()));

        let payload: QueuePayload = serde_json::from_value(Value::Object(object))
            .map_err(|e| LoopdError::InvalidArgument(format!("invalid {item_type} payload: {e}")))?;
        payload.validate()?;
        Ok(payload)
    }

    pub fn item_type(&self) -> QueueItemType {
        match self {
            QueuePayload::Message { .. } => QueueItemType::Message,
            QueuePayload::Pause { .. } => QueueItemType::Pause,
            QueuePayload::Conditional { .. } => QueueItemType::Conditional,
            QueuePayload::Scale { .. } => QueueItemType::Scale,
            QueuePayload::Stop { .. } => QueueItemType::Stop,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            QueuePayload::Message { text } if text.trim().is_empty() => {
                Err(LoopdError::InvalidArgument("message requires non-empty text".into()))
            }
            QueuePayload::Conditional { predicate, .. } if predicate.trim().is_empty() => Err(
                LoopdError::InvalidArgument("conditional requires a predicate description".into()),
            ),
            QueuePayload::Conditional {
                condition: Condition::Command { cmd },
                ..
            } if cmd.trim().is_empty() => Err(LoopdError::InvalidArgument(
                "conditional command predicate requires cmd".into(),
            )),
            QueuePayload::Conditional {
                message: Some(message),
                ..
            } if message.trim().is_empty() => Err(LoopdError::InvalidArgument(
                "conditional message must not be empty when set".into(),
            )),
            QueuePayload::Scale { replicas: 0 } => {
                Err(LoopdError::InvalidArgument("scale requires a target replica count of at least 1".into()))
            }
            _ => Ok(()),
        }
    }

    /// Payload fields without the `type` tag, as stored on disk
    pub fn to_fields(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.remove("type");
        }
        Ok(value)
    }
}

/// One pending directive for a specific loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub loop_id: String,
    /// Ordering key, unique per loop
    pub position: i64,
    pub status: QueueItemStatus,
    pub payload: QueuePayload,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
}

impl QueueItem {
    pub fn item_type(&self) -> QueueItemType {
        self.payload.item_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_item_type_parse() {
        assert_eq!("scale".parse::<QueueItemType>().unwrap(), QueueItemType::Scale);
        assert!("resize".parse::<QueueItemType>().is_err());
    }

    #[test]
    fn test_message_requires_text() {
        let err = QueuePayload::from_parts(QueueItemType::Message, &json!({"text": "   "})).unwrap_err();
        assert!(matches!(err, LoopdError::InvalidArgument(_)));

        let err = QueuePayload::from_parts(QueueItemType::Message, &json!({})).unwrap_err();
        assert!(matches!(err, LoopdError::InvalidArgument(_)));

        let ok = QueuePayload::from_parts(QueueItemType::Message, &json!({"text": "hello"})).unwrap();
        assert_eq!(ok, QueuePayload::Message { text: "hello".into() });
    }

    #[test]
    fn test_scale_requires_replicas() {
        assert!(QueuePayload::from_parts(QueueItemType::Scale, &json!({})).is_err());
        assert!(QueuePayload::from_parts(QueueItemType::Scale, &json!({"replicas": 0})).is_err());
        let ok = QueuePayload::from_parts(QueueItemType::Scale, &json!({"replicas": 3})).unwrap();
        assert_eq!(ok.item_type(), QueueItemType::Scale);
    }

    #[test]
    fn test_conditional_requires_predicate() {
        assert!(QueuePayload::from_parts(QueueItemType::Conditional, &json!({})).is_err());
        assert!(QueuePayload::from_parts(QueueItemType::Conditional, &json!({"predicate": ""})).is_err());

        let ok = QueuePayload::from_parts(
            QueueItemType::Conditional,
            &json!({"predicate": "ci is green", "condition": {"when": "command", "cmd": "true"}}),
        )
        .unwrap();
        match ok {
            QueuePayload::Conditional { condition, .. } => {
                assert_eq!(condition, Condition::Command { cmd: "true".into() })
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_conditional_defaults_to_manual() {
        let ok = QueuePayload::from_parts(QueueItemType::Conditional, &json!({"predicate": "review done"})).unwrap();
        assert!(matches!(
            ok,
            QueuePayload::Conditional {
                condition: Condition::Manual,
                message: None,
                ..
            }
        ));
    }

    #[test]
    fn test_stop_and_pause_accept_empty_payload() {
        assert!(QueuePayload::from_parts(QueueItemType::Stop, &json!({})).is_ok());
        assert!(QueuePayload::from_parts(QueueItemType::Stop, &Value::Null).is_ok());
        let pause = QueuePayload::from_parts(QueueItemType::Pause, &json!({"duration_secs": 30})).unwrap();
        assert_eq!(
            pause,
            QueuePayload::Pause {
                duration_secs: Some(30),
                reason: None
            }
        );
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = QueuePayload::from_parts(QueueItemType::Message, &json!({"text": "hi", "bogus": 1})).unwrap_err();
        assert!(matches!(err, LoopdError::InvalidArgument(_)));

        let err = QueuePayload::from_parts(
            QueueItemType::Conditional,
            &json!({"predicate": "later", "condition": {"when": "not_before", "at_ms": 1, "cmd": "true"}}),
        )
        .unwrap_err();
        assert!(matches!(err, LoopdError::InvalidArgument(_)));

        // Stored form still parses
        let payload = QueuePayload::Conditional {
            predicate: "ci".into(),
            condition: Condition::Manual,
            message: None,
        };
        let fields = payload.to_fields().unwrap();
        assert_eq!(QueuePayload::from_parts(QueueItemType::Conditional, &fields).unwrap(), payload);
    }

    #[test]
    fn test_payload_must_be_object() {
        assert!(QueuePayload::from_parts(QueueItemType::Message, &json!("hello")).is_err());
    }

    #[test]
    fn test_to_fields_strips_tag() {
        let fields = QueuePayload::Message { text: "hi".into() }.to_fields().unwrap();
        assert_eq!(fields, json!({"text": "hi"}));
        let back = QueuePayload::from_parts(QueueItemType::Message, &fields).unwrap();
        assert_eq!(back, QueuePayload::Message { text: "hi".into() });
    }
}
