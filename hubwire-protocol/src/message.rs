//! Hub message types.

use crate::value::Value;

/// Wire tags for hub message types.
///
/// Only [`Invocation`](MessageType::Invocation),
/// [`Completion`](MessageType::Completion) and [`Ping`](MessageType::Ping) are
/// produced or consumed; the remaining tags are recognised so they can be
/// named in logs and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Invocation = 1,
    StreamItem = 2,
    Completion = 3,
    StreamInvocation = 4,
    CancelInvocation = 5,
    Ping = 6,
    Close = 7,
}

impl MessageType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(MessageType::Invocation),
            2 => Some(MessageType::StreamItem),
            3 => Some(MessageType::Completion),
            4 => Some(MessageType::StreamInvocation),
            5 => Some(MessageType::CancelInvocation),
            6 => Some(MessageType::Ping),
            7 => Some(MessageType::Close),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// A call to a named method on the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationMessage {
    /// Correlation id. `None` when no completion is expected.
    pub invocation_id: Option<String>,
    pub target: String,
    pub arguments: Vec<Value>,
}

impl InvocationMessage {
    /// Creates an invocation that expects a completion.
    pub fn new(
        invocation_id: impl Into<String>,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        let id = invocation_id.into();
        Self {
            invocation_id: if id.is_empty() { None } else { Some(id) },
            target: target.into(),
            arguments,
        }
    }

    /// Creates a fire-and-forget invocation.
    pub fn non_blocking(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            invocation_id: None,
            target: target.into(),
            arguments,
        }
    }
}

/// How an invocation finished.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// The method failed with the given message.
    Error(String),
    /// The method returned nothing.
    Void,
    /// The method returned a value (which may be `null`).
    Result(Value),
}

impl CompletionOutcome {
    /// MessagePack result kind discriminant.
    pub fn result_kind(&self) -> u8 {
        match self {
            CompletionOutcome::Error(_) => 1,
            CompletionOutcome::Void => 2,
            CompletionOutcome::Result(_) => 3,
        }
    }
}

/// The result of an invocation, correlated by id.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionMessage {
    pub invocation_id: String,
    pub outcome: CompletionOutcome,
}

impl CompletionMessage {
    pub fn with_result(invocation_id: impl Into<String>, result: Value) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            outcome: CompletionOutcome::Result(result),
        }
    }

    pub fn with_error(invocation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            outcome: CompletionOutcome::Error(error.into()),
        }
    }

    pub fn void(invocation_id: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            outcome: CompletionOutcome::Void,
        }
    }

    /// Returns the error message, if the invocation failed.
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            CompletionOutcome::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the result value, if one is present.
    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            CompletionOutcome::Result(v) => Some(v),
            _ => None,
        }
    }
}

/// A single unit of hub protocol traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation(InvocationMessage),
    Completion(CompletionMessage),
    Ping,
}

impl HubMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            HubMessage::Invocation(_) => MessageType::Invocation,
            HubMessage::Completion(_) => MessageType::Completion,
            HubMessage::Ping => MessageType::Ping,
        }
    }
}

impl From<InvocationMessage> for HubMessage {
    fn from(m: InvocationMessage) -> Self {
        HubMessage::Invocation(m)
    }
}

impl From<CompletionMessage> for HubMessage {
    fn from(m: CompletionMessage) -> Self {
        HubMessage::Completion(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_codes() {
        assert_eq!(MessageType::Invocation.code(), 1);
        assert_eq!(MessageType::Completion.code(), 3);
        assert_eq!(MessageType::Ping.code(), 6);
        assert_eq!(MessageType::from_code(7), Some(MessageType::Close));
        assert_eq!(MessageType::from_code(142), None);
        assert_eq!(MessageType::from_code(0), None);
    }

    #[test]
    fn test_empty_invocation_id_means_non_blocking() {
        let m = InvocationMessage::new("", "Target", vec![]);
        assert_eq!(m.invocation_id, None);
        assert_eq!(m, InvocationMessage::non_blocking("Target", vec![]));

        let m = InvocationMessage::new("1", "Target", vec![]);
        assert_eq!(m.invocation_id.as_deref(), Some("1"));
    }

    #[test]
    fn test_completion_accessors() {
        let c = CompletionMessage::with_error("1", "boom");
        assert_eq!(c.error(), Some("boom"));
        assert!(c.result().is_none());
        assert_eq!(c.outcome.result_kind(), 1);

        let c = CompletionMessage::void("1");
        assert!(c.error().is_none());
        assert!(c.result().is_none());
        assert_eq!(c.outcome.result_kind(), 2);

        let c = CompletionMessage::with_result("1", Value::Null);
        assert_eq!(c.result(), Some(&Value::Null));
        assert_eq!(c.outcome.result_kind(), 3);
    }

    #[test]
    fn test_hub_message_type() {
        assert_eq!(HubMessage::Ping.message_type(), MessageType::Ping);
        let m: HubMessage = CompletionMessage::void("1").into();
        assert_eq!(m.message_type(), MessageType::Completion);
    }
}
