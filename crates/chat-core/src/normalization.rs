use crate::{
    error::{ChatError, ChatErrorCategory},
    types::{ChatEvent, Message, MessageId, SendAck},
};

/// Internal helper describing a send outcome before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Send succeeded and produced the authoritative message.
    Success { message: Message },
    /// Send failed with error details.
    Failure { error: ChatError },
}

/// Convert a send outcome to a stable `ChatEvent::SendAck`.
pub fn normalize_send_outcome(
    conversation_id: impl Into<String>,
    provisional_id: u64,
    outcome: SendOutcome,
) -> ChatEvent {
    let conversation_id = conversation_id.into();
    match outcome {
        SendOutcome::Success { message } => {
            let message_id = match message.id {
                MessageId::Remote(id) => Some(id),
                MessageId::Provisional(_) => None,
            };
            ChatEvent::SendAck(SendAck {
                conversation_id,
                provisional_id,
                message_id,
                error_code: None,
            })
        }
        SendOutcome::Failure { error } => ChatEvent::SendAck(SendAck {
            conversation_id,
            provisional_id,
            message_id: None,
            error_code: Some(error.code),
        }),
    }
}

/// Convert an error into a `FatalError` runtime event.
pub fn normalize_fatal_error(error: ChatError, recoverable: bool) -> ChatEvent {
    ChatEvent::FatalError {
        code: error.code,
        message: error.message,
        recoverable,
    }
}

/// Convert a generic send failure message to a default network-classified error.
pub fn classify_send_error_message(message: impl Into<String>) -> ChatError {
    ChatError::new(ChatErrorCategory::Network, "send_failed", message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn remote_message(id: i64) -> Message {
        Message {
            id: MessageId::Remote(id),
            text: "hi".to_owned(),
            from_self: true,
            created_at: Utc::now(),
            is_free: true,
            price: 0.0,
            media: Vec::new(),
        }
    }

    #[test]
    fn maps_success_to_send_ack() {
        let event = normalize_send_outcome(
            "c1",
            7,
            SendOutcome::Success {
                message: remote_message(8),
            },
        );

        match event {
            ChatEvent::SendAck(ack) => {
                assert_eq!(ack.conversation_id, "c1");
                assert_eq!(ack.provisional_id, 7);
                assert_eq!(ack.message_id, Some(8));
                assert_eq!(ack.error_code, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn maps_failure_to_send_ack_with_stable_error_code() {
        let event = normalize_send_outcome(
            "c1",
            9,
            SendOutcome::Failure {
                error: ChatError::new(
                    ChatErrorCategory::RateLimited,
                    "rate_limited",
                    "slow down",
                ),
            },
        );

        match event {
            ChatEvent::SendAck(ack) => {
                assert_eq!(ack.provisional_id, 9);
                assert_eq!(ack.message_id, None);
                assert_eq!(ack.error_code.as_deref(), Some("rate_limited"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
