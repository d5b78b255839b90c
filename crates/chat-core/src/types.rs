use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// High-level runtime lifecycle state reported to subscribers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatLifecycleState {
    /// Runtime has not been initialized yet.
    Cold,
    /// `Init` was accepted and the auth check is currently running.
    Authenticating,
    /// Auth check succeeded; conversation commands are accepted.
    Ready,
    /// Runtime was shut down and no longer accepts conversation commands.
    Closed,
    /// Runtime entered unrecoverable fatal state (for example auth rejection).
    Fatal,
}

/// Message identity across the remote/provisional boundary.
///
/// Server-assigned ids and locally-allocated provisional ids live in disjoint
/// namespaces, so an optimistic insert can never collide with a durable
/// message regardless of what the server's id range looks like.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Durable id assigned by the remote API.
    Remote(i64),
    /// Synthetic id from the process-local provisional sequence.
    Provisional(u64),
}

impl MessageId {
    /// Whether this id belongs to a provisional (not yet acknowledged) message.
    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(id) => write!(f, "{id}"),
            Self::Provisional(seq) => write!(f, "provisional-{seq}"),
        }
    }
}

/// Kind of a media attachment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
    File,
}

/// Media attachment owned by its parent message; immutable once attached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaRef {
    /// Remote media id (`0` while the parent message is provisional).
    pub id: i64,
    /// Attachment kind.
    pub kind: MediaKind,
    /// Resolved media URL.
    pub url: String,
    /// Optional thumbnail URL.
    pub thumb_url: Option<String>,
    /// Whether the current account may fetch the full media.
    pub accessible: bool,
}

/// Canonical message payload held by the per-conversation cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Remote or provisional identity; unique within a conversation.
    pub id: MessageId,
    /// Display-ready text body.
    pub text: String,
    /// Whether the operator account sent this message.
    pub from_self: bool,
    /// Server (or local, while provisional) creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Whether the message is viewable without purchase.
    pub is_free: bool,
    /// Price attached to the message, `0.0` for free messages.
    pub price: f64,
    /// Media attachments.
    pub media: Vec<MediaRef>,
}

impl Message {
    /// Build a provisional message for an optimistic send.
    pub fn provisional(
        seq: u64,
        text: impl Into<String>,
        media: Vec<MediaRef>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::Provisional(seq),
            text: text.into(),
            from_self: true,
            created_at,
            is_free: true,
            price: 0.0,
            media,
        }
    }

    /// Whether this message is still awaiting server acknowledgement.
    pub fn is_provisional(&self) -> bool {
        self.id.is_provisional()
    }
}

/// Media attachment reference supplied with an outgoing send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingMedia {
    /// Attachment kind.
    pub kind: MediaKind,
    /// Already-hosted media URL forwarded to the remote API.
    pub url: String,
}

/// Account details returned by the auth check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountInfo {
    /// Remote account id.
    pub id: i64,
    /// Display name of the operator account.
    pub name: String,
}

/// Optional runtime tuning values supplied with `ChatCommand::Init`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChatInitConfig {
    /// Optional poll cadence override in milliseconds.
    ///
    /// When `None`, the runtime default cadence is used.
    pub poll_interval_ms: Option<u64>,
    /// Optional page size for poll and pagination fetches.
    pub page_limit: Option<u16>,
    /// Optional hard cap used when paginating backward.
    pub pagination_limit_cap: Option<u16>,
}

/// Command channel input accepted by the chat runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ChatCommand {
    /// Initialize the runtime and run the auth check.
    Init {
        /// Remote API base URL, for example `https://api.example.com`.
        base_url: String,
        /// Bearer token forwarded with every request.
        auth_token: String,
        /// Optional runtime tuning overrides.
        config: Option<ChatInitConfig>,
    },
    /// Open a conversation and start its poll schedule.
    OpenConversation {
        /// Target conversation id.
        conversation_id: String,
    },
    /// Close a conversation, stop its poll schedule, and evict its cache.
    CloseConversation {
        /// Target conversation id.
        conversation_id: String,
    },
    /// Optimistically send a message.
    SendMessage {
        /// Target conversation id.
        conversation_id: String,
        /// Message body.
        text: String,
        /// Media attachments to forward.
        media: Vec<OutgoingMedia>,
    },
    /// Paginate backward into older history.
    LoadOlder {
        /// Target conversation id.
        conversation_id: String,
    },
    /// Poll the conversation immediately, outside the fixed cadence.
    Refresh {
        /// Target conversation id.
        conversation_id: String,
    },
    /// Stop all poll schedules and refuse further conversation commands.
    Shutdown,
}

/// Readable projection of one conversation's cache state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationSnapshot {
    /// Conversation id this snapshot belongs to.
    pub conversation_id: String,
    /// Merged, deduplicated messages in ascending `created_at` order.
    pub messages: Vec<Message>,
    /// Opaque token for the next-older page; `None` when history is exhausted.
    pub next_cursor: Option<String>,
    /// `true` until the first successful poll completes.
    pub is_loading_initial: bool,
    /// `true` while a backward-pagination request is in flight.
    pub is_loading_more: bool,
}

/// Acknowledgement for `SendMessage` commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Conversation the send targeted.
    pub conversation_id: String,
    /// Provisional sequence allocated for the optimistic insert.
    pub provisional_id: u64,
    /// Durable message id on success.
    pub message_id: Option<i64>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Poll schedule liveness update for one conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncStatus {
    /// Conversation the schedule belongs to.
    pub conversation_id: String,
    /// Whether the poll schedule is currently running.
    pub running: bool,
}

/// Event channel output emitted by the chat runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ChatEvent {
    /// Runtime lifecycle transition.
    StateChanged {
        /// New lifecycle state.
        state: ChatLifecycleState,
    },
    /// Result of the init-time auth check.
    AuthResult {
        /// `true` when the remote accepted the credentials.
        success: bool,
        /// Account details on success.
        account: Option<AccountInfo>,
        /// Stable error code when `success == false`.
        error_code: Option<String>,
    },
    /// Updated projection of one conversation after any cache mutation.
    ConversationSnapshot {
        /// The projection.
        snapshot: ConversationSnapshot,
        /// Whether the mutation appended messages at the newest end.
        ///
        /// Consumers use this as the auto-scroll signal; whether to actually
        /// scroll (viewer near the bottom) stays a presentation decision.
        appended_newest: bool,
    },
    /// Send acknowledgement.
    SendAck(SendAck),
    /// Poll schedule started or stopped for a conversation.
    SyncStatus(SyncStatus),
    /// Fatal runtime error.
    FatalError {
        /// Stable error code.
        code: String,
        /// Human-readable error message.
        message: String,
        /// Indicates whether retrying may recover.
        recoverable: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisional_ids_are_distinct_from_remote_ids() {
        assert_ne!(MessageId::Provisional(7), MessageId::Remote(7));
        assert!(MessageId::Provisional(7).is_provisional());
        assert!(!MessageId::Remote(7).is_provisional());
    }

    #[test]
    fn provisional_constructor_marks_message_as_own() {
        let msg = Message::provisional(1, "hi", Vec::new(), Utc::now());
        assert!(msg.is_provisional());
        assert!(msg.from_self);
        assert_eq!(msg.text, "hi");
        assert_eq!(msg.price, 0.0);
    }

    #[test]
    fn message_id_display_tags_provisional_entries() {
        assert_eq!(MessageId::Remote(42).to_string(), "42");
        assert_eq!(MessageId::Provisional(3).to_string(), "provisional-3");
    }
}
