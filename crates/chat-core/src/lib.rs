//! Core contract shared between the chat runtime and its consumers.
//!
//! This crate defines the command/event protocol, the per-conversation
//! message store, lifecycle/poll/send state machines, retry policy, and
//! common error/channel abstractions.

/// Async command/event channel primitives.
pub mod channel;
/// Stable chat error types and HTTP classification helpers.
pub mod error;
/// Event normalization helpers (for example send acknowledgements).
pub mod normalization;
/// Backoff policy used by retry loops.
pub mod retry;
/// Lifecycle, poll-guard, and send-lifecycle state machines.
pub mod state_machine;
/// Per-conversation message cache with merge/dedup/sort invariants.
pub mod store;
/// Protocol types (commands, events, payloads).
pub mod types;

pub use channel::{ChatChannelError, ChatChannels, EventStream};
pub use error::{ChatError, ChatErrorCategory, classify_http_status};
pub use normalization::{SendOutcome, classify_send_error_message, normalize_send_outcome};
pub use retry::RetryPolicy;
pub use state_machine::{ChatStateMachine, PollGuard, PollState, SendLifecycle, SendPhase};
pub use store::{ConversationCache, MergeOutcome, MessageStore, StoreError};
pub use types::{
    AccountInfo, ChatCommand, ChatEvent, ChatInitConfig, ChatLifecycleState,
    ConversationSnapshot, MediaKind, MediaRef, Message, MessageId, OutgoingMedia, SendAck,
    SyncStatus,
};
