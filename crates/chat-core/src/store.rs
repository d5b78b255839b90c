use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{ConversationSnapshot, Message, MessageId};

/// Errors that can occur while mutating the message store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// `insert_provisional` was called with a durable message id.
    #[error("message id '{0}' is not provisional")]
    NotProvisional(MessageId),
    /// A provisional sequence was inserted twice into the same conversation.
    #[error("provisional id '{0}' is already present in the conversation")]
    DuplicateProvisional(u64),
}

/// Result of a `merge_incoming` call, consumed by the poll scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    /// Number of incoming ids that were not present before the merge.
    pub new_ids: usize,
    /// Whether any of the new messages landed at the newest end of the list.
    pub appended_newest: bool,
}

/// Per-conversation cache: merged messages plus the backward-pagination cursor.
#[derive(Debug, Clone, Default)]
pub struct ConversationCache {
    messages: Vec<Message>,
    next_cursor: Option<String>,
    last_sync_at: Option<DateTime<Utc>>,
}

impl ConversationCache {
    /// Merged messages in ascending `created_at` order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Token for the next-older page; `None` when history is exhausted.
    pub fn next_cursor(&self) -> Option<&str> {
        self.next_cursor.as_deref()
    }

    /// Completion time of the most recent successful poll.
    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        self.last_sync_at
    }

    fn position(&self, id: MessageId) -> Option<usize> {
        self.messages.iter().position(|msg| msg.id == id)
    }

    /// Insert-or-overwrite by id. The incoming value wins over any prior
    /// entry; replaced entries keep their list position until the re-sort.
    fn upsert(&mut self, incoming: Message) -> bool {
        match self.position(incoming.id) {
            Some(index) => {
                self.messages[index] = incoming;
                false
            }
            None => {
                self.messages.push(incoming);
                true
            }
        }
    }

    // Stable, so ties keep arrival order.
    fn resort(&mut self) {
        self.messages.sort_by_key(|msg| msg.created_at);
    }
}

/// Authoritative in-memory merge/query surface for conversation messages.
///
/// Every mutating operation leaves each conversation's list deduplicated by
/// id and sorted ascending by `created_at`. Merges are pure functions of
/// current state plus the incoming delta, so interleaved callers cannot
/// resurrect a stale snapshot.
#[derive(Debug, Default)]
pub struct MessageStore {
    conversations: HashMap<String, ConversationCache>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Access a conversation's cache, creating an empty one on first use.
    pub fn conversation(&mut self, conversation_id: &str) -> &ConversationCache {
        self.conversations
            .entry(conversation_id.to_owned())
            .or_default()
    }

    /// Look up a conversation's cache without creating it.
    pub fn get(&self, conversation_id: &str) -> Option<&ConversationCache> {
        self.conversations.get(conversation_id)
    }

    /// Merge a freshly-polled window into the conversation.
    ///
    /// Messages absent from `incoming` are never removed; polls return only a
    /// recent window and older history must survive. Idempotent: merging the
    /// same batch twice yields the same state.
    pub fn merge_incoming(
        &mut self,
        conversation_id: &str,
        incoming: Vec<Message>,
    ) -> MergeOutcome {
        let cache = self
            .conversations
            .entry(conversation_id.to_owned())
            .or_default();

        let prev_newest = cache.messages.last().map(|msg| msg.created_at);
        let mut outcome = MergeOutcome::default();
        for message in incoming {
            let lands_at_tail = prev_newest.is_none_or(|newest| message.created_at >= newest);
            if cache.upsert(message) {
                outcome.new_ids += 1;
                if lands_at_tail {
                    outcome.appended_newest = true;
                }
            }
        }
        cache.resort();
        outcome
    }

    /// Merge an older history page and replace the pagination cursor.
    ///
    /// The cursor is replaced even when `older` is empty; an empty page with a
    /// `None` cursor is the exhaustion signal.
    pub fn prepend_older(
        &mut self,
        conversation_id: &str,
        older: Vec<Message>,
        next_cursor: Option<String>,
    ) {
        let cache = self
            .conversations
            .entry(conversation_id.to_owned())
            .or_default();

        for message in older {
            cache.upsert(message);
        }
        cache.next_cursor = next_cursor;
        cache.resort();
    }

    /// Append a provisional message for an optimistic send.
    pub fn insert_provisional(
        &mut self,
        conversation_id: &str,
        message: Message,
    ) -> Result<(), StoreError> {
        let MessageId::Provisional(seq) = message.id else {
            return Err(StoreError::NotProvisional(message.id));
        };

        let cache = self
            .conversations
            .entry(conversation_id.to_owned())
            .or_default();
        if cache.position(message.id).is_some() {
            return Err(StoreError::DuplicateProvisional(seq));
        }

        cache.messages.push(message);
        cache.resort();
        Ok(())
    }

    /// Swap a provisional entry for the authoritative server message.
    ///
    /// Returns `false` when the conversation is gone or the provisional entry
    /// was already removed; the authoritative message is still merged in the
    /// former-entry-gone case so a racing poll cannot lose it.
    pub fn resolve_provisional(
        &mut self,
        conversation_id: &str,
        provisional_seq: u64,
        real: Message,
    ) -> bool {
        let Some(cache) = self.conversations.get_mut(conversation_id) else {
            return false;
        };

        let removed = match cache.position(MessageId::Provisional(provisional_seq)) {
            Some(index) => {
                cache.messages.remove(index);
                true
            }
            None => false,
        };
        cache.upsert(real);
        cache.resort();
        removed
    }

    /// Roll back a provisional entry after a failed send.
    pub fn remove_provisional(&mut self, conversation_id: &str, provisional_seq: u64) -> bool {
        let Some(cache) = self.conversations.get_mut(conversation_id) else {
            return false;
        };
        match cache.position(MessageId::Provisional(provisional_seq)) {
            Some(index) => {
                cache.messages.remove(index);
                true
            }
            None => false,
        }
    }

    /// Replace the pagination cursor without touching messages.
    ///
    /// Used once per conversation to seed the cursor from the initial page;
    /// subsequent polls never touch the cursor.
    pub fn replace_cursor(&mut self, conversation_id: &str, cursor: Option<String>) {
        if let Some(cache) = self.conversations.get_mut(conversation_id) {
            cache.next_cursor = cursor;
        }
    }

    /// Record a successful poll completion time.
    pub fn mark_synced(&mut self, conversation_id: &str, at: DateTime<Utc>) {
        if let Some(cache) = self.conversations.get_mut(conversation_id) {
            cache.last_sync_at = Some(at);
        }
    }

    /// Evict a conversation's cache. Returns whether it existed.
    pub fn close(&mut self, conversation_id: &str) -> bool {
        self.conversations.remove(conversation_id).is_some()
    }

    /// Projection for the presentation layer.
    ///
    /// `is_loading_initial` is derived: a cache that has never completed a
    /// poll is still loading its first page.
    pub fn snapshot(
        &self,
        conversation_id: &str,
        is_loading_more: bool,
    ) -> Option<ConversationSnapshot> {
        let cache = self.conversations.get(conversation_id)?;
        Some(ConversationSnapshot {
            conversation_id: conversation_id.to_owned(),
            messages: cache.messages.clone(),
            next_cursor: cache.next_cursor.clone(),
            is_loading_initial: cache.last_sync_at.is_none(),
            is_loading_more,
        })
    }
}
