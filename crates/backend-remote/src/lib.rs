//! Remote conversation API adapter and sync runtime.
//!
//! `ConversationApi` is the contract against the third-party messaging API;
//! `HttpConversationApi` implements it over HTTP/JSON. `ChatRuntime` owns the
//! message store and drives the per-conversation poll schedule, backward
//! pagination, and optimistic sends behind a command/event channel pair.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chat_core::{
    AccountInfo, ChatChannelError, ChatChannels, ChatCommand, ChatError, ChatErrorCategory,
    ChatEvent, ChatInitConfig, ChatStateMachine, EventStream, MediaKind, MediaRef, Message,
    MessageId, MessageStore, OutgoingMedia, PollGuard, SendLifecycle, SendOutcome, SyncStatus,
    classify_http_status, normalize_send_outcome,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_PAGE_LIMIT: u16 = 40;
const SERVER_PAGE_LIMIT_CAP: u16 = 100;

/// One page of conversation history returned by the remote API.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePage {
    /// Messages in the page, any order; the store re-sorts after merge.
    pub messages: Vec<Message>,
    /// Token for the next-older page; `None` when history is exhausted.
    pub next_cursor: Option<String>,
}

/// Contract against the remote conversation API.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// Fetch a message page. `cursor: None` requests the most recent window.
    async fn fetch_messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: u16,
    ) -> Result<MessagePage, ChatError>;

    /// Send a message; returns the durable, server-assigned message.
    async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
        media: &[OutgoingMedia],
    ) -> Result<Message, ChatError>;

    /// Validate credentials and fetch the operator account.
    async fn check_auth(&self) -> Result<AccountInfo, ChatError>;
}

/// Connection settings for the HTTP adapter.
#[derive(Debug, Clone)]
pub struct HttpApiConfig {
    pub base_url: String,
    pub auth_token: String,
}

impl HttpApiConfig {
    pub fn new(base_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: auth_token.into(),
        }
    }
}

/// HTTP/JSON implementation of [`ConversationApi`].
#[derive(Debug)]
pub struct HttpConversationApi {
    client: reqwest::Client,
    base_url: String,
    auth_token: String,
}

impl HttpConversationApi {
    pub fn new(config: HttpApiConfig) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| {
                ChatError::new(
                    ChatErrorCategory::Config,
                    "client_build_error",
                    err.to_string(),
                )
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            auth_token: config.auth_token,
        })
    }
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn fetch_messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: u16,
    ) -> Result<MessagePage, ChatError> {
        let mut request = self
            .client
            .get(messages_url(&self.base_url, conversation_id))
            .bearer_auth(&self.auth_token)
            .query(&[("limit", limit.to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        let response = request
            .send()
            .await
            .map_err(|err| map_transport_error("fetch_messages", err))?;
        let page: WireMessagePage = decode_response(response, "fetch_messages").await?;
        Ok(MessagePage {
            messages: page.messages.into_iter().map(message_from_wire).collect(),
            next_cursor: page.next_cursor,
        })
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
        media: &[OutgoingMedia],
    ) -> Result<Message, ChatError> {
        let body = WireSendRequest {
            text,
            media: media
                .iter()
                .map(|item| WireOutgoingMedia {
                    kind: wire_media_kind(item.kind),
                    url: &item.url,
                })
                .collect(),
        };

        let response = self
            .client
            .post(messages_url(&self.base_url, conversation_id))
            .bearer_auth(&self.auth_token)
            .json(&body)
            .send()
            .await
            .map_err(|err| map_transport_error("send_message", err))?;
        let message: WireMessage = decode_response(response, "send_message").await?;
        Ok(message_from_wire(message))
    }

    async fn check_auth(&self) -> Result<AccountInfo, ChatError> {
        let response = self
            .client
            .get(account_url(&self.base_url))
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .map_err(|err| map_transport_error("check_auth", err))?;
        let account: WireAccount = decode_response(response, "check_auth").await?;
        Ok(AccountInfo {
            id: account.id,
            name: account.name,
        })
    }
}

/// Handle for sending commands to and subscribing to a spawned runtime.
#[derive(Clone, Debug)]
pub struct ChatRuntimeHandle {
    channels: ChatChannels,
}

impl ChatRuntimeHandle {
    pub async fn send(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

/// Spawn a runtime that builds its HTTP adapter from `ChatCommand::Init`.
pub fn spawn_runtime() -> ChatRuntimeHandle {
    spawn_runtime_inner(None)
}

/// Spawn a runtime bound to a caller-provided API implementation.
pub fn spawn_runtime_with_api(api: Arc<dyn ConversationApi>) -> ChatRuntimeHandle {
    spawn_runtime_inner(Some(api))
}

fn spawn_runtime_inner(injected_api: Option<Arc<dyn ConversationApi>>) -> ChatRuntimeHandle {
    let (channels, command_rx) = ChatChannels::new(128, 512);
    let runtime = ChatRuntime::new(channels.clone(), command_rx, injected_api);
    tokio::spawn(async move {
        runtime.run().await;
    });

    ChatRuntimeHandle { channels }
}

#[derive(Debug, Clone, Copy)]
struct RuntimeConfig {
    poll_interval: Duration,
    page_limit: u16,
    pagination_limit_cap: u16,
}

impl RuntimeConfig {
    fn resolve(overrides: Option<&ChatInitConfig>) -> Self {
        let poll_interval_ms = overrides
            .and_then(|config| config.poll_interval_ms)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        let page_limit = overrides
            .and_then(|config| config.page_limit)
            .unwrap_or(DEFAULT_PAGE_LIMIT);
        let pagination_limit_cap = overrides
            .and_then(|config| config.pagination_limit_cap)
            .unwrap_or(SERVER_PAGE_LIMIT_CAP);

        Self {
            poll_interval: Duration::from_millis(poll_interval_ms.max(1)),
            page_limit: page_limit.max(1),
            pagination_limit_cap: pagination_limit_cap.max(1),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::resolve(None)
    }
}

/// Cache and in-flight bookkeeping shared between the command loop, poll
/// workers, and send tasks. Locked briefly, never across an await.
#[derive(Default)]
struct SharedState {
    store: MessageStore,
    poll_guards: HashMap<String, PollGuard>,
    loading_more: HashSet<String>,
}

type Shared = Arc<Mutex<SharedState>>;

fn lock_shared(shared: &Shared) -> MutexGuard<'_, SharedState> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct ConversationWorker {
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

struct ChatRuntime {
    channels: ChatChannels,
    command_rx: mpsc::Receiver<ChatCommand>,
    state_machine: ChatStateMachine,
    api: Option<Arc<dyn ConversationApi>>,
    injected_api: Option<Arc<dyn ConversationApi>>,
    shared: Shared,
    workers: HashMap<String, ConversationWorker>,
    config: RuntimeConfig,
    provisional_seq: u64,
}

impl ChatRuntime {
    fn new(
        channels: ChatChannels,
        command_rx: mpsc::Receiver<ChatCommand>,
        injected_api: Option<Arc<dyn ConversationApi>>,
    ) -> Self {
        Self {
            channels,
            command_rx,
            state_machine: ChatStateMachine::default(),
            api: None,
            injected_api,
            shared: Arc::new(Mutex::new(SharedState::default())),
            workers: HashMap::new(),
            config: RuntimeConfig::default(),
            provisional_seq: 0,
        }
    }

    async fn run(mut self) {
        while let Some(command) = self.command_rx.recv().await {
            if let Err(err) = self.handle_command(command).await {
                let recoverable = err.is_transient();
                self.channels.emit(ChatEvent::FatalError {
                    code: err.code,
                    message: err.message,
                    recoverable,
                });
            }
        }
    }

    async fn handle_command(&mut self, command: ChatCommand) -> Result<(), ChatError> {
        match command {
            ChatCommand::Init {
                base_url,
                auth_token,
                config,
            } => self.handle_init(base_url, auth_token, config).await,
            ChatCommand::OpenConversation { conversation_id } => {
                self.handle_open(conversation_id)
            }
            ChatCommand::CloseConversation { conversation_id } => {
                self.handle_close(conversation_id)
            }
            ChatCommand::SendMessage {
                conversation_id,
                text,
                media,
            } => {
                self.handle_send(conversation_id, text, media);
                Ok(())
            }
            ChatCommand::LoadOlder { conversation_id } => self.handle_load_older(conversation_id),
            ChatCommand::Refresh { conversation_id } => self.handle_refresh(conversation_id),
            ChatCommand::Shutdown => self.handle_shutdown(),
        }
    }

    async fn handle_init(
        &mut self,
        base_url: String,
        auth_token: String,
        config: Option<ChatInitConfig>,
    ) -> Result<(), ChatError> {
        let (candidate, transition_events) = self.validate_transition(ChatCommand::Init {
            base_url: String::new(),
            auth_token: String::new(),
            config: None,
        })?;
        self.commit_transition(candidate, transition_events);

        self.config = RuntimeConfig::resolve(config.as_ref());

        let api = match &self.injected_api {
            Some(api) => api.clone(),
            None => {
                match HttpConversationApi::new(HttpApiConfig::new(base_url, auth_token)) {
                    Ok(api) => Arc::new(api) as Arc<dyn ConversationApi>,
                    Err(err) => {
                        self.finish_auth(Err(err));
                        return Ok(());
                    }
                }
            }
        };
        self.api = Some(api.clone());

        let auth_result = api.check_auth().await;
        self.finish_auth(auth_result);
        Ok(())
    }

    fn handle_open(&mut self, conversation_id: String) -> Result<(), ChatError> {
        self.validate_conversation_command()?;
        let api = self.require_api()?;

        if self.workers.contains_key(&conversation_id) {
            debug!(%conversation_id, "conversation already open");
            let state = lock_shared(&self.shared);
            emit_snapshot(&state, &self.channels.event_sender(), &conversation_id, false);
            return Ok(());
        }

        {
            let mut state = lock_shared(&self.shared);
            state.store.conversation(&conversation_id);
            state
                .poll_guards
                .insert(conversation_id.clone(), PollGuard::default());
            emit_snapshot(&state, &self.channels.event_sender(), &conversation_id, false);
        }

        let cancel = CancellationToken::new();
        let task = spawn_poll_worker(
            conversation_id.clone(),
            api,
            self.shared.clone(),
            self.channels.event_sender(),
            cancel.child_token(),
            self.config.poll_interval,
            self.config.page_limit,
        );
        self.workers.insert(
            conversation_id,
            ConversationWorker {
                cancel,
                _task: task,
            },
        );
        Ok(())
    }

    fn handle_close(&mut self, conversation_id: String) -> Result<(), ChatError> {
        self.validate_conversation_command()?;

        let Some(worker) = self.workers.remove(&conversation_id) else {
            debug!(%conversation_id, "close for conversation that is not open");
            return Ok(());
        };

        // In-flight requests complete on their own; their results are
        // discarded once the guard entry and cache are gone.
        worker.cancel.cancel();

        let mut state = lock_shared(&self.shared);
        state.store.close(&conversation_id);
        state.poll_guards.remove(&conversation_id);
        state.loading_more.remove(&conversation_id);
        debug!(%conversation_id, "conversation closed and cache evicted");
        Ok(())
    }

    fn handle_send(&mut self, conversation_id: String, text: String, media: Vec<OutgoingMedia>) {
        let seq = self.next_provisional_seq();

        if let Err(err) = self.validate_conversation_command() {
            self.channels.emit(normalize_send_outcome(
                conversation_id,
                seq,
                SendOutcome::Failure { error: err },
            ));
            return;
        }
        let api = match self.require_api() {
            Ok(api) => api,
            Err(err) => {
                self.channels.emit(normalize_send_outcome(
                    conversation_id,
                    seq,
                    SendOutcome::Failure { error: err },
                ));
                return;
            }
        };

        let mut lifecycle = SendLifecycle::new();
        let provisional = Message::provisional(
            seq,
            text.clone(),
            media.iter().map(provisional_media_ref).collect(),
            Utc::now(),
        );

        {
            let mut state = lock_shared(&self.shared);
            if let Err(err) = state.store.insert_provisional(&conversation_id, provisional) {
                self.channels.emit(normalize_send_outcome(
                    conversation_id,
                    seq,
                    SendOutcome::Failure {
                        error: ChatError::new(
                            ChatErrorCategory::Internal,
                            "provisional_insert_failed",
                            err.to_string(),
                        ),
                    },
                ));
                return;
            }
            if let Err(err) = lifecycle.begin_optimistic() {
                error!(error = %err, "send lifecycle out of sync after insert");
            }
            // The provisional entry is visible before any network round trip.
            emit_snapshot(&state, &self.channels.event_sender(), &conversation_id, true);
        }

        let shared = self.shared.clone();
        let event_tx = self.channels.event_sender();
        tokio::spawn(async move {
            let result = api.send_message(&conversation_id, &text, &media).await;

            let mut state = lock_shared(&shared);
            match result {
                Ok(message) => {
                    if let Err(err) = lifecycle.confirm() {
                        error!(error = %err, "send lifecycle out of sync at confirm");
                    }
                    let replaced =
                        state
                            .store
                            .resolve_provisional(&conversation_id, seq, message.clone());
                    if !replaced {
                        debug!(
                            %conversation_id,
                            provisional_id = seq,
                            "provisional entry already gone at resolve"
                        );
                    }
                    emit_snapshot(&state, &event_tx, &conversation_id, false);
                    let _ = event_tx.send(normalize_send_outcome(
                        conversation_id,
                        seq,
                        SendOutcome::Success { message },
                    ));
                }
                Err(error) => {
                    if let Err(err) = lifecycle.fail() {
                        error!(error = %err, "send lifecycle out of sync at rollback");
                    }
                    state.store.remove_provisional(&conversation_id, seq);
                    warn!(
                        %conversation_id,
                        provisional_id = seq,
                        error = %error,
                        "send failed; provisional entry rolled back"
                    );
                    emit_snapshot(&state, &event_tx, &conversation_id, false);
                    let _ = event_tx.send(normalize_send_outcome(
                        conversation_id,
                        seq,
                        SendOutcome::Failure { error },
                    ));
                }
            }
        });
    }

    fn handle_load_older(&mut self, conversation_id: String) -> Result<(), ChatError> {
        self.validate_conversation_command()?;
        let api = self.require_api()?;

        let Some(worker) = self.workers.get(&conversation_id) else {
            debug!(%conversation_id, "load_older for conversation that is not open");
            return Ok(());
        };
        let cancel = worker.cancel.child_token();

        let cursor = {
            let mut state = lock_shared(&self.shared);
            let Some(cache) = state.store.get(&conversation_id) else {
                return Ok(());
            };
            let Some(cursor) = cache.next_cursor().map(ToOwned::to_owned) else {
                debug!(%conversation_id, "history exhausted; load_older is a no-op");
                return Ok(());
            };
            if !state.loading_more.insert(conversation_id.clone()) {
                debug!(%conversation_id, "pagination already in flight");
                return Ok(());
            }
            emit_snapshot(&state, &self.channels.event_sender(), &conversation_id, false);
            cursor
        };

        let limit = bounded_page_limit(self.config.page_limit, self.config.pagination_limit_cap);
        let shared = self.shared.clone();
        let event_tx = self.channels.event_sender();
        tokio::spawn(async move {
            let result = api
                .fetch_messages(&conversation_id, Some(cursor.as_str()), limit)
                .await;

            let mut state = lock_shared(&shared);
            state.loading_more.remove(&conversation_id);
            if cancel.is_cancelled() {
                return;
            }

            match result {
                Ok(page) => {
                    let exhausted = page.next_cursor.is_none();
                    state
                        .store
                        .prepend_older(&conversation_id, page.messages, page.next_cursor);
                    trace!(%conversation_id, exhausted, "older history page merged");
                }
                Err(err) => {
                    // Cursor is untouched, so the next load_older retries.
                    warn!(%conversation_id, error = %err, "pagination fetch failed");
                }
            }
            emit_snapshot(&state, &event_tx, &conversation_id, false);
        });
        Ok(())
    }

    fn handle_refresh(&mut self, conversation_id: String) -> Result<(), ChatError> {
        self.validate_conversation_command()?;
        let api = self.require_api()?;

        let Some(worker) = self.workers.get(&conversation_id) else {
            debug!(%conversation_id, "refresh for conversation that is not open");
            return Ok(());
        };

        let cancel = worker.cancel.child_token();
        let shared = self.shared.clone();
        let event_tx = self.channels.event_sender();
        let page_limit = self.config.page_limit;
        tokio::spawn(async move {
            poll_conversation(
                &conversation_id,
                api.as_ref(),
                &shared,
                &event_tx,
                &cancel,
                page_limit,
            )
            .await;
        });
        Ok(())
    }

    fn handle_shutdown(&mut self) -> Result<(), ChatError> {
        let (candidate, transition_events) = self.validate_transition(ChatCommand::Shutdown)?;

        for (conversation_id, worker) in self.workers.drain() {
            debug!(%conversation_id, "stopping poll schedule for shutdown");
            worker.cancel.cancel();
        }
        {
            let mut state = lock_shared(&self.shared);
            state.poll_guards.clear();
            state.loading_more.clear();
        }

        self.commit_transition(candidate, transition_events);
        Ok(())
    }

    fn validate_transition(
        &self,
        command: ChatCommand,
    ) -> Result<(ChatStateMachine, Vec<ChatEvent>), ChatError> {
        let mut candidate = self.state_machine.clone();
        let events = candidate.apply(&command)?;
        Ok((candidate, events))
    }

    fn validate_conversation_command(&self) -> Result<(), ChatError> {
        let mut candidate = self.state_machine.clone();
        candidate
            .apply(&ChatCommand::Refresh {
                conversation_id: String::new(),
            })
            .map(|_| ())
    }

    fn commit_transition(&mut self, candidate: ChatStateMachine, events: Vec<ChatEvent>) {
        self.state_machine = candidate;
        for event in events {
            self.channels.emit(event);
        }
    }

    fn finish_auth(&mut self, result: Result<AccountInfo, ChatError>) {
        let success = result.is_ok();
        if let Ok(state_event) = self.state_machine.on_auth_result(success) {
            self.channels.emit(state_event);
        }

        match result {
            Ok(account) => {
                debug!(account_id = account.id, "auth check succeeded");
                self.channels.emit(ChatEvent::AuthResult {
                    success: true,
                    account: Some(account),
                    error_code: None,
                });
            }
            Err(err) => {
                warn!(error = %err, "auth check failed; runtime is fatal");
                self.channels.emit(ChatEvent::AuthResult {
                    success: false,
                    account: None,
                    error_code: Some(err.code),
                });
            }
        }
    }

    fn require_api(&self) -> Result<Arc<dyn ConversationApi>, ChatError> {
        self.api.clone().ok_or_else(|| {
            ChatError::new(
                ChatErrorCategory::Config,
                "runtime_not_initialized",
                "runtime is not initialized; send Init first",
            )
        })
    }

    fn next_provisional_seq(&mut self) -> u64 {
        self.provisional_seq += 1;
        self.provisional_seq
    }
}

fn spawn_poll_worker(
    conversation_id: String,
    api: Arc<dyn ConversationApi>,
    shared: Shared,
    event_tx: broadcast::Sender<ChatEvent>,
    cancel: CancellationToken,
    poll_interval: Duration,
    page_limit: u16,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _ = event_tx.send(ChatEvent::SyncStatus(SyncStatus {
            conversation_id: conversation_id.clone(),
            running: true,
        }));

        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            poll_conversation(
                &conversation_id,
                api.as_ref(),
                &shared,
                &event_tx,
                &cancel,
                page_limit,
            )
            .await;
        }

        let _ = event_tx.send(ChatEvent::SyncStatus(SyncStatus {
            conversation_id,
            running: false,
        }));
    })
}

/// One poll attempt: claim the guard, fetch the latest window, merge.
///
/// Shared by the scheduled tick and the `Refresh` command, so the guard is
/// what keeps overlapping polls for one conversation from interleaving.
async fn poll_conversation(
    conversation_id: &str,
    api: &dyn ConversationApi,
    shared: &Shared,
    event_tx: &broadcast::Sender<ChatEvent>,
    cancel: &CancellationToken,
    page_limit: u16,
) {
    {
        let mut state = lock_shared(shared);
        let Some(guard) = state.poll_guards.get_mut(conversation_id) else {
            return;
        };
        if !guard.try_begin() {
            trace!(%conversation_id, "previous poll still in flight; skipping tick");
            return;
        }
    }

    let result = api.fetch_messages(conversation_id, None, page_limit).await;

    let mut state = lock_shared(shared);
    let Some(guard) = state.poll_guards.get_mut(conversation_id) else {
        // Conversation closed while the fetch was in flight; discard.
        return;
    };
    guard.finish();
    if cancel.is_cancelled() {
        return;
    }

    match result {
        Ok(page) => {
            let first_sync = state
                .store
                .get(conversation_id)
                .is_none_or(|cache| cache.last_sync_at().is_none());
            let outcome = state.store.merge_incoming(conversation_id, page.messages);
            if first_sync {
                // Seed the pagination cursor from the initial page; later
                // polls must not reset pagination progress.
                state.store.replace_cursor(conversation_id, page.next_cursor);
            }
            state.store.mark_synced(conversation_id, Utc::now());

            if outcome.new_ids > 0 || first_sync {
                trace!(
                    %conversation_id,
                    new_ids = outcome.new_ids,
                    appended_newest = outcome.appended_newest,
                    "poll merged new messages"
                );
                emit_snapshot(&state, event_tx, conversation_id, outcome.appended_newest);
            }
        }
        Err(err) => {
            // Best-effort liveness: keep the cache and the schedule.
            warn!(%conversation_id, error = %err, "poll failed; next tick retries");
        }
    }
}

fn emit_snapshot(
    state: &SharedState,
    event_tx: &broadcast::Sender<ChatEvent>,
    conversation_id: &str,
    appended_newest: bool,
) {
    let is_loading_more = state.loading_more.contains(conversation_id);
    if let Some(snapshot) = state.store.snapshot(conversation_id, is_loading_more) {
        let _ = event_tx.send(ChatEvent::ConversationSnapshot {
            snapshot,
            appended_newest,
        });
    }
}

fn provisional_media_ref(outgoing: &OutgoingMedia) -> MediaRef {
    MediaRef {
        id: 0,
        kind: outgoing.kind,
        url: outgoing.url.clone(),
        thumb_url: None,
        accessible: true,
    }
}

/// Clamp a requested page limit against safety and server caps.
///
/// The result is always in `1..=100`.
fn bounded_page_limit(requested: u16, server_cap: u16) -> u16 {
    let safe_requested = requested.max(1);
    let safe_cap = server_cap.max(1);
    safe_requested.min(safe_cap).min(100)
}

fn messages_url(base_url: &str, conversation_id: &str) -> String {
    format!("{base_url}/api/chats/{conversation_id}/messages")
}

fn account_url(base_url: &str) -> String {
    format!("{base_url}/api/me")
}

async fn decode_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation: &str,
) -> Result<T, ChatError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(api_error_from_status(status.as_u16(), operation, &body));
    }

    response.json::<T>().await.map_err(|err| {
        ChatError::new(
            ChatErrorCategory::Serialization,
            "api_decode_error",
            format!("{operation}: {err}"),
        )
    })
}

fn api_error_from_status(status: u16, operation: &str, body: &str) -> ChatError {
    let excerpt: String = body.chars().take(200).collect();
    ChatError::new(
        classify_http_status(status),
        "api_http_error",
        format!("{operation} returned {status}: {excerpt}"),
    )
}

fn map_transport_error(operation: &str, err: reqwest::Error) -> ChatError {
    let code = if err.is_timeout() {
        "request_timeout"
    } else {
        "transport_error"
    };
    ChatError::new(
        ChatErrorCategory::Network,
        code,
        format!("{operation}: {err}"),
    )
}

fn wire_media_kind(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Photo => "photo",
        MediaKind::Video => "video",
        MediaKind::File => "file",
    }
}

fn media_kind_from_wire(kind: &str) -> MediaKind {
    match kind {
        "photo" => MediaKind::Photo,
        "video" => MediaKind::Video,
        _ => MediaKind::File,
    }
}

fn message_from_wire(wire: WireMessage) -> Message {
    Message {
        id: MessageId::Remote(wire.id),
        text: wire.text,
        from_self: wire.from_self,
        created_at: wire.created_at,
        is_free: wire.is_free,
        price: wire.price,
        media: wire
            .media
            .into_iter()
            .map(|media| MediaRef {
                id: media.id,
                kind: media_kind_from_wire(&media.kind),
                url: media.url,
                thumb_url: media.thumb_url,
                accessible: media.accessible,
            })
            .collect(),
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessagePage {
    #[serde(default)]
    messages: Vec<WireMessage>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    id: i64,
    #[serde(default)]
    text: String,
    #[serde(default)]
    from_self: bool,
    created_at: DateTime<Utc>,
    #[serde(default = "default_true")]
    is_free: bool,
    #[serde(default)]
    price: f64,
    #[serde(default)]
    media: Vec<WireMedia>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMedia {
    id: i64,
    #[serde(default)]
    kind: String,
    url: String,
    #[serde(default)]
    thumb_url: Option<String>,
    #[serde(default = "default_true")]
    accessible: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAccount {
    id: i64,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireSendRequest<'a> {
    text: &'a str,
    media: Vec<WireOutgoingMedia<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireOutgoingMedia<'a> {
    kind: &'a str,
    url: &'a str,
}
