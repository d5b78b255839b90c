//! Live smoke binary: wires the chat runtime and media proxy against a real
//! endpoint and prints the event stream for a short watch window.

mod config;
mod logging;

use std::{sync::Arc, time::Duration};

use backend_remote::spawn_runtime;
use chat_core::{ChatCommand, ChatEvent};
use media_proxy::{MediaProxyCache, ReqwestMediaTransport};
use tokio::time::{Instant, timeout_at};
use tracing::{info, warn};

use crate::config::SmokeConfig;

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(2);
        }
    };

    let Some(auth_token) = config.auth_token.clone() else {
        println!("Runtime wiring OK. Set TERNCHAT_API_TOKEN to run a live smoke.");
        println!("Optional: TERNCHAT_CONVERSATION_ID to open a conversation,");
        println!("          TERNCHAT_MEDIA_URL to exercise the media proxy.");
        return;
    };

    let handle = spawn_runtime();
    let mut events = handle.subscribe();

    if let Err(err) = handle
        .send(ChatCommand::Init {
            base_url: config.base_url.clone(),
            auth_token,
            config: config.init_config.clone(),
        })
        .await
    {
        eprintln!("Failed to reach runtime: {err}");
        std::process::exit(1);
    }

    if let Some(conversation_id) = config.conversation_id.clone() {
        let _ = handle
            .send(ChatCommand::OpenConversation { conversation_id })
            .await;
    }

    if let Some(media_url) = config.media_url.clone() {
        fetch_media_once(&media_url).await;
    }

    info!(watch_secs = config.watch_secs, "watching runtime events");
    let deadline = Instant::now() + Duration::from_secs(config.watch_secs);
    loop {
        match timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) => print_event(event),
            Ok(Err(err)) => {
                warn!(error = %err, "event stream ended");
                break;
            }
            Err(_) => break,
        }
    }

    let _ = handle.send(ChatCommand::Shutdown).await;
}

async fn fetch_media_once(media_url: &str) {
    let transport = match ReqwestMediaTransport::new() {
        Ok(transport) => transport,
        Err(err) => {
            warn!(error = %err, "media transport unavailable");
            return;
        }
    };
    let cache = Arc::new(MediaProxyCache::new(transport));

    match cache.fetch(media_url, false).await {
        Ok(media) => info!(
            url = media_url,
            content_type = %media.content_type,
            size = media.bytes.len(),
            "media fetched through proxy cache"
        ),
        Err(err) => warn!(url = media_url, error = %err, "media fetch degraded to typed error"),
    }
}

fn print_event(event: ChatEvent) {
    match event {
        ChatEvent::StateChanged { state } => info!(?state, "runtime state changed"),
        ChatEvent::AuthResult {
            success,
            account,
            error_code,
        } => info!(success, ?account, ?error_code, "auth result"),
        ChatEvent::ConversationSnapshot {
            snapshot,
            appended_newest,
        } => info!(
            conversation_id = %snapshot.conversation_id,
            messages = snapshot.messages.len(),
            next_cursor = ?snapshot.next_cursor,
            is_loading_initial = snapshot.is_loading_initial,
            is_loading_more = snapshot.is_loading_more,
            appended_newest,
            "conversation snapshot"
        ),
        ChatEvent::SendAck(ack) => info!(
            conversation_id = %ack.conversation_id,
            provisional_id = ack.provisional_id,
            message_id = ?ack.message_id,
            error_code = ?ack.error_code,
            "send acknowledged"
        ),
        ChatEvent::SyncStatus(status) => info!(
            conversation_id = %status.conversation_id,
            running = status.running,
            "poll schedule status"
        ),
        ChatEvent::FatalError {
            code,
            message,
            recoverable,
        } => warn!(%code, %message, recoverable, "runtime error"),
    }
}
