use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use agora_db::Database;
use agora_types::auth::decode_token;
use agora_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatcher::Dispatcher;
use crate::upgrade::GatewayState;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Unauthenticated sockets must identify within this window.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a WebSocket whose JWT was already validated at the HTTP upgrade.
pub async fn handle_connection_authenticated(
    socket: WebSocket,
    dispatcher: Dispatcher,
    user_id: Uuid,
    username: String,
) {
    let (sender, receiver) = socket.split();
    info!("{} ({}) connected to gateway (pre-authenticated)", username, user_id);
    run_connection(sender, receiver, dispatcher, user_id, username).await;
}

/// Handle a WebSocket that must authenticate with an `identify` command.
pub async fn handle_connection(socket: WebSocket, state: GatewayState) {
    let (sender, mut receiver) = socket.split();

    let Some(user_id) = wait_for_identify(&mut receiver, &state.jwt_secret).await else {
        warn!("WebSocket client failed to identify, closing");
        return;
    };
    // The token's name is from login time; presence shows the current one.
    let Some(username) = current_username(&state.db, user_id).await else {
        warn!("Identified user {} no longer exists, closing", user_id);
        return;
    };

    info!("{} ({}) connected to gateway", username, user_id);
    run_connection(sender, receiver, state.dispatcher, user_id, username).await;
}

/// Current name of `user_id`, or None when the account is gone.
pub(crate) async fn current_username(db: &Arc<Database>, user_id: Uuid) -> Option<String> {
    let db = db.clone();
    let id = user_id.to_string();
    match tokio::task::spawn_blocking(move || db.get_user_summary(&id)).await {
        Ok(Ok(user)) => user.map(|u| u.username),
        Ok(Err(e)) => {
            warn!("Failed to load user {}: {}", user_id, e);
            None
        }
        Err(e) => {
            error!("spawn_blocking join error: {}", e);
            None
        }
    }
}

async fn run_connection(
    mut sender: SplitSink<WebSocket, Message>,
    receiver: SplitStream<WebSocket>,
    dispatcher: Dispatcher,
    user_id: Uuid,
    username: String,
) {
    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    // Subscribe before going online so this client sees its own user list update.
    let broadcast_rx = dispatcher.subscribe();
    let conn_id = dispatcher.user_online(user_id, username.clone()).await;

    run_connection_loop(sender, receiver, broadcast_rx, &dispatcher, user_id, &username).await;

    dispatcher.user_offline(user_id, conn_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut broadcast_rx: broadcast::Receiver<GatewayEvent>,
    dispatcher: &Dispatcher,
    user_id: Uuid,
    username: &str,
) {
    // Replies addressed to this connection only.
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<GatewayEvent>();

    let pong_flag = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_flag.clone();
    let pong_flag_recv = pong_flag;

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats = 0u32;

        loop {
            tokio::select! {
                event = next_event(&mut broadcast_rx) => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                Some(event) = reply_rx.recv() => {
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let dispatcher_recv = dispatcher.clone();
    let username_recv = username.to_string();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => handle_command(&dispatcher_recv, &reply_tx, cmd).await,
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

/// Next event for this client. A lagging receiver skips what it missed
/// instead of holding the channel back.
async fn next_event(rx: &mut broadcast::Receiver<GatewayEvent>) -> Option<GatewayEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Gateway client lagged, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

async fn handle_command(
    dispatcher: &Dispatcher,
    reply_tx: &mpsc::UnboundedSender<GatewayEvent>,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled
        GatewayCommand::RequestUserList => {
            let users = dispatcher.online_users().await;
            let _ = reply_tx.send(GatewayEvent::UserListUpdate { users });
        }
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &GatewayEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to serialize gateway event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}

async fn wait_for_identify<S, E>(receiver: &mut S, jwt_secret: &str) -> Option<Uuid>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
{
    let identify = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    return match decode_token(jwt_secret, &token) {
                        Ok(claims) => Some(claims.sub),
                        Err(e) => {
                            debug!("Gateway identify rejected: {}", e);
                            None
                        }
                    };
                }
            }
        }
        None
    };

    tokio::time::timeout(IDENTIFY_TIMEOUT, identify).await.ok().flatten()
}
