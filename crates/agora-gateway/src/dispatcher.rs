use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use agora_types::events::{GatewayEvent, OnlineUser};

/// Capacity of the fan-out channel. Receivers that fall further behind
/// skip the missed events.
const BROADCAST_CAPACITY: usize = 1024;

struct Presence {
    username: String,
    connections: HashSet<Uuid>,
}

/// Manages all connected clients and broadcasts events.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel for gateway events. Every connected client receives every event.
    broadcast_tx: broadcast::Sender<GatewayEvent>,

    /// Online users: user_id -> username + open connection ids
    online_users: RwLock<HashMap<Uuid, Presence>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                online_users: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to gateway events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected clients.
    pub fn broadcast(&self, event: GatewayEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Register a connection for `user_id`. Returns the connection id to pass
    /// to `user_offline`. The user list is re-broadcast when the user was
    /// not online before.
    pub async fn user_online(&self, user_id: Uuid, username: String) -> Uuid {
        let conn_id = Uuid::new_v4();
        let first = {
            let mut users = self.inner.online_users.write().await;
            let presence = users.entry(user_id).or_insert_with(|| Presence {
                username: username.clone(),
                connections: HashSet::new(),
            });
            presence.username = username;
            presence.connections.insert(conn_id);
            presence.connections.len() == 1
        };

        if first {
            self.broadcast_user_list().await;
        }
        conn_id
    }

    /// Drop one connection. The user goes offline once their last
    /// connection closes.
    pub async fn user_offline(&self, user_id: Uuid, conn_id: Uuid) {
        let went_offline = {
            let mut users = self.inner.online_users.write().await;
            match users.get_mut(&user_id) {
                Some(presence) => {
                    presence.connections.remove(&conn_id);
                    if presence.connections.is_empty() {
                        users.remove(&user_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if went_offline {
            self.broadcast_user_list().await;
        }
    }

    /// Get list of online users, sorted by username.
    pub async fn online_users(&self) -> Vec<OnlineUser> {
        let mut users: Vec<OnlineUser> = self
            .inner
            .online_users
            .read()
            .await
            .iter()
            .map(|(id, p)| OnlineUser {
                id: *id,
                username: p.username.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.username.to_lowercase().cmp(&b.username.to_lowercase()));
        users
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.online_users.read().await.contains_key(&user_id)
    }

    /// Rename an online user (profile update) without touching connections.
    pub async fn rename_user(&self, user_id: Uuid, username: String) {
        if let Some(p) = self.inner.online_users.write().await.get_mut(&user_id) {
            p.username = username;
        }
    }

    /// Tell every client to refresh its user list.
    pub async fn broadcast_user_list(&self) {
        let users = self.online_users().await;
        self.broadcast(GatewayEvent::UserListUpdate { users });
    }
}
