use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::MessageResponse;

/// An online user as shown in the chat sidebar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub id: Uuid,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageAction {
    Created,
    Updated,
    Deleted,
}

/// Events sent over the WebSocket gateway. Every event goes to every
/// connected client; clients filter what concerns them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// The set of online users changed, or a profile changed
    UserListUpdate { users: Vec<OnlineUser> },

    /// A direct message was created, edited or deleted
    MessageUpdate {
        action: MessageAction,
        message: MessageResponse,
    },

    /// Conversation lists of these users are stale
    ChatListUpdate { user_ids: Vec<Uuid> },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Ask for the current online list (answered to this connection only)
    RequestUserList,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_use_camel_case_tags() {
        let event = GatewayEvent::ChatListUpdate { user_ids: vec![Uuid::nil()] };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "chatListUpdate");
        assert_eq!(json["data"]["user_ids"][0], Uuid::nil().to_string());

        let event = GatewayEvent::UserListUpdate { users: vec![] };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "userListUpdate");
    }

    #[test]
    fn commands_parse_from_client_json() {
        let cmd: GatewayCommand =
            serde_json::from_str(r#"{"type":"identify","data":{"token":"abc"}}"#).unwrap();
        assert!(matches!(cmd, GatewayCommand::Identify { token } if token == "abc"));

        let cmd: GatewayCommand = serde_json::from_str(r#"{"type":"requestUserList"}"#).unwrap();
        assert!(matches!(cmd, GatewayCommand::RequestUserList));
    }
}
