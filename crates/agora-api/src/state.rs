use std::sync::Arc;

use tracing::error;

use agora_db::Database;
use agora_gateway::dispatcher::Dispatcher;
use agora_notify::{Mailer, PushSender};

use crate::error::ApiError;
use crate::uploads::UploadStore;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
    pub dispatcher: Dispatcher,
    pub mailer: Arc<dyn Mailer>,
    pub push: Arc<dyn PushSender>,
    pub uploads: UploadStore,
    pub settings: Settings,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Base URL of the web client, used in emailed and pushed links.
    pub frontend_url: String,
    /// Base64url VAPID public key handed to browsers; None disables push.
    pub vapid_public_key: Option<String>,
    pub max_upload_bytes: usize,
}

impl Settings {
    pub fn frontend_link(&self, path: &str) -> String {
        format!("{}{}", self.frontend_url.trim_end_matches('/'), path)
    }
}

/// Run blocking DB work off the async runtime.
pub(crate) async fn db_call<F, T>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || f(&state.db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal(anyhow::anyhow!("background task failed: {}", e))
        })?
        .map_err(ApiError::from)
}
