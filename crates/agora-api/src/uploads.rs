use std::fmt;
use std::path::{Path as FsPath, PathBuf};
use std::str::FromStr;

use axum::{
    Json,
    extract::{Multipart, State},
    http::StatusCode,
    response::IntoResponse,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use agora_types::api::UploadResponse;
use agora_types::events::GatewayEvent;
use agora_types::models::MediaType;

use crate::error::ApiError;
use crate::extract::{ApiPath, AuthUser};
use crate::state::{AppState, db_call};

/// URL prefix under which the upload directory is served.
pub const PUBLIC_PREFIX: &str = "/uploads";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFolder {
    Posts,
    Comments,
    Messages,
    Avatars,
}

impl UploadFolder {
    pub const ALL: [UploadFolder; 4] = [Self::Posts, Self::Comments, Self::Messages, Self::Avatars];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Posts => "posts",
            Self::Comments => "comments",
            Self::Messages => "messages",
            Self::Avatars => "avatars",
        }
    }
}

impl fmt::Display for UploadFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadFolder {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| ApiError::BadRequest(format!("Unknown upload folder '{}'", s)))
    }
}

pub struct StoredUpload {
    pub url: String,
    pub media_type: MediaType,
    pub size: u64,
}

/// Files on disk under `{root}/{folder}/{uuid}.{ext}`.
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    /// Creates the root and every folder.
    pub async fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        for folder in UploadFolder::ALL {
            tokio::fs::create_dir_all(root.join(folder.as_str())).await?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &FsPath {
        &self.root
    }

    pub async fn save(
        &self,
        folder: UploadFolder,
        file_name: Option<&str>,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<StoredUpload, ApiError> {
        let (media_type, ext) = classify_upload(file_name, content_type)
            .ok_or_else(|| ApiError::BadRequest("Unsupported file type".into()))?;
        if folder == UploadFolder::Avatars && media_type != MediaType::Image {
            return Err(ApiError::BadRequest("Avatars must be images".into()));
        }

        let name = format!("{}.{}", Uuid::new_v4(), ext);
        let path = self.root.join(folder.as_str()).join(&name);

        let mut file = tokio::fs::File::create(&path).await.map_err(|e| {
            error!("Failed to create file {}: {}", path.display(), e);
            ApiError::Internal(e.into())
        })?;
        file.write_all(bytes).await.map_err(|e| {
            error!("Failed to write file {}: {}", path.display(), e);
            ApiError::Internal(e.into())
        })?;
        file.flush().await.map_err(|e| ApiError::Internal(e.into()))?;

        Ok(StoredUpload {
            url: format!("{}/{}/{}", PUBLIC_PREFIX, folder, name),
            media_type,
            size: bytes.len() as u64,
        })
    }

    /// Delete the file behind a public upload URL. URLs that do not point
    /// into the store are ignored. Returns whether a file was removed.
    pub async fn remove_url(&self, url: &str) -> anyhow::Result<bool> {
        let Some(path) = self.path_for_url(url) else {
            debug!("Not a managed upload, skipping removal: {}", url);
            return Ok(false);
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort removal of files left behind by deleted content.
    pub async fn remove_all(&self, urls: &[String]) {
        for url in urls {
            match self.remove_url(url).await {
                Ok(true) => debug!("Removed upload {}", url),
                Ok(false) => {}
                Err(e) => warn!("Failed to remove upload {}: {}", url, e),
            }
        }
    }

    fn path_for_url(&self, url: &str) -> Option<PathBuf> {
        let rest = url.strip_prefix(PUBLIC_PREFIX)?.strip_prefix('/')?;
        let (folder, name) = rest.split_once('/')?;
        let folder: UploadFolder = folder.parse().ok()?;
        let valid_name = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        valid_name.then(|| self.root.join(folder.as_str()).join(name))
    }
}

/// Media type and stored extension, from the file name when it has a
/// known extension, otherwise from the declared content type.
fn classify_upload(file_name: Option<&str>, content_type: Option<&str>) -> Option<(MediaType, String)> {
    let from_name = file_name.and_then(|name| {
        let ext = FsPath::new(name).extension()?.to_str()?.to_ascii_lowercase();
        let mime = mime_guess::from_ext(&ext).first()?;
        let media_type = MediaType::from_mime(mime.essence_str())?;
        Some((media_type, ext))
    });

    from_name.or_else(|| {
        let mime = content_type?;
        let media_type = MediaType::from_mime(mime)?;
        let ext = mime_guess::get_mime_extensions_str(mime)
            .and_then(|exts| exts.first())
            .copied()
            .unwrap_or("bin");
        Some((media_type, ext.to_string()))
    })
}

/// POST /api/uploads/{folder}. Multipart with a single `file` field.
pub async fn upload(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ApiPath(folder): ApiPath<String>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let folder: UploadFolder = folder.parse()?;

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await?;

        if bytes.is_empty() {
            return Err(ApiError::BadRequest("Uploaded file is empty".into()));
        }
        if bytes.len() > state.settings.max_upload_bytes {
            return Err(ApiError::PayloadTooLarge);
        }

        let stored = state
            .uploads
            .save(folder, file_name.as_deref(), content_type.as_deref(), &bytes)
            .await?;

        if let Err(e) = claim_upload(&state, folder, claims.sub, &stored.url).await {
            state.uploads.remove_all(std::slice::from_ref(&stored.url)).await;
            return Err(e);
        }
        info!(
            "{} uploaded {} ({} bytes) to {}",
            claims.username, stored.url, stored.size, folder
        );

        return Ok((
            StatusCode::CREATED,
            Json(UploadResponse {
                url: stored.url,
                media_type: stored.media_type,
                size: stored.size,
            }),
        ));
    }

    Err(ApiError::BadRequest("Missing 'file' field".into()))
}

/// Record the caller as owner of a freshly stored file. An avatar upload
/// also becomes the caller's avatar right away, and the previous avatar
/// file is removed when nothing else uses it.
async fn claim_upload(
    state: &AppState,
    folder: UploadFolder,
    user_id: Uuid,
    url: &str,
) -> Result<(), ApiError> {
    let (uid, path) = (user_id.to_string(), url.to_string());
    let is_avatar = folder == UploadFolder::Avatars;
    let reclaimed = db_call(state, move |db| {
        db.record_upload(&path, &uid)?;
        if !is_avatar {
            return Ok(None);
        }
        match db.replace_avatar(&uid, &path) {
            Ok(previous) => Ok(previous),
            Err(e) => {
                if let Err(forget) = db.forget_upload(&path) {
                    warn!("Failed to forget upload {}: {}", path, forget);
                }
                Err(e)
            }
        }
    })
    .await?;

    if !is_avatar {
        return Ok(());
    }
    if let Some(previous) = reclaimed {
        state.uploads.remove_all(&[previous]).await;
    }
    state.dispatcher.broadcast_user_list().await;
    state.dispatcher.broadcast(GatewayEvent::ChatListUpdate {
        user_ids: vec![user_id],
    });
    Ok(())
}
