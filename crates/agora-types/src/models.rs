use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of media attached to a post, comment or message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Pdf,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Pdf => "pdf",
        }
    }

    /// Classify a MIME type such as `image/png` or `application/pdf`.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.trim().to_ascii_lowercase();
        if mime == "application/pdf" {
            return Some(Self::Pdf);
        }
        match mime.split('/').next()? {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }

    /// Classify by file extension. Query strings and fragments are ignored.
    pub fn from_path(path: &str) -> Option<Self> {
        let clean = path.split(['?', '#']).next().unwrap_or(path);
        let ext = Path::new(clean).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "svg" | "avif" => Some(Self::Image),
            "mp4" | "webm" | "mov" | "mkv" | "ogv" | "m4v" => Some(Self::Video),
            "mp3" | "wav" | "ogg" | "oga" | "m4a" | "aac" | "flac" | "opus" => Some(Self::Audio),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "pdf" => Ok(Self::Pdf),
            other => Err(anyhow::anyhow!("unknown media type: {}", other)),
        }
    }
}
