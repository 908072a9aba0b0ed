use std::path::PathBuf;

use thiserror::Error;

/// Secrets shipped in example env files. Starting with one of these would
/// let anyone mint tokens.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me",
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "secret",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is unset")]
    Missing(&'static str),

    #[error("{0} is still a placeholder value")]
    Placeholder(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },

    #[error("failed to read {name} from {path}: {source}")]
    ReadFile {
        name: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct VapidConfig {
    pub public_key: String,
    pub private_key_pem: String,
    pub subject: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub frontend_url: String,
    pub backend_url: String,
    /// None: mail is logged instead of sent.
    pub smtp: Option<SmtpConfig>,
    /// None: push notifications are disabled.
    pub vapid: Option<VapidConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let jwt_secret = get("AGORA_JWT_SECRET").ok_or(ConfigError::Missing("AGORA_JWT_SECRET"))?;
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            return Err(ConfigError::Placeholder("AGORA_JWT_SECRET"));
        }

        let port = parse_or(get("AGORA_PORT"), "AGORA_PORT", 3000u16)?;
        let max_upload_mb = parse_or(get("AGORA_MAX_UPLOAD_MB"), "AGORA_MAX_UPLOAD_MB", 50usize)?;
        if max_upload_mb == 0 {
            return Err(ConfigError::Invalid {
                name: "AGORA_MAX_UPLOAD_MB",
                value: "0".into(),
            });
        }

        let smtp = match get("SMTP_HOST") {
            Some(host) => {
                let username = get("SMTP_USER");
                let from = get("SMTP_FROM")
                    .or_else(|| username.clone())
                    .ok_or(ConfigError::Missing("SMTP_FROM"))?;
                Some(SmtpConfig {
                    port: parse_or(get("SMTP_PORT"), "SMTP_PORT", 587u16)?,
                    password: get("SMTP_PASS"),
                    host,
                    username,
                    from,
                })
            }
            None => None,
        };

        let vapid = match (get("VAPID_PUBLIC_KEY"), get("VAPID_PRIVATE_KEY_PEM")) {
            (Some(public_key), Some(private)) => Some(VapidConfig {
                public_key,
                private_key_pem: load_pem(private)?,
                subject: get("VAPID_SUBJECT").unwrap_or_else(|| "mailto:admin@localhost".into()),
            }),
            _ => None,
        };

        Ok(Self {
            host: get("AGORA_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            db_path: get("AGORA_DB_PATH").unwrap_or_else(|| "agora.db".into()).into(),
            jwt_secret,
            upload_dir: get("AGORA_UPLOAD_DIR").unwrap_or_else(|| "./uploads".into()).into(),
            max_upload_bytes: max_upload_mb * 1024 * 1024,
            frontend_url: get("AGORA_FRONTEND_URL")
                .unwrap_or_else(|| "http://localhost:5173".into())
                .trim_end_matches('/')
                .to_string(),
            backend_url: get("AGORA_BACKEND_URL")
                .unwrap_or_else(|| "http://localhost:3000".into())
                .trim_end_matches('/')
                .to_string(),
            smtp,
            vapid,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T: std::str::FromStr>(
    raw: Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

/// The key may be given inline or as a path to a PEM file. Escaped
/// newlines from single-line env files are restored.
fn load_pem(value: String) -> Result<String, ConfigError> {
    if value.contains("-----BEGIN") {
        return Ok(value.replace("\\n", "\n"));
    }
    std::fs::read_to_string(&value).map_err(|source| ConfigError::ReadFile {
        name: "VAPID_PRIVATE_KEY_PEM",
        path: value,
        source,
    })
}
