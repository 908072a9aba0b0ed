use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use agora_db::queries::is_constraint_violation;
use agora_notify::mail::verification_email;
use agora_types::api::{
    LoginRequest, LoginResponse, MessageBody, RegisterRequest, RegisterResponse,
    ResendVerificationRequest, VerifyEmailQuery,
};
use agora_types::auth::issue_token;

use crate::convert::{parse_id, user_profile};
use crate::error::ApiError;
use crate::extract::{ApiJson, ApiQuery, AuthUser};
use crate::state::{AppState, db_call};

const USERNAME_MIN: usize = 3;
const USERNAME_MAX: usize = 32;
const PASSWORD_MIN: usize = 8;

pub(crate) fn validate_username(username: &str) -> Result<(), ApiError> {
    let len = username.chars().count();
    if !(USERNAME_MIN..=USERNAME_MAX).contains(&len) {
        return Err(ApiError::BadRequest(format!(
            "Username must be {}-{} characters",
            USERNAME_MIN, USERNAME_MAX
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(ApiError::BadRequest(
            "Username may only contain letters, digits, '_', '.' and '-'".into(),
        ));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), ApiError> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
                && domain
                    .split_once('.')
                    .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ApiError::BadRequest("Invalid email address".into()))
    }
}

fn validate_password(password: &str) -> Result<(), ApiError> {
    if password.chars().count() < PASSWORD_MIN {
        return Err(ApiError::BadRequest(format!(
            "Password must be at least {} characters",
            PASSWORD_MIN
        )));
    }
    Ok(())
}

fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("password hashing failed: {}", e)))?
        .to_string();
    Ok(hash)
}

fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!("Stored password hash is unreadable: {}", e);
            false
        }
    }
}

fn new_verification_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

async fn send_verification(state: &AppState, email: &str, username: &str, token: &str) {
    let link = state
        .settings
        .frontend_link(&format!("/verify-email?token={}", token));
    let mail = verification_email(email, username, &link);
    if let Err(e) = state.mailer.send(mail).await {
        warn!("Failed to send verification email to {}: {:#}", email, e);
    }
}

/// POST /api/auth/register
pub async fn register(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = req.username.trim().to_string();
    let email = req.email.trim().to_lowercase();
    validate_username(&username)?;
    validate_email(&email)?;
    validate_password(&req.password)?;

    let password_hash = hash_password(&req.password)?;
    let token = new_verification_token();
    let user_id = Uuid::new_v4();

    let (uname, mail, tok) = (username.clone(), email.clone(), token.clone());
    let outcome = db_call(&state, move |db| {
        if db.username_taken(&uname, None)? {
            return Ok(Err("Username already taken"));
        }
        if db.email_taken(&mail)? {
            return Ok(Err("Email already registered"));
        }
        match db.create_user(&user_id.to_string(), &uname, &mail, &password_hash, &tok) {
            Ok(()) => Ok(Ok(())),
            Err(e) if is_constraint_violation(&e) => Ok(Err("Username or email already taken")),
            Err(e) => Err(e),
        }
    })
    .await?;
    outcome.map_err(|msg| ApiError::Conflict(msg.into()))?;

    info!("Registered {} ({})", username, user_id);
    send_verification(&state, &email, &username, &token).await;
    state.dispatcher.broadcast_user_list().await;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user_id,
            message: "Registration successful. Check your email to verify your account.".into(),
        }),
    ))
}

/// GET /api/auth/verify-email?token=
pub async fn verify_email(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<VerifyEmailQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = db_call(&state, move |db| db.verify_email(&query.token))
        .await?
        .ok_or_else(|| ApiError::BadRequest("Invalid or expired verification token".into()))?;

    info!("Verified email for {}", user_id);
    Ok(Json(MessageBody {
        message: "Email verified. You can now log in.".into(),
    }))
}

/// POST /api/auth/resend-verification
///
/// Always answers with the same message so the endpoint cannot be used to
/// probe which addresses are registered.
pub async fn resend_verification(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ResendVerificationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let email = req.email.trim().to_lowercase();
    let lookup = email.clone();
    let user = db_call(&state, move |db| db.get_user_by_email(&lookup)).await?;

    if let Some(user) = user.filter(|u| !u.is_verified) {
        let token = new_verification_token();
        let (uid, tok) = (user.id.clone(), token.clone());
        db_call(&state, move |db| db.set_verification_token(&uid, &tok)).await?;
        send_verification(&state, &user.email, &user.username, &token).await;
    }

    Ok(Json(MessageBody {
        message: "If the account exists and is unverified, a new verification email has been sent."
            .into(),
    }))
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let login = req.email.trim().to_string();
    let user = db_call(&state, move |db| db.get_user_by_login(&login))
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Invalid credentials".into()))?;

    if !verify_password(&req.password, &user.password) {
        return Err(ApiError::Unauthorized("Invalid credentials".into()));
    }
    if !user.is_verified {
        return Err(ApiError::Unauthorized("Email not verified".into()));
    }

    let user_id = parse_id(&user.id, "user id");
    let token = issue_token(&state.jwt_secret, user_id, &user.username)?;
    info!("{} logged in", user.username);

    Ok(Json(LoginResponse {
        token,
        user: user_profile(user),
    }))
}

/// GET /api/auth/me
pub async fn me(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let uid = claims.sub.to_string();
    let user = db_call(&state, move |db| db.get_user_by_id(&uid))
        .await?
        .ok_or_else(|| ApiError::not_found("User"))?;
    Ok(Json(user_profile(user)))
}
