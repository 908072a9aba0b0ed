mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    http::{HeaderValue, Method, header},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use agora_api::uploads::UploadStore;
use agora_api::{AppState, AppStateInner, Settings};
use agora_db::Database;
use agora_gateway::GatewayState;
use agora_gateway::dispatcher::Dispatcher;
use agora_notify::{DisabledPush, LogMailer, Mailer, PushSender, SmtpMailer, WebPushSender};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agora=debug,agora_api=debug,agora_gateway=debug,tower_http=debug".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {}", e);
            eprintln!("       Fix it in your environment or .env file and restart.");
            std::process::exit(1);
        }
    };

    let db = Arc::new(Database::open(&config.db_path)?);
    let uploads = UploadStore::new(&config.upload_dir).await?;

    let mailer: Arc<dyn Mailer> = match &config.smtp {
        Some(smtp) => {
            info!("Sending mail through {}:{}", smtp.host, smtp.port);
            Arc::new(SmtpMailer::new(
                &smtp.host,
                smtp.port,
                smtp.username.as_deref(),
                smtp.password.as_deref(),
                &smtp.from,
            )?)
        }
        None => {
            warn!("SMTP_HOST not set, verification mail will only be logged");
            Arc::new(LogMailer)
        }
    };

    let push: Arc<dyn PushSender> = match &config.vapid {
        Some(vapid) => Arc::new(WebPushSender::new(
            vapid.private_key_pem.clone(),
            vapid.subject.clone(),
        )?),
        None => {
            info!("VAPID keys not set, push notifications disabled");
            Arc::new(DisabledPush)
        }
    };

    let dispatcher = Dispatcher::new();
    let state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        jwt_secret: config.jwt_secret.clone(),
        dispatcher: dispatcher.clone(),
        mailer,
        push,
        uploads,
        settings: Settings {
            frontend_url: config.frontend_url.clone(),
            vapid_public_key: config.vapid.as_ref().map(|v| v.public_key.clone()),
            max_upload_bytes: config.max_upload_bytes,
        },
    });

    let gateway = agora_gateway::router(GatewayState {
        dispatcher,
        db,
        jwt_secret: config.jwt_secret.clone(),
    });

    let app = Router::new()
        .merge(agora_api::router(state))
        .merge(gateway)
        .nest_service("/uploads", ServeDir::new(&config.upload_dir))
        .layer(cors_layer(&config.frontend_url))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_addr().parse()?;
    info!("Agora server listening on {} (public URL {})", addr, config.backend_url);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Agora server stopped");
    Ok(())
}

/// Only the web client's origin may call the API from a browser.
fn cors_layer(frontend_url: &str) -> CorsLayer {
    let origin = match frontend_url.parse::<HeaderValue>() {
        Ok(origin) => AllowOrigin::exact(origin),
        Err(_) => {
            warn!("AGORA_FRONTEND_URL is not a valid origin, allowing any");
            AllowOrigin::any()
        }
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
