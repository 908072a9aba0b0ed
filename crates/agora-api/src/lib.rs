pub mod auth;
pub mod comments;
pub mod convert;
pub mod error;
pub mod extract;
pub mod media_html;
pub mod messages;
pub mod middleware;
pub mod notifications;
pub mod posts;
pub mod routes;
pub mod state;
pub mod uploads;
pub mod users;

pub use error::ApiError;
pub use routes::router;
pub use state::{AppState, AppStateInner, Settings};
