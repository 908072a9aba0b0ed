pub mod connection;
pub mod dispatcher;
pub mod upgrade;

pub use upgrade::{GatewayState, router};
