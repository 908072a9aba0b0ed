//! Outbound notifications: verification email and browser push.

pub mod mail;
pub mod push;

pub use mail::{LogMailer, Mailer, OutgoingMail, SmtpMailer};
pub use push::{DisabledPush, PushError, PushSender, PushTarget, WebPushSender};
