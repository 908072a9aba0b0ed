use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: OutgoingMail) -> anyhow::Result<()>;
}

/// Delivers mail through an SMTP relay using STARTTLS.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        from: &str,
    ) -> anyhow::Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?.port(port);
        if let (Some(user), Some(pass)) = (username, password) {
            builder = builder.credentials(Credentials::new(user.to_string(), pass.to_string()));
        }

        Ok(Self {
            transport: builder.build(),
            from: from.parse()?,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, mail: OutgoingMail) -> anyhow::Result<()> {
        let email = Message::builder()
            .from(self.from.clone())
            .to(mail.to.parse()?)
            .subject(mail.subject)
            .header(ContentType::TEXT_HTML)
            .body(mail.html)?;

        self.transport.send(email).await?;
        info!("Sent mail to {}", mail.to);
        Ok(())
    }
}

/// Used when SMTP is not configured: the mail is written to the log so
/// verification links stay reachable in development.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: OutgoingMail) -> anyhow::Result<()> {
        info!(to = %mail.to, subject = %mail.subject, "SMTP disabled, mail not sent:\n{}", mail.html);
        Ok(())
    }
}

pub fn verification_email(to: &str, username: &str, link: &str) -> OutgoingMail {
    OutgoingMail {
        to: to.to_string(),
        subject: "Verify your email address".to_string(),
        html: format!(
            "<p>Hi {username},</p>\
             <p>Thanks for signing up. Confirm your email address to activate your account:</p>\
             <p><a href=\"{link}\">{link}</a></p>\
             <p>If you did not create an account you can ignore this message.</p>"
        ),
    }
}
