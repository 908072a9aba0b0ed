use async_trait::async_trait;
use tracing::debug;
use web_push::{
    ContentEncoding, IsahcWebPushClient, SubscriptionInfo, VapidSignatureBuilder, WebPushClient,
    WebPushError, WebPushMessageBuilder,
};

/// Push services may hold undelivered notifications for a day.
const PUSH_TTL_SECS: u32 = 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// The push service no longer knows this endpoint; drop the subscription.
    #[error("push subscription is gone")]
    Gone,
    #[error("push delivery failed: {0}")]
    Delivery(String),
}

/// A browser subscription as registered by the service worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTarget {
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, target: &PushTarget, payload: &[u8]) -> Result<(), PushError>;
}

/// Web Push delivery with VAPID authentication and aes128gcm payloads.
pub struct WebPushSender {
    client: IsahcWebPushClient,
    private_key_pem: String,
    subject: String,
}

impl WebPushSender {
    /// `subject` is the VAPID contact, e.g. `mailto:admin@example.com`.
    pub fn new(private_key_pem: String, subject: String) -> anyhow::Result<Self> {
        Ok(Self {
            client: IsahcWebPushClient::new()?,
            private_key_pem,
            subject,
        })
    }
}

#[async_trait]
impl PushSender for WebPushSender {
    async fn send(&self, target: &PushTarget, payload: &[u8]) -> Result<(), PushError> {
        let info = SubscriptionInfo::new(
            target.endpoint.as_str(),
            target.p256dh.as_str(),
            target.auth.as_str(),
        );

        let mut signature = VapidSignatureBuilder::from_pem(self.private_key_pem.as_bytes(), &info)
            .map_err(|e| PushError::Delivery(format!("invalid VAPID key: {}", e)))?;
        signature.add_claim("sub", self.subject.as_str());
        let signature = signature
            .build()
            .map_err(|e| PushError::Delivery(e.to_string()))?;

        let mut builder = WebPushMessageBuilder::new(&info);
        builder.set_payload(ContentEncoding::Aes128Gcm, payload);
        builder.set_vapid_signature(signature);
        builder.set_ttl(PUSH_TTL_SECS);
        let message = builder
            .build()
            .map_err(|e| PushError::Delivery(e.to_string()))?;

        match self.client.send(message).await {
            Ok(()) => Ok(()),
            Err(WebPushError::EndpointNotValid { .. }) | Err(WebPushError::EndpointNotFound { .. }) => {
                Err(PushError::Gone)
            }
            Err(e) => Err(PushError::Delivery(e.to_string())),
        }
    }
}

/// Used when VAPID keys are not configured.
pub struct DisabledPush;

#[async_trait]
impl PushSender for DisabledPush {
    async fn send(&self, target: &PushTarget, _payload: &[u8]) -> Result<(), PushError> {
        debug!("Push disabled, skipping notification to {}", target.endpoint);
        Ok(())
    }
}
