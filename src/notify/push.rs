use async_trait::async_trait;
use web_push::{
    ContentEncoding, HyperWebPushClient, SubscriptionInfo, VapidSignatureBuilder,
    WebPushClient as _, WebPushError, WebPushMessageBuilder,
};

use super::{NotificationEvent, PushChannel, PushSendError};
use crate::notify::registry::PushSubscription;

/// VAPID key pair used to authenticate against push services. Keys are
/// URL-safe base64 raw EC P-256 material, as handed to browsers.
#[derive(Debug, Clone)]
pub struct VapidConfig {
    pub private_key: String,
    pub public_key: String,
    /// `sub` claim, e.g. `mailto:admin@example.com`.
    pub contact: String,
}

impl VapidConfig {
    pub fn from_env() -> anyhow::Result<Option<Self>> {
        let private_key = match std::env::var("MANGASHELF_VAPID_PRIVATE_KEY") {
            Ok(key) if !key.trim().is_empty() => key.trim().to_string(),
            _ => return Ok(None),
        };
        let public_key = std::env::var("MANGASHELF_VAPID_PUBLIC_KEY")
            .map_err(|_| {
                anyhow::anyhow!(
                    "MANGASHELF_VAPID_PUBLIC_KEY is required when MANGASHELF_VAPID_PRIVATE_KEY is set"
                )
            })?
            .trim()
            .to_string();
        let contact = std::env::var("MANGASHELF_VAPID_CONTACT")
            .unwrap_or_else(|_| "mailto:noreply@mangashelf.local".to_string());
        Ok(Some(Self {
            private_key,
            public_key,
            contact,
        }))
    }
}

/// Delivers events over the Web Push protocol: payload encrypted under the
/// subscription's key material (RFC 8291 aes128gcm), request signed with
/// the server's VAPID key, POSTed to the subscription endpoint.
pub struct WebPushChannel {
    client: HyperWebPushClient,
    vapid: VapidConfig,
}

impl WebPushChannel {
    pub fn new(vapid: VapidConfig) -> Self {
        Self {
            client: HyperWebPushClient::new(),
            vapid,
        }
    }

    pub fn public_key(&self) -> &str {
        &self.vapid.public_key
    }
}

#[async_trait]
impl PushChannel for WebPushChannel {
    async fn send(
        &self,
        subscription: &PushSubscription,
        event: &NotificationEvent,
    ) -> Result<(), PushSendError> {
        let info = SubscriptionInfo::new(
            subscription.endpoint.clone(),
            subscription.p256dh.clone(),
            subscription.auth.clone(),
        );

        let mut signature =
            VapidSignatureBuilder::from_base64(&self.vapid.private_key, web_push::URL_SAFE_NO_PAD, &info)
                .map_err(|err| PushSendError::Transient(format!("vapid key: {err}")))?;
        signature.add_claim("sub", self.vapid.contact.as_str());
        let signature = signature
            .build()
            .map_err(|err| PushSendError::Transient(format!("vapid signature: {err}")))?;

        let payload = payload_json(event);
        let mut builder = WebPushMessageBuilder::new(&info);
        builder.set_payload(ContentEncoding::Aes128Gcm, payload.as_bytes());
        builder.set_vapid_signature(signature);
        let message = builder
            .build()
            .map_err(|err| PushSendError::Transient(format!("build push message: {err}")))?;

        match self.client.send(message).await {
            Ok(()) => {
                tracing::debug!(chapter = event.chapter_number, "push notification sent");
                Ok(())
            }
            Err(err) => Err(classify_send_error(err)),
        }
    }
}

/// 404/410 from the push service mean the subscription is gone for good;
/// everything else is worth keeping the subscriber for.
fn classify_send_error(err: WebPushError) -> PushSendError {
    match err {
        WebPushError::EndpointNotFound | WebPushError::EndpointNotValid => PushSendError::Expired,
        other => PushSendError::Transient(other.to_string()),
    }
}

/// Stand-in used when no VAPID key pair is configured.
pub struct DisabledPushChannel;

#[async_trait]
impl PushChannel for DisabledPushChannel {
    async fn send(
        &self,
        _subscription: &PushSubscription,
        _event: &NotificationEvent,
    ) -> Result<(), PushSendError> {
        Err(PushSendError::Transient(
            "vapid keys not configured".to_string(),
        ))
    }
}

/// Contract consumed by the service worker on the subscriber's browser.
fn payload_json(event: &NotificationEvent) -> String {
    serde_json::json!({
        "title": format!("Neues Kapitel {}", event.chapter_number),
        "body": format!("{} ist jetzt verfügbar!", event.title),
        "icon": "/icon-192x192.png",
        "badge": "/badge-72x72.png",
        "tag": "mangashelf-chapter",
        "requireInteraction": true,
        "data": {
            "chapter": event.chapter_number,
            "title": event.title,
            "url": event.url,
        },
    })
    .to_string()
}
