pub mod email;
pub mod push;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use registry::{PushSubscription, Subscriber, SubscriberRegistry};

/// Emitted exactly once per newly committed chapter, strictly after the
/// artifact is durable.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub chapter_number: u32,
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Push,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum DeliveryOutcome {
    Delivered,
    Failed(String),
    Expired,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    pub subscriber_id: Uuid,
    pub channel: Channel,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug, Error)]
pub enum PushSendError {
    /// The push service reported the subscription gone (404/410); the
    /// registry entry should be pruned.
    #[error("push subscription expired")]
    Expired,
    #[error("push delivery failed: {0}")]
    Transient(String),
}

#[async_trait]
pub trait EmailChannel: Send + Sync {
    async fn send(&self, address: &str, event: &NotificationEvent) -> anyhow::Result<()>;
}

#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn send(
        &self,
        subscription: &PushSubscription,
        event: &NotificationEvent,
    ) -> Result<(), PushSendError>;
}

/// Fans one event out to every registered subscriber, independently and in
/// parallel, under a per-subscriber timeout. One subscriber's failure never
/// affects the others; outcomes are collected instead of raised.
pub struct Notifier {
    registry: Arc<SubscriberRegistry>,
    email: Arc<dyn EmailChannel>,
    push: Arc<dyn PushChannel>,
    delivery_timeout: Duration,
}

impl Notifier {
    pub fn new(
        registry: Arc<SubscriberRegistry>,
        email: Arc<dyn EmailChannel>,
        push: Arc<dyn PushChannel>,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            email,
            push,
            delivery_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub async fn fan_out(&self, event: &NotificationEvent) -> Vec<DeliveryReport> {
        let snapshot = self.registry.snapshot().await;
        if snapshot.is_empty() {
            tracing::debug!(chapter = event.chapter_number, "no subscribers to notify");
            return Vec::new();
        }

        let mut handles = Vec::with_capacity(snapshot.len());
        for subscriber in snapshot {
            let email = Arc::clone(&self.email);
            let push = Arc::clone(&self.push);
            let event = event.clone();
            let timeout = self.delivery_timeout;
            handles.push(tokio::spawn(async move {
                deliver_one(&*email, &*push, &subscriber, &event, timeout).await
            }));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(err) => tracing::error!(?err, "delivery task panicked"),
            }
        }

        // Self-healing: drop subscriptions the push service says are gone.
        for report in &reports {
            if report.outcome == DeliveryOutcome::Expired
                && self.registry.remove(report.subscriber_id).await
            {
                tracing::info!(subscriber = %report.subscriber_id, "pruned expired push subscription");
            }
        }

        let failed = reports
            .iter()
            .filter(|r| r.outcome != DeliveryOutcome::Delivered)
            .count();
        tracing::info!(
            chapter = event.chapter_number,
            delivered = reports.len() - failed,
            failed,
            "fan-out finished"
        );
        reports
    }

    /// Single-subscriber delivery, used by the notification test endpoint.
    pub async fn notify_one(&self, id: Uuid, event: &NotificationEvent) -> Option<DeliveryReport> {
        let subscriber = self.registry.get(id).await?;
        let report = deliver_one(
            &*self.email,
            &*self.push,
            &subscriber,
            event,
            self.delivery_timeout,
        )
        .await;
        if report.outcome == DeliveryOutcome::Expired {
            self.registry.remove(id).await;
        }
        Some(report)
    }
}

async fn deliver_one(
    email: &dyn EmailChannel,
    push: &dyn PushChannel,
    subscriber: &Subscriber,
    event: &NotificationEvent,
    timeout: Duration,
) -> DeliveryReport {
    let (channel, outcome) = match subscriber {
        Subscriber::Email { address, .. } => {
            let outcome = match tokio::time::timeout(timeout, email.send(address, event)).await {
                Ok(Ok(())) => DeliveryOutcome::Delivered,
                Ok(Err(err)) => DeliveryOutcome::Failed(format!("{err:#}")),
                Err(_) => DeliveryOutcome::Failed("delivery timed out".to_string()),
            };
            (Channel::Email, outcome)
        }
        Subscriber::Push { subscription, .. } => {
            let outcome = match tokio::time::timeout(timeout, push.send(subscription, event)).await
            {
                Ok(Ok(())) => DeliveryOutcome::Delivered,
                Ok(Err(PushSendError::Expired)) => DeliveryOutcome::Expired,
                Ok(Err(PushSendError::Transient(reason))) => DeliveryOutcome::Failed(reason),
                Err(_) => DeliveryOutcome::Failed("delivery timed out".to_string()),
            };
            (Channel::Push, outcome)
        }
    };

    if let DeliveryOutcome::Failed(reason) = &outcome {
        tracing::warn!(
            subscriber = %subscriber.id(),
            chapter = event.chapter_number,
            reason,
            "notification delivery failed"
        );
    }

    DeliveryReport {
        subscriber_id: subscriber.id(),
        channel,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingEmail {
        delivered: Mutex<Vec<String>>,
        fail_for: Option<String>,
    }

    #[async_trait]
    impl EmailChannel for RecordingEmail {
        async fn send(&self, address: &str, _event: &NotificationEvent) -> anyhow::Result<()> {
            if self.fail_for.as_deref() == Some(address) {
                anyhow::bail!("mailbox rejected");
            }
            self.delivered.lock().unwrap().push(address.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct ScriptedPush {
        delivered: Mutex<Vec<String>>,
        expired_endpoint: Option<String>,
        block: bool,
    }

    #[async_trait]
    impl PushChannel for ScriptedPush {
        async fn send(
            &self,
            subscription: &PushSubscription,
            _event: &NotificationEvent,
        ) -> Result<(), PushSendError> {
            if self.block {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.expired_endpoint.as_deref() == Some(subscription.endpoint.as_str()) {
                return Err(PushSendError::Expired);
            }
            self.delivered
                .lock()
                .unwrap()
                .push(subscription.endpoint.clone());
            Ok(())
        }
    }

    fn event() -> NotificationEvent {
        NotificationEvent {
            chapter_number: 1156,
            title: "Kapitel 1156".to_string(),
            url: "http://localhost/api/chapters/1156/epub".to_string(),
        }
    }

    fn push_sub(endpoint: &str) -> PushSubscription {
        PushSubscription {
            endpoint: endpoint.to_string(),
            p256dh: "BPk".to_string(),
            auth: "aaa".to_string(),
        }
    }

    fn notifier(
        email: Arc<RecordingEmail>,
        push: Arc<ScriptedPush>,
        timeout: Duration,
    ) -> Notifier {
        Notifier::new(Arc::new(SubscriberRegistry::new()), email, push, timeout)
    }

    #[tokio::test]
    async fn one_failure_does_not_affect_other_subscribers() {
        let email = Arc::new(RecordingEmail {
            fail_for: Some("b@example.com".to_string()),
            ..Default::default()
        });
        let push = Arc::new(ScriptedPush::default());
        let notifier = notifier(Arc::clone(&email), push, Duration::from_secs(5));

        notifier.registry().subscribe_email("a@example.com").await;
        notifier.registry().subscribe_email("b@example.com").await;
        notifier.registry().subscribe_email("c@example.com").await;

        let reports = notifier.fan_out(&event()).await;
        assert_eq!(reports.len(), 3);
        let delivered = reports
            .iter()
            .filter(|r| r.outcome == DeliveryOutcome::Delivered)
            .count();
        assert_eq!(delivered, 2);
        assert!(
            reports
                .iter()
                .any(|r| matches!(&r.outcome, DeliveryOutcome::Failed(reason) if reason.contains("mailbox rejected")))
        );

        let sent = email.delivered.lock().unwrap().clone();
        assert!(sent.contains(&"a@example.com".to_string()));
        assert!(sent.contains(&"c@example.com".to_string()));
    }

    #[tokio::test]
    async fn expired_push_subscription_is_pruned() {
        let email = Arc::new(RecordingEmail::default());
        let push = Arc::new(ScriptedPush {
            expired_endpoint: Some("https://push/dead".to_string()),
            ..Default::default()
        });
        let notifier = notifier(email, Arc::clone(&push), Duration::from_secs(5));

        notifier.registry().subscribe_push(push_sub("https://push/dead")).await;
        notifier.registry().subscribe_push(push_sub("https://push/live")).await;
        assert_eq!(notifier.registry().len().await, 2);

        let reports = notifier.fan_out(&event()).await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().any(|r| r.outcome == DeliveryOutcome::Expired));

        // Dead endpoint is gone; the live one survives for the next event.
        assert_eq!(notifier.registry().len().await, 1);
        assert_eq!(
            push.delivered.lock().unwrap().as_slice(),
            ["https://push/live".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_delivery_times_out_without_blocking_others() {
        let email = Arc::new(RecordingEmail::default());
        let push = Arc::new(ScriptedPush {
            block: true,
            ..Default::default()
        });
        let notifier = notifier(Arc::clone(&email), push, Duration::from_secs(5));

        notifier.registry().subscribe_email("a@example.com").await;
        notifier.registry().subscribe_push(push_sub("https://push/slow")).await;

        let reports = notifier.fan_out(&event()).await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().any(|r| r.channel == Channel::Email
            && r.outcome == DeliveryOutcome::Delivered));
        assert!(reports.iter().any(|r| r.channel == Channel::Push
            && matches!(&r.outcome, DeliveryOutcome::Failed(reason) if reason.contains("timed out"))));
    }

    #[tokio::test]
    async fn subscribers_added_after_snapshot_are_not_notified() {
        let email = Arc::new(RecordingEmail::default());
        let push = Arc::new(ScriptedPush::default());
        let notifier = notifier(Arc::clone(&email), push, Duration::from_secs(5));

        notifier.registry().subscribe_email("early@example.com").await;
        let reports = notifier.fan_out(&event()).await;
        notifier.registry().subscribe_email("late@example.com").await;

        assert_eq!(reports.len(), 1);
        let sent = email.delivered.lock().unwrap().clone();
        assert_eq!(sent, ["early@example.com".to_string()]);
    }

    #[tokio::test]
    async fn notify_one_targets_a_single_subscriber() {
        let email = Arc::new(RecordingEmail::default());
        let push = Arc::new(ScriptedPush::default());
        let notifier = notifier(Arc::clone(&email), push, Duration::from_secs(5));

        let id = notifier.registry().subscribe_email("a@example.com").await;
        notifier.registry().subscribe_email("b@example.com").await;

        let report = notifier.notify_one(id, &event()).await.unwrap();
        assert_eq!(report.outcome, DeliveryOutcome::Delivered);
        assert_eq!(
            email.delivered.lock().unwrap().as_slice(),
            ["a@example.com".to_string()]
        );

        assert!(notifier.notify_one(Uuid::new_v4(), &event()).await.is_none());
    }
}
