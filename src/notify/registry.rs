use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Browser push subscription as delivered by the Push API:
/// delivery endpoint plus the client's encryption key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}

#[derive(Debug, Clone)]
pub enum Subscriber {
    Email { id: Uuid, address: String },
    Push { id: Uuid, subscription: PushSubscription },
}

impl Subscriber {
    pub fn id(&self) -> Uuid {
        match self {
            Subscriber::Email { id, .. } | Subscriber::Push { id, .. } => *id,
        }
    }
}

/// Mutable registry of notification targets. Mutation is safe concurrently
/// with an in-progress fan-out: a fan-out works on a snapshot, so
/// subscribers added afterwards simply miss that event.
#[derive(Default)]
pub struct SubscriberRegistry {
    inner: RwLock<Vec<Subscriber>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an email address; re-subscribing the same address returns
    /// the existing id.
    pub async fn subscribe_email(&self, address: impl Into<String>) -> Uuid {
        let address = address.into();
        let mut inner = self.inner.write().await;
        for sub in inner.iter() {
            if let Subscriber::Email { id, address: existing } = sub
                && existing.eq_ignore_ascii_case(&address)
            {
                return *id;
            }
        }
        let id = Uuid::new_v4();
        tracing::info!(%id, "email subscriber registered");
        inner.push(Subscriber::Email { id, address });
        id
    }

    /// Registers a push subscription; the endpoint is the identity, so
    /// re-subscribing an existing endpoint returns the existing id.
    pub async fn subscribe_push(&self, subscription: PushSubscription) -> Uuid {
        let mut inner = self.inner.write().await;
        for sub in inner.iter() {
            if let Subscriber::Push { id, subscription: existing } = sub
                && existing.endpoint == subscription.endpoint
            {
                return *id;
            }
        }
        let id = Uuid::new_v4();
        tracing::info!(%id, "push subscriber registered");
        inner.push(Subscriber::Push { id, subscription });
        id
    }

    pub async fn unsubscribe_push(&self, endpoint: &str) -> bool {
        let mut inner = self.inner.write().await;
        let before = inner.len();
        inner.retain(|sub| {
            !matches!(sub, Subscriber::Push { subscription, .. } if subscription.endpoint == endpoint)
        });
        inner.len() < before
    }

    pub async fn remove(&self, id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        let before = inner.len();
        inner.retain(|sub| sub.id() != id);
        inner.len() < before
    }

    pub async fn get(&self, id: Uuid) -> Option<Subscriber> {
        self.inner.read().await.iter().find(|s| s.id() == id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<Subscriber> {
        self.inner.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}
