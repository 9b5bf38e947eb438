use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::broadcast;

use crate::limits::MAX_INBOX_LEN;
use crate::model::*;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryError(pub String);

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "delivery failed: {}", self.0)
    }
}

impl std::error::Error for DeliveryError {}

/// Fire-and-forget user notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), DeliveryError>;
}

/// Best-effort chat delivery.
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send_message(&self, message: ChatMessage) -> Result<(), DeliveryError>;
}

/// In-process sink: per-user broadcast channels plus a bounded inbox, and a
/// bounded chat log keyed by receiver.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<UserId, broadcast::Sender<Notification>>,
    inboxes: DashMap<UserId, VecDeque<Notification>>,
    chats: DashMap<UserId, VecDeque<ChatMessage>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to live notifications for a user. Creates the channel if needed.
    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Most recent notifications for a user, oldest first.
    pub fn inbox(&self, user_id: &str) -> Vec<Notification> {
        self.inboxes
            .get(user_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn chats_for(&self, receiver_id: &str) -> Vec<ChatMessage> {
        self.chats
            .get(receiver_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for NotifyHub {
    async fn notify(&self, notification: Notification) -> Result<(), DeliveryError> {
        {
            let mut inbox = self.inboxes.entry(notification.user_id.clone()).or_default();
            if inbox.len() >= MAX_INBOX_LEN {
                inbox.pop_front();
            }
            inbox.push_back(notification.clone());
        }
        let user_id = notification.user_id.clone();
        let delivered = self
            .channels
            .get(&user_id)
            .map(|sender| sender.send(notification).is_ok());
        // Every receiver is gone: forget the channel until the next subscribe.
        if delivered == Some(false) {
            self.channels
                .remove_if(&user_id, |_, sender| sender.receiver_count() == 0);
        }
        Ok(())
    }
}

#[async_trait]
impl ChatSender for NotifyHub {
    async fn send_message(&self, message: ChatMessage) -> Result<(), DeliveryError> {
        let mut log = self.chats.entry(message.receiver_id.clone()).or_default();
        if log.len() >= MAX_INBOX_LEN {
            log.pop_front();
        }
        log.push_back(message);
        Ok(())
    }
}

/// Sends the outbox of a committed write. Failures are logged and counted,
/// never returned.
#[derive(Clone)]
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    chat: Arc<dyn ChatSender>,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, chat: Arc<dyn ChatSender>) -> Self {
        Self { notifier, chat }
    }

    pub fn in_process(hub: Arc<NotifyHub>) -> Self {
        Self::new(hub.clone(), hub)
    }

    /// Deliver every message concurrently. Returns how many were delivered.
    pub async fn dispatch(&self, outbox: Vec<Outbound>) -> usize {
        if outbox.is_empty() {
            return 0;
        }
        let sends = outbox.into_iter().map(|msg| async move {
            let (kind, target, result) = match msg {
                Outbound::Notify(n) => {
                    let target = n.user_id.clone();
                    ("notification", target, self.notifier.notify(n).await)
                }
                Outbound::Chat(m) => {
                    let target = m.receiver_id.clone();
                    ("chat", target, self.chat.send_message(m).await)
                }
            };
            match result {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(kind, %target, "side effect dropped: {e}");
                    metrics::counter!(crate::observability::DISPATCH_FAILURES_TOTAL, "kind" => kind)
                        .increment(1);
                    false
                }
            }
        });
        join_all(sends).await.into_iter().filter(|ok| *ok).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(user: &str) -> Notification {
        Notification {
            user_id: user.into(),
            title: "Visit request approved".into(),
            message: "see you there".into(),
            kind: NotificationKind::VisitApproved,
            link: None,
        }
    }

    struct Broken;

    #[async_trait]
    impl Notifier for Broken {
        async fn notify(&self, _: Notification) -> Result<(), DeliveryError> {
            Err(DeliveryError("smtp down".into()))
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("u1");
        hub.notify(note("u1")).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, note("u1"));
        assert_eq!(hub.inbox("u1"), vec![note("u1")]);
    }

    #[tokio::test]
    async fn send_without_subscribers_still_lands_in_inbox() {
        let hub = NotifyHub::new();
        hub.notify(note("u2")).await.unwrap();
        assert_eq!(hub.inbox("u2").len(), 1);
        assert!(hub.inbox("u3").is_empty());
    }

    #[tokio::test]
    async fn inbox_is_bounded() {
        let hub = NotifyHub::new();
        for _ in 0..MAX_INBOX_LEN + 5 {
            hub.notify(note("u1")).await.unwrap();
        }
        assert_eq!(hub.inbox("u1").len(), MAX_INBOX_LEN);
    }

    #[tokio::test]
    async fn chat_log_is_bounded() {
        let hub = NotifyHub::new();
        for i in 0..MAX_INBOX_LEN + 5 {
            hub.send_message(ChatMessage {
                sender_id: "u1".into(),
                receiver_id: "a1".into(),
                property_id: None,
                text: format!("message {i}"),
            })
            .await
            .unwrap();
        }
        let log = hub.chats_for("a1");
        assert_eq!(log.len(), MAX_INBOX_LEN);
        assert_eq!(log[0].text, "message 5");
    }

    #[tokio::test]
    async fn channel_dropped_once_subscribers_leave() {
        let hub = NotifyHub::new();
        let rx = hub.subscribe("u1");
        assert!(hub.channels.contains_key("u1"));
        drop(rx);

        hub.notify(note("u1")).await.unwrap();
        assert!(!hub.channels.contains_key("u1"));
        assert_eq!(hub.inbox("u1").len(), 1);

        let mut rx = hub.subscribe("u1");
        hub.notify(note("u1")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), note("u1"));
    }

    #[tokio::test]
    async fn dispatcher_tolerates_failures() {
        let hub = Arc::new(NotifyHub::new());
        let dispatcher = Dispatcher::new(Arc::new(Broken), hub.clone());
        let delivered = dispatcher
            .dispatch(vec![
                Outbound::Notify(note("u1")),
                Outbound::Chat(ChatMessage {
                    sender_id: "u1".into(),
                    receiver_id: "a1".into(),
                    property_id: Some("p1".into()),
                    text: "hello".into(),
                }),
            ])
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(hub.chats_for("a1").len(), 1);
    }
}
