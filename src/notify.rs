use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    Email,
    Sms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateData {
    pub facility_name: String,
    pub court_name: String,
    /// RFC 3339, UTC.
    pub start_time: String,
    pub reservation_link: String,
}

/// Abstract delivery request; rendering and retries belong to the notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub channel: Channel,
    pub recipient: String,
    pub template: TemplateData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Outbound email/SMS delivery, implemented outside the engine.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, request: &NotificationRequest) -> Result<(), NotifyError>;
}

/// Queue between the engine and the notifier. Enqueueing never blocks and
/// never fails the caller; the dispatcher task logs and drops failed sends.
pub struct NotifyHub {
    tx: mpsc::UnboundedSender<NotificationRequest>,
}

impl NotifyHub {
    /// Spawns the dispatcher task; must be called inside a tokio runtime.
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(notifier, rx));
        Self { tx }
    }

    pub fn send(&self, request: NotificationRequest) {
        if self.tx.send(request).is_err() {
            tracing::warn!("notification dispatcher is gone, dropping request");
            metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
        }
    }
}

async fn dispatch_loop(notifier: Arc<dyn Notifier>, mut rx: mpsc::UnboundedReceiver<NotificationRequest>) {
    while let Some(request) = rx.recv().await {
        let channel = match request.channel {
            Channel::Email => "email",
            Channel::Sms => "sms",
        };
        match notifier.send(&request).await {
            Ok(()) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_SENT_TOTAL, "channel" => channel)
                    .increment(1);
            }
            Err(e) => {
                tracing::warn!("{channel} to {} not delivered: {e}", request.recipient);
                metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL, "channel" => channel)
                    .increment(1);
            }
        }
    }
}

/// Default notifier: writes the request to the log as JSON.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, request: &NotificationRequest) -> Result<(), NotifyError> {
        let body = serde_json::to_string(request).map_err(|e| NotifyError(e.to_string()))?;
        tracing::info!(target: "courtside::notify", "{body}");
        Ok(())
    }
}

/// Records every request it is handed. Optionally fails one channel.
#[derive(Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<NotificationRequest>>,
    failing: Option<Channel>,
    signal: Notify,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request on `channel` is recorded but reported as failed.
    pub fn failing(channel: Channel) -> Self {
        Self {
            failing: Some(channel),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<NotificationRequest> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Wait until at least `n` requests were handed over, or the timeout passes.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.signal.notified();
            if self.sent().len() >= n {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.sent().len() >= n;
            }
        }
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, request: &NotificationRequest) -> Result<(), NotifyError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(request.clone());
        }
        self.signal.notify_waiters();
        if self.failing == Some(request.channel) {
            return Err(NotifyError(format!("{:?} gateway unavailable", request.channel)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(channel: Channel, recipient: &str) -> NotificationRequest {
        NotificationRequest {
            channel,
            recipient: recipient.into(),
            template: TemplateData {
                facility_name: "Riverside".into(),
                court_name: "Court 1".into(),
                start_time: "2024-01-01T10:00:00+00:00".into(),
                reservation_link: "https://book.example/reserve/abc".into(),
            },
        }
    }

    #[tokio::test]
    async fn hub_delivers_in_order() {
        let notifier = Arc::new(MemoryNotifier::new());
        let hub = NotifyHub::new(notifier.clone());
        hub.send(request(Channel::Email, "a@example.com"));
        hub.send(request(Channel::Sms, "+15550100"));

        assert!(notifier.wait_for(2, Duration::from_secs(2)).await);
        let sent = notifier.sent();
        assert_eq!(sent[0].channel, Channel::Email);
        assert_eq!(sent[1].recipient, "+15550100");
    }

    #[tokio::test]
    async fn failed_send_does_not_stop_dispatcher() {
        let notifier = Arc::new(MemoryNotifier::failing(Channel::Sms));
        let hub = NotifyHub::new(notifier.clone());
        hub.send(request(Channel::Sms, "+15550100"));
        hub.send(request(Channel::Email, "a@example.com"));

        assert!(notifier.wait_for(2, Duration::from_secs(2)).await);
        assert_eq!(notifier.sent()[1].channel, Channel::Email);
    }

    #[tokio::test]
    async fn log_notifier_accepts_requests() {
        let result = LogNotifier.send(&request(Channel::Email, "a@example.com")).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let notifier = MemoryNotifier::new();
        assert!(!notifier.wait_for(1, Duration::from_millis(20)).await);
    }
}
