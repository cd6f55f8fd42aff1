//! Local notification capability.
//!
//! The link engine only builds [`Notification`] values and hands them to a
//! [`Notifier`]; scheduling and presentation belong to the host.
use log::info;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::logutil::escape_log;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub body: String,
    /// Deep link, e.g. `meshlink:///messages?user=42&id=7`.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub delay: Option<Duration>,
    /// Replace a delivered notification with the same id.
    pub remove_existing: bool,
}

pub trait Notifier: Send + Sync {
    fn queue(&self, notification: Notification, options: QueueOptions);
}

/// Forwards notifications over an mpsc channel to the host.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<(Notification, QueueOptions)>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(Notification, QueueOptions)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn queue(&self, notification: Notification, options: QueueOptions) {
        let _ = self.tx.send((notification, options));
    }
}

/// Writes notifications to the log. Used by the CLI replay.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn queue(&self, n: Notification, _options: QueueOptions) {
        info!(
            target: "notify",
            "[{}] {}{}: {}",
            n.id,
            n.title,
            n.subtitle.map(|s| format!(" ({})", s)).unwrap_or_default(),
            escape_log(&n.body)
        );
    }
}

/// Keeps every queued notification in memory.
#[derive(Debug, Clone, Default)]
pub struct CollectingNotifier {
    queued: Arc<Mutex<Vec<(Notification, QueueOptions)>>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.queued
            .lock()
            .map(|q| q.iter().map(|(n, _)| n.clone()).collect())
            .unwrap_or_default()
    }

    pub fn queued(&self) -> Vec<(Notification, QueueOptions)> {
        self.queued.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

impl Notifier for CollectingNotifier {
    fn queue(&self, notification: Notification, options: QueueOptions) {
        if let Ok(mut q) = self.queued.lock() {
            q.push((notification, options));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Notification {
        Notification {
            id: "notification.id.user_42".into(),
            title: "New Direct Message Received".into(),
            subtitle: Some("From: Alice".into()),
            body: "hi".into(),
            path: None,
        }
    }

    #[test]
    fn collecting_notifier_keeps_order() {
        let n = CollectingNotifier::new();
        n.queue(sample(), QueueOptions::default());
        let mut second = sample();
        second.body = "again".into();
        n.queue(
            second,
            QueueOptions {
                delay: Some(Duration::from_secs(1)),
                remove_existing: true,
            },
        );
        let all = n.queued();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].0.body, "again");
        assert!(all[1].1.remove_existing);
    }

    #[tokio::test]
    async fn channel_notifier_forwards() {
        let (n, mut rx) = ChannelNotifier::new();
        n.queue(sample(), QueueOptions::default());
        let (got, _) = rx.recv().await.unwrap();
        assert_eq!(got.title, "New Direct Message Received");
    }
}
