//! Publish/subscribe message bus
//!
//! The daemon consumes trigger and control messages through [`MessageBus`].
//! [`InMemoryBus`] is a plain per-subject fan-out: each subscriber owns a
//! bounded queue and a slow subscriber drops messages rather than blocking
//! the publisher.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::BusError;

/// Queue depth of each subscription
const SUBSCRIPTION_CAPACITY: usize = 64;

/// A message published on a subject
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Subject the message was published to
    pub subject: String,
    /// Raw payload
    pub data: Bytes,
    /// Publish time
    pub time: SystemTime,
    /// Originating device name, when the message was relayed from the fleet backend
    pub thing_name: Option<String>,
}

impl BusMessage {
    /// Create a message stamped with the current time
    pub fn new(subject: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            data: data.into(),
            time: SystemTime::now(),
            thing_name: None,
        }
    }

    /// Attach the originating device name
    pub fn with_thing_name(mut self, name: impl Into<String>) -> Self {
        self.thing_name = Some(name.into());
        self
    }
}

/// Minimal publish/subscribe interface
pub trait MessageBus: Send + Sync {
    /// Publish a message to every current subscriber of its subject
    fn publish(&self, message: BusMessage) -> Result<(), BusError>;

    /// Subscribe to a subject. Dropping the subscription unsubscribes.
    fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;
}

/// Receiving end of a subscription
pub struct Subscription {
    subject: String,
    rx: mpsc::Receiver<BusMessage>,
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Build a subscription from a receiver and an unsubscribe hook
    pub fn new(
        subject: impl Into<String>,
        rx: mpsc::Receiver<BusMessage>,
        unsubscribe: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            rx,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Subject this subscription listens on
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Wait for the next message; `None` once the bus closes or unsubscribes
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

#[derive(Default)]
struct BusInner {
    subs: HashMap<String, HashMap<u64, mpsc::Sender<BusMessage>>>,
    next_id: u64,
    closed: bool,
}

/// In-process fan-out bus
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<RwLock<BusInner>>,
}

impl InMemoryBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the bus; every subscription stream ends
    pub fn close(&self) {
        let mut inner = self.inner.write();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.subs.clear();
    }

    /// Number of live subscribers on a subject
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.inner
            .read()
            .subs
            .get(subject)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

impl MessageBus for InMemoryBus {
    fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(BusError::Closed);
        }

        if let Some(subs) = inner.subs.get(&message.subject) {
            for tx in subs.values() {
                if tx.try_send(message.clone()).is_err() {
                    tracing::debug!("Dropping message on {} for slow subscriber", message.subject);
                }
            }
        }

        Ok(())
    }

    fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(BusError::Closed);
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .subs
            .entry(subject.to_string())
            .or_default()
            .insert(id, tx);

        let weak: Weak<RwLock<BusInner>> = Arc::downgrade(&self.inner);
        let topic = subject.to_string();
        Ok(Subscription::new(subject, rx, move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.write();
                if let Some(subs) = inner.subs.get_mut(&topic) {
                    subs.remove(&id);
                    if subs.is_empty() {
                        inner.subs.remove(&topic);
                    }
                }
            }
        }))
    }
}

/// Bus subjects for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    /// Capability triggers
    pub commands: String,
    /// Capability stop signals
    pub stop: String,
    /// Tunnel assignments
    pub tunnels: String,
    /// Credential renewals
    pub credentials: String,
    /// Liveness pings
    pub ping: String,
}

impl Subjects {
    /// Derive the subjects addressed to `device_name`
    pub fn for_device(device_name: &str) -> Self {
        Self {
            commands: format!("devices.{}.commands.json", device_name),
            stop: format!("devices.{}.commands.stop", device_name),
            tunnels: format!("devices.{}.tunnels.notify", device_name),
            credentials: format!("devices.{}.certificates.notify", device_name),
            ping: "ping".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("topic").unwrap();
        let mut b = bus.subscribe("topic").unwrap();
        let mut other = bus.subscribe("other").unwrap();

        bus.publish(BusMessage::new("topic", "hello")).unwrap();

        assert_eq!(a.recv().await.unwrap().data, Bytes::from("hello"));
        assert_eq!(b.recv().await.unwrap().data, Bytes::from("hello"));
        assert!(other.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = InMemoryBus::new();
        let sub = bus.subscribe("topic").unwrap();
        assert_eq!(bus.subscriber_count("topic"), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count("topic"), 0);
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("topic").unwrap();
        bus.close();
        assert!(sub.recv().await.is_none());
        assert!(bus.publish(BusMessage::new("topic", "late")).is_err());
        assert!(bus.subscribe("topic").is_err());
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_instead_of_blocking() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("topic").unwrap();
        for i in 0..(SUBSCRIPTION_CAPACITY + 10) {
            bus.publish(BusMessage::new("topic", i.to_string())).unwrap();
        }
        let mut received = 0;
        while sub.rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIPTION_CAPACITY);
    }

    #[test]
    fn test_device_subjects() {
        let subjects = Subjects::for_device("rpi3");
        assert_eq!(subjects.commands, "devices.rpi3.commands.json");
        assert_eq!(subjects.stop, "devices.rpi3.commands.stop");
    }
}
