//! Registry of authenticated connections
//!
//! Every connection that completes authentication is tracked here, together
//! with the terminal channel it opened (if any). The registry is what the
//! session server uses to warn users and then tear their connections down
//! during shutdown.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;

use tether_core::SessionKey;

/// Upper bound on delivering the shutdown notice to any one terminal
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// The parts of a live connection the registry needs to act on
#[async_trait]
pub trait SessionTransport: Send + Sync + 'static {
    /// Identifies an interactive channel on this connection
    type Channel: Clone + fmt::Debug + Send + Sync;

    /// Write a notice to the user's terminal
    async fn notify(&self, channel: &Self::Channel, text: &str) -> anyhow::Result<()>;

    /// Tear the connection down
    async fn close(&self);
}

/// A tracked connection
pub struct ActiveSession<T: SessionTransport> {
    /// Registry key
    pub key: SessionKey,
    /// Remote address, for logging only
    pub remote_addr: SocketAddr,
    /// Connection handle
    pub transport: T,
    /// First interactive channel accepted on the connection
    pub terminal: Option<T::Channel>,
}

/// Outcome of [`SessionRegistry::broadcast_and_close`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions the notice was delivered to
    pub notified: usize,
    /// Sessions whose notice could not be delivered
    pub failed: usize,
    /// Connections force-closed
    pub closed: usize,
}

/// Concurrent table of authenticated connections
pub struct SessionRegistry<T: SessionTransport> {
    sessions: Mutex<HashMap<SessionKey, ActiveSession<T>>>,
}

impl<T: SessionTransport> SessionRegistry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Track a newly authenticated connection
    pub async fn add(&self, key: SessionKey, remote_addr: SocketAddr, transport: T) {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            key,
            ActiveSession {
                key,
                remote_addr,
                transport,
                terminal: None,
            },
        );
        tracing::debug!("Registered {} from {} ({} active)", key, remote_addr, sessions.len());
    }

    /// Associate the connection's terminal channel.
    ///
    /// Only the first channel is kept; returns whether this call attached it.
    pub async fn attach_channel(&self, key: SessionKey, channel: T::Channel) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&key) {
            Some(session) if session.terminal.is_none() => {
                tracing::debug!("Attached channel {:?} to {}", channel, key);
                session.terminal = Some(channel);
                true
            }
            _ => false,
        }
    }

    /// Stop tracking a connection, returning its entry if it was present
    pub async fn remove(&self, key: SessionKey) -> Option<ActiveSession<T>> {
        self.sessions.lock().await.remove(&key)
    }

    /// Whether a connection is tracked
    pub async fn contains(&self, key: SessionKey) -> bool {
        self.sessions.lock().await.contains_key(&key)
    }

    /// Number of tracked connections
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Check if empty
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Warn every terminal, wait out the grace period, then close everything.
    ///
    /// The lock is held for the whole sequence so no connection can slip in
    /// or out between the notice and the forced close. Notices go out
    /// concurrently; one still pending after [`NOTIFY_TIMEOUT`] counts as
    /// failed. Sessions without a terminal channel are closed without a
    /// notice. The grace period is only observed when at least one session
    /// exists.
    pub async fn broadcast_and_close(&self, message: &str, grace_period: Duration) -> BroadcastReport {
        let mut sessions = self.sessions.lock().await;
        let mut report = BroadcastReport::default();

        let text = format!("\r\n\n{}\r\n", message);
        let notices = sessions.values().filter_map(|session| {
            let channel = session.terminal.as_ref()?;
            let text = text.as_str();
            Some(async move {
                let notice = session.transport.notify(channel, text);
                (session, tokio::time::timeout(NOTIFY_TIMEOUT, notice).await)
            })
        });
        for (session, outcome) in join_all(notices).await {
            match outcome {
                Ok(Ok(())) => report.notified += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::warn!("Failed to notify {} ({}): {}", session.key, session.remote_addr, e);
                }
                Err(_) => {
                    report.failed += 1;
                    tracing::warn!(
                        "Notifying {} ({}) timed out after {:?}",
                        session.key,
                        session.remote_addr,
                        NOTIFY_TIMEOUT
                    );
                }
            }
        }

        if !sessions.is_empty() && !grace_period.is_zero() {
            tracing::info!("Waiting for grace period: {:?}", grace_period);
            tokio::time::sleep(grace_period).await;
        }

        tracing::info!("Closing all active connections...");
        for (key, session) in sessions.drain() {
            tracing::debug!("Force-closing {} ({})", key, session.remote_addr);
            session.transport.close().await;
            report.closed += 1;
        }

        report
    }
}

impl<T: SessionTransport> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    /// Ordered log of everything that happened to recorded transports
    #[derive(Default)]
    pub(crate) struct EventLog(parking_lot::Mutex<Vec<String>>);

    impl EventLog {
        pub(crate) fn push(&self, event: String) {
            self.0.lock().push(event);
        }

        pub(crate) fn events(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    /// Transport that records notices and closes
    pub(crate) struct RecordingTransport {
        pub(crate) name: &'static str,
        pub(crate) log: Arc<EventLog>,
        pub(crate) fail_notify: bool,
    }

    #[async_trait]
    impl SessionTransport for RecordingTransport {
        type Channel = u32;

        async fn notify(&self, channel: &u32, text: &str) -> anyhow::Result<()> {
            if self.fail_notify {
                anyhow::bail!("channel {} gone", channel);
            }
            self.log.push(format!("notify {} {}", self.name, text.trim()));
            Ok(())
        }

        async fn close(&self) {
            self.log.push(format!("close {}", self.name));
        }
    }

    /// Transport whose notices never complete, like a peer that stopped reading
    struct StalledTransport {
        log: Arc<EventLog>,
    }

    #[async_trait]
    impl SessionTransport for StalledTransport {
        type Channel = u32;

        async fn notify(&self, _channel: &u32, _text: &str) -> anyhow::Result<()> {
            std::future::pending().await
        }

        async fn close(&self) {
            self.log.push("close stalled".to_string());
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn transport(name: &'static str, log: &Arc<EventLog>) -> RecordingTransport {
        RecordingTransport {
            name,
            log: Arc::clone(log),
            fail_notify: false,
        }
    }

    #[tokio::test]
    async fn test_add_attach_remove() {
        let log = Arc::new(EventLog::default());
        let registry = SessionRegistry::new();
        let key = SessionKey::next();

        registry.add(key, addr(5000), transport("a", &log)).await;
        assert!(registry.contains(key).await);

        assert!(registry.attach_channel(key, 1).await);
        assert!(!registry.attach_channel(key, 2).await, "second channel must not replace the first");
        assert!(!registry.attach_channel(SessionKey::next(), 3).await);

        let removed = registry.remove(key).await.unwrap();
        assert_eq!(removed.terminal, Some(1));
        assert!(registry.remove(key).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_same_address_does_not_collide() {
        let log = Arc::new(EventLog::default());
        let registry = SessionRegistry::new();

        registry.add(SessionKey::next(), addr(5000), transport("a", &log)).await;
        registry.add(SessionKey::next(), addr(5000), transport("b", &log)).await;

        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_precedes_close() {
        let log = Arc::new(EventLog::default());
        let registry = SessionRegistry::new();

        let a = SessionKey::next();
        let b = SessionKey::next();
        let c = SessionKey::next();
        registry.add(a, addr(5001), transport("a", &log)).await;
        registry.add(b, addr(5002), transport("b", &log)).await;
        registry.add(c, addr(5003), transport("c", &log)).await;
        registry.attach_channel(a, 0).await;
        registry.attach_channel(b, 0).await;

        let started = tokio::time::Instant::now();
        let report = registry
            .broadcast_and_close("!!! bye !!!", Duration::from_secs(3))
            .await;

        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(report, BroadcastReport { notified: 2, failed: 0, closed: 3 });
        assert!(registry.is_empty().await);

        let events = log.events();
        let last_notify = events.iter().rposition(|e| e.starts_with("notify")).unwrap();
        let first_close = events.iter().position(|e| e.starts_with("close")).unwrap();
        assert!(last_notify < first_close, "events out of order: {:?}", events);
        assert!(!events.contains(&"notify c !!! bye !!!".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_proceeds_when_notice_fails() {
        let log = Arc::new(EventLog::default());
        let registry = SessionRegistry::new();
        let key = SessionKey::next();
        registry
            .add(
                key,
                addr(5004),
                RecordingTransport {
                    name: "broken",
                    log: Arc::clone(&log),
                    fail_notify: true,
                },
            )
            .await;
        registry.attach_channel(key, 7).await;

        let report = registry.broadcast_and_close("bye", Duration::from_secs(1)).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.closed, 1);
        assert_eq!(log.events(), vec!["close broken".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_registry_skips_grace_period() {
        let registry: SessionRegistry<RecordingTransport> = SessionRegistry::new();
        let started = tokio::time::Instant::now();
        let report = registry.broadcast_and_close("bye", Duration::from_secs(30)).await;
        assert_eq!(report, BroadcastReport::default());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_terminal_does_not_block_close() {
        let log = Arc::new(EventLog::default());
        let registry = SessionRegistry::new();

        let stalled = SessionKey::next();
        registry
            .add(stalled, addr(5005), StalledTransport { log: Arc::clone(&log) })
            .await;
        registry.attach_channel(stalled, 0).await;

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            registry.broadcast_and_close("bye", Duration::from_millis(10)),
        )
        .await
        .expect("shutdown hung on a stalled terminal");

        assert_eq!(report, BroadcastReport { notified: 0, failed: 1, closed: 1 });
        assert!(registry.is_empty().await);
        assert_eq!(log.events(), vec!["close stalled".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_terminals_share_one_timeout() {
        let log = Arc::new(EventLog::default());
        let registry = SessionRegistry::new();
        for port in 5010..5014 {
            let key = SessionKey::next();
            registry
                .add(key, addr(port), StalledTransport { log: Arc::clone(&log) })
                .await;
            registry.attach_channel(key, 0).await;
        }

        let started = tokio::time::Instant::now();
        let report = registry.broadcast_and_close("bye", Duration::ZERO).await;

        assert!(started.elapsed() < NOTIFY_TIMEOUT * 2);
        assert_eq!(report.failed, 4);
        assert_eq!(report.closed, 4);
    }
}
