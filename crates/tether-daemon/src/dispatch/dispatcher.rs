//! Command dispatcher
//!
//! Maps trigger messages to named capability instances. At most one
//! instance per [`CapabilityId`] exists at any time: the slot is claimed
//! atomically through the instance table's entry API, construction and
//! execution happen on a spawned task, and the slot is released only after
//! the handler's `stop` has returned and its tunnel route is gone.
//!
//! # Instance lifecycle
//!
//! 1. `add_command` claims the slot and spawns the instance task
//! 2. the factory builds the handler; a failure frees the slot
//! 3. a listening port becomes a loopback tunnel route
//! 4. `handle` runs until it finishes or the instance scope is cancelled
//! 5. `stop` runs, the route is removed, the slot is freed

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tether_core::error::{BusError, DispatchError, TunnelError};
use tether_core::message::{StopMessage, TriggerMessage};
use tether_core::types::START_SSH;
use tether_core::{BusMessage, CapabilityId, MessageBus, RouteSpec, Subjects, Subscription};

use super::capability::CapabilityFactory;
use crate::tunnel::TunnelManager;

/// A registered capability
pub struct CapabilityInstance {
    id: CapabilityId,
    payload: serde_json::Value,
    scope: CancellationToken,
    finished: CancellationToken,
    listen_port: Mutex<Option<u16>>,
}

impl CapabilityInstance {
    fn new(id: CapabilityId, payload: serde_json::Value) -> Self {
        Self {
            id,
            payload,
            scope: CancellationToken::new(),
            finished: CancellationToken::new(),
            listen_port: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &CapabilityId {
        &self.id
    }

    /// Trigger payload the instance was created from
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Port the handler listens on, once it has started
    pub fn listen_port(&self) -> Option<u16> {
        *self.listen_port.lock()
    }

    /// Whether the instance has been asked to stop
    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Wait until the instance has fully stopped and left the table
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }
}

impl std::fmt::Debug for CapabilityInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityInstance")
            .field("id", &self.id)
            .field("listen_port", &self.listen_port())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

struct DispatcherInner {
    instances: DashMap<CapabilityId, Arc<CapabilityInstance>>,
    factory: Arc<dyn CapabilityFactory>,
    tunnel: Arc<TunnelManager>,
    shutdown: CancellationToken,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatcherInner {
    /// Free the slot if it still belongs to `instance`
    fn release(&self, instance: &Arc<CapabilityInstance>) {
        self.instances
            .remove_if(&instance.id, |_, current| Arc::ptr_eq(current, instance));
    }

    fn refresh_tunnel(&self) {
        match self.tunnel.restart() {
            Ok(()) => {}
            Err(TunnelError::NotReady {
                server,
                routes,
                credentials,
            }) => {
                tracing::debug!(
                    "Tunnel not ready yet (server: {}, routes: {}, credentials: {})",
                    server,
                    routes,
                    credentials
                );
            }
            Err(e) => tracing::warn!("Failed to restart tunnel: {}", e),
        }
    }
}

/// Owns the capability instances of one daemon
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(factory: Arc<dyn CapabilityFactory>, tunnel: Arc<TunnelManager>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                instances: DashMap::new(),
                factory,
                tunnel,
                shutdown: CancellationToken::new(),
                consumers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start the capability `id` unless it is already registered.
    ///
    /// Returns `true` if a new instance was created. Construction happens in
    /// the background; this never waits on the handler.
    pub fn add_command(&self, id: CapabilityId, payload: serde_json::Value) -> bool {
        if self.inner.shutdown.is_cancelled() {
            tracing::warn!("Dispatcher is stopping; ignoring {}", id);
            return false;
        }

        let instance = match self.inner.instances.entry(id.clone()) {
            Entry::Occupied(_) => {
                tracing::info!("Command {} is already running", id);
                return false;
            }
            Entry::Vacant(slot) => {
                let instance = Arc::new(CapabilityInstance::new(id, payload));
                slot.insert(Arc::clone(&instance));
                instance
            }
        };

        tracing::info!("Starting command {}", instance.id);
        tokio::spawn(run_instance(Arc::clone(&self.inner), instance));
        true
    }

    /// Cancel the capability `id` and wait until it has stopped
    pub async fn remove_command(&self, id: &CapabilityId) -> Result<(), DispatchError> {
        let instance = self
            .get_command(id)
            .ok_or_else(|| DispatchError::NotFound(id.to_string()))?;

        tracing::info!("Stopping command {}", id);
        instance.scope.cancel();
        instance.finished().await;
        Ok(())
    }

    pub fn get_command(&self, id: &CapabilityId) -> Option<Arc<CapabilityInstance>> {
        self.inner.instances.get(id).map(|r| Arc::clone(&r))
    }

    /// Ids of every registered instance
    pub fn commands(&self) -> Vec<CapabilityId> {
        self.inner.instances.iter().map(|r| r.key().clone()).collect()
    }

    /// Subscribe to the trigger and stop subjects
    pub fn listen(&self, bus: &dyn MessageBus, subjects: &Subjects) -> Result<(), BusError> {
        let triggers = bus.subscribe(&subjects.commands)?;
        let stops = bus.subscribe(&subjects.stop)?;

        let mut consumers = self.inner.consumers.lock();
        consumers.push(self.spawn_consumer(triggers, Self::on_trigger));
        consumers.push(self.spawn_consumer(stops, Self::on_stop));
        tracing::info!(
            "Listening for commands on {} and {}",
            subjects.commands,
            subjects.stop
        );
        Ok(())
    }

    fn spawn_consumer(&self, mut subscription: Subscription, on_message: fn(&Self, BusMessage)) -> JoinHandle<()> {
        let dispatcher = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = subscription.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                on_message(&dispatcher, message);
            }
            tracing::debug!("Consumer for {} stopped", subscription.subject());
        })
    }

    fn on_trigger(&self, message: BusMessage) {
        let trigger: TriggerMessage = match serde_json::from_slice(&message.data) {
            Ok(trigger) => trigger,
            Err(e) => {
                tracing::warn!("Dropping malformed trigger on {}: {}", message.subject, e);
                return;
            }
        };
        if trigger.command.is_empty() {
            tracing::warn!("Dropping trigger without a command on {}", message.subject);
            return;
        }
        self.add_command(CapabilityId::new(trigger.command), trigger.payload);
    }

    fn on_stop(&self, message: BusMessage) {
        let id = serde_json::from_slice::<StopMessage>(&message.data)
            .ok()
            .map(|stop| stop.command)
            .filter(|command| !command.is_empty())
            .unwrap_or_else(|| START_SSH.to_string());
        let id = CapabilityId::new(id);

        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.remove_command(&id).await {
                tracing::info!("Stop signal ignored: {}", e);
            }
        });
    }

    /// Unsubscribe, then stop every instance and wait for all of them
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();

        let consumers = std::mem::take(&mut *self.inner.consumers.lock());
        for consumer in consumers {
            let _ = consumer.await;
        }

        let instances: Vec<_> = self
            .inner
            .instances
            .iter()
            .map(|r| Arc::clone(&r))
            .collect();
        for instance in &instances {
            instance.scope.cancel();
        }
        futures::future::join_all(instances.iter().map(|i| i.finished())).await;
        tracing::info!("Dispatcher stopped");
    }
}

async fn run_instance(inner: Arc<DispatcherInner>, instance: Arc<CapabilityInstance>) {
    let capability = match inner.factory.build(&instance.id, &instance.payload).await {
        Ok(capability) => capability,
        Err(e) => {
            tracing::error!("Failed to start command {}: {}", instance.id, e);
            inner.release(&instance);
            instance.finished.cancel();
            return;
        }
    };
    let handler = capability.handler;

    let route = capability.listen_port.map(RouteSpec::loopback);
    *instance.listen_port.lock() = capability.listen_port;

    if !instance.scope.is_cancelled() {
        if let Some(route) = &route {
            tracing::info!("Exposing {} through tunnel route {}", instance.id, route);
            if inner.tunnel.add_route(route.clone()) {
                inner.refresh_tunnel();
            }
        }

        if let Err(e) = handler.handle(instance.scope.clone()).await {
            tracing::error!("Command {} failed: {:#}", instance.id, e);
        }
    }

    if let Err(e) = handler.stop().await {
        tracing::error!("Failed to stop command {}: {:#}", instance.id, e);
    }

    if let Some(route) = &route {
        if inner.tunnel.remove_route(route) {
            inner.refresh_tunnel();
        }
    }

    inner.release(&instance);
    instance.finished.cancel();
    tracing::info!("Command {} stopped", instance.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tether_core::InMemoryBus;

    use crate::dispatch::capability::{Capability, CapabilityHandler};
    use crate::tunnel::manager::tests::{bundle, RecordingLauncher};

    #[derive(Default)]
    struct FakeHandler {
        stops: AtomicUsize,
    }

    #[async_trait]
    impl CapabilityHandler for FakeHandler {
        async fn handle(&self, scope: CancellationToken) -> anyhow::Result<()> {
            scope.cancelled().await;
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        builds: AtomicUsize,
        handlers: Mutex<Vec<Arc<FakeHandler>>>,
    }

    impl FakeFactory {
        fn builds(&self) -> usize {
            self.builds.load(Ordering::SeqCst)
        }

        fn total_stops(&self) -> usize {
            self.handlers
                .lock()
                .iter()
                .map(|h| h.stops.load(Ordering::SeqCst))
                .sum()
        }
    }

    #[async_trait]
    impl CapabilityFactory for FakeFactory {
        async fn build(&self, id: &CapabilityId, _payload: &serde_json::Value) -> Result<Capability, DispatchError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;

            let handler = Arc::new(FakeHandler::default());
            self.handlers.lock().push(Arc::clone(&handler));
            match id.as_str() {
                "listener" => Ok(Capability::listening(handler, 4022)),
                "agent" => Ok(Capability::background(handler)),
                other => Err(DispatchError::UnknownCapability(other.to_string())),
            }
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        factory: Arc<FakeFactory>,
        tunnel: Arc<TunnelManager>,
        launcher: Arc<RecordingLauncher>,
    }

    fn fixture() -> Fixture {
        let factory = Arc::new(FakeFactory::default());
        let launcher = Arc::new(RecordingLauncher::default());
        let tunnel = Arc::new(TunnelManager::new("rpi3", launcher.clone()));
        tunnel.set_server("hub.example:8443").unwrap();
        tunnel.set_credentials(bundle());
        Fixture {
            dispatcher: Dispatcher::new(factory.clone(), Arc::clone(&tunnel)),
            factory,
            tunnel,
            launcher,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_add_command_is_idempotent() {
        let f = fixture();
        let id = CapabilityId::new("agent");

        assert!(f.dispatcher.add_command(id.clone(), serde_json::Value::Null));
        assert!(!f.dispatcher.add_command(id.clone(), serde_json::Value::Null));
        eventually(|| f.factory.builds() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(f.factory.builds(), 1);
        assert_eq!(f.dispatcher.commands(), vec![id]);
    }

    #[tokio::test]
    async fn test_concurrent_adds_build_once() {
        let f = fixture();
        let id = CapabilityId::new("listener");

        let adds = (0..16).map(|_| {
            let dispatcher = f.dispatcher.clone();
            let id = id.clone();
            tokio::spawn(async move { dispatcher.add_command(id, serde_json::Value::Null) })
        });
        let created = futures::future::join_all(adds)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();

        assert_eq!(created, 1);
        eventually(|| f.dispatcher.get_command(&id).and_then(|i| i.listen_port()).is_some()).await;
        assert_eq!(f.factory.builds(), 1);
    }

    #[tokio::test]
    async fn test_listening_capability_registers_loopback_route() {
        let f = fixture();
        let id = CapabilityId::new("listener");

        f.dispatcher.add_command(id.clone(), serde_json::Value::Null);
        eventually(|| !f.tunnel.routes().is_empty()).await;

        assert_eq!(f.tunnel.routes(), vec![RouteSpec::loopback(4022)]);
        assert_eq!(f.tunnel.routes()[0].key(), "127.0.0.1:4022");
        eventually(|| f.launcher.launches() == 1).await;
        assert!(f.tunnel.is_running());
        assert!(f.dispatcher.get_command(&id).is_some());
    }

    #[tokio::test]
    async fn test_remove_command_stops_handler_and_route() {
        let f = fixture();
        let id = CapabilityId::new("listener");

        f.dispatcher.add_command(id.clone(), serde_json::Value::Null);
        eventually(|| !f.tunnel.routes().is_empty()).await;

        f.dispatcher.remove_command(&id).await.unwrap();

        assert!(f.dispatcher.get_command(&id).is_none());
        assert!(f.tunnel.routes().is_empty());
        assert_eq!(f.factory.total_stops(), 1);

        // the slot is free again
        assert!(f.dispatcher.add_command(id, serde_json::Value::Null));
    }

    #[tokio::test]
    async fn test_remove_unknown_command() {
        let f = fixture();
        let result = f.dispatcher.remove_command(&CapabilityId::new("agent")).await;
        assert!(matches!(result, Err(DispatchError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_construction_failure_frees_slot() {
        let f = fixture();
        let id = CapabilityId::new("reboot");

        assert!(f.dispatcher.add_command(id.clone(), serde_json::Value::Null));
        eventually(|| f.dispatcher.get_command(&id).is_none()).await;

        assert!(f.tunnel.routes().is_empty());
        assert!(f.dispatcher.add_command(id, serde_json::Value::Null));
        eventually(|| f.factory.builds() == 2).await;
    }

    #[tokio::test]
    async fn test_remove_during_construction() {
        let f = fixture();
        let id = CapabilityId::new("listener");

        f.dispatcher.add_command(id.clone(), serde_json::Value::Null);
        f.dispatcher.remove_command(&id).await.unwrap();

        assert!(f.dispatcher.get_command(&id).is_none());
        assert!(f.tunnel.routes().is_empty());
        assert_eq!(f.factory.total_stops(), 1);
    }

    #[tokio::test]
    async fn test_malformed_trigger_is_dropped() {
        let f = fixture();
        let bus = InMemoryBus::new();
        let subjects = Subjects::for_device("rpi3");
        f.dispatcher.listen(&bus, &subjects).unwrap();

        bus.publish(BusMessage::new(subjects.commands.clone(), "not json"))
            .unwrap();
        bus.publish(BusMessage::new(subjects.commands.clone(), r#"{"payload":{}}"#))
            .unwrap();
        bus.publish(BusMessage::new(subjects.commands.clone(), r#"{"command":""}"#))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(f.dispatcher.commands().is_empty());
        assert_eq!(f.factory.builds(), 0);
    }

    #[tokio::test]
    async fn test_trigger_and_stop_over_bus() {
        let f = fixture();
        let bus = InMemoryBus::new();
        let subjects = Subjects::for_device("rpi3");
        f.dispatcher.listen(&bus, &subjects).unwrap();

        bus.publish(BusMessage::new(
            subjects.commands.clone(),
            r#"{"command":"agent","payload":{"x":1}}"#,
        ))
        .unwrap();
        let id = CapabilityId::new("agent");
        eventually(|| f.dispatcher.get_command(&id).is_some()).await;
        assert_eq!(
            f.dispatcher.get_command(&id).unwrap().payload(),
            &serde_json::json!({ "x": 1 })
        );

        bus.publish(BusMessage::new(subjects.stop.clone(), r#"{"command":"agent"}"#))
            .unwrap();
        eventually(|| f.dispatcher.get_command(&id).is_none()).await;
        assert_eq!(f.factory.total_stops(), 1);
    }

    #[tokio::test]
    async fn test_bare_stop_targets_session_capability() {
        let f = fixture();
        let bus = InMemoryBus::new();
        let subjects = Subjects::for_device("rpi3");
        f.dispatcher.listen(&bus, &subjects).unwrap();

        f.dispatcher
            .add_command(CapabilityId::new("agent"), serde_json::Value::Null);
        eventually(|| f.factory.builds() == 1).await;

        bus.publish(BusMessage::new(subjects.stop.clone(), ""))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(f.dispatcher.get_command(&CapabilityId::new("agent")).is_some());
    }

    #[tokio::test]
    async fn test_stop_unsubscribes_and_removes_everything() {
        let f = fixture();
        let bus = InMemoryBus::new();
        let subjects = Subjects::for_device("rpi3");
        f.dispatcher.listen(&bus, &subjects).unwrap();
        assert_eq!(bus.subscriber_count(&subjects.commands), 1);

        f.dispatcher
            .add_command(CapabilityId::new("agent"), serde_json::Value::Null);
        f.dispatcher
            .add_command(CapabilityId::new("listener"), serde_json::Value::Null);
        eventually(|| f.factory.builds() == 2).await;

        f.dispatcher.stop().await;

        assert_eq!(bus.subscriber_count(&subjects.commands), 0);
        assert_eq!(bus.subscriber_count(&subjects.stop), 0);
        assert!(f.dispatcher.commands().is_empty());
        assert!(f.tunnel.routes().is_empty());
        assert_eq!(f.factory.total_stops(), 2);
        assert!(!f
            .dispatcher
            .add_command(CapabilityId::new("agent"), serde_json::Value::Null));
    }
}
