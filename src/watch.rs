use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::{ModelChange, ModelChangeObservable};
use crate::error::OperatorError;
use crate::model::{
    ConnectionStatus, ResourceIdentity, ResourceKind, ResourceSnapshot, ResourceVersion,
    WatchEvent, WatchEventKind, WatchScope,
};
use crate::operator::{ResourceOperator, StreamItem};

pub type WatchKey = (ResourceKind, WatchScope);

#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub reconnect_delay: Duration,
    pub max_retries: u32,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(900),
            max_retries: 5,
        }
    }
}

struct ConsumerSlot {
    filter: Option<(Option<String>, String)>,
    tx: mpsc::UnboundedSender<WatchEvent>,
    closed: Arc<AtomicBool>,
}

impl ConsumerSlot {
    fn wants(&self, snapshot: &ResourceSnapshot) -> bool {
        match &self.filter {
            None => true,
            Some((namespace, name)) => {
                snapshot.identity.name == *name && snapshot.identity.namespace == *namespace
            }
        }
    }
}

/// Consumers of one shared watch plus the state they have been shown so far.
/// Both sit under one lock so a consumer attaching mid-stream neither misses
/// nor repeats an event.
#[derive(Default)]
struct Fanout {
    consumers: HashMap<u64, ConsumerSlot>,
    known: Option<HashMap<TrackedKey, ResourceSnapshot>>,
}

impl Fanout {
    fn deliver(&self, events: &[WatchEvent]) {
        for slot in self.consumers.values() {
            for event in events.iter().filter(|event| slot.wants(&event.snapshot)) {
                let _ = slot.tx.send(event.clone());
            }
        }
    }

    fn close_all(&mut self) {
        for (_, slot) in self.consumers.drain() {
            slot.closed.store(true, Ordering::Release);
        }
    }
}

type SharedFanout = Arc<Mutex<Fanout>>;

struct SharedWatch {
    fanout: SharedFanout,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    operators: HashMap<WatchKey, Arc<dyn ResourceOperator>>,
    watches: HashMap<WatchKey, SharedWatch>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub struct WatchMultiplexer {
    registry: Arc<Mutex<Registry>>,
    settings: WatchSettings,
    status: watch::Sender<ConnectionStatus>,
    changes: ModelChangeObservable,
    next_consumer: AtomicU64,
}

impl WatchMultiplexer {
    pub fn new(settings: WatchSettings, changes: ModelChangeObservable) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            settings,
            status,
            changes,
            next_consumer: AtomicU64::new(1),
        }
    }

    pub fn register(&self, operator: Arc<dyn ResourceOperator>) {
        let key = (operator.kind().clone(), operator.scope());
        lock(&self.registry).operators.insert(key, operator);
    }

    pub fn operator(&self, kind: &ResourceKind, scope: &WatchScope) -> Option<Arc<dyn ResourceOperator>> {
        lock(&self.registry)
            .operators
            .get(&(kind.clone(), scope.clone()))
            .cloned()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn subscribe(
        &self,
        kind: &ResourceKind,
        scope: &WatchScope,
    ) -> Result<WatchConsumer, OperatorError> {
        self.attach((kind.clone(), scope.clone()), None)
    }

    pub fn watch_all(
        &self,
        kind: &ResourceKind,
        scope: &WatchScope,
    ) -> Result<WatchConsumer, OperatorError> {
        self.subscribe(kind, scope)
    }

    pub fn watch(&self, identity: &ResourceIdentity) -> Result<WatchConsumer, OperatorError> {
        let key = (identity.kind.clone(), WatchScope::for_identity(identity));
        self.attach(
            key,
            Some((identity.namespace.clone(), identity.name.clone())),
        )
    }

    fn attach(
        &self,
        key: WatchKey,
        filter: Option<(Option<String>, String)>,
    ) -> Result<WatchConsumer, OperatorError> {
        let mut registry = lock(&self.registry);
        let fanout = match registry.watches.get(&key) {
            Some(shared) => Arc::clone(&shared.fanout),
            None => {
                let operator = registry.operators.get(&key).cloned().ok_or_else(|| {
                    OperatorError::NotSupported {
                        operation: "watch",
                        kind: format!("{} in {}", key.0, key.1),
                    }
                })?;
                let fanout: SharedFanout = Arc::new(Mutex::new(Fanout::default()));
                info!("starting watch for {} in {}", key.0, key.1);
                let task = tokio::spawn(run_watch(
                    operator,
                    Arc::clone(&fanout),
                    self.settings.clone(),
                    self.status.clone(),
                    self.changes.clone(),
                ));
                registry.watches.insert(
                    key.clone(),
                    SharedWatch {
                        fanout: Arc::clone(&fanout),
                        task,
                    },
                );
                fanout
            }
        };

        let id = self.next_consumer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let slot = ConsumerSlot {
            filter,
            tx,
            closed: Arc::clone(&closed),
        };
        let mut fanout = lock(&fanout);
        // late joiners start from the state the others already saw
        if let Some(known) = &fanout.known {
            for event in added_events(known)
                .into_iter()
                .filter(|event| slot.wants(&event.snapshot))
            {
                let _ = slot.tx.send(event);
            }
        }
        fanout.consumers.insert(id, slot);

        Ok(WatchConsumer {
            id,
            key,
            rx,
            closed,
            registry: Arc::clone(&self.registry),
        })
    }

    pub fn cancel(&self, kind: &ResourceKind, scope: &WatchScope) {
        let key = (kind.clone(), scope.clone());
        if let Some(shared) = lock(&self.registry).watches.remove(&key) {
            lock(&shared.fanout).close_all();
            shared.task.abort();
            info!("cancelled watch for {} in {}", key.0, key.1);
        }
    }

    pub fn active_watches(&self) -> usize {
        lock(&self.registry).watches.len()
    }

    pub fn shutdown(&self) {
        let mut registry = lock(&self.registry);
        for (key, shared) in registry.watches.drain() {
            lock(&shared.fanout).close_all();
            shared.task.abort();
            debug!("released watch for {} in {}", key.0, key.1);
        }
        registry.operators.clear();
    }
}

impl Drop for WatchMultiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn release(registry: &Mutex<Registry>, key: &WatchKey, id: u64) {
    let mut registry = lock(registry);
    let Some(shared) = registry.watches.get(key) else {
        return;
    };
    let empty = {
        let mut fanout = lock(&shared.fanout);
        fanout.consumers.remove(&id);
        fanout.consumers.is_empty()
    };
    if empty && let Some(shared) = registry.watches.remove(key) {
        shared.task.abort();
        info!("released watch for {} in {}", key.0, key.1);
    }
}

pub struct WatchConsumer {
    id: u64,
    key: WatchKey,
    rx: mpsc::UnboundedReceiver<WatchEvent>,
    closed: Arc<AtomicBool>,
    registry: Arc<Mutex<Registry>>,
}

impl WatchConsumer {
    pub fn key(&self) -> &WatchKey {
        &self.key
    }

    /// Next event, or `None` once the watch was cancelled. Events still
    /// buffered at cancellation are dropped.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        if self.is_closed() {
            return None;
        }
        let event = self.rx.recv().await?;
        (!self.is_closed()).then_some(event)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for WatchConsumer {
    fn drop(&mut self) {
        release(&self.registry, &self.key, self.id);
    }
}

impl Stream for WatchConsumer {
    type Item = WatchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.is_closed() {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(_)) if self.is_closed() => Poll::Ready(None),
            other => other,
        }
    }
}

type TrackedKey = (Option<String>, String);

fn tracked_key(snapshot: &ResourceSnapshot) -> TrackedKey {
    (
        snapshot.identity.namespace.clone(),
        snapshot.identity.name.clone(),
    )
}

fn index(items: Vec<ResourceSnapshot>) -> HashMap<TrackedKey, ResourceSnapshot> {
    items
        .into_iter()
        .map(|snapshot| (tracked_key(&snapshot), snapshot))
        .collect()
}

/// Records `event` in the tracked state. Returns `None` for an event that was
/// already applied, as happens when a resumed stream replays its last event.
fn apply_event(
    tracked: &mut HashMap<TrackedKey, ResourceSnapshot>,
    event: WatchEvent,
) -> Option<WatchEvent> {
    let key = tracked_key(&event.snapshot);
    match event.kind {
        WatchEventKind::Added | WatchEventKind::Modified => {
            if let Some(known) = tracked.get(&key)
                && known.version.is_some()
                && known.version == event.snapshot.version
            {
                return None;
            }
            tracked.insert(key, event.snapshot.clone());
            Some(event)
        }
        WatchEventKind::Deleted => tracked.remove(&key).map(|_| event),
    }
}

fn added_events(known: &HashMap<TrackedKey, ResourceSnapshot>) -> Vec<WatchEvent> {
    let mut events = known
        .values()
        .map(|snapshot| WatchEvent::added(snapshot.clone()))
        .collect::<Vec<_>>();
    events.sort_by(|left, right| {
        tracked_key(&left.snapshot).cmp(&tracked_key(&right.snapshot))
    });
    events
}

fn resync_events(
    previous: &HashMap<TrackedKey, ResourceSnapshot>,
    current: &HashMap<TrackedKey, ResourceSnapshot>,
) -> Vec<WatchEvent> {
    let mut events = current
        .iter()
        .filter(|(key, snapshot)| {
            previous
                .get(*key)
                .is_none_or(|known| known.version != snapshot.version)
        })
        .map(|(_, snapshot)| WatchEvent::modified(snapshot.clone()))
        .collect::<Vec<_>>();
    events.extend(
        previous
            .iter()
            .filter(|(key, _)| !current.contains_key(*key))
            .map(|(_, snapshot)| WatchEvent::deleted(snapshot.clone())),
    );
    events.sort_by(|left, right| {
        tracked_key(&left.snapshot).cmp(&tracked_key(&right.snapshot))
    });
    events
}

struct ConnectionTracker {
    status: watch::Sender<ConnectionStatus>,
    changes: ModelChangeObservable,
    failures: u32,
    max_retries: u32,
}

impl ConnectionTracker {
    fn set(&self, next: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if changed {
            self.changes.publish(ModelChange::ConnectionChanged(next));
        }
    }

    fn succeeded(&mut self) {
        self.failures = 0;
        self.set(ConnectionStatus::Connected);
    }

    fn failed(&mut self, error: &OperatorError) {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.max_retries {
            self.set(ConnectionStatus::Disconnected {
                reason: error.to_string(),
            });
        }
    }
}

async fn run_watch(
    operator: Arc<dyn ResourceOperator>,
    fanout: SharedFanout,
    settings: WatchSettings,
    status: watch::Sender<ConnectionStatus>,
    changes: ModelChangeObservable,
) {
    let kind = operator.kind().clone();
    let scope = operator.scope();
    let mut connection = ConnectionTracker {
        status,
        changes,
        failures: 0,
        max_retries: settings.max_retries.max(1),
    };
    let mut resume: Option<ResourceVersion> = None;
    let mut needs_list = true;

    loop {
        if needs_list {
            match operator.list().await {
                Ok(list) => {
                    let current = index(list.items);
                    let mut fanout = lock(&fanout);
                    let events = match &fanout.known {
                        Some(previous) => {
                            let events = resync_events(previous, &current);
                            info!(
                                "resynced {kind} in {scope}: {} synthetic events",
                                events.len()
                            );
                            events
                        }
                        None => added_events(&current),
                    };
                    fanout.known = Some(current);
                    fanout.deliver(&events);
                    drop(fanout);
                    resume = list.version;
                    needs_list = false;
                    connection.succeeded();
                }
                Err(error) => {
                    warn!("list failed for {kind} in {scope}: {error}");
                    connection.failed(&error);
                    tokio::time::sleep(settings.reconnect_delay).await;
                    continue;
                }
            }
        }

        match operator.watch_stream(None, resume.as_ref()).await {
            Ok(mut stream) => {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(StreamItem::Event(event)) => {
                            connection.succeeded();
                            if event.snapshot.version.is_some() {
                                resume = event.snapshot.version.clone();
                            }
                            let mut fanout = lock(&fanout);
                            let known = fanout.known.get_or_insert_with(HashMap::new);
                            if let Some(event) = apply_event(known, event) {
                                fanout.deliver(&[event]);
                            }
                        }
                        Ok(StreamItem::Bookmark(version)) => {
                            connection.succeeded();
                            resume = Some(version);
                        }
                        Err(OperatorError::Gone(version)) => {
                            info!("resume version {version} expired for {kind} in {scope}");
                            needs_list = true;
                            break;
                        }
                        Err(error) => {
                            warn!("watch stream error for {kind} in {scope}: {error}");
                            connection.failed(&error);
                            break;
                        }
                    }
                }
                debug!("watch stream ended for {kind} in {scope}");
            }
            Err(OperatorError::Gone(version)) => {
                info!("resume version {version} expired for {kind} in {scope}");
                needs_list = true;
                continue;
            }
            Err(error) => {
                warn!("failed to open watch for {kind} in {scope}: {error}");
                connection.failed(&error);
            }
        }

        if !needs_list {
            tokio::time::sleep(settings.reconnect_delay).await;
        }
    }
}
