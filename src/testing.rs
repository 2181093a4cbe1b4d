use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};

use crate::context::{ActiveContext, ModelChangeObservable};
use crate::error::OperatorError;
use crate::model::{
    ResourceIdentity, ResourceKind, ResourceSnapshot, ResourceVersion, WatchScope,
};
use crate::notification::{Notification, NotificationSurface};
use crate::operator::{
    DeleteOutcome, LogSink, LogWatcher, ResourceList, ResourceOperator, StreamItem, Subscription,
    WatchStream,
};
use crate::watch::{WatchMultiplexer, WatchSettings};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Deployment in namespace `shop`; an empty `version` means "never synced".
pub fn deployment(name: &str, version: &str, replicas: i64) -> ResourceSnapshot {
    let mut metadata = json!({"name": name, "namespace": "shop"});
    if !version.is_empty() {
        metadata["resourceVersion"] = json!(version);
    }
    let body = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": metadata,
        "spec": {"replicas": replicas}
    });
    ResourceSnapshot::new(
        ResourceIdentity::new(ResourceKind::deployment(), Some("shop".to_string()), name),
        (!version.is_empty()).then(|| ResourceVersion::new(version)),
        body,
    )
}

type ScriptedItem = Result<StreamItem, OperatorError>;

enum ScriptedWatch {
    Items(Vec<ScriptedItem>),
    Live(mpsc::UnboundedReceiver<ScriptedItem>),
    Fail(OperatorError),
}

#[derive(Default)]
struct FakeState {
    objects: BTreeMap<String, ResourceSnapshot>,
    revision: u64,
    lists: VecDeque<ResourceList>,
    watches: VecDeque<ScriptedWatch>,
    resumes: Vec<Option<String>>,
    create_gate: Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>,
}

impl FakeState {
    fn bump(&mut self) -> ResourceVersion {
        self.revision += 1;
        ResourceVersion::new(self.revision.to_string())
    }

    fn observe(&mut self, version: Option<&ResourceVersion>) {
        if let Some(number) = version.and_then(|version| version.as_str().parse::<u64>().ok()) {
            self.revision = self.revision.max(number);
        }
    }

    fn store(&mut self, snapshot: &ResourceSnapshot) -> ResourceSnapshot {
        let version = self.bump();
        let stored = ResourceSnapshot::new(
            snapshot.identity.clone(),
            Some(version.clone()),
            snapshot.body_at_version(Some(&version)),
        );
        self.objects
            .insert(snapshot.identity.name.clone(), stored.clone());
        stored
    }
}

pub struct FakeOperator {
    kind: ResourceKind,
    namespace: Option<String>,
    state: Mutex<FakeState>,
    log_lines: Option<Vec<String>>,
}

impl FakeOperator {
    pub fn namespaced(kind: ResourceKind, namespace: &str) -> Self {
        Self {
            kind,
            namespace: Some(namespace.to_string()),
            state: Mutex::new(FakeState::default()),
            log_lines: None,
        }
    }

    pub fn cluster_scoped(kind: ResourceKind) -> Self {
        Self {
            kind,
            namespace: None,
            state: Mutex::new(FakeState::default()),
            log_lines: None,
        }
    }

    pub fn with_object(self, snapshot: ResourceSnapshot) -> Self {
        {
            let mut state = lock(&self.state);
            state.observe(snapshot.version.as_ref());
            state
                .objects
                .insert(snapshot.identity.name.clone(), snapshot);
        }
        self
    }

    pub fn with_log_lines(mut self, lines: Vec<String>) -> Self {
        self.log_lines = Some(lines);
        self
    }

    pub fn put_remote(&self, snapshot: ResourceSnapshot) -> ResourceSnapshot {
        lock(&self.state).store(&snapshot)
    }

    pub fn remove(&self, name: &str) -> Option<ResourceSnapshot> {
        lock(&self.state).objects.remove(name)
    }

    pub fn current(&self, name: &str) -> Option<ResourceSnapshot> {
        lock(&self.state).objects.get(name).cloned()
    }

    pub fn script_list(&self, list: ResourceList) {
        lock(&self.state).lists.push_back(list);
    }

    pub fn script_watch(&self, items: Vec<ScriptedItem>) {
        lock(&self.state)
            .watches
            .push_back(ScriptedWatch::Items(items));
    }

    pub fn fail_next_watch(&self, error: OperatorError) {
        lock(&self.state)
            .watches
            .push_back(ScriptedWatch::Fail(error));
    }

    /// Next watch call stays open and delivers whatever is sent on the returned feed.
    pub fn live_watch(&self) -> mpsc::UnboundedSender<ScriptedItem> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state).watches.push_back(ScriptedWatch::Live(rx));
        tx
    }

    /// Parks the next `create` until the returned sender fires; the receiver
    /// resolves once the call is parked.
    pub fn hold_next_create(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        lock(&self.state).create_gate = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }

    pub fn watch_calls(&self) -> usize {
        lock(&self.state).resumes.len()
    }

    pub fn resume_versions(&self) -> Vec<Option<String>> {
        lock(&self.state).resumes.clone()
    }
}

#[async_trait]
impl ResourceOperator for FakeOperator {
    fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    async fn get(&self, identity: &ResourceIdentity) -> Result<ResourceSnapshot, OperatorError> {
        self.current(&identity.name)
            .ok_or_else(|| OperatorError::NotFound(identity.clone()))
    }

    async fn list(&self) -> Result<ResourceList, OperatorError> {
        let mut state = lock(&self.state);
        if let Some(list) = state.lists.pop_front() {
            return Ok(list);
        }
        Ok(ResourceList {
            items: state.objects.values().cloned().collect(),
            version: Some(ResourceVersion::new(state.revision.to_string())),
        })
    }

    async fn delete(
        &self,
        identity: &ResourceIdentity,
        expected: Option<&ResourceVersion>,
    ) -> Result<DeleteOutcome, OperatorError> {
        let mut state = lock(&self.state);
        let Some(current) = state.objects.get(&identity.name) else {
            return Ok(DeleteOutcome::NotFound);
        };
        if let Some(expected) = expected
            && current.version.as_ref() != Some(expected)
        {
            return Err(OperatorError::Conflict {
                identity: identity.clone(),
                expected: expected.to_string(),
            });
        }
        state.objects.remove(&identity.name);
        Ok(DeleteOutcome::Deleted)
    }

    async fn create(&self, snapshot: &ResourceSnapshot) -> Result<ResourceSnapshot, OperatorError> {
        let gate = lock(&self.state).create_gate.take();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.await;
        }
        let mut state = lock(&self.state);
        if state.objects.contains_key(&snapshot.identity.name) {
            return Err(OperatorError::Conflict {
                identity: snapshot.identity.clone(),
                expected: String::new(),
            });
        }
        Ok(state.store(snapshot))
    }

    async fn replace(
        &self,
        snapshot: &ResourceSnapshot,
        expected: &ResourceVersion,
    ) -> Result<ResourceSnapshot, OperatorError> {
        let mut state = lock(&self.state);
        let Some(current) = state.objects.get(&snapshot.identity.name) else {
            return Err(OperatorError::NotFound(snapshot.identity.clone()));
        };
        if current.version.as_ref() != Some(expected) {
            return Err(OperatorError::Conflict {
                identity: snapshot.identity.clone(),
                expected: expected.to_string(),
            });
        }
        Ok(state.store(snapshot))
    }

    async fn watch_stream(
        &self,
        _name: Option<&str>,
        resume_from: Option<&ResourceVersion>,
    ) -> Result<WatchStream, OperatorError> {
        let mut state = lock(&self.state);
        state
            .resumes
            .push(resume_from.map(|version| version.as_str().to_string()));
        match state.watches.pop_front() {
            Some(ScriptedWatch::Items(items)) => Ok(futures::stream::iter(items).boxed()),
            Some(ScriptedWatch::Live(rx)) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
            Some(ScriptedWatch::Fail(error)) => Err(error),
            None => Ok(futures::stream::pending().boxed()),
        }
    }

    fn as_log_watcher(&self) -> Option<&dyn LogWatcher> {
        if self.kind.is_workload() && self.log_lines.is_some() {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl LogWatcher for FakeOperator {
    async fn watch_log(
        &self,
        _identity: &ResourceIdentity,
        mut sink: LogSink,
    ) -> Result<Subscription, OperatorError> {
        let lines = self.log_lines.clone().unwrap_or_default();
        Ok(Subscription::new(tokio::spawn(async move {
            for line in lines {
                if writeln!(sink, "{line}").is_err() {
                    break;
                }
            }
        })))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceCall {
    Notify(Notification),
    Clear,
}

#[derive(Default)]
pub struct RecordingSurface {
    calls: Mutex<Vec<SurfaceCall>>,
}

impl RecordingSurface {
    pub fn calls(&self) -> Vec<SurfaceCall> {
        lock(&self.calls).clone()
    }

    pub fn last_notification(&self) -> Option<Notification> {
        lock(&self.calls).iter().rev().find_map(|call| match call {
            SurfaceCall::Notify(notification) => Some(notification.clone()),
            SurfaceCall::Clear => None,
        })
    }

    pub fn notify_count(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| matches!(call, SurfaceCall::Notify(_)))
            .count()
    }
}

impl NotificationSurface for RecordingSurface {
    fn on_notify(&self, notification: &Notification) {
        lock(&self.calls).push(SurfaceCall::Notify(notification.clone()));
    }

    fn on_clear(&self) {
        lock(&self.calls).push(SurfaceCall::Clear);
    }
}

#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.0)).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct FakeContext {
    name: String,
    namespace: String,
    watches: WatchMultiplexer,
    operators: Mutex<Vec<Arc<dyn ResourceOperator>>>,
    closed: AtomicBool,
}

impl FakeContext {
    pub fn new(name: &str, namespace: &str, changes: ModelChangeObservable) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            watches: WatchMultiplexer::new(
                WatchSettings {
                    reconnect_delay: std::time::Duration::from_millis(1),
                    max_retries: 3,
                },
                changes,
            ),
            operators: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn add_operator(&self, operator: Arc<dyn ResourceOperator>) {
        self.watches.register(Arc::clone(&operator));
        lock(&self.operators).push(operator);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActiveContext for FakeContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn current_namespace(&self) -> &str {
        &self.namespace
    }

    fn watches(&self) -> &WatchMultiplexer {
        &self.watches
    }

    fn operators(&self) -> Vec<Arc<dyn ResourceOperator>> {
        lock(&self.operators).clone()
    }

    async fn operator(
        &self,
        kind: &ResourceKind,
        scope: &WatchScope,
    ) -> Result<Arc<dyn ResourceOperator>, OperatorError> {
        self.watches
            .operator(kind, scope)
            .ok_or_else(|| OperatorError::NotSupported {
                operation: "operator lookup",
                kind: kind.to_string(),
            })
    }

    async fn resolve_kind(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<ResourceKind, OperatorError> {
        ResourceKind::from_api_version(api_version, kind).ok_or_else(|| {
            OperatorError::NotSupported {
                operation: "kind discovery",
                kind: kind.to_string(),
            }
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.watches.shutdown();
    }
}
