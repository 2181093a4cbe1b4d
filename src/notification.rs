use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::divergence::{DivergenceVerdict, classify, without_server_metadata};
use crate::error::{ActionError, OperatorError};
use crate::model::{ResourceIdentity, ResourceSnapshot, WatchEvent, WatchEventKind};
use crate::operator::ResourceOperator;

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteState {
    Present(ResourceSnapshot),
    /// Tombstone: the resource was deleted; carries the last known snapshot.
    Deleted(ResourceSnapshot),
}

impl RemoteState {
    pub fn snapshot(&self) -> &ResourceSnapshot {
        match self {
            Self::Present(snapshot) | Self::Deleted(snapshot) => snapshot,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationState {
    Hidden,
    Shown { resource: RemoteState, can_push: bool },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationToken(u64);

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub token: NotificationToken,
    pub resource: RemoteState,
    pub can_push: bool,
}

impl Notification {
    pub fn message(&self) -> String {
        let identity = &self.resource.snapshot().identity;
        match self.resource {
            RemoteState::Present(_) => format!(
                "{} '{}' changed on cluster. Pull?",
                identity.kind, identity.name
            ),
            RemoteState::Deleted(_) => format!(
                "{} '{}' was deleted on cluster. Pull to recreate?",
                identity.kind, identity.name
            ),
        }
    }
}

pub trait NotificationSurface: Send + Sync {
    fn on_notify(&self, notification: &Notification);
    fn on_clear(&self);
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonView {
    pub local: ResourceSnapshot,
    pub remote: RemoteState,
}

struct ControllerState {
    local: ResourceSnapshot,
    baseline: Option<ResourceSnapshot>,
    state: NotificationState,
    token: u64,
    connected: bool,
}

impl ControllerState {
    fn notification(&self) -> Option<Notification> {
        match &self.state {
            NotificationState::Hidden => None,
            NotificationState::Shown { resource, can_push } => Some(Notification {
                token: NotificationToken(self.token),
                resource: resource.clone(),
                can_push: *can_push,
            }),
        }
    }
}

pub struct NotificationController {
    identity: ResourceIdentity,
    operator: Arc<dyn ResourceOperator>,
    surface: Arc<dyn NotificationSurface>,
    inner: Mutex<ControllerState>,
}

impl NotificationController {
    pub fn new(
        local: ResourceSnapshot,
        baseline: Option<ResourceSnapshot>,
        operator: Arc<dyn ResourceOperator>,
        surface: Arc<dyn NotificationSurface>,
    ) -> Self {
        Self {
            identity: local.identity.clone(),
            operator,
            surface,
            inner: Mutex::new(ControllerState {
                local,
                baseline,
                state: NotificationState::Hidden,
                token: 0,
                connected: true,
            }),
        }
    }

    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    pub async fn state(&self) -> NotificationState {
        self.inner.lock().await.state.clone()
    }

    pub async fn notification(&self) -> Option<Notification> {
        self.inner.lock().await.notification()
    }

    pub async fn local(&self) -> ResourceSnapshot {
        self.inner.lock().await.local.clone()
    }

    pub async fn baseline(&self) -> Option<ResourceSnapshot> {
        self.inner.lock().await.baseline.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.connected
    }

    pub async fn on_watch_event(&self, event: &WatchEvent) {
        if event.snapshot.identity != self.identity {
            return;
        }
        if event.kind == WatchEventKind::Deleted {
            self.on_delete_event(&event.snapshot).await;
            return;
        }

        let mut inner = self.inner.lock().await;
        self.reevaluate(&mut inner, event.snapshot.clone());
    }

    pub async fn on_delete_event(&self, snapshot: &ResourceSnapshot) {
        if snapshot.identity != self.identity {
            return;
        }
        let mut inner = self.inner.lock().await;
        self.show(&mut inner, RemoteState::Deleted(snapshot.clone()), false);
    }

    pub async fn update_local(&self, local: ResourceSnapshot) {
        self.inner.lock().await.local = local;
    }

    pub async fn set_connected(&self, connected: bool) {
        let mut inner = self.inner.lock().await;
        if inner.connected != connected {
            info!(
                "{} {}",
                self.identity,
                if connected { "reconnected" } else { "lost connection" }
            );
        }
        inner.connected = connected;
    }

    /// Adopts the cluster version shown under `token` as local content and baseline.
    /// For a deleted resource this recreates it on the cluster from the local copy.
    pub async fn pull(&self, token: NotificationToken) -> Result<ResourceSnapshot, ActionError> {
        let mut inner = self.inner.lock().await;
        if !inner.connected {
            return Err(ActionError::Disconnected(self.identity.clone()));
        }
        let NotificationState::Shown { resource, .. } = &inner.state else {
            return Err(ActionError::NotShown(self.identity.clone()));
        };
        if token.0 != inner.token {
            return Err(ActionError::StaleRemote(self.identity.clone()));
        }

        match resource.clone() {
            RemoteState::Present(remote) => {
                inner.local = remote.clone();
                inner.baseline = Some(remote.clone());
                self.hide(&mut inner);
                info!("pulled {} at {:?}", self.identity, remote.version);
                Ok(remote)
            }
            RemoteState::Deleted(_) => {
                let local = inner.local.clone();
                let shown = inner.token;
                drop(inner);

                let recreate = local.with_body(without_server_metadata(&local.body));
                let created = match self.operator.create(&recreate).await {
                    Ok(created) => created,
                    Err(OperatorError::Conflict { .. }) => {
                        warn!("{} already exists again, not recreating", self.identity);
                        let refreshed = self.operator.get(&self.identity).await;
                        let mut inner = self.inner.lock().await;
                        if inner.token == shown
                            && let Ok(remote) = refreshed
                        {
                            self.reevaluate(&mut inner, remote);
                        }
                        return Err(ActionError::StaleRemote(self.identity.clone()));
                    }
                    Err(error) => return Err(error.into()),
                };

                let mut inner = self.inner.lock().await;
                inner.local = created.clone();
                inner.baseline = Some(created.clone());
                if inner.token == shown {
                    self.hide(&mut inner);
                }
                info!("recreated {} at {:?}", self.identity, created.version);
                Ok(created)
            }
        }
    }

    pub async fn push(&self) -> Result<ResourceSnapshot, ActionError> {
        let (local, expected) = {
            let inner = self.inner.lock().await;
            if !inner.connected {
                return Err(ActionError::Disconnected(self.identity.clone()));
            }
            match &inner.state {
                NotificationState::Hidden => {
                    return Err(ActionError::NotShown(self.identity.clone()));
                }
                NotificationState::Shown {
                    resource: RemoteState::Deleted(_),
                    ..
                } => return Err(ActionError::ResourceDeleted(self.identity.clone())),
                NotificationState::Shown {
                    can_push: false, ..
                } => return Err(ActionError::PushNotAllowed(self.identity.clone())),
                NotificationState::Shown { .. } => {}
            }
            let Some(expected) = inner
                .baseline
                .as_ref()
                .and_then(|baseline| baseline.version.clone())
            else {
                return Err(ActionError::PushNotAllowed(self.identity.clone()));
            };
            (inner.local.clone(), expected)
        };

        match self.operator.replace(&local, &expected).await {
            Ok(updated) => {
                let mut inner = self.inner.lock().await;
                inner.local = updated.clone();
                inner.baseline = Some(updated.clone());
                self.hide(&mut inner);
                info!("pushed {} now at {:?}", self.identity, updated.version);
                Ok(updated)
            }
            Err(OperatorError::Conflict { .. }) => {
                warn!("push of {} rejected, expected version {expected}", self.identity);
                let refreshed = self.operator.get(&self.identity).await;
                let mut inner = self.inner.lock().await;
                match refreshed {
                    Ok(remote) => self.reevaluate(&mut inner, remote),
                    Err(OperatorError::NotFound(_)) => {
                        let last = inner.local.clone();
                        self.show(&mut inner, RemoteState::Deleted(last), false);
                    }
                    Err(error) => warn!("failed to refresh {}: {error}", self.identity),
                }
                Err(ActionError::Conflict {
                    identity: self.identity.clone(),
                    expected: expected.to_string(),
                })
            }
            Err(error) => Err(error.into()),
        }
    }

    pub async fn diff(&self) -> Result<ComparisonView, ActionError> {
        let inner = self.inner.lock().await;
        match &inner.state {
            NotificationState::Shown { resource, .. } => Ok(ComparisonView {
                local: inner.local.clone(),
                remote: resource.clone(),
            }),
            NotificationState::Hidden => Err(ActionError::NotShown(self.identity.clone())),
        }
    }

    /// Dismisses the notification; the baseline stays, so the next event re-evaluates.
    pub async fn ignore(&self) -> Result<(), ActionError> {
        let mut inner = self.inner.lock().await;
        if inner.state == NotificationState::Hidden {
            return Err(ActionError::NotShown(self.identity.clone()));
        }
        self.hide(&mut inner);
        Ok(())
    }

    fn reevaluate(&self, inner: &mut ControllerState, remote: ResourceSnapshot) {
        let verdict = classify(&inner.local, inner.baseline.as_ref(), &remote);
        debug!("{} classified as {}", self.identity, verdict.label());
        match verdict {
            DivergenceVerdict::Conflicting(remote) => {
                self.show(inner, RemoteState::Present(remote), true);
            }
            DivergenceVerdict::RemoteChanged(remote) => {
                self.show(inner, RemoteState::Present(remote), false);
            }
            // a local-only change means the remote is back at the baseline
            DivergenceVerdict::Unchanged | DivergenceVerdict::LocalChanged => self.hide(inner),
        }
    }

    fn show(&self, inner: &mut ControllerState, resource: RemoteState, can_push: bool) {
        inner.token += 1;
        inner.state = NotificationState::Shown { resource, can_push };
        if let Some(notification) = inner.notification() {
            self.surface.on_notify(&notification);
        }
    }

    fn hide(&self, inner: &mut ControllerState) {
        if inner.state != NotificationState::Hidden {
            inner.state = NotificationState::Hidden;
            self.surface.on_clear();
        }
    }
}
