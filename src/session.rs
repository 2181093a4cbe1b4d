use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::context::ActiveContext;
use crate::error::OperatorError;
use crate::manifest::ManifestHeader;
use crate::model::{ConnectionStatus, ResourceIdentity, ResourceSnapshot, WatchScope};
use crate::notification::{NotificationController, NotificationSurface};
use crate::operator::{self, LogSink, ResourceOperator, Subscription};

pub struct EditSession {
    controller: Arc<NotificationController>,
    operator: Arc<dyn ResourceOperator>,
    task: JoinHandle<()>,
}

impl EditSession {
    pub async fn open(
        context: &dyn ActiveContext,
        body: Value,
        surface: Arc<dyn NotificationSurface>,
    ) -> Result<Self> {
        let header = ManifestHeader::from_body(&body)?;
        let kind = context
            .resolve_kind(&header.api_version, &header.kind)
            .await
            .with_context(|| format!("unknown resource kind {} {}", header.api_version, header.kind))?;
        let namespace = header
            .namespace
            .clone()
            .or_else(|| Some(context.current_namespace().to_string()));
        let identity = ResourceIdentity::new(kind.clone(), namespace, header.name.clone());
        let scope = WatchScope::for_identity(&identity);
        let operator = context.operator(&kind, &scope).await?;

        let baseline = match operator.get(&identity).await {
            Ok(remote) => Some(remote),
            Err(OperatorError::NotFound(_)) => {
                info!("{identity} does not exist on the cluster yet");
                None
            }
            Err(error) => {
                return Err(error).with_context(|| format!("failed to load {identity}"));
            }
        };
        let local = ResourceSnapshot::new(
            identity.clone(),
            baseline.as_ref().and_then(|remote| remote.version.clone()),
            body,
        );

        let controller = Arc::new(NotificationController::new(
            local,
            baseline,
            Arc::clone(&operator),
            surface,
        ));
        let mut consumer = context.watches().watch(&identity)?;
        let mut status = context.connection_status();
        let follower = Arc::clone(&controller);

        let task = tokio::spawn(async move {
            let initial = reachable(&status.borrow_and_update());
            follower.set_connected(initial).await;
            loop {
                tokio::select! {
                    maybe_event = consumer.recv() => {
                        let Some(event) = maybe_event else {
                            debug!("watch for {} closed", follower.identity());
                            break;
                        };
                        follower.on_watch_event(&event).await;
                    }
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let connected = reachable(&status.borrow_and_update());
                        follower.set_connected(connected).await;
                    }
                }
            }
        });
        info!("opened session for {identity}");

        Ok(Self {
            controller,
            operator,
            task,
        })
    }

    pub fn controller(&self) -> &Arc<NotificationController> {
        &self.controller
    }

    pub fn identity(&self) -> &ResourceIdentity {
        self.controller.identity()
    }

    pub async fn update_local(&self, body: Value) {
        let local = self.controller.local().await;
        self.controller.update_local(local.with_body(body)).await;
    }

    pub fn supports_logs(&self) -> bool {
        self.operator.as_log_watcher().is_some()
    }

    pub async fn watch_logs(&self, sink: LogSink) -> Result<Subscription, OperatorError> {
        operator::watch_log(self.operator.as_ref(), self.identity(), sink).await
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for EditSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn reachable(status: &ConnectionStatus) -> bool {
    !matches!(status, ConnectionStatus::Disconnected { .. })
}
