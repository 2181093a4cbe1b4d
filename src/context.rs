use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use kube::config::NamedContext;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::error::OperatorError;
use crate::model::{ConnectionStatus, ResourceKind, WatchScope};
use crate::operator::ResourceOperator;
use crate::watch::WatchMultiplexer;

#[derive(Debug, Clone, PartialEq)]
pub enum ModelChange {
    ContextSwitched { context: String, namespace: String },
    ContextClosed { context: String },
    ConnectionChanged(ConnectionStatus),
}

#[derive(Debug, Clone)]
pub struct ModelChangeObservable {
    tx: broadcast::Sender<ModelChange>,
}

impl Default for ModelChangeObservable {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }
}

impl ModelChangeObservable {
    pub fn publish(&self, change: ModelChange) {
        let _ = self.tx.send(change);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelChange> {
        self.tx.subscribe()
    }
}

#[async_trait]
pub trait ActiveContext: Send + Sync {
    fn name(&self) -> &str;

    fn current_namespace(&self) -> &str;

    fn watches(&self) -> &WatchMultiplexer;

    fn operators(&self) -> Vec<Arc<dyn ResourceOperator>>;

    async fn operator(
        &self,
        kind: &ResourceKind,
        scope: &WatchScope,
    ) -> Result<Arc<dyn ResourceOperator>, OperatorError>;

    async fn resolve_kind(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<ResourceKind, OperatorError>;

    fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.watches().status()
    }

    async fn close(&self) {
        self.watches().shutdown();
    }
}

pub type ActiveContextFactory = Arc<
    dyn Fn(ModelChangeObservable, Option<NamedContext>) -> BoxFuture<'static, Result<Arc<dyn ActiveContext>>>
        + Send
        + Sync,
>;

pub struct ContextManager {
    factory: ActiveContextFactory,
    changes: ModelChangeObservable,
    current: Option<Arc<dyn ActiveContext>>,
}

impl ContextManager {
    pub fn new(factory: ActiveContextFactory, changes: ModelChangeObservable) -> Self {
        Self {
            factory,
            changes,
            current: None,
        }
    }

    pub async fn activate(&mut self, named: Option<NamedContext>) -> Result<Arc<dyn ActiveContext>> {
        self.close().await;

        let context = (self.factory)(self.changes.clone(), named).await?;
        info!(
            "activated context {} (namespace {})",
            context.name(),
            context.current_namespace()
        );
        self.changes.publish(ModelChange::ContextSwitched {
            context: context.name().to_string(),
            namespace: context.current_namespace().to_string(),
        });
        self.current = Some(Arc::clone(&context));
        Ok(context)
    }

    pub async fn close(&mut self) {
        if let Some(previous) = self.current.take() {
            let operators = previous.operators().len();
            previous.close().await;
            info!("closed context {} ({} operators)", previous.name(), operators);
            self.changes.publish(ModelChange::ContextClosed {
                context: previous.name().to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ActiveContext, ActiveContextFactory, ContextManager, ModelChange, ModelChangeObservable};
    use crate::model::{ResourceKind, WatchScope};
    use crate::testing::{FakeContext, FakeOperator};
    use futures::FutureExt;
    use kube::config::NamedContext;
    use std::sync::{Arc, Mutex};

    fn factory(created: Arc<Mutex<Vec<Arc<FakeContext>>>>) -> ActiveContextFactory {
        Arc::new(move |changes: ModelChangeObservable, named: Option<NamedContext>| {
            let created = Arc::clone(&created);
            async move {
                let name = named.map(|named| named.name).unwrap_or_else(|| "default".to_string());
                let context = Arc::new(FakeContext::new(&name, "shop", changes));
                context.add_operator(Arc::new(FakeOperator::namespaced(
                    ResourceKind::deployment(),
                    "shop",
                )));
                created.lock().expect("not poisoned").push(Arc::clone(&context));
                Ok(context as Arc<dyn ActiveContext>)
            }
            .boxed()
        })
    }

    fn named(name: &str) -> NamedContext {
        NamedContext {
            name: name.to_string(),
            context: None,
        }
    }

    #[tokio::test]
    async fn switching_tears_down_previous_watches_first() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let changes = ModelChangeObservable::default();
        let mut events = changes.subscribe();
        let mut manager = ContextManager::new(factory(Arc::clone(&created)), changes);

        let first = manager.activate(Some(named("staging"))).await.expect("factory succeeds");
        let _consumer = first
            .watches()
            .subscribe(&ResourceKind::deployment(), &WatchScope::Namespace("shop".to_string()))
            .expect("operator registered");
        assert_eq!(first.watches().active_watches(), 1);

        let second = manager.activate(Some(named("prod"))).await.expect("factory succeeds");

        assert_eq!(first.watches().active_watches(), 0);
        assert_eq!(second.name(), "prod");
        let contexts = created.lock().expect("not poisoned").clone();
        assert!(contexts[0].is_closed());
        assert!(!contexts[1].is_closed());

        let mut seen = Vec::new();
        while let Ok(change) = events.try_recv() {
            seen.push(change);
        }
        let closed_at = seen
            .iter()
            .position(|change| matches!(change, ModelChange::ContextClosed { context } if context == "staging"));
        let switched_at = seen
            .iter()
            .position(|change| matches!(change, ModelChange::ContextSwitched { context, .. } if context == "prod"));
        assert!(closed_at.is_some() && switched_at.is_some() && closed_at < switched_at);
    }

    #[tokio::test]
    async fn default_context_uses_its_namespace() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let mut manager = ContextManager::new(factory(created), ModelChangeObservable::default());

        let context = manager.activate(None).await.expect("factory succeeds");

        assert_eq!(context.name(), "default");
        assert_eq!(context.current_namespace(), "shop");
        assert_eq!(context.operators().len(), 1);
    }
}
