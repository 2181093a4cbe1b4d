use async_trait::async_trait;
use futures::stream::BoxStream;
use std::io::Write;
use tokio::task::JoinHandle;

use crate::error::OperatorError;
use crate::model::{
    ResourceIdentity, ResourceKind, ResourceSnapshot, ResourceVersion, WatchEvent, WatchScope,
};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(WatchEvent),
    Bookmark(ResourceVersion),
}

pub type WatchStream = BoxStream<'static, Result<StreamItem, OperatorError>>;

#[derive(Debug, Clone, Default)]
pub struct ResourceList {
    pub items: Vec<ResourceSnapshot>,
    pub version: Option<ResourceVersion>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

#[async_trait]
pub trait ResourceOperator: Send + Sync {
    fn kind(&self) -> &ResourceKind;

    fn namespace(&self) -> Option<&str>;

    fn scope(&self) -> WatchScope {
        match self.namespace() {
            Some(namespace) => WatchScope::Namespace(namespace.to_string()),
            None => WatchScope::Cluster,
        }
    }

    async fn get(&self, identity: &ResourceIdentity) -> Result<ResourceSnapshot, OperatorError>;

    async fn list(&self) -> Result<ResourceList, OperatorError>;

    /// Deletes the resource. With `expected`, the server rejects the call with
    /// [`OperatorError::Conflict`] if the resource moved past that version.
    async fn delete(
        &self,
        identity: &ResourceIdentity,
        expected: Option<&ResourceVersion>,
    ) -> Result<DeleteOutcome, OperatorError>;

    async fn create(&self, snapshot: &ResourceSnapshot) -> Result<ResourceSnapshot, OperatorError>;

    async fn replace(
        &self,
        snapshot: &ResourceSnapshot,
        expected: &ResourceVersion,
    ) -> Result<ResourceSnapshot, OperatorError>;

    /// Opens one server watch, for one object when `name` is set, otherwise for
    /// every member in scope. `resume_from` continues after a version already seen;
    /// an expired version yields [`OperatorError::Gone`].
    async fn watch_stream(
        &self,
        name: Option<&str>,
        resume_from: Option<&ResourceVersion>,
    ) -> Result<WatchStream, OperatorError>;

    fn as_log_watcher(&self) -> Option<&dyn LogWatcher> {
        None
    }
}

pub type LogSink = Box<dyn Write + Send>;

#[async_trait]
pub trait LogWatcher: Send + Sync {
    async fn watch_log(
        &self,
        identity: &ResourceIdentity,
        sink: LogSink,
    ) -> Result<Subscription, OperatorError>;
}

pub async fn watch_log(
    operator: &dyn ResourceOperator,
    identity: &ResourceIdentity,
    sink: LogSink,
) -> Result<Subscription, OperatorError> {
    match operator.as_log_watcher() {
        Some(watcher) => watcher.watch_log(identity, sink).await,
        None => Err(OperatorError::NotSupported {
            operation: "log watching",
            kind: operator.kind().to_string(),
        }),
    }
}

/// Handle to a background delivery task. Cancelling or dropping it stops delivery.
#[derive(Debug)]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub fn cancel(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DeleteOutcome, ResourceOperator, watch_log};
    use crate::error::OperatorError;
    use crate::model::{ResourceIdentity, ResourceKind, ResourceVersion, WatchScope};
    use crate::testing::{FakeOperator, SharedBuffer, deployment};

    #[test]
    fn scope_follows_the_bound_namespace() {
        let namespaced = FakeOperator::namespaced(ResourceKind::deployment(), "shop");
        assert_eq!(namespaced.scope(), WatchScope::Namespace("shop".to_string()));

        let node = ResourceKind::from_api_version("v1", "Node").expect("node is builtin");
        assert_eq!(FakeOperator::cluster_scoped(node).scope(), WatchScope::Cluster);
    }

    #[tokio::test]
    async fn deleting_a_missing_resource_reports_not_found() {
        let operator = FakeOperator::namespaced(ResourceKind::deployment(), "shop");
        let identity = deployment("web", "1", 3).identity;

        let outcome = operator.delete(&identity, Some(&ResourceVersion::new("1"))).await;
        assert!(matches!(outcome, Ok(DeleteOutcome::NotFound)));
    }

    #[tokio::test]
    async fn delete_with_stale_version_conflicts_and_keeps_the_resource() {
        let operator = FakeOperator::namespaced(ResourceKind::deployment(), "shop")
            .with_object(deployment("web", "1", 3));
        let moved = operator.put_remote(deployment("web", "", 4));

        let outcome = operator
            .delete(&moved.identity, Some(&ResourceVersion::new("1")))
            .await;

        assert!(matches!(
            outcome,
            Err(OperatorError::Conflict { ref expected, .. }) if expected == "1"
        ));
        assert_eq!(operator.current("web"), Some(moved));
    }

    #[tokio::test]
    async fn delete_at_current_version_removes_the_resource() {
        let operator = FakeOperator::namespaced(ResourceKind::deployment(), "shop")
            .with_object(deployment("web", "5", 3));
        let identity = deployment("web", "5", 3).identity;

        let outcome = operator.delete(&identity, Some(&ResourceVersion::new("5"))).await;
        assert!(matches!(outcome, Ok(DeleteOutcome::Deleted)));
        assert_eq!(operator.current("web"), None);

        let again = operator.delete(&identity, None).await;
        assert!(matches!(again, Ok(DeleteOutcome::NotFound)));
    }

    #[tokio::test]
    async fn log_watching_is_rejected_for_non_workload_kinds() {
        let operator = FakeOperator::namespaced(ResourceKind::deployment(), "default");
        let identity =
            ResourceIdentity::new(ResourceKind::deployment(), Some("default".to_string()), "web");

        let result = watch_log(&operator, &identity, Box::new(SharedBuffer::default())).await;
        assert!(matches!(result, Err(OperatorError::NotSupported { .. })));
    }

    #[tokio::test]
    async fn log_watching_streams_into_sink_for_pods() {
        let operator = FakeOperator::namespaced(ResourceKind::pod(), "default")
            .with_log_lines(vec!["starting".to_string(), "ready".to_string()]);
        let identity =
            ResourceIdentity::new(ResourceKind::pod(), Some("default".to_string()), "web-0");
        let buffer = SharedBuffer::default();

        let subscription = watch_log(&operator, &identity, Box::new(buffer.clone()))
            .await
            .expect("pods support logs");
        for _ in 0..50 {
            if subscription.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(buffer.contents(), "starting\nready\n");
    }
}
