use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{AsyncBufReadExt, FutureExt, StreamExt, pin_mut};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, LogParams, PostParams, Preconditions, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig, NamedContext};
use kube::core::{DynamicObject, WatchEvent as KubeWatchEvent};
use kube::discovery::{self, Scope};
use kube::{Api, Client, Config};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::context::{ActiveContext, ActiveContextFactory, ModelChangeObservable};
use crate::error::OperatorError;
use crate::model::{
    ResourceIdentity, ResourceKind, ResourceSnapshot, ResourceVersion, WatchEvent, WatchScope,
};
use crate::operator::{
    DeleteOutcome, LogSink, LogWatcher, ResourceList, ResourceOperator, StreamItem, Subscription,
    WatchStream,
};
use crate::watch::{WatchMultiplexer, WatchSettings};

const LIST_PAGE_LIMIT: u32 = 500;
const LOG_TAIL_LINES: i64 = 500;

#[derive(Clone)]
pub struct KubeOperator {
    client: Client,
    kind: ResourceKind,
    namespace: Option<String>,
    api: Api<DynamicObject>,
    watch_timeout_secs: u32,
}

impl KubeOperator {
    /// `namespace` is ignored for cluster-scoped kinds; `None` for a namespaced
    /// kind addresses every namespace.
    pub fn new(
        client: Client,
        kind: ResourceKind,
        namespace: Option<String>,
        watch_timeout_secs: u32,
    ) -> Self {
        let api_resource = kind.api_resource();
        let namespace = namespace.filter(|_| kind.namespaced);
        let api = match &namespace {
            Some(namespace) => Api::namespaced_with(client.clone(), namespace, &api_resource),
            None => Api::all_with(client.clone(), &api_resource),
        };
        Self {
            client,
            kind,
            namespace,
            api,
            watch_timeout_secs,
        }
    }

    fn api_for(&self, identity: &ResourceIdentity) -> Api<DynamicObject> {
        match (&identity.namespace, self.kind.namespaced) {
            (Some(namespace), true) if self.namespace.as_deref() != Some(namespace.as_str()) => {
                Api::namespaced_with(self.client.clone(), namespace, &self.kind.api_resource())
            }
            _ => self.api.clone(),
        }
    }

    fn snapshot(&self, object: DynamicObject) -> Result<ResourceSnapshot, OperatorError> {
        object_snapshot(&self.kind, object)
    }
}

fn object_snapshot(kind: &ResourceKind, object: DynamicObject) -> Result<ResourceSnapshot, OperatorError> {
    let mut body = serde_json::to_value(&object)?;
    // list and watch items come without type metadata
    if let Some(fields) = body.as_object_mut() {
        fields
            .entry("apiVersion")
            .or_insert_with(|| Value::String(kind.api_version()));
        fields
            .entry("kind")
            .or_insert_with(|| Value::String(kind.kind.clone()));
    }
    ResourceSnapshot::from_object(kind.clone(), body)
        .ok_or_else(|| OperatorError::Malformed(format!("{kind} object without metadata.name")))
}

fn to_object(
    snapshot: &ResourceSnapshot,
    version: Option<&ResourceVersion>,
) -> Result<DynamicObject, OperatorError> {
    Ok(serde_json::from_value(snapshot.body_at_version(version))?)
}

fn stream_item(
    kind: &ResourceKind,
    event: KubeWatchEvent<DynamicObject>,
) -> Result<StreamItem, OperatorError> {
    match event {
        KubeWatchEvent::Added(object) => {
            Ok(StreamItem::Event(WatchEvent::added(object_snapshot(kind, object)?)))
        }
        KubeWatchEvent::Modified(object) => {
            Ok(StreamItem::Event(WatchEvent::modified(object_snapshot(kind, object)?)))
        }
        KubeWatchEvent::Deleted(object) => {
            Ok(StreamItem::Event(WatchEvent::deleted(object_snapshot(kind, object)?)))
        }
        KubeWatchEvent::Bookmark(bookmark) => Ok(StreamItem::Bookmark(ResourceVersion::new(
            bookmark.metadata.resource_version,
        ))),
        KubeWatchEvent::Error(status) if status.code == 410 => {
            Err(OperatorError::Gone(status.message.clone()))
        }
        KubeWatchEvent::Error(status) => Err(OperatorError::Stream {
            code: status.code,
            message: status.message.clone(),
        }),
    }
}

#[async_trait]
impl ResourceOperator for KubeOperator {
    fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    async fn get(&self, identity: &ResourceIdentity) -> Result<ResourceSnapshot, OperatorError> {
        let object = self
            .api_for(identity)
            .get(&identity.name)
            .await
            .map_err(|error| OperatorError::from_kube(error, identity, None))?;
        self.snapshot(object)
    }

    async fn list(&self) -> Result<ResourceList, OperatorError> {
        let mut items = Vec::new();
        let mut params = ListParams::default().limit(LIST_PAGE_LIMIT);
        loop {
            let page = self.api.list(&params).await?;
            let version = page.metadata.resource_version.clone();
            let next = page.metadata.continue_.clone().filter(|token| !token.is_empty());
            for object in page.items {
                items.push(self.snapshot(object)?);
            }
            match next {
                Some(token) => params = params.continue_token(&token),
                None => {
                    return Ok(ResourceList {
                        items,
                        version: version.map(ResourceVersion::new),
                    });
                }
            }
        }
    }

    async fn delete(
        &self,
        identity: &ResourceIdentity,
        expected: Option<&ResourceVersion>,
    ) -> Result<DeleteOutcome, OperatorError> {
        let params = DeleteParams {
            preconditions: expected.map(|version| Preconditions {
                resource_version: Some(version.as_str().to_string()),
                uid: None,
            }),
            ..DeleteParams::default()
        };
        match self.api_for(identity).delete(&identity.name, &params).await {
            Ok(_) => {
                info!("deleted {identity}");
                Ok(DeleteOutcome::Deleted)
            }
            Err(error) => match OperatorError::from_kube(error, identity, expected) {
                OperatorError::NotFound(_) => Ok(DeleteOutcome::NotFound),
                // failed preconditions come back as 409
                other => Err(other),
            },
        }
    }

    async fn create(&self, snapshot: &ResourceSnapshot) -> Result<ResourceSnapshot, OperatorError> {
        let object = to_object(snapshot, None)?;
        let created = self
            .api_for(&snapshot.identity)
            .create(&PostParams::default(), &object)
            .await
            .map_err(|error| OperatorError::from_kube(error, &snapshot.identity, None))?;
        self.snapshot(created)
    }

    async fn replace(
        &self,
        snapshot: &ResourceSnapshot,
        expected: &ResourceVersion,
    ) -> Result<ResourceSnapshot, OperatorError> {
        let object = to_object(snapshot, Some(expected))?;
        let replaced = self
            .api_for(&snapshot.identity)
            .replace(&snapshot.identity.name, &PostParams::default(), &object)
            .await
            .map_err(|error| OperatorError::from_kube(error, &snapshot.identity, Some(expected)))?;
        self.snapshot(replaced)
    }

    async fn watch_stream(
        &self,
        name: Option<&str>,
        resume_from: Option<&ResourceVersion>,
    ) -> Result<WatchStream, OperatorError> {
        let mut params = WatchParams::default().timeout(self.watch_timeout_secs);
        if let Some(name) = name {
            params = params.fields(&format!("metadata.name={name}"));
        }
        let version = resume_from.map_or("0", ResourceVersion::as_str);
        debug!("opening watch for {} in {} at {version}", self.kind, self.scope());

        let events = match self.api.watch(&params, version).await {
            Ok(events) => events,
            Err(kube::Error::Api(response)) if response.code == 410 => {
                return Err(OperatorError::Gone(version.to_string()));
            }
            Err(error) => return Err(error.into()),
        };
        let kind = self.kind.clone();
        Ok(events
            .map(move |item| match item {
                Ok(event) => stream_item(&kind, event),
                Err(error) => Err(OperatorError::Kube(error)),
            })
            .boxed())
    }

    fn as_log_watcher(&self) -> Option<&dyn LogWatcher> {
        if self.kind.is_workload() {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl LogWatcher for KubeOperator {
    async fn watch_log(
        &self,
        identity: &ResourceIdentity,
        mut sink: LogSink,
    ) -> Result<Subscription, OperatorError> {
        let namespace = identity
            .namespace
            .clone()
            .or_else(|| self.namespace.clone())
            .ok_or_else(|| OperatorError::Malformed(format!("{identity} has no namespace")))?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let params = LogParams {
            follow: true,
            tail_lines: Some(LOG_TAIL_LINES),
            ..LogParams::default()
        };
        let reader = pods
            .log_stream(&identity.name, &params)
            .await
            .map_err(|error| OperatorError::from_kube(error, identity, None))?;

        let target = identity.to_string();
        Ok(Subscription::new(tokio::spawn(async move {
            let lines = reader.lines();
            pin_mut!(lines);
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => {
                        if writeln!(sink, "{line}").is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!("log stream for {target} failed: {error}");
                        break;
                    }
                }
            }
            let _ = sink.flush();
            debug!("log stream for {target} ended");
        })))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub namespace: Option<String>,
    pub watch: WatchSettings,
    pub watch_timeout_secs: u32,
}

pub struct KubeActiveContext {
    client: Client,
    name: String,
    namespace: String,
    cluster_url: String,
    watch_timeout_secs: u32,
    watches: WatchMultiplexer,
    operators: Mutex<Vec<Arc<dyn ResourceOperator>>>,
    discovered: Mutex<HashMap<(String, String), ResourceKind>>,
}

impl KubeActiveContext {
    pub async fn connect(
        named: Option<NamedContext>,
        settings: ContextSettings,
        changes: ModelChangeObservable,
    ) -> Result<Self> {
        let kubeconfig = Kubeconfig::read().ok();
        let requested = named.map(|named| named.name);

        let config = if let Some(kubeconfig_value) = kubeconfig.clone() {
            let options = KubeConfigOptions {
                context: requested.clone(),
                cluster: None,
                user: None,
            };
            Config::from_custom_kubeconfig(kubeconfig_value, &options)
                .await
                .context("failed to infer Kubernetes configuration")?
        } else {
            if requested.is_some() {
                anyhow::bail!(
                    "kubeconfig not found; context switching is unavailable in this environment"
                );
            }
            Config::infer()
                .await
                .context("failed to infer Kubernetes configuration")?
        };

        let cluster_url = config.cluster_url.to_string();
        let namespace = settings
            .namespace
            .clone()
            .unwrap_or_else(|| config.default_namespace.clone());
        let client = Client::try_from(config).context("failed to initialize Kubernetes client")?;

        let name = requested
            .or_else(|| {
                kubeconfig
                    .as_ref()
                    .and_then(|cfg| cfg.current_context.clone())
            })
            .unwrap_or_else(|| "in-cluster".to_string());

        Ok(Self {
            client,
            name,
            namespace,
            cluster_url,
            watch_timeout_secs: settings.watch_timeout_secs,
            watches: WatchMultiplexer::new(settings.watch, changes),
            operators: Mutex::new(Vec::new()),
            discovered: Mutex::new(HashMap::new()),
        })
    }

    pub fn cluster_url(&self) -> &str {
        &self.cluster_url
    }
}

#[async_trait]
impl ActiveContext for KubeActiveContext {
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
        let mut operators = lock(&self.operators);
        if let Some(existing) = self.watches.operator(kind, scope) {
            return Ok(existing);
        }
        let operator: Arc<dyn ResourceOperator> = Arc::new(KubeOperator::new(
            self.client.clone(),
            kind.clone(),
            scope.namespace().map(str::to_string),
            self.watch_timeout_secs,
        ));
        self.watches.register(Arc::clone(&operator));
        operators.push(Arc::clone(&operator));
        debug!("created operator for {kind} in {scope}");
        Ok(operator)
    }

    async fn resolve_kind(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<ResourceKind, OperatorError> {
        if let Some(builtin) = ResourceKind::from_api_version(api_version, kind) {
            return Ok(builtin);
        }
        let cache_key = (api_version.to_string(), kind.to_string());
        if let Some(known) = lock(&self.discovered).get(&cache_key) {
            return Ok(known.clone());
        }

        let (group, version) = crate::model::split_api_version(api_version);
        let gvk = kube::core::GroupVersionKind::gvk(group, version, kind);
        let (api_resource, capabilities) = discovery::pinned_kind(&self.client, &gvk).await?;
        let resolved = ResourceKind::new(
            api_resource.group,
            api_resource.version,
            api_resource.kind,
            api_resource.plural,
            matches!(capabilities.scope, Scope::Namespaced),
        );
        info!("discovered {api_version} {kind} as {}", resolved.plural);
        lock(&self.discovered).insert(cache_key, resolved.clone());
        Ok(resolved)
    }
}

pub fn kube_context_factory(settings: ContextSettings) -> ActiveContextFactory {
    Arc::new(move |changes: ModelChangeObservable, named: Option<NamedContext>| {
        let settings = settings.clone();
        async move {
            let context = KubeActiveContext::connect(named, settings, changes).await?;
            info!("connected to {} via {}", context.cluster_url(), context.name());
            Ok(Arc::new(context) as Arc<dyn ActiveContext>)
        }
        .boxed()
    })
}

pub fn named_context(name: &str) -> Result<NamedContext> {
    let kubeconfig = Kubeconfig::read().context("failed to read kubeconfig")?;
    find_named_context(&kubeconfig, name)
}

fn find_named_context(kubeconfig: &Kubeconfig, name: &str) -> Result<NamedContext> {
    let normalized = name.trim();
    kubeconfig
        .contexts
        .iter()
        .find(|named| named.name == normalized)
        .or_else(|| {
            kubeconfig
                .contexts
                .iter()
                .find(|named| named.name.eq_ignore_ascii_case(normalized))
        })
        .cloned()
        .with_context(|| {
            let mut available = kubeconfig
                .contexts
                .iter()
                .map(|named| named.name.clone())
                .collect::<Vec<_>>();
            available.sort();
            format!(
                "context '{name}' was not found in kubeconfig (available: {})",
                available.join(", ")
            )
        })
}
