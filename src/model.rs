use kube::core::{ApiResource, GroupVersionKind};
use serde_json::Value;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

/// Two kinds are equal when group, version and kind match; `plural` and
/// `namespaced` are derived facts used to build requests.
#[derive(Debug, Clone)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl PartialEq for ResourceKind {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group && self.version == other.version && self.kind == other.kind
    }
}

impl Eq for ResourceKind {}

impl Hash for ResourceKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.group.hash(state);
        self.version.hash(state);
        self.kind.hash(state);
    }
}

struct BuiltinKind {
    group: &'static str,
    version: &'static str,
    kind: &'static str,
    plural: &'static str,
    namespaced: bool,
}

const BUILTIN_KINDS: &[BuiltinKind] = &[
    BuiltinKind {
        group: "",
        version: "v1",
        kind: "Pod",
        plural: "pods",
        namespaced: true,
    },
    BuiltinKind {
        group: "batch",
        version: "v1",
        kind: "CronJob",
        plural: "cronjobs",
        namespaced: true,
    },
    BuiltinKind {
        group: "apps",
        version: "v1",
        kind: "DaemonSet",
        plural: "daemonsets",
        namespaced: true,
    },
    BuiltinKind {
        group: "apps",
        version: "v1",
        kind: "Deployment",
        plural: "deployments",
        namespaced: true,
    },
    BuiltinKind {
        group: "apps",
        version: "v1",
        kind: "ReplicaSet",
        plural: "replicasets",
        namespaced: true,
    },
    BuiltinKind {
        group: "apps",
        version: "v1",
        kind: "StatefulSet",
        plural: "statefulsets",
        namespaced: true,
    },
    BuiltinKind {
        group: "batch",
        version: "v1",
        kind: "Job",
        plural: "jobs",
        namespaced: true,
    },
    BuiltinKind {
        group: "",
        version: "v1",
        kind: "Service",
        plural: "services",
        namespaced: true,
    },
    BuiltinKind {
        group: "networking.k8s.io",
        version: "v1",
        kind: "Ingress",
        plural: "ingresses",
        namespaced: true,
    },
    BuiltinKind {
        group: "",
        version: "v1",
        kind: "ConfigMap",
        plural: "configmaps",
        namespaced: true,
    },
    BuiltinKind {
        group: "",
        version: "v1",
        kind: "Secret",
        plural: "secrets",
        namespaced: true,
    },
    BuiltinKind {
        group: "",
        version: "v1",
        kind: "PersistentVolumeClaim",
        plural: "persistentvolumeclaims",
        namespaced: true,
    },
    BuiltinKind {
        group: "",
        version: "v1",
        kind: "ServiceAccount",
        plural: "serviceaccounts",
        namespaced: true,
    },
    BuiltinKind {
        group: "rbac.authorization.k8s.io",
        version: "v1",
        kind: "Role",
        plural: "roles",
        namespaced: true,
    },
    BuiltinKind {
        group: "rbac.authorization.k8s.io",
        version: "v1",
        kind: "RoleBinding",
        plural: "rolebindings",
        namespaced: true,
    },
    BuiltinKind {
        group: "rbac.authorization.k8s.io",
        version: "v1",
        kind: "ClusterRole",
        plural: "clusterroles",
        namespaced: false,
    },
    BuiltinKind {
        group: "rbac.authorization.k8s.io",
        version: "v1",
        kind: "ClusterRoleBinding",
        plural: "clusterrolebindings",
        namespaced: false,
    },
    BuiltinKind {
        group: "networking.k8s.io",
        version: "v1",
        kind: "NetworkPolicy",
        plural: "networkpolicies",
        namespaced: true,
    },
    BuiltinKind {
        group: "storage.k8s.io",
        version: "v1",
        kind: "StorageClass",
        plural: "storageclasses",
        namespaced: false,
    },
    BuiltinKind {
        group: "",
        version: "v1",
        kind: "PersistentVolume",
        plural: "persistentvolumes",
        namespaced: false,
    },
    BuiltinKind {
        group: "",
        version: "v1",
        kind: "Node",
        plural: "nodes",
        namespaced: false,
    },
    BuiltinKind {
        group: "",
        version: "v1",
        kind: "Namespace",
        plural: "namespaces",
        namespaced: false,
    },
];

impl ResourceKind {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        plural: impl Into<String>,
        namespaced: bool,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            plural: plural.into(),
            namespaced,
        }
    }

    fn from_builtin(builtin: &BuiltinKind) -> Self {
        Self::new(
            builtin.group,
            builtin.version,
            builtin.kind,
            builtin.plural,
            builtin.namespaced,
        )
    }

    pub fn pod() -> Self {
        Self::new("", "v1", "Pod", "pods", true)
    }

    pub fn deployment() -> Self {
        Self::new("apps", "v1", "Deployment", "deployments", true)
    }

    pub fn from_api_version(api_version: &str, kind: &str) -> Option<Self> {
        let (group, version) = split_api_version(api_version);
        BUILTIN_KINDS
            .iter()
            .find(|builtin| {
                builtin.group == group && builtin.version == version && builtin.kind == kind
            })
            .map(Self::from_builtin)
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(&self.gvk(), &self.plural)
    }

    pub fn is_workload(&self) -> bool {
        self.group.is_empty() && self.kind == "Pod"
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)
    }
}

pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum WatchScope {
    Cluster,
    Namespace(String),
}

impl WatchScope {
    pub fn for_identity(identity: &ResourceIdentity) -> Self {
        match &identity.namespace {
            Some(namespace) if identity.kind.namespaced => Self::Namespace(namespace.clone()),
            _ => Self::Cluster,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::Cluster => None,
            Self::Namespace(namespace) => Some(namespace),
        }
    }
}

impl Display for WatchScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cluster => write!(f, "cluster"),
            Self::Namespace(namespace) => write!(f, "{namespace}"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ResourceIdentity {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(kind: ResourceKind, namespace: Option<String>, name: impl Into<String>) -> Self {
        let namespace = if kind.namespaced { namespace } else { None };
        Self {
            kind,
            namespace,
            name: name.into(),
        }
    }
}

impl Display for ResourceIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{} {namespace}/{}", self.kind, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Opaque `metadata.resourceVersion` token. Only ever compared for equality.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ResourceVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnapshot {
    pub identity: ResourceIdentity,
    pub version: Option<ResourceVersion>,
    pub body: Value,
}

impl ResourceSnapshot {
    pub fn new(identity: ResourceIdentity, version: Option<ResourceVersion>, body: Value) -> Self {
        Self {
            identity,
            version,
            body,
        }
    }

    pub fn from_object(kind: ResourceKind, body: Value) -> Option<Self> {
        let metadata = body.get("metadata")?;
        let name = metadata.get("name")?.as_str()?.to_string();
        let namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .map(str::to_string);
        let version = metadata
            .get("resourceVersion")
            .and_then(Value::as_str)
            .map(ResourceVersion::new);
        Some(Self::new(
            ResourceIdentity::new(kind, namespace, name),
            version,
            body,
        ))
    }

    pub fn with_body(&self, body: Value) -> Self {
        Self::new(self.identity.clone(), self.version.clone(), body)
    }

    pub fn body_at_version(&self, version: Option<&ResourceVersion>) -> Value {
        let mut body = self.body.clone();
        if let Some(metadata) = body.get_mut("metadata").and_then(Value::as_object_mut) {
            match version {
                Some(version) => {
                    metadata.insert(
                        "resourceVersion".to_string(),
                        Value::String(version.as_str().to_string()),
                    );
                }
                None => {
                    metadata.remove("resourceVersion");
                }
            }
        }
        body
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub snapshot: ResourceSnapshot,
}

impl WatchEvent {
    pub fn added(snapshot: ResourceSnapshot) -> Self {
        Self {
            kind: WatchEventKind::Added,
            snapshot,
        }
    }

    pub fn modified(snapshot: ResourceSnapshot) -> Self {
        Self {
            kind: WatchEventKind::Modified,
            snapshot,
        }
    }

    pub fn deleted(snapshot: ResourceSnapshot) -> Self {
        Self {
            kind: WatchEventKind::Deleted,
            snapshot,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected { reason: String },
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected { .. } => "disconnected",
        }
    }
}
