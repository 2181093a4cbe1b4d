use thiserror::Error;

use crate::model::{ResourceIdentity, ResourceVersion};

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("{0} was not found on the cluster")]
    NotFound(ResourceIdentity),

    #[error("{identity} is no longer at version {expected}")]
    Conflict {
        identity: ResourceIdentity,
        expected: String,
    },

    #[error("watch resume version {0} has expired")]
    Gone(String),

    #[error("{operation} is not supported for {kind}")]
    NotSupported { operation: &'static str, kind: String },

    #[error("malformed resource document: {0}")]
    Malformed(String),

    #[error("watch stream failed ({code}): {message}")]
    Stream { code: u16, message: String },

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl OperatorError {
    pub fn from_kube(
        error: kube::Error,
        identity: &ResourceIdentity,
        expected: Option<&ResourceVersion>,
    ) -> Self {
        match &error {
            kube::Error::Api(response) if response.code == 404 => Self::NotFound(identity.clone()),
            kube::Error::Api(response) if response.code == 409 => Self::Conflict {
                identity: identity.clone(),
                expected: expected
                    .map(|version| version.as_str().to_string())
                    .unwrap_or_default(),
            },
            _ => Self::Kube(error),
        }
    }
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("no cluster change is pending for {0}")]
    NotShown(ResourceIdentity),

    #[error("a newer cluster version of {0} arrived; review it before pulling")]
    StaleRemote(ResourceIdentity),

    #[error("{0} has no local changes to push")]
    PushNotAllowed(ResourceIdentity),

    #[error("{0} was deleted on the cluster; pull to recreate it")]
    ResourceDeleted(ResourceIdentity),

    #[error("{identity} changed on the cluster while pushing (expected version {expected})")]
    Conflict {
        identity: ResourceIdentity,
        expected: String,
    },

    #[error("cluster connection lost; {0} cannot be synchronized until it returns")]
    Disconnected(ResourceIdentity),

    #[error(transparent)]
    Operator(#[from] OperatorError),
}
