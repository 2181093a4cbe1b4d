use anyhow::Result;
use similar::TextDiff;

use crate::divergence::normalize;
use crate::manifest::render_manifest;
use crate::notification::{ComparisonView, RemoteState};

/// Unified diff from the local copy to the cluster version, over the normalized
/// documents so server-owned fields never show up as changes.
pub fn unified_diff(view: &ComparisonView, context_lines: usize) -> Result<String> {
    let identity = &view.local.identity;
    let name = match &identity.namespace {
        Some(namespace) => format!("{}.{}.{}", identity.kind, namespace, identity.name),
        None => format!("{}.{}", identity.kind, identity.name),
    };
    let local_yaml = render_manifest(&normalize(&view.local.body))?;
    let (remote_yaml, new_header) = match &view.remote {
        RemoteState::Present(remote) => {
            (render_manifest(&normalize(&remote.body))?, format!("b/cluster/{name}"))
        }
        RemoteState::Deleted(_) => (String::new(), "/dev/null".to_string()),
    };

    Ok(TextDiff::from_lines(&local_yaml, &remote_yaml)
        .unified_diff()
        .context_radius(context_lines)
        .header(&format!("a/local/{name}"), &new_header)
        .to_string())
}
