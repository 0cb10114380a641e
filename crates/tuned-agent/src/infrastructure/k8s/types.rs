use core::error::Error;
use std::path::PathBuf;

use crate::domain::labels::Labels;
use crate::domain::labels::PodKey;
use crate::domain::labels::PodLabelIndex;

/// A cluster watch notification, decoded once where it enters the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// The tracked node was added or modified; carries its full label set
    NodeLabels(Labels),
    /// The tracked node object was deleted
    NodeDeleted,
    /// A pod on the node was added or modified
    PodApplied { key: PodKey, labels: Labels },
    /// A pod left the node
    PodDeleted { key: PodKey },
    /// The watch re-listed every pod on the node
    PodsListed(PodLabelIndex),
    /// The payload could not be interpreted; logged and ignored
    Unrecognized { reason: String },
}

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, derive_more::Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Cannot stat kubeconfig '{}'", path.display())]
    KubeconfigUnreadable { path: PathBuf },
    #[display("Could not locate a kubeconfig")]
    KubeconfigNotFound,
    #[display("Node not found: {node_name}")]
    NodeNotFound { node_name: String },
    #[display("Failed to pull labels: {message}")]
    PullFailed { message: String },
    #[display("Failed to watch {resource}")]
    WatchFailed { resource: String },
    #[display("The {resource} watch stream ended")]
    WatchClosed { resource: String },
}

impl Error for KubernetesError {}
