//! Kubernetes integration.
//!
//! The agent only needs the labels of its own node and of the pods scheduled on it:
//! - [`LabelSource`]: list/watch capability the reconciliation loop is written against
//! - [`KubeLabelSource`]: the `kube` backed implementation
//! - [`WatchEvent`]: decoded watch notifications

pub mod label_source;
pub mod types;

pub use label_source::KubeLabelSource;
pub use label_source::LabelSource;
pub use label_source::WatchStream;
pub use types::KubernetesError;
pub use types::WatchEvent;
