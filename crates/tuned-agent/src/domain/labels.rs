//! Label set comparison.
//!
//! Pod label churn is only interesting to the tuning daemon when it changes the set of
//! labels that single out one pod from every other pod on the node. Labels shared with a
//! sibling (for example through a common ReplicaSet template) are already visible in the
//! pod label file and never trigger a reconfiguration on their own.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;

/// Label key to value mapping, as carried by Kubernetes object metadata.
pub type Labels = BTreeMap<String, String>;

/// Labels of every known pod on the node, keyed by `namespace/name`.
pub type PodLabelIndex = HashMap<PodKey, Labels>;

/// Identity of a pod on the node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Returns true iff both label sets hold the same key/value pairs.
pub fn labels_equal(old: &Labels, new: &Labels) -> bool {
    old == new
}

/// Returns the subset of `candidate` whose key/value pair is not carried by any pod in
/// `index` other than `pod`.
pub fn unique_labels(index: &PodLabelIndex, pod: &PodKey, candidate: &Labels) -> Labels {
    candidate
        .iter()
        .filter(|(key, value)| {
            !index
                .iter()
                .filter(|(other, _)| *other != pod)
                .any(|(_, labels)| labels.get(*key) == Some(*value))
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Returns true if replacing the stored labels of `pod` with `new_labels` changes the
/// labels unique to that pod node-wide.
///
/// A pod missing from `index` is treated as having no labels, so a deletion is evaluated
/// by passing an empty `new_labels`.
pub fn is_node_wide_significant(index: &PodLabelIndex, pod: &PodKey, new_labels: &Labels) -> bool {
    let empty = Labels::new();
    let stored = index.get(pod).unwrap_or(&empty);

    let old_unique = unique_labels(index, pod, stored);
    let new_unique = unique_labels(index, pod, new_labels);

    !labels_equal(&old_unique, &new_unique)
}

#[cfg(test)]
pub(crate) fn labels<const N: usize>(pairs: [(&str, &str); N]) -> Labels {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
