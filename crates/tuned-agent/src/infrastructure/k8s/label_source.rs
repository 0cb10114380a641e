use async_trait::async_trait;
use error_stack::Report;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::runtime::watcher;
use kube::Api;
use kube::Client;
use tracing::warn;

use super::types::KubernetesError;
use super::types::WatchEvent;
use crate::domain::labels::PodKey;
use crate::domain::labels::PodLabelIndex;
use crate::domain::labels::Labels;

/// Stream of decoded watch notifications. An `Err` item ends the loop attempt.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, Report<KubernetesError>>>;

/// List/watch access to the labels of one node and of the pods scheduled on it.
#[async_trait]
pub trait LabelSource: Send + Sync {
    /// Fetch the current labels of the tracked node.
    async fn node_labels(&self) -> Result<Labels, Report<KubernetesError>>;

    /// Fetch the labels of every pod scheduled on the tracked node.
    async fn pod_labels(&self) -> Result<PodLabelIndex, Report<KubernetesError>>;

    /// Watch the tracked node.
    fn watch_node(&self) -> WatchStream;

    /// Watch all pods scheduled on the tracked node.
    fn watch_pods(&self) -> WatchStream;
}

/// [`LabelSource`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeLabelSource {
    nodes: Api<Node>,
    pods: Api<Pod>,
    node_name: String,
}

impl KubeLabelSource {
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            nodes: Api::all(client.clone()),
            pods: Api::all(client),
            node_name: node_name.into(),
        }
    }

    fn pods_on_node_selector(&self) -> String {
        format!("spec.nodeName={}", self.node_name)
    }
}

#[async_trait]
impl LabelSource for KubeLabelSource {
    #[tracing::instrument(skip(self), fields(node = %self.node_name))]
    async fn node_labels(&self) -> Result<Labels, Report<KubernetesError>> {
        let node = self.nodes.get(&self.node_name).await.map_err(|e| {
            let context = match &e {
                kube::Error::Api(response) if response.code == 404 => {
                    KubernetesError::NodeNotFound {
                        node_name: self.node_name.clone(),
                    }
                }
                _ => KubernetesError::PullFailed {
                    message: format!("cannot get node {}", self.node_name),
                },
            };
            Report::new(e).change_context(context)
        })?;

        Ok(node.metadata.labels.unwrap_or_default())
    }

    #[tracing::instrument(skip(self), fields(node = %self.node_name))]
    async fn pod_labels(&self) -> Result<PodLabelIndex, Report<KubernetesError>> {
        let params = ListParams::default().fields(&self.pods_on_node_selector());
        let pods = self.pods.list(&params).await.map_err(|e| {
            Report::new(e).change_context(KubernetesError::PullFailed {
                message: format!("cannot list pods on node {}", self.node_name),
            })
        })?;

        Ok(index_pods(pods.items))
    }

    fn watch_node(&self) -> WatchStream {
        let node_name = self.node_name.clone();
        let config = watcher::Config::default().fields(&format!("metadata.name={node_name}"));

        watcher(self.nodes.clone(), config)
            .map(move |result| {
                result
                    .map(|event| decode_node_event(event, &node_name))
                    .map_err(|e| {
                        Report::new(e).change_context(KubernetesError::WatchFailed {
                            resource: format!("node {node_name}"),
                        })
                    })
            })
            .boxed()
    }

    fn watch_pods(&self) -> WatchStream {
        let node_name = self.node_name.clone();
        let config = watcher::Config::default().fields(&self.pods_on_node_selector());

        watcher(self.pods.clone(), config)
            .map(move |result| {
                result.map(decode_pod_event).map_err(|e| {
                    Report::new(e).change_context(KubernetesError::WatchFailed {
                        resource: format!("pods on node {node_name}"),
                    })
                })
            })
            .boxed()
    }
}

fn pod_key(pod: &Pod) -> Option<PodKey> {
    Some(PodKey::new(
        pod.metadata.namespace.clone()?,
        pod.metadata.name.clone()?,
    ))
}

/// Build the label index of a pod list, skipping objects without namespace or name.
pub(crate) fn index_pods(pods: impl IntoIterator<Item = Pod>) -> PodLabelIndex {
    pods.into_iter()
        .filter_map(|pod| match pod_key(&pod) {
            Some(key) => Some((key, pod.metadata.labels.unwrap_or_default())),
            None => {
                warn!("Skipping pod without namespace or name");
                None
            }
        })
        .collect()
}

fn labels_of_tracked_node(node: Node, node_name: &str) -> WatchEvent {
    if node.metadata.name.as_deref() != Some(node_name) {
        return WatchEvent::Unrecognized {
            reason: format!("unexpected node object {:?}", node.metadata.name),
        };
    }
    WatchEvent::NodeLabels(node.metadata.labels.unwrap_or_default())
}

pub(crate) fn decode_node_event(event: watcher::Event<Node>, node_name: &str) -> WatchEvent {
    match event {
        watcher::Event::Applied(node) => labels_of_tracked_node(node, node_name),
        watcher::Event::Deleted(node) => {
            if node.metadata.name.as_deref() == Some(node_name) {
                WatchEvent::NodeDeleted
            } else {
                WatchEvent::Unrecognized {
                    reason: format!("deletion of unexpected node {:?}", node.metadata.name),
                }
            }
        }
        watcher::Event::Restarted(nodes) => nodes
            .into_iter()
            .find(|node| node.metadata.name.as_deref() == Some(node_name))
            .map_or_else(
                || WatchEvent::Unrecognized {
                    reason: format!("node {node_name} missing from re-list"),
                },
                |node| WatchEvent::NodeLabels(node.metadata.labels.unwrap_or_default()),
            ),
    }
}

pub(crate) fn decode_pod_event(event: watcher::Event<Pod>) -> WatchEvent {
    match event {
        watcher::Event::Applied(pod) => match pod_key(&pod) {
            Some(key) => WatchEvent::PodApplied {
                key,
                labels: pod.metadata.labels.unwrap_or_default(),
            },
            None => WatchEvent::Unrecognized {
                reason: "pod without namespace or name".to_string(),
            },
        },
        watcher::Event::Deleted(pod) => match pod_key(&pod) {
            Some(key) => WatchEvent::PodDeleted { key },
            None => WatchEvent::Unrecognized {
                reason: "deleted pod without namespace or name".to_string(),
            },
        },
        watcher::Event::Restarted(pods) => WatchEvent::PodsListed(index_pods(pods)),
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::labels::labels;

    fn create_test_node(name: &str, labels: Labels) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn create_test_pod(namespace: Option<&str>, name: &str, labels: Option<Labels>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: namespace.map(str::to_string),
                labels,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn applied_tracked_node_yields_its_labels() {
        let node = create_test_node("worker-0", labels([("role", "worker")]));

        let event = decode_node_event(watcher::Event::Applied(node), "worker-0");

        assert_eq!(event, WatchEvent::NodeLabels(labels([("role", "worker")])));
    }

    #[test]
    fn other_node_is_unrecognized() {
        let node = create_test_node("worker-1", Labels::new());

        let event = decode_node_event(watcher::Event::Applied(node), "worker-0");

        assert!(matches!(event, WatchEvent::Unrecognized { .. }));
    }

    #[test]
    fn relist_picks_the_tracked_node() {
        let nodes = vec![
            create_test_node("worker-1", labels([("role", "infra")])),
            create_test_node("worker-0", labels([("role", "worker")])),
        ];

        let event = decode_node_event(watcher::Event::Restarted(nodes), "worker-0");

        assert_eq!(event, WatchEvent::NodeLabels(labels([("role", "worker")])));
    }

    #[test]
    fn node_without_labels_has_an_empty_set() {
        let mut node = create_test_node("worker-0", Labels::new());
        node.metadata.labels = None;

        let event = decode_node_event(watcher::Event::Applied(node), "worker-0");

        assert_eq!(event, WatchEvent::NodeLabels(Labels::new()));
    }

    #[test]
    fn pod_events_are_keyed_by_namespace_and_name() {
        let pod = create_test_pod(Some("default"), "web", Some(labels([("app", "web")])));
        assert_eq!(
            decode_pod_event(watcher::Event::Applied(pod.clone())),
            WatchEvent::PodApplied {
                key: PodKey::new("default", "web"),
                labels: labels([("app", "web")]),
            }
        );

        assert_eq!(
            decode_pod_event(watcher::Event::Deleted(pod)),
            WatchEvent::PodDeleted {
                key: PodKey::new("default", "web"),
            }
        );
    }

    #[test]
    fn pod_without_namespace_is_unrecognized() {
        let pod = create_test_pod(None, "web", None);

        assert!(matches!(
            decode_pod_event(watcher::Event::Applied(pod)),
            WatchEvent::Unrecognized { .. }
        ));
    }

    #[test]
    fn pod_relist_builds_an_index() {
        let pods = vec![
            create_test_pod(Some("default"), "web", Some(labels([("app", "web")]))),
            create_test_pod(Some("default"), "db", None),
            create_test_pod(None, "broken", None),
        ];

        let WatchEvent::PodsListed(index) = decode_pod_event(watcher::Event::Restarted(pods))
        else {
            panic!("expected a pod list");
        };

        assert_eq!(index.len(), 2);
        assert_eq!(index[&PodKey::new("default", "db")], Labels::new());
        assert_eq!(
            index[&PodKey::new("default", "web")],
            labels([("app", "web")])
        );
    }
}
