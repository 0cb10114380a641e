//! State owned by one run of the reconciliation loop.
//!
//! Only the loop touches this record, one event at a time, so it carries no locks.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::domain::labels::is_node_wide_significant;
use crate::domain::labels::labels_equal;
use crate::domain::labels::Labels;
use crate::domain::labels::PodKey;
use crate::domain::labels::PodLabelIndex;
use crate::domain::resync::duration_with_jitter;

/// Jitter applied to the pod pull period, as a fraction of the period.
const POD_PULL_JITTER: f64 = 0.3;

/// Pending work for the reconciliation action.
///
/// Set by event handlers and cleared only by the action that consumes them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChangeFlags {
    pub node: bool,
    pub pod: bool,
    pub config: bool,
}

#[derive(Debug)]
pub struct ReconcilerState {
    node_labels: Option<Labels>,
    pod_labels: Option<PodLabelIndex>,
    changes: ChangeFlags,
    next_pod_pull: Instant,
    pod_pull_period: Duration,
}

impl ReconcilerState {
    /// Create an empty state; nothing is known about the node or its pods yet.
    pub fn new(pod_pull_period: Duration) -> Self {
        Self {
            node_labels: None,
            pod_labels: None,
            changes: ChangeFlags::default(),
            next_pod_pull: Instant::now(),
            pod_pull_period,
        }
    }

    pub fn changes(&self) -> ChangeFlags {
        self.changes
    }

    pub fn node_labels(&self) -> Option<&Labels> {
        self.node_labels.as_ref()
    }

    pub fn pod_labels(&self) -> Option<&PodLabelIndex> {
        self.pod_labels.as_ref()
    }

    /// Record the node's labels; sets the node flag if they differ from the last seen set.
    pub fn observe_node(&mut self, labels: Labels) -> bool {
        let changed = self
            .node_labels
            .as_ref()
            .map_or(true, |known| !labels_equal(known, &labels));
        if changed {
            debug!("Node labels changed");
            self.node_labels = Some(labels);
            self.changes.node = true;
        }
        changed
    }

    /// Record an added or modified pod; sets the pod flag only when the change is
    /// significant node-wide.
    pub fn observe_pod(&mut self, key: PodKey, labels: Labels) -> bool {
        let index = self.pod_labels.get_or_insert_with(PodLabelIndex::new);
        if index.get(&key).is_some_and(|known| labels_equal(known, &labels)) {
            return false;
        }

        let significant = is_node_wide_significant(index, &key, &labels);
        debug!(pod = %key, significant, "Pod labels changed");
        index.insert(key, labels);
        self.changes.pod |= significant;
        significant
    }

    /// Record a deleted pod; sets the pod flag when the labels it took away were unique to it.
    pub fn forget_pod(&mut self, key: &PodKey) -> bool {
        let Some(index) = self.pod_labels.as_mut() else {
            return false;
        };

        let significant = is_node_wide_significant(index, key, &Labels::new());
        debug!(pod = %key, significant, "Pod deleted");
        index.remove(key);
        self.changes.pod |= significant;
        significant
    }

    /// Replace the whole pod index after a full list; sets the pod flag if it differs.
    pub fn replace_pods(&mut self, pods: PodLabelIndex) -> bool {
        let changed = self.pod_labels.as_ref() != Some(&pods);
        if changed {
            debug!(pods = pods.len(), "Pod label index replaced");
            self.pod_labels = Some(pods);
            self.changes.pod = true;
        }
        changed
    }

    pub fn mark_config_changed(&mut self) {
        self.changes.config = true;
    }

    /// Whether the safety-net pod pull is due at `now`.
    pub fn pod_pull_due(&self, now: Instant) -> bool {
        now >= self.next_pod_pull
    }

    /// Schedule the next pod pull one jittered pod-pull period after `now`.
    pub fn schedule_pod_pull(&mut self, now: Instant) {
        self.next_pod_pull = now + duration_with_jitter(self.pod_pull_period, POD_PULL_JITTER);
    }

    pub fn take_pod_change(&mut self) -> bool {
        std::mem::take(&mut self.changes.pod)
    }

    pub fn take_node_change(&mut self) -> bool {
        std::mem::take(&mut self.changes.node)
    }

    pub fn take_config_change(&mut self) -> bool {
        std::mem::take(&mut self.changes.config)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::labels::labels;

    const EIGHT_HOURS: Duration = Duration::from_secs(8 * 3600);

    #[test]
    fn first_node_observation_is_a_change() {
        let mut state = ReconcilerState::new(EIGHT_HOURS);

        assert!(state.observe_node(Labels::new()));
        assert!(state.changes().node);
    }

    #[test]
    fn identical_node_labels_do_not_set_the_flag() {
        let mut state = ReconcilerState::new(EIGHT_HOURS);
        state.observe_node(labels([("role", "worker")]));
        state.take_node_change();

        assert!(!state.observe_node(labels([("role", "worker")])));
        assert!(!state.changes().node);

        assert!(state.observe_node(labels([("role", "infra")])));
        assert_eq!(state.node_labels(), Some(&labels([("role", "infra")])));
    }

    #[test]
    fn shared_label_churn_does_not_set_the_pod_flag() {
        let mut state = ReconcilerState::new(EIGHT_HOURS);
        let p1 = PodKey::new("default", "p1");
        let p2 = PodKey::new("default", "p2");

        state.observe_pod(p1.clone(), labels([("app", "a")]));
        state.observe_pod(p2.clone(), labels([("app", "a")]));
        state.take_pod_change();

        // p1 drops a label p2 still carries
        assert!(!state.observe_pod(p1.clone(), Labels::new()));
        assert!(!state.changes().pod);
        assert_eq!(state.pod_labels().map(|index| index[&p1].len()), Some(0));

        // p1 gains a label nobody else has
        assert!(state.observe_pod(p1, labels([("app", "b")])));
        assert!(state.changes().pod);
    }

    #[test]
    fn deleting_a_pod_with_unique_labels_sets_the_flag() {
        let mut state = ReconcilerState::new(EIGHT_HOURS);
        let p1 = PodKey::new("default", "p1");
        let p2 = PodKey::new("default", "p2");
        state.observe_pod(p1.clone(), labels([("app", "a")]));
        state.observe_pod(p2.clone(), labels([("app", "b")]));
        state.take_pod_change();

        assert!(state.forget_pod(&p2));
        assert!(state.take_pod_change());
        assert!(!state.pod_labels().is_some_and(|index| index.contains_key(&p2)));
    }

    #[test]
    fn forgetting_before_anything_is_known_is_a_noop() {
        let mut state = ReconcilerState::new(EIGHT_HOURS);

        assert!(!state.forget_pod(&PodKey::new("default", "p1")));
        assert_eq!(state.changes(), ChangeFlags::default());
    }

    #[test]
    fn replacing_pods_compares_the_whole_index() {
        let mut state = ReconcilerState::new(EIGHT_HOURS);
        let mut index = PodLabelIndex::new();
        index.insert(PodKey::new("default", "p1"), labels([("app", "a")]));

        assert!(state.replace_pods(index.clone()));
        state.take_pod_change();
        assert!(!state.replace_pods(index));
        assert!(!state.changes().pod);

        assert!(state.replace_pods(PodLabelIndex::new()));
        assert!(state.changes().pod);
    }

    #[test]
    fn take_clears_only_its_own_flag() {
        let mut state = ReconcilerState::new(EIGHT_HOURS);
        state.observe_node(Labels::new());
        state.mark_config_changed();

        assert!(state.take_config_change());
        assert!(!state.take_config_change());
        assert!(state.changes().node);
    }

    #[tokio::test(start_paused = true)]
    async fn pod_pull_is_scheduled_roughly_one_period_ahead() {
        let mut state = ReconcilerState::new(EIGHT_HOURS);
        let now = Instant::now();
        assert!(state.pod_pull_due(now));

        state.schedule_pod_pull(now);
        assert!(!state.pod_pull_due(now + Duration::from_secs(6 * 3600)));
        assert!(state.pod_pull_due(now + Duration::from_secs(10 * 3600)));
    }
}
