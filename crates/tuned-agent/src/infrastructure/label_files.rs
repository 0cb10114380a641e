use core::error::Error;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::domain::labels::Labels;
use crate::domain::labels::PodLabelIndex;

#[derive(Debug, derive_more::Display)]
pub enum LabelFileError {
    #[display("Failed to write labels file '{}'", path.display())]
    WriteFailed { path: PathBuf },
}

impl Error for LabelFileError {}

/// The node and pod label files read by the tuning daemon's profile selection.
#[derive(Debug, Clone)]
pub struct LabelFiles {
    node_path: PathBuf,
    pod_path: PathBuf,
}

impl LabelFiles {
    pub fn new(node_path: impl Into<PathBuf>, pod_path: impl Into<PathBuf>) -> Self {
        Self {
            node_path: node_path.into(),
            pod_path: pod_path.into(),
        }
    }

    pub fn node_path(&self) -> &Path {
        &self.node_path
    }

    pub fn pod_path(&self) -> &Path {
        &self.pod_path
    }

    /// Replace the node label file with one `key=value` line per label.
    pub fn dump_node(&self, labels: &Labels) -> Result<(), Report<LabelFileError>> {
        write_node_labels(&self.node_path, labels)
    }

    /// Replace the pod label file with the labels of every pod, one `key=value` per line.
    pub fn dump_pods(&self, index: &PodLabelIndex) -> Result<(), Report<LabelFileError>> {
        write_atomically(&self.pod_path, &render_pods(index))
    }
}

/// Write `labels` to `path` in the node label file format.
pub fn write_node_labels(path: &Path, labels: &Labels) -> Result<(), Report<LabelFileError>> {
    write_atomically(path, &render_node(labels))
}

fn render_node(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}\n"))
        .collect()
}

/// Pods are rendered in key order so an unchanged index produces an unchanged file.
fn render_pods(index: &PodLabelIndex) -> String {
    let mut pods: Vec<_> = index.iter().collect();
    pods.sort_by(|(a, _), (b, _)| a.cmp(b));
    pods.into_iter()
        .map(|(_, labels)| render_node(labels))
        .collect()
}

/// Write `content` to a temporary file next to `path`, sync it and rename it over `path`.
fn write_atomically(path: &Path, content: &str) -> Result<(), Report<LabelFileError>> {
    let write_failed = || LabelFileError::WriteFailed {
        path: path.to_path_buf(),
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    debug!("Dumping labels to {}", path.display());
    let mut file = NamedTempFile::new_in(dir).change_context_lazy(write_failed)?;
    file.write_all(content.as_bytes())
        .change_context_lazy(write_failed)?;
    file.as_file()
        .sync_all()
        .change_context_lazy(write_failed)?;
    file.persist(path)
        .map_err(|e| Report::new(e.error).change_context(write_failed()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::labels::labels;
    use crate::domain::labels::PodKey;

    #[test]
    fn node_labels_are_written_one_per_line() {
        let dir = tempfile::tempdir().expect("should create tempdir");
        let files = LabelFiles::new(dir.path().join("node.cfg"), dir.path().join("pod.cfg"));

        files
            .dump_node(&labels([
                ("node-role.kubernetes.io/worker", ""),
                ("kubernetes.io/hostname", "worker-0"),
            ]))
            .expect("should dump");

        let written = std::fs::read_to_string(files.node_path()).expect("should read");
        assert_eq!(
            written,
            "kubernetes.io/hostname=worker-0\nnode-role.kubernetes.io/worker=\n"
        );
    }

    #[test]
    fn pod_labels_of_every_pod_are_concatenated() {
        let dir = tempfile::tempdir().expect("should create tempdir");
        let files = LabelFiles::new(dir.path().join("node.cfg"), dir.path().join("pod.cfg"));
        let mut index = PodLabelIndex::new();
        index.insert(PodKey::new("default", "web"), labels([("app", "web")]));
        index.insert(
            PodKey::new("default", "db"),
            labels([("app", "db"), ("tier", "backend")]),
        );
        index.insert(PodKey::new("kube-system", "dns"), Labels::new());

        files.dump_pods(&index).expect("should dump");

        let written = std::fs::read_to_string(files.pod_path()).expect("should read");
        assert_eq!(written, "app=db\ntier=backend\napp=web\n");
    }

    #[test]
    fn dump_replaces_previous_content() {
        let dir = tempfile::tempdir().expect("should create tempdir");
        let files = LabelFiles::new(dir.path().join("node.cfg"), dir.path().join("pod.cfg"));
        files
            .dump_node(&labels([("a", "1"), ("b", "2")]))
            .expect("should dump");

        files.dump_node(&Labels::new()).expect("should dump again");

        let written = std::fs::read_to_string(files.node_path()).expect("should read");
        assert_eq!(written, "");
        let leftovers = std::fs::read_dir(dir.path()).expect("should list").count();
        assert_eq!(leftovers, 1, "no temporary files are left behind");
    }

    #[test]
    fn missing_directory_is_a_write_error() {
        let dir = tempfile::tempdir().expect("should create tempdir");
        let files = LabelFiles::new(
            dir.path().join("absent/node.cfg"),
            dir.path().join("absent/pod.cfg"),
        );

        let error = files.dump_node(&Labels::new()).expect_err("no directory");

        assert!(matches!(
            error.current_context(),
            LabelFileError::WriteFailed { .. }
        ));
    }
}
