use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use crate::domain::store::json_store::experiment_directory;
use crate::domain::utils::id::{ExperimentId, NodeId};
use crate::error::StoreError;

const FIRMWARE_DIRECTORY: &str = "firmware";
const LOGS_DIRECTORY: &str = "logs";

/// Durable per-experiment artifacts: uploaded firmware and retrieved node logs.
///
/// Which nodes already delivered their logs must be derivable from here alone,
/// so trackers rebuilt after a restart do not wait for logs that already exist.
pub trait ArtifactArea: std::fmt::Debug + Send + Sync {
    fn firmware_exists(&self, experiment: ExperimentId, firmware: &str) -> bool;

    /// Nodes whose post-run logs were retrieved for `experiment`.
    fn retrieved_nodes(&self, experiment: ExperimentId) -> Result<Vec<NodeId>, StoreError>;
}

/// Artifact area on the local file system.
///
/// Layout below the working directory:
/// `<id>/firmware/<name>` for uploaded firmware and `<id>/logs/<node>/` for
/// every node whose logs were fetched.
#[derive(Debug, Clone)]
pub struct FileArtifactArea {
    working_directory: PathBuf,
}

impl FileArtifactArea {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self { working_directory: working_directory.into() }
    }

    /// Path of an uploaded firmware file, `None` for names escaping the firmware directory.
    pub fn firmware_path(&self, experiment: ExperimentId, firmware: &str) -> Option<PathBuf> {
        if !is_plain_file_name(firmware) {
            return None;
        }
        Some(experiment_directory(&self.working_directory, experiment).join(FIRMWARE_DIRECTORY).join(firmware))
    }

    pub fn logs_path(&self, experiment: ExperimentId, node: &NodeId) -> Option<PathBuf> {
        if !is_plain_file_name(node.as_str()) {
            return None;
        }
        Some(experiment_directory(&self.working_directory, experiment).join(LOGS_DIRECTORY).join(node.as_str()))
    }
}

impl ArtifactArea for FileArtifactArea {
    fn firmware_exists(&self, experiment: ExperimentId, firmware: &str) -> bool {
        match self.firmware_path(experiment, firmware) {
            Some(path) => path.is_file(),
            None => {
                log::warn!("[Experiment {}] Rejected firmware name '{}' (path traversal).", experiment, firmware);
                false
            }
        }
    }

    fn retrieved_nodes(&self, experiment: ExperimentId) -> Result<Vec<NodeId>, StoreError> {
        let logs = experiment_directory(&self.working_directory, experiment).join(LOGS_DIRECTORY);

        let entries = match fs::read_dir(&logs) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut nodes = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    nodes.push(NodeId::new(name));
                }
            }
        }

        nodes.sort();
        Ok(nodes)
    }
}

/// True for a single, non-empty path component without `.` or `..`.
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!((components.next(), components.next()), (Some(Component::Normal(_)), None)) && !name.contains(|c: char| c == '/' || c == '\\')
}
