use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::domain::experiment::descriptor::{ExperimentDescriptor, ExperimentTemplate, NodeAssignment};
use crate::domain::experiment::status::ExperimentStatus;
use crate::domain::store::experiment_store::{ExperimentStore, StoreState};
use crate::domain::utils::id::{ExperimentId, UserId};
use crate::error::StoreError;

const EXPERIMENT_LIST_FILE: &str = "experiments.json";
const CONFIGURATION_FILE: &str = "configuration.json";

/// One entry of the central `experiments.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExperimentInfo {
    experiment_id: ExperimentId,
    name: String,
    owner: UserId,
    status: ExperimentStatus,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl From<&ExperimentDescriptor> for ExperimentInfo {
    fn from(descriptor: &ExperimentDescriptor) -> Self {
        Self {
            experiment_id: descriptor.id(),
            name: descriptor.name().to_string(),
            owner: descriptor.owner().clone(),
            status: descriptor.status(),
            start: descriptor.start(),
            end: descriptor.end(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExperimentList {
    experiments: Vec<ExperimentInfo>,
    next_id: u64,
}

/// Per-experiment `configuration.json` holding the node assignments.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExperimentDetail {
    nodes: Vec<NodeAssignment>,
}

/// File backed store.
///
/// Ties together the central `experiments.json` (id counter, status and timing
/// of every experiment) with one `<id>/configuration.json` per experiment.
/// Files are replaced atomically and the in-memory index only changes after
/// the write succeeded.
#[derive(Debug)]
pub struct JsonExperimentStore {
    working_directory: PathBuf,
    inner: RwLock<StoreState>,
}

impl JsonExperimentStore {
    pub fn open(working_directory: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let working_directory = working_directory.into();
        fs::create_dir_all(&working_directory)?;

        let list_path = working_directory.join(EXPERIMENT_LIST_FILE);
        let list = if list_path.exists() { read_json::<ExperimentList>(&list_path)? } else { ExperimentList { experiments: Vec::new(), next_id: 1 } };

        let mut state = StoreState::new(list.next_id);

        for info in list.experiments {
            let detail_path = experiment_directory(&working_directory, info.experiment_id).join(CONFIGURATION_FILE);

            match read_json::<ExperimentDetail>(&detail_path) {
                Ok(detail) => {
                    let descriptor =
                        ExperimentDescriptor::restore(info.experiment_id, info.name, info.owner, info.start, info.end, detail.nodes, info.status);
                    state.next_id = state.next_id.max(descriptor.id().value() + 1);
                    state.experiments.insert(descriptor.id(), descriptor);
                }
                Err(e) => {
                    // Sub-folder was removed by hand; the experiment is no longer listed.
                    log::warn!("[Experiment {}] Skipping experiment without readable configuration: {}", info.experiment_id, e);
                }
            }
        }

        log::info!("Loaded {} experiments from '{}'.", state.experiments.len(), working_directory.display());

        Ok(Self { working_directory, inner: RwLock::new(state) })
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    fn write_experiment_list<'a>(&self, experiments: impl Iterator<Item = &'a ExperimentDescriptor>, next_id: u64) -> Result<(), StoreError> {
        let list = ExperimentList { experiments: experiments.map(ExperimentInfo::from).collect(), next_id };
        write_json_atomically(&self.working_directory.join(EXPERIMENT_LIST_FILE), &list)
    }
}

impl ExperimentStore for JsonExperimentStore {
    fn query_by_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<ExperimentDescriptor>, StoreError> {
        let guard = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.in_time_range(from, to))
    }

    fn query_by_id(&self, id: ExperimentId) -> Result<Option<ExperimentDescriptor>, StoreError> {
        let guard = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.experiments.get(&id).cloned())
    }

    fn query_by_status(&self, status: ExperimentStatus) -> Result<Vec<ExperimentDescriptor>, StoreError> {
        let guard = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.with_status(status))
    }

    fn add(&self, template: ExperimentTemplate, owner: UserId) -> Result<ExperimentDescriptor, StoreError> {
        let mut guard = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        let id = ExperimentId(guard.next_id);
        let descriptor = ExperimentDescriptor::new(id, template, owner);

        let directory = experiment_directory(&self.working_directory, id);
        fs::create_dir_all(&directory)?;
        write_json_atomically(&directory.join(CONFIGURATION_FILE), &ExperimentDetail { nodes: descriptor.nodes().to_vec() })?;
        self.write_experiment_list(guard.experiments.values().chain(std::iter::once(&descriptor)), id.value() + 1)?;

        guard.next_id = id.value() + 1;
        guard.experiments.insert(id, descriptor.clone());
        Ok(descriptor)
    }

    fn update(&self, descriptor: &ExperimentDescriptor) -> Result<(), StoreError> {
        let mut guard = self.inner.write().map_err(|_| StoreError::Poisoned)?;

        if !guard.experiments.contains_key(&descriptor.id()) {
            return Err(StoreError::UnknownExperiment(descriptor.id()));
        }

        let snapshot = guard.experiments.values().map(|stored| if stored.id() == descriptor.id() { descriptor } else { stored });
        self.write_experiment_list(snapshot, guard.next_id)?;

        guard.experiments.insert(descriptor.id(), descriptor.clone());
        Ok(())
    }
}

/// Directory holding everything that belongs to one experiment.
pub fn experiment_directory(working_directory: &Path, id: ExperimentId) -> PathBuf {
    working_directory.join(id.to_string())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let data = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

fn write_json_atomically<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
