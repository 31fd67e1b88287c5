pub mod artifact_area;
pub mod experiment_store;
pub mod json_store;
