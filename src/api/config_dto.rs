use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::user::UserRole;

/// Root of the server configuration file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfigDto {
    pub working_directory: PathBuf,

    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,

    #[serde(default)]
    pub statistics_file: Option<PathBuf>,

    pub nodes: Vec<HardwareNodeDto>,

    #[serde(default)]
    pub users: Vec<UserDto>,

    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    #[serde(default = "default_collision_buffer_secs")]
    pub collision_buffer_secs: u64,

    #[serde(default = "default_store_retry_backoff_ms")]
    pub store_retry_backoff_ms: u64,

    #[serde(default = "default_artifact_poll_interval_secs")]
    pub artifact_poll_interval_secs: u64,

    /// Runs the server on a simulated clock starting at this instant.
    #[serde(default)]
    pub simulation_start: Option<DateTime<Utc>>,

    /// Bookings admitted at startup.
    #[serde(default)]
    pub bookings_file: Option<PathBuf>,
}

impl ServerConfigDto {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn collision_buffer(&self) -> Duration {
        Duration::from_secs(self.collision_buffer_secs)
    }

    pub fn store_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.store_retry_backoff_ms)
    }

    pub fn artifact_poll_interval(&self) -> Duration {
        Duration::from_secs(self.artifact_poll_interval_secs)
    }
}

fn default_log_directory() -> PathBuf {
    PathBuf::from("logs")
}

fn default_grace_period_secs() -> u64 {
    300
}

fn default_collision_buffer_secs() -> u64 {
    299
}

fn default_store_retry_backoff_ms() -> u64 {
    1_000
}

fn default_artifact_poll_interval_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareNodeDto {
    pub id: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDto {
    pub id: String,
    pub name: String,
    #[serde(default = "default_role")]
    pub role: UserRole,
}

fn default_role() -> UserRole {
    UserRole::User
}
