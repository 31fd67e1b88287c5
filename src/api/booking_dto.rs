use serde::{Deserialize, Serialize};

use crate::domain::experiment::descriptor::ExperimentTemplate;

/// File of bookings that are submitted when the server starts.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingsDto {
    pub bookings: Vec<BookingDto>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingDto {
    /// Id of the owning user, must be listed in the server configuration.
    pub owner: String,

    pub template: ExperimentTemplate,

    /// Confirm the booking right after it was admitted.
    #[serde(default)]
    pub schedule: bool,
}
