pub mod descriptor;
pub mod status;
