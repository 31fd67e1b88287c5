pub mod artifact_poller;
pub mod in_process_bus;
pub mod message;
