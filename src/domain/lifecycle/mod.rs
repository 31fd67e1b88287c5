pub mod lifecycle_manager;
pub mod lock_registry;
