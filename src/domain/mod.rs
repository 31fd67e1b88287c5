pub mod booking;
pub mod bus;
pub mod clock;
pub mod experiment;
pub mod inventory;
pub mod lifecycle;
pub mod scheduling;
pub mod statistics;
pub mod store;
pub mod user;
pub mod utils;
