pub mod booking_dto;
pub mod config_dto;
