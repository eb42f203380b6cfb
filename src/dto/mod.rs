pub mod event_dto;
pub mod webhook_dto;
