pub mod event;
pub mod webhook;
pub mod webhook_delivery;
pub mod webhook_outbox;
