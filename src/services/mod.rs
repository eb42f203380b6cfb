pub mod delivery_executor;
pub mod delivery_recorder;
pub mod dispatcher;
pub mod health_tracker;
pub mod notification_service;
pub mod outbox_sweeper;
pub mod payload_builder;
pub mod retry_scheduler;
pub mod subscriber_resolver;
pub mod webhook_store;
