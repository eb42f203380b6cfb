pub mod config;
pub mod database;
pub mod dto;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod utils;

use std::sync::Arc;

use crate::error::Result;
use crate::services::{
    dispatcher::{DispatcherSettings, EventDispatcher},
    notification_service::NotificationService,
    webhook_store::{PgWebhookStore, WebhookStore},
};
use sqlx::PgPool;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn WebhookStore>,
    pub dispatcher: EventDispatcher,
    pub notification_service: NotificationService,
}

impl AppState {
    pub fn new(pool: PgPool, settings: DispatcherSettings) -> Result<Self> {
        let store: Arc<dyn WebhookStore> = Arc::new(PgWebhookStore::new(pool));
        let dispatcher = EventDispatcher::new(store, settings)?;
        Ok(Self::from_dispatcher(dispatcher))
    }

    pub fn from_dispatcher(dispatcher: EventDispatcher) -> Self {
        Self {
            store: dispatcher.store(),
            notification_service: NotificationService::new(dispatcher.clone()),
            dispatcher,
        }
    }
}
