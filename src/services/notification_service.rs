use serde::Serialize;
use validator::Validate;

use crate::dto::event_dto::{LeadFormSubmit, PuppyReservation, WhatsAppClick};
use crate::dto::webhook_dto::WebhookMetadata;
use crate::error::Result;
use crate::models::event::EventType;
use crate::services::dispatcher::EventDispatcher;

/// Typed entry points for the storefront's domain events.
///
/// Each call validates the payload and returns once the dispatch is queued;
/// resolution and delivery run in the background.
#[derive(Clone)]
pub struct NotificationService {
    dispatcher: EventDispatcher,
}

impl NotificationService {
    pub fn new(dispatcher: EventDispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn notify_lead_form_submit(
        &self,
        lead: LeadFormSubmit,
        metadata: WebhookMetadata,
    ) -> Result<()> {
        let page_url = lead.page_url.clone();
        self.notify(EventType::LeadFormSubmit, &lead, metadata, page_url)
    }

    pub fn notify_puppy_reservation(
        &self,
        reservation: PuppyReservation,
        metadata: WebhookMetadata,
    ) -> Result<()> {
        let page_url = reservation.page_url.clone();
        self.notify(EventType::PuppyReservation, &reservation, metadata, page_url)
    }

    pub fn notify_whatsapp_click(
        &self,
        click: WhatsAppClick,
        metadata: WebhookMetadata,
    ) -> Result<()> {
        let page_url = Some(click.page_url.clone());
        self.notify(EventType::WhatsAppClick, &click, metadata, page_url)
    }

    fn notify<T>(
        &self,
        event: EventType,
        payload: &T,
        mut metadata: WebhookMetadata,
        page_url: Option<String>,
    ) -> Result<()>
    where
        T: Serialize + Validate,
    {
        payload.validate()?;
        let data = serde_json::to_value(payload)?;
        if metadata.page_url.is_none() {
            metadata.page_url = page_url;
        }
        let metadata = (metadata != WebhookMetadata::default()).then_some(metadata);
        self.dispatcher.spawn_dispatch(event, data, metadata);
        Ok(())
    }
}
