use std::sync::Arc;

use crate::error::Result;
use crate::models::event::EventType;
use crate::models::webhook::Subscriber;
use crate::services::webhook_store::WebhookStore;

#[derive(Clone)]
pub struct SubscriberResolver {
    store: Arc<dyn WebhookStore>,
}

impl SubscriberResolver {
    pub fn new(store: Arc<dyn WebhookStore>) -> Self {
        Self { store }
    }

    pub async fn find_active_subscribers(&self, event: EventType) -> Result<Vec<Subscriber>> {
        let subscribers = self.store.list_active_subscribers_for_event(event).await?;
        Ok(subscribers
            .into_iter()
            .filter(|s| s.is_active() && s.listens_to(event))
            .filter(|s| {
                let ok = s.has_http_url();
                if !ok {
                    tracing::warn!(
                        target: "webhook_delivery",
                        subscriber_id = %s.id,
                        url = %s.url,
                        "Skipping webhook with non-http(s) URL"
                    );
                }
                ok
            })
            .collect())
    }
}
