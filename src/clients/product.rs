use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::{
    clients::{ProductStore, SharedCache, WebhookConfigSource},
    models::{
        event::EventType,
        webhook::{ProductNotificationConfig, WebhookTarget},
    },
};

/// Merchant callback configuration, read through the shared cache.
pub struct ProductService {
    store: Arc<dyn ProductStore>,
    cache: Arc<dyn SharedCache>,
    ttl_seconds: u64,
}

impl ProductService {
    pub fn new(store: Arc<dyn ProductStore>, cache: Arc<dyn SharedCache>, ttl_seconds: u64) -> Self {
        Self {
            store,
            cache,
            ttl_seconds,
        }
    }

    fn cache_key(keyword: &str) -> String {
        format!("product:webhook_config:{}", keyword)
    }

    async fn cached(&self, key: &str) -> Option<ProductNotificationConfig> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!(key = %key, error = %e, "Ignoring undecodable cached webhook config");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Webhook config cache read failed");
                None
            }
        }
    }
}

#[async_trait]
impl WebhookConfigSource for ProductService {
    async fn webhook_target(
        &self,
        keyword: &str,
        event_type: &EventType,
    ) -> Result<Option<WebhookTarget>> {
        let key = Self::cache_key(keyword);

        if let Some(config) = self.cached(&key).await {
            debug!(keyword = %keyword, "Webhook config loaded from cache");
            return Ok(Some(config.target_for(event_type)));
        }

        let Some(config) = self.store.find_notification_config(keyword).await? else {
            return Ok(None);
        };

        match serde_json::to_string(&config) {
            Ok(raw) => {
                if let Err(e) = self.cache.set_ex(&key, &raw, self.ttl_seconds).await {
                    warn!(key = %key, error = %e, "Failed to cache webhook config");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to encode webhook config"),
        }

        info!(
            keyword = %keyword,
            merchant_id = config.merchant_id,
            product_id = config.product_id,
            method = %config.config.method,
            "Fetched webhook configuration from database"
        );

        Ok(Some(config.target_for(event_type)))
    }
}
