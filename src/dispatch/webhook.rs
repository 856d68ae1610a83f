use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use reqwest::Url;
use tracing::{error, info, warn};

use crate::{
    clients::{WebhookConfigSource, WebhookSender},
    models::{
        event::NotificationEvent,
        outcome::{SenderResponse, WebhookOutcome},
        webhook::{HttpMethod, WebhookRequest, WebhookRequestParams, WebhookTarget},
    },
};

/// Calls the merchant back about a subscription event.
pub struct WebhookService {
    configs: Arc<dyn WebhookConfigSource>,
    sender: Arc<dyn WebhookSender>,
}

impl WebhookService {
    pub fn new(configs: Arc<dyn WebhookConfigSource>, sender: Arc<dyn WebhookSender>) -> Self {
        Self { configs, sender }
    }

    /// `Ok(None)` when the merchant has no callback for this event.
    pub async fn send_webhook_notification(
        &self,
        event: &NotificationEvent,
    ) -> Result<Option<WebhookOutcome>, Error> {
        let target = match self
            .configs
            .webhook_target(&event.keyword, &event.event_type)
            .await
        {
            Ok(Some(target)) => target,
            Ok(None) => {
                warn!(
                    keyword = %event.keyword,
                    subscription_id = %event.subscription_id,
                    event_type = %event.event_type,
                    "No webhook target configured, skipping"
                );
                return Ok(None);
            }
            Err(e) => {
                error!(
                    keyword = %event.keyword,
                    subscription_id = %event.subscription_id,
                    error = %e,
                    "Failed to fetch webhook configuration"
                );
                return Err(e);
            }
        };

        let params = WebhookRequestParams::from_event(event);
        let request = build_request(&target, &params)?;
        let response = self.sender.send_webhook(&request).await?;

        info!(
            merchant_id = target.merchant_id,
            subscription_id = %event.subscription_id,
            method = %request.method,
            status = response.status,
            delivery_status = response.delivery_status.as_str(),
            "Webhook dispatched"
        );

        Ok(Some(webhook_outcome(event, &target, response)?))
    }
}

/// GET carries the params as a query string, every other method as JSON.
pub fn build_request(
    target: &WebhookTarget,
    params: &WebhookRequestParams,
) -> Result<WebhookRequest, Error> {
    let (url, body) = match target.method {
        HttpMethod::Get => {
            let url = Url::parse_with_params(&target.url, params.query_pairs())
                .map_err(|e| anyhow!("Invalid webhook url {}: {}", target.url, e))?;
            (url.to_string(), None)
        }
        _ => (target.url.clone(), Some(serde_json::to_value(params)?)),
    };

    Ok(WebhookRequest {
        url,
        method: target.method,
        auth: target.auth.clone(),
        body,
    })
}

fn webhook_outcome(
    event: &NotificationEvent,
    target: &WebhookTarget,
    response: SenderResponse,
) -> Result<WebhookOutcome, Error> {
    let failed_at = (!response.is_delivered()).then(|| response.completed_at.timestamp_millis());

    Ok(WebhookOutcome {
        merchant_id: target.merchant_id,
        product_id: target.product_id,
        url: response.url,
        event_type: event.event_type.clone(),
        method: response.method,
        headers: response.request_headers,
        payload: serde_json::to_value(event)?,
        subscription_id: event.subscription_id.clone(),
        sent_at: response.sent_at.timestamp_millis(),
        response_status: response.status,
        response_body: response.body,
        duration: response.duration_ms,
        delivery_status: response.delivery_status,
        failed_at,
        error_message: response.error_message,
    })
}
