use std::{collections::HashMap, sync::Arc};

use anyhow::{Error, Result};
use tracing::{error, info};

use crate::{
    clients::{SmsSender, template::SmsTemplateService},
    error::DispatchError,
    models::{
        event::{NotificationEvent, PaymentProvider},
        outcome::{SenderResponse, SmsOutcome},
    },
};

/// Renders the SMS for an event and hands it to the provider's gateway.
pub struct SmsService {
    templates: SmsTemplateService,
    senders: HashMap<PaymentProvider, Arc<dyn SmsSender>>,
}

impl SmsService {
    pub fn new(templates: SmsTemplateService) -> Self {
        Self {
            templates,
            senders: HashMap::new(),
        }
    }

    pub fn with_sender(mut self, provider: PaymentProvider, sender: Arc<dyn SmsSender>) -> Self {
        self.senders.insert(provider, sender);
        self
    }

    pub async fn send_notification_sms(&self, event: &NotificationEvent) -> Result<SmsOutcome, Error> {
        match self.dispatch(event).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(
                    subscription_id = %event.subscription_id,
                    provider = %event.payment_provider,
                    error = %e,
                    "SMS notification failed"
                );
                Err(e)
            }
        }
    }

    async fn dispatch(&self, event: &NotificationEvent) -> Result<SmsOutcome, Error> {
        let template = self
            .templates
            .get_template(&event.event_type, &event.payment_provider)?;
        let body = self
            .templates
            .render(template, &SmsTemplateService::variables_for(event))?;

        let sender = self
            .senders
            .get(&event.payment_provider)
            .ok_or_else(|| DispatchError::UnconfiguredProvider(event.payment_provider.clone()))?;

        let response = sender.send(&event.msisdn, &body).await?;

        info!(
            subscription_id = %event.subscription_id,
            provider = %event.payment_provider,
            status = response.status,
            delivery_status = response.delivery_status.as_str(),
            "SMS dispatched"
        );

        Ok(sms_outcome(event, body, response))
    }
}

fn sms_outcome(event: &NotificationEvent, body: String, response: SenderResponse) -> SmsOutcome {
    let delivered_at = response.is_delivered().then_some(response.completed_at);

    SmsOutcome {
        subscription_id: event.subscription_id.clone(),
        msisdn: event.msisdn.clone(),
        message_type: event.event_type.clone(),
        message_body: body,
        provider: event.payment_provider.clone(),
        method: response.method,
        url: response.url,
        request_headers: response.request_headers,
        request_payload: response.request_payload,
        response_status: response.status,
        response: response.body,
        error_code: response.error_code,
        error_message: response.error_message,
        sent_at: Some(response.sent_at),
        delivered_at,
        delivery_status: response.delivery_status,
    }
}
