use std::collections::HashMap;

use anyhow::{Error, Result, anyhow};
use tracing::{debug, warn};

use crate::{
    error::DispatchError,
    models::event::{EventType, NotificationEvent, PaymentProvider},
};

/// Provider key matching every provider without its own template.
const ANY_PROVIDER: &str = "*";

/// SMS bodies keyed by event type and provider, with `{{name}}` placeholders.
pub struct SmsTemplateService {
    templates: HashMap<(String, String), String>,
}

impl Default for SmsTemplateService {
    fn default() -> Self {
        let mut service = Self {
            templates: HashMap::new(),
        };

        service.insert(
            EventType::SubscriptionSuccess,
            None,
            "You have subscribed to {{keyword}}. {{currency}} {{amount}} will be charged every \
             {{billingCycleDays}} days. Subscription ID: {{subscriptionId}}",
        );
        service.insert(
            EventType::UnsubscriptionSuccess,
            None,
            "You have unsubscribed from {{keyword}}. Subscription ID: {{subscriptionId}}",
        );
        service.insert(
            EventType::RenewSuccess,
            None,
            "Your {{keyword}} subscription has been renewed for {{currency}} {{amount}}. \
             Subscription ID: {{subscriptionId}}",
        );
        service.insert(
            EventType::PreRenewalAlert,
            None,
            "Your {{keyword}} subscription renews soon for {{currency}} {{amount}}. \
             Subscription ID: {{subscriptionId}}",
        );

        service
    }
}

impl SmsTemplateService {
    /// `provider = None` registers the fallback for every provider.
    pub fn insert(&mut self, event_type: EventType, provider: Option<PaymentProvider>, body: &str) {
        let provider = provider
            .map(String::from)
            .unwrap_or_else(|| ANY_PROVIDER.to_string());
        self.templates
            .insert((event_type.into(), provider), body.to_string());
    }

    pub fn get_template(
        &self,
        event_type: &EventType,
        provider: &PaymentProvider,
    ) -> Result<&str, DispatchError> {
        let event = event_type.as_str().to_string();

        self.templates
            .get(&(event.clone(), provider.as_str().to_string()))
            .or_else(|| self.templates.get(&(event, ANY_PROVIDER.to_string())))
            .map(String::as_str)
            .ok_or_else(|| DispatchError::MissingTemplate {
                event_type: event_type.to_string(),
                provider: provider.to_string(),
            })
    }

    pub fn variables_for(event: &NotificationEvent) -> HashMap<String, String> {
        HashMap::from([
            ("amount".to_string(), format!("{:.2}", event.amount)),
            ("subscriptionId".to_string(), event.subscription_id.clone()),
            ("keyword".to_string(), event.keyword.clone()),
            ("msisdn".to_string(), event.msisdn.clone()),
            ("currency".to_string(), event.currency.clone()),
            (
                "billingCycleDays".to_string(),
                event.billing_cycle_days.to_string(),
            ),
        ])
    }

    pub fn render(&self, template: &str, variables: &HashMap<String, String>) -> Result<String, Error> {
        let mut result = template.to_string();

        for (key, value) in variables {
            let placeholder = format!("{{{{{}}}}}", key);
            result = result.replace(&placeholder, value);
        }

        if let Some(start) = result.find("{{") {
            if let Some(len) = result[start..].find("}}") {
                let missing = &result[start..start + len + 2];
                warn!(missing_variable = %missing, "Template contains unreplaced variable");
                return Err(anyhow!("Missing variable in template: {}", missing));
            }
        }

        debug!(length = result.len(), "Template rendered");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_specific_templates_win_over_the_fallback() {
        let mut service = SmsTemplateService::default();
        service.insert(EventType::RenewSuccess, Some(PaymentProvider::Gp), "GP {{amount}}");

        assert_eq!(
            service
                .get_template(&EventType::RenewSuccess, &PaymentProvider::Gp)
                .unwrap(),
            "GP {{amount}}"
        );
        assert!(
            service
                .get_template(&EventType::RenewSuccess, &PaymentProvider::Bl)
                .unwrap()
                .starts_with("Your {{keyword}}")
        );
    }

    #[test]
    fn missing_templates_are_reported() {
        let service = SmsTemplateService::default();
        let err = service
            .get_template(&EventType::RenewFail, &PaymentProvider::Gp)
            .unwrap_err();

        assert!(matches!(err, DispatchError::MissingTemplate { .. }));
    }

    #[test]
    fn render_replaces_every_occurrence_and_rejects_leftovers() {
        let service = SmsTemplateService::default();
        let variables = HashMap::from([("amount".to_string(), "5.00".to_string())]);

        assert_eq!(
            service.render("{{amount}} / {{amount}}", &variables).unwrap(),
            "5.00 / 5.00"
        );
        assert!(service.render("{{amount}} {{keyword}}", &variables).is_err());
    }
}
