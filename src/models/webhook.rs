use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

use crate::models::event::{EventType, NotificationEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl Display for HttpMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}

/// `products.notification_config` as stored by the merchant portal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub billing_notify_url: String,
    pub unsubscription_notify_url: String,
    pub method: HttpMethod,

    #[serde(default)]
    pub auth_user: Option<String>,

    #[serde(default)]
    pub auth_password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductNotificationConfig {
    pub merchant_id: i32,
    pub product_id: i32,
    pub config: NotificationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Where and how a merchant wants to hear about one event type.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookTarget {
    pub merchant_id: i32,
    pub product_id: i32,
    pub url: String,
    pub method: HttpMethod,
    pub auth: Option<BasicAuth>,
}

impl ProductNotificationConfig {
    pub fn target_for(&self, event_type: &EventType) -> WebhookTarget {
        let url = if event_type.is_unsubscription() {
            self.config.unsubscription_notify_url.clone()
        } else {
            self.config.billing_notify_url.clone()
        };

        let auth = match (&self.config.auth_user, &self.config.auth_password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some(BasicAuth {
                    username: username.clone(),
                    password: password.clone(),
                })
            }
            _ => None,
        };

        WebhookTarget {
            merchant_id: self.merchant_id,
            product_id: self.product_id,
            url,
            method: self.config.method,
            auth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEvent {
    Subscription,
    Unsubscription,
    Rebill,
    Unknown,
}

impl WebhookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::Subscription => "subscription",
            WebhookEvent::Unsubscription => "unsubscription",
            WebhookEvent::Rebill => "rebill",
            WebhookEvent::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookRequestParams {
    pub msisdn: String,
    pub shortcode: String,
    pub operator: String,
    pub billing_id: String,
    pub tariff: f64,
    pub event: WebhookEvent,
    pub status: String,
    pub order_tracking_id: String,
    pub reason: String,
    pub subscription_lifecycle: String,
}

impl WebhookRequestParams {
    pub fn from_event(event: &NotificationEvent) -> Self {
        let (primary, status) = event.event_type.split();

        let webhook_event = match primary {
            "subscription" => WebhookEvent::Subscription,
            "unsubscription" => WebhookEvent::Unsubscription,
            "renew" => WebhookEvent::Rebill,
            _ => WebhookEvent::Unknown,
        };

        let lifecycle = if event.event_type == EventType::UnsubscriptionSuccess {
            "Ended"
        } else {
            "Remaining"
        };

        Self {
            msisdn: event.msisdn.clone(),
            shortcode: event.keyword.clone(),
            operator: event.payment_provider.to_string(),
            billing_id: event.merchant_transaction_id.clone(),
            tariff: event.amount,
            event: webhook_event,
            status: status.to_string(),
            order_tracking_id: event.subscription_id.clone(),
            reason: String::new(),
            subscription_lifecycle: lifecycle.to_string(),
        }
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("msisdn", self.msisdn.clone()),
            ("shortcode", self.shortcode.clone()),
            ("operator", self.operator.clone()),
            ("billing_id", self.billing_id.clone()),
            ("tariff", self.tariff.to_string()),
            ("event", self.event.as_str().to_string()),
            ("status", self.status.clone()),
            ("order_tracking_id", self.order_tracking_id.clone()),
            ("reason", self.reason.clone()),
            ("subscription_lifecycle", self.subscription_lifecycle.clone()),
        ]
    }
}

/// A fully built outbound webhook call.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub url: String,
    pub method: HttpMethod,
    pub auth: Option<BasicAuth>,
    pub body: Option<serde_json::Value>,
}
