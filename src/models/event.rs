use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

/// Lifecycle notice published by the billing and renewal services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub id: String,
    pub source: String,
    pub subscription_id: String,
    pub merchant_transaction_id: String,
    pub keyword: String,
    pub msisdn: String,
    pub payment_provider: PaymentProvider,
    pub event_type: EventType,
    pub amount: f64,
    pub currency: String,
    pub billing_cycle_days: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,

    pub timestamp: i64,
}

/// Event types are a closed set on the producer side. Anything else is kept as
/// `Unknown` so that new producer events never fail decoding here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    RenewSuccess,
    RenewFail,
    SubscriptionSuccess,
    SubscriptionFail,
    SubscriptionCancel,
    UnsubscriptionSuccess,
    UnsubscriptionFail,
    PreRenewalAlert,
    Unknown(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::RenewSuccess => "renew.success",
            EventType::RenewFail => "renew.fail",
            EventType::SubscriptionSuccess => "subscription.success",
            EventType::SubscriptionFail => "subscription.fail",
            EventType::SubscriptionCancel => "subscription.cancel",
            EventType::UnsubscriptionSuccess => "unsubscription.success",
            EventType::UnsubscriptionFail => "unsubscription.fail",
            EventType::PreRenewalAlert => "pre.renewal.alert",
            EventType::Unknown(raw) => raw,
        }
    }

    /// `renew.success` -> (`renew`, `success`).
    pub fn split(&self) -> (&str, &str) {
        let raw = self.as_str();
        match raw.split_once('.') {
            Some((primary, rest)) => (primary, rest),
            None => (raw, ""),
        }
    }

    pub fn is_unsubscription(&self) -> bool {
        matches!(
            self,
            EventType::UnsubscriptionSuccess | EventType::UnsubscriptionFail
        )
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "renew.success" => EventType::RenewSuccess,
            "renew.fail" => EventType::RenewFail,
            "subscription.success" => EventType::SubscriptionSuccess,
            "subscription.fail" => EventType::SubscriptionFail,
            "subscription.cancel" => EventType::SubscriptionCancel,
            "unsubscription.success" => EventType::UnsubscriptionSuccess,
            "unsubscription.fail" => EventType::UnsubscriptionFail,
            "pre.renewal.alert" => EventType::PreRenewalAlert,
            _ => EventType::Unknown(value),
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        match value {
            EventType::Unknown(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PaymentProvider {
    Gp,
    Bl,
    Robi,
    RobiMife,
    Unknown(String),
}

impl PaymentProvider {
    pub fn as_str(&self) -> &str {
        match self {
            PaymentProvider::Gp => "GP",
            PaymentProvider::Bl => "BL",
            PaymentProvider::Robi => "ROBI",
            PaymentProvider::RobiMife => "ROBI_MIFE",
            PaymentProvider::Unknown(raw) => raw,
        }
    }
}

impl From<String> for PaymentProvider {
    fn from(value: String) -> Self {
        match value.as_str() {
            "GP" => PaymentProvider::Gp,
            "BL" => PaymentProvider::Bl,
            "ROBI" => PaymentProvider::Robi,
            "ROBI_MIFE" => PaymentProvider::RobiMife,
            _ => PaymentProvider::Unknown(value),
        }
    }
}

impl From<PaymentProvider> for String {
    fn from(value: PaymentProvider) -> Self {
        match value {
            PaymentProvider::Unknown(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl Display for PaymentProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}
