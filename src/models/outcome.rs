use std::fmt::{Display, Formatter};

use anyhow::{Error, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::models::event::{EventType, PaymentProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Sms,
    Webhook,
}

impl Display for ResultKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultKind::Sms => write!(f, "sms"),
            ResultKind::Webhook => write!(f, "webhook"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
    Timeout,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Timeout => "timeout",
        }
    }
}

/// What a sender observed for one outbound HTTP exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderResponse {
    pub method: String,
    pub url: String,
    pub request_headers: JsonValue,
    pub request_payload: JsonValue,
    /// 0 when no response was received.
    pub status: u16,
    pub body: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub delivery_status: DeliveryStatus,
}

impl SenderResponse {
    pub fn is_delivered(&self) -> bool {
        self.delivery_status == DeliveryStatus::Delivered
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsOutcome {
    pub subscription_id: String,
    pub msisdn: String,
    pub message_type: EventType,
    pub message_body: String,
    pub provider: PaymentProvider,
    pub method: String,
    pub url: String,
    pub request_headers: JsonValue,
    pub request_payload: JsonValue,
    pub response_status: u16,
    pub response: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub delivery_status: DeliveryStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookOutcome {
    pub merchant_id: i32,
    pub product_id: i32,
    pub url: String,
    pub event_type: EventType,
    pub method: String,
    pub headers: JsonValue,
    pub payload: JsonValue,
    pub subscription_id: String,
    /// Epoch millis.
    pub sent_at: i64,
    pub response_status: u16,
    pub response_body: Option<String>,
    pub duration: u64,
    pub delivery_status: DeliveryStatus,
    pub failed_at: Option<i64>,
    pub error_message: Option<String>,
}

/// Insert shape for `sms_logs`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmsLogRow {
    pub msisdn: String,
    pub message: String,
    pub message_type: String,
    pub related_subscription_id: String,
    pub http_method: String,
    pub request_url: String,
    pub request_payload: JsonValue,
    pub request_headers: JsonValue,
    pub status: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub provider: String,
    pub provider_response: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl From<SmsOutcome> for SmsLogRow {
    fn from(outcome: SmsOutcome) -> Self {
        Self {
            msisdn: outcome.msisdn,
            message: outcome.message_body,
            message_type: outcome.message_type.into(),
            related_subscription_id: outcome.subscription_id,
            http_method: outcome.method,
            request_url: outcome.url,
            request_payload: outcome.request_payload,
            request_headers: outcome.request_headers,
            status: outcome.response_status.to_string(),
            error_code: outcome.error_code,
            error_message: outcome.error_message,
            provider: outcome.provider.into(),
            provider_response: outcome.response,
            sent_at: outcome.sent_at,
            delivered_at: outcome.delivered_at,
        }
    }
}

/// Insert shape for `merchant_notifications`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MerchantNotificationRow {
    pub merchant_id: i32,
    pub product_id: i32,
    pub webhook_url: String,
    pub event_type: String,
    pub http_method: String,
    pub headers: JsonValue,
    pub payload: JsonValue,
    pub related_order_id: String,
    pub sent_at: DateTime<Utc>,
    pub failed_at: Option<DateTime<Utc>>,
    pub response_status_code: i32,
    pub response_body: Option<String>,
    pub response_time_ms: i32,
    pub delivery_status: String,
    pub error_message: Option<String>,
}

impl TryFrom<WebhookOutcome> for MerchantNotificationRow {
    type Error = Error;

    fn try_from(outcome: WebhookOutcome) -> Result<Self, Self::Error> {
        let sent_at = DateTime::from_timestamp_millis(outcome.sent_at)
            .ok_or_else(|| anyhow!("sentAt {} is not a valid timestamp", outcome.sent_at))?;

        let failed_at = outcome
            .failed_at
            .map(|millis| {
                DateTime::from_timestamp_millis(millis)
                    .ok_or_else(|| anyhow!("failedAt {} is not a valid timestamp", millis))
            })
            .transpose()?;

        Ok(Self {
            merchant_id: outcome.merchant_id,
            product_id: outcome.product_id,
            webhook_url: outcome.url,
            event_type: outcome.event_type.into(),
            http_method: outcome.method,
            headers: outcome.headers,
            payload: outcome.payload,
            related_order_id: outcome.subscription_id,
            sent_at,
            failed_at,
            response_status_code: i32::from(outcome.response_status),
            response_body: outcome.response_body,
            response_time_ms: i32::try_from(outcome.duration).unwrap_or(i32::MAX),
            delivery_status: outcome.delivery_status.as_str().to_string(),
            error_message: outcome.error_message,
        })
    }
}

/// One bulk insert.
#[derive(Debug, Clone, PartialEq)]
pub enum RowBatch {
    SmsLogs(Vec<SmsLogRow>),
    MerchantNotifications(Vec<MerchantNotificationRow>),
}

impl RowBatch {
    pub fn empty(kind: ResultKind) -> Self {
        match kind {
            ResultKind::Sms => RowBatch::SmsLogs(Vec::new()),
            ResultKind::Webhook => RowBatch::MerchantNotifications(Vec::new()),
        }
    }

    pub fn kind(&self) -> ResultKind {
        match self {
            RowBatch::SmsLogs(_) => ResultKind::Sms,
            RowBatch::MerchantNotifications(_) => ResultKind::Webhook,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RowBatch::SmsLogs(rows) => rows.len(),
            RowBatch::MerchantNotifications(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes one buffered entry and appends its row.
    pub fn push_raw(&mut self, raw: &str) -> Result<()> {
        match self {
            RowBatch::SmsLogs(rows) => {
                let outcome: SmsOutcome = serde_json::from_str(raw)?;
                rows.push(SmsLogRow::from(outcome));
            }
            RowBatch::MerchantNotifications(rows) => {
                let outcome: WebhookOutcome = serde_json::from_str(raw)?;
                rows.push(MerchantNotificationRow::try_from(outcome)?);
            }
        }
        Ok(())
    }
}
