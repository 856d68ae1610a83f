use std::time::{Duration, Instant};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};

use crate::{
    clients::WebhookSender,
    models::{
        outcome::{DeliveryStatus, SenderResponse},
        webhook::{BasicAuth, HttpMethod, WebhookRequest},
    },
    utils::redact,
};

/// One outbound JSON call.
#[derive(Debug, Clone)]
pub struct OutboundCall<'a> {
    pub method: HttpMethod,
    pub url: &'a str,
    pub auth: Option<&'a BasicAuth>,
    pub body: Option<&'a JsonValue>,
}

/// reqwest wrapper that turns every exchange, including transport failures,
/// into a [`SenderResponse`].
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self { client })
    }

    pub async fn execute(&self, call: OutboundCall<'_>) -> SenderResponse {
        let mut builder = self
            .client
            .request(reqwest_method(call.method), call.url)
            .header("Content-Type", "application/json");

        if let Some(auth) = call.auth {
            builder = builder.basic_auth(&auth.username, Some(&auth.password));
        }
        if let Some(body) = call.body {
            builder = builder.json(body);
        }

        let request_headers = recorded_headers(call.auth);
        let request_payload = call.body.cloned().unwrap_or(JsonValue::Null);

        let sent_at = Utc::now();
        let started = Instant::now();
        let result = builder.send().await;

        let (status, body, error_code, error_message, delivery_status) = match result {
            Ok(response) => {
                let status = response.status();
                let body = match response.text().await {
                    Ok(text) => Some(text),
                    Err(e) => {
                        warn!(url = %call.url, error = %e, "Failed to read response body");
                        None
                    }
                };

                if status.is_success() {
                    (status.as_u16(), body, None, None, DeliveryStatus::Delivered)
                } else {
                    (
                        status.as_u16(),
                        body,
                        Some(format!("HTTP_{}", status.as_u16())),
                        Some(format!("Endpoint returned status {}", status)),
                        DeliveryStatus::Failed,
                    )
                }
            }
            Err(e) if e.is_timeout() => (
                0,
                None,
                Some("ETIMEDOUT".to_string()),
                Some(e.to_string()),
                DeliveryStatus::Timeout,
            ),
            Err(e) => {
                let code = if e.is_connect() { "ECONNREFUSED" } else { "EREQUEST" };
                (
                    0,
                    None,
                    Some(code.to_string()),
                    Some(e.to_string()),
                    DeliveryStatus::Failed,
                )
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            method = %call.method,
            url = %call.url,
            status,
            duration_ms,
            delivery_status = delivery_status.as_str(),
            "Outbound request finished"
        );

        SenderResponse {
            method: call.method.as_str().to_string(),
            url: call.url.to_string(),
            request_headers,
            request_payload,
            status,
            body,
            error_code,
            error_message,
            sent_at,
            completed_at: Utc::now(),
            duration_ms,
            delivery_status,
        }
    }
}

fn reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Delete => Method::DELETE,
    }
}

/// Headers as stored with the outcome. Credentials never leave the process.
fn recorded_headers(auth: Option<&BasicAuth>) -> JsonValue {
    match auth {
        Some(auth) => json!({
            "Content-Type": "application/json",
            "Authorization": format!("Basic {}", redact(&auth.username)),
        }),
        None => json!({ "Content-Type": "application/json" }),
    }
}

#[async_trait]
impl WebhookSender for HttpClient {
    async fn send_webhook(&self, request: &WebhookRequest) -> Result<SenderResponse> {
        Ok(self
            .execute(OutboundCall {
                method: request.method,
                url: &request.url,
                auth: request.auth.as_ref(),
                body: request.body.as_ref(),
            })
            .await)
    }
}
