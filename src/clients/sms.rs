use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::{
    clients::{
        SmsSender,
        http::{HttpClient, OutboundCall},
    },
    models::{
        outcome::SenderResponse,
        webhook::{BasicAuth, HttpMethod},
    },
};

const GP_SENDER_ADDRESS: &str = "tel:+88022900";
const GP_SENDER_NAME: &str = "GP DOB";
const GP_MESSAGE_TYPE: &str = "ARN";

/// Grameenphone partner SMS gateway.
pub struct GpSmsSender {
    http: HttpClient,
    url: String,
    auth: BasicAuth,
}

impl GpSmsSender {
    pub fn new(http: HttpClient, base_url: &str, username: &str, password: &str) -> Self {
        Self {
            http,
            url: format!(
                "{}/partner/smsmessaging/v2/outbound/{}/requests",
                base_url.trim_end_matches('/'),
                GP_SENDER_ADDRESS
            ),
            auth: BasicAuth {
                username: username.to_string(),
                password: password.to_string(),
            },
        }
    }
}

#[async_trait]
impl SmsSender for GpSmsSender {
    async fn send(&self, msisdn: &str, body: &str) -> Result<SenderResponse> {
        let payload = json!({
            "outboundSMSMessageRequest": {
                "address": format!("tel:+{}", msisdn),
                "senderAddress": GP_SENDER_ADDRESS,
                "outboundSMSTextMessage": {
                    "message": body,
                },
                "senderName": GP_SENDER_NAME,
                "messageType": GP_MESSAGE_TYPE,
            }
        });

        Ok(self
            .http
            .execute(OutboundCall {
                method: HttpMethod::Post,
                url: &self.url,
                auth: Some(&self.auth),
                body: Some(&payload),
            })
            .await)
    }
}
