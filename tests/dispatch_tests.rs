use anyhow::Result;
use async_trait::async_trait;
use notification_dispatcher::{
    clients::{
        ProductStore, SmsSender, WebhookConfigSource, WebhookSender, http::HttpClient,
        product::ProductService, sms::GpSmsSender, template::SmsTemplateService,
    },
    dispatch::{sms::SmsService, webhook::WebhookService},
    models::{
        event::{EventType, PaymentProvider},
        outcome::DeliveryStatus,
        webhook::{
            BasicAuth, HttpMethod, NotificationConfig, ProductNotificationConfig, WebhookRequest,
        },
    },
};
use serde_json::json;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{basic_auth, body_partial_json, method, path, path_regex, query_param},
};

use crate::support::{MemoryCache, sample_event};

const GP_PATH: &str = r"^/partner/smsmessaging/v2/outbound/tel:\+88022900/requests$";

fn http(timeout_ms: u64) -> HttpClient {
    HttpClient::new(Duration::from_millis(timeout_ms)).expect("client should build")
}

struct CountingProducts {
    lookups: AtomicU32,
    config: Option<ProductNotificationConfig>,
}

#[async_trait]
impl ProductStore for CountingProducts {
    async fn find_notification_config(
        &self,
        _keyword: &str,
    ) -> Result<Option<ProductNotificationConfig>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.config.clone())
    }
}

fn product_config(base_url: &str, method: HttpMethod) -> ProductNotificationConfig {
    ProductNotificationConfig {
        merchant_id: 3,
        product_id: 8,
        config: NotificationConfig {
            billing_notify_url: format!("{}/billing", base_url),
            unsubscription_notify_url: format!("{}/unsubscribe", base_url),
            method,
            auth_user: Some("merchant".to_string()),
            auth_password: Some("s3cret".to_string()),
        },
    }
}

/// Test: The GP sender posts the outbound request with basic auth
#[tokio::test]
async fn test_gp_sender_delivers() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(GP_PATH))
        .and(basic_auth("gp-user", "gp-pass"))
        .and(body_partial_json(json!({
            "outboundSMSMessageRequest": {
                "address": "tel:+8801700000000",
                "outboundSMSTextMessage": { "message": "hello" }
            }
        })))
        .respond_with(ResponseTemplate::new(201).set_body_string("{\"resourceURL\":\"x\"}"))
        .expect(1)
        .mount(&server)
        .await;

    let sender = GpSmsSender::new(http(1000), &server.uri(), "gp-user", "gp-pass");
    let response = sender.send("8801700000000", "hello").await?;

    assert_eq!(response.delivery_status, DeliveryStatus::Delivered);
    assert_eq!(response.status, 201);
    assert_eq!(response.method, "POST");
    assert!(response.error_code.is_none());
    assert_eq!(response.body.as_deref(), Some("{\"resourceURL\":\"x\"}"));
    assert_eq!(
        response.request_headers["Authorization"], "Basic gp***er",
        "Credentials must be redacted"
    );

    Ok(())
}

/// Test: A non-2xx gateway answer is a failed delivery with an HTTP error code
#[tokio::test]
async fn test_gp_sender_reports_http_failure() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let sender = GpSmsSender::new(http(1000), &server.uri(), "gp-user", "gp-pass");
    let response = sender.send("8801700000000", "hello").await?;

    assert_eq!(response.delivery_status, DeliveryStatus::Failed);
    assert_eq!(response.status, 503);
    assert_eq!(response.error_code.as_deref(), Some("HTTP_503"));
    assert_eq!(response.body.as_deref(), Some("maintenance"));

    Ok(())
}

/// Test: A gateway slower than the client timeout is reported as a timeout
#[tokio::test]
async fn test_gp_sender_reports_timeout() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let sender = GpSmsSender::new(http(100), &server.uri(), "gp-user", "gp-pass");
    let response = sender.send("8801700000000", "hello").await?;

    assert_eq!(response.delivery_status, DeliveryStatus::Timeout);
    assert_eq!(response.status, 0);
    assert_eq!(response.error_code.as_deref(), Some("ETIMEDOUT"));

    Ok(())
}

/// Test: An unreachable gateway is a failed delivery, not an error
#[tokio::test]
async fn test_unreachable_endpoint_is_failed_delivery() -> Result<()> {
    let response = http(500)
        .send_webhook(&WebhookRequest {
            url: "http://127.0.0.1:1/notify".to_string(),
            method: HttpMethod::Post,
            auth: None,
            body: Some(json!({})),
        })
        .await?;

    assert_eq!(response.delivery_status, DeliveryStatus::Failed);
    assert_eq!(response.status, 0);
    assert_eq!(response.error_code.as_deref(), Some("ECONNREFUSED"));

    Ok(())
}

/// Test: The SMS service renders the template and records the rendered body
#[tokio::test]
async fn test_sms_service_renders_and_sends() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(GP_PATH))
        .and(body_partial_json(json!({
            "outboundSMSMessageRequest": {
                "outboundSMSTextMessage": {
                    "message": "You have unsubscribed from GAMES. Subscription ID: sub-42"
                }
            }
        })))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let gp = GpSmsSender::new(http(1000), &server.uri(), "gp-user", "gp-pass");
    let service =
        SmsService::new(SmsTemplateService::default()).with_sender(PaymentProvider::Gp, Arc::new(gp));

    let outcome = service
        .send_notification_sms(&sample_event(EventType::UnsubscriptionSuccess, "sub-42"))
        .await?;

    assert_eq!(
        outcome.message_body,
        "You have unsubscribed from GAMES. Subscription ID: sub-42"
    );
    assert_eq!(outcome.delivery_status, DeliveryStatus::Delivered);
    assert_eq!(outcome.provider, PaymentProvider::Gp);
    assert!(outcome.delivered_at.is_some());

    Ok(())
}

/// Test: Events without a template are rejected before anything is sent
#[tokio::test]
async fn test_missing_template_is_an_error() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let gp = GpSmsSender::new(http(1000), &server.uri(), "gp-user", "gp-pass");
    let service =
        SmsService::new(SmsTemplateService::default()).with_sender(PaymentProvider::Gp, Arc::new(gp));

    let result = service
        .send_notification_sms(&sample_event(EventType::RenewFail, "sub-1"))
        .await;
    assert!(result.is_err());

    Ok(())
}

/// Test: A POST webhook carries the params as JSON with merchant auth
#[tokio::test]
async fn test_post_webhook_is_delivered() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/billing"))
        .and(basic_auth("merchant", "s3cret"))
        .and(body_partial_json(json!({
            "msisdn": "8801700000000",
            "shortcode": "GAMES",
            "operator": "GP",
            "billing_id": "mtx-sub-1",
            "event": "rebill",
            "status": "success",
            "order_tracking_id": "sub-1",
            "subscription_lifecycle": "Remaining"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .expect(1)
        .mount(&server)
        .await;

    let cache = Arc::new(MemoryCache::default());
    let products = Arc::new(CountingProducts {
        lookups: AtomicU32::new(0),
        config: Some(product_config(&server.uri(), HttpMethod::Post)),
    });
    let service = WebhookService::new(
        Arc::new(ProductService::new(products, cache, 900)),
        Arc::new(http(1000)),
    );

    let outcome = service
        .send_webhook_notification(&sample_event(EventType::RenewSuccess, "sub-1"))
        .await?
        .expect("target is configured");

    assert_eq!(outcome.delivery_status, DeliveryStatus::Delivered);
    assert_eq!(outcome.response_status, 200);
    assert_eq!(outcome.merchant_id, 3);
    assert_eq!(outcome.product_id, 8);
    assert_eq!(outcome.response_body.as_deref(), Some("OK"));
    assert!(outcome.failed_at.is_none());
    assert_eq!(outcome.payload["subscriptionId"], "sub-1");
    assert_eq!(outcome.payload["eventType"], "renew.success");

    Ok(())
}

/// Test: A GET webhook sends the params as a query string to the unsubscription url
#[tokio::test]
async fn test_get_webhook_uses_query_string() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/unsubscribe"))
        .and(query_param("event", "unsubscription"))
        .and(query_param("status", "success"))
        .and(query_param("subscription_lifecycle", "Ended"))
        .and(query_param("order_tracking_id", "sub-7"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let cache = Arc::new(MemoryCache::default());
    let products = Arc::new(CountingProducts {
        lookups: AtomicU32::new(0),
        config: Some(product_config(&server.uri(), HttpMethod::Get)),
    });
    let service = WebhookService::new(
        Arc::new(ProductService::new(products, cache, 900)),
        Arc::new(http(1000)),
    );

    let outcome = service
        .send_webhook_notification(&sample_event(EventType::UnsubscriptionSuccess, "sub-7"))
        .await?
        .expect("target is configured");

    assert_eq!(outcome.delivery_status, DeliveryStatus::Delivered);
    assert_eq!(outcome.method, "GET");

    Ok(())
}

/// Test: A failing merchant endpoint produces a failed outcome with failed_at
#[tokio::test]
async fn test_failed_webhook_outcome() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let cache = Arc::new(MemoryCache::default());
    let products = Arc::new(CountingProducts {
        lookups: AtomicU32::new(0),
        config: Some(product_config(&server.uri(), HttpMethod::Post)),
    });
    let service = WebhookService::new(
        Arc::new(ProductService::new(products, cache, 900)),
        Arc::new(http(1000)),
    );

    let outcome = service
        .send_webhook_notification(&sample_event(EventType::RenewFail, "sub-1"))
        .await?
        .expect("target is configured");

    assert_eq!(outcome.delivery_status, DeliveryStatus::Failed);
    assert_eq!(outcome.response_status, 500);
    assert!(outcome.failed_at.is_some());
    assert!(outcome.failed_at.unwrap_or_default() >= outcome.sent_at);

    Ok(())
}

/// Test: Webhook configuration is read from the store once, then served from cache
#[tokio::test]
async fn test_webhook_config_is_cached() -> Result<()> {
    let cache = Arc::new(MemoryCache::default());
    let products = Arc::new(CountingProducts {
        lookups: AtomicU32::new(0),
        config: Some(product_config("https://merchant.example", HttpMethod::Post)),
    });
    let source = ProductService::new(products.clone(), cache.clone(), 900);

    let first = source
        .webhook_target("GAMES", &EventType::RenewSuccess)
        .await?
        .expect("configured");
    let second = source
        .webhook_target("GAMES", &EventType::UnsubscriptionSuccess)
        .await?
        .expect("configured");

    assert_eq!(products.lookups.load(Ordering::SeqCst), 1, "Second lookup hits the cache");
    assert_eq!(first.url, "https://merchant.example/billing");
    assert_eq!(second.url, "https://merchant.example/unsubscribe");
    assert_eq!(
        first.auth,
        Some(BasicAuth {
            username: "merchant".to_string(),
            password: "s3cret".to_string()
        })
    );
    assert!(cache.value("product:webhook_config:GAMES").is_some());

    Ok(())
}

/// Test: Products without a notification config yield no target
#[tokio::test]
async fn test_unconfigured_product_has_no_target() -> Result<()> {
    let cache = Arc::new(MemoryCache::default());
    let products = Arc::new(CountingProducts {
        lookups: AtomicU32::new(0),
        config: None,
    });
    let source = ProductService::new(products, cache.clone(), 900);

    assert!(
        source
            .webhook_target("UNKNOWN", &EventType::RenewSuccess)
            .await?
            .is_none()
    );
    assert!(cache.value("product:webhook_config:UNKNOWN").is_none());

    Ok(())
}
