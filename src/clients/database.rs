use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::{Client, NoTls, Transaction, types::ToSql};
use tracing::{debug, error, info, warn};

use crate::{
    clients::{ProductStore, ResultStore},
    models::{
        outcome::{MerchantNotificationRow, RowBatch, SmsLogRow},
        retry::RetryConfig,
        webhook::{NotificationConfig, ProductNotificationConfig},
    },
    utils::retry_with_backoff,
};

const SMS_LOG_COLUMNS: [&str; 15] = [
    "msisdn",
    "message",
    "message_type",
    "related_subscription_id",
    "http_method",
    "request_url",
    "request_payload",
    "request_headers",
    "status",
    "error_code",
    "error_message",
    "provider",
    "provider_response",
    "sent_at",
    "delivered_at",
];

const MERCHANT_NOTIFICATION_COLUMNS: [&str; 15] = [
    "merchant_id",
    "product_id",
    "webhook_url",
    "event_type",
    "http_method",
    "headers",
    "payload",
    "related_order_id",
    "sent_at",
    "failed_at",
    "response_status_code",
    "response_body",
    "response_time_ms",
    "delivery_status",
    "error_message",
];

/// Keeps a single statement well under the 65535 bind parameter limit.
const ROWS_PER_STATEMENT: usize = 500;

pub struct PostgresStore {
    database_url: String,
    client: Mutex<Client>,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, retry_config: &RetryConfig) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let client = retry_with_backoff(retry_config, || Self::open(database_url)).await?;

        info!("PostgreSQL connection established");

        Ok(Self {
            database_url: database_url.to_string(),
            client: Mutex::new(client),
        })
    }

    async fn open(database_url: &str) -> Result<Client, Error> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection error");
            }
        });

        Ok(client)
    }

    /// Reopens the connection if the previous one has gone away.
    async fn client(&self) -> Result<MutexGuard<'_, Client>, Error> {
        let mut client = self.client.lock().await;
        if client.is_closed() {
            warn!("PostgreSQL connection closed, reconnecting");
            *client = Self::open(&self.database_url).await?;
        }
        Ok(client)
    }

    async fn insert_sms_logs(tx: &Transaction<'_>, rows: &[SmsLogRow]) -> Result<u64, Error> {
        let mut written = 0;

        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            let sql = insert_statement("sms_logs", &SMS_LOG_COLUMNS, chunk.len());

            let mut params: Vec<&(dyn ToSql + Sync)> =
                Vec::with_capacity(chunk.len() * SMS_LOG_COLUMNS.len());
            for row in chunk {
                let values: [&(dyn ToSql + Sync); 15] = [
                    &row.msisdn,
                    &row.message,
                    &row.message_type,
                    &row.related_subscription_id,
                    &row.http_method,
                    &row.request_url,
                    &row.request_payload,
                    &row.request_headers,
                    &row.status,
                    &row.error_code,
                    &row.error_message,
                    &row.provider,
                    &row.provider_response,
                    &row.sent_at,
                    &row.delivered_at,
                ];
                params.extend_from_slice(&values);
            }

            written += tx.execute(sql.as_str(), &params).await?;
        }

        Ok(written)
    }

    async fn insert_merchant_notifications(
        tx: &Transaction<'_>,
        rows: &[MerchantNotificationRow],
    ) -> Result<u64, Error> {
        let mut written = 0;

        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            let sql = insert_statement(
                "merchant_notifications",
                &MERCHANT_NOTIFICATION_COLUMNS,
                chunk.len(),
            );

            let mut params: Vec<&(dyn ToSql + Sync)> =
                Vec::with_capacity(chunk.len() * MERCHANT_NOTIFICATION_COLUMNS.len());
            for row in chunk {
                let values: [&(dyn ToSql + Sync); 15] = [
                    &row.merchant_id,
                    &row.product_id,
                    &row.webhook_url,
                    &row.event_type,
                    &row.http_method,
                    &row.headers,
                    &row.payload,
                    &row.related_order_id,
                    &row.sent_at,
                    &row.failed_at,
                    &row.response_status_code,
                    &row.response_body,
                    &row.response_time_ms,
                    &row.delivery_status,
                    &row.error_message,
                ];
                params.extend_from_slice(&values);
            }

            written += tx.execute(sql.as_str(), &params).await?;
        }

        Ok(written)
    }
}

fn insert_statement(table: &str, columns: &[&str], rows: usize) -> String {
    let width = columns.len();
    let values = (0..rows)
        .map(|row| {
            let placeholders = (1..=width)
                .map(|column| format!("${}", row * width + column))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({})", placeholders)
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        table,
        columns.join(", "),
        values
    )
}

#[async_trait]
impl ResultStore for PostgresStore {
    async fn create_many(&self, batch: RowBatch) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let kind = batch.kind();
        let mut client = self.client().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| anyhow!("Failed to open transaction: {}", e))?;

        let written = match &batch {
            RowBatch::SmsLogs(rows) => Self::insert_sms_logs(&tx, rows).await,
            RowBatch::MerchantNotifications(rows) => {
                Self::insert_merchant_notifications(&tx, rows).await
            }
        }
        .map_err(|e| anyhow!("Bulk insert of {} rows failed: {}", kind, e))?;

        tx.commit()
            .await
            .map_err(|e| anyhow!("Failed to commit {} rows: {}", kind, e))?;

        debug!(kind = %kind, count = written, "Bulk insert completed");
        Ok(written)
    }

    async fn health_check(&self) -> Result<()> {
        self.client()
            .await?
            .simple_query("SELECT 1")
            .await
            .map_err(|e| anyhow!("Database health check failed: {}", e))?;

        Ok(())
    }
}

#[async_trait]
impl ProductStore for PostgresStore {
    async fn find_notification_config(
        &self,
        keyword: &str,
    ) -> Result<Option<ProductNotificationConfig>> {
        let client = self.client().await?;

        let row = client
            .query_opt(
                "SELECT id, merchant_id, notification_config FROM products WHERE name = $1 LIMIT 1",
                &[&keyword],
            )
            .await
            .map_err(|e| anyhow!("Failed to look up product {}: {}", keyword, e))?;

        let Some(row) = row else {
            warn!(keyword = %keyword, "Product not found");
            return Ok(None);
        };

        let config: Option<JsonValue> = row.try_get("notification_config")?;
        let Some(config) = config else {
            warn!(keyword = %keyword, "No webhook config found for product");
            return Ok(None);
        };

        let config: NotificationConfig = serde_json::from_value(config)
            .map_err(|e| anyhow!("Invalid notification_config for product {}: {}", keyword, e))?;

        Ok(Some(ProductNotificationConfig {
            merchant_id: row.try_get("merchant_id")?,
            product_id: row.try_get("id")?,
            config,
        }))
    }
}
