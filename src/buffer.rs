use std::sync::Arc;

use anyhow::{Error, Result};
use serde::Serialize;
use tracing::debug;

use crate::{clients::SharedCache, models::outcome::ResultKind};

/// FIFO lists of serialized outcomes, one per result kind, drained by the
/// batch flushers.
#[derive(Clone)]
pub struct ResultBuffer {
    cache: Arc<dyn SharedCache>,
    sms_key: String,
    webhook_key: String,
}

impl ResultBuffer {
    pub fn new(cache: Arc<dyn SharedCache>, sms_key: &str, webhook_key: &str) -> Self {
        Self {
            cache,
            sms_key: sms_key.to_string(),
            webhook_key: webhook_key.to_string(),
        }
    }

    pub fn key(&self, kind: ResultKind) -> &str {
        match kind {
            ResultKind::Sms => &self.sms_key,
            ResultKind::Webhook => &self.webhook_key,
        }
    }

    pub async fn push<T: Serialize + Sync>(&self, kind: ResultKind, outcome: &T) -> Result<(), Error> {
        let raw = serde_json::to_string(outcome)?;
        let len = self.cache.rpush(self.key(kind), &raw).await?;
        debug!(kind = %kind, buffered = len, "Outcome buffered");
        Ok(())
    }

    pub async fn pop(&self, kind: ResultKind) -> Result<Option<String>, Error> {
        self.cache.lpop(self.key(kind)).await
    }

    pub async fn len(&self, kind: ResultKind) -> Result<u64, Error> {
        self.cache.llen(self.key(kind)).await
    }
}
