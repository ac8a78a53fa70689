use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH};
use taberna_shared::domain::{PushBatchResult, PushOutcome};
use taberna_shared::vapid::{VapidClaims, VapidError, VapidKey};
use tracing::{debug, info, warn};

use crate::storage::{StorageError, Store, models::PushSubscription};

use super::config::PushConfig;

/// Lifetime of the VAPID token attached to each request.
const TOKEN_LIFETIME_HOURS: i64 = 12;

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push: VAPID private key is not configured")]
    MissingKey,
    #[error("push: {0}")]
    Vapid(#[from] VapidError),
    #[error("push: {0}")]
    Storage(#[from] StorageError),
    #[error("push: HTTP client: {0}")]
    Client(String),
}

/// What happened to one subscription within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    Deleted,
    Unknown,
}

#[derive(Clone)]
pub struct PushSender {
    inner: Arc<PushSenderInner>,
}

struct PushSenderInner {
    client: reqwest::Client,
    store: Store,
    vapid_private: Option<String>,
    subject: String,
    ttl_seconds: u32,
    chunk_size: i64,
    concurrency: usize,
}

impl PushSender {
    /// `None` when push is not configured or switched off. Key problems are
    /// reported per batch by [`PushSender::send_batch`].
    pub fn from_config(cfg: Option<&PushConfig>, store: Store) -> Result<Option<Self>, PushError> {
        let Some(push_cfg) = cfg else {
            return Ok(None);
        };
        if !push_cfg.enabled {
            return Ok(None);
        }
        Self::new(push_cfg, store).map(Some)
    }

    pub fn new(cfg: &PushConfig, store: Store) -> Result<Self, PushError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| PushError::Client(e.to_string()))?;
        let vapid_private = cfg
            .vapid_private
            .clone()
            .filter(|k| !k.trim().is_empty());
        Ok(Self {
            inner: Arc::new(PushSenderInner {
                client,
                store,
                vapid_private,
                subject: cfg.subject.clone(),
                ttl_seconds: cfg.ttl_seconds,
                chunk_size: cfg.chunk_size.max(1),
                concurrency: cfg.concurrency.max(1),
            }),
        })
    }

    /// Sends an empty-body push to the given subscriptions. Per-subscription
    /// failures only show up in the counters; the batch fails as a whole only
    /// when the signing key is unusable or the subscriptions cannot be read.
    pub async fn send_batch(
        &self,
        subscription_ids: &[i32],
        now: DateTime<Utc>,
    ) -> Result<PushBatchResult, PushError> {
        let key = self.inner.signing_key()?;
        let subscriptions = self.inner.store.get_push_subscriptions(subscription_ids).await?;

        let mut result = PushBatchResult {
            total: subscriptions.len(),
            ..Default::default()
        };
        let inner = &self.inner;
        let key = &key;
        let mut deliveries = stream::iter(subscriptions)
            .map(|sub| async move { inner.deliver(key, sub, now).await })
            .buffer_unordered(inner.concurrency);
        while let Some(delivery) = deliveries.next().await {
            match delivery {
                Delivery::Sent => result.sent += 1,
                Delivery::Deleted => result.deleted += 1,
                Delivery::Unknown => {}
            }
        }

        info!(
            sent = result.sent,
            deleted = result.deleted,
            total = result.total,
            "push: batch done"
        );
        Ok(result)
    }

    /// Walks every stored subscription in id order, `chunk_size` at a time.
    pub async fn send_to_all(&self, now: DateTime<Utc>) -> Result<PushBatchResult, PushError> {
        // Fail before touching storage when the key is unusable.
        self.inner.signing_key()?;
        let mut totals = PushBatchResult::default();
        let mut after_id = 0;
        loop {
            let ids = self
                .inner
                .store
                .list_push_subscription_ids(after_id, self.inner.chunk_size)
                .await?;
            let Some(&last) = ids.last() else {
                break;
            };
            after_id = last;
            totals += self.send_batch(&ids, now).await?;
            if (ids.len() as i64) < self.inner.chunk_size {
                break;
            }
        }
        Ok(totals)
    }
}

impl PushSenderInner {
    fn signing_key(&self) -> Result<VapidKey, PushError> {
        let private = self.vapid_private.as_deref().ok_or(PushError::MissingKey)?;
        Ok(VapidKey::from_base64(private)?)
    }

    async fn deliver(
        &self,
        key: &VapidKey,
        subscription: PushSubscription,
        now: DateTime<Utc>,
    ) -> Delivery {
        let endpoint = subscription.endpoint.as_str();
        let audience = match endpoint_origin(endpoint) {
            Ok(aud) => aud,
            Err(err) => {
                warn!(subscription_id = subscription.id, endpoint = %endpoint, error = %err, "push: bad endpoint");
                return Delivery::Unknown;
            }
        };
        let claims = VapidClaims {
            aud: audience,
            exp: (now + chrono::Duration::hours(TOKEN_LIFETIME_HOURS)).timestamp(),
            sub: self.subject.clone(),
        };
        let authorization = match key.authorization(&claims) {
            Ok(v) => v,
            Err(err) => {
                warn!(subscription_id = subscription.id, error = %err, "push: signing failed");
                return Delivery::Unknown;
            }
        };

        let response = self
            .client
            .post(endpoint)
            .header("TTL", self.ttl_seconds.to_string())
            .header(AUTHORIZATION, authorization)
            .header(CONTENT_LENGTH, "0")
            .send()
            .await;
        let status = match response {
            Ok(resp) => resp.status().as_u16(),
            Err(err) => {
                warn!(subscription_id = subscription.id, endpoint = %endpoint, error = %err, "push: send failed");
                return Delivery::Unknown;
            }
        };

        match PushOutcome::from_status(status) {
            PushOutcome::Sent => {
                debug!(subscription_id = subscription.id, status, "push: delivered");
                Delivery::Sent
            }
            PushOutcome::Gone => match self.store.delete_push_subscription(subscription.id).await {
                Ok(_) => {
                    info!(subscription_id = subscription.id, endpoint = %endpoint, status, "push: removed stale subscription");
                    Delivery::Deleted
                }
                Err(err) => {
                    warn!(
                        subscription_id = subscription.id,
                        endpoint = %endpoint,
                        error = %err,
                        "push: failed to remove stale subscription"
                    );
                    Delivery::Unknown
                }
            },
            PushOutcome::Unknown => {
                warn!(subscription_id = subscription.id, endpoint = %endpoint, status, "push: unexpected status");
                Delivery::Unknown
            }
        }
    }
}

/// `scheme://host[:port]` of a push endpoint, the audience of its token.
pub fn endpoint_origin(endpoint: &str) -> Result<String, url::ParseError> {
    let origin = url::Url::parse(endpoint)?.origin();
    if !origin.is_tuple() {
        return Err(url::ParseError::EmptyHost);
    }
    Ok(origin.ascii_serialization())
}
