use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::config::{MailConfig, MailDriver};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailMessage {
    pub to: String,
    pub to_name: String,
    pub subject: String,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("mail transport error: {0}")]
    Transport(String),
    #[error("mail relay answered {0}")]
    Status(u16),
    #[error("mail render error: {0}")]
    Render(String),
    #[error("mail queue is closed")]
    QueueClosed,
    #[error("mail config error: {0}")]
    Config(String),
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: MailMessage) -> Result<(), MailError>;
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl MailTransport for LogMailer {
    async fn send(&self, message: MailMessage) -> Result<(), MailError> {
        info!(
            to = %message.to,
            subject = %message.subject,
            bytes = message.text.len(),
            "mail: log driver"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    from: &'a str,
    to: &'a str,
    to_name: &'a str,
    subject: &'a str,
    text: &'a str,
}

/// Hands messages to an HTTP mail relay as JSON.
#[derive(Clone)]
pub struct RelayMailer {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    from: String,
}

impl RelayMailer {
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        from: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, MailError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MailError::Config(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            token,
            from: from.into(),
        })
    }
}

#[async_trait]
impl MailTransport for RelayMailer {
    async fn send(&self, message: MailMessage) -> Result<(), MailError> {
        let body = RelayRequest {
            from: &self.from,
            to: &message.to,
            to_name: &message.to_name,
            subject: &message.subject,
            text: &message.text,
        };
        let mut req = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(MailError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Accepts messages into a bounded queue; a background worker delivers them
/// through the wrapped transport. Delivery failures are logged by the worker.
#[derive(Clone)]
pub struct QueuedMailer {
    tx: mpsc::Sender<MailMessage>,
}

impl QueuedMailer {
    /// The worker stops once every `QueuedMailer` clone is dropped and the
    /// queue is drained.
    pub fn spawn(inner: Arc<dyn MailTransport>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<MailMessage>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let to = message.to.clone();
                if let Err(err) = inner.send(message).await {
                    warn!(recipient = %to, error = %err, "mail: queued delivery failed");
                }
            }
        });
        (Self { tx }, handle)
    }
}

#[async_trait]
impl MailTransport for QueuedMailer {
    async fn send(&self, message: MailMessage) -> Result<(), MailError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| MailError::QueueClosed)
    }
}

/// Builds the configured transport. The returned handle belongs to the
/// queue worker when `mail.queue` is on.
pub fn from_config(
    cfg: &MailConfig,
) -> Result<(Arc<dyn MailTransport>, Option<JoinHandle<()>>), MailError> {
    let base: Arc<dyn MailTransport> = match cfg.driver {
        MailDriver::Log => Arc::new(LogMailer),
        MailDriver::Relay => {
            let url = cfg
                .relay_url
                .clone()
                .ok_or_else(|| MailError::Config("mail.relay_url missing".into()))?;
            Arc::new(RelayMailer::new(
                url,
                cfg.relay_token.clone(),
                cfg.from.clone(),
                Duration::from_secs(cfg.timeout_secs),
            )?)
        }
    };
    if cfg.queue {
        let (queued, handle) = QueuedMailer::spawn(base, cfg.queue_capacity);
        Ok((Arc::new(queued), Some(handle)))
    } else {
        Ok((base, None))
    }
}
