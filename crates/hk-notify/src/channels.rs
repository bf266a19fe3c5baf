//! Channel adapters.
//!
//! Each enabled channel gets one adapter implementing [`ChannelAdapter`].
//! The messenger adapter talks to the bot platform through a transport trait
//! (the concrete client lives with the gateway); email and SMS reduce to
//! no-ops when disabled by configuration.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::template::{Channel, RenderedMessage};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Worth retrying with backoff.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Never retried (blocked recipient, malformed address).
    #[error("permanent delivery failure: {0}")]
    Permanent(String),

    /// The channel is disabled by configuration; dispatch becomes a no-op.
    #[error("channel disabled")]
    Disabled,
}

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    async fn deliver(
        &self,
        recipient: &str,
        message: &RenderedMessage,
    ) -> Result<(), DeliveryError>;
}

// ---------------------------------------------------------------------------
// Messenger
// ---------------------------------------------------------------------------

/// Markup mode declared on every outgoing messenger message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Html,
    Markdown,
}

impl ParseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseMode::Html => "HTML",
            ParseMode::Markdown => "MarkdownV2",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The recipient blocked the bot; delivery can never succeed.
    #[error("recipient blocked the sender")]
    Blocked,

    #[error("transport rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("transport failure: {0}")]
    Other(String),
}

/// The wire client for the bot platform.
#[async_trait]
pub trait MessengerTransport: Send + Sync {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        parse_mode: ParseMode,
    ) -> Result<(), TransportError>;
}

/// Messenger delivery with an optional best-effort broadcast mirror.
pub struct MessengerAdapter {
    transport: std::sync::Arc<dyn MessengerTransport>,
    parse_mode: ParseMode,
    /// Auxiliary channel that mirrors broadcasts; failures there are logged,
    /// never propagated.
    broadcast_mirror: Option<String>,
}

impl MessengerAdapter {
    pub fn new(
        transport: std::sync::Arc<dyn MessengerTransport>,
        parse_mode: ParseMode,
        broadcast_mirror: Option<String>,
    ) -> Self {
        Self {
            transport,
            parse_mode,
            broadcast_mirror,
        }
    }

    fn compose(message: &RenderedMessage) -> String {
        match &message.title {
            Some(title) => format!("{title}\n\n{}", message.body),
            None => message.body.clone(),
        }
    }
}

#[async_trait]
impl ChannelAdapter for MessengerAdapter {
    fn channel(&self) -> Channel {
        Channel::Messenger
    }

    async fn deliver(
        &self,
        recipient: &str,
        message: &RenderedMessage,
    ) -> Result<(), DeliveryError> {
        let text = Self::compose(message);

        let result = self
            .transport
            .send_message(recipient, &text, self.parse_mode)
            .await;

        match result {
            Ok(()) => {
                if let Some(mirror) = &self.broadcast_mirror {
                    if let Err(e) = self
                        .transport
                        .send_message(mirror, &text, self.parse_mode)
                        .await
                    {
                        warn!(mirror, error = %e, "broadcast mirror failed");
                    }
                }
                Ok(())
            }
            Err(TransportError::Blocked) => {
                debug!(recipient, "recipient blocked the bot");
                Err(DeliveryError::Permanent("recipient blocked".into()))
            }
            Err(TransportError::RateLimited { retry_after_secs }) => Err(
                DeliveryError::Transient(format!("rate limited for {retry_after_secs}s")),
            ),
            Err(TransportError::Other(why)) => Err(DeliveryError::Transient(why)),
        }
    }
}

// ---------------------------------------------------------------------------
// Email / SMS
// ---------------------------------------------------------------------------

/// The outbound mail seam; the SMTP client lives with the deployment.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send_mail(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), TransportError>;
}

pub struct EmailAdapter {
    transport: Option<std::sync::Arc<dyn MailTransport>>,
}

impl EmailAdapter {
    /// `None` transport means the channel is disabled by configuration.
    pub fn new(transport: Option<std::sync::Arc<dyn MailTransport>>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn deliver(
        &self,
        recipient: &str,
        message: &RenderedMessage,
    ) -> Result<(), DeliveryError> {
        let Some(transport) = &self.transport else {
            return Err(DeliveryError::Disabled);
        };

        let subject = message.title.as_deref().unwrap_or("Housekeep");
        transport
            .send_mail(recipient, subject, &message.body)
            .await
            .map_err(|e| match e {
                TransportError::Blocked => DeliveryError::Permanent("address rejected".into()),
                other => DeliveryError::Transient(other.to_string()),
            })
    }
}

/// The SMS gateway seam.
#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send_sms(&self, recipient: &str, body: &str) -> Result<(), TransportError>;
}

pub struct SmsAdapter {
    transport: Option<std::sync::Arc<dyn SmsTransport>>,
}

impl SmsAdapter {
    pub fn new(transport: Option<std::sync::Arc<dyn SmsTransport>>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ChannelAdapter for SmsAdapter {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn deliver(
        &self,
        recipient: &str,
        message: &RenderedMessage,
    ) -> Result<(), DeliveryError> {
        let Some(transport) = &self.transport else {
            return Err(DeliveryError::Disabled);
        };

        transport
            .send_sms(recipient, &message.body)
            .await
            .map_err(|e| match e {
                TransportError::Blocked => DeliveryError::Permanent("number rejected".into()),
                other => DeliveryError::Transient(other.to_string()),
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, String)>>,
        block: bool,
        fail_mirror: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MessengerTransport for RecordingTransport {
        async fn send_message(
            &self,
            chat_id: &str,
            text: &str,
            _parse_mode: ParseMode,
        ) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.block {
                return Err(TransportError::Blocked);
            }
            if self.fail_mirror && chat_id.starts_with('@') {
                return Err(TransportError::Other("mirror down".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((chat_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    fn message() -> RenderedMessage {
        RenderedMessage {
            title: None,
            body: "Заявка 250927-001 принята.".into(),
        }
    }

    #[tokio::test]
    async fn messenger_delivers() {
        let transport = Arc::new(RecordingTransport::default());
        let adapter = MessengerAdapter::new(transport.clone(), ParseMode::Html, None);

        adapter.deliver("111", &message()).await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "111");
    }

    #[tokio::test]
    async fn blocked_recipient_is_permanent() {
        let transport = Arc::new(RecordingTransport {
            block: true,
            ..Default::default()
        });
        let adapter = MessengerAdapter::new(transport, ParseMode::Html, None);

        let err = adapter.deliver("111", &message()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Permanent(_)));
    }

    #[tokio::test]
    async fn broadcast_mirror_is_best_effort() {
        let transport = Arc::new(RecordingTransport {
            fail_mirror: true,
            ..Default::default()
        });
        let adapter = MessengerAdapter::new(
            transport.clone(),
            ParseMode::Html,
            Some("@ops-mirror".into()),
        );

        // Mirror failure does not fail the delivery.
        adapter.deliver("111", &message()).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_email_reports_disabled() {
        let adapter = EmailAdapter::new(None);
        let err = adapter.deliver("a@b.c", &message()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Disabled));
    }

    #[tokio::test]
    async fn title_prepends_on_messenger() {
        let transport = Arc::new(RecordingTransport::default());
        let adapter = MessengerAdapter::new(transport.clone(), ParseMode::Html, None);

        let msg = RenderedMessage {
            title: Some("Новая заявка".into()),
            body: "детали".into(),
        };
        adapter.deliver("111", &msg).await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert!(sent[0].1.starts_with("Новая заявка\n\n"));
    }
}
