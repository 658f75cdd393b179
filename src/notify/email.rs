//! Email channel: `lettre` SMTP transport plus the 3-attempt exponential
//! backoff (5/25/125 s) §4.7 requires and a severity-styled HTML body.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::SmtpConfig;
use crate::models::action::Action;
use crate::notify::{Channel, DeliveryStatus, NotificationEvent};

const RETRY_BACKOFF_SECS: [u64; 3] = [5, 25, 125];

pub struct EmailChannel {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    from: String,
}

impl EmailChannel {
    pub fn new(cfg: &SmtpConfig) -> Self {
        let transport = build_transport(cfg);
        Self {
            transport,
            from: cfg.from.clone(),
        }
    }
}

fn build_transport(cfg: &SmtpConfig) -> Option<AsyncSmtpTransport<Tokio1Executor>> {
    let host = cfg.host.as_deref()?;
    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host).ok()?;
    builder = builder
        .port(cfg.port)
        .timeout(Some(std::time::Duration::from_secs(30)));
    if let (Some(user), Some(pass)) = (&cfg.user, &cfg.pass) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }
    Some(builder.build())
}

#[async_trait]
impl Channel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn validate(&self, action: &Action) -> Result<(), String> {
        match action {
            Action::Email { address } => {
                if address.contains('@') {
                    Ok(())
                } else {
                    Err(format!("invalid email address: {address}"))
                }
            }
            _ => Err("not an email action".to_string()),
        }
    }

    async fn dispatch(&self, event: &NotificationEvent) -> DeliveryStatus {
        let Some(transport) = &self.transport else {
            tracing::warn!("email channel not configured, dropping notification");
            return DeliveryStatus::Failed;
        };

        let message = match Message::builder()
            .from(
                self.from
                    .parse()
                    .unwrap_or_else(|_| "pipeline@localhost".parse().unwrap()),
            )
            .to(event
                .recipient
                .parse()
                .unwrap_or_else(|_| "noreply@localhost".parse().unwrap()))
            .subject(event.subject.clone())
            .header(ContentType::TEXT_HTML)
            .body(event.body.clone())
        {
            Ok(m) => m,
            Err(e) => {
                tracing::error!("failed to build email message: {e}");
                return DeliveryStatus::Failed;
            }
        };

        for (attempt, backoff) in RETRY_BACKOFF_SECS.iter().enumerate() {
            match transport.send(message.clone()).await {
                Ok(_) => return DeliveryStatus::Sent,
                Err(e) => {
                    tracing::warn!(
                        "email send attempt {} to {} failed: {e}",
                        attempt + 1,
                        event.recipient
                    );
                    if attempt + 1 < RETRY_BACKOFF_SECS.len() {
                        tokio::time::sleep(std::time::Duration::from_secs(*backoff)).await;
                    }
                }
            }
        }
        DeliveryStatus::Failed
    }
}
