//! The `Dispatcher`: resolves actions, builds `NotificationEvent`s, and
//! routes them onto one bounded queue + worker pool per channel (§5 "one
//! dispatch worker pool per channel").

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::config_db::ConfigDb;
use crate::models::action::{Action, ActionRecord};
use crate::models::alert::Alert;
use crate::notify::email::EmailChannel;
use crate::notify::push::{PushChannel, PushRegistry};
use crate::notify::webhook::WebhookChannel;
use crate::notify::{Channel, DeliveryStatus, NotificationEvent};

const QUEUE_CAPACITY: usize = 1024;
const WORKERS_PER_CHANNEL: usize = 4;

pub struct Dispatcher {
    config_db: Arc<ConfigDb>,
    email_tx: mpsc::Sender<NotificationEvent>,
    webhook_tx: mpsc::Sender<NotificationEvent>,
    push_tx: mpsc::Sender<NotificationEvent>,
    push_registry: Arc<PushRegistry>,
}

impl Dispatcher {
    pub fn new(config_db: Arc<ConfigDb>, config: &PipelineConfig) -> Self {
        let push_registry = Arc::new(PushRegistry::new());

        let email_tx = spawn_worker_pool(
            Arc::new(EmailChannel::new(&config.smtp)),
            config_db.clone(),
        );
        let webhook_tx = spawn_worker_pool(
            Arc::new(WebhookChannel::new(&config.webhook)),
            config_db.clone(),
        );
        let push_tx = spawn_worker_pool(
            Arc::new(PushChannel::new(push_registry.clone())),
            config_db.clone(),
        );

        Self {
            config_db,
            email_tx,
            webhook_tx,
            push_tx,
            push_registry,
        }
    }

    pub fn push_registry(&self) -> Arc<PushRegistry> {
        self.push_registry.clone()
    }

    fn enqueue(&self, action: &ActionRecord, event: NotificationEvent) {
        let tx = match &action.action {
            Action::Email { .. } => &self.email_tx,
            Action::Webhook { .. } => &self.webhook_tx,
            Action::Push { .. } => &self.push_tx,
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    action_id = %action.id,
                    "dispatch queue saturated, dropping notification (backpressure)"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!(action_id = %action.id, "dispatch worker pool is gone");
            }
        }
    }

    fn event_for(action: &ActionRecord, alert: &Alert, subject: String, body: String) -> NotificationEvent {
        let recipient = match &action.action {
            Action::Email { address } => address.clone(),
            Action::Webhook { url, .. } => url.clone(),
            Action::Push { channel } => channel.clone(),
        };
        NotificationEvent {
            tenant_id: alert.tenant_id,
            recipient,
            subject,
            body,
            action: action.action.clone(),
        }
    }

    fn actions_for_alert(&self, alert: &Alert) -> Vec<ActionRecord> {
        let Some(rule_id) = alert.rule_id else {
            return Vec::new();
        };
        let Ok(Some(rule)) = self.config_db.get_rule(rule_id) else {
            return Vec::new();
        };
        self.config_db.get_actions(&rule.action_ids).unwrap_or_default()
    }

    /// Called by `alert_core` on a first-in-group alert create (§4.7, §4.5
    /// notify_on=first).
    pub async fn notify_alert_created(&self, alert: &Alert) {
        let subject = format!("[{}] Alert: {}", alert.severity.as_str(), alert.message);
        let body = format!(
            "Alert {} fired for device {} at {}.\n\n{}",
            alert.id, alert.device_id, alert.created_at, alert.message
        );
        for action in self.actions_for_alert(alert) {
            let event = Self::event_for(&action, alert, subject.clone(), body.clone());
            self.enqueue(&action, event);
        }
    }

    /// Called by the SLA sweep when TTA or TTR is breached (§4.5).
    pub async fn notify_sla_breached(&self, alert_id: Uuid, tenant_id: Uuid) {
        let Ok(Some(alert)) = self.config_db.get_alert(alert_id) else {
            return;
        };
        let subject = format!("[{}] SLA breached: alert {}", alert.severity.as_str(), alert_id);
        let body = format!("Alert {alert_id} for tenant {tenant_id} has breached its SLA target.");
        for action in self.actions_for_alert(&alert) {
            let event = Self::event_for(&action, &alert, subject.clone(), body.clone());
            self.enqueue(&action, event);
        }
    }

    /// Called by `escalation` when a tier fires (§4.6). `recipients` are the
    /// resolved on-call/role identifiers, recorded in the delivery attempt
    /// for audit but not substituted into the action's own configured
    /// destination (an action's address/url/channel is fixed at creation
    /// time; recipient resolution here answers "who is on call", logged
    /// alongside the send, not "send to this literal address instead").
    pub async fn notify_escalation_tier(
        &self,
        tenant_id: Uuid,
        alert_id: Uuid,
        channel_action_ids: &[Uuid],
        recipients: &[String],
    ) {
        let Ok(Some(alert)) = self.config_db.get_alert(alert_id) else {
            return;
        };
        let Ok(actions) = self.config_db.get_actions(channel_action_ids) else {
            return;
        };
        let subject = format!("[{}] Escalation: alert {}", alert.severity.as_str(), alert_id);
        let body = format!(
            "Alert {alert_id} for tenant {tenant_id} is still open and has escalated.\nOn-call: {}",
            if recipients.is_empty() { "unassigned".to_string() } else { recipients.join(", ") }
        );
        for action in actions {
            let event = Self::event_for(&action, &alert, subject.clone(), body.clone());
            self.enqueue(&action, event);
        }
    }
}

fn spawn_worker_pool(channel: Arc<dyn Channel>, config_db: Arc<ConfigDb>) -> mpsc::Sender<NotificationEvent> {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    for _ in 0..WORKERS_PER_CHANNEL {
        let channel = channel.clone();
        let config_db = config_db.clone();
        let rx = rx.clone();
        tokio::spawn(async move {
            loop {
                let event = {
                    let mut guard = rx.lock().await;
                    guard.recv().await
                };
                let Some(event) = event else {
                    break;
                };
                let status = channel.dispatch(&event).await;
                let (status_str, error) = match status {
                    DeliveryStatus::Sent => ("sent", None),
                    DeliveryStatus::Failed => ("failed", Some("delivery failed after retries")),
                };
                if let Err(e) = config_db.record_delivery_attempt(
                    event.tenant_id,
                    channel.name(),
                    &event.recipient,
                    status_str,
                    error,
                ) {
                    tracing::error!("failed to record delivery attempt: {e:#}");
                }
            }
        });
    }
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::rule::Severity;

    #[tokio::test]
    async fn queue_full_drops_without_panicking() {
        let config_db = Arc::new(ConfigDb::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new(config_db, &PipelineConfig::default());
        let alert = Alert {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            rule_id: None,
            source: Some("test".to_string()),
            device_id: Uuid::new_v4(),
            severity: Severity::Critical,
            message: "test alert".to_string(),
            metadata: Default::default(),
            created_at: chrono::Utc::now(),
        };
        // No rule_id means no configured actions to resolve; this should be
        // a no-op rather than a panic.
        dispatcher.notify_alert_created(&alert).await;
    }
}
