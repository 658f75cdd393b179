//! Notification Dispatch (C7): three channels behind one trait, a bounded
//! per-channel queue, and a delivery-attempt log, per §5 ("one dispatch
//! worker pool per channel").

pub mod dispatch;
pub mod email;
pub mod push;
pub mod webhook;

use async_trait::async_trait;

use crate::models::action::Action;

#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub tenant_id: uuid::Uuid,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub action: Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap, local validation of the action's shape (e.g. webhook URL
    /// scheme) — does not perform I/O.
    fn validate(&self, action: &Action) -> Result<(), String>;

    async fn dispatch(&self, event: &NotificationEvent) -> DeliveryStatus;
}
