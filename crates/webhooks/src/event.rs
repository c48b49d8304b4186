//! Typed envelope over raw webhook payloads.
//!
//! Payloads are stored byte-for-byte as JSON documents (that is what makes
//! replay and redelivery possible), but handler code should not work with
//! untyped maps. `WebhookEvent` is the boundary wrapper: source + event name
//! over the preserved document, with `classify()` projecting the payloads we
//! understand into typed shapes.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Which external system sent the webhook.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookSource {
    /// Payment provider (checkout sessions, refunds).
    Payments,
    /// Transactional email provider (deliveries, bounces).
    Email,
    /// External CRM pushing change notifications.
    Crm,
}

impl WebhookSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookSource::Payments => "payments",
            WebhookSource::Email => "email",
            WebhookSource::Crm => "crm",
        }
    }

    pub const ALL: [WebhookSource; 3] = [
        WebhookSource::Payments,
        WebhookSource::Email,
        WebhookSource::Crm,
    ];
}

impl std::fmt::Display for WebhookSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payments" => Ok(WebhookSource::Payments),
            "email" => Ok(WebhookSource::Email),
            "crm" => Ok(WebhookSource::Crm),
            other => Err(format!("unknown webhook source: {other}")),
        }
    }
}

/// A verified inbound webhook: source + event name over the raw document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub source: WebhookSource,
    pub event_name: String,
    /// Full original body, preserved unmodified for replay.
    pub payload: serde_json::Value,
}

impl WebhookEvent {
    pub fn new(
        source: WebhookSource,
        event_name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            source,
            event_name: event_name.into(),
            payload,
        }
    }

    /// Project the raw payload into a typed shape where we know one.
    ///
    /// Unknown events are not an error: they flow through handlers as
    /// `Unrecognized` and the handler decides what to do with them.
    pub fn classify(&self) -> EventKind {
        match (self.source, self.event_name.as_str()) {
            (WebhookSource::Payments, "checkout.completed") => {
                match serde_json::from_value(self.payload.clone()) {
                    Ok(p) => EventKind::CheckoutCompleted(p),
                    Err(_) => EventKind::Unrecognized,
                }
            }
            (WebhookSource::Email, "message.delivered") | (WebhookSource::Email, "message.bounced") => {
                match serde_json::from_value::<EmailStatus>(self.payload.clone()) {
                    Ok(p) => EventKind::EmailStatus(p),
                    Err(_) => EventKind::Unrecognized,
                }
            }
            (WebhookSource::Crm, "record.changed") => {
                match serde_json::from_value(self.payload.clone()) {
                    Ok(p) => EventKind::CrmRecordChanged(p),
                    Err(_) => EventKind::Unrecognized,
                }
            }
            _ => EventKind::Unrecognized,
        }
    }
}

/// Typed projections of the payloads this system understands.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    CheckoutCompleted(CheckoutCompleted),
    EmailStatus(EmailStatus),
    CrmRecordChanged(CrmRecordChanged),
    /// Event we have no typed shape for; the raw document is still available.
    Unrecognized,
}

/// Completed checkout session from the payment provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutCompleted {
    pub session_id: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    pub amount_cents: i64,
}

/// Delivery-status notification from the email provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailStatus {
    pub message_id: String,
    pub recipient: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// CRM change notification (the id of a record that changed upstream).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmRecordChanged {
    pub record_id: String,
}
