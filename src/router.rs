//! Event type to dispatch action mapping.
//!
//! The table is static and total over the known event types. Unknown types map
//! to no actions so that producers can introduce new events before this
//! service knows about them.

use tracing::warn;

use crate::models::{
    event::{EventType, NotificationEvent},
    job::QueueKind,
};

/// Billing cycles longer than this get a renewal SMS.
pub const CONDITIONAL_SMS_MIN_CYCLE_DAYS: u32 = 7;

/// Used for event types without an explicit priority.
pub const DEFAULT_PRIORITY: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAction {
    Sms,
    Webhook,
    /// SMS only when `billing_cycle_days > CONDITIONAL_SMS_MIN_CYCLE_DAYS`.
    ConditionalSms,
}

pub fn actions_for(event_type: &EventType) -> &'static [DispatchAction] {
    use DispatchAction::*;

    match event_type {
        EventType::RenewSuccess => &[ConditionalSms, Webhook],
        EventType::RenewFail => &[Webhook],
        EventType::SubscriptionSuccess => &[Sms, Webhook],
        EventType::SubscriptionFail => &[Webhook],
        EventType::SubscriptionCancel => &[Webhook],
        EventType::UnsubscriptionSuccess => &[Sms, Webhook],
        EventType::UnsubscriptionFail => &[],
        EventType::PreRenewalAlert => &[Sms],
        EventType::Unknown(_) => &[],
    }
}

/// Lower is serviced first.
pub fn priority_for(event_type: &EventType) -> u32 {
    match event_type {
        EventType::RenewSuccess | EventType::RenewFail => 10,
        EventType::SubscriptionSuccess
        | EventType::SubscriptionFail
        | EventType::SubscriptionCancel
        | EventType::UnsubscriptionSuccess
        | EventType::UnsubscriptionFail => 1,
        EventType::PreRenewalAlert => 5,
        EventType::Unknown(_) => DEFAULT_PRIORITY,
    }
}

/// Resolves the actions for one event into the queues it must be enqueued on,
/// in table order.
pub fn route(event: &NotificationEvent) -> Vec<QueueKind> {
    if let EventType::Unknown(raw) = &event.event_type {
        warn!(
            event_type = %raw,
            subscription_id = %event.subscription_id,
            "Unhandled notification event type or no actions defined"
        );
        return Vec::new();
    }

    actions_for(&event.event_type)
        .iter()
        .filter_map(|action| match action {
            DispatchAction::Sms => Some(QueueKind::Sms),
            DispatchAction::Webhook => Some(QueueKind::Webhook),
            DispatchAction::ConditionalSms => {
                (event.billing_cycle_days > CONDITIONAL_SMS_MIN_CYCLE_DAYS).then_some(QueueKind::Sms)
            }
        })
        .collect()
}
