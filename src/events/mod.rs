use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Domain events emitted by the checkout flow, always after the owning
/// transaction has committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
        total_amount: i64,
    },
    PaymentSessionRequested {
        order_id: Uuid,
        attempt_id: Uuid,
        provider: String,
    },
    PaymentSessionFailed {
        order_id: Uuid,
        attempt_id: Uuid,
        reason: String,
    },
    OrderPaid {
        order_id: Uuid,
        order_number: String,
        transaction_id: String,
    },
    OrderPaymentFailed {
        order_id: Uuid,
        attempt_id: Uuid,
        reason: String,
    },
    OrderCancelled {
        order_id: Uuid,
        order_number: String,
    },
    CouponRedeemed {
        code: String,
        order_id: Uuid,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::PaymentSessionRequested { .. } => "payment_session_requested",
            Event::PaymentSessionFailed { .. } => "payment_session_failed",
            Event::OrderPaid { .. } => "order_paid",
            Event::OrderPaymentFailed { .. } => "order_payment_failed",
            Event::OrderCancelled { .. } => "order_cancelled",
            Event::CouponRedeemed { .. } => "coupon_redeemed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends and logs on failure; a lost event never fails the caller.
    pub async fn send_or_log(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.send(event).await {
            warn!(event = name, error = %e, "dropping domain event");
        }
    }
}

/// Consumer-side hook for domain events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &Event) -> Result<(), String>;
}

/// Default handler: structured log line per event.
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle_event(&self, event: &Event) -> Result<(), String> {
        match event {
            Event::OrderCreated {
                order_id,
                order_number,
                total_amount,
            } => info!(%order_id, %order_number, total_amount, "order created"),
            Event::PaymentSessionRequested {
                order_id,
                attempt_id,
                provider,
            } => info!(%order_id, %attempt_id, %provider, "payment session requested"),
            Event::PaymentSessionFailed {
                order_id,
                attempt_id,
                reason,
            } => warn!(%order_id, %attempt_id, %reason, "payment session request failed"),
            Event::OrderPaid {
                order_id,
                order_number,
                transaction_id,
            } => info!(%order_id, %order_number, %transaction_id, "order paid"),
            Event::OrderPaymentFailed {
                order_id,
                attempt_id,
                reason,
            } => warn!(%order_id, %attempt_id, %reason, "order payment failed"),
            Event::OrderCancelled {
                order_id,
                order_number,
            } => info!(%order_id, %order_number, "order cancelled"),
            Event::CouponRedeemed { code, order_id } => {
                info!(%code, %order_id, "coupon redeemed")
            }
        }
        Ok(())
    }
}

/// Drains the channel, handing each event to every handler in turn.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Arc<dyn EventHandler>>) {
    info!("Starting event processing loop");
    while let Some(event) = rx.recv().await {
        for handler in &handlers {
            if let Err(e) = handler.handle_event(&event).await {
                error!(event = event.name(), error = %e, "event handler failed");
            }
        }
    }
    warn!("Event processing loop has ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<Event>>);

    #[async_trait]
    impl EventHandler for Recording {
        async fn handle_event(&self, event: &Event) -> Result<(), String> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn events_reach_every_handler() {
        let (tx, rx) = mpsc::channel(8);
        let recording = Arc::new(Recording(Mutex::new(Vec::new())));
        let handlers: Vec<Arc<dyn EventHandler>> =
            vec![Arc::new(LoggingEventHandler), recording.clone()];
        let worker = tokio::spawn(process_events(rx, handlers));

        let sender = EventSender::new(tx);
        let event = Event::OrderCancelled {
            order_id: Uuid::new_v4(),
            order_number: "ORD-20261018-123456".into(),
        };
        sender.send_or_log(event.clone()).await;
        drop(sender);
        worker.await.unwrap();

        assert_eq!(recording.0.lock().unwrap().as_slice(), &[event]);
    }

    #[tokio::test]
    async fn send_or_log_survives_a_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        EventSender::new(tx)
            .send_or_log(Event::CouponRedeemed {
                code: "SAVE10".into(),
                order_id: Uuid::new_v4(),
            })
            .await;
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let value = serde_json::to_value(Event::CouponRedeemed {
            code: "SAVE10".into(),
            order_id: Uuid::nil(),
        })
        .unwrap();
        assert_eq!(value["type"], "coupon_redeemed");
    }
}
