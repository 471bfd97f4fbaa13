use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use eventide::saga::{resolve_by_field, Saga, SagaDefinition, SagaLifecycle};
use eventide::{Aggregate, CommandBus, CommandEnvelope, Error, Event};

use crate::domain::{Order, OrderCommand, OrderEvent, Payment, PaymentCommand, PaymentEvent};

/// Charges every placed order, then confirms or cancels it depending on the payment outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSaga {
    lifecycle: SagaLifecycle,
    charged: bool,
}

impl CheckoutSaga {
    pub fn definition() -> SagaDefinition<Self> {
        SagaDefinition::builder()
            .saga_type("CheckoutSaga")
            .start_topics(vec!["OrderPlaced".into()])
            .on_topics(vec!["PaymentAccepted".into(), "PaymentRefused".into()])
            .end_topics(vec!["OrderConfirmed".into(), "OrderCancelled".into()])
            .factory(Arc::new(|lifecycle: SagaLifecycle| CheckoutSaga {
                lifecycle,
                charged: false,
            }))
            .resolver(resolve_by_field("order_id"))
            .build()
    }

    fn order_id(&self) -> String {
        self.lifecycle.correlation_id().to_string()
    }
}

async fn send<A: Aggregate>(commands: &dyn CommandBus, command: &A::Command) -> Result<(), Error> {
    commands.dispatch(CommandEnvelope::for_aggregate::<A>(command)?).await?;
    Ok(())
}

#[async_trait]
impl Saga for CheckoutSaga {
    fn lifecycle(&self) -> &SagaLifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut SagaLifecycle {
        &mut self.lifecycle
    }

    async fn handle_event(&mut self, event: &Event, commands: &dyn CommandBus) -> Result<(), Error> {
        if event.aggregate_type().as_str() == Order::TYPE {
            // Confirmation and cancellation only end the saga.
            if let OrderEvent::OrderPlaced { order_id, amount } = event.decode::<OrderEvent>()? {
                if !self.charged {
                    let command = PaymentCommand::Charge {
                        payment_id: format!("payment-{order_id}"),
                        order_id,
                        amount,
                    };
                    send::<Payment>(commands, &command).await?;
                    self.charged = true;
                }
            }
            return Ok(());
        }

        let command = match event.decode::<PaymentEvent>()? {
            PaymentEvent::PaymentAccepted { .. } => OrderCommand::ConfirmOrder {
                order_id: self.order_id(),
            },
            PaymentEvent::PaymentRefused { reason, .. } => OrderCommand::CancelOrder {
                order_id: self.order_id(),
                reason,
            },
        };
        send::<Order>(commands, &command).await
    }
}
