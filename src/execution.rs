// =============================================================================
// Execution Gateway — routes order placements by execution mode
// =============================================================================
//
// Paper and replay modes publish the intent on the orders subject and let the
// paper broker fill it; live mode submits through the venue REST client. The
// idempotency key (`order_link_id`) is supplied by the caller and is stable
// across retries in both legs.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bus::MessageBus;
use crate::exchange::{BracketOrder, ExchangeClient};
use crate::types::{Mode, OrderIntent, OrderSide, OrderType};

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

/// Outcome of a placement attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RouteResult {
    /// Intent published to the orders subject (paper / replay).
    Routed(String),
    /// Order placed on the venue (live); carries the venue order id.
    Placed(String),
    /// An error occurred during routing or placement.
    Error(String),
}

impl std::fmt::Display for RouteResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Routed(id) => write!(f, "Routed({id})"),
            Self::Placed(id) => write!(f, "Placed({id})"),
            Self::Error(err) => write!(f, "Error({err})"),
        }
    }
}

impl RouteResult {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Error(_))
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Mode-aware order placement.
pub struct ExecutionGateway {
    mode: Mode,
    client_id: String,
    bus: Arc<dyn MessageBus>,
    orders_subject: String,
    exchange: Arc<dyn ExchangeClient>,
}

impl ExecutionGateway {
    pub fn new(
        mode: Mode,
        client_id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        orders_subject: impl Into<String>,
        exchange: Arc<dyn ExchangeClient>,
    ) -> Self {
        Self {
            mode,
            client_id: client_id.into(),
            bus,
            orders_subject: orders_subject.into(),
            exchange,
        }
    }

    /// Submit a bracketed market order (entry + protective exits).
    pub async fn submit_bracket(&self, order: &BracketOrder) -> RouteResult {
        info!(
            symbol = %order.symbol,
            side = %order.side,
            qty = order.qty,
            take_profit = ?order.take_profit,
            stop_loss = ?order.stop_loss,
            order_link_id = %order.order_link_id,
            mode = %self.mode,
            "order placement requested"
        );

        match self.mode {
            Mode::Live => self.place_live(order).await,
            Mode::Paper | Mode::Replay => self.publish_intent(order).await,
        }
    }

    /// Submit a reduce-only market exit for an open long.
    pub async fn submit_reduce_only_exit(
        &self,
        symbol: &str,
        qty: f64,
        order_link_id: String,
    ) -> RouteResult {
        let order = BracketOrder {
            symbol: symbol.to_string(),
            side: OrderSide::Sell,
            qty,
            take_profit: None,
            stop_loss: None,
            trigger_by: Default::default(),
            position_idx: 0,
            order_link_id,
            reduce_only: true,
        };
        self.submit_bracket(&order).await
    }

    // -------------------------------------------------------------------------
    // Paper / replay leg
    // -------------------------------------------------------------------------

    async fn publish_intent(&self, order: &BracketOrder) -> RouteResult {
        let intent = OrderIntent {
            id: order.order_link_id.clone(),
            client_id: self.client_id.clone(),
            symbol: order.symbol.clone(),
            order_type: OrderType::Market,
            side: order.side,
            price: None,
            // Stop echoed for audit; the simulator fills the entry only.
            stop_price: order.stop_loss,
            quantity: order.qty,
            reduce_only: order.reduce_only,
            timestamp: Utc::now(),
            is_shadow: false,
        };

        let payload = match serde_json::to_vec(&intent) {
            Ok(p) => p,
            Err(e) => return RouteResult::Error(format!("intent serialisation failed: {e}")),
        };

        match self.bus.publish(&self.orders_subject, payload).await {
            Ok(()) => RouteResult::Routed(intent.id),
            Err(e) => {
                warn!(error = %e, "intent publication failed");
                RouteResult::Error(format!("intent publication failed: {e}"))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Live leg
    // -------------------------------------------------------------------------

    async fn place_live(&self, order: &BracketOrder) -> RouteResult {
        match self.exchange.place_bracket_market(order).await {
            Ok(order_id) => {
                info!(
                    symbol = %order.symbol,
                    order_id = %order_id,
                    "live order placed"
                );
                RouteResult::Placed(order_id)
            }
            Err(e) => {
                warn!(symbol = %order.symbol, error = %e, "live order placement failed");
                RouteResult::Error(format!("order placement failed: {e}"))
            }
        }
    }
}

impl std::fmt::Debug for ExecutionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionGateway")
            .field("mode", &self.mode)
            .field("orders_subject", &self.orders_subject)
            .finish()
    }
}
