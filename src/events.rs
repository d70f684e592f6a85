use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    bots::BotId,
    orders::{OrderId, Priority},
};

/// A state transition inside the dispatcher, published on its broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    OrderSubmitted { order_id: OrderId, priority: Priority },
    OrderStarted { order_id: OrderId, bot_id: BotId },
    OrderCompleted { order_id: OrderId, bot_id: BotId },
    OrderRequeued { order_id: OrderId, bot_id: BotId },
    BotAdded { bot_id: BotId },
    BotRemoved { bot_id: BotId },
}

impl fmt::Display for DispatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchEvent::OrderSubmitted { order_id, priority } => {
                write!(f, "new {priority} order #{order_id} is PENDING")
            }
            DispatchEvent::OrderStarted { order_id, bot_id } => {
                write!(f, "bot #{bot_id} started order #{order_id}")
            }
            DispatchEvent::OrderCompleted { order_id, bot_id } => {
                write!(f, "bot #{bot_id} completed order #{order_id}")
            }
            DispatchEvent::OrderRequeued { order_id, bot_id } => {
                write!(f, "order #{order_id} returned to PENDING (bot #{bot_id} stopped)")
            }
            DispatchEvent::BotAdded { bot_id } => write!(f, "bot #{bot_id} added"),
            DispatchEvent::BotRemoved { bot_id } => write!(f, "bot #{bot_id} removed"),
        }
    }
}
