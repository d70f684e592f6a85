use thiserror::Error;

use crate::{bots::BotId, orders::OrderId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unsupported priority: `{0}`")]
    UnsupportedPriority(String),

    #[error("bot pool is full ({max} bots)")]
    CapacityReached { max: usize },

    #[error("cannot {action} {entity} #{id} while {state}")]
    InvalidTransition {
        entity: &'static str,
        id: u64,
        action: &'static str,
        state: String,
    },

    #[error("unknown bot #{0}")]
    UnknownBot(BotId),

    #[error("unknown order #{0}")]
    UnknownOrder(OrderId),
}

pub type DispatchResult<T> = Result<T, DispatchError>;
