use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    clock::{Clock, TimerCallback, TimerToken},
    errors::{DispatchError, DispatchResult},
    orders::{Order, OrderId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BotId(pub u64);

impl fmt::Display for BotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotStatus {
    Idle,
    Busy,
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BotStatus::Idle => f.write_str("IDLE"),
            BotStatus::Busy => f.write_str("BUSY"),
        }
    }
}

/// A worker slot.
///
/// A bot is `Busy` exactly while `current_order` is set. The armed completion
/// timer is kept so that [`Bot::stop`] can cancel it; it is not part of the
/// serialized view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bot {
    pub id: BotId,
    pub status: BotStatus,
    pub current_order: Option<OrderId>,
    #[serde(skip)]
    timer: Option<TimerToken>,
}

impl Bot {
    pub fn new(id: BotId) -> Self {
        Self {
            id,
            status: BotStatus::Idle,
            current_order: None,
            timer: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == BotStatus::Idle
    }

    fn illegal(&self, action: &'static str) -> DispatchError {
        DispatchError::InvalidTransition {
            entity: "bot",
            id: self.id.0,
            action,
            state: match self.current_order {
                Some(order) => format!("{} with order #{}", self.status, order),
                None => self.status.to_string(),
            },
        }
    }

    /// IDLE -> BUSY. Marks `order` as processing and arms `on_complete` to run
    /// after `duration`.
    pub(crate) fn assign(
        &mut self,
        order: &mut Order,
        clock: &dyn Clock,
        duration: Duration,
        on_complete: TimerCallback,
    ) -> DispatchResult<TimerToken> {
        if !self.is_idle() {
            return Err(self.illegal("assign"));
        }
        order.start(self.id)?;
        self.status = BotStatus::Busy;
        self.current_order = Some(order.id);
        let token = clock.after(duration, on_complete);
        self.timer = Some(token);
        Ok(token)
    }

    /// BUSY -> IDLE, only if the bot is still working on `order` and on the
    /// same `attempt` the finishing timer was armed for. A bot that was stopped
    /// and handed the same order again must not be completed by the old timer.
    pub(crate) fn complete(&mut self, order: &mut Order, attempt: u32) -> DispatchResult<()> {
        if self.current_order != Some(order.id) || order.attempts != attempt {
            return Err(self.illegal("complete"));
        }
        order.complete(self.id)?;
        self.status = BotStatus::Idle;
        self.current_order = None;
        self.timer = None;
        Ok(())
    }

    /// Cancels any in-flight work and hands back the interrupted order id.
    /// The caller is responsible for returning that order to its lane.
    pub(crate) fn stop(&mut self, clock: &dyn Clock) -> Option<OrderId> {
        if let Some(token) = self.timer.take() {
            clock.cancel(token);
        }
        self.status = BotStatus::Idle;
        self.current_order.take()
    }
}
