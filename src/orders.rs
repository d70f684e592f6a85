use std::{fmt, str::FromStr, time::SystemTime};

use serde::{Deserialize, Serialize};

use crate::{
    bots::BotId,
    errors::{DispatchError, DispatchResult},
};

/// Which lane an order waits in.
///
/// - `Vip`: always served before any `Normal` order that is waiting.
/// - `Normal`: served first-in first-out once no VIP order is waiting.
///
/// Parsing is case-insensitive (`"vip"`, `"VIP"`, `"Normal"` ...); anything else
/// is rejected with [`DispatchError::UnsupportedPriority`] before it can reach
/// the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Priority {
    Vip,
    Normal,
}

impl Priority {
    pub fn code(&self) -> &'static str {
        match self {
            Priority::Vip => "VIP",
            Priority::Normal => "NORMAL",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Priority {
    type Err = DispatchError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "VIP" => Ok(Priority::Vip),
            "NORMAL" => Ok(Priority::Normal),
            _ => Err(DispatchError::UnsupportedPriority(s.to_string())),
        }
    }
}

impl TryFrom<String> for Priority {
    type Error = DispatchError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Priority> for String {
    fn from(p: Priority) -> Self {
        p.code().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Processing,
    Complete,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Complete => "COMPLETE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An order waiting for, or being handled by, a bot.
///
/// - `id` and `priority` never change after creation
/// - `assigned_bot` is `Some` exactly while `status == Processing`
/// - `attempts` counts how many times a bot has picked the order up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub priority: Priority,
    pub status: OrderStatus,
    pub created_at: SystemTime,
    pub assigned_bot: Option<BotId>,
    pub attempts: u32,
}

impl Order {
    pub fn new(id: OrderId, priority: Priority) -> Self {
        Self {
            id,
            priority,
            status: OrderStatus::Pending,
            created_at: SystemTime::now(),
            assigned_bot: None,
            attempts: 0,
        }
    }

    fn illegal(&self, action: &'static str) -> DispatchError {
        DispatchError::InvalidTransition {
            entity: "order",
            id: self.id.0,
            action,
            state: self.status.to_string(),
        }
    }

    /// PENDING -> PROCESSING
    pub(crate) fn start(&mut self, bot: BotId) -> DispatchResult<()> {
        if self.status != OrderStatus::Pending {
            return Err(self.illegal("start"));
        }
        self.status = OrderStatus::Processing;
        self.assigned_bot = Some(bot);
        self.attempts += 1;
        Ok(())
    }

    /// PROCESSING -> COMPLETE, only for the bot that holds the order.
    pub(crate) fn complete(&mut self, bot: BotId) -> DispatchResult<()> {
        if self.status != OrderStatus::Processing || self.assigned_bot != Some(bot) {
            return Err(self.illegal("complete"));
        }
        self.status = OrderStatus::Complete;
        self.assigned_bot = None;
        Ok(())
    }

    /// PROCESSING -> PENDING
    pub(crate) fn requeue(&mut self) -> DispatchResult<()> {
        if self.status != OrderStatus::Processing {
            return Err(self.illegal("requeue"));
        }
        self.status = OrderStatus::Pending;
        self.assigned_bot = None;
        Ok(())
    }
}
