use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::orders::{Order, OrderId, Priority};

/// Pending orders, split into two FIFO lanes stored in [`VecDeque`]s:
/// - `vip`
/// - `normal`
///
/// [`PriorityQueue::dequeue`] drains the VIP lane before touching the normal
/// lane. No other signal (creation time, attempts) is consulted across lanes.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    vip: VecDeque<OrderId>,
    normal: VecDeque<OrderId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSizes {
    pub vip: usize,
    pub normal: usize,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<OrderId> {
        match priority {
            Priority::Vip => &mut self.vip,
            Priority::Normal => &mut self.normal,
        }
    }

    /// Appends to the tail of the order's lane.
    pub fn enqueue(&mut self, order: &Order) {
        self.lane_mut(order.priority).push_back(order.id);
    }

    /// Puts an interrupted order at the head of its lane, ahead of everything
    /// that has never been started.
    pub fn enqueue_front(&mut self, order: &Order) {
        self.lane_mut(order.priority).push_front(order.id);
    }

    /// Head of the VIP lane, else head of the normal lane, else `None`.
    pub fn dequeue(&mut self) -> Option<OrderId> {
        self.vip.pop_front().or_else(|| self.normal.pop_front())
    }

    pub fn sizes(&self) -> QueueSizes {
        QueueSizes {
            vip: self.vip.len(),
            normal: self.normal.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.vip.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vip.is_empty() && self.normal.is_empty()
    }

    /// Pending ids in the order `dequeue` would return them.
    pub fn iter(&self) -> impl Iterator<Item = OrderId> + '_ {
        self.vip.iter().chain(self.normal.iter()).copied()
    }

    /// One lane, head first.
    pub fn lane(&self, priority: Priority) -> impl Iterator<Item = OrderId> + '_ {
        match priority {
            Priority::Vip => self.vip.iter(),
            Priority::Normal => self.normal.iter(),
        }
        .copied()
    }
}
