//! The matching engine.
//!
//! A [`Dispatcher`] owns the [`PriorityQueue`], the bot stack and the table of
//! every order it has seen, all behind a single mutex. Every public operation
//! takes that lock, mutates, and then re-runs [`Dispatcher::match_all`] before
//! releasing it, so the relative order of callers' operations is the order of
//! their effects.
//!
//! Completion timers re-enter through [`Dispatcher::on_order_completed`], which
//! takes the same lock and only completes the order if the bot that armed the
//! timer still holds it on the same attempt. A timer that fires after its bot
//! was removed, or after the order was restarted, is therefore a logged no-op.
//!
//! Only the newest `completed_retention` completed orders are kept in the
//! table; older ones are dropped and survive only in the running count.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    bots::{Bot, BotId, BotStatus},
    clock::{Clock, TimerCallback},
    config::DispatcherConfig,
    errors::{DispatchError, DispatchResult},
    events::DispatchEvent,
    orders::{Order, OrderId, OrderStatus, Priority},
    queue::{PriorityQueue, QueueSizes},
};

/// Lifetime counts. `total` and `complete` include completed orders that
/// were already pruned from the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub complete: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotStats {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
}

/// Read-only view of the whole engine at one instant.
///
/// `pending` is listed in the order the queue will hand orders out;
/// `processing` and `complete` are listed by order id, and `complete` only
/// holds the retained tail of finished orders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub queue: QueueSizes,
    pub orders: OrderStats,
    pub bots: BotStats,
    pub bot_list: Vec<Bot>,
    pub pending: Vec<Order>,
    pub processing: Vec<Order>,
    pub complete: Vec<Order>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub issues: Vec<String>,
}

#[derive(Default)]
struct DispatchState {
    queue: PriorityQueue,
    /// Stack: the last bot added is the first removed.
    bots: Vec<Bot>,
    orders: BTreeMap<OrderId, Order>,
    /// Retained completed orders, oldest completion first.
    completed: VecDeque<OrderId>,
    completed_total: usize,
    last_order_id: u64,
    last_bot_id: u64,
}

impl DispatchState {
    fn complete(
        &mut self,
        bot_id: BotId,
        order_id: OrderId,
        attempt: u32,
    ) -> DispatchResult<Order> {
        let bot = self
            .bots
            .iter_mut()
            .find(|b| b.id == bot_id)
            .ok_or(DispatchError::UnknownBot(bot_id))?;
        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or(DispatchError::UnknownOrder(order_id))?;
        bot.complete(order, attempt)?;
        let done = order.clone();
        self.completed.push_back(order_id);
        self.completed_total += 1;
        Ok(done)
    }

    /// Drops the oldest completed orders beyond `keep`. Returns how many went.
    fn prune_completed(&mut self, keep: usize) -> usize {
        let mut dropped = 0;
        while self.completed.len() > keep {
            if let Some(id) = self.completed.pop_front() {
                self.orders.remove(&id);
                dropped += 1;
            }
        }
        dropped
    }

    fn requeue(&mut self, order_id: OrderId) -> DispatchResult<()> {
        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or(DispatchError::UnknownOrder(order_id))?;
        order.requeue()?;
        self.queue.enqueue_front(order);
        Ok(())
    }

    fn orders_with(&self, status: OrderStatus) -> Vec<Order> {
        self.orders
            .values()
            .filter(|o| o.status == status)
            .cloned()
            .collect()
    }
}

struct Shared {
    state: Mutex<DispatchState>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<DispatchEvent>,
    config: DispatcherConfig,
}

/// Cheap, clonable handle to one dispatch engine.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(DispatchState::default()),
                clock,
                events,
                config,
            }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    /// Every transition from now on. Slow receivers lag rather than block.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.shared.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: DispatchEvent) {
        // no subscribers is fine
        let _ = self.shared.events.send(event);
    }

    /// Creates a PENDING order, queues it and runs matching. The returned copy
    /// reflects the order after matching, so it is already PROCESSING if an
    /// idle bot picked it up.
    pub fn submit_order(&self, priority: Priority) -> Order {
        let mut state = self.lock();
        state.last_order_id += 1;
        let order = Order::new(OrderId(state.last_order_id), priority);
        let id = order.id;
        state.queue.enqueue(&order);
        state.orders.insert(id, order);
        info!(order_id = %id, %priority, "order submitted");
        self.emit(DispatchEvent::OrderSubmitted {
            order_id: id,
            priority,
        });

        self.match_all(&mut state);
        state.orders[&id].clone()
    }

    /// Adds an idle bot on top of the stack. It may receive work immediately.
    pub fn add_bot(&self) -> DispatchResult<Bot> {
        let mut state = self.lock();
        let max = self.shared.config.max_bots;
        if state.bots.len() >= max {
            warn!(max, "bot pool is full");
            return Err(DispatchError::CapacityReached { max });
        }
        state.last_bot_id += 1;
        let id = BotId(state.last_bot_id);
        state.bots.push(Bot::new(id));
        let idx = state.bots.len() - 1;
        info!(bot_id = %id, "bot added");
        self.emit(DispatchEvent::BotAdded { bot_id: id });

        self.match_all(&mut state);
        Ok(state.bots[idx].clone())
    }

    /// Removes the most recently added bot. A busy bot is stopped first and its
    /// order goes back to the front of its lane. `None` when the pool is empty.
    pub fn remove_bot(&self) -> Option<Bot> {
        let mut state = self.lock();
        let Some(mut bot) = state.bots.pop() else {
            info!("no bot to remove");
            return None;
        };

        if let Some(order_id) = bot.stop(self.shared.clock.as_ref()) {
            match state.requeue(order_id) {
                Ok(()) => {
                    info!(bot_id = %bot.id, order_id = %order_id, "order returned to pending");
                    self.emit(DispatchEvent::OrderRequeued {
                        order_id,
                        bot_id: bot.id,
                    });
                }
                Err(err) => warn!(bot_id = %bot.id, %err, "could not requeue interrupted order"),
            }
        }
        info!(bot_id = %bot.id, "bot removed");
        self.emit(DispatchEvent::BotRemoved { bot_id: bot.id });

        self.match_all(&mut state);
        Some(bot)
    }

    /// Completion path for a bot's timer. Completes the order only if `bot_id`
    /// still exists and still holds `order_id` on pick-up number `attempt`,
    /// then hands the bot more work.
    pub fn on_order_completed(
        &self,
        bot_id: BotId,
        order_id: OrderId,
        attempt: u32,
    ) -> Option<Order> {
        let mut state = self.lock();
        match state.complete(bot_id, order_id, attempt) {
            Ok(order) => {
                info!(bot_id = %bot_id, order_id = %order_id, "order complete");
                self.emit(DispatchEvent::OrderCompleted { order_id, bot_id });
                let dropped = state.prune_completed(self.shared.config.completed_retention);
                if dropped > 0 {
                    debug!(dropped, "pruned completed orders");
                }
                self.match_all(&mut state);
                Some(order)
            }
            Err(err) => {
                warn!(bot_id = %bot_id, order_id = %order_id, attempt, %err, "ignoring stale completion");
                None
            }
        }
    }

    /// Pairs idle bots with queued orders until one side runs out. Returns the
    /// number of assignments made.
    fn match_all(&self, state: &mut DispatchState) -> usize {
        let duration = self.shared.config.processing_duration;
        let mut assigned = 0;

        while let Some(idx) = state.bots.iter().position(Bot::is_idle) {
            let Some(order_id) = state.queue.dequeue() else {
                break;
            };
            let bot = &mut state.bots[idx];
            let Some(order) = state.orders.get_mut(&order_id) else {
                warn!(order_id = %order_id, "queued order has no record, dropping it");
                continue;
            };

            // assign bumps `attempts`, so this is the attempt about to start
            let on_complete = self.completion_callback(bot.id, order_id, order.attempts + 1);
            match bot.assign(order, self.shared.clock.as_ref(), duration, on_complete) {
                Ok(token) => {
                    debug!(bot_id = %bot.id, order_id = %order_id, %token, "timer armed");
                    info!(bot_id = %bot.id, order_id = %order_id, priority = %order.priority, "order processing");
                    self.emit(DispatchEvent::OrderStarted {
                        order_id,
                        bot_id: bot.id,
                    });
                    assigned += 1;
                }
                Err(err) => {
                    warn!(order_id = %order_id, %err, "queued order could not be assigned, dropping it");
                }
            }
        }

        if assigned == 0 {
            debug!(queued = state.queue.len(), "nothing to match");
        }
        assigned
    }

    fn completion_callback(
        &self,
        bot_id: BotId,
        order_id: OrderId,
        attempt: u32,
    ) -> TimerCallback {
        let shared = Arc::downgrade(&self.shared);
        Box::new(move || {
            if let Some(shared) = shared.upgrade() {
                Dispatcher { shared }.on_order_completed(bot_id, order_id, attempt);
            }
        })
    }

    /// Stops every busy bot and returns its order to the front of its lane, so
    /// no completion timer outlives the engine. Bots stay in the pool. Returns
    /// the number of orders requeued.
    pub fn shutdown(&self) -> usize {
        let mut state = self.lock();
        let clock = self.shared.clock.as_ref();
        let mut interrupted: Vec<(OrderId, BotId)> = state
            .bots
            .iter_mut()
            .filter_map(|bot| bot.stop(clock).map(|order_id| (order_id, bot.id)))
            .collect();

        // front-inserting highest id first leaves the lane in id order
        interrupted.sort_by(|a, b| b.0.cmp(&a.0));
        let mut requeued = 0;
        for (order_id, bot_id) in interrupted {
            match state.requeue(order_id) {
                Ok(()) => {
                    self.emit(DispatchEvent::OrderRequeued { order_id, bot_id });
                    requeued += 1;
                }
                Err(err) => warn!(order_id = %order_id, %err, "could not requeue on shutdown"),
            }
        }
        info!(requeued, "dispatcher shut down");
        requeued
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.lock();

        let pending: Vec<Order> = state
            .queue
            .iter()
            .filter_map(|id| state.orders.get(&id).cloned())
            .collect();
        let processing = state.orders_with(OrderStatus::Processing);
        let complete = state.orders_with(OrderStatus::Complete);

        let busy = state
            .bots
            .iter()
            .filter(|b| b.status == BotStatus::Busy)
            .count();

        StatusSnapshot {
            queue: state.queue.sizes(),
            orders: OrderStats {
                total: state.last_order_id as usize,
                pending: pending.len(),
                processing: processing.len(),
                complete: state.completed_total,
            },
            bots: BotStats {
                total: state.bots.len(),
                idle: state.bots.len() - busy,
                busy,
            },
            bot_list: state.bots.clone(),
            pending,
            processing,
            complete,
        }
    }

    /// Cross-checks bots, orders and queue against each other.
    pub fn check_integrity(&self) -> IntegrityReport {
        let state = self.lock();
        let mut issues = Vec::new();

        let mut holders: HashMap<OrderId, Vec<BotId>> = HashMap::new();
        for bot in &state.bots {
            match (bot.status, bot.current_order) {
                (BotStatus::Busy, Some(order_id)) => {
                    holders.entry(order_id).or_default().push(bot.id);
                }
                (BotStatus::Idle, None) => {}
                (status, current) => issues.push(format!(
                    "bot #{} is {status} but holds {current:?}",
                    bot.id
                )),
            }
        }
        for (order_id, bots) in &holders {
            if bots.len() > 1 {
                issues.push(format!("order #{order_id} is held by bots {bots:?}"));
            }
            if !state.orders.contains_key(order_id) {
                issues.push(format!("bot holds unknown order #{order_id}"));
            }
        }

        let mut queued: HashMap<OrderId, usize> = HashMap::new();
        for priority in [Priority::Vip, Priority::Normal] {
            for id in state.queue.lane(priority) {
                *queued.entry(id).or_default() += 1;
                match state.orders.get(&id) {
                    Some(order) if order.priority != priority => issues.push(format!(
                        "order #{id} ({}) is queued in the {priority} lane",
                        order.priority
                    )),
                    Some(_) => {}
                    None => issues.push(format!("unknown order #{id} is queued")),
                }
            }
        }

        for order in state.orders.values() {
            let held_by = holders.get(&order.id).map(Vec::as_slice).unwrap_or(&[]);
            let times_queued = queued.get(&order.id).copied().unwrap_or(0);
            match order.status {
                OrderStatus::Processing => {
                    if held_by.len() != 1 || order.assigned_bot != held_by.first().copied() {
                        issues.push(format!(
                            "order #{} is PROCESSING on {:?} but held by {held_by:?}",
                            order.id, order.assigned_bot
                        ));
                    }
                    if times_queued != 0 {
                        issues.push(format!("order #{} is PROCESSING and queued", order.id));
                    }
                }
                OrderStatus::Pending | OrderStatus::Complete => {
                    if order.assigned_bot.is_some() || !held_by.is_empty() {
                        issues.push(format!(
                            "order #{} is {} but assigned to {:?} / held by {held_by:?}",
                            order.id, order.status, order.assigned_bot
                        ));
                    }
                    let expected = usize::from(order.status == OrderStatus::Pending);
                    if times_queued != expected {
                        issues.push(format!(
                            "order #{} is {} and queued {times_queued} times",
                            order.id, order.status
                        ));
                    }
                }
            }
        }

        for id in &state.completed {
            match state.orders.get(id) {
                Some(order) if order.status == OrderStatus::Complete => {}
                _ => issues.push(format!("retained completion #{id} is not a COMPLETE order")),
            }
        }

        if !issues.is_empty() {
            warn!(count = issues.len(), "integrity check failed");
        }
        IntegrityReport {
            valid: issues.is_empty(),
            issues,
        }
    }
}
