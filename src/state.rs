use std::sync::Arc;

use crate::{
    clock::{Clock, TokioClock},
    config::DispatcherConfig,
    dispatcher::Dispatcher,
};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
}

impl AppState {
    /// Real timers on the current Tokio runtime.
    pub fn new(config: DispatcherConfig) -> Self {
        Self::with_clock(config, Arc::new(TokioClock::current()))
    }

    pub fn with_clock(config: DispatcherConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            dispatcher: Dispatcher::new(config, clock),
        }
    }
}
