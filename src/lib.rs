pub mod api;
pub mod bots;
pub mod cli;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod orders;
pub mod queue;
pub mod simulate;
pub mod state;
pub mod utils;
