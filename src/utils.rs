//utils for logging setup and graceful shutdown that can be used on
//any module in the project
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_LOG_FILTER: &str = "order_dispatch=info,tower_http=info";

/// Installs the global subscriber. `RUST_LOG` wins over `default_filter`.
/// Logs go to stderr so they never interleave with command output on stdout.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // a second init (e.g. from tests) is not an error worth dying for
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let tc = token.clone();
    //spawn once to listen for ctrl-c
    tokio::spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(%err, "failed to install ctrl+C handler");
            return;
        }
        tc.cancel();
    });
    token
}
