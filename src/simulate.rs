//! Load harness for a running dispatcher API.
//!
//! Fires a Poisson stream of actions at the HTTP endpoints so the engine sees
//! a realistic, noisy mix of submissions and pool changes.
//!
//! ## Components
//!
//! - `SimConfig` holds the simulation parameters:
//!   - `api_base`: base URL of the REST API (e.g. `http://127.0.0.1:3000`).
//!   - `run_secs`: optional total duration in seconds; `None` runs until cancelled.
//!   - `rate_hz`: Poisson arrival rate (λ) for actions (exponential inter-arrival).
//!   - `vip_ratio`: probability that a submitted order is VIP.
//!   - `bot_churn`: probability that an action adds or removes a bot (50/50)
//!     instead of submitting an order.
//! - `run_simulation(cfg, cancel_token)`: draws inter-arrival delays from
//!   `Exp(λ = cfg.rate_hz)`, performs one action per arrival, and stops after
//!   `cfg.run_secs` or once `cancel_token` fires (e.g. on Ctrl-C).

use std::{
    fmt,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail};
use rand::Rng;
use rand_distr::{Distribution, Exp};
use reqwest::{Client, StatusCode};
use serde_json::json;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{api::RemovedBot, dispatcher::StatusSnapshot, orders::Priority};

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub api_base: String,
    pub run_secs: Option<u64>,
    pub rate_hz: f64,
    pub vip_ratio: f64,
    pub bot_churn: f64,
}

impl SimConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if !(self.rate_hz > 0.0 && self.rate_hz.is_finite()) {
            bail!("rate_hz must be > 0, got {}", self.rate_hz);
        }
        for (name, p) in [("vip_ratio", self.vip_ratio), ("bot_churn", self.bot_churn)] {
            if !(0.0..=1.0).contains(&p) {
                bail!("{name} must be within [0, 1], got {p}");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimAction {
    Submit(Priority),
    AddBot,
    RemoveBot,
}

/// Picks the next action. Probabilities are assumed validated.
pub fn choose_action<R: Rng + ?Sized>(rng: &mut R, cfg: &SimConfig) -> SimAction {
    if rng.random_bool(cfg.bot_churn) {
        if rng.random_bool(0.5) {
            SimAction::AddBot
        } else {
            SimAction::RemoveBot
        }
    } else if rng.random_bool(cfg.vip_ratio) {
        SimAction::Submit(Priority::Vip)
    } else {
        SimAction::Submit(Priority::Normal)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub vip_submitted: u64,
    pub normal_submitted: u64,
    pub bots_added: u64,
    pub bots_removed: u64,
    /// Adds refused because the pool was full, or removals on an empty pool.
    pub refused: u64,
    /// Completed orders reported by the server when the run ended.
    pub completed: Option<usize>,
}

impl fmt::Display for SimStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vip={} normal={} bots +{}/-{} refused={}",
            self.vip_submitted,
            self.normal_submitted,
            self.bots_added,
            self.bots_removed,
            self.refused
        )?;
        if let Some(done) = self.completed {
            write!(f, " completed={done}")?;
        }
        Ok(())
    }
}

pub async fn send_one_action(
    client: &Client,
    api_base: &str,
    action: SimAction,
    stats: &mut SimStats,
) -> anyhow::Result<()> {
    match action {
        SimAction::Submit(priority) => {
            client
                .post(format!("{}/orders", api_base))
                .json(&json!({ "priority": priority.code() }))
                .send()
                .await?
                .error_for_status()?;
            match priority {
                Priority::Vip => stats.vip_submitted += 1,
                Priority::Normal => stats.normal_submitted += 1,
            }
        }
        SimAction::AddBot => {
            let resp = client.post(format!("{}/bots", api_base)).send().await?;
            if resp.status() == StatusCode::CONFLICT {
                stats.refused += 1;
            } else {
                resp.error_for_status()?;
                stats.bots_added += 1;
            }
        }
        SimAction::RemoveBot => {
            let body = client
                .delete(format!("{}/bots/latest", api_base))
                .send()
                .await?
                .error_for_status()?
                .json::<RemovedBot>()
                .await?;
            match body.removed {
                Some(_) => stats.bots_removed += 1,
                None => stats.refused += 1,
            }
        }
    }
    Ok(())
}

/// Drive random load against the dispatcher API.
///
/// # Errors
/// Returns an error if the configuration is invalid or any HTTP request fails.
pub async fn run_simulation(
    cfg: SimConfig,
    cancel_token: CancellationToken,
) -> anyhow::Result<SimStats> {
    cfg.validate()?;
    let client = Client::new();
    //Exponential inter-arrival times with rate = rate_hz
    let ia_dist = Exp::new(cfg.rate_hz).map_err(|e| anyhow!("bad rate_hz: {e}"))?;

    let mut stats = SimStats::default();
    let start = Instant::now();

    loop {
        //check overall time-limit
        if let Some(max_secs) = cfg.run_secs {
            if start.elapsed().as_secs() >= max_secs {
                break;
            }
        }
        //draw the next wait
        let wait_secs = ia_dist.sample(&mut rand::rng());
        tokio::select! {
            _ = cancel_token.cancelled() => {
                tracing::info!("received shutdown, stopping simulation");
                break;
            }
            _ = sleep(Duration::from_secs_f64(wait_secs)) => {
                let action = choose_action(&mut rand::rng(), &cfg);
                send_one_action(&client, &cfg.api_base, action, &mut stats).await?;
                tracing::debug!(
                    elapsed = start.elapsed().as_secs_f64(),
                    ?action,
                    "sent"
                );
            }
        }
    }

    let snapshot = client
        .get(format!("{}/status", cfg.api_base))
        .send()
        .await?
        .error_for_status()?
        .json::<StatusSnapshot>()
        .await?;
    stats.completed = Some(snapshot.orders.complete);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    fn cfg(vip_ratio: f64, bot_churn: f64) -> SimConfig {
        SimConfig {
            api_base: "http://127.0.0.1:0".into(),
            run_secs: Some(0),
            rate_hz: 10.0,
            vip_ratio,
            bot_churn,
        }
    }

    #[test]
    fn no_churn_all_vip_only_submits_vip() {
        let mut rng = StdRng::seed_from_u64(7);
        let c = cfg(1.0, 0.0);
        for _ in 0..100 {
            assert_eq!(choose_action(&mut rng, &c), SimAction::Submit(Priority::Vip));
        }
    }

    #[test]
    fn full_churn_only_touches_bots() {
        let mut rng = StdRng::seed_from_u64(7);
        let c = cfg(0.5, 1.0);
        let actions: Vec<SimAction> = (0..200).map(|_| choose_action(&mut rng, &c)).collect();
        assert!(actions.iter().all(|a| !matches!(a, SimAction::Submit(_))));
        assert!(actions.contains(&SimAction::AddBot));
        assert!(actions.contains(&SimAction::RemoveBot));
    }

    #[test]
    fn out_of_range_probabilities_are_rejected() {
        assert!(cfg(1.5, 0.0).validate().is_err());
        assert!(cfg(0.5, -0.1).validate().is_err());
        assert!(cfg(0.0, 1.0).validate().is_ok());
    }

    #[test]
    fn zero_rate_is_rejected() {
        let mut c = cfg(0.5, 0.1);
        c.rate_hz = 0.0;
        assert!(c.validate().is_err());
    }
}
