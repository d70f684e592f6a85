use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, anyhow};
use chrono::{Local, NaiveTime, TimeDelta};
use clap::{Args, Parser, Subcommand};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    sync::broadcast::{self, error::RecvError},
};
use tracing::info;

use crate::{
    api::router,
    clock::{TokioClock, VirtualClock},
    config::{DEFAULT_MAX_BOTS, DispatcherConfig},
    dispatcher::{Dispatcher, StatusSnapshot},
    events::DispatchEvent,
    orders::{Order, Priority},
    simulate::{SimConfig, run_simulation},
    state::AppState,
    utils::{DEFAULT_LOG_FILTER, init_tracing, shutdown_token},
};

/// Order dispatcher: bots work through a VIP-first order queue
#[derive(Parser)]
#[command(name = "order-dispatch")]
#[command(version, about = "Priority order dispatch engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct EngineArgs {
    /// Seconds a bot spends on one order
    #[arg(long, env = "DISPATCH_PROCESSING_SECS", default_value_t = 10.0)]
    processing_secs: f64,

    /// Maximum number of bots in the pool
    #[arg(long, env = "DISPATCH_MAX_BOTS", default_value_t = DEFAULT_MAX_BOTS)]
    max_bots: usize,
}

impl EngineArgs {
    fn config(&self) -> anyhow::Result<DispatcherConfig> {
        let duration = Duration::try_from_secs_f64(self.processing_secs)
            .map_err(|e| anyhow!("invalid --processing-secs {}: {e}", self.processing_secs))?;
        Ok(DispatcherConfig::default()
            .with_processing_duration(duration)
            .with_max_bots(self.max_bots))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP + websocket API until Ctrl-C
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:3000")]
        addr: SocketAddr,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Interactive command loop on stdin
    Repl {
        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Scripted walkthrough on a virtual clock
    Demo {
        #[command(flatten)]
        engine: EngineArgs,

        /// Results file, overwritten on every run
        #[arg(long, default_value = "scripts/result.txt")]
        out: PathBuf,
    },

    /// Random load against a running `serve`
    Simulate {
        /// Base URL of the API
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        api_base: String,

        /// Stop after this many seconds (runs until Ctrl-C if omitted)
        #[arg(long)]
        run_secs: Option<u64>,

        /// Mean actions per second
        #[arg(long, default_value_t = 2.0)]
        rate_hz: f64,

        /// Share of submitted orders that are VIP
        #[arg(long, default_value_t = 0.3)]
        vip_ratio: f64,

        /// Share of actions that add or remove a bot instead of submitting
        #[arg(long, default_value_t = 0.1)]
        bot_churn: f64,
    },
}

/// One line of repl input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplCommand {
    Submit(Priority),
    AddBot,
    RemoveBot,
    Status,
    Integrity,
    Help,
    Quit,
}

impl FromStr for ReplCommand {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let words: Vec<String> = s.split_whitespace().map(str::to_ascii_lowercase).collect();
        let words: Vec<&str> = words.iter().map(String::as_str).collect();
        match words.as_slice() {
            ["n"] | ["normal"] => Ok(ReplCommand::Submit(Priority::Normal)),
            ["v"] | ["vip"] => Ok(ReplCommand::Submit(Priority::Vip)),
            ["order", tag] => tag
                .parse::<Priority>()
                .map(ReplCommand::Submit)
                .map_err(|e| e.to_string()),
            ["+"] | ["add"] => Ok(ReplCommand::AddBot),
            ["-"] | ["remove"] => Ok(ReplCommand::RemoveBot),
            ["s"] | ["status"] => Ok(ReplCommand::Status),
            ["i"] | ["integrity"] => Ok(ReplCommand::Integrity),
            ["h"] | ["help"] | ["?"] => Ok(ReplCommand::Help),
            ["q"] | ["quit"] | ["exit"] => Ok(ReplCommand::Quit),
            _ => Err(format!("unknown command: `{}` (try `help`)", s.trim())),
        }
    }
}

fn print_help() {
    println!("Commands:");
    println!("  normal | n        submit a NORMAL order");
    println!("  vip | v           submit a VIP order");
    println!("  order <tag>       submit an order by tag");
    println!("  add | +           add a bot");
    println!("  remove | -        remove the newest bot");
    println!("  status | s        show queue, bots and orders");
    println!("  integrity | i     cross-check internal state");
    println!("  quit | q          exit");
}

fn format_orders(orders: &[Order]) -> String {
    if orders.is_empty() {
        return "-".to_string();
    }
    orders
        .iter()
        .map(|o| format!("#{}({})", o.id, o.priority))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn format_status(snap: &StatusSnapshot) -> String {
    let mut out = String::new();
    out.push_str("------ Status ------\n");
    out.push_str(&format!(
        "Queue: {} VIP, {} NORMAL\n",
        snap.queue.vip, snap.queue.normal
    ));
    out.push_str(&format!(
        "Orders: {} total, {} pending, {} processing, {} complete\n",
        snap.orders.total, snap.orders.pending, snap.orders.processing, snap.orders.complete
    ));
    out.push_str(&format!(
        "Bots: {} total, {} idle, {} busy\n",
        snap.bots.total, snap.bots.idle, snap.bots.busy
    ));
    for bot in &snap.bot_list {
        match bot.current_order {
            Some(order) => out.push_str(&format!("  bot #{} {} order #{}\n", bot.id, bot.status, order)),
            None => out.push_str(&format!("  bot #{} {}\n", bot.id, bot.status)),
        }
    }
    out.push_str(&format!("PENDING:    {}\n", format_orders(&snap.pending)));
    out.push_str(&format!("PROCESSING: {}\n", format_orders(&snap.processing)));
    out.push_str(&format!("COMPLETE:   {}\n", format_orders(&snap.complete)));
    out.push_str("--------------------");
    out
}

fn execute(dispatcher: &Dispatcher, cmd: ReplCommand) {
    match cmd {
        ReplCommand::Submit(priority) => {
            let order = dispatcher.submit_order(priority);
            println!("{} order #{} is {}", order.priority, order.id, order.status);
        }
        ReplCommand::AddBot => match dispatcher.add_bot() {
            Ok(bot) => println!("bot #{} added ({})", bot.id, bot.status),
            Err(err) => println!("{err}"),
        },
        ReplCommand::RemoveBot => match dispatcher.remove_bot() {
            Some(bot) => println!("bot #{} removed", bot.id),
            None => println!("No bot to remove"),
        },
        ReplCommand::Status => println!("{}", format_status(&dispatcher.snapshot())),
        ReplCommand::Integrity => {
            let report = dispatcher.check_integrity();
            if report.valid {
                println!("integrity: VALID");
            } else {
                println!("integrity: INVALID");
                for issue in report.issues {
                    println!("  - {issue}");
                }
            }
        }
        ReplCommand::Help => print_help(),
        ReplCommand::Quit => {}
    }
}

async fn print_events(mut rx: broadcast::Receiver<DispatchEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => println!("  [event] {event}"),
            Err(RecvError::Lagged(skipped)) => println!("  [event] ... {skipped} events skipped"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn run_serve(addr: SocketAddr, engine: EngineArgs) -> anyhow::Result<()> {
    let config = engine.config()?;
    let state = AppState::new(config);
    let dispatcher = state.dispatcher.clone();
    let app = router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "listening");

    let token = shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    let requeued = dispatcher.shutdown();
    info!(requeued, "server stopped");
    Ok(())
}

async fn run_repl(engine: EngineArgs) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::new(engine.config()?, Arc::new(TokioClock::current()));
    let printer = tokio::spawn(print_events(dispatcher.subscribe()));
    let token = shutdown_token();

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => line?,
        };
        // EOF
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<ReplCommand>() {
            Ok(ReplCommand::Quit) => break,
            Ok(cmd) => execute(&dispatcher, cmd),
            Err(msg) => println!("{msg}"),
        }
    }

    let requeued = dispatcher.shutdown();
    printer.abort();
    println!("bye ({requeued} in-flight orders returned to PENDING)");
    Ok(())
}

/// Demo transcript. Every line carries an `HH:MM:SS` stamp: the wall-clock
/// time the run started at, moved forward by the virtual clock.
struct Transcript {
    started: NaiveTime,
    clock: Arc<VirtualClock>,
    out: String,
}

impl Transcript {
    fn line(&mut self, text: &str) {
        let elapsed = TimeDelta::from_std(self.clock.now()).unwrap_or(TimeDelta::MAX);
        let (stamp, _) = self.started.overflowing_add_signed(elapsed);
        self.out.push_str(&format!("[{}] {text}\n", stamp.format("%H:%M:%S")));
    }

    fn block(&mut self, text: &str) {
        for line in text.lines() {
            self.line(line);
        }
    }

    fn drain(&mut self, rx: &mut broadcast::Receiver<DispatchEvent>) {
        while let Ok(event) = rx.try_recv() {
            self.line(&event.to_string());
        }
    }
}

/// Replays the classic walkthrough: normals queue up, a bot starts, a VIP
/// order jumps the line, a second bot joins, more orders arrive, a busy bot
/// is removed, then everything drains.
pub fn run_demo(config: DispatcherConfig, started: NaiveTime) -> String {
    let clock = Arc::new(VirtualClock::new());
    let dispatcher = Dispatcher::new(config.clone(), clock.clone());
    let mut rx = dispatcher.subscribe();
    let mut t = Transcript {
        started,
        clock: clock.clone(),
        out: String::new(),
    };
    let add_bot = |t: &mut Transcript| {
        if let Err(err) = dispatcher.add_bot() {
            t.line(&format!("could not add bot: {err}"));
        }
    };

    t.line("--- Step 1: three NORMAL orders ---");
    for _ in 0..3 {
        dispatcher.submit_order(Priority::Normal);
    }
    t.drain(&mut rx);

    t.line("--- Step 2: add a bot ---");
    add_bot(&mut t);
    t.drain(&mut rx);

    t.line("--- Step 3: a VIP order jumps the queue ---");
    dispatcher.submit_order(Priority::Vip);
    t.drain(&mut rx);

    t.line("--- Step 4: add another bot ---");
    add_bot(&mut t);
    t.drain(&mut rx);

    t.line("--- Step 5: more orders ---");
    dispatcher.submit_order(Priority::Normal);
    dispatcher.submit_order(Priority::Vip);
    t.drain(&mut rx);

    t.line("--- Step 6: status ---");
    t.block(&format_status(&dispatcher.snapshot()));

    t.line("--- Step 7: halfway through, remove the newest bot ---");
    clock.advance(config.processing_duration / 2);
    t.drain(&mut rx);
    if dispatcher.remove_bot().is_none() {
        t.line("No bot to remove");
    }
    t.drain(&mut rx);

    t.line("--- Step 8: run until every order is done ---");
    while let Some(deadline) = clock.next_deadline() {
        clock.advance(deadline.saturating_sub(clock.now()));
        t.drain(&mut rx);
    }
    t.block(&format_status(&dispatcher.snapshot()));

    let report = dispatcher.check_integrity();
    t.line(&format!(
        "integrity: {}",
        if report.valid { "VALID" } else { "INVALID" }
    ));
    t.out
}

/// Writes a demo transcript to `path`, replacing the result of any earlier run.
pub fn write_result_file(path: &Path, transcript: &str) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    fs::write(path, transcript).with_context(|| format!("writing {}", path.display()))
}

pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { addr, engine } => {
            init_tracing(DEFAULT_LOG_FILTER);
            run_serve(addr, engine).await
        }
        Commands::Repl { engine } => {
            init_tracing("order_dispatch=warn");
            run_repl(engine).await
        }
        Commands::Demo { engine, out } => {
            init_tracing("order_dispatch=warn");
            let transcript = run_demo(engine.config()?, Local::now().time());
            print!("{transcript}");
            write_result_file(&out, &transcript)?;
            println!("results written to {}", out.display());
            Ok(())
        }
        Commands::Simulate {
            api_base,
            run_secs,
            rate_hz,
            vip_ratio,
            bot_churn,
        } => {
            init_tracing(DEFAULT_LOG_FILTER);
            let cfg = SimConfig {
                api_base,
                run_secs,
                rate_hz,
                vip_ratio,
                bot_churn,
            };
            let stats = run_simulation(cfg, shutdown_token()).await?;
            println!("--- done --- {stats}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<ReplCommand, String> {
        s.parse()
    }

    #[test]
    fn parses_short_and_long_forms() {
        assert_eq!(parse("n"), Ok(ReplCommand::Submit(Priority::Normal)));
        assert_eq!(parse("VIP"), Ok(ReplCommand::Submit(Priority::Vip)));
        assert_eq!(parse("order vip"), Ok(ReplCommand::Submit(Priority::Vip)));
        assert_eq!(parse(" + "), Ok(ReplCommand::AddBot));
        assert_eq!(parse("remove"), Ok(ReplCommand::RemoveBot));
        assert_eq!(parse("s"), Ok(ReplCommand::Status));
        assert_eq!(parse("quit"), Ok(ReplCommand::Quit));
    }

    #[test]
    fn rejects_unknown_priority_at_the_boundary() {
        let err = parse("order gold").unwrap_err();
        assert!(err.contains("unsupported priority"));
    }

    #[test]
    fn rejects_unknown_command() {
        let err = parse("launch").unwrap_err();
        assert!(err.contains("unknown command"));
    }

    #[test]
    fn engine_args_reject_negative_duration() {
        let args = EngineArgs {
            processing_secs: -1.0,
            max_bots: 3,
        };
        assert!(args.config().is_err());

        let args = EngineArgs {
            processing_secs: 2.5,
            max_bots: 3,
        };
        let cfg = args.config().unwrap();
        assert_eq!(cfg.processing_duration, Duration::from_millis(2500));
        assert_eq!(cfg.max_bots, 3);
    }

    fn nine_am() -> NaiveTime {
        NaiveTime::from_hms_opt(9, 0, 0).unwrap()
    }

    #[test]
    fn demo_drains_everything_and_stays_consistent() {
        let transcript = run_demo(DispatcherConfig::default(), nine_am());

        // VIP #4 is picked up before the older normals #2 and #3
        let vip_start = transcript.find("started order #4").unwrap();
        let normal_start = transcript.find("started order #2").unwrap();
        assert!(vip_start < normal_start);

        assert!(transcript.contains("returned to PENDING"));
        assert!(transcript.contains("Orders: 6 total, 0 pending, 0 processing, 6 complete"));
        assert!(transcript.ends_with("integrity: VALID\n"));
    }

    #[test]
    fn demo_lines_are_stamped_with_virtual_wall_time() {
        let transcript = run_demo(DispatcherConfig::default(), nine_am());

        assert!(transcript.starts_with("[09:00:00] --- Step 1: three NORMAL orders ---\n"));
        assert!(transcript.lines().all(|l| {
            let b = l.as_bytes();
            b.len() > 11 && b[0] == b'[' && b[3] == b':' && b[6] == b':' && &l[9..11] == "] "
        }));
        // halfway through the first 10s order
        assert!(transcript.contains("[09:00:05] order #4 returned to PENDING (bot #2 stopped)"));
        assert!(transcript.contains("[09:00:10] bot #1 completed order #1"));
        assert!(transcript.contains("[09:00:10] bot #1 started order #4"));
        assert!(transcript.contains("[09:00:20] bot #1 completed order #4"));
    }

    #[test]
    fn demo_reports_a_refused_bot() {
        let transcript = run_demo(DispatcherConfig::default().with_max_bots(1), nine_am());
        assert!(transcript.contains("could not add bot: bot pool is full (1 bots)"));
        assert!(transcript.ends_with("integrity: VALID\n"));
    }

    #[test]
    fn result_file_replaces_earlier_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scripts").join("result.txt");

        write_result_file(&path, "[09:00:00] old run\n").unwrap();
        let transcript = run_demo(DispatcherConfig::default(), nine_am());
        write_result_file(&path, &transcript).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, transcript);
        assert!(!written.contains("old run"));
        assert!(written.ends_with("integrity: VALID\n"));
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
