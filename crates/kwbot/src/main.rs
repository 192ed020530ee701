use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use kwbot_core::{
    config::Config,
    fetch::PageFetcher,
    messaging::port::MessagingPort,
    monitor::{CycleOutcome, CycleReport, Monitor},
    notify::Notifier,
    store::StateStore,
};
use kwbot_fetch::{FetchSettings, HttpFetcher};
use kwbot_telegram::{router, TelegramMessenger};

#[derive(Parser, Debug)]
#[command(author, version, about = "Watch a forum listing for keywords and notify a Telegram chat")]
struct Args {
    /// State/config JSON file
    #[arg(long = "config", short = 'c', global = true, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Mode>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Mode {
    /// Run the monitor and the command listener until ctrl-c (default)
    Run,
    /// Run a single cycle, print the report and exit; the state file is not written
    Once {
        /// Actually deliver notifications for matches
        #[arg(long)]
        notify: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), kwbot_core::Error> {
    let args = Args::parse();
    kwbot_core::logging::init("kwbot")?;

    let cfg = Arc::new(Config::load(&args.config)?);
    let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new(FetchSettings::from_config(&cfg))?);

    match args.command.unwrap_or(Mode::Run) {
        Mode::Run => run_daemon(cfg, fetcher).await,
        Mode::Once { notify } => run_once(cfg, fetcher, notify).await,
    }
}

async fn run_daemon(cfg: Arc<Config>, fetcher: Arc<dyn PageFetcher>) -> Result<(), kwbot_core::Error> {
    let store = Arc::new(StateStore::open(&cfg.state_path, cfg.seen_capacity)?);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("ctrl-c received, shutting down");
            }
            cancel.cancel();
        }
    });

    router::run(cfg, store, fetcher, cancel)
        .await
        .map_err(|e| kwbot_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}

async fn run_once(
    cfg: Arc<Config>,
    fetcher: Arc<dyn PageFetcher>,
    notify: bool,
) -> Result<(), kwbot_core::Error> {
    let store = Arc::new(StateStore::open_detached(&cfg.state_path, cfg.seen_capacity)?);

    let notifier = if notify {
        let bot = router::build_bot(&cfg.bot_token)
            .map_err(|e| kwbot_core::Error::External(format!("telegram client: {e}")))?;
        let messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot));
        Some(Notifier::new(
            messenger,
            cfg.chat_id,
            cfg.notify_attempts,
            cfg.notify_retry_delay,
        ))
    } else {
        None
    };

    let mut monitor = Monitor::new(&cfg, store, fetcher, notifier);
    let report = monitor.run_cycle().await;
    print_report(&report, notify);
    Ok(())
}

fn print_report(report: &CycleReport, notify: bool) {
    println!("mode:     {}", report.mode.as_str());
    match &report.outcome {
        CycleOutcome::Ok => println!("outcome:  ok"),
        CycleOutcome::Challenge(sig) => {
            println!("outcome:  challenge (HTTP {}: {})", sig.status, sig.reason)
        }
        CycleOutcome::NetworkError(e) => println!("outcome:  network error: {e}"),
        CycleOutcome::ParseError(e) => println!("outcome:  parse error: {e}"),
    }
    println!("posts:    {}", report.posts);
    println!("matches:  {}", report.matches.len());
    for m in &report.matches {
        println!("  - [{}] {} <{}>", m.keywords.join(", "), m.post.title, m.post.url);
    }
    if notify {
        println!("delivered: {}  lost: {}", report.delivered.len(), report.lost.len());
    }
    println!("next delay: {}s", report.next_delay.as_secs());
}
