/// main.rs – Entry point for the TradeSim session client.
///
/// Connects to one simulation session, keeps its state in sync over the
/// stream plus periodic REST polls, and renders the live ratatui dashboard.
/// One-shot subcommands cover the catalog, activation, chat and progression
/// endpoints.
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossterm::event::EventStream;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tradesim_client::{
    chart_cache::ChartDataCache,
    chat::ChatClient,
    clock::SessionClock,
    config::Settings,
    dashboard::{self, KeyAction},
    models::ConnectionPhase,
    HttpSimApi, SessionParams, SessionSyncController, SimApi, StreamConnector, WsConnector,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "tradesim-client",
    about = "Live session client for the TradeSim paper-trading simulator",
    version
)]
struct Cli {
    /// Disable the interactive dashboard and print logs to stdout instead.
    #[arg(long, default_value_t = false)]
    no_dashboard: bool,

    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: String,

    /// Simulation session id (overrides config and env).
    #[arg(long)]
    session: Option<String>,

    /// User id (overrides config and env).
    #[arg(long)]
    user: Option<String>,

    /// Symbol to watch first.
    #[arg(long)]
    symbol: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow the live session (default).
    Watch,
    /// List tradable symbols and chart intervals.
    Symbols,
    /// Activate the session.
    Activate,
    /// Ask the assistant a question.
    Chat {
        /// Reset the conversation before asking.
        #[arg(long, default_value_t = false)]
        clear: bool,
        message: Vec<String>,
    },
    /// Chart catalog lookups.
    Chart {
        /// Bar interval (defaults to the session's interval).
        #[arg(long)]
        interval: Option<String>,
        #[command(subcommand)]
        command: ChartCommand,
    },
    /// Learning-path endpoints.
    Progress {
        #[command(subcommand)]
        command: ProgressCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ChartCommand {
    /// Symbols with chart data at the interval.
    Symbols,
    Metadata { symbol: String },
    /// The bar served at one tick.
    Tick { symbol: String, tick: u64 },
    /// Bars between two ticks, inclusive.
    Range { symbol: String, start: u64, end: u64 },
}

#[derive(Subcommand, Debug)]
enum ProgressCommand {
    Units,
    Unit { id: String },
    Levels { unit: i64 },
    Quiz { level_id: i64 },
    /// Submit a quiz answer given as a JSON object.
    Answer { json: String },
    Complete { level_id: i64 },
    Micro { level_id: i64, page: u32 },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(&cli.config)?;
    if let Some(s) = &cli.session {
        settings.session.session_id = s.clone();
    }
    if let Some(u) = &cli.user {
        settings.session.user_id = u.clone();
    }
    if let Some(sym) = &cli.symbol {
        settings.session.symbol = sym.to_uppercase();
    }

    // Logging – RUST_LOG first, then config
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.client.log_level));
    let interactive = matches!(cli.command, None | Some(Command::Watch)) && !cli.no_dashboard;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if interactive {
        // The dashboard owns stdout
        builder.with_writer(std::io::sink).init();
    } else {
        builder.init();
    }

    let api = Arc::new(HttpSimApi::new(&settings.backend)?);
    let connector = Arc::new(WsConnector::new(&settings.backend));

    match cli.command {
        None | Some(Command::Watch) => watch(settings, api, connector, cli.no_dashboard).await,
        Some(Command::Symbols) => {
            let symbols = api.symbols().await?;
            println!("Symbols: {}", symbols.join(", "));
            println!("Intervals: {}", api.chart_intervals().await.join(", "));
            Ok(())
        }
        Some(Command::Activate) => {
            let res = api.activate_session(&settings.session.session_id).await?;
            println!(
                "{}: {}",
                if res.success { "Activated" } else { "Not activated" },
                res.message
            );
            Ok(())
        }
        Some(Command::Chat { clear, message }) => chat(connector.as_ref(), clear, &message.join(" ")).await,
        Some(Command::Chart { interval, command }) => {
            let interval = interval.unwrap_or_else(|| settings.session.interval.clone());
            let out = match command {
                ChartCommand::Symbols => serde_json::to_value(api.chart_symbols(&interval).await?)?,
                ChartCommand::Metadata { symbol } => {
                    api.chart_metadata(&symbol.to_uppercase(), &interval).await?
                }
                ChartCommand::Tick { symbol, tick } => {
                    api.chart_tick(&symbol.to_uppercase(), tick, &interval).await?
                }
                ChartCommand::Range { symbol, start, end } => {
                    if end < start {
                        bail!("range end {end} is before start {start}");
                    }
                    let bars = api
                        .chart_range(&symbol.to_uppercase(), start, end, &interval)
                        .await?;
                    serde_json::to_value(bars)?
                }
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        Some(Command::Progress { command }) => {
            let user = settings.session.user_id.as_str();
            let out = match command {
                ProgressCommand::Units => api.units().await?,
                ProgressCommand::Unit { id } => api.unit(&id).await?,
                ProgressCommand::Levels { unit } => api.user_levels(user, unit).await?,
                ProgressCommand::Quiz { level_id } => api.quiz(level_id).await?,
                ProgressCommand::Answer { json } => {
                    let body: Value = serde_json::from_str(&json).context("answer must be JSON")?;
                    api.submit_answer(&body).await?
                }
                ProgressCommand::Complete { level_id } => api.complete_level(user, level_id).await?,
                ProgressCommand::Micro { level_id, page } => {
                    api.microlearning(level_id, page).await?
                }
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
    }
}

async fn chat(connector: &dyn StreamConnector, clear: bool, message: &str) -> Result<()> {
    let mut client = ChatClient::connect(connector)?;
    if clear {
        client.clear()?;
    }
    if message.trim().is_empty() {
        client.close();
        return Ok(());
    }
    client.send(message)?;
    match tokio::time::timeout(Duration::from_secs(60), client.next_reply()).await {
        Ok(Some(reply)) => println!("{}", reply.content),
        Ok(None) => warn!("Chat closed before replying"),
        Err(_) => warn!("No reply within 60s"),
    }
    client.close();
    Ok(())
}

// ---------------------------------------------------------------------------
// Live session
// ---------------------------------------------------------------------------

async fn watch(
    settings: Settings,
    api: Arc<HttpSimApi>,
    connector: Arc<WsConnector>,
    no_dashboard: bool,
) -> Result<()> {
    if !settings.has_identity() {
        bail!("session.user_id and session.session_id are required (config, env or --user/--session)");
    }

    let cache = Arc::new(ChartDataCache::new(
        api.clone(),
        connector.clone(),
        &settings.cache,
    ));
    let controller = SessionSyncController::new(
        api.clone(),
        Arc::clone(&cache),
        connector,
        SessionParams::from_settings(&settings),
    );
    let state = controller.state();
    let clock = settings
        .session
        .start_time
        .zip(settings.session.duration_seconds)
        .map(|(start, duration)| SessionClock::new(start, duration, settings.session.ticks_per_day));

    info!(
        "Session {} for user {} – watching {}",
        settings.session.session_id, settings.session.user_id, settings.session.symbol
    );

    // Initial snapshot + chart history
    controller.refresh_all().await;
    let history = cache
        .get_chart_data(
            &settings.session.symbol,
            &settings.session.interval,
            settings.session.days,
            Some(&settings.session.session_id),
        )
        .await;
    {
        let mut st = state.write().unwrap_or_else(|e| e.into_inner());
        st.live_bar = history.last().cloned();
        st.add_log(format!(
            "Loaded {} {} bars for {}",
            history.len(),
            settings.session.interval,
            settings.session.symbol
        ));
    }

    let follow = |symbol: &str| {
        let live_state = controller.state();
        cache.subscribe(symbol, move |bar| {
            live_state
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .live_bar = Some(bar.clone());
        })
    };
    let mut subscription = follow(&settings.session.symbol);
    let catalog = api.symbols().await.unwrap_or_else(|e| {
        warn!("Symbol catalog unavailable: {e}");
        Vec::new()
    });

    controller.connect()?;

    let mut poll_ticker = tokio::time::interval(settings.client.poll_interval());

    let mut terminal = if !no_dashboard {
        Some(dashboard::setup_terminal()?)
    } else {
        None
    };

    let mut dash_ticker = tokio::time::interval(settings.dashboard.refresh_interval());
    let reconnect_delay = settings.backend.reconnect_delay();
    let mut down_since: Option<tokio::time::Instant> = None;

    let mut event_stream = EventStream::new();

    info!("Client started.  Press 'q' to quit.");

    // -----------------------------------------------------------------------
    // Main event loop
    // -----------------------------------------------------------------------
    loop {
        if let Some(ref mut term) = terminal {
            let st = controller.snapshot();
            term.draw(|f| dashboard::render(f, &st, clock.as_ref()))?;
        }

        tokio::select! {
            // ── Keyboard ───────────────────────────────────────────────────
            Some(Ok(event)) = event_stream.next(), if terminal.is_some() => {
                match dashboard::handle_event(&event) {
                    Some(KeyAction::Quit) => break,
                    Some(KeyAction::Reconnect) => {
                        if let Err(e) = controller.connect() {
                            error!("Reconnect failed: {e}");
                        }
                    }
                    Some(KeyAction::RefreshPortfolio) => {
                        controller.refresh_portfolio().await;
                    }
                    Some(KeyAction::NextSymbol) => {
                        let current = controller.snapshot().symbol;
                        if let Some(next) = dashboard::next_symbol(&catalog, &current) {
                            subscription = follow(&next);
                            controller.set_symbol(&next).await;
                            let history = cache
                                .get_chart_data(
                                    &next,
                                    &settings.session.interval,
                                    settings.session.days,
                                    Some(&settings.session.session_id),
                                )
                                .await;
                            state.write().unwrap_or_else(|e| e.into_inner()).live_bar =
                                history.last().cloned();
                        }
                    }
                    None => {}
                }
            }

            // ── Ctrl-C without the dashboard ───────────────────────────────
            _ = tokio::signal::ctrl_c(), if terminal.is_none() => break,

            // ── Dashboard refresh tick ─────────────────────────────────────
            _ = dash_ticker.tick() => {}

            // ── Portfolio + quote poll ─────────────────────────────────────
            _ = poll_ticker.tick() => {
                tokio::join!(controller.refresh_portfolio(), controller.refresh_quote());

                let snap = controller.snapshot();
                if snap.ended {
                    info!("Session {} has ended", snap.session_id);
                    if terminal.is_none() {
                        break;
                    }
                    continue;
                }

                // Retry a dropped stream after the configured delay
                if controller.is_connected() || snap.phase == ConnectionPhase::Connecting {
                    down_since = None;
                } else {
                    let since = *down_since.get_or_insert_with(tokio::time::Instant::now);
                    if since.elapsed() >= reconnect_delay {
                        controller.ensure_connected();
                        down_since = None;
                    }
                }

                if terminal.is_none() {
                    info!(
                        "tick={} cash={:.2} positions={} phase={}",
                        snap.current_tick,
                        snap.cash,
                        snap.positions.len(),
                        snap.phase
                    );
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Graceful shutdown
    // -----------------------------------------------------------------------
    if let Some(ref mut term) = terminal {
        dashboard::teardown_terminal(term)?;
    }

    subscription.unsubscribe();
    controller.shutdown();

    let snap = controller.snapshot();
    info!(
        "Session {} closed at tick {} – cash {:.2}, {} open position(s)",
        snap.session_id,
        snap.current_tick,
        snap.cash,
        snap.positions.len()
    );

    Ok(())
}
