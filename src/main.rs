use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;
use tracing::{info, warn};

use opta_core::ids::{DaemonId, SessionId};
use opta_core::settings::{self, DaemonSettings};
use opta_engine::tools::create_default_registry;
use opta_engine::{
    EventSequencer, SessionManager, SessionManagerConfig, SubscriptionHub, ToolRuntime,
    ToolRuntimeConfig, Watchdog, WatchdogConfig,
};
use opta_server::{AuthToken, RemoteConfig, ServerConfig, ServerParts};
use opta_store::{DaemonState, Database, MemorySessionStore, SessionStore, SqliteSessionStore};
use opta_telemetry::{init_telemetry, parse_level, read_log_tail, TelemetryConfig};
use opta_upstream::{ConnectionManager, UpstreamAgentLoop, UpstreamConfig, UpstreamProbe};

#[derive(Parser)]
#[command(name = "optad", version, about = "Local session daemon for Opta clients")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground (default).
    Serve(ServeArgs),
    /// Report whether a daemon is running and what it is doing.
    Status,
    /// Print the tail of the daemon log.
    Logs {
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
    /// Follow a session's event stream, one JSON envelope per line.
    Watch {
        session_id: String,
        #[arg(long, default_value_t = 0)]
        after_seq: u64,
    },
}

#[derive(Args, Default)]
struct ServeArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Inference hosts; the first is preferred, the rest are fallbacks.
    #[arg(long = "upstream", value_delimiter = ',')]
    upstream: Vec<String>,
    #[arg(long)]
    token: Option<String>,
    /// Keep sessions in memory only.
    #[arg(long)]
    ephemeral: bool,
    #[arg(long)]
    log_level: Option<String>,
}

impl ServeArgs {
    fn apply(self, settings: &mut DaemonSettings) {
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        let mut hosts = self.upstream.into_iter().filter(|h| !h.trim().is_empty());
        if let Some(preferred) = hosts.next() {
            settings.upstream.preferred_host = preferred;
            settings.upstream.fallback_hosts = hosts.collect();
        }
        if self.token.is_some() {
            settings.server.token = self.token;
        }
        if self.ephemeral {
            settings.storage.ephemeral = true;
        }
        if let Some(level) = self.log_level {
            settings.logging.level = level;
        }
    }
}

fn load_settings() -> Result<DaemonSettings> {
    let mut loaded = settings::load_settings()
        .with_context(|| format!("failed to load {}", settings::settings_path().display()))?;
    settings::apply_env_overrides(&mut loaded);
    Ok(loaded)
}

fn log_path(settings: &DaemonSettings) -> PathBuf {
    settings
        .logging
        .file
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| settings::daemon_dir().join("daemon.log"))
}

fn state_path() -> PathBuf {
    settings::daemon_dir().join("state.json")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => serve(args).await,
        Command::Status => status().await,
        Command::Logs { lines } => logs(lines),
        Command::Watch {
            session_id,
            after_seq,
        } => watch(session_id, after_seq).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut settings = load_settings()?;
    args.apply(&mut settings);

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: parse_level(&settings.logging.level),
        module_levels: Vec::new(),
        stdout: settings.logging.stdout,
        log_file: Some(log_path(&settings)),
    })?;

    let daemon_id = DaemonId::new();
    info!(daemon_id = %daemon_id, "starting optad");

    let store: Arc<dyn SessionStore> = if settings.storage.ephemeral {
        info!("ephemeral storage; sessions will not survive a restart");
        Arc::new(MemorySessionStore::new())
    } else {
        let path = settings
            .storage
            .database_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| settings::daemon_dir().join("sessions.db"));
        let db = Database::open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        info!(path = %path.display(), "database opened");
        Arc::new(SqliteSessionStore::new(db))
    };

    let upstream = Arc::new(ConnectionManager::new(
        UpstreamConfig::from_settings(&settings.upstream),
        settings.upstream.api_key.clone().map(SecretString::from),
    ));
    let agent = Arc::new(UpstreamAgentLoop::new(Arc::clone(&upstream)));
    let tools = Arc::new(ToolRuntime::new(
        create_default_registry(),
        ToolRuntimeConfig::from_settings(&settings.tools),
    ));
    let sequencer = Arc::new(EventSequencer::new(
        daemon_id.clone(),
        Arc::clone(&store),
        SubscriptionHub::new(),
    ));
    let sessions = SessionManager::new(
        store,
        sequencer,
        agent,
        tools,
        SessionManagerConfig::from_settings(&settings.sessions),
    );
    sessions.restore()?;

    let watchdog = settings.watchdog.enabled.then(|| {
        let watchdog = Watchdog::new(
            Arc::new(UpstreamProbe::new(Arc::clone(&upstream))),
            WatchdogConfig::from_settings(&settings.watchdog),
            |alert| {
                warn!(
                    target_name = %alert.target,
                    failures = alert.consecutive_failures,
                    reason = %alert.reason,
                    "inference backend unreachable"
                )
            },
        )
        .with_recovery(|target| info!(target_name = %target, "inference backend reachable again"));
        watchdog.start();
        Arc::new(watchdog)
    });

    let token = settings
        .server
        .token
        .clone()
        .map(AuthToken::new)
        .unwrap_or_else(AuthToken::generate);
    let token_text = token.expose().to_string();
    let handle = opta_server::start(
        ServerConfig::from_settings(&settings.server),
        ServerParts {
            sessions: sessions.clone(),
            token,
            upstream: Some(Arc::clone(&upstream)),
            watchdog: watchdog.clone(),
        },
    )
    .await
    .context("failed to start server")?;

    let state_file = state_path();
    DaemonState {
        pid: std::process::id(),
        daemon_id,
        host: settings.server.host.clone(),
        port: handle.port(),
        token: token_text,
        started_at: Utc::now(),
    }
    .write(&state_file)?;
    info!(port = handle.port(), state = %state_file.display(), "optad ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    if let Some(watchdog) = &watchdog {
        watchdog.stop();
    }
    sessions.shutdown().await;
    handle.shutdown().await;
    if let Err(e) = DaemonState::remove(&state_file) {
        warn!(error = %e, "failed to remove daemon state file");
    }
    info!("stopped");
    Ok(())
}

async fn status() -> Result<()> {
    let Some(state) = DaemonState::read(&state_path())? else {
        println!("optad is not running");
        return Ok(());
    };

    let client = reqwest::Client::new();
    let base = state.base_url();
    let health = client.get(format!("{base}/health")).send().await;
    let health: serde_json::Value = match health {
        Ok(resp) => resp.json().await?,
        Err(e) => {
            println!(
                "optad (pid {}) is not answering on {base}: {e}; the state file may be stale",
                state.pid
            );
            return Ok(());
        }
    };
    let stats: serde_json::Value = client
        .get(format!("{base}/v1/stats"))
        .bearer_auth(&state.token)
        .send()
        .await?
        .json()
        .await?;

    println!("optad running (pid {}) on {base}", state.pid);
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({ "health": health, "stats": stats }))?
    );
    Ok(())
}

fn logs(lines: usize) -> Result<()> {
    let settings = load_settings()?;
    let path = log_path(&settings);
    for line in read_log_tail(&path, lines)
        .with_context(|| format!("failed to read {}", path.display()))?
    {
        println!("{line}");
    }
    Ok(())
}

async fn watch(session_id: String, after_seq: u64) -> Result<()> {
    let state = DaemonState::read(&state_path())?.context("optad is not running")?;
    let mut config = RemoteConfig::new(
        format!("ws://{}:{}", state.host, state.port),
        state.token,
        SessionId::from_raw(session_id),
    );
    config.after_seq = after_seq;
    let mut stream = opta_server::follow(config);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = stream.next() => match next {
                Some(envelope) => println!("{}", serde_json::to_string(&envelope)?),
                None => anyhow::bail!("event stream closed by the daemon"),
            },
        }
    }
    Ok(())
}
