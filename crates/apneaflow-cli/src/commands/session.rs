use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use apneaflow_core::audio::{AudioSourceResolver, HttpAudioResolver, SourceRef, StaticResolver};
use apneaflow_core::metrics::{HttpMetricsReporter, MetricsReporter, NullReporter};
use apneaflow_core::session::{BreathStyle, HoldTarget};
use apneaflow_core::storage::SqliteProgressStore;
use apneaflow_core::{
    AppConfig, Database, Event, Input, SessionConfig, SessionController, SessionRunner,
    SystemClock,
};

use crate::terminal_audio::TerminalTrackSet;

#[derive(Subcommand)]
pub enum SessionAction {
    /// Run a session, reading commands from stdin and printing events as JSON lines
    ///
    /// Commands: pause, resume, end, hold-end, hold-stop, close, release,
    /// stop, hide, show, status, ambient <slug>, quit.
    Run {
        #[command(flatten)]
        overrides: SessionOverrides,
    },
    /// Print the timing and audio sources a session would use
    Plan {
        #[command(flatten)]
        overrides: SessionOverrides,
    },
}

/// Per-run overrides on top of `[session]` in config.toml.
#[derive(Args, Debug, Default)]
pub struct SessionOverrides {
    /// Number of breath/apnea/recovery cycles
    #[arg(long)]
    cycles: Option<u32>,
    /// Breaths per cycle
    #[arg(long)]
    breaths: Option<u32>,
    /// Pace preset: activation, reset or comfort
    #[arg(long)]
    style: Option<BreathStyle>,
    /// Inhale seconds (applied after --style)
    #[arg(long)]
    inhale: Option<f64>,
    /// Exhale seconds (applied after --style)
    #[arg(long)]
    exhale: Option<f64>,
    /// Recovery seconds after each apnea
    #[arg(long)]
    recovery: Option<f64>,
}

impl SessionOverrides {
    fn apply(&self, mut config: SessionConfig) -> SessionConfig {
        if let Some(style) = self.style {
            config = config.with_style(style);
        }
        if let Some(cycles) = self.cycles {
            config.cycles = cycles;
        }
        if let Some(breaths) = self.breaths {
            config.breaths_per_cycle = breaths;
        }
        if let Some(inhale) = self.inhale {
            config.inhale_seconds = inhale;
        }
        if let Some(exhale) = self.exhale {
            config.exhale_seconds = exhale;
        }
        if let Some(recovery) = self.recovery {
            config.recovery_seconds = recovery;
        }
        config
    }
}

/// A parsed stdin line.
#[derive(Debug, PartialEq)]
enum Command {
    Send(Input),
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    let input = match parts.next()? {
        "pause" => Input::Pause,
        "resume" => Input::Resume,
        "end" => Input::EndApnea,
        "hold-end" => Input::BeginHold(HoldTarget::EndApnea),
        "hold-stop" => Input::BeginHold(HoldTarget::Stop),
        "close" => Input::BeginHold(HoldTarget::FinalClose),
        "release" => Input::ReleaseHold,
        "stop" => Input::Stop,
        "hide" => Input::Hidden,
        "show" => Input::Visible,
        "status" => Input::Snapshot,
        "ambient" => Input::SwapAmbient(SourceRef::new(parts.next()?)),
        "quit" | "exit" => return Some(Command::Quit),
        _ => return None,
    };
    Some(Command::Send(input))
}

fn session_config(app: &AppConfig, overrides: &SessionOverrides) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    let config = overrides.apply(app.session_config()?);
    config.validate()?;
    Ok(config)
}

pub fn run(action: SessionAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        SessionAction::Run { overrides } => {
            let rt = tokio::runtime::Runtime::new()?;
            let result = rt.block_on(run_session(overrides));
            // A pending stdin read would otherwise keep the runtime alive.
            rt.shutdown_timeout(Duration::from_secs(1));
            result?;
        }
        SessionAction::Plan { overrides } => {
            let app = AppConfig::load()?;
            let config = session_config(&app, &overrides)?;
            let sources: Vec<_> = app
                .source_plan(&config)
                .entries
                .iter()
                .map(|(track, source)| serde_json::json!({ "track": track, "slug": source.slug }))
                .collect();
            let plan = serde_json::json!({
                "session": config,
                "breathing_ms_per_cycle": config.breathing_ms(),
                "timed_total_ms": config.timed_total_ms(),
                "pre_apnea_breath": config.pre_apnea_breath(),
                "sources": sources,
                "remote": app.remote_base()?.map(|u| u.to_string()),
            });
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
    }
    Ok(())
}

async fn run_session(overrides: SessionOverrides) -> Result<(), Box<dyn std::error::Error>> {
    let app = AppConfig::load()?;
    let config = session_config(&app, &overrides)?;
    let controller = SessionController::new(config.clone(), app.controller_settings(), SystemClock)?;

    let (resolver, reporter): (Arc<dyn AudioSourceResolver>, Arc<dyn MetricsReporter>) =
        match app.remote_base()? {
            Some(base) => {
                let client = reqwest::Client::new();
                (
                    Arc::new(HttpAudioResolver::new(client.clone(), base.clone())),
                    Arc::new(HttpMetricsReporter::new(client, base)),
                )
            }
            None => {
                tracing::info!("remote.base_url not set; running without audio sources");
                (Arc::new(StaticResolver::new()), Arc::new(NullReporter))
            }
        };

    let progress = SqliteProgressStore::new(Database::open()?);
    let (runner, handle, mut events) = SessionRunner::new(
        controller,
        Box::new(TerminalTrackSet::new()),
        resolver,
        reporter,
        Box::new(progress),
    );
    let runner = runner
        .with_plan(app.source_plan(&config))
        .with_identity(app.identity())
        .with_tick(Duration::from_millis(app.timing.tick_ms))
        .with_history(Database::open()?);
    let task = tokio::spawn(runner.run());
    handle.start();

    // Commands are only read once the session is live, so a scripted
    // "stop" cannot race the source resolution.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut started = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                match event {
                    Event::SessionStarted { .. } => started = true,
                    Event::SessionStopped { .. } | Event::SessionFinalized { .. } => break,
                    _ => {}
                }
            }
            line = lines.next_line(), if started => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Some(Command::Send(input)) => {
                        if !handle.send(input) {
                            break;
                        }
                    }
                    Some(Command::Quit) => break,
                    None if line.trim().is_empty() => {}
                    None => eprintln!("unknown command: {}", line.trim()),
                }
            }
        }
    }

    handle.shutdown();
    task.await?;
    while let Ok(event) = events.try_recv() {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}
