mod browser;
mod dom;
mod hands;

use anyhow::{Context, Result, bail};
use browser::BrowserSurface;
use clap::Parser;
use dotenvy::dotenv;
use rpa_trace::classify::KeywordEvent;
use rpa_trace::step::STATUS_PASS;
use rpa_trace::{AgentCommand, InferenceClient, RecorderConfig, Surface, TraceRecorder};
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::block_in_place;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Drive Chrome with the action-prediction model and record what it does.
#[derive(Parser)]
#[command(name = "agent", version)]
struct Args {
    /// What the agent should accomplish, in plain words.
    task: String,
    /// Page to open before the first step.
    #[arg(long)]
    url: Option<String>,
    #[arg(long, env = "AI_URL", default_value = "http://localhost:8080/predict_rf")]
    ai_url: String,
    #[arg(long, default_value_t = 5)]
    max_steps: usize,
    /// Keep enclosing task names in the instruction history.
    #[arg(long)]
    with_tasks: bool,
    /// DevTools endpoint of a Chrome to attach to instead of launching one.
    #[arg(long, env = "CHROME_DEBUG_URL")]
    attach: Option<String>,
    #[arg(long)]
    headless: bool,
    /// Pause after each action, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    wait_ms: u64,
    #[arg(long, env = "RPA_TRACE_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,
}

type AgentRecorder = TraceRecorder<BrowserSurface>;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    info!("launching chrome");
    let (attach, headless) = (args.attach.clone(), args.headless);
    let session = tokio::task::spawn_blocking(move || hands::BrowserSession::launch(attach, headless, (1280, 720)))
        .await
        .context("browser launch panicked")??;
    if let Some(url) = &args.url {
        block_in_place(|| session.navigate(url)).with_context(|| format!("opening {url}"))?;
    }

    let mut config = RecorderConfig::browser();
    if let Some(dir) = &args.output_dir {
        config = config.with_output_dir(dir);
    }
    let surface = BrowserSurface::new(session, Duration::from_millis(args.wait_ms));
    let mut recorder = TraceRecorder::new(config, surface);
    let client = InferenceClient::new(&args.ai_url);

    recorder.start_suite("agent");
    recorder.start_test(&args.task);
    block_in_place(|| recorder.start_task(&args.task))?;

    let outcome = run_task(&mut recorder, &client, &args).await;
    let status = match &outcome {
        Ok(()) => STATUS_PASS,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "task failed");
            "FAIL"
        }
    };

    block_in_place(|| -> Result<()> {
        recorder.end_task(status)?;
        if let Some(path) = recorder.end_test(&args.task, status, &[])? {
            info!(path = %path.display(), "trace saved");
        }
        Ok(())
    })?;
    outcome
}

async fn run_task(recorder: &mut AgentRecorder, client: &InferenceClient, args: &Args) -> Result<()> {
    for step in 1..=args.max_steps {
        let history = recorder.current_history(args.with_tasks, true)?;
        let screenshot = recorder.last_observation().screenshot.to_string();

        info!(step, history = history.len(), url = %recorder.surface().current_url(), "asking for next action");
        let command = client.next_command(&screenshot, &history).await?;
        info!(step, ?command, "model answered");

        let event = match keyword_for(&command, recorder)? {
            Some(event) => event,
            None if command == AgentCommand::End => {
                info!(step, "task complete");
                return Ok(());
            }
            None => bail!("model returned an unusable action: {command:?}"),
        };
        block_in_place(|| perform(recorder, &command, event))?;
    }

    warn!(max_steps = args.max_steps, "step limit reached");
    block_in_place(|| recorder.surface_mut().scroll_to_top())?;
    Ok(())
}

/// The recorded keyword a command stands for. `None` for `End` and
/// unparsed output.
fn keyword_for(command: &AgentCommand, recorder: &mut AgentRecorder) -> Result<Option<KeywordEvent>> {
    let library = recorder.config().observed_library.clone();
    let tag = recorder.config().action_tags.first().cloned().unwrap_or_default();
    let keyword = |name: &str, args: &[&str]| {
        KeywordEvent::keyword(Some(library.as_str()), name)
            .with_tags(&[tag.as_str()])
            .with_args(args)
    };

    Ok(match command {
        AgentCommand::ClickAt(bbox) => Some(keyword("Click At BBox", &[bbox.to_string().as_str()])),
        AgentCommand::Input(text) => Some(keyword("Keyboard Input", &["type", text.as_str()])),
        AgentCommand::Scroll => {
            let height = block_in_place(|| recorder.surface_mut().viewport())?.height;
            Some(keyword("Scroll Down", &[(height / 2).to_string().as_str()]))
        }
        AgentCommand::Key(keys) => Some(keyword("Keyboard Key", &["press", keys.as_str()])),
        AgentCommand::End | AgentCommand::Unknown(_) => None,
    })
}

/// Run one command on the page between the keyword's start and end events.
fn perform(recorder: &mut AgentRecorder, command: &AgentCommand, event: KeywordEvent) -> Result<()> {
    recorder.start_keyword(&event)?;
    let outcome = recorder.surface_mut().execute(command);
    if outcome.is_ok() {
        recorder.after_keyword_run()?;
    }
    let status = if outcome.is_ok() { STATUS_PASS } else { "FAIL" };
    recorder.end_keyword(&event.with_status(status))?;
    outcome
}
