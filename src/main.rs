use anyhow::{Context as _, Result, bail};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rpa_trace::config::{Preset, default_output_dir};
use rpa_trace::recorder::ListenerEvent;
use rpa_trace::{
    FlattenOptions, NullSurface, RecorderConfig, Step, TraceRecorder, build_dataset, build_history, load_trace,
};

#[derive(Parser)]
#[command(name = "rpa-trace", version, about = "Record, inspect and flatten automation traces")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Flatten every trace below a directory into a JSONL training set.
    Dataset {
        /// Directory searched recursively for `.trace` and `.json` files.
        #[arg(env = "RPA_TRACE_OUTPUT_DIR", default_value_os_t = default_output_dir())]
        dir: PathBuf,
        /// Output file. Standard output when omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        history: HistoryFlags,
    },
    /// Print the step tree of a trace.
    Inspect { trace: PathBuf },
    /// Print the instruction history of one step as JSON.
    History {
        trace: PathBuf,
        step_id: u64,
        #[command(flatten)]
        history: HistoryFlags,
    },
    /// Feed a JSONL listener-event log through the recorder and persist the
    /// resulting traces.
    Replay {
        events: PathBuf,
        #[arg(long, default_value = "browser")]
        preset: Preset,
        /// JSON recorder configuration; overrides the preset.
        #[arg(long, env = "RPA_TRACE_CONFIG")]
        config: Option<PathBuf>,
        #[arg(long, env = "RPA_TRACE_OUTPUT_DIR")]
        output_dir: Option<PathBuf>,
    },
}

#[derive(Args, Clone, Copy)]
struct HistoryFlags {
    /// Keep enclosing task names in histories.
    #[arg(long)]
    include_task_names: bool,
    /// Drop scroll entries from histories.
    #[arg(long)]
    ignore_scroll: bool,
}

impl From<HistoryFlags> for FlattenOptions {
    fn from(flags: HistoryFlags) -> Self {
        FlattenOptions {
            include_task_names: flags.include_task_names,
            ignore_scroll_entries: flags.ignore_scroll,
        }
    }
}

fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    match Cli::parse().command {
        Command::Dataset { dir, output, history } => {
            let options = FlattenOptions::from(history);
            let summary = match output {
                Some(path) => {
                    let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
                    build_dataset(&dir, options, BufWriter::new(file))?
                }
                None => build_dataset(&dir, options, io::stdout().lock())?,
            };
            info!(traces = summary.traces, examples = summary.examples, "dataset written");
        }
        Command::Inspect { trace } => {
            let root = load_trace(&trace).with_context(|| format!("loading {}", trace.display()))?;
            let mut out = io::stdout().lock();
            print_tree(&mut out, &root, 0)?;
        }
        Command::History {
            trace,
            step_id,
            history,
        } => {
            let root = load_trace(&trace).with_context(|| format!("loading {}", trace.display()))?;
            let prompt = build_history(&root, step_id, history.include_task_names, history.ignore_scroll)?;
            println!("{}", serde_json::to_string_pretty(&prompt)?);
        }
        Command::Replay {
            events,
            preset,
            config,
            output_dir,
        } => {
            let mut config = match config {
                Some(path) => RecorderConfig::from_file(&path)?,
                None => RecorderConfig::preset(preset),
            };
            if let Some(dir) = output_dir {
                config = config.with_output_dir(dir);
            }
            replay(&events, config)?;
        }
    }
    Ok(())
}

fn replay(events: &Path, config: RecorderConfig) -> Result<()> {
    let file = File::open(events).with_context(|| format!("opening {}", events.display()))?;
    let mut recorder = TraceRecorder::new(config, NullSurface);
    let mut saved = 0;

    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: ListenerEvent =
            serde_json::from_str(&line).with_context(|| format!("line {}: invalid event", number + 1))?;
        if let Some(path) = recorder
            .handle(&event)
            .with_context(|| format!("line {}: replay failed", number + 1))?
        {
            println!("{}", path.display());
            saved += 1;
        }
    }

    if !recorder.stack().is_empty() {
        bail!("event log ended with {} unfinished steps", recorder.stack().len());
    }
    info!(traces = saved, "replay finished");
    Ok(())
}

fn print_tree(out: &mut impl Write, step: &Step, depth: usize) -> io::Result<()> {
    let status = step
        .context
        .as_ref()
        .map(|c| c.status.as_str())
        .unwrap_or("-");
    write!(out, "{:indent$}[{}] {} {} ({}, {})", "", step.id, step.kind_name(), step.name, step.status, status, indent = depth * 2)?;
    if let Some(bbox) = step.args().and_then(|a| a.bbox) {
        write!(out, " {bbox}")?;
    }
    writeln!(out)?;
    for child in step.children() {
        print_tree(out, child, depth + 1)?;
    }
    Ok(())
}
