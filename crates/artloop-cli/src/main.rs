use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use artloop_contracts::events::EventWriter;
use artloop_contracts::session::{
    GeneratedArtifact, IterationRecord, SessionRecorder, SessionStatus, SessionTrace,
};
use artloop_engine::{
    Backend, CancelToken, Collaborators, EngineConfig, IterationFailure, LoopObserver,
    LoopOrchestrator, StylePreset,
};
use clap::{Parser, Subcommand};

const DEFAULT_PROMPT: &str = "A SKULL FULL OF COLORFUL BRAINROT";
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Parser)]
#[command(
    name = "artloop-rs",
    version,
    about = "Generate, describe, critique and re-prompt in a loop"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Run(RunArgs),
    Show(ShowArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long, default_value = DEFAULT_PROMPT)]
    prompt: String,
    #[arg(long, default_value_t = 1)]
    iterations: u32,
    /// Stability style preset, or `none`.
    #[arg(long)]
    style: Option<String>,
    #[arg(long, default_value = ".")]
    out: PathBuf,
    #[arg(long, default_value = "stability")]
    backend: String,
    /// Overrides ARTLOOP_ITERATION_DELAY_MS.
    #[arg(long)]
    delay_ms: Option<u64>,
    #[arg(long)]
    no_save: bool,
}

#[derive(Debug, Parser)]
struct ShowArgs {
    session: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("artloop-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_session_native(args),
        Command::Show(args) => run_show(args),
    }
}

fn run_session_native(args: RunArgs) -> Result<i32> {
    let backend: Backend = args.backend.parse()?;
    let style = match &args.style {
        Some(raw) => StylePreset::parse_hint(raw)?,
        None => None,
    };
    let config = EngineConfig::from_env()?;
    let collaborators = Collaborators::for_backend(backend, &config)?;
    let delay = args
        .delay_ms
        .map(Duration::from_millis)
        .unwrap_or(config.iteration_delay);

    let paintings_dir = args.out.join("paintings");
    let events = EventWriter::for_session(&args.out);
    let [generation, vision, mutator] = collaborators.names();
    println!("Session {} ({generation} / {vision} / {mutator})", events.session_id());

    let orchestrator = Arc::new(
        LoopOrchestrator::new(collaborators)
            .with_delay(delay)
            .with_style(style)
            .with_artifact_dir(&paintings_dir)
            .with_events(events)
            .with_observer(ConsoleObserver {
                paintings_dir: paintings_dir.clone(),
            }),
    );
    let cancel = CancelToken::new();
    spawn_stop_listener(cancel.clone());
    println!("Type q or stop and press enter to stop after the current step.");

    let worker = {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        let prompt = args.prompt.clone();
        let iterations = args.iterations;
        thread::spawn(move || orchestrator.run_session(&prompt, iterations, &cancel))
    };

    let status = orchestrator.status();
    let mut last_line = String::new();
    while !worker.is_finished() {
        let line = status.snapshot().progress_line();
        if line != last_line {
            eprintln!("{line}");
            last_line = line;
        }
        thread::sleep(STATUS_POLL_INTERVAL);
    }
    let outcome = worker
        .join()
        .map_err(|_| anyhow::anyhow!("session thread panicked"))??;

    let state = status.snapshot();
    println!(
        "Session {}: {} recorded, {} failed of {} requested.",
        outcome.status.as_str(),
        outcome.trace.len(),
        state.failed,
        outcome.trace.requested()
    );
    if let Some(err) = &state.last_error {
        println!("Last error: {err}");
    }
    print_trace(&outcome.trace);

    if args.no_save {
        return Ok(exit_code(outcome.status, &outcome.trace));
    }
    if outcome.trace.is_empty() {
        println!("Nothing recorded; session not saved.");
    } else {
        let recorder = SessionRecorder::new(args.out.join("sessions"));
        let path = recorder.persist(&outcome.trace)?;
        println!("Saved session to {}", path.display());
    }
    Ok(exit_code(outcome.status, &outcome.trace))
}

fn run_show(args: ShowArgs) -> Result<i32> {
    if !args.session.is_file() {
        bail!("no session file at {}", args.session.display());
    }
    let trace = SessionRecorder::load(&args.session)
        .with_context(|| format!("reading {}", args.session.display()))?;
    println!(
        "Session started {} ({} of {} generations recorded)",
        trace.started_at(),
        trace.len(),
        trace.requested()
    );
    print_trace(&trace);
    Ok(0)
}

/// A session that recorded nothing exits non-zero unless it was stopped on
/// request.
fn exit_code(status: SessionStatus, trace: &SessionTrace) -> i32 {
    match status {
        SessionStatus::Completed if trace.is_empty() => 2,
        _ => 0,
    }
}

fn print_trace(trace: &SessionTrace) {
    for record in trace.records() {
        println!();
        println!("{}", format_record(record));
    }
}

fn format_record(record: &IterationRecord) -> String {
    format!(
        "Generation {}\n  prompt:    {}\n  image:     {}\n  artist:    {}\n  critic:    {}\n  \
         new prompt: {}",
        record.index,
        record.input_prompt,
        record.artifact_id,
        record.description,
        record.critique,
        record.output_prompt
    )
}

fn is_stop_command(line: &str) -> bool {
    matches!(
        line.trim().to_ascii_lowercase().as_str(),
        "q" | "quit" | "stop"
    )
}

fn spawn_stop_listener(cancel: CancelToken) {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if is_stop_command(&line) {
                eprintln!("Stopping after the current step...");
                cancel.cancel();
                break;
            }
        }
    });
}

struct ConsoleObserver {
    paintings_dir: PathBuf,
}

impl LoopObserver for ConsoleObserver {
    fn on_artifact_ready(&self, iteration: u32, artifact: &GeneratedArtifact) {
        println!(
            "Generation {iteration}: image ready at {}",
            self.paintings_dir.join(&artifact.id).display()
        );
    }

    fn on_iteration_completed(&self, record: &IterationRecord) {
        println!("Generation {}: next prompt: {}", record.index, record.output_prompt);
    }

    fn on_iteration_failed(&self, iteration: u32, failure: &IterationFailure) {
        eprintln!("Generation {iteration} skipped: {failure}");
    }
}
