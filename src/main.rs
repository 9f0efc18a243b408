//! CLI driver: a thin local harness over the Job Orchestrator's
//! submit/status/interrupt/resume/list_active surface, with human-facing
//! progress output.

use std::io::{self, IsTerminal, Read};

use longform_translate::config::{self, Config};
use longform_translate::model::{ChunkingConfig, PromptOptions};
use longform_translate::orchestrator::{EventKind, Orchestrator};
use longform_translate::output::{print_error, print_verbose, Colorize};
use longform_translate::provider::{ProviderConfig, ProviderKind};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn usage() -> &'static str {
    "longform-translate - long-form document translation engine

USAGE:
    longform-translate submit --input <path> --output <path> [OPTIONS]
    longform-translate status <job-id>
    longform-translate interrupt <job-id>
    longform-translate resume <job-id>
    longform-translate list
    longform-translate --help
    longform-translate --version

SUBMIT OPTIONS:
    --input <path>              Input document (.txt, .epub, or .srt)
    --output <path>             Output path
    --source <lang>             Source language (default: auto)
    --target <lang>             Target language (default: en)
    --provider <name>           ollama | openai_compatible | gemini | openrouter
    --endpoint <url>            Provider HTTP endpoint
    --model <name>              Model identifier
    --api-key <key>             Provider API key (also read from <PROVIDER>_API_KEY)
    --token-budget <n>          Chunk token budget (default: 400)
    --text-cleanup              Ask the model to silently fix OCR artefacts
    --refine                    Run a second editing pass over each chunk
    --custom-instructions <s>   Free-form instruction text appended to the system prompt
    --verbose, -v                Print progress to stderr as chunks complete"
}

struct Flags {
    positional: Vec<String>,
    values: std::collections::HashMap<String, String>,
    bools: std::collections::HashSet<String>,
}

fn parse_flags(args: &[String]) -> Flags {
    let mut positional = Vec::new();
    let mut values = std::collections::HashMap::new();
    let mut bools = std::collections::HashSet::new();

    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        if let Some(name) = arg.strip_prefix("--") {
            match args.get(i + 1) {
                Some(next) if !next.starts_with("--") => {
                    values.insert(name.to_string(), next.clone());
                    i += 2;
                }
                _ => {
                    bools.insert(name.to_string());
                    i += 1;
                }
            }
        } else if arg == "-v" {
            bools.insert("verbose".to_string());
            i += 1;
        } else {
            positional.push(arg.clone());
            i += 1;
        }
    }

    Flags { positional, values, bools }
}

fn parse_provider_kind(s: &str) -> Result<ProviderKind, String> {
    match s {
        "ollama" => Ok(ProviderKind::Ollama),
        "openai_compatible" | "openai" => Ok(ProviderKind::OpenAiCompatible),
        "gemini" => Ok(ProviderKind::Gemini),
        "openrouter" => Ok(ProviderKind::OpenRouter),
        other => Err(format!(
            "unknown provider '{other}'; expected ollama, openai_compatible, gemini, or openrouter"
        )),
    }
}

fn build_provider_config(flags: &Flags, config: &Config) -> Result<ProviderConfig, String> {
    let provider_name = flags
        .values
        .get("provider")
        .cloned()
        .or_else(|| config.llm_provider.clone())
        .ok_or_else(|| "missing --provider (or configure llmProvider)".to_string())?;
    let kind = parse_provider_kind(&provider_name)?;

    let endpoint = flags
        .values
        .get("endpoint")
        .cloned()
        .or_else(|| config.api_endpoint.clone())
        .ok_or_else(|| "missing --endpoint (or configure apiEndpoint)".to_string())?;

    let model = flags
        .values
        .get("model")
        .cloned()
        .or_else(|| config.default_model.clone())
        .ok_or_else(|| "missing --model (or configure defaultModel)".to_string())?;

    let api_key = flags.values.get("api-key").cloned().or_else(|| {
        std::env::var(format!("{}_API_KEY", provider_name.to_uppercase())).ok()
    });

    Ok(ProviderConfig {
        kind,
        endpoint,
        api_key,
        model,
        timeout_secs: config.request_timeout_secs,
        context_window_hint: None,
        extra_headers: vec![],
    })
}

fn build_chunking_config(flags: &Flags, config: &Config) -> ChunkingConfig {
    let token_budget = flags
        .values
        .get("token-budget")
        .and_then(|v| v.parse().ok())
        .unwrap_or(config.max_tokens_per_chunk);
    ChunkingConfig {
        token_budget,
        abbreviations: longform_translate::chunker::default_abbreviations(),
    }
}

fn build_prompt_options(flags: &Flags) -> PromptOptions {
    PromptOptions {
        text_cleanup: flags.bools.contains("text-cleanup"),
        refine: flags.bools.contains("refine"),
        custom_instructions: flags.values.get("custom-instructions").cloned(),
        session_id: None,
    }
}

async fn cmd_submit(flags: Flags, config: Config) {
    let verbose = flags.bools.contains("verbose");

    let input = match flags.values.get("input") {
        Some(v) => v.clone(),
        None => {
            print_error("missing --input");
            std::process::exit(1);
        }
    };
    let output = match flags.values.get("output") {
        Some(v) => v.clone(),
        None => {
            print_error("missing --output");
            std::process::exit(1);
        }
    };
    let source = flags
        .values
        .get("source")
        .cloned()
        .unwrap_or_else(|| config.default_source_language.clone());
    let target = flags
        .values
        .get("target")
        .cloned()
        .unwrap_or_else(|| config.default_target_language.clone());

    let provider_config = match build_provider_config(&flags, &config) {
        Ok(p) => p,
        Err(e) => {
            print_error(&e);
            std::process::exit(1);
        }
    };
    let chunking_config = build_chunking_config(&flags, &config);
    let prompt_options = build_prompt_options(&flags);

    let orchestrator = match Orchestrator::new(&config) {
        Ok(o) => o,
        Err(e) => {
            print_error(&format!("failed to open checkpoint store: {e}"));
            std::process::exit(1);
        }
    };

    let mut events = orchestrator.subscribe();
    let job_id = match orchestrator
        .submit(input, output, source, target, provider_config, chunking_config, prompt_options)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            print_error(&format!("submit failed: {e}"));
            std::process::exit(1);
        }
    };

    println!("{} {}", "job submitted:".green(), job_id);
    run_event_loop(&orchestrator, &mut events, &job_id, verbose).await;
}

async fn cmd_resume(flags: Flags, config: Config) {
    let verbose = flags.bools.contains("verbose");
    let job_id = match flags.positional.first() {
        Some(id) => id.clone(),
        None => {
            print_error("usage: longform-translate resume <job-id>");
            std::process::exit(1);
        }
    };

    let orchestrator = match Orchestrator::new(&config) {
        Ok(o) => o,
        Err(e) => {
            print_error(&format!("failed to open checkpoint store: {e}"));
            std::process::exit(1);
        }
    };

    let mut events = orchestrator.subscribe();
    if let Err(e) = orchestrator.resume(&job_id).await {
        print_error(&format!("resume failed: {e}"));
        std::process::exit(1);
    }

    println!("{} {}", "job resumed:".green(), job_id);
    run_event_loop(&orchestrator, &mut events, &job_id, verbose).await;
}

/// Block printing progress until the job reaches a terminal state, or the
/// user interrupts via Ctrl+C (which requests cooperative cancellation
/// rather than killing the process).
async fn run_event_loop(
    orchestrator: &std::sync::Arc<Orchestrator>,
    events: &mut tokio::sync::broadcast::Receiver<longform_translate::orchestrator::Event>,
    job_id: &str,
    verbose: bool,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) if event.job_id == job_id => {
                        if print_event(&event, verbose) {
                            return;
                        }
                    }
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        print_status_once(orchestrator, job_id);
                        return;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("{}", "interrupt requested, finishing the in-flight chunk...".yellow());
                if let Err(e) = orchestrator.interrupt(job_id).await {
                    print_error(&format!("interrupt failed: {e}"));
                }
            }
        }
    }
}

/// Print one event; returns true if it was terminal for the job.
fn print_event(event: &longform_translate::orchestrator::Event, verbose: bool) -> bool {
    match &event.kind {
        EventKind::ChunkStarted => {
            if let Some(idx) = event.chunk_index {
                print_verbose(&format!("chunk {idx} started"), verbose);
            }
            false
        }
        EventKind::ChunkProgress(msg) => {
            print_verbose(msg, verbose);
            false
        }
        EventKind::ChunkCompleted => {
            if let Some(idx) = event.chunk_index {
                print_verbose(&format!("chunk {idx} completed"), verbose);
            }
            false
        }
        EventKind::CheckpointWritten => false,
        EventKind::ChunkFailed { error_kind } => {
            if let Some(idx) = event.chunk_index {
                eprintln!("{} chunk {idx} failed: {error_kind}", "warning:".yellow());
            }
            false
        }
        EventKind::JobCompleted => {
            println!("{}", "job completed".green());
            true
        }
        EventKind::JobFailed { error } => {
            print_error(&format!("job failed: {error}"));
            true
        }
        EventKind::JobInterrupted => {
            println!("{}", "job interrupted; resume with `longform-translate resume <job-id>`".yellow());
            true
        }
    }
}

fn print_status_once(orchestrator: &Orchestrator, job_id: &str) {
    match orchestrator.status(job_id) {
        Ok(Some(view)) => println!("{job_id}: {:?}", view.status),
        Ok(None) => print_error(&format!("no such job: {job_id}")),
        Err(e) => print_error(&format!("status lookup failed: {e}")),
    }
}

fn cmd_status(flags: Flags, config: Config) {
    let job_id = match flags.positional.first() {
        Some(id) => id.clone(),
        None => {
            print_error("usage: longform-translate status <job-id>");
            std::process::exit(1);
        }
    };

    let orchestrator = match Orchestrator::new(&config) {
        Ok(o) => o,
        Err(e) => {
            print_error(&format!("failed to open checkpoint store: {e}"));
            std::process::exit(1);
        }
    };

    match orchestrator.status(&job_id) {
        Ok(Some(view)) => {
            println!("job_id:     {job_id}");
            println!("status:     {:?}", view.status);
            println!(
                "progress:   {}/{} chunks ({} failed)",
                view.stats.completed_chunks, view.stats.total_chunks, view.stats.failed_chunks
            );
            println!("tokens:     {} in / {} out", view.stats.tokens_in, view.stats.tokens_out);
            if let Some(err) = &view.last_error {
                println!("last_error: {err}");
            }
        }
        Ok(None) => {
            print_error(&format!("no such job: {job_id}"));
            std::process::exit(1);
        }
        Err(e) => {
            print_error(&format!("status lookup failed: {e}"));
            std::process::exit(1);
        }
    }
}

async fn cmd_interrupt(flags: Flags, config: Config) {
    let job_id = match flags.positional.first() {
        Some(id) => id.clone(),
        None => {
            print_error("usage: longform-translate interrupt <job-id>");
            std::process::exit(1);
        }
    };

    let orchestrator = match Orchestrator::new(&config) {
        Ok(o) => o,
        Err(e) => {
            print_error(&format!("failed to open checkpoint store: {e}"));
            std::process::exit(1);
        }
    };

    // A job's handle only lives in the process that submitted or resumed it,
    // so this only succeeds against a job this same invocation is driving --
    // in practice, Ctrl+C during `submit`/`resume`. Cross-process interrupt
    // requests are reported honestly rather than silently accepted.
    match orchestrator.interrupt(&job_id).await {
        Ok(()) => println!("interrupt requested for {job_id}"),
        Err(e) => {
            print_error(&format!(
                "{e} (interrupt only works against a job this process is actively driving)"
            ));
            std::process::exit(1);
        }
    }
}

fn cmd_list(config: Config) {
    let orchestrator = match Orchestrator::new(&config) {
        Ok(o) => o,
        Err(e) => {
            print_error(&format!("failed to open checkpoint store: {e}"));
            std::process::exit(1);
        }
    };

    match orchestrator.list_active() {
        Ok(ids) if ids.is_empty() => println!("no active jobs"),
        Ok(ids) => {
            for id in ids {
                println!("{id}");
            }
        }
        Err(e) => {
            print_error(&format!("failed to list jobs: {e}"));
            std::process::exit(1);
        }
    }
}

/// Standalone `submit` also accepts an input document piped on stdin when
/// `--input -` is given, for shell-pipeline use.
fn read_stdin_to_tempfile() -> io::Result<std::path::PathBuf> {
    let mut input = String::new();
    if io::stdin().is_terminal() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "no piped input on stdin"));
    }
    io::stdin().read_to_string(&mut input)?;
    let path = std::env::temp_dir().join(format!("longform-translate-stdin-{}.txt", std::process::id()));
    std::fs::write(&path, input)?;
    Ok(path)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.is_empty() || args[0] == "--help" || args[0] == "-h" {
        println!("{}", usage());
        return;
    }
    if args[0] == "--version" {
        println!("longform-translate {VERSION}");
        return;
    }

    let subcommand = args[0].clone();
    let mut flags = parse_flags(&args[1..]);
    let config = config::load_config();

    match subcommand.as_str() {
        "submit" => {
            if flags.values.get("input").map(String::as_str) == Some("-") {
                match read_stdin_to_tempfile() {
                    Ok(path) => {
                        flags.values.insert("input".into(), path.to_string_lossy().into_owned());
                    }
                    Err(e) => {
                        print_error(&format!("failed to read stdin: {e}"));
                        std::process::exit(1);
                    }
                }
            }
            cmd_submit(flags, config).await;
        }
        "status" => cmd_status(flags, config),
        "interrupt" => cmd_interrupt(flags, config).await,
        "resume" => cmd_resume(flags, config).await,
        "list" | "list_active" => cmd_list(config),
        other => {
            print_error(&format!("unknown subcommand '{other}'"));
            println!("{}", usage());
            std::process::exit(1);
        }
    }
}
