//! Run command - execute a plan.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use trellis::engine::{ExecutionResult, ProgressEvent, RunSummary};
use trellis::{DEFAULT_SESSION, Orchestrator, RunReport, RunRequest};

use super::{Context, load_plan, print_json};

/// Arguments for the run command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Plan file (.toml or .json)
    pub plan: PathBuf,

    /// Run input as key=value (value parsed as JSON, else taken as a string)
    #[arg(short, long = "input", value_parser = parse_input)]
    pub inputs: Vec<(String, Value)>,

    /// Request payload as JSON, reachable through `@key`
    #[arg(long)]
    pub request: Option<String>,

    /// Session the run belongs to
    #[arg(long, default_value = DEFAULT_SESSION)]
    pub session: String,

    /// Explicit run id (default: random)
    #[arg(long)]
    pub run_id: Option<String>,

    /// Print progress events as they happen
    #[arg(long)]
    pub stream: bool,
}

/// Parse `key=value`, reading the value as JSON when possible.
fn parse_input(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

/// Run the run command.
pub async fn run(args: RunArgs, ctx: &Context) -> Result<()> {
    let plan = load_plan(&args.plan)?;
    let orchestrator = Orchestrator::from_config(&ctx.config, ctx.registry()?)?;

    let mut request = RunRequest::new(&args.session);
    if let Some(run_id) = args.run_id {
        request = request.with_run_id(run_id);
    }
    if let Some(raw) = args.request.as_deref() {
        request = request.with_request(serde_json::from_str(raw)?);
    }
    for (key, value) in args.inputs {
        request = request.with_input(key, value);
    }

    if args.stream {
        return run_streaming(&orchestrator, plan, request, ctx).await;
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let report = orchestrator.execute_with_cancel(&plan, request, cancel).await?;
    if ctx.json_output {
        print_json(&report)?;
    } else {
        print_report(&report, ctx.verbose);
    }
    check_report(&report)
}

async fn run_streaming(
    orchestrator: &Orchestrator,
    plan: trellis::plan::Plan,
    request: RunRequest,
    ctx: &Context,
) -> Result<()> {
    let mut stream = orchestrator.execute_streaming(plan, request);
    let mut stuck = None;
    let mut failed = Vec::new();
    let mut error = None;

    while let Some(event) = stream.next().await {
        if ctx.json_output {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }
        match event {
            ProgressEvent::StepFinished { result, .. } if result.is_unrecovered_failure() => {
                failed.push(result.step_id)
            }
            ProgressEvent::Final { stuck: s, .. } => stuck = Some(s),
            ProgressEvent::Error { message, .. } if stuck.is_none() => error = Some(message),
            _ => {}
        }
    }

    let Some(stuck) = stuck else {
        bail!(error.unwrap_or_else(|| "run ended without a summary".to_string()));
    };
    check_outcome(&stuck, &failed)
}

fn print_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::Status { message, .. } => println!("• {message}"),
        ProgressEvent::StepStarted {
            step_id,
            capability,
            attempt,
            ..
        } => println!("→ {step_id} ({capability}, {})", attempt.as_str()),
        ProgressEvent::StepFinished { result, .. } => println!("{}", result_line(result)),
        ProgressEvent::Final { summary, .. } => println!("{}", summary_line(summary)),
        ProgressEvent::Error { message, .. } => eprintln!("! {message}"),
    }
}

fn print_report(report: &RunReport, verbose: bool) {
    println!("Run {} (session {})", report.run_id, report.session_id);
    for result in &report.results {
        println!("{}", result_line(result));
        if verbose && let Some(output) = &result.output {
            println!("    output: {output}");
        }
    }
    if !report.stuck.is_empty() {
        println!("stuck: {}", report.stuck.join(", "));
    }
    if report.cancelled {
        println!("cancelled");
    }
    println!("{}", summary_line(&report.summary));
}

fn result_line(result: &ExecutionResult) -> String {
    let mut line = format!(
        "  {:<10} {:<16} {:>7.3}s",
        result.status.as_str(),
        result.step_id,
        result.duration_secs
    );
    if let Some(error) = &result.error {
        line.push_str(&format!("  {error}"));
    }
    if let Some(by) = result.recovered_by() {
        line.push_str(&format!("  (recovered by {by})"));
    }
    line
}

fn summary_line(summary: &RunSummary) -> String {
    format!(
        "{} steps: {} completed, {} failed, {} skipped, {} cancelled, {} recovered; success {:.0}%, confidence {:.2}, {:.3}s",
        summary.total,
        summary.completed,
        summary.failed,
        summary.skipped,
        summary.cancelled,
        summary.recovered,
        summary.success_rate * 100.0,
        summary.average_confidence,
        summary.total_time
    )
}

fn check_report(report: &RunReport) -> Result<()> {
    if report.cancelled {
        bail!("run cancelled");
    }
    check_outcome(&report.stuck, &report.unrecovered_failures())
}

fn check_outcome(stuck: &[String], failed: &[impl AsRef<str>]) -> Result<()> {
    if !stuck.is_empty() {
        bail!(
            "run stuck with {} step(s) unresolved: {}",
            stuck.len(),
            stuck.join(", ")
        );
    }
    if !failed.is_empty() {
        let names: Vec<&str> = failed.iter().map(AsRef::as_ref).collect();
        bail!("{} step(s) failed: {}", names.len(), names.join(", "));
    }
    Ok(())
}
